//! Expression evaluation against a runtime context
//!
//! Evaluates the arithmetic expressions found in `[...]` substitutions
//! and `%`-assignments. The context maps variable names to numbers;
//! unknown identifiers resolve to 0, and malformed expressions degrade
//! to 0 rather than failing. Streaming must never stop because of a bad
//! expression.

use std::collections::HashMap;

/// Named variables consumed by the preprocessor
///
/// Standard keys are the caller-supplied bounding box
/// (`xmin..zmax`) and the engine-injected machine/work positions
/// (`mposx..mposc`, `posx..posc`).
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    vars: HashMap<String, f64>,
}

impl ExecutionContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable
    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.vars.insert(name.into(), value);
    }

    /// Look up a variable; missing values coerce to 0
    pub fn get(&self, name: &str) -> f64 {
        self.vars.get(name).copied().unwrap_or(0.0)
    }

    /// Whether a variable has been set
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Merge the numeric fields of a JSON object into the context.
    ///
    /// Non-numeric fields are ignored; numeric strings are accepted the
    /// way loosely typed callers tend to supply them.
    pub fn merge_json(&mut self, value: &serde_json::Value) {
        let Some(map) = value.as_object() else {
            return;
        };

        for (key, val) in map {
            match val {
                serde_json::Value::Number(n) => {
                    if let Some(f) = n.as_f64() {
                        self.vars.insert(key.clone(), f);
                    }
                }
                serde_json::Value::String(s) => {
                    if let Ok(f) = s.trim().parse::<f64>() {
                        self.vars.insert(key.clone(), f);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Evaluate an expression in the given context.
///
/// Supports numbers, identifiers, `+ - * / %`, unary sign, and
/// parentheses. Anything unparseable yields 0.
pub fn evaluate(expr: &str, ctx: &ExecutionContext) -> f64 {
    let tokens = tokenize(expr);
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        ctx,
    };
    let value = parser.expression();
    if parser.pos < parser.tokens.len() {
        tracing::debug!("Trailing input in expression {:?}", expr);
    }
    value.unwrap_or(0.0)
}

/// Render an evaluated value the way it is substituted into G-code:
/// integral values print without a fractional part.
pub fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    format!("{}", value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                match text.parse::<f64>() {
                    Ok(n) => tokens.push(Token::Number(n)),
                    Err(_) => tokens.push(Token::Number(0.0)),
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                // Unknown character: skip it rather than abort
                i += 1;
            }
        }
    }

    tokens
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    ctx: &'a ExecutionContext,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expression(&mut self) -> Option<f64> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.advance();
                    value += self.term()?;
                }
                Token::Minus => {
                    self.advance();
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn term(&mut self) -> Option<f64> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.advance();
                    value *= self.factor()?;
                }
                Token::Slash => {
                    self.advance();
                    let rhs = self.factor()?;
                    value = if rhs == 0.0 { 0.0 } else { value / rhs };
                }
                Token::Percent => {
                    self.advance();
                    let rhs = self.factor()?;
                    value = if rhs == 0.0 { 0.0 } else { value % rhs };
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn factor(&mut self) -> Option<f64> {
        match self.advance()?.clone() {
            Token::Number(n) => Some(n),
            Token::Ident(name) => Some(self.ctx.get(&name)),
            Token::Minus => Some(-self.factor()?),
            Token::Plus => self.factor(),
            Token::LParen => {
                let value = self.expression()?;
                if self.peek() == Some(&Token::RParen) {
                    self.advance();
                }
                Some(value)
            }
            _ => None,
        }
    }
}
