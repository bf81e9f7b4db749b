//! G-code line preprocessing
//!
//! The filter both injection paths run every outgoing line through:
//!
//! 1. `%`-directive lines: `%wait` becomes a short dwell and requests a
//!    hold until the dwell's own acknowledgment; other directives are
//!    variable assignment lists that mutate the evaluation context and
//!    suppress the line.
//! 2. Bracketed `[expr]` substrings in normal lines are evaluated in the
//!    current context and replaced by their numeric form.
//! 3. Pause words (M0/M1/M2/M30/M6) request a pause; M6 is additionally
//!    rewritten to `(M6)` so the device does not reject the line.
//!
//! The filter itself is path-neutral: it reports what it wants as a
//! [`FilterAction`], and the caller applies its own hold policy (the
//! Feeder holds itself, the Sender path pauses the workflow).

use crate::evaluator::{evaluate, format_number, ExecutionContext};
use serde::{Deserialize, Serialize};

/// Why a queue was placed on hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldReason {
    /// The token that caused the hold (`M6`, `%wait`, ...)
    pub data: String,
    /// Error text, when the hold came from a device error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl HoldReason {
    /// A hold keyed by the token that requested it
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            err: None,
        }
    }

    /// A hold carrying a device error
    pub fn error(data: impl Into<String>, err: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            err: Some(err.into()),
        }
    }
}

/// What the filter wants the emitting queue to do
#[derive(Debug, Clone, PartialEq)]
pub enum FilterAction {
    /// Hold the emitting queue itself until the next acknowledgment
    /// (`%wait` semantics)
    Hold(HoldReason),
    /// Pause per the path's policy: the Feeder holds itself, the Sender
    /// path pauses the workflow (M0/M1/M2/M30/M6 semantics)
    Pause(HoldReason),
}

/// The result of filtering one line
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    /// The transformed line; empty means suppressed
    pub line: String,
    /// Hold/pause request, if any
    pub action: Option<FilterAction>,
}

impl FilterOutcome {
    fn passthrough(line: String) -> Self {
        Self { line, action: None }
    }
}

/// Words that pause the program when encountered
const PAUSE_WORDS: &[&str] = &["M0", "M1", "M2", "M30"];

/// Run one line through the filter, mutating the context as directives
/// require.
pub fn process_line(line: &str, ctx: &mut ExecutionContext) -> FilterOutcome {
    let line = line.trim();

    if let Some(directive) = line.strip_prefix('%') {
        return process_directive(directive, ctx);
    }

    let mut out = line.to_string();
    let mut action = None;

    // Pause words are detected on the untranslated line
    let words = extract_words(&out);
    if let Some(word) = words.iter().find(|w| PAUSE_WORDS.contains(&w.text.as_str())) {
        action = Some(FilterAction::Pause(HoldReason::new(word.text.clone())));
    }

    if let Some(m6) = words.iter().find(|w| w.text == "M6") {
        action = Some(FilterAction::Pause(HoldReason::new("M6")));
        out = format!("{}({}){}", &out[..m6.start], &out[m6.start..m6.end], &out[m6.end..]);
    }

    out = translate_expressions(&out, ctx);

    FilterOutcome { line: out, action }
}

/// Handle a `%`-directive (leading `%` already stripped)
fn process_directive(directive: &str, ctx: &mut ExecutionContext) -> FilterOutcome {
    // Strip a trailing `; ...` comment
    let directive = match directive.find(';') {
        Some(pos) => directive[..pos].trim(),
        None => directive.trim(),
    };

    if directive == "wait" {
        return FilterOutcome {
            line: "G4 P0.5 (%wait)".to_string(),
            action: Some(FilterAction::Hold(HoldReason::new("%wait"))),
        };
    }

    // Assignment list: name1=expr1,name2=expr2,...
    for assignment in directive.split(',') {
        let Some((name, expr)) = assignment.split_once('=') else {
            if !assignment.trim().is_empty() {
                tracing::debug!("Ignoring malformed directive part {:?}", assignment);
            }
            continue;
        };
        let value = evaluate(expr, ctx);
        ctx.set(name.trim(), value);
    }

    // Directives never reach the wire
    FilterOutcome::passthrough(String::new())
}

/// Replace every `[expr]` substring with its evaluated numeric form
fn translate_expressions(line: &str, ctx: &ExecutionContext) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(start) = rest.find('[') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find(']') {
            Some(end) => {
                out.push_str(&format_number(evaluate(&after[..end], ctx)));
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated bracket: keep the text as-is
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// A G-code word with its span in the source line
struct Word {
    text: String,
    start: usize,
    end: usize,
}

/// Extract letter+number words, skipping `(...)` comments and anything
/// after `;`. Numbers are normalized (`M06` -> `M6`).
fn extract_words(line: &str) -> Vec<Word> {
    let bytes = line.as_bytes();
    let mut words = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;

        if c == ';' {
            break;
        }

        if c == '(' {
            // Skip the comment span
            match line[i..].find(')') {
                Some(offset) => {
                    i += offset + 1;
                    continue;
                }
                None => break,
            }
        }

        if c.is_ascii_alphabetic() {
            let start = i;
            i += 1;
            let digits_start = i;
            while i < bytes.len() && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i > digits_start {
                let letter = c.to_ascii_uppercase();
                let number = &line[digits_start..i];
                let normalized = match number.parse::<f64>() {
                    Ok(n) => format!("{}{}", letter, format_number(n)),
                    Err(_) => format!("{}{}", letter, number),
                };
                words.push(Word {
                    text: normalized,
                    start,
                    end: i,
                });
            }
            continue;
        }

        i += 1;
    }

    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new()
    }

    #[test]
    fn test_plain_line_unchanged() {
        let mut c = ctx();
        let out = process_line("G0 X10 Y20", &mut c);
        assert_eq!(out.line, "G0 X10 Y20");
        assert!(out.action.is_none());
    }

    #[test]
    fn test_bracket_substitution() {
        let mut c = ctx();
        c.set("xmax", 10.0);
        c.set("ymax", 20.0);
        let out = process_line("G0 X[xmax] Y[ymax]", &mut c);
        assert_eq!(out.line, "G0 X10 Y20");
    }

    #[test]
    fn test_bracket_expression_arithmetic() {
        let mut c = ctx();
        c.set("xmax", 10.0);
        let out = process_line("G0 X[xmax / 2 + 1]", &mut c);
        assert_eq!(out.line, "G0 X6");
    }

    #[test]
    fn test_unknown_identifier_substitutes_zero() {
        let mut c = ctx();
        let out = process_line("G0 X[bogus]", &mut c);
        assert_eq!(out.line, "G0 X0");
    }

    #[test]
    fn test_wait_directive() {
        let mut c = ctx();
        let out = process_line("%wait", &mut c);
        assert_eq!(out.line, "G4 P0.5 (%wait)");
        assert_eq!(
            out.action,
            Some(FilterAction::Hold(HoldReason::new("%wait")))
        );
    }

    #[test]
    fn test_wait_directive_with_comment() {
        let mut c = ctx();
        let out = process_line("%wait ; let the planner drain", &mut c);
        assert_eq!(out.line, "G4 P0.5 (%wait)");
    }

    #[test]
    fn test_assignment_directive() {
        let mut c = ctx();
        let out = process_line("%x0=5, y0=x0*2", &mut c);
        assert_eq!(out.line, "");
        assert!(out.action.is_none());
        assert_eq!(c.get("x0"), 5.0);
        assert_eq!(c.get("y0"), 10.0);
    }

    #[test]
    fn test_malformed_directive_suppressed() {
        let mut c = ctx();
        let out = process_line("%this is not an assignment", &mut c);
        assert_eq!(out.line, "");
        assert!(out.action.is_none());
    }

    #[test]
    fn test_m6_rewrite() {
        let mut c = ctx();
        let out = process_line("M6 T1", &mut c);
        assert_eq!(out.line, "(M6) T1");
        assert_eq!(out.action, Some(FilterAction::Pause(HoldReason::new("M6"))));
    }

    #[test]
    fn test_m06_normalized() {
        let mut c = ctx();
        let out = process_line("M06 T2", &mut c);
        assert_eq!(out.line, "(M06) T2");
        assert_eq!(out.action, Some(FilterAction::Pause(HoldReason::new("M6"))));
    }

    #[test]
    fn test_m0_pause() {
        let mut c = ctx();
        let out = process_line("M0", &mut c);
        assert_eq!(out.line, "M0");
        assert_eq!(out.action, Some(FilterAction::Pause(HoldReason::new("M0"))));
    }

    #[test]
    fn test_m30_not_confused_with_m3() {
        let mut c = ctx();
        let out = process_line("M30", &mut c);
        assert_eq!(out.action, Some(FilterAction::Pause(HoldReason::new("M30"))));

        let out = process_line("M3 S1000", &mut c);
        assert!(out.action.is_none());
    }

    #[test]
    fn test_commented_m6_ignored() {
        let mut c = ctx();
        let out = process_line("(M6) T1", &mut c);
        assert!(out.action.is_none());
        assert_eq!(out.line, "(M6) T1");

        let out = process_line("G0 X0 ; M0 in a comment", &mut c);
        assert!(out.action.is_none());
    }
}
