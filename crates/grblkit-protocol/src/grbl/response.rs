//! Grbl response line classification
//!
//! Classifies one inbound line from the device into a tagged response
//! record. The parser is stateless; every record carries the original
//! raw line alongside its parsed fields.

use super::report::{parse_status_report, StatusReport};
use serde::{Deserialize, Serialize};

/// A classified response from the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GrblResponse {
    /// Realtime status report (`<...>`)
    Status(StatusReport),
    /// OK acknowledgment
    Ok,
    /// Error response (`error:<n>` or `error: <message>`)
    Error {
        /// Numeric error code, when present.
        code: Option<u8>,
        /// The text after `error:`.
        message: String,
    },
    /// Alarm response (`ALARM:<n>` or `ALARM:<message>`)
    Alarm {
        /// Numeric alarm code, when present.
        code: Option<u8>,
        /// The text after `ALARM:`.
        message: String,
    },
    /// G-code parser modal state (`[GC:...]`)
    ParserState {
        /// The modal word list.
        modals: String,
    },
    /// Coordinate system / probe parameters (`[G54:...]`, `[TLO:...]`, ...)
    Parameters {
        /// Parameter group name.
        name: String,
        /// Raw parameter value text.
        value: String,
    },
    /// Feedback message (`[MSG:...]` or other bracketed text)
    Feedback {
        /// The feedback text.
        message: String,
    },
    /// Setting response (`$N=value`)
    Setting {
        /// Setting key, including the `$` prefix.
        name: String,
        /// Setting value text.
        value: String,
    },
    /// Startup banner (`Grbl 1.1f ['$' for help]`)
    Startup {
        /// Firmware version token (e.g. "1.1f").
        version: String,
    },
    /// Anything else
    Other,
}

/// Parameter groups recognized inside `[...]` reports
const PARAMETER_GROUPS: &[&str] = &[
    "G54", "G55", "G56", "G57", "G58", "G59", "G28", "G30", "G92", "TLO", "PRB",
];

/// Classify one line of device output (newline already stripped).
pub fn parse(line: &str) -> GrblResponse {
    let line = line.trim();

    if line == "ok" {
        return GrblResponse::Ok;
    }

    // Status report wrapper
    if line.starts_with('<') && line.ends_with('>') {
        if let Some(report) = parse_status_report(&line[1..line.len() - 1]) {
            return GrblResponse::Status(report);
        }
        return GrblResponse::Other;
    }

    if let Some(rest) = line.strip_prefix("error:") {
        let rest = rest.trim();
        return GrblResponse::Error {
            code: rest.parse::<u8>().ok(),
            message: rest.to_string(),
        };
    }

    if let Some(rest) = line.strip_prefix("ALARM:") {
        let rest = rest.trim();
        return GrblResponse::Alarm {
            code: rest.parse::<u8>().ok(),
            message: rest.to_string(),
        };
    }

    // Bracketed reports: parser state, parameters, feedback
    if line.starts_with('[') && line.ends_with(']') {
        let inner = &line[1..line.len() - 1];

        if let Some(modals) = inner.strip_prefix("GC:") {
            return GrblResponse::ParserState {
                modals: modals.trim().to_string(),
            };
        }

        if let Some((name, value)) = inner.split_once(':') {
            if PARAMETER_GROUPS.contains(&name) {
                return GrblResponse::Parameters {
                    name: name.to_string(),
                    value: value.to_string(),
                };
            }

            if name == "MSG" {
                return GrblResponse::Feedback {
                    message: value.trim().to_string(),
                };
            }
        }

        // v0.9 feedback has no MSG: prefix
        return GrblResponse::Feedback {
            message: inner.trim().to_string(),
        };
    }

    // Setting response ($N=value)
    if line.starts_with('$') {
        if let Some((name, value)) = line.split_once('=') {
            return GrblResponse::Setting {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            };
        }
    }

    // Startup banner
    if let Some(rest) = line.strip_prefix("Grbl ") {
        let version = rest.split_whitespace().next().unwrap_or("").to_string();
        if !version.is_empty() {
            return GrblResponse::Startup { version };
        }
    }

    GrblResponse::Other
}
