//! Grbl status report parsing
//!
//! Parses the fields of a realtime status report into a structured
//! record: machine state, positions, coordinate offset, buffer counts,
//! feed/spindle values, and override percentages.
//!
//! Both report dialects are handled: the v1.1 pipe-separated form
//! (`<Idle|MPos:0.000,0.000,0.000|Bf:15,128>`) and the v0.9
//! comma-separated form (`<Idle,MPos:0.000,0.000,0.000,RX:0>`).

use grblkit_core::{MachineState, Position};
use serde::{Deserialize, Serialize};

/// Override percentages (Feed, Rapid, Spindle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideValues {
    /// Feed override percentage
    pub feed: u16,
    /// Rapid override percentage
    pub rapid: u16,
    /// Spindle override percentage
    pub spindle: u16,
}

impl OverrideValues {
    fn parse(ov_str: &str) -> Option<Self> {
        let parts: Vec<&str> = ov_str.split(',').collect();
        if parts.len() < 3 {
            return None;
        }

        Some(Self {
            feed: parts[0].trim().parse().ok()?,
            rapid: parts[1].trim().parse().ok()?,
            spindle: parts[2].trim().parse().ok()?,
        })
    }
}

/// Parsed status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Machine state
    pub state: MachineState,
    /// Raw state token, including any sub-state code (`Hold:0`)
    pub raw_state: String,
    /// Machine position
    pub mpos: Option<Position>,
    /// Work position
    pub wpos: Option<Position>,
    /// Work coordinate offset
    pub wco: Option<Position>,
    /// Planner buffer blocks available
    pub planner_blocks: Option<u32>,
    /// RX buffer bytes available (v1.1 `Bf:` second value, v0.9 `RX:`)
    pub rx_buffer_free: Option<u32>,
    /// Feed rate (units/min)
    pub feed_rate: Option<f64>,
    /// Spindle speed (RPM)
    pub spindle_speed: Option<f64>,
    /// Override percentages
    pub overrides: Option<OverrideValues>,
    /// Line number being executed
    pub line_number: Option<u32>,
    /// Active input pins
    pub pins: Option<String>,
}

/// Parse the inner text of a status report (angle brackets stripped).
///
/// Returns `None` when no state token can be found.
pub fn parse_status_report(inner: &str) -> Option<StatusReport> {
    let (state_token, fields) = split_fields(inner);
    let state = MachineState::parse(&state_token)?;

    let mut report = StatusReport {
        state,
        raw_state: state_token,
        mpos: None,
        wpos: None,
        wco: None,
        planner_blocks: None,
        rx_buffer_free: None,
        feed_rate: None,
        spindle_speed: None,
        overrides: None,
        line_number: None,
        pins: None,
    };

    for (key, value) in &fields {
        match key.as_str() {
            "MPos" => report.mpos = Position::parse(value),
            "WPos" => report.wpos = Position::parse(value),
            "WCO" => report.wco = Position::parse(value),
            "Bf" => {
                // v1.1: Bf:<planner blocks free>,<rx bytes free>
                let mut parts = value.split(',');
                report.planner_blocks = parts.next().and_then(|s| s.trim().parse().ok());
                report.rx_buffer_free = parts.next().and_then(|s| s.trim().parse().ok());
            }
            "Buf" => report.planner_blocks = value.trim().parse().ok(),
            "RX" => report.rx_buffer_free = value.trim().parse().ok(),
            "F" => report.feed_rate = value.trim().parse().ok(),
            "FS" => {
                let mut parts = value.split(',');
                report.feed_rate = parts.next().and_then(|s| s.trim().parse().ok());
                report.spindle_speed = parts.next().and_then(|s| s.trim().parse().ok());
            }
            "S" => report.spindle_speed = value.trim().parse().ok(),
            "Ov" => report.overrides = OverrideValues::parse(value),
            "Ln" => report.line_number = value.trim().parse().ok(),
            "Pn" => report.pins = Some(value.trim().to_string()),
            _ => {
                tracing::trace!("Unhandled status field {}:{}", key, value);
            }
        }
    }

    Some(report)
}

/// Split a report body into the state token and `key:value` fields.
///
/// The v1.1 dialect separates fields with `|`. The v0.9 dialect uses
/// `,` for both field and coordinate separators, so a token without a
/// `:` is folded into the value of the preceding field.
fn split_fields(inner: &str) -> (String, Vec<(String, String)>) {
    if inner.contains('|') {
        let mut parts = inner.split('|');
        let state = parts.next().unwrap_or("").trim().to_string();
        let fields = parts
            .filter_map(|part| {
                part.split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect();
        return (state, fields);
    }

    let mut tokens = inner.split(',');
    let state = tokens.next().unwrap_or("").trim().to_string();
    let mut fields: Vec<(String, String)> = Vec::new();

    for token in tokens {
        match token.split_once(':') {
            Some((k, v)) => fields.push((k.trim().to_string(), v.trim().to_string())),
            None => {
                if let Some(last) = fields.last_mut() {
                    last.1.push(',');
                    last.1.push_str(token.trim());
                }
            }
        }
    }

    (state, fields)
}
