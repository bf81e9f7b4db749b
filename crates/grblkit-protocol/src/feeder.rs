//! Feeder queue for ad-hoc command lines
//!
//! An ordered queue of one-off command lines with hold/unhold. One line
//! leaves per advancement; the engine paces advancement on device
//! acknowledgments. Items are never dropped silently; only `clear()`
//! empties the queue.

use crate::preprocessor::{FilterAction, FilterOutcome, HoldReason};
use serde::Serialize;
use std::collections::VecDeque;

/// One queued line with its evaluation context
#[derive(Debug, Clone)]
pub struct FeederItem {
    /// The raw line
    pub line: String,
    /// Caller-supplied context for expression evaluation
    pub context: serde_json::Value,
}

/// Snapshot of the feeder for the `feeder:status` event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeederStatus {
    /// Whether the feeder is held
    pub hold: bool,
    /// Why it is held
    #[serde(rename = "holdReason")]
    pub hold_reason: Option<HoldReason>,
    /// Queued line count
    pub queue: usize,
    /// Whether a line is awaiting acknowledgment
    pub pending: bool,
}

/// Ordered queue of ad-hoc command lines
#[derive(Debug, Default)]
pub struct Feeder {
    queue: VecDeque<FeederItem>,
    hold: bool,
    hold_reason: Option<HoldReason>,
    // One line at a time: set when a line leaves, cleared by the engine
    // when its acknowledgment arrives or the queue is reset.
    in_flight: bool,
}

impl Feeder {
    /// Create an empty feeder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append lines to the queue
    pub fn feed<I, S>(&mut self, lines: I, context: serde_json::Value)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for line in lines {
            self.queue.push_back(FeederItem {
                line: line.into(),
                context: context.clone(),
            });
        }
    }

    /// Advance the queue by one emitted line.
    ///
    /// Pops items, applies the filter, and returns the first non-empty
    /// transformed line. Suppressed lines are consumed without emission.
    /// A filter hold request takes effect before the line is returned,
    /// so the held state is observable before the line hits the wire;
    /// the requesting line itself is still emitted.
    pub fn next_with<F>(&mut self, mut filter: F) -> Option<String>
    where
        F: FnMut(&str, &serde_json::Value) -> FilterOutcome,
    {
        while !self.hold {
            let item = match self.queue.pop_front() {
                Some(item) => item,
                None => {
                    self.in_flight = false;
                    return None;
                }
            };

            let outcome = filter(&item.line, &item.context);
            if let Some(action) = outcome.action {
                // Both filter actions hold the feeder itself
                let reason = match action {
                    FilterAction::Hold(reason) | FilterAction::Pause(reason) => reason,
                };
                self.hold(reason);
            }

            let line = outcome.line.trim();
            if line.is_empty() {
                continue;
            }

            self.in_flight = true;
            return Some(line.to_string());
        }

        None
    }

    /// Next queued item without removal
    pub fn peek(&self) -> Option<&FeederItem> {
        self.queue.front()
    }

    /// Place the queue on hold
    pub fn hold(&mut self, reason: HoldReason) {
        tracing::debug!("Feeder hold: {:?}", reason);
        self.hold = true;
        self.hold_reason = Some(reason);
    }

    /// Release a hold. The engine advances the queue afterwards.
    pub fn unhold(&mut self) {
        if self.hold {
            tracing::debug!("Feeder unhold");
        }
        self.hold = false;
        self.hold_reason = None;
    }

    /// Drop everything and release any hold
    pub fn clear(&mut self) {
        self.queue.clear();
        self.hold = false;
        self.hold_reason = None;
        self.in_flight = false;
    }

    /// Queue length
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Non-empty and not held
    pub fn is_pending(&self) -> bool {
        !self.queue.is_empty() && !self.hold
    }

    /// Whether the feeder is held
    pub fn is_held(&self) -> bool {
        self.hold
    }

    /// Why the feeder is held
    pub fn hold_reason(&self) -> Option<&HoldReason> {
        self.hold_reason.as_ref()
    }

    /// Whether an emitted line is awaiting acknowledgment
    pub fn has_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Mark the in-flight line as acknowledged
    pub fn ack(&mut self) {
        self.in_flight = false;
    }

    /// Snapshot for the `feeder:status` event
    pub fn status(&self) -> FeederStatus {
        FeederStatus {
            hold: self.hold,
            hold_reason: self.hold_reason.clone(),
            queue: self.queue.len(),
            pending: self.in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessor::FilterOutcome;

    fn passthrough(line: &str, _ctx: &serde_json::Value) -> FilterOutcome {
        FilterOutcome {
            line: line.to_string(),
            action: None,
        }
    }

    #[test]
    fn test_feed_and_next() {
        let mut feeder = Feeder::new();
        feeder.feed(vec!["G0 X0", "G0 X1"], serde_json::Value::Null);
        assert_eq!(feeder.len(), 2);

        assert_eq!(feeder.next_with(passthrough).as_deref(), Some("G0 X0"));
        assert_eq!(feeder.len(), 1);
        assert!(feeder.has_in_flight());
    }

    #[test]
    fn test_next_is_noop_while_held() {
        let mut feeder = Feeder::new();
        feeder.feed(vec!["G0 X0"], serde_json::Value::Null);
        feeder.hold(HoldReason::new("M6"));

        assert!(feeder.next_with(passthrough).is_none());
        assert_eq!(feeder.len(), 1);

        feeder.unhold();
        assert_eq!(feeder.next_with(passthrough).as_deref(), Some("G0 X0"));
    }

    #[test]
    fn test_suppressed_lines_skipped() {
        let mut feeder = Feeder::new();
        feeder.feed(vec!["skip me", "keep me"], serde_json::Value::Null);

        let emitted = feeder.next_with(|line, _| FilterOutcome {
            line: if line == "skip me" {
                String::new()
            } else {
                line.to_string()
            },
            action: None,
        });
        assert_eq!(emitted.as_deref(), Some("keep me"));
        assert!(feeder.is_empty());
    }

    #[test]
    fn test_filter_hold_applies_before_emission() {
        let mut feeder = Feeder::new();
        feeder.feed(vec!["M6 T1", "G0 X0"], serde_json::Value::Null);

        let emitted = feeder.next_with(|line, _| FilterOutcome {
            line: line.to_string(),
            action: Some(FilterAction::Pause(HoldReason::new("M6"))),
        });
        // The line is emitted, but the feeder is already held
        assert_eq!(emitted.as_deref(), Some("M6 T1"));
        assert!(feeder.is_held());
        assert_eq!(feeder.hold_reason().unwrap().data, "M6");

        // No further emission until unhold
        assert!(feeder.next_with(passthrough).is_none());
    }

    #[test]
    fn test_is_pending() {
        let mut feeder = Feeder::new();
        assert!(!feeder.is_pending());

        feeder.feed(vec!["G0 X0"], serde_json::Value::Null);
        assert!(feeder.is_pending());

        feeder.hold(HoldReason::new("test"));
        assert!(!feeder.is_pending());
    }

    #[test]
    fn test_clear() {
        let mut feeder = Feeder::new();
        feeder.feed(vec!["G0 X0", "G0 X1"], serde_json::Value::Null);
        feeder.hold(HoldReason::new("test"));
        feeder.clear();

        assert!(feeder.is_empty());
        assert!(!feeder.is_held());
        assert!(!feeder.has_in_flight());
    }

    #[test]
    fn test_status_snapshot() {
        let mut feeder = Feeder::new();
        feeder.feed(vec!["G0 X0"], serde_json::Value::Null);
        let status = feeder.status();
        assert_eq!(status.queue, 1);
        assert!(!status.hold);
        assert!(!status.pending);
    }
}
