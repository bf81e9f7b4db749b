//! Character-counting program sender
//!
//! Streams a loaded program under the Grbl character-counting protocol:
//! a line of byte length L (including its newline) is transmitted only
//! while `data_length + L <= buffer_size`. Each `ok`/`error` from the
//! device acknowledges the oldest in-flight line and credits its length
//! back.
//!
//! The filter runs exactly once per source line; a transformed line that
//! does not fit the remaining credit is cached until an acknowledgment
//! frees room.

use crate::preprocessor::{FilterAction, FilterOutcome, HoldReason};
use serde::Serialize;
use std::collections::VecDeque;

/// Grbl's receive buffer is 128 bytes; 8 bytes are kept as a safety
/// margin for realtime characters.
pub const DEFAULT_BUFFER_SIZE: usize = 128 - 8;

/// Snapshot of the sender for the `sender:status` event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SenderStatus {
    /// Loaded program name
    pub name: String,
    /// Program size in bytes
    pub size: usize,
    /// Total line count
    pub total: usize,
    /// Lines consumed (transmitted or suppressed)
    pub sent: usize,
    /// Lines acknowledged
    pub received: usize,
    /// Whether the sender is held
    pub hold: bool,
    /// Why it is held
    #[serde(rename = "holdReason")]
    pub hold_reason: Option<HoldReason>,
    /// Device receive buffer budget
    #[serde(rename = "bufferSize")]
    pub buffer_size: usize,
    /// Bytes currently in flight
    #[serde(rename = "dataLength")]
    pub data_length: usize,
}

/// The result of one advancement pass
#[derive(Debug, Default)]
pub struct SenderStep {
    /// Lines to transmit, in order
    pub lines: Vec<String>,
    /// Pause requested by a pause word on the last emitted line
    pub pause: Option<HoldReason>,
    /// True when this pass emitted the first line of the run
    pub started: bool,
}

/// A transformed line waiting for buffer credit
#[derive(Debug)]
struct PendingLine {
    line: String,
    action: Option<FilterAction>,
}

/// Streams a loaded program with credit accounting
#[derive(Debug, Default)]
pub struct Sender {
    name: String,
    gcode: String,
    context: serde_json::Value,
    lines: Vec<String>,
    sent: usize,
    received: usize,
    hold: bool,
    hold_reason: Option<HoldReason>,
    buffer_size: usize,
    // Transmitted, unacknowledged lines as (source line index, byte
    // length including newline). Suppressed lines never enter here, so
    // the front is always the line the next acknowledgment refers to.
    in_flight: VecDeque<(usize, usize)>,
    pending: Option<PendingLine>,
    started: bool,
}

impl Sender {
    /// Create a sender with the default buffer budget
    pub fn new() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            ..Default::default()
        }
    }

    /// Load a program. Returns false when the text is empty.
    pub fn load(&mut self, name: &str, gcode: &str, context: serde_json::Value) -> bool {
        if gcode.trim().is_empty() {
            return false;
        }

        self.name = name.to_string();
        self.gcode = gcode.to_string();
        self.context = context;
        self.lines = gcode.lines().map(|s| s.to_string()).collect();
        self.reset_run();
        true
    }

    /// Discard the loaded program
    pub fn unload(&mut self) {
        self.name.clear();
        self.gcode.clear();
        self.context = serde_json::Value::Null;
        self.lines.clear();
        self.reset_run();
    }

    /// Reset streaming progress to the top of the program
    pub fn rewind(&mut self) {
        self.reset_run();
    }

    fn reset_run(&mut self) {
        self.sent = 0;
        self.received = 0;
        self.hold = false;
        self.hold_reason = None;
        self.in_flight.clear();
        self.pending = None;
        self.started = false;
    }

    /// Whether a program is loaded
    pub fn is_loaded(&self) -> bool {
        !self.lines.is_empty()
    }

    /// Total line count
    pub fn total(&self) -> usize {
        self.lines.len()
    }

    /// Lines consumed so far
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Lines acknowledged so far
    pub fn received(&self) -> usize {
        self.received
    }

    /// Program context supplied at load time
    pub fn context(&self) -> &serde_json::Value {
        &self.context
    }

    /// The oldest in-flight line with its 1-based line number, for
    /// error reporting.
    ///
    /// With FIFO acknowledgments this is the line the current response
    /// refers to. `received` cannot stand in for it: suppressed
    /// directive lines advance `received` without ever being in flight.
    pub fn oldest_in_flight(&self) -> Option<(usize, &str)> {
        let (index, _) = self.in_flight.front()?;
        self.lines.get(*index).map(|line| (index + 1, line.as_str()))
    }

    /// Bytes currently in flight
    pub fn data_length(&self) -> usize {
        self.in_flight.iter().map(|(_, n)| n).sum()
    }

    /// Device receive buffer budget
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Grow the buffer budget; the budget never shrinks mid-program.
    pub fn set_buffer_size_at_least(&mut self, size: usize) {
        if size > self.buffer_size {
            tracing::debug!("Sender buffer size {} -> {}", self.buffer_size, size);
            self.buffer_size = size;
        }
    }

    /// Whether the sender is held
    pub fn is_held(&self) -> bool {
        self.hold
    }

    /// Why the sender is held
    pub fn hold_reason(&self) -> Option<&HoldReason> {
        self.hold_reason.as_ref()
    }

    /// All lines consumed and acknowledged
    pub fn is_finished(&self) -> bool {
        !self.lines.is_empty() && self.received >= self.lines.len()
    }

    /// Next line awaiting transmission, without advancing
    pub fn peek(&self) -> Option<&str> {
        if let Some(pending) = &self.pending {
            return Some(&pending.line);
        }
        self.lines.get(self.sent).map(|s| s.as_str())
    }

    /// Place the sender on hold
    pub fn hold(&mut self, reason: HoldReason) {
        tracing::debug!("Sender hold: {:?}", reason);
        self.hold = true;
        self.hold_reason = Some(reason);
    }

    /// Release a hold. The engine advances the stream afterwards.
    pub fn unhold(&mut self) {
        if self.hold {
            tracing::debug!("Sender unhold");
        }
        self.hold = false;
        self.hold_reason = None;
    }

    /// Acknowledge the oldest in-flight line, crediting its length back.
    ///
    /// Fails when nothing is in flight.
    pub fn ack(&mut self) -> bool {
        if self.received >= self.sent {
            return false;
        }
        self.received += 1;
        self.in_flight.pop_front();
        true
    }

    /// Advance the stream: transmit as many lines as buffer credit
    /// allows while not held.
    ///
    /// The filter may transform a line, suppress it (empty result), or
    /// request a hold/pause. Suppressed lines are consumed as both sent
    /// and received since they never reach the wire. A pause request
    /// stops the pass after its line is emitted; the engine applies the
    /// workflow pause.
    pub fn next_with<F>(&mut self, mut filter: F) -> SenderStep
    where
        F: FnMut(&str, &serde_json::Value) -> FilterOutcome,
    {
        let mut step = SenderStep::default();

        loop {
            if self.hold {
                break;
            }

            let pending = match self.pending.take() {
                Some(pending) => pending,
                None => {
                    if self.sent >= self.lines.len() {
                        break;
                    }
                    let raw = self.lines[self.sent].clone();
                    let outcome = filter(&raw, &self.context);
                    let line = outcome.line.trim().to_string();

                    if line.is_empty() {
                        // Never reaches the wire; counts as sent and received
                        self.sent += 1;
                        self.received += 1;
                        if let Some(action) = outcome.action {
                            match action {
                                FilterAction::Hold(reason) => self.hold(reason),
                                FilterAction::Pause(reason) => {
                                    step.pause = Some(reason);
                                    break;
                                }
                            }
                        }
                        continue;
                    }

                    PendingLine {
                        line,
                        action: outcome.action,
                    }
                }
            };

            let n = pending.line.len() + 1;
            if self.data_length() + n > self.buffer_size {
                self.pending = Some(pending);
                break;
            }

            let index = self.sent;
            self.sent += 1;
            self.in_flight.push_back((index, n));
            if !self.started {
                self.started = true;
                step.started = true;
            }

            let action = pending.action;
            step.lines.push(pending.line);

            match action {
                Some(FilterAction::Hold(reason)) => self.hold(reason),
                Some(FilterAction::Pause(reason)) => {
                    step.pause = Some(reason);
                    break;
                }
                None => {}
            }
        }

        step
    }

    /// Snapshot for the `sender:status` event
    pub fn status(&self) -> SenderStatus {
        SenderStatus {
            name: self.name.clone(),
            size: self.gcode.len(),
            total: self.lines.len(),
            sent: self.sent,
            received: self.received,
            hold: self.hold,
            hold_reason: self.hold_reason.clone(),
            buffer_size: self.buffer_size,
            data_length: self.data_length(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn passthrough(line: &str, _ctx: &serde_json::Value) -> FilterOutcome {
        FilterOutcome {
            line: line.to_string(),
            action: None,
        }
    }

    #[test]
    fn test_load_rejects_empty() {
        let mut sender = Sender::new();
        assert!(!sender.load("empty", "  \n  ", serde_json::Value::Null));
        assert!(sender.load("ok", "G0 X0\n", serde_json::Value::Null));
        assert_eq!(sender.total(), 1);
    }

    #[test]
    fn test_streams_within_credit() {
        let mut sender = Sender::new();
        sender.load("t", "G0 X0\nG0 X1\nG0 X2\n", serde_json::Value::Null);

        let step = sender.next_with(passthrough);
        assert_eq!(step.lines.len(), 3);
        assert!(step.started);
        assert_eq!(sender.sent(), 3);
        assert_eq!(sender.data_length(), 3 * 6);
    }

    #[test]
    fn test_backpressure_one_line_in_flight() {
        let mut sender = Sender::new();
        sender.load(
            "t",
            "G0 X00000\nG0 X00001\nG0 X00002\nG0 X00003\nG0 X00004\n",
            serde_json::Value::Null,
        );
        // Each line is 9 + 1 = 10 bytes; two never fit in 16
        sender.buffer_size = 16;

        let step = sender.next_with(passthrough);
        assert_eq!(step.lines.len(), 1);
        assert!(sender.sent() - sender.received() <= 1);

        // Each ack admits exactly one more line
        for i in 1..5 {
            assert!(sender.ack());
            let step = sender.next_with(passthrough);
            assert_eq!(step.lines.len(), 1, "line {}", i);
            assert!(sender.sent() - sender.received() <= 1);
        }

        assert!(sender.ack());
        assert!(sender.is_finished());
    }

    #[test]
    fn test_ack_fails_with_nothing_in_flight() {
        let mut sender = Sender::new();
        sender.load("t", "G0 X0\n", serde_json::Value::Null);
        assert!(!sender.ack());

        sender.next_with(passthrough);
        assert!(sender.ack());
        assert!(!sender.ack());
    }

    #[test]
    fn test_hold_blocks_advancement() {
        let mut sender = Sender::new();
        sender.load("t", "G0 X0\nG0 X1\n", serde_json::Value::Null);
        sender.hold(HoldReason::new("test"));

        let step = sender.next_with(passthrough);
        assert!(step.lines.is_empty());
        assert_eq!(sender.sent(), 0);

        sender.unhold();
        let step = sender.next_with(passthrough);
        assert_eq!(step.lines.len(), 2);
    }

    #[test]
    fn test_rewind() {
        let mut sender = Sender::new();
        sender.load("t", "G0 X0\nG0 X1\n", serde_json::Value::Null);
        sender.next_with(passthrough);
        sender.ack();
        sender.hold(HoldReason::new("test"));

        sender.rewind();
        assert_eq!(sender.sent(), 0);
        assert_eq!(sender.received(), 0);
        assert!(!sender.is_held());
        assert_eq!(sender.data_length(), 0);
    }

    #[test]
    fn test_suppressed_lines_consume_without_credit() {
        let mut sender = Sender::new();
        sender.load("t", "%x=1\nG0 X[x]\n", serde_json::Value::Null);

        let step = sender.next_with(|line, _| FilterOutcome {
            line: if line.starts_with('%') {
                String::new()
            } else {
                "G0 X1".to_string()
            },
            action: None,
        });
        assert_eq!(step.lines, vec!["G0 X1".to_string()]);
        assert_eq!(sender.sent(), 2);
        assert_eq!(sender.received(), 1);
        assert_eq!(sender.data_length(), 6);
    }

    #[test]
    fn test_oldest_in_flight_skips_suppressed_lines() {
        let mut sender = Sender::new();
        sender.load("t", "G4 P1\n%feed=1\nG1 X5\n", serde_json::Value::Null);

        let step = sender.next_with(|line, _| FilterOutcome {
            line: if line.starts_with('%') {
                String::new()
            } else {
                line.to_string()
            },
            action: None,
        });
        assert_eq!(step.lines, vec!["G4 P1".to_string(), "G1 X5".to_string()]);

        // The suppressed directive advanced `received` past the oldest
        // unacknowledged line; attribution must not follow it
        assert_eq!(sender.received(), 1);
        assert_eq!(sender.oldest_in_flight(), Some((1, "G4 P1")));

        assert!(sender.ack());
        assert_eq!(sender.oldest_in_flight(), Some((3, "G1 X5")));
        assert!(sender.ack());
        assert_eq!(sender.oldest_in_flight(), None);
    }

    #[test]
    fn test_wait_hold_applies_after_dwell_leaves() {
        let mut sender = Sender::new();
        sender.load("t", "%wait\nG0 X1\n", serde_json::Value::Null);

        let step = sender.next_with(|line, _| {
            if line == "%wait" {
                FilterOutcome {
                    line: "G4 P0.5 (%wait)".to_string(),
                    action: Some(FilterAction::Hold(HoldReason::new("%wait"))),
                }
            } else {
                FilterOutcome {
                    line: line.to_string(),
                    action: None,
                }
            }
        });

        // The dwell leaves, then the hold stops the stream
        assert_eq!(step.lines, vec!["G4 P0.5 (%wait)".to_string()]);
        assert!(sender.is_held());
        assert_eq!(sender.sent(), 1);
    }

    #[test]
    fn test_pause_word_stops_pass_after_line() {
        let mut sender = Sender::new();
        sender.load("t", "G0 X0\nM0\nG0 X1\n", serde_json::Value::Null);

        let step = sender.next_with(|line, _| FilterOutcome {
            line: line.to_string(),
            action: if line == "M0" {
                Some(FilterAction::Pause(HoldReason::new("M0")))
            } else {
                None
            },
        });

        assert_eq!(step.lines, vec!["G0 X0".to_string(), "M0".to_string()]);
        assert_eq!(step.pause, Some(HoldReason::new("M0")));
        assert_eq!(sender.sent(), 2);
    }

    #[test]
    fn test_pending_line_filtered_once() {
        let mut sender = Sender::new();
        sender.load("t", "G0 X00000\nG0 X00001\n", serde_json::Value::Null);
        sender.buffer_size = 12;

        let filter_calls = std::rc::Rc::new(std::cell::RefCell::new(0));
        let filter_calls_handle = filter_calls.clone();
        let mut counting = move |line: &str, _: &serde_json::Value| {
            *filter_calls_handle.borrow_mut() += 1;
            FilterOutcome {
                line: line.to_string(),
                action: None,
            }
        };

        // First pass sends one line and caches the second
        let step = sender.next_with(&mut counting);
        assert_eq!(step.lines.len(), 1);
        assert_eq!(*filter_calls.borrow(), 2);

        // Retrying without credit must not re-run the filter
        let step = sender.next_with(&mut counting);
        assert!(step.lines.is_empty());
        assert_eq!(*filter_calls.borrow(), 2);

        sender.ack();
        let step = sender.next_with(&mut counting);
        assert_eq!(step.lines.len(), 1);
        assert_eq!(*filter_calls.borrow(), 2);
    }

    #[test]
    fn test_buffer_size_never_shrinks() {
        let mut sender = Sender::new();
        assert_eq!(sender.buffer_size(), DEFAULT_BUFFER_SIZE);
        sender.set_buffer_size_at_least(128 - 8);
        assert_eq!(sender.buffer_size(), DEFAULT_BUFFER_SIZE);
        sender.set_buffer_size_at_least(255 - 8);
        assert_eq!(sender.buffer_size(), 247);
        sender.set_buffer_size_at_least(100);
        assert_eq!(sender.buffer_size(), 247);
    }

    proptest! {
        /// Credit accounting holds under arbitrary interleavings of
        /// advancement, acknowledgment, hold/unhold, and rewind.
        #[test]
        fn prop_credit_accounting(ops in proptest::collection::vec(0u8..5, 1..64)) {
            let mut sender = Sender::new();
            let program: String = (0..20).map(|i| format!("G1 X{} Y{}\n", i, i * 2)).collect();
            sender.load("prop", &program, serde_json::Value::Null);
            sender.buffer_size = 24;

            for op in ops {
                match op {
                    0 => {
                        let step = sender.next_with(passthrough);
                        // Every emitted line fit the budget when it left
                        for line in &step.lines {
                            prop_assert!(line.len() + 1 <= sender.buffer_size());
                        }
                    }
                    1 => { sender.ack(); }
                    2 => sender.hold(HoldReason::new("prop")),
                    3 => sender.unhold(),
                    _ => sender.rewind(),
                }

                prop_assert!(sender.data_length() <= sender.buffer_size());
                prop_assert!(sender.received() <= sender.sent());
                prop_assert!(sender.sent() <= sender.total());
                prop_assert_eq!(
                    sender.sent() - sender.received(),
                    sender.in_flight.len()
                );
            }
        }
    }
}
