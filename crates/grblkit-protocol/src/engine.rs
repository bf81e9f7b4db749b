//! Grbl protocol engine
//!
//! Owns the feeder, sender, workflow, device model, and serial handle,
//! and drives the whole protocol: routing acknowledgments to the right
//! queue, dispatching user commands, and running the periodic
//! status/parser-state queries with their lost-response recovery.
//!
//! All entry points take `&mut self`; the driver serializes serial
//! lines, the 250 ms tick, and user commands onto one task, which is
//! the whole concurrency story. Nothing here blocks.

use crate::command::{parse_command, GrblCommand};
use crate::evaluator::{format_number, ExecutionContext};
use crate::feeder::Feeder;
use crate::grbl::decoder;
use crate::grbl::machine::GrblMachine;
use crate::grbl::report::StatusReport;
use crate::grbl::response::{self, GrblResponse};
use crate::preprocessor::{self, HoldReason};
use crate::sender::Sender;
use crate::transport::Transport;
use crate::trigger::{EventTrigger, TaskRunner, TriggerAction};
use crate::workflow::Workflow;
use grblkit_core::{ControllerError, EventDispatcher, Position, ProtocolEvent, WorkflowState};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Housekeeping tick period
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Minimum gap between `$G` queries (leading edge)
const PARSER_QUERY_THROTTLE: Duration = Duration::from_millis(500);

/// Give up on an unanswered `?` after this long
const STATUS_QUERY_TOLERANCE: Duration = Duration::from_secs(5);

/// Give up on an unanswered `$G` after this long
const PARSER_QUERY_TOLERANCE: Duration = Duration::from_secs(10);

/// Quiet period after the last acknowledgment before the run is
/// declared complete
const SENDER_FINISH_QUIET: Duration = Duration::from_millis(500);

/// Delay between the feed hold and the soft reset of a forced stop
const FORCE_STOP_DELAY: Duration = Duration::from_millis(500);

/// Realtime single-byte commands, written immediately and never
/// newline-terminated
mod realtime {
    pub const STATUS_QUERY: u8 = b'?';
    pub const FEED_HOLD: u8 = b'!';
    pub const CYCLE_START: u8 = b'~';
    pub const SOFT_RESET: u8 = 0x18;

    pub const FEED_OVR_RESET: u8 = 0x90;
    pub const FEED_OVR_COARSE_PLUS: u8 = 0x91;
    pub const FEED_OVR_COARSE_MINUS: u8 = 0x92;
    pub const FEED_OVR_FINE_PLUS: u8 = 0x93;
    pub const FEED_OVR_FINE_MINUS: u8 = 0x94;

    pub const RAPID_OVR_RESET: u8 = 0x95;
    pub const RAPID_OVR_HALF: u8 = 0x96;
    pub const RAPID_OVR_QUARTER: u8 = 0x97;

    pub const SPINDLE_OVR_RESET: u8 = 0x99;
    pub const SPINDLE_OVR_COARSE_PLUS: u8 = 0x9A;
    pub const SPINDLE_OVR_COARSE_MINUS: u8 = 0x9B;
    pub const SPINDLE_OVR_FINE_PLUS: u8 = 0x9C;
    pub const SPINDLE_OVR_FINE_MINUS: u8 = 0x9D;
}

/// A stored macro
#[derive(Debug, Clone)]
pub struct MacroRecord {
    /// Macro id
    pub id: String,
    /// Display name
    pub name: String,
    /// G-code content
    pub content: String,
}

/// External macro storage
pub trait MacroStore: Send + Sync {
    /// Look up a macro by id
    fn get(&self, id: &str) -> Option<MacroRecord>;
}

/// External program loader for the watched directory
pub trait ProgramSource: Send + Sync {
    /// Read a program file
    fn load(&self, path: &str) -> std::io::Result<String>;
}

/// One-shot flags coupling queries to their responses.
///
/// The `query_*` flags mark an engine-initiated poll in flight; the
/// `reply_*` flags mark that the user asked, so the next matching
/// response is forwarded upstream instead of being swallowed.
#[derive(Debug, Default)]
struct ActionMask {
    query_parser_state: bool,
    query_parser_state_reply: bool,
    query_status_report: bool,
    reply_parser_state: bool,
    reply_status_report: bool,
}

#[derive(Debug, Default)]
struct ActionTime {
    query_parser_state: Option<Instant>,
    query_status_report: Option<Instant>,
    sender_finish: Option<Instant>,
}

/// The protocol engine
pub struct ProtocolEngine {
    transport: Option<Box<dyn Transport>>,
    port: String,
    machine: GrblMachine,
    feeder: Feeder,
    sender: Sender,
    workflow: Workflow,
    trigger: EventTrigger,
    context: ExecutionContext,
    events: EventDispatcher,
    macros: Option<Arc<dyn MacroStore>>,
    programs: Option<Arc<dyn ProgramSource>>,
    ready: bool,
    initialized: bool,
    action_mask: ActionMask,
    action_time: ActionTime,
    sender_end_seen: bool,
    force_stop_at: Option<Instant>,
    prev_settings: Value,
    prev_state: Value,
    prev_wpos: Position,
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolEngine {
    /// Create an engine with no port attached
    pub fn new() -> Self {
        Self::with_events(EventDispatcher::default())
    }

    /// Create an engine publishing through an existing dispatcher
    pub fn with_events(events: EventDispatcher) -> Self {
        Self {
            transport: None,
            port: String::new(),
            machine: GrblMachine::new(),
            feeder: Feeder::new(),
            sender: Sender::new(),
            workflow: Workflow::new(),
            trigger: EventTrigger::new(),
            context: ExecutionContext::new(),
            events,
            macros: None,
            programs: None,
            ready: false,
            initialized: false,
            action_mask: ActionMask::default(),
            action_time: ActionTime::default(),
            sender_end_seen: false,
            force_stop_at: None,
            prev_settings: Value::Null,
            prev_state: Value::Null,
            prev_wpos: Position::default(),
        }
    }

    /// Attach the external task runner for `system` trigger bindings
    pub fn set_task_runner(&mut self, runner: Arc<dyn TaskRunner>) {
        self.trigger.set_task_runner(runner);
    }

    /// Attach the external macro store
    pub fn set_macro_store(&mut self, store: Arc<dyn MacroStore>) {
        self.macros = Some(store);
    }

    /// Attach the external watch-directory loader
    pub fn set_program_source(&mut self, source: Arc<dyn ProgramSource>) {
        self.programs = Some(source);
    }

    /// Register a trigger binding
    pub fn bind_trigger(&mut self, event: impl Into<String>, action: TriggerAction) -> Uuid {
        self.trigger.bind(event, action)
    }

    /// Subscribe to outbound events
    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    /// The event dispatcher, for sharing with a driver
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Whether a port is attached
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Whether the startup handshake completed
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The device model
    pub fn machine(&self) -> &GrblMachine {
        &self.machine
    }

    /// The sender
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// The feeder
    pub fn feeder(&self) -> &Feeder {
        &self.feeder
    }

    /// Current workflow state
    pub fn workflow_state(&self) -> WorkflowState {
        self.workflow.state()
    }

    /// Attach an open transport and start the protocol
    pub fn open(&mut self, transport: Box<dyn Transport>) -> Result<(), ControllerError> {
        if self.transport.is_some() {
            tracing::error!("Cannot open port \"{}\" twice", self.port);
            return Err(ControllerError::AlreadyOpen);
        }

        self.port = transport.port_name().to_string();
        self.transport = Some(transport);
        self.ready = false;
        self.action_mask = ActionMask::default();
        self.action_time = ActionTime::default();

        self.events.publish(ProtocolEvent::SerialOpen {
            port: self.port.clone(),
        });
        self.events.publish(ProtocolEvent::SerialChange { open: true });
        Ok(())
    }

    /// Close the port and reset protocol state.
    ///
    /// Safe to call when already closed.
    pub fn close(&mut self) {
        self.ready = false;
        self.initialized = false;
        self.action_mask = ActionMask::default();
        self.action_time = ActionTime::default();
        self.force_stop_at = None;

        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                tracing::warn!("Error closing port {}: {}", self.port, e);
            }
            self.events.publish(ProtocolEvent::SerialClose {
                port: self.port.clone(),
            });
            self.events
                .publish(ProtocolEvent::SerialChange { open: false });
        }
    }

    /// Tear down all owned state
    pub fn destroy(&mut self) {
        self.close();
        self.feeder.clear();
        self.sender.unload();
        self.workflow.stop();
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Write a command through the reply-mask hook.
    ///
    /// A trimmed `?` or `$G` marks the matching response for forwarding
    /// upstream; a `$N=value` write mirrors into the local settings map
    /// before the device confirms it.
    pub fn write(&mut self, data: &str) {
        if !self.is_open() {
            tracing::error!("Unable to write data to the port while closed");
            return;
        }

        let cmd = data.trim();
        self.action_mask.reply_status_report = cmd == "?" || self.action_mask.reply_status_report;
        self.action_mask.reply_parser_state = cmd == "$G" || self.action_mask.reply_parser_state;

        if let Some((name, value)) = parse_setting_assignment(cmd) {
            self.machine.set_setting(&name, &value);
        }

        self.port_write(data.as_bytes());
    }

    /// Write a line, appending a newline unless the data is a realtime
    /// single-byte command
    pub fn writeln(&mut self, data: &str) {
        if is_realtime_str(data) {
            self.write(data);
        } else {
            let line = format!("{}\n", data);
            self.write(&line);
        }
    }

    /// Write a realtime byte, bypassing the line queues
    fn write_realtime(&mut self, byte: u8) {
        self.port_write(&[byte]);
    }

    /// Fire-and-forget transport write
    fn port_write(&mut self, data: &[u8]) {
        let Some(transport) = self.transport.as_mut() else {
            tracing::error!("Unable to write data to the port while closed");
            return;
        };

        match transport.write(data) {
            Ok(()) => {
                self.events.publish(ProtocolEvent::SerialWrite {
                    data: display_bytes(data),
                });
            }
            Err(e) => {
                tracing::error!("Write to {} failed: {}", self.port, e);
                self.events.publish(ProtocolEvent::SerialError {
                    message: e.to_string(),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Route one line received from the device
    pub fn on_line(&mut self, raw: &str) {
        let raw = raw.trim_end_matches(['\r', '\n']).trim();
        if raw.is_empty() {
            return;
        }
        tracing::debug!("< {}", raw);

        match response::parse(raw) {
            GrblResponse::Status(report) => self.handle_status(&report, raw),
            GrblResponse::Ok => self.handle_ok(raw),
            GrblResponse::Error { code, .. } => self.handle_error(code, raw),
            GrblResponse::Alarm { code, .. } => self.handle_alarm(code, raw),
            GrblResponse::ParserState { modals } => self.handle_parser_state(&modals, raw),
            GrblResponse::Setting { name, value } => self.handle_setting(&name, &value, raw),
            GrblResponse::Startup { version } => self.handle_startup(&version, raw),
            GrblResponse::Parameters { .. } | GrblResponse::Feedback { .. } => {
                self.events.publish(ProtocolEvent::SerialRead {
                    line: raw.to_string(),
                });
            }
            GrblResponse::Other => {
                self.events.publish(ProtocolEvent::SerialRead {
                    line: raw.to_string(),
                });
            }
        }
    }

    fn handle_status(&mut self, report: &StatusReport, raw: &str) {
        self.action_mask.query_status_report = false;
        self.action_time.query_status_report = None;

        if self.action_mask.reply_status_report {
            self.action_mask.reply_status_report = false;
            self.events.publish(ProtocolEvent::SerialRead {
                line: raw.to_string(),
            });
        }

        self.machine.update_status(report);

        // Grow the streaming budget on devices that expose their real
        // receive buffer, but never while data is in flight.
        if self.workflow.state() == WorkflowState::Idle {
            if let Some(rx) = report.rx_buffer_free {
                if rx > 0 && self.sender.data_length() == 0 {
                    self.sender
                        .set_buffer_size_at_least(rx.saturating_sub(8) as usize);
                }
            }
        }
    }

    fn handle_ok(&mut self, raw: &str) {
        // The ok that trails a [GC:...] report belongs to the query,
        // not to a queued line.
        if self.action_mask.query_parser_state_reply {
            if self.action_mask.reply_parser_state {
                self.action_mask.reply_parser_state = false;
                self.events.publish(ProtocolEvent::SerialRead {
                    line: raw.to_string(),
                });
            }
            self.action_mask.query_parser_state_reply = false;
            return;
        }

        match self.workflow.state() {
            WorkflowState::Running => {
                if self.sender.is_held() && self.sender.received() + 1 >= self.sender.sent() {
                    self.sender.unhold();
                }
                if !self.sender.ack() {
                    tracing::warn!("Acknowledgment with no line in flight");
                }
                self.pump_sender();
                self.check_sender_finish();
                return;
            }
            WorkflowState::Paused => {
                // Drain residual acknowledgments without advancing
                if self.sender.received() < self.sender.sent() {
                    self.sender.ack();
                    self.check_sender_finish();
                    return;
                }
            }
            WorkflowState::Idle => {}
        }

        self.events.publish(ProtocolEvent::SerialRead {
            line: raw.to_string(),
        });

        // A feeder %wait hold releases on the dwell's acknowledgment
        if let Some(reason) = self.feeder.hold_reason() {
            if reason.data == "%wait" {
                self.feeder.unhold();
            }
        }
        self.feeder.ack();
        self.pump_feeder();
    }

    fn handle_error(&mut self, code: Option<u8>, raw: &str) {
        let formatted = decoder::format_error(code, raw);

        if self.workflow.state() == WorkflowState::Running {
            let (line_number, line) = match self.sender.oldest_in_flight() {
                Some((number, text)) => (number, text.trim().to_string()),
                None => (self.sender.received() + 1, String::new()),
            };
            self.events.publish(ProtocolEvent::SerialRead {
                line: format!("> {} (line={})", line, line_number),
            });
            self.events.publish(ProtocolEvent::SerialRead {
                line: formatted.clone(),
            });

            self.wf_pause(Some(HoldReason::error(raw, formatted)));
            // The error still acknowledges its line; credit accounting
            // must not drift.
            self.sender.ack();
            self.pump_sender();
            return;
        }

        self.events.publish(ProtocolEvent::SerialRead { line: formatted });
        self.feeder.ack();
        self.pump_feeder();
    }

    fn handle_alarm(&mut self, code: Option<u8>, raw: &str) {
        // The device has halted on its own; recovery is the operator's
        // unlock, so the workflow is left untouched.
        self.events.publish(ProtocolEvent::SerialRead {
            line: decoder::format_alarm(code, raw),
        });
    }

    fn handle_parser_state(&mut self, modals: &str, raw: &str) {
        self.action_mask.query_parser_state = false;
        self.action_mask.query_parser_state_reply = true;
        self.machine.set_modals(modals);

        if self.action_mask.reply_parser_state {
            self.events.publish(ProtocolEvent::SerialRead {
                line: raw.to_string(),
            });
        }
    }

    fn handle_setting(&mut self, name: &str, value: &str, raw: &str) {
        self.machine.set_setting(name, value);
        self.events.publish(ProtocolEvent::SerialRead {
            line: decoder::format_setting(name, value, raw),
        });
    }

    fn handle_startup(&mut self, version: &str, raw: &str) {
        self.events.publish(ProtocolEvent::SerialRead {
            line: raw.to_string(),
        });

        self.machine.set_version(version);
        self.action_mask = ActionMask::default();
        self.action_time = ActionTime::default();

        if !self.initialized {
            self.initialized = true;
            self.writeln("$$");
        }
        self.ready = true;
    }

    // ------------------------------------------------------------------
    // Queue advancement
    // ------------------------------------------------------------------

    /// Refresh the machine/work position variables the preprocessor sees
    fn inject_position_vars(&mut self) {
        let mpos = self.machine.mpos();
        let wpos = self.machine.wpos();
        for (prefix, pos) in [("mpos", mpos), ("pos", wpos)] {
            self.context.set(format!("{}x", prefix), pos.x);
            self.context.set(format!("{}y", prefix), pos.y);
            self.context.set(format!("{}z", prefix), pos.z);
            self.context.set(format!("{}a", prefix), pos.a.unwrap_or(0.0));
            self.context.set(format!("{}b", prefix), pos.b.unwrap_or(0.0));
            self.context.set(format!("{}c", prefix), pos.c.unwrap_or(0.0));
        }
    }

    /// Advance the feeder by one line
    fn pump_feeder(&mut self) {
        self.inject_position_vars();

        let context = &mut self.context;
        let emitted = self.feeder.next_with(|line, item_ctx| {
            context.merge_json(item_ctx);
            preprocessor::process_line(line, context)
        });

        if let Some(line) = emitted {
            let data = format!("{}\n", line);
            self.port_write(data.as_bytes());
            self.publish_feeder_status();
        }
    }

    /// Advance the sender as far as buffer credit allows
    fn pump_sender(&mut self) {
        if self.workflow.state() != WorkflowState::Running {
            return;
        }

        self.inject_position_vars();

        let context = &mut self.context;
        let step = self.sender.next_with(|line, program_ctx| {
            context.merge_json(program_ctx);
            preprocessor::process_line(line, context)
        });

        for line in &step.lines {
            let data = format!("{}\n", line);
            self.port_write(data.as_bytes());
        }

        if step.started {
            self.action_time.sender_finish = None;
            self.sender_end_seen = false;
        }

        if let Some(reason) = step.pause {
            self.wf_pause(Some(reason));
        }

        if !step.lines.is_empty() {
            self.publish_sender_status();
        }

        self.check_sender_finish();
    }

    /// Stamp the finish time once every line has been acknowledged
    fn check_sender_finish(&mut self) {
        if self.sender.is_finished() && !self.sender_end_seen {
            self.sender_end_seen = true;
            self.action_time.sender_finish = Some(Instant::now());
            self.publish_sender_status();
        }
    }

    fn publish_feeder_status(&self) {
        self.events.publish(ProtocolEvent::FeederStatus {
            status: serde_json::to_value(self.feeder.status()).unwrap_or_default(),
        });
    }

    fn publish_sender_status(&self) {
        self.events.publish(ProtocolEvent::SenderStatus {
            status: serde_json::to_value(self.sender.status()).unwrap_or_default(),
        });
    }

    // ------------------------------------------------------------------
    // Workflow composites
    // ------------------------------------------------------------------

    fn publish_workflow_state(&self) {
        self.events.publish(ProtocolEvent::WorkflowState {
            state: self.workflow.state(),
        });
    }

    fn wf_start(&mut self) {
        if self.workflow.start() {
            self.publish_workflow_state();
            self.sender.rewind();
            self.sender_end_seen = false;
            self.action_time.sender_finish = None;
        }
    }

    fn wf_pause(&mut self, reason: Option<HoldReason>) {
        if self.workflow.pause(reason.clone()) {
            self.publish_workflow_state();
            self.sender
                .hold(reason.unwrap_or_else(|| HoldReason::new("pause")));
        }
    }

    fn wf_resume(&mut self) {
        if self.workflow.resume() {
            self.publish_workflow_state();
            self.feeder.clear();
            self.sender.unhold();
            self.pump_sender();
        }
    }

    fn wf_stop(&mut self) {
        if self.workflow.stop() {
            self.publish_workflow_state();
            self.sender.rewind();
            self.sender_end_seen = false;
            self.action_time.sender_finish = None;
        }
    }

    // ------------------------------------------------------------------
    // Command bus
    // ------------------------------------------------------------------

    /// Fire a named trigger; `gcode` bindings feed through the feeder
    fn fire_trigger(&mut self, event: &str) {
        let lines = self.trigger.fire(event);
        if !lines.is_empty() {
            self.feed_lines(lines, Value::Null);
        }
    }

    /// Queue ad-hoc lines and kick the feeder when nothing is in flight
    fn feed_lines(&mut self, lines: Vec<String>, context: Value) {
        self.feeder.feed(lines, context);
        if !self.feeder.has_in_flight() {
            self.pump_feeder();
        }
    }

    /// Dispatch a string-keyed command with JSON arguments
    pub fn command_by_name(&mut self, name: &str, args: &Value) -> anyhow::Result<()> {
        match parse_command(name, args) {
            Ok(cmd) => self.command(cmd),
            Err(e) => {
                tracing::error!("Command rejected: {}", e);
                Err(e.into())
            }
        }
    }

    /// Execute a command
    pub fn command(&mut self, cmd: GrblCommand) -> anyhow::Result<()> {
        tracing::debug!("command: {:?}", cmd);

        match cmd {
            GrblCommand::GcodeLoad {
                name,
                gcode,
                context,
            } => {
                if !self.sender.load(&name, &gcode, context) {
                    return Err(ControllerError::EmptyProgram.into());
                }
                self.events.publish(ProtocolEvent::GcodeLoad {
                    name: name.clone(),
                    gcode,
                });
                self.fire_trigger("gcode:load");
                tracing::debug!("Loaded G-code: name={}", name);
                self.wf_stop();
                self.publish_sender_status();
            }
            GrblCommand::GcodeUnload => {
                self.wf_stop();
                self.sender.unload();
                self.events.publish(ProtocolEvent::GcodeUnload);
                self.fire_trigger("gcode:unload");
                self.publish_sender_status();
            }
            GrblCommand::GcodeStart => {
                self.fire_trigger("gcode:start");
                self.wf_start();
                self.pump_sender();
            }
            GrblCommand::GcodeStop { force } => {
                self.fire_trigger("gcode:stop");
                self.wf_stop();
                if force {
                    if self.machine.state() == grblkit_core::MachineState::Run {
                        self.write_realtime(realtime::FEED_HOLD);
                    }
                    self.force_stop_at = Some(Instant::now() + FORCE_STOP_DELAY);
                }
            }
            GrblCommand::GcodePause => {
                self.fire_trigger("gcode:pause");
                self.wf_pause(None);
            }
            GrblCommand::GcodeResume => {
                // The resume composite clears the feeder; capture the
                // binding's lines first and enqueue them after, so the
                // clear cannot wipe them.
                let lines = self.trigger.fire("gcode:resume");
                self.wf_resume();
                if !lines.is_empty() {
                    self.feed_lines(lines, Value::Null);
                }
            }
            GrblCommand::Gcode { lines, context } => {
                self.feed_lines(lines, context);
            }
            GrblCommand::FeederStart => {
                if self.workflow.state() == WorkflowState::Running {
                    return Ok(());
                }
                self.write_realtime(realtime::CYCLE_START);
                self.feeder.unhold();
                self.pump_feeder();
                self.publish_feeder_status();
            }
            GrblCommand::FeederPause => {
                self.feeder.hold(HoldReason::new("pause"));
                self.publish_feeder_status();
            }
            GrblCommand::FeederStop => {
                self.feeder.clear();
                self.publish_feeder_status();
            }
            GrblCommand::Feedhold => {
                self.fire_trigger("feedhold");
                self.write_realtime(realtime::FEED_HOLD);
            }
            GrblCommand::Cyclestart => {
                self.fire_trigger("cyclestart");
                self.write_realtime(realtime::CYCLE_START);
            }
            GrblCommand::StatusReport => {
                self.write("?");
            }
            GrblCommand::Homing => {
                self.fire_trigger("homing");
                self.writeln("$H");
            }
            GrblCommand::Sleep => {
                self.fire_trigger("sleep");
                self.writeln("$SLP");
            }
            GrblCommand::Unlock => {
                self.writeln("$X");
            }
            GrblCommand::Reset => {
                self.wf_stop();
                self.feeder.clear();
                self.write_realtime(realtime::SOFT_RESET);
            }
            GrblCommand::FeedOverride { value } => {
                let byte = match value {
                    0 => realtime::FEED_OVR_RESET,
                    10 => realtime::FEED_OVR_COARSE_PLUS,
                    -10 => realtime::FEED_OVR_COARSE_MINUS,
                    1 => realtime::FEED_OVR_FINE_PLUS,
                    -1 => realtime::FEED_OVR_FINE_MINUS,
                    other => {
                        tracing::warn!("Unsupported feed override step {}", other);
                        return Ok(());
                    }
                };
                self.write_realtime(byte);
            }
            GrblCommand::SpindleOverride { value } => {
                let byte = match value {
                    0 => realtime::SPINDLE_OVR_RESET,
                    10 => realtime::SPINDLE_OVR_COARSE_PLUS,
                    -10 => realtime::SPINDLE_OVR_COARSE_MINUS,
                    1 => realtime::SPINDLE_OVR_FINE_PLUS,
                    -1 => realtime::SPINDLE_OVR_FINE_MINUS,
                    other => {
                        tracing::warn!("Unsupported spindle override step {}", other);
                        return Ok(());
                    }
                };
                self.write_realtime(byte);
            }
            GrblCommand::RapidOverride { value } => {
                let byte = match value {
                    0 | 100 => realtime::RAPID_OVR_RESET,
                    50 => realtime::RAPID_OVR_HALF,
                    25 => realtime::RAPID_OVR_QUARTER,
                    other => {
                        tracing::warn!("Unsupported rapid override {}", other);
                        return Ok(());
                    }
                };
                self.write_realtime(byte);
            }
            GrblCommand::LaserTestOn {
                power,
                duration,
                max_s,
            } => {
                let s = positive(max_s * power / 100.0);
                let mut commands = vec!["G1F1".to_string(), format!("M3S{}", format_number(s))];
                if duration > 0 {
                    commands.push(format!(
                        "G4P{}",
                        format_number(positive(duration as f64 / 1000.0))
                    ));
                    commands.push("M5S0".to_string());
                }
                self.feed_lines(commands, Value::Null);
            }
            GrblCommand::LaserTestOff => {
                self.feed_lines(vec!["M5S0".to_string()], Value::Null);
            }
            GrblCommand::MacroRun { id, context } => {
                let record = self.lookup_macro(&id)?;
                self.fire_trigger("macro:run");
                let lines = record
                    .content
                    .lines()
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| s.to_string())
                    .collect();
                self.feed_lines(lines, context);
            }
            GrblCommand::MacroLoad { id, context } => {
                let record = self.lookup_macro(&id)?;
                self.fire_trigger("macro:load");
                return self.command(GrblCommand::GcodeLoad {
                    name: record.name,
                    gcode: record.content,
                    context,
                });
            }
            GrblCommand::WatchDirLoad { path } => {
                let Some(source) = &self.programs else {
                    return Err(ControllerError::NotFound {
                        what: "watch directory".to_string(),
                    }
                    .into());
                };
                let gcode = source.load(&path)?;
                return self.command(GrblCommand::GcodeLoad {
                    name: path,
                    gcode,
                    context: Value::Null,
                });
            }
        }

        Ok(())
    }

    fn lookup_macro(&self, id: &str) -> Result<MacroRecord, ControllerError> {
        let store = self.macros.as_ref().ok_or_else(|| ControllerError::NotFound {
            what: "macro store".to_string(),
        })?;
        store.get(id).ok_or_else(|| ControllerError::NotFound {
            what: format!("macro {}", id),
        })
    }

    // ------------------------------------------------------------------
    // Periodic housekeeping
    // ------------------------------------------------------------------

    /// Run one housekeeping tick
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Run one housekeeping tick at the given instant.
    ///
    /// No-op while the port is closed.
    pub fn tick_at(&mut self, now: Instant) {
        if !self.is_open() {
            return;
        }

        if self.feeder.peek().is_some() {
            self.publish_feeder_status();
        }
        if self.sender.peek().is_some() {
            self.publish_sender_status();
        }

        let settings = self.machine.settings_snapshot();
        if settings != self.prev_settings {
            self.prev_settings = settings.clone();
            self.events
                .publish(ProtocolEvent::ControllerSettings { settings });
        }

        let state = self.machine.state_snapshot();
        if state != self.prev_state {
            self.prev_state = state.clone();
            self.events.publish(ProtocolEvent::ControllerState { state });
        }

        if self.ready {
            self.query_status_report(now);
            self.query_parser_state(now);
        }

        if let Some(deadline) = self.force_stop_at {
            if now >= deadline {
                self.force_stop_at = None;
                if self.machine.state() == grblkit_core::MachineState::Hold {
                    self.write_realtime(realtime::SOFT_RESET);
                }
            }
        }

        if let Some(finish) = self.action_time.sender_finish {
            if self.machine.is_idle() {
                let quiesced = self.prev_wpos == self.machine.wpos();
                if quiesced && now.duration_since(finish) > SENDER_FINISH_QUIET {
                    self.action_time.sender_finish = None;
                    if let Err(e) = self.command(GrblCommand::GcodeStop { force: false }) {
                        tracing::warn!("Deferred gcode:stop failed: {}", e);
                    }
                }
            } else {
                // Still moving: extend the quiescence window
                self.action_time.sender_finish = Some(now);
            }
        }

        self.prev_wpos = self.machine.wpos();
    }

    /// Poll the device for a status report, with lost-response recovery
    fn query_status_report(&mut self, now: Instant) {
        if !self.is_open() || !self.ready {
            return;
        }

        if !self.action_mask.query_status_report {
            self.action_mask.query_status_report = true;
            self.action_time.query_status_report = Some(now);
            self.write_realtime(realtime::STATUS_QUERY);
            return;
        }

        if let Some(stamp) = self.action_time.query_status_report {
            if now.duration_since(stamp) >= STATUS_QUERY_TOLERANCE {
                tracing::debug!("Status report query timed out; clearing mask");
                self.action_mask.query_status_report = false;
                self.action_time.query_status_report = None;
            }
        }
    }

    /// Poll the parser state, leading-edge throttled; only while both
    /// the workflow and the device are idle
    fn query_parser_state(&mut self, now: Instant) {
        if !self.is_open() || !self.ready {
            return;
        }

        if self.action_mask.query_parser_state || self.action_mask.query_parser_state_reply {
            if let Some(stamp) = self.action_time.query_parser_state {
                if now.duration_since(stamp) >= PARSER_QUERY_TOLERANCE {
                    tracing::debug!("Parser state query timed out; clearing masks");
                    self.action_mask.query_parser_state = false;
                    self.action_mask.query_parser_state_reply = false;
                }
            }
            return;
        }

        if self.workflow.state() != WorkflowState::Idle || !self.machine.is_idle() {
            return;
        }

        if let Some(stamp) = self.action_time.query_parser_state {
            if now.duration_since(stamp) < PARSER_QUERY_THROTTLE {
                return;
            }
        }

        self.action_mask.query_parser_state = true;
        self.action_time.query_parser_state = Some(now);
        self.port_write(b"$G\n");
    }
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("port", &self.port)
            .field("open", &self.is_open())
            .field("ready", &self.ready)
            .field("workflow", &self.workflow.state())
            .finish()
    }
}

/// Clamp to zero; laser power and dwell values must not go negative
fn positive(value: f64) -> f64 {
    value.max(0.0)
}

/// Match `$N=value` writes so the local settings map sees the intended
/// change before the device confirms it
fn parse_setting_assignment(cmd: &str) -> Option<(String, String)> {
    let rest = cmd.strip_prefix('$')?;
    let (num, value) = rest.split_once('=')?;
    if num.is_empty() || !num.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((format!("${}", num), value.trim().to_string()))
}

/// Realtime commands representable as a one-character string
fn is_realtime_str(data: &str) -> bool {
    let bytes = data.as_bytes();
    bytes.len() == 1
        && matches!(
            bytes[0],
            realtime::STATUS_QUERY
                | realtime::FEED_HOLD
                | realtime::CYCLE_START
                | realtime::SOFT_RESET
        )
}

/// Render written bytes for the `serialport:write` event; realtime
/// bytes outside ASCII are hex-escaped
fn display_bytes(data: &[u8]) -> String {
    if data.iter().all(|&b| b == b'\n' || b == b'\r' || (0x20..0x7f).contains(&b)) {
        return String::from_utf8_lossy(data).to_string();
    }
    data.iter().map(|b| format!("\\x{:02x}", b)).collect()
}
