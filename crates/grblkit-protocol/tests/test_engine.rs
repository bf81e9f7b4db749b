//! Engine-level scenarios: the startup handshake, feeder tool-change
//! holds, reply-mask coupling, poll throttling, force stop, overrides,
//! and the laser test sequence.

use grblkit_core::{MachineState, ProtocolEvent, WorkflowState};
use grblkit_protocol::{GrblCommand, ProtocolEngine, Transport, TriggerAction};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct MockTransport {
    written: Arc<Mutex<Vec<u8>>>,
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> grblkit_core::Result<()> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn port_name(&self) -> &str {
        "/dev/ttyACM0"
    }

    fn close(&mut self) -> grblkit_core::Result<()> {
        Ok(())
    }
}

fn engine_with_wire() -> (ProtocolEngine, Arc<Mutex<Vec<u8>>>) {
    let written = Arc::new(Mutex::new(Vec::new()));
    let mut engine = ProtocolEngine::new();
    engine
        .open(Box::new(MockTransport {
            written: written.clone(),
        }))
        .unwrap();
    (engine, written)
}

fn wire_bytes(written: &Arc<Mutex<Vec<u8>>>) -> Vec<u8> {
    written.lock().unwrap().clone()
}

fn wire_text(written: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&written.lock().unwrap()).to_string()
}

fn drain_wire(written: &Arc<Mutex<Vec<u8>>>) {
    written.lock().unwrap().clear();
}

fn serial_reads(rx: &mut tokio::sync::broadcast::Receiver<ProtocolEvent>) -> Vec<String> {
    let mut reads = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ProtocolEvent::SerialRead { line } = event {
            reads.push(line);
        }
    }
    reads
}

#[test]
fn test_startup_handshake() {
    let (mut engine, written) = engine_with_wire();
    assert!(!engine.is_ready());

    engine.on_line("Grbl 1.1f ['$' for help]");
    assert!(engine.is_ready());
    assert_eq!(wire_text(&written), "$$\n");
    assert_eq!(engine.machine().version(), "1.1f");

    // A second banner (soft reset) must not repeat the settings dump
    engine.on_line("Grbl 1.1f ['$' for help]");
    assert_eq!(wire_text(&written), "$$\n");
}

#[test]
fn test_double_open_rejected() {
    let (mut engine, written) = engine_with_wire();
    let result = engine.open(Box::new(MockTransport {
        written: written.clone(),
    }));
    assert!(result.is_err());
}

#[test]
fn test_feeder_tool_change_hold() {
    let (mut engine, written) = engine_with_wire();

    engine
        .command_by_name("gcode", &json!(["M6 T1"]))
        .unwrap();

    // The tool change goes out wrapped in parens, and the feeder is
    // already held for the operator
    assert_eq!(wire_text(&written), "(M6) T1\n");
    assert!(engine.feeder().is_held());
    assert_eq!(engine.feeder().hold_reason().unwrap().data, "M6");

    // More feeder input queues behind the hold
    engine.command_by_name("gcode", &json!(["G0 X0"])).unwrap();
    assert_eq!(wire_text(&written), "(M6) T1\n");

    engine.on_line("ok");
    assert_eq!(wire_text(&written), "(M6) T1\n");

    // feeder:start releases the hold and writing resumes
    drain_wire(&written);
    engine.command(GrblCommand::FeederStart).unwrap();
    assert_eq!(wire_text(&written), "~G0 X0\n");
}

#[test]
fn test_feeder_wait_releases_on_ok() {
    let (mut engine, written) = engine_with_wire();

    engine
        .command_by_name("gcode", &json!(["%wait\nG0 X0"]))
        .unwrap();
    assert_eq!(wire_text(&written), "G4 P0.5 (%wait)\n");
    assert!(engine.feeder().is_held());

    // The dwell's ok releases the hold and the next line flows
    engine.on_line("ok");
    assert!(!engine.feeder().is_held());
    assert_eq!(wire_text(&written), "G4 P0.5 (%wait)\nG0 X0\n");
}

#[test]
fn test_force_stop_resets_once_holding() {
    let (mut engine, written) = engine_with_wire();

    engine.on_line("<Run|MPos:1.000,0.000,0.000>");
    assert_eq!(engine.machine().state(), MachineState::Run);

    engine
        .command(GrblCommand::GcodeStop { force: true })
        .unwrap();
    assert_eq!(wire_bytes(&written), b"!");

    engine.on_line("<Hold:0|MPos:1.000,0.000,0.000>");
    engine.tick_at(Instant::now() + Duration::from_millis(600));
    assert_eq!(wire_bytes(&written), b"!\x18");
}

#[test]
fn test_force_stop_without_hold_does_nothing_more() {
    let (mut engine, written) = engine_with_wire();

    engine.on_line("<Run|MPos:1.000,0.000,0.000>");
    engine
        .command(GrblCommand::GcodeStop { force: true })
        .unwrap();
    assert_eq!(wire_bytes(&written), b"!");

    // The device never reached Hold
    engine.on_line("<Run|MPos:2.000,0.000,0.000>");
    engine.tick_at(Instant::now() + Duration::from_millis(600));
    assert_eq!(wire_bytes(&written), b"!");
}

#[test]
fn test_status_poll_suppression() {
    let (mut engine, written) = engine_with_wire();
    engine.on_line("Grbl 1.1f ['$' for help]");
    drain_wire(&written);

    let t0 = Instant::now();
    engine.tick_at(t0);
    let first = wire_bytes(&written);
    assert!(first.contains(&b'?'));

    // While the query is outstanding and fresh, no second `?` leaves
    drain_wire(&written);
    engine.tick_at(t0 + Duration::from_millis(250));
    engine.tick_at(t0 + Duration::from_millis(500));
    assert!(!wire_bytes(&written).contains(&b'?'));

    // A status report clears the mask and polling resumes
    engine.on_line("<Idle|MPos:0.000,0.000,0.000>");
    drain_wire(&written);
    engine.tick_at(t0 + Duration::from_millis(750));
    assert!(wire_bytes(&written).contains(&b'?'));
}

#[test]
fn test_status_poll_lost_response_recovery() {
    let (mut engine, written) = engine_with_wire();
    engine.on_line("Grbl 1.1f ['$' for help]");

    let t0 = Instant::now();
    engine.tick_at(t0);
    drain_wire(&written);

    // No response for five seconds: the mask force-clears, then the
    // next tick issues a fresh query
    engine.tick_at(t0 + Duration::from_secs(6));
    engine.tick_at(t0 + Duration::from_millis(6250));
    assert!(wire_bytes(&written).contains(&b'?'));
}

#[test]
fn test_internal_status_not_forwarded_user_status_is() {
    let (mut engine, _written) = engine_with_wire();
    engine.on_line("Grbl 1.1f ['$' for help]");
    let mut rx = engine.subscribe();

    // Unsolicited/polled reports stay internal
    engine.on_line("<Idle|MPos:0.000,0.000,0.000>");
    assert!(serial_reads(&mut rx).is_empty());

    // A user `?` marks the next report for forwarding
    engine.command(GrblCommand::StatusReport).unwrap();
    engine.on_line("<Idle|MPos:0.000,0.000,0.000>");
    let reads = serial_reads(&mut rx);
    assert_eq!(reads, vec!["<Idle|MPos:0.000,0.000,0.000>".to_string()]);

    // One-shot: the following report is internal again
    engine.on_line("<Idle|MPos:0.000,0.000,0.000>");
    assert!(serial_reads(&mut rx).is_empty());
}

#[test]
fn test_parser_state_query_cycle() {
    let (mut engine, written) = engine_with_wire();
    engine.on_line("Grbl 1.1f ['$' for help]");
    engine.on_line("<Idle|MPos:0.000,0.000,0.000>");
    let mut rx = engine.subscribe();
    drain_wire(&written);

    let t0 = Instant::now();
    engine.tick_at(t0);
    assert!(wire_text(&written).contains("$G\n"));

    // The polled report and its trailing ok are both swallowed
    engine.on_line("[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]");
    engine.on_line("ok");
    assert!(serial_reads(&mut rx).is_empty());

    // A user $G forwards both
    engine.write("$G");
    engine.on_line("[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]");
    engine.on_line("ok");
    let reads = serial_reads(&mut rx);
    assert_eq!(
        reads,
        vec![
            "[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]".to_string(),
            "ok".to_string()
        ]
    );
}

#[test]
fn test_parser_state_throttle() {
    let (mut engine, written) = engine_with_wire();
    engine.on_line("Grbl 1.1f ['$' for help]");
    engine.on_line("<Idle|MPos:0.000,0.000,0.000>");
    drain_wire(&written);

    let t0 = Instant::now();
    engine.tick_at(t0);
    assert!(wire_text(&written).contains("$G\n"));
    engine.on_line("[GC:G0 G54]");
    engine.on_line("ok");

    // Within the 500 ms gap nothing fires again
    drain_wire(&written);
    engine.tick_at(t0 + Duration::from_millis(250));
    assert!(!wire_text(&written).contains("$G"));

    engine.tick_at(t0 + Duration::from_millis(750));
    assert!(wire_text(&written).contains("$G"));
}

#[test]
fn test_parser_state_not_queried_while_running() {
    let (mut engine, written) = engine_with_wire();
    engine.on_line("Grbl 1.1f ['$' for help]");
    engine.on_line("<Idle|MPos:0.000,0.000,0.000>");

    engine
        .command(GrblCommand::GcodeLoad {
            name: "p".to_string(),
            gcode: "G0 X1\n".to_string(),
            context: serde_json::Value::Null,
        })
        .unwrap();
    engine.command(GrblCommand::GcodeStart).unwrap();
    drain_wire(&written);

    engine.tick_at(Instant::now() + Duration::from_secs(2));
    assert!(!wire_text(&written).contains("$G"));
}

#[test]
fn test_alarm_surfaced_without_workflow_change() {
    let (mut engine, _written) = engine_with_wire();
    let mut rx = engine.subscribe();

    engine
        .command(GrblCommand::GcodeLoad {
            name: "p".to_string(),
            gcode: "G0 X1\nG0 X2\n".to_string(),
            context: serde_json::Value::Null,
        })
        .unwrap();
    engine.command(GrblCommand::GcodeStart).unwrap();
    serial_reads(&mut rx);

    engine.on_line("ALARM:1");

    let reads = serial_reads(&mut rx);
    assert_eq!(reads.len(), 1);
    assert!(reads[0].starts_with("ALARM:1 (Hard limit"));
    // The device halted itself; the workflow is left for the operator
    assert_eq!(engine.workflow_state(), WorkflowState::Running);
}

#[test]
fn test_setting_lines_augmented_and_mirrored() {
    let (mut engine, _written) = engine_with_wire();
    let mut rx = engine.subscribe();

    engine.on_line("$110=500.000");
    let reads = serial_reads(&mut rx);
    assert_eq!(reads, vec!["$110=500.000 (X-axis maximum rate, mm/min)"]);
    assert_eq!(
        engine.machine().settings().get("$110").map(|s| s.as_str()),
        Some("500.000")
    );

    // Unknown keys pass through untouched
    engine.on_line("$262=7");
    assert_eq!(serial_reads(&mut rx), vec!["$262=7"]);
}

#[test]
fn test_setting_write_mirrors_before_confirmation() {
    let (mut engine, _written) = engine_with_wire();
    engine.write("$10=255\n");
    assert_eq!(
        engine.machine().settings().get("$10").map(|s| s.as_str()),
        Some("255")
    );
}

#[test]
fn test_buffer_size_tuning_from_status() {
    let (mut engine, _written) = engine_with_wire();
    assert_eq!(engine.sender().buffer_size(), 120);

    engine.on_line("<Idle|MPos:0.000,0.000,0.000|Bf:15,255>");
    assert_eq!(engine.sender().buffer_size(), 247);

    // Smaller reports never shrink the budget
    engine.on_line("<Idle|MPos:0.000,0.000,0.000|Bf:15,128>");
    assert_eq!(engine.sender().buffer_size(), 247);
}

#[test]
fn test_override_commands_emit_realtime_bytes() {
    let (mut engine, written) = engine_with_wire();

    engine.command(GrblCommand::FeedOverride { value: 0 }).unwrap();
    engine.command(GrblCommand::FeedOverride { value: 10 }).unwrap();
    engine.command(GrblCommand::FeedOverride { value: -1 }).unwrap();
    engine
        .command(GrblCommand::SpindleOverride { value: -10 })
        .unwrap();
    engine.command(GrblCommand::RapidOverride { value: 50 }).unwrap();
    engine.command(GrblCommand::RapidOverride { value: 100 }).unwrap();

    assert_eq!(
        wire_bytes(&written),
        vec![0x90, 0x91, 0x94, 0x9B, 0x96, 0x95]
    );
}

#[test]
fn test_realtime_bytes_not_newline_terminated() {
    let (mut engine, written) = engine_with_wire();

    engine.command(GrblCommand::Feedhold).unwrap();
    engine.command(GrblCommand::Cyclestart).unwrap();
    engine.command(GrblCommand::Reset).unwrap();
    assert_eq!(wire_bytes(&written), b"!~\x18");

    // Line commands do get their newline
    drain_wire(&written);
    engine.command(GrblCommand::Unlock).unwrap();
    engine.command(GrblCommand::Homing).unwrap();
    engine.command(GrblCommand::Sleep).unwrap();
    assert_eq!(wire_text(&written), "$X\n$H\n$SLP\n");
}

#[test]
fn test_lasertest_sequence() {
    let (mut engine, written) = engine_with_wire();

    engine
        .command(GrblCommand::LaserTestOn {
            power: 50.0,
            duration: 2000,
            max_s: 1000.0,
        })
        .unwrap();

    // Feeder-paced: each line leaves on the previous acknowledgment
    assert_eq!(wire_text(&written), "G1F1\n");
    engine.on_line("ok");
    assert_eq!(wire_text(&written), "G1F1\nM3S500\n");
    engine.on_line("ok");
    engine.on_line("ok");
    assert_eq!(wire_text(&written), "G1F1\nM3S500\nG4P2\nM5S0\n");
}

#[test]
fn test_lasertest_power_clamped() {
    let (mut engine, written) = engine_with_wire();

    engine
        .command(GrblCommand::LaserTestOn {
            power: -50.0,
            duration: 0,
            max_s: 1000.0,
        })
        .unwrap();
    assert_eq!(wire_text(&written), "G1F1\n");
    engine.on_line("ok");
    assert_eq!(wire_text(&written), "G1F1\nM3S0\n");
}

#[test]
fn test_legacy_command_aliases() {
    let (mut engine, _written) = engine_with_wire();

    engine
        .command(GrblCommand::GcodeLoad {
            name: "p".to_string(),
            gcode: "G0 X1\n".to_string(),
            context: serde_json::Value::Null,
        })
        .unwrap();

    engine.command_by_name("start", &serde_json::Value::Null).unwrap();
    assert_eq!(engine.workflow_state(), WorkflowState::Running);
    engine.command_by_name("pause", &serde_json::Value::Null).unwrap();
    assert_eq!(engine.workflow_state(), WorkflowState::Paused);
    engine.command_by_name("resume", &serde_json::Value::Null).unwrap();
    assert_eq!(engine.workflow_state(), WorkflowState::Running);
    engine.command_by_name("stop", &serde_json::Value::Null).unwrap();
    assert_eq!(engine.workflow_state(), WorkflowState::Idle);
}

#[test]
fn test_start_trigger_binding_lines_survive() {
    let (mut engine, written) = engine_with_wire();
    engine.bind_trigger(
        "gcode:start",
        TriggerAction::Gcode {
            commands: "M7\nM8".to_string(),
        },
    );

    engine
        .command(GrblCommand::GcodeLoad {
            name: "p".to_string(),
            gcode: "G0 X1\n".to_string(),
            context: serde_json::Value::Null,
        })
        .unwrap();
    drain_wire(&written);

    engine.command(GrblCommand::GcodeStart).unwrap();

    // The first binding line leaves immediately; the second stays
    // queued behind its acknowledgment instead of being dropped
    assert_eq!(wire_text(&written), "M7\nG0 X1\n");
    assert_eq!(engine.feeder().len(), 1);
}

#[test]
fn test_resume_trigger_binding_lines_survive() {
    let (mut engine, written) = engine_with_wire();
    engine.bind_trigger(
        "gcode:resume",
        TriggerAction::Gcode {
            commands: "M7\nM8".to_string(),
        },
    );

    engine
        .command(GrblCommand::GcodeLoad {
            name: "p".to_string(),
            gcode: "G0 X1\nG0 X2\n".to_string(),
            context: serde_json::Value::Null,
        })
        .unwrap();
    engine.command(GrblCommand::GcodeStart).unwrap();
    engine.command(GrblCommand::GcodePause).unwrap();
    drain_wire(&written);

    engine.command(GrblCommand::GcodeResume).unwrap();
    assert_eq!(engine.workflow_state(), WorkflowState::Running);

    // The resume clears the feeder, but the binding's lines are fed
    // afterwards: one on the wire, one queued
    assert_eq!(wire_text(&written), "M7\n");
    assert_eq!(engine.feeder().len(), 1);
}

#[test]
fn test_unknown_command_rejected() {
    let (mut engine, _written) = engine_with_wire();
    assert!(engine
        .command_by_name("warp:engage", &serde_json::Value::Null)
        .is_err());
}

#[test]
fn test_close_is_idempotent_and_resets_state() {
    let (mut engine, _written) = engine_with_wire();
    engine.on_line("Grbl 1.1f ['$' for help]");
    assert!(engine.is_ready());

    engine.close();
    assert!(!engine.is_open());
    assert!(!engine.is_ready());
    engine.close();

    // Ticks are no-ops while closed
    engine.tick_at(Instant::now() + Duration::from_secs(10));
}
