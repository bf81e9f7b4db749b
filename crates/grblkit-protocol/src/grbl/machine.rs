//! Grbl device model
//!
//! Holds the last-known machine state: active state, positions, the
//! settings map, and the parser modal state. Pure state only; the model
//! never performs I/O. Update methods report whether anything changed so
//! the engine can emit change notifications only on real differences.

use grblkit_core::{MachineState, Position};
use serde_json::json;
use std::collections::BTreeMap;

use super::report::StatusReport;

/// Last-known device state snapshot
#[derive(Debug, Clone, Default)]
pub struct GrblMachine {
    state: MachineState,
    raw_state: String,
    mpos: Position,
    wpos: Position,
    wco: Option<Position>,
    feed_rate: f64,
    spindle_speed: f64,
    modals: String,
    version: String,
    settings: BTreeMap<String, String>,
    last_status: Option<StatusReport>,
}

impl GrblMachine {
    /// Create an empty device model
    pub fn new() -> Self {
        Self::default()
    }

    /// Active machine state
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Machine position
    pub fn mpos(&self) -> Position {
        self.mpos
    }

    /// Work position
    ///
    /// Maintained as machine position minus WCO; equals the machine
    /// position while the offset is unknown.
    pub fn wpos(&self) -> Position {
        self.wpos
    }

    /// Whether the device reports Idle
    pub fn is_idle(&self) -> bool {
        self.state == MachineState::Idle
    }

    /// Whether the device reports Alarm
    pub fn is_alarm(&self) -> bool {
        self.state == MachineState::Alarm
    }

    /// Firmware version from the startup banner
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The settings map (`$N` -> value)
    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }

    /// Last parsed status report
    pub fn last_status(&self) -> Option<&StatusReport> {
        self.last_status.as_ref()
    }

    /// Record the firmware version from the startup banner
    pub fn set_version(&mut self, version: &str) {
        self.version = version.to_string();
    }

    /// Record the parser modal state from a `[GC:...]` report
    pub fn set_modals(&mut self, modals: &str) -> bool {
        if self.modals == modals {
            return false;
        }
        self.modals = modals.to_string();
        true
    }

    /// Apply a status report. Returns true when any tracked value changed.
    pub fn update_status(&mut self, report: &StatusReport) -> bool {
        let before = (self.state, self.raw_state.clone(), self.mpos, self.wpos);

        self.state = report.state;
        self.raw_state = report.raw_state.clone();

        if let Some(wco) = report.wco {
            self.wco = Some(wco);
        }

        match (report.mpos, report.wpos) {
            (Some(mpos), Some(wpos)) => {
                self.mpos = mpos;
                self.wpos = wpos;
            }
            (Some(mpos), None) => {
                self.mpos = mpos;
                self.wpos = match &self.wco {
                    Some(wco) => mpos.sub(wco),
                    None => mpos,
                };
            }
            (None, Some(wpos)) => {
                self.wpos = wpos;
                // MPos = WPos + WCO; without an offset the spaces coincide
                if let Some(wco) = &self.wco {
                    self.mpos = Position {
                        x: wpos.x + wco.x,
                        y: wpos.y + wco.y,
                        z: wpos.z + wco.z,
                        a: add_opt(wpos.a, wco.a),
                        b: add_opt(wpos.b, wco.b),
                        c: add_opt(wpos.c, wco.c),
                    };
                } else {
                    self.mpos = wpos;
                }
            }
            (None, None) => {}
        }

        if let Some(feed) = report.feed_rate {
            self.feed_rate = feed;
        }
        if let Some(speed) = report.spindle_speed {
            self.spindle_speed = speed;
        }

        self.last_status = Some(report.clone());

        before != (self.state, self.raw_state.clone(), self.mpos, self.wpos)
    }

    /// Store a setting value. Returns true when the value changed.
    pub fn set_setting(&mut self, name: &str, value: &str) -> bool {
        match self.settings.get(name) {
            Some(existing) if existing == value => false,
            _ => {
                self.settings.insert(name.to_string(), value.to_string());
                true
            }
        }
    }

    /// Settings snapshot for the `controller:settings` event
    pub fn settings_snapshot(&self) -> serde_json::Value {
        json!({
            "version": self.version,
            "settings": self.settings,
        })
    }

    /// State snapshot for the `controller:state` event
    pub fn state_snapshot(&self) -> serde_json::Value {
        json!({
            "status": {
                "activeState": self.state.to_string(),
                "subState": self.raw_state,
                "mpos": self.mpos,
                "wpos": self.wpos,
                "feedrate": self.feed_rate,
                "spindle": self.spindle_speed,
            },
            "parserstate": {
                "modal": self.modals,
            },
        })
    }
}

fn add_opt(pos: Option<f64>, offset: Option<f64>) -> Option<f64> {
    match (pos, offset) {
        (Some(p), Some(o)) => Some(p + o),
        (Some(p), None) => Some(p),
        _ => None,
    }
}
