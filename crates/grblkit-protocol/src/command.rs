//! Command bus
//!
//! The engine's public command set, both as a typed enum and as the
//! string-keyed form the socket layer dispatches with JSON arguments.
//! Legacy `start/stop/pause/resume` keys forward to their `gcode:*`
//! forms with a deprecation warning.

use grblkit_core::ControllerError;
use serde_json::Value;

/// A command accepted by the protocol engine
#[derive(Debug, Clone, PartialEq)]
pub enum GrblCommand {
    /// Load a program into the sender
    GcodeLoad {
        /// Program name.
        name: String,
        /// Program text.
        gcode: String,
        /// Evaluation context (bounding box and friends).
        context: Value,
    },
    /// Unload the program
    GcodeUnload,
    /// Start streaming the loaded program
    GcodeStart,
    /// Stop the program
    GcodeStop {
        /// Force-stop: feed hold, then soft reset once holding.
        force: bool,
    },
    /// Pause the running program
    GcodePause,
    /// Resume the paused program
    GcodeResume,
    /// Feed ad-hoc lines through the feeder
    Gcode {
        /// The lines to feed.
        lines: Vec<String>,
        /// Evaluation context.
        context: Value,
    },
    /// Release the feeder hold and continue
    FeederStart,
    /// Hold the feeder
    FeederPause,
    /// Drop the feeder queue
    FeederStop,
    /// Realtime feed hold (`!`)
    Feedhold,
    /// Realtime cycle start (`~`)
    Cyclestart,
    /// Request a status report the caller wants forwarded
    StatusReport,
    /// Run the homing cycle (`$H`)
    Homing,
    /// Enter sleep mode (`$SLP`)
    Sleep,
    /// Clear an alarm lockout (`$X`)
    Unlock,
    /// Soft reset (`0x18`)
    Reset,
    /// Feed override step: 0 resets to 100%, +-10 coarse, +-1 fine
    FeedOverride {
        /// Step value.
        value: i32,
    },
    /// Spindle override step, same encoding as feed
    SpindleOverride {
        /// Step value.
        value: i32,
    },
    /// Rapid override: 100 (or 0), 50, or 25 percent
    RapidOverride {
        /// Target percentage.
        value: i32,
    },
    /// Fire the laser at a test power level
    LaserTestOn {
        /// Power percentage.
        power: f64,
        /// Pulse duration in milliseconds; 0 leaves the laser on.
        duration: u64,
        /// The S-word value corresponding to 100% power.
        max_s: f64,
    },
    /// Turn the laser test off
    LaserTestOff,
    /// Feed a stored macro through the feeder
    MacroRun {
        /// Macro id.
        id: String,
        /// Evaluation context.
        context: Value,
    },
    /// Load a stored macro into the sender
    MacroLoad {
        /// Macro id.
        id: String,
        /// Evaluation context.
        context: Value,
    },
    /// Load a program file from the watched directory
    WatchDirLoad {
        /// Path relative to the watched directory.
        path: String,
    },
}

fn positional(args: &Value, index: usize) -> Option<&Value> {
    match args {
        Value::Array(items) => items.get(index),
        Value::Null => None,
        other if index == 0 => Some(other),
        _ => None,
    }
}

fn string_arg(args: &Value, index: usize) -> Option<String> {
    positional(args, index)?.as_str().map(|s| s.to_string())
}

fn number_arg(args: &Value, index: usize) -> Option<f64> {
    positional(args, index)?.as_f64()
}

fn context_arg(args: &Value, index: usize) -> Value {
    positional(args, index).cloned().unwrap_or(Value::Null)
}

fn lines_arg(args: &Value, index: usize) -> Option<Vec<String>> {
    match positional(args, index)? {
        Value::String(text) => Some(
            text.split('\n')
                .map(|s| s.trim_end_matches('\r').to_string())
                .filter(|s| !s.trim().is_empty())
                .collect(),
        ),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .filter(|s| !s.trim().is_empty())
                .collect(),
        ),
        _ => None,
    }
}

fn invalid(name: &str, reason: &str) -> ControllerError {
    ControllerError::InvalidArguments {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a string-keyed command with JSON arguments.
///
/// Arguments are positional, matching the socket API: a JSON array, or
/// a bare value standing in for the first argument.
pub fn parse_command(name: &str, args: &Value) -> Result<GrblCommand, ControllerError> {
    let name = match name {
        "start" | "stop" | "pause" | "resume" => {
            tracing::warn!("{0} is deprecated, use gcode:{0} instead", name);
            match name {
                "start" => "gcode:start",
                "stop" => "gcode:stop",
                "pause" => "gcode:pause",
                _ => "gcode:resume",
            }
        }
        other => other,
    };

    match name {
        "gcode:load" => Ok(GrblCommand::GcodeLoad {
            name: string_arg(args, 0).ok_or_else(|| invalid(name, "missing name"))?,
            gcode: string_arg(args, 1).ok_or_else(|| invalid(name, "missing gcode"))?,
            context: context_arg(args, 2),
        }),
        "gcode:unload" => Ok(GrblCommand::GcodeUnload),
        "gcode:start" => Ok(GrblCommand::GcodeStart),
        "gcode:stop" => {
            let force = positional(args, 0)
                .and_then(|v| v.get("force"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Ok(GrblCommand::GcodeStop { force })
        }
        "gcode:pause" => Ok(GrblCommand::GcodePause),
        "gcode:resume" => Ok(GrblCommand::GcodeResume),
        "gcode" | "feeder:feed" => Ok(GrblCommand::Gcode {
            lines: lines_arg(args, 0).ok_or_else(|| invalid(name, "missing lines"))?,
            context: context_arg(args, 1),
        }),
        "feeder:start" => Ok(GrblCommand::FeederStart),
        "feeder:pause" => Ok(GrblCommand::FeederPause),
        "feeder:stop" => Ok(GrblCommand::FeederStop),
        "feedhold" => Ok(GrblCommand::Feedhold),
        "cyclestart" => Ok(GrblCommand::Cyclestart),
        "statusreport" => Ok(GrblCommand::StatusReport),
        "homing" => Ok(GrblCommand::Homing),
        "sleep" => Ok(GrblCommand::Sleep),
        "unlock" => Ok(GrblCommand::Unlock),
        "reset" => Ok(GrblCommand::Reset),
        "feedOverride" => Ok(GrblCommand::FeedOverride {
            value: number_arg(args, 0).ok_or_else(|| invalid(name, "missing value"))? as i32,
        }),
        "spindleOverride" => Ok(GrblCommand::SpindleOverride {
            value: number_arg(args, 0).ok_or_else(|| invalid(name, "missing value"))? as i32,
        }),
        "rapidOverride" => Ok(GrblCommand::RapidOverride {
            value: number_arg(args, 0).ok_or_else(|| invalid(name, "missing value"))? as i32,
        }),
        "lasertest:on" => Ok(GrblCommand::LaserTestOn {
            power: number_arg(args, 0).unwrap_or(0.0),
            duration: number_arg(args, 1).unwrap_or(0.0).max(0.0) as u64,
            max_s: number_arg(args, 2).unwrap_or(1000.0),
        }),
        "lasertest:off" => Ok(GrblCommand::LaserTestOff),
        "macro:run" => Ok(GrblCommand::MacroRun {
            id: string_arg(args, 0).ok_or_else(|| invalid(name, "missing id"))?,
            context: context_arg(args, 1),
        }),
        "macro:load" => Ok(GrblCommand::MacroLoad {
            id: string_arg(args, 0).ok_or_else(|| invalid(name, "missing id"))?,
            context: context_arg(args, 1),
        }),
        "watchdir:load" => Ok(GrblCommand::WatchDirLoad {
            path: string_arg(args, 0).ok_or_else(|| invalid(name, "missing path"))?,
        }),
        other => Err(ControllerError::UnknownCommand {
            name: other.to_string(),
        }),
    }
}
