//! Shared data types for controller state
//!
//! Provides the machine-state and position types used across the
//! protocol engine and exported to event consumers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Active machine state as reported by Grbl status reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MachineState {
    /// Machine is idle and ready for commands
    #[default]
    Idle,
    /// Machine is executing motion
    Run,
    /// Feed hold is active
    Hold,
    /// Jog motion in progress
    Jog,
    /// Alarm state, machine is locked out
    Alarm,
    /// Safety door is open
    Door,
    /// Check mode (dry run) is active
    Check,
    /// Homing cycle in progress
    Home,
    /// Sleep mode
    Sleep,
}

impl MachineState {
    /// Parse a machine state token from a status report.
    ///
    /// Grbl v1.1 appends sub-state codes to some states (`Hold:0`,
    /// `Door:1`); only the prefix selects the state.
    pub fn parse(token: &str) -> Option<Self> {
        let prefix = token.split(':').next().unwrap_or(token);
        match prefix {
            "Idle" => Some(Self::Idle),
            "Run" => Some(Self::Run),
            "Hold" => Some(Self::Hold),
            "Jog" => Some(Self::Jog),
            "Alarm" => Some(Self::Alarm),
            "Door" => Some(Self::Door),
            "Check" => Some(Self::Check),
            "Home" => Some(Self::Home),
            "Sleep" => Some(Self::Sleep),
            _ => None,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Run => "Run",
            Self::Hold => "Hold",
            Self::Jog => "Jog",
            Self::Alarm => "Alarm",
            Self::Door => "Door",
            Self::Check => "Check",
            Self::Home => "Home",
            Self::Sleep => "Sleep",
        };
        write!(f, "{}", s)
    }
}

/// A six-axis position in millimeters
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X axis
    pub x: f64,
    /// Y axis
    pub y: f64,
    /// Z axis
    pub z: f64,
    /// A axis (4th axis), if reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a: Option<f64>,
    /// B axis (5th axis), if reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b: Option<f64>,
    /// C axis (6th axis), if reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<f64>,
}

impl Position {
    /// Parse a comma-separated coordinate list (`x,y,z[,a[,b[,c]]]`)
    pub fn parse(pos_str: &str) -> Option<Self> {
        let coords: Vec<f64> = pos_str
            .split(',')
            .filter_map(|s| s.trim().parse::<f64>().ok())
            .collect();

        if coords.len() < 3 {
            return None;
        }

        Some(Self {
            x: coords[0],
            y: coords[1],
            z: coords[2],
            a: coords.get(3).copied(),
            b: coords.get(4).copied(),
            c: coords.get(5).copied(),
        })
    }

    /// Component-wise subtraction, used to derive WPos = MPos - WCO
    pub fn sub(&self, other: &Position) -> Position {
        Position {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
            a: sub_opt(self.a, other.a),
            b: sub_opt(self.b, other.b),
            c: sub_opt(self.c, other.c),
        }
    }
}

fn sub_opt(pos: Option<f64>, offset: Option<f64>) -> Option<f64> {
    match (pos, offset) {
        (Some(p), Some(o)) => Some(p - o),
        (Some(p), None) => Some(p),
        _ => None,
    }
}

/// High-level workflow state of a loaded program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    /// No program running
    #[default]
    Idle,
    /// Program is streaming
    Running,
    /// Program is paused
    Paused,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}
