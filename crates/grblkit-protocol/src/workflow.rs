//! Workflow state machine
//!
//! Three states: Idle, Running, Paused. Legal transitions are
//! Idle -> Running (start), Running -> Paused (pause), Paused -> Running
//! (resume), and any state -> Idle (stop). The machine tracks state
//! only; the engine performs the side effects (rewinding the sender,
//! holding queues, emitting events) around each transition.

use crate::preprocessor::HoldReason;
use grblkit_core::WorkflowState;

/// Workflow state with an optional transition reason
#[derive(Debug, Default)]
pub struct Workflow {
    state: WorkflowState,
    context: Option<HoldReason>,
}

impl Workflow {
    /// Create a workflow in the Idle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Reason payload of the last transition, if any
    pub fn context(&self) -> Option<&HoldReason> {
        self.context.as_ref()
    }

    /// Idle -> Running. Returns false on an illegal transition.
    pub fn start(&mut self) -> bool {
        if self.state != WorkflowState::Idle {
            tracing::warn!("Ignoring workflow start from {}", self.state);
            return false;
        }
        self.state = WorkflowState::Running;
        self.context = None;
        true
    }

    /// Running -> Paused. Returns false on an illegal transition.
    pub fn pause(&mut self, reason: Option<HoldReason>) -> bool {
        if self.state != WorkflowState::Running {
            tracing::warn!("Ignoring workflow pause from {}", self.state);
            return false;
        }
        self.state = WorkflowState::Paused;
        self.context = reason;
        true
    }

    /// Paused -> Running. Returns false on an illegal transition.
    pub fn resume(&mut self) -> bool {
        if self.state != WorkflowState::Paused {
            tracing::warn!("Ignoring workflow resume from {}", self.state);
            return false;
        }
        self.state = WorkflowState::Running;
        self.context = None;
        true
    }

    /// Any -> Idle. Returns false when already Idle.
    pub fn stop(&mut self) -> bool {
        if self.state == WorkflowState::Idle {
            return false;
        }
        self.state = WorkflowState::Idle;
        self.context = None;
        true
    }
}
