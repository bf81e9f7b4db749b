//! Named event triggers
//!
//! Bindings attach host-side actions to named controller events
//! (`gcode:start`, `feedhold`, `macro:run`, ...). A `system` binding
//! hands its command to the external task runner; a `gcode` binding
//! yields command lines the engine enqueues through the feeder.

use std::sync::Arc;
use uuid::Uuid;

/// External task runner executing host-side shell hooks.
///
/// Implemented outside the core; invocations are fire-and-forget.
pub trait TaskRunner: Send + Sync {
    /// Run a shell command on behalf of a trigger
    fn spawn(&self, event: &str, command: &str);
}

/// What a binding does when its event fires
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerAction {
    /// Run a host-side shell command through the task runner
    System {
        /// The shell command line.
        command: String,
    },
    /// Enqueue G-code through the engine's command bus
    Gcode {
        /// The command lines, newline separated.
        commands: String,
    },
}

/// A registered trigger binding
#[derive(Debug, Clone)]
pub struct TriggerBinding {
    /// Binding id
    pub id: Uuid,
    /// Event name this binding fires on
    pub event: String,
    /// Whether the binding is active
    pub enabled: bool,
    /// The action to perform
    pub action: TriggerAction,
}

/// Registry of named event triggers
#[derive(Default)]
pub struct EventTrigger {
    bindings: Vec<TriggerBinding>,
    runner: Option<Arc<dyn TaskRunner>>,
}

impl EventTrigger {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the external task runner for `system` bindings
    pub fn set_task_runner(&mut self, runner: Arc<dyn TaskRunner>) {
        self.runner = Some(runner);
    }

    /// Register a binding; returns its id
    pub fn bind(&mut self, event: impl Into<String>, action: TriggerAction) -> Uuid {
        let id = Uuid::new_v4();
        self.bindings.push(TriggerBinding {
            id,
            event: event.into(),
            enabled: true,
            action,
        });
        id
    }

    /// Remove a binding; returns true when it existed
    pub fn unbind(&mut self, id: Uuid) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|b| b.id != id);
        self.bindings.len() != before
    }

    /// Enable or disable a binding
    pub fn set_enabled(&mut self, id: Uuid, enabled: bool) -> bool {
        match self.bindings.iter_mut().find(|b| b.id == id) {
            Some(binding) => {
                binding.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Fire an event.
    ///
    /// System bindings are dispatched to the task runner immediately;
    /// the G-code lines of matching `gcode` bindings are returned for
    /// the engine to enqueue.
    pub fn fire(&self, event: &str) -> Vec<String> {
        let mut gcode_lines = Vec::new();

        for binding in self
            .bindings
            .iter()
            .filter(|b| b.enabled && b.event == event)
        {
            match &binding.action {
                TriggerAction::System { command } => match &self.runner {
                    Some(runner) => {
                        tracing::debug!("Trigger {}: system {:?}", event, command);
                        runner.spawn(event, command);
                    }
                    None => {
                        tracing::warn!("Trigger {} has no task runner attached", event);
                    }
                },
                TriggerAction::Gcode { commands } => {
                    tracing::debug!("Trigger {}: gcode", event);
                    gcode_lines.extend(
                        commands
                            .lines()
                            .map(|s| s.trim())
                            .filter(|s| !s.is_empty())
                            .map(|s| s.to_string()),
                    );
                }
            }
        }

        gcode_lines
    }
}

impl std::fmt::Debug for EventTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTrigger")
            .field("bindings", &self.bindings.len())
            .field("has_runner", &self.runner.is_some())
            .finish()
    }
}
