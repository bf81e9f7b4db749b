//! Event system for controller communication
//!
//! Provides:
//! - The outbound event set published by the protocol engine
//! - An event dispatcher for publishing events to subscribers
//!
//! Events carry the string keys the socket fan-out layer forwards to
//! connected clients; some controller events also have a legacy mirror
//! key retained for older clients.

use crate::types::WorkflowState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Outbound events published by the protocol engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolEvent {
    /// Serial port opened
    SerialOpen {
        /// Port name.
        port: String,
    },
    /// Serial port closed
    SerialClose {
        /// Port name.
        port: String,
    },
    /// Serial transport error
    SerialError {
        /// Error description.
        message: String,
    },
    /// A line received from the device, or a decoded message surfaced
    /// upstream in its place
    SerialRead {
        /// The surfaced text.
        line: String,
    },
    /// Data written to the device
    SerialWrite {
        /// The bytes written, as text.
        data: String,
    },
    /// Port open/close state toggled
    SerialChange {
        /// True when the port is now open.
        open: bool,
    },
    /// Device settings snapshot changed
    ControllerSettings {
        /// Settings map snapshot.
        settings: serde_json::Value,
    },
    /// Device state snapshot changed
    ControllerState {
        /// Machine state snapshot.
        state: serde_json::Value,
    },
    /// Feeder queue snapshot
    FeederStatus {
        /// Queue snapshot.
        status: serde_json::Value,
    },
    /// Sender progress snapshot
    SenderStatus {
        /// Sender snapshot.
        status: serde_json::Value,
    },
    /// Workflow state transition
    WorkflowState {
        /// The new workflow state.
        state: WorkflowState,
    },
    /// A program was loaded into the sender
    GcodeLoad {
        /// Program name.
        name: String,
        /// Program text.
        gcode: String,
    },
    /// The loaded program was unloaded
    GcodeUnload,
}

impl ProtocolEvent {
    /// The event key forwarded to clients
    pub fn name(&self) -> &'static str {
        match self {
            Self::SerialOpen { .. } => "serialport:open",
            Self::SerialClose { .. } => "serialport:close",
            Self::SerialError { .. } => "serialport:error",
            Self::SerialRead { .. } => "serialport:read",
            Self::SerialWrite { .. } => "serialport:write",
            Self::SerialChange { .. } => "serialport:change",
            Self::ControllerSettings { .. } => "controller:settings",
            Self::ControllerState { .. } => "controller:state",
            Self::FeederStatus { .. } => "feeder:status",
            Self::SenderStatus { .. } => "sender:status",
            Self::WorkflowState { .. } => "workflow:state",
            Self::GcodeLoad { .. } => "gcode:load",
            Self::GcodeUnload => "gcode:unload",
        }
    }

    /// Legacy mirror key, for clients predating the `controller:*` keys
    pub fn legacy_name(&self) -> Option<&'static str> {
        match self {
            Self::ControllerSettings { .. } => Some("Grbl:settings"),
            Self::ControllerState { .. } => Some("Grbl:state"),
            _ => None,
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<ProtocolEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers.
    ///
    /// Publishing with no subscribers is not an error; the engine does
    /// not depend on anyone listening.
    pub fn publish(&self, event: ProtocolEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event published with no subscribers");
        }
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
