//! Controller interface
//!
//! Defines the async trait a firmware driver implements toward the
//! front-end layers (socket fan-out, CLI). The protocol engine itself is
//! synchronous; a driver wraps it in a task and exposes this interface.

use crate::event::ProtocolEvent;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Interface of a connected firmware driver
#[async_trait]
pub trait Controller: Send + Sync {
    /// Firmware family name (e.g. "Grbl")
    fn controller_type(&self) -> &str;

    /// Whether the serial port is currently open
    fn is_open(&self) -> bool;

    /// Open the port and start the protocol engine
    async fn open(&mut self) -> anyhow::Result<()>;

    /// Close the port and stop the engine
    async fn close(&mut self) -> anyhow::Result<()>;

    /// Dispatch a string-keyed command with JSON arguments
    async fn command(&mut self, name: &str, args: serde_json::Value) -> anyhow::Result<()>;

    /// Write a raw line to the device through the engine's write hook
    async fn write(&mut self, data: &str) -> anyhow::Result<()>;

    /// Subscribe to outbound protocol events
    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent>;
}
