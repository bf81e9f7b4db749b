//! Error handling for GrblKit
//!
//! Provides error types for the two layers of the controller core:
//! - Controller errors (workflow/command/state machine related)
//! - Connection errors (serial transport related)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Controller error type
///
/// Represents errors raised by the protocol engine itself: precondition
/// violations, unknown command keys, and queue misuse.
#[derive(Error, Debug, Clone)]
pub enum ControllerError {
    /// The serial port is not open
    #[error("Port is not open")]
    NotOpen,

    /// The serial port is already open
    #[error("Port is already open")]
    AlreadyOpen,

    /// Command key not recognized by the command bus
    #[error("Unknown command: {name}")]
    UnknownCommand {
        /// The command key that was not recognized.
        name: String,
    },

    /// Command arguments did not match the expected shape
    #[error("Invalid arguments for {name}: {reason}")]
    InvalidArguments {
        /// The command key.
        name: String,
        /// Why the arguments were rejected.
        reason: String,
    },

    /// Invalid workflow state transition
    #[error("Invalid workflow transition from {current} to {requested}")]
    InvalidStateTransition {
        /// The current workflow state name.
        current: String,
        /// The requested workflow state name.
        requested: String,
    },

    /// Acknowledgment arrived with no line in flight
    #[error("Acknowledgment with no line in flight")]
    NothingInFlight,

    /// An empty program was loaded
    #[error("No G-code program to load")]
    EmptyProgram,

    /// Macro or program lookup failed
    #[error("Not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// Generic controller error
    #[error("Controller error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// Connection error type
///
/// Represents errors in the serial transport below the protocol engine.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Write failed on an open port
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// The reason the write failed.
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {reason}")]
    IoError {
        /// The reason for the I/O error.
        reason: String,
    },
}

/// Main error type for GrblKit
///
/// A unified error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a controller error
    pub fn is_controller_error(&self) -> bool {
        matches!(self, Error::Controller(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
