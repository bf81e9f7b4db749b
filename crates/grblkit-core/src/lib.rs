//! # GrblKit Core
//!
//! Core types, errors, and events for GrblKit.
//! Provides the fundamental abstractions shared by the protocol engine
//! and the front-end layers: the error taxonomy, the outbound event set,
//! machine/workflow state types, and the async controller interface.

pub mod controller;
pub mod error;
pub mod event;
pub mod types;

pub use controller::Controller;
pub use error::{ConnectionError, ControllerError, Error, Result};
pub use event::{EventDispatcher, ProtocolEvent};
pub use types::{MachineState, Position, WorkflowState};
