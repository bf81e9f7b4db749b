//! # GrblKit Protocol
//!
//! The protocol engine for Grbl-compatible CNC controllers: streams
//! G-code under the character-counting flow-control discipline, parses
//! the device's asynchronous response stream, coordinates the
//! Idle/Running/Paused workflow with its two injection channels (the
//! feeder for one-off commands, the sender for loaded programs), and
//! runs the periodic status and parser-state queries.

pub mod command;
pub mod driver;
pub mod engine;
pub mod evaluator;
pub mod feeder;
pub mod grbl;
pub mod preprocessor;
pub mod sender;
pub mod transport;
pub mod trigger;
pub mod workflow;

pub use command::GrblCommand;
pub use driver::GrblDriver;
pub use engine::{MacroRecord, MacroStore, ProgramSource, ProtocolEngine, TICK_INTERVAL};
pub use evaluator::ExecutionContext;
pub use feeder::{Feeder, FeederStatus};
pub use grbl::{GrblMachine, GrblResponse, StatusReport};
pub use preprocessor::{FilterAction, FilterOutcome, HoldReason};
pub use sender::{Sender, SenderStatus, DEFAULT_BUFFER_SIZE};
pub use transport::{list_ports, ConnectionParams, SerialPortInfo, SerialTransport, Transport};
pub use trigger::{EventTrigger, TaskRunner, TriggerAction};
pub use workflow::Workflow;
