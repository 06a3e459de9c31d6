//! Administrative control path: command decoding and the lifecycle state machine.

pub mod channel;
pub mod command;

pub use channel::{ControlChannel, LifecycleState};
pub use command::{Command, CommandCode};
