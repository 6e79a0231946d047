//! Interactive process control
//!
//! A generic wrapper around a prompt-driven child process: send a line,
//! wait for a pattern, keep a complete transcript.

mod controller;
mod transcript;

pub use controller::{ChildStatus, ControllerState, InteractiveProcess, Interrupter, Match};
pub use transcript::Transcript;
