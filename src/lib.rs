//! Simulator debug-session harness
//!
//! This library drives an interactive gdb against a RISC-V simulator:
//! process control with prompt synchronization, simulator lifecycle, typed
//! debugger operations, and a runner for scripted scenarios.

pub mod cli;
pub mod commands;
pub mod common;
pub mod gdb;
pub mod process;
pub mod simulator;
pub mod testing;
pub mod toolchain;

// Re-export commonly used types for tests
pub use common::{Error, Result};
