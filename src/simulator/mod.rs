//! Simulator session: the device under test

mod session;

pub use session::{build_args, parse_port, Endpoint, SimulatorSession, StartMode};
