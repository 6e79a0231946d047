//! Scenario runner
//!
//! Scenarios are fixed scripts of debugger operations with assertions,
//! either built in ([`suite`]) or loaded from YAML ([`yaml`]). The
//! [`Harness`] runs them one at a time against fresh sessions.

pub mod check;
mod config;
pub mod download;
mod runner;
mod scenario;
pub mod suite;
mod yaml;

pub use config::*;
pub use runner::{Harness, Preflight, ScenarioReport, ScenarioState, SuiteReport};
pub use scenario::{compile_target, Scenario, Target};
pub use yaml::{load_scenario, YamlScenario};
