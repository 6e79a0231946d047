//! YAML scenario types
//!
//! A YAML scenario names a debuggee and lists debugger steps with optional
//! expectations. Numeric fields accept integers or strings (`0x1000`,
//! `"-1"`), parsed the same way gdb values are.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer};

use crate::gdb::{parse_integer, Unit};

/// A complete scenario loaded from a YAML file
#[derive(Deserialize, Debug)]
pub struct TestScenario {
    /// Name of the scenario
    pub name: String,
    /// Optional description of what the scenario verifies
    pub description: Option<String>,
    /// Optional shell commands to run first (relative to the scenario file)
    pub setup: Option<Vec<SetupStep>>,
    /// The debuggee
    pub target: TargetConfig,
    /// The sequence of steps to execute
    pub steps: Vec<TestStep>,
}

/// A setup step that runs before the sessions are acquired
#[derive(Deserialize, Debug)]
pub struct SetupStep {
    /// Shell command to execute
    pub shell: String,
}

/// The debuggee: either sources to compile or a prebuilt image
#[derive(Deserialize, Debug)]
pub struct TargetConfig {
    /// Sources handed to the cross compiler, relative to the targets directory
    #[serde(default, alias = "source", deserialize_with = "one_or_many")]
    pub sources: Vec<PathBuf>,
    /// Prebuilt image, relative to the scenario file
    pub image: Option<PathBuf>,
    /// Start the simulator halted at the reset vector
    #[serde(default)]
    pub halted: bool,
}

/// A single step in the execution flow
#[derive(Deserialize, Debug)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TestStep {
    /// Send a raw debugger command
    Command {
        command: String,
        expect: Option<OutputExpectation>,
    },
    /// Evaluate an expression to an integer (`p <expr>`)
    Evaluate {
        expression: String,
        expect: Option<ValueExpectation>,
    },
    /// Assign a register and check the value read back
    WriteRegister {
        register: String,
        #[serde(deserialize_with = "integer")]
        value: u64,
    },
    /// Read one unit of memory
    Examine {
        address: String,
        #[serde(default = "default_unit")]
        unit: Unit,
        expect: Option<ValueExpectation>,
    },
    /// Single-step one or more instructions
    Stepi {
        #[serde(default = "default_count")]
        count: usize,
        /// Require `$pc` to change on every step
        #[serde(default)]
        expect_progress: bool,
    },
    /// Set a breakpoint
    Break { location: String },
    /// Resume the debuggee
    Continue {
        /// Wait for the stop (default), or leave it running for an `interrupt`
        #[serde(default = "default_true")]
        blocking: bool,
        expect: Option<StopExpectation>,
    },
    /// Interrupt a running debuggee, after an optional delay
    Interrupt {
        #[serde(default)]
        delay_ms: u64,
        expect: Option<StopExpectation>,
    },
    /// Download the image into the target
    Load,
    /// Pause without talking to the debugger
    Sleep { ms: u64 },
}

/// Expectations for a raw command's output
#[derive(Deserialize, Debug, Default)]
pub struct OutputExpectation {
    /// Whether the reply should be free of error messages (default: true)
    pub success: Option<bool>,
    /// Substrings that must appear
    #[serde(default)]
    pub contains: Vec<String>,
    /// Substrings that must not appear
    #[serde(default)]
    pub not_contains: Vec<String>,
}

/// Expectations for an integer result
#[derive(Deserialize, Debug, Default)]
pub struct ValueExpectation {
    /// Whether the evaluation should succeed (default: true)
    /// Set to false to test error replies (unknown symbols, bad syntax)
    pub success: Option<bool>,
    #[serde(default, deserialize_with = "optional_integer")]
    pub equals: Option<u64>,
    #[serde(default, deserialize_with = "optional_integer")]
    pub not_equals: Option<u64>,
    #[serde(default, deserialize_with = "optional_integer")]
    pub less_than: Option<u64>,
}

/// Expectations for a continue or interrupt reply
#[derive(Deserialize, Debug, Default)]
pub struct StopExpectation {
    /// Expected stop: "breakpoint", "signal", "connection_closed", "exited"
    pub reason: Option<String>,
    /// Substrings that must appear in the reply
    #[serde(default)]
    pub contains: Vec<String>,
    /// Exact number of breakpoint-hit reports in the reply
    pub breakpoint_hits: Option<usize>,
}

fn default_unit() -> Unit {
    Unit::Word
}

fn default_count() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Text(String),
}

impl IntOrString {
    fn resolve<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            IntOrString::Int(n) => Ok(n as u64),
            IntOrString::Text(s) => parse_integer(&s)
                .ok_or_else(|| E::custom(format!("not an integer: '{}'", s))),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<PathBuf>, D::Error> {
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(path) => vec![path],
        OneOrMany::Many(paths) => paths,
    })
}

fn integer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    IntOrString::deserialize(deserializer)?.resolve()
}

fn optional_integer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Option::<IntOrString>::deserialize(deserializer)?
        .map(IntOrString::resolve)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario() {
        let yaml = r#"
name: halted reset
description: pc starts at the reset vector
target:
  source: debug.c
  halted: true
steps:
  - action: evaluate
    expression: $pc
    expect:
      equals: "0x1000"
  - action: stepi
    count: 3
    expect_progress: true
  - action: write_register
    register: a0
    value: 0xdeadbeef
  - action: examine
    address: data+8
    unit: g
  - action: continue
    blocking: false
  - action: interrupt
    delay_ms: 100
    expect:
      reason: signal
  - action: load
  - action: sleep
    ms: 5
"#;
        let scenario: TestScenario = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(scenario.name, "halted reset");
        assert_eq!(scenario.target.sources, vec![PathBuf::from("debug.c")]);
        assert!(scenario.target.halted);
        assert_eq!(scenario.steps.len(), 8);

        match &scenario.steps[0] {
            TestStep::Evaluate { expect, .. } => {
                assert_eq!(expect.as_ref().unwrap().equals, Some(0x1000));
            }
            other => panic!("Expected Evaluate, got {other:?}"),
        }
        assert!(matches!(
            scenario.steps[1],
            TestStep::Stepi { count: 3, expect_progress: true }
        ));
        assert!(matches!(
            scenario.steps[2],
            TestStep::WriteRegister { value: 0xdeadbeef, .. }
        ));
        assert!(matches!(
            scenario.steps[3],
            TestStep::Examine { unit: Unit::Giant, .. }
        ));
        assert!(matches!(scenario.steps[4], TestStep::Continue { blocking: false, .. }));
        assert!(matches!(scenario.steps[6], TestStep::Load));
    }

    #[test]
    fn test_defaults() {
        let yaml = r#"
name: minimal
target:
  image: ./prebuilt.elf
steps:
  - action: stepi
  - action: continue
"#;
        let scenario: TestScenario = serde_yaml::from_str(yaml).unwrap();
        assert!(scenario.target.sources.is_empty());
        assert!(!scenario.target.halted);
        assert!(matches!(
            scenario.steps[0],
            TestStep::Stepi { count: 1, expect_progress: false }
        ));
        assert!(matches!(scenario.steps[1], TestStep::Continue { blocking: true, expect: None }));
    }

    #[test]
    fn test_rejects_bad_integer() {
        let yaml = r#"
name: bad
target: {}
steps:
  - action: write_register
    register: a0
    value: "lots"
"#;
        assert!(serde_yaml::from_str::<TestScenario>(yaml).is_err());
    }
}
