//! Error types for the debug-session harness
//!
//! The variants mirror the failure taxonomy of a scenario: launching a
//! subprocess, attaching to the simulator, waiting for a prompt, decoding a
//! reply, and asserting on the decoded value. None of them are retried;
//! they propagate to the scenario runner, which fails the scenario and
//! proceeds to teardown.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Subprocess Errors ===
    #[error("Failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    #[error("Required binary '{name}' not found. Searched: {searched}")]
    BinaryNotFound { name: String, searched: String },

    #[error("Process exited while waiting for {pattern:?} (status: {status})")]
    ProcessExited { pattern: String, status: String },

    // === Synchronization Errors ===
    #[error("Timed out after {secs:.1}s waiting for {pattern:?}")]
    Timeout { pattern: String, secs: f64 },

    #[error("Cannot {action} while session is {state}")]
    InvalidState { action: String, state: String },

    // === Debugger Reply Errors ===
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Could not parse reply to '{command}': {reply:?}")]
    Parse { command: String, reply: String },

    #[error("Debugger reported failure for '{command}': {message}")]
    Protocol { command: String, message: String },

    // === Scenario Errors ===
    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Compilation failed for {output}: {stderr}")]
    Compile { output: String, stderr: String },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a launch error
    pub fn launch(program: &str, reason: impl Into<String>) -> Self {
        Self::Launch {
            program: program.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a binary not found error with search paths
    pub fn binary_not_found<S: AsRef<str>>(name: &str, paths: &[S]) -> Self {
        Self::BinaryNotFound {
            name: name.to_string(),
            searched: paths.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(", "),
        }
    }

    /// Create a connect error
    pub fn connect(endpoint: impl ToString, reason: impl Into<String>) -> Self {
        Self::Connect {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a parse error
    pub fn parse(command: &str, reply: &str) -> Self {
        Self::Parse {
            command: command.to_string(),
            reply: reply.to_string(),
        }
    }

    /// Create a protocol error
    pub fn protocol(command: &str, message: impl Into<String>) -> Self {
        Self::Protocol {
            command: command.to_string(),
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(action: &str, state: impl ToString) -> Self {
        Self::InvalidState {
            action: action.to_string(),
            state: state.to_string(),
        }
    }

    /// Whether this error leaves the interactive child out of sync with
    /// the harness (a reply may still be in flight)
    pub fn desynchronizes(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::ProcessExited { .. })
    }

    /// Short stable code used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Launch { .. } => "LAUNCH",
            Error::BinaryNotFound { .. } => "BINARY_NOT_FOUND",
            Error::ProcessExited { .. } => "PROCESS_EXITED",
            Error::Timeout { .. } => "TIMEOUT",
            Error::InvalidState { .. } => "INVALID_STATE",
            Error::Connect { .. } => "CONNECT",
            Error::Parse { .. } => "PARSE",
            Error::Protocol { .. } => "PROTOCOL",
            Error::Assertion(_) => "ASSERTION",
            Error::Compile { .. } => "COMPILE",
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG",
            Error::Io(_) | Error::FileRead { .. } => "IO",
            Error::Json(_) => "INTERNAL",
        }
    }
}
