//! Decoding of the debugger's textual replies
//!
//! The prompt, reply shapes and failure markers form a versioned text
//! contract. [`ReplyContract`] holds them as configuration with gdb's
//! defaults; [`ReplyParser`] compiles it once per session. Nothing outside
//! this module inspects reply text for structure.

use regex::Regex;
use serde::Deserialize;

use crate::common::{Error, Result};

/// Textual contract of the interactive debugger
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyContract {
    /// Prompt printed after every completed command
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// The tool echoes each command line before replying (terminal mode)
    #[serde(default)]
    pub echo: bool,

    /// Print reply; the `value` group holds the printed value
    #[serde(default = "default_value_pattern")]
    pub value_pattern: String,

    /// Examine reply; the `value` group holds the first unit
    #[serde(default = "default_examine_pattern")]
    pub examine_pattern: String,

    /// Breakpoint creation; the `label` group holds the tool's number
    #[serde(default = "default_breakpoint_created")]
    pub breakpoint_created: String,

    /// Breakpoint hit during a continue
    #[serde(default = "default_breakpoint_hit")]
    pub breakpoint_hit: String,

    /// Signal stop; the `signal` group holds the signal name
    #[serde(default = "default_signal_received")]
    pub signal_received: String,

    #[serde(default = "default_continuing")]
    pub continuing: String,

    #[serde(default = "default_connection_closed")]
    pub connection_closed: String,

    /// Markers of a debuggee that exited normally
    #[serde(default = "default_exit_markers")]
    pub exit_markers: Vec<String>,

    /// Marker of a completed `load`
    #[serde(default = "default_transfer_complete")]
    pub transfer_complete: String,

    /// Markers of an unreadable symbol file
    #[serde(default = "default_file_errors")]
    pub file_errors: Vec<String>,

    /// Markers of a refused or failed remote attach
    #[serde(default = "default_connect_errors")]
    pub connect_errors: Vec<String>,

    /// Markers of a rejected execution command
    #[serde(default = "default_command_errors")]
    pub command_errors: Vec<String>,
}

impl Default for ReplyContract {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
            echo: false,
            value_pattern: default_value_pattern(),
            examine_pattern: default_examine_pattern(),
            breakpoint_created: default_breakpoint_created(),
            breakpoint_hit: default_breakpoint_hit(),
            signal_received: default_signal_received(),
            continuing: default_continuing(),
            connection_closed: default_connection_closed(),
            exit_markers: default_exit_markers(),
            transfer_complete: default_transfer_complete(),
            file_errors: default_file_errors(),
            connect_errors: default_connect_errors(),
            command_errors: default_command_errors(),
        }
    }
}

fn default_prompt() -> String {
    "(gdb) ".to_string()
}
fn default_value_pattern() -> String {
    r"(?m)^\$\d+ = (?P<value>.+)$".to_string()
}
fn default_examine_pattern() -> String {
    r"(?m)^0x[0-9a-fA-F]+(?:\s+<[^>]*>)?:\s*(?P<value>\S+)".to_string()
}
fn default_breakpoint_created() -> String {
    r"Breakpoint (?P<label>\d+) at".to_string()
}
fn default_breakpoint_hit() -> String {
    r"Breakpoint (?P<label>\d+),".to_string()
}
fn default_signal_received() -> String {
    r"Program received signal (?P<signal>\w+)".to_string()
}
fn default_continuing() -> String {
    "Continuing".to_string()
}
fn default_connection_closed() -> String {
    "Remote connection closed".to_string()
}
fn default_exit_markers() -> Vec<String> {
    vec!["exited normally".to_string(), "exited with code".to_string()]
}
fn default_transfer_complete() -> String {
    "Transfer rate".to_string()
}
fn default_file_errors() -> Vec<String> {
    vec![
        "No such file or directory".to_string(),
        "not in executable format".to_string(),
    ]
}
fn default_connect_errors() -> Vec<String> {
    vec![
        "Connection refused".to_string(),
        "Connection timed out".to_string(),
        "Remote communication error".to_string(),
        "Remote replied unexpectedly".to_string(),
    ]
}
fn default_command_errors() -> Vec<String> {
    vec![
        "The program is not being run".to_string(),
        "Cannot execute this command".to_string(),
        "Remote failure reply".to_string(),
    ]
}

/// Memory unit for an examine command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    #[serde(alias = "b")]
    Byte,
    #[serde(alias = "h")]
    Half,
    #[serde(alias = "w")]
    Word,
    #[serde(alias = "g")]
    Giant,
}

impl Unit {
    /// Size letter used in `x/<n><unit>`
    pub fn letter(self) -> char {
        match self {
            Unit::Byte => 'b',
            Unit::Half => 'h',
            Unit::Word => 'w',
            Unit::Giant => 'g',
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Unit::Byte => 1,
            Unit::Half => 2,
            Unit::Word => 4,
            Unit::Giant => 8,
        }
    }
}

/// Why a continue or interrupt returned to the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    Breakpoint { label: String },
    Signal { name: String },
    ConnectionClosed,
    Exited,
    Unknown,
}

/// A breakpoint as reported by the debugger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// The tool's own number, kept opaque
    pub label: String,
    pub location: String,
}

/// Compiled form of a [`ReplyContract`]
#[derive(Debug, Clone)]
pub struct ReplyParser {
    contract: ReplyContract,
    prompt: regex::bytes::Regex,
    value: Regex,
    examine: Regex,
    breakpoint_created: Regex,
    breakpoint_hit: Regex,
    signal_received: Regex,
}

fn compile(name: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("Invalid contract.{}: {}", name, e)))
}

impl ReplyParser {
    pub fn new(contract: ReplyContract) -> Result<Self> {
        let prompt = regex::bytes::Regex::new(&regex::escape(&contract.prompt))
            .map_err(|e| Error::Config(format!("Invalid contract.prompt: {}", e)))?;
        Ok(Self {
            prompt,
            value: compile("value_pattern", &contract.value_pattern)?,
            examine: compile("examine_pattern", &contract.examine_pattern)?,
            breakpoint_created: compile("breakpoint_created", &contract.breakpoint_created)?,
            breakpoint_hit: compile("breakpoint_hit", &contract.breakpoint_hit)?,
            signal_received: compile("signal_received", &contract.signal_received)?,
            contract,
        })
    }

    /// Pattern that synchronizes on the prompt
    pub fn prompt(&self) -> &regex::bytes::Regex {
        &self.prompt
    }

    /// Reply text with the echoed command line removed
    pub fn body<'a>(&self, reply: &'a str) -> &'a str {
        let reply = if self.contract.echo {
            reply.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
        } else {
            reply
        };
        reply.trim()
    }

    /// Decode `$N = <value>` into an integer
    pub fn parse_value(&self, command: &str, reply: &str) -> Result<u64> {
        self.value
            .captures(reply)
            .and_then(|caps| caps.name("value"))
            .and_then(|m| parse_integer(m.as_str()))
            .ok_or_else(|| Error::parse(command, reply))
    }

    /// Decode `<addr>: <value>` into an integer
    pub fn parse_examine(&self, command: &str, reply: &str) -> Result<u64> {
        self.examine
            .captures(reply)
            .and_then(|caps| caps.name("value"))
            .and_then(|m| parse_integer(m.as_str()))
            .ok_or_else(|| Error::parse(command, reply))
    }

    /// Extract the number the tool assigned to a new breakpoint
    pub fn parse_breakpoint(&self, location: &str, reply: &str) -> Option<Breakpoint> {
        self.breakpoint_created
            .captures(reply)
            .and_then(|caps| caps.name("label"))
            .map(|m| Breakpoint {
                label: m.as_str().to_string(),
                location: location.to_string(),
            })
    }

    /// How many times breakpoint `label` was reported hit in `reply`
    pub fn breakpoint_hits(&self, reply: &str, label: &str) -> usize {
        self.breakpoint_hit
            .captures_iter(reply)
            .filter(|caps| caps.name("label").map(|m| m.as_str()) == Some(label))
            .count()
    }

    /// Classify the stop reported by a continue or interrupt reply
    pub fn classify_stop(&self, reply: &str) -> StopEvent {
        if let Some(label) = self
            .breakpoint_hit
            .captures(reply)
            .and_then(|caps| caps.name("label"))
        {
            return StopEvent::Breakpoint {
                label: label.as_str().to_string(),
            };
        }
        if let Some(name) = self
            .signal_received
            .captures(reply)
            .and_then(|caps| caps.name("signal"))
        {
            return StopEvent::Signal {
                name: name.as_str().to_string(),
            };
        }
        if reply.contains(&self.contract.connection_closed) {
            return StopEvent::ConnectionClosed;
        }
        if self.contract.exit_markers.iter().any(|m| reply.contains(m.as_str())) {
            return StopEvent::Exited;
        }
        StopEvent::Unknown
    }

    /// The debugger acknowledged resuming the debuggee
    pub fn is_continuing(&self, reply: &str) -> bool {
        reply.contains(&self.contract.continuing)
    }

    pub fn load_succeeded(&self, reply: &str) -> bool {
        reply.contains(&self.contract.transfer_complete)
    }

    pub fn file_error(&self, reply: &str) -> Option<String> {
        first_marker_line(reply, &self.contract.file_errors)
    }

    pub fn connect_error(&self, reply: &str) -> Option<String> {
        first_marker_line(reply, &self.contract.connect_errors)
    }

    pub fn command_error(&self, reply: &str) -> Option<String> {
        first_marker_line(reply, &self.contract.command_errors)
    }
}

/// The first reply line containing any of `markers`
fn first_marker_line(reply: &str, markers: &[String]) -> Option<String> {
    reply
        .lines()
        .find(|line| markers.iter().any(|m| line.contains(m.as_str())))
        .map(|line| line.trim().to_string())
}

/// Parse a printed integer
///
/// Accepts `0x` hex and signed decimal, skipping a leading type cast
/// such as `(void (*)()) ` and anything after the first token
/// (`<main+4>`, `'A'`). Negative values wrap to two's complement.
pub fn parse_integer(text: &str) -> Option<u64> {
    let mut rest = text.trim();

    if rest.starts_with('(') {
        let mut depth = 0usize;
        let mut end = None;
        for (i, c) in rest.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        rest = rest[end? + 1..].trim_start();
    }

    let token = rest.split_whitespace().next()?.trim_end_matches(',');
    let (negative, digits) = match token.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, token),
    };

    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u64>().ok()?,
    };

    Some(if negative {
        magnitude.wrapping_neg()
    } else {
        magnitude
    })
}
