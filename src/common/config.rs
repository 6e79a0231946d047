//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::Result;
use crate::gdb::ReplyContract;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Interactive debugger client
    #[serde(default)]
    pub debugger: DebuggerConfig,

    /// Simulator under test
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Cross compiler used to build debuggee images
    #[serde(default)]
    pub toolchain: ToolchainConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Textual reply contract of the debugger
    #[serde(default)]
    pub contract: ReplyContract,

    /// Log and transcript settings
    #[serde(default)]
    pub output: OutputConfig,
}

/// How an interrupt is delivered to the debugger
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMode {
    /// SIGINT to the debugger process (works over pipes)
    #[default]
    Signal,
    /// Raw ^C byte on stdin (for tools that read from a terminal)
    ControlByte,
}

/// Debugger client configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DebuggerConfig {
    /// Path to the debugger executable
    #[serde(default = "default_gdb")]
    pub path: PathBuf,

    /// Additional arguments to pass to the debugger
    #[serde(default)]
    pub args: Vec<String>,

    /// Interrupt delivery mechanism
    #[serde(default)]
    pub interrupt: InterruptMode,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            path: default_gdb(),
            args: Vec::new(),
            interrupt: InterruptMode::default(),
        }
    }
}

/// Simulator configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SimulatorConfig {
    /// Path to the simulator executable
    #[serde(default = "default_simulator")]
    pub path: PathBuf,

    /// Arguments placed before the mode flag
    #[serde(default)]
    pub args: Vec<String>,

    /// Loader placed before the image (e.g. the proxy kernel)
    #[serde(default = "default_loader")]
    pub loader: Option<PathBuf>,

    /// Flag that starts the simulator halted
    #[serde(default = "default_halted_flag")]
    pub halted_flag: String,

    /// Listening port discovery
    #[serde(default)]
    pub port: PortConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            path: default_simulator(),
            args: Vec::new(),
            loader: default_loader(),
            halted_flag: default_halted_flag(),
            port: PortConfig::default(),
        }
    }
}

/// How the simulator's listening port is found
#[derive(Debug, Deserialize, Clone)]
pub struct PortConfig {
    /// Ask the simulator for a free port and parse its announcement
    #[serde(default)]
    pub dynamic: bool,

    /// Well-known port used when `dynamic` is off
    #[serde(default = "default_fixed_port")]
    pub fixed: u16,

    /// Extra arguments that request dynamic allocation
    #[serde(default = "default_dynamic_args")]
    pub dynamic_args: Vec<String>,

    /// Regex with one capture group for the decimal port number
    #[serde(default = "default_announce_pattern")]
    pub announce_pattern: String,

    /// Host the debugger connects to
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            dynamic: false,
            fixed: default_fixed_port(),
            dynamic_args: default_dynamic_args(),
            announce_pattern: default_announce_pattern(),
            host: default_host(),
        }
    }
}

/// Cross compiler configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ToolchainConfig {
    /// Path to the C compiler
    #[serde(default = "default_cc")]
    pub cc: PathBuf,

    /// Flags placed before `-o <output> <sources...>`
    #[serde(default = "default_cflags")]
    pub cflags: Vec<String>,

    /// Directory holding debuggee sources
    #[serde(default = "default_targets_dir")]
    pub targets_dir: PathBuf,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            cc: default_cc(),
            cflags: default_cflags(),
            targets_dir: default_targets_dir(),
        }
    }
}

/// Timeout settings
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Deadline for an ordinary prompt round trip
    #[serde(default = "default_expect")]
    pub expect_secs: u64,

    /// Deadline for a blocking continue
    #[serde(default = "default_continue")]
    pub continue_secs: u64,

    /// Deadline for a `load` download
    #[serde(default = "default_load")]
    pub load_secs: u64,

    /// Deadline for the simulator to come up
    #[serde(default = "default_launch")]
    pub launch_secs: u64,

    /// Grace period for a subprocess to exit before it is killed
    #[serde(default = "default_quit")]
    pub quit_secs: u64,

    /// Delay between a non-blocking continue and the interrupt
    #[serde(default = "default_interrupt_grace")]
    pub interrupt_grace_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            expect_secs: default_expect(),
            continue_secs: default_continue(),
            load_secs: default_load(),
            launch_secs: default_launch(),
            quit_secs: default_quit(),
            interrupt_grace_ms: default_interrupt_grace(),
        }
    }
}

impl Timeouts {
    pub fn expect(&self) -> Duration {
        Duration::from_secs(self.expect_secs)
    }

    pub fn continue_(&self) -> Duration {
        Duration::from_secs(self.continue_secs)
    }

    pub fn load(&self) -> Duration {
        Duration::from_secs(self.load_secs)
    }

    pub fn launch(&self) -> Duration {
        Duration::from_secs(self.launch_secs)
    }

    pub fn quit(&self) -> Duration {
        Duration::from_secs(self.quit_secs)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

/// Output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Root directory for run logs (defaults to the data dir)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Transcript lines attached to a failed scenario report
    #[serde(default = "default_tail_lines")]
    pub transcript_tail_lines: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            transcript_tail_lines: default_tail_lines(),
        }
    }
}

/// Tool path under `$RISCV/bin`, or the bare name for a PATH lookup
fn riscv_tool(name: &str) -> PathBuf {
    match std::env::var_os("RISCV") {
        Some(root) => PathBuf::from(root).join("bin").join(name),
        None => PathBuf::from(name),
    }
}

fn default_gdb() -> PathBuf {
    riscv_tool("riscv64-unknown-elf-gdb")
}
fn default_cc() -> PathBuf {
    riscv_tool("riscv64-unknown-elf-gcc")
}
fn default_simulator() -> PathBuf {
    PathBuf::from("spike")
}
fn default_loader() -> Option<PathBuf> {
    Some(PathBuf::from("pk"))
}
fn default_halted_flag() -> String {
    "-H".to_string()
}
fn default_fixed_port() -> u16 {
    9824
}
fn default_dynamic_args() -> Vec<String> {
    vec!["--rbb-port=0".to_string()]
}
fn default_announce_pattern() -> String {
    r"Listening for remote bitbang connection on port (\d+)".to_string()
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_cflags() -> Vec<String> {
    vec!["-g".to_string()]
}
fn default_targets_dir() -> PathBuf {
    PathBuf::from("targets")
}

fn default_expect() -> u64 {
    30
}
fn default_continue() -> u64 {
    60
}
fn default_load() -> u64 {
    180
}
fn default_launch() -> u64 {
    10
}
fn default_quit() -> u64 {
    2
}
fn default_interrupt_grace() -> u64 {
    100
}
fn default_tail_lines() -> usize {
    40
}

impl Config {
    /// Load configuration from an explicit file, or the default config file
    ///
    /// Returns default configuration if no file exists
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => config_path().filter(|p| p.exists()),
        };

        match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    super::Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    }
                })?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.simulator.port.fixed, 9824);
        assert!(!config.simulator.port.dynamic);
        assert_eq!(config.simulator.halted_flag, "-H");
        assert_eq!(config.timeouts.expect_secs, 30);
        assert_eq!(config.contract.prompt, "(gdb) ");
        assert_eq!(config.debugger.interrupt, InterruptMode::Signal);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
[debugger]
path = "/opt/riscv/bin/riscv64-unknown-elf-gdb"
interrupt = "control_byte"

[simulator]
path = "/opt/spike/bin/spike"
loader = "/opt/riscv/riscv64-unknown-elf/bin/pk"

[simulator.port]
dynamic = true

[timeouts]
expect_secs = 5

[contract]
prompt = "(riscv-gdb) "
"#,
        )
        .unwrap();

        assert_eq!(config.debugger.interrupt, InterruptMode::ControlByte);
        assert!(config.simulator.port.dynamic);
        assert_eq!(config.simulator.port.dynamic_args, vec!["--rbb-port=0"]);
        assert_eq!(config.timeouts.expect(), Duration::from_secs(5));
        assert_eq!(config.timeouts.continue_secs, 60);
        assert_eq!(config.contract.prompt, "(riscv-gdb) ");
        assert_eq!(config.contract.continuing, "Continuing");
    }

    #[test]
    fn test_invalid_config_is_parse_error() {
        let err = Config::from_toml("[timeouts]\nexpect_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, super::super::Error::ConfigParse(_)));
    }
}
