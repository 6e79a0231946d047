//! Simulator subprocess lifecycle
//!
//! The simulator's stdout/stderr go to a log file. With dynamic ports the
//! listening port is read back from that log; otherwise the well-known
//! port from the configuration is used.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::common::config::{SimulatorConfig, Timeouts};
use crate::common::paths::resolve_program;
use crate::common::{Error, Result};
use crate::process::ChildStatus;

/// Poll interval while waiting for the port announcement
const PORT_POLL: Duration = Duration::from_millis(50);

/// How long a fixed-port simulator must survive to count as started
const STARTUP_GRACE: Duration = Duration::from_millis(200);

/// Whether the simulator starts with the hart halted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    Halted,
    Running,
}

impl From<bool> for StartMode {
    fn from(halted: bool) -> Self {
        if halted {
            StartMode::Halted
        } else {
            StartMode::Running
        }
    }
}

/// Where the debugger attaches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Command-line arguments for a simulator launch
pub fn build_args(config: &SimulatorConfig, image: &Path, mode: StartMode) -> Vec<String> {
    let mut args = config.args.clone();
    if mode == StartMode::Halted {
        args.push(config.halted_flag.clone());
    }
    if config.port.dynamic {
        args.extend(config.port.dynamic_args.iter().cloned());
    }
    if let Some(loader) = &config.loader {
        args.push(loader.display().to_string());
    }
    args.push(image.display().to_string());
    args
}

/// Find the announced port in simulator output
pub fn parse_port(output: &str, announce: &Regex) -> Option<u16> {
    announce
        .captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .find_map(|m| m.as_str().parse().ok())
}

/// A running simulator
pub struct SimulatorSession {
    program: String,
    child: Child,
    pid: Option<u32>,
    status: ChildStatus,
    reaped: bool,
    endpoint: Endpoint,
    log_path: PathBuf,
    quit_timeout: Duration,
}

impl fmt::Debug for SimulatorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatorSession")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("status", &self.status)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl SimulatorSession {
    /// Launch the simulator on `image` and learn its listening port
    pub async fn launch(
        config: &SimulatorConfig,
        image: &Path,
        mode: StartMode,
        log_path: &Path,
        timeouts: &Timeouts,
    ) -> Result<Self> {
        let display = config.path.display().to_string();
        let path = resolve_program(&config.path).map_err(|e| Error::launch(&display, e.to_string()))?;
        let args = build_args(config, image, mode);

        let log = File::create(log_path).map_err(|e| Error::FileRead {
            path: log_path.display().to_string(),
            error: e.to_string(),
        })?;
        let log_err = log.try_clone()?;

        tracing::info!(program = %path.display(), ?mode, "Launching simulator: {}", args.join(" "));

        let child = Command::new(&path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::launch(&display, e.to_string()))?;

        let mut session = Self {
            program: display,
            pid: child.id(),
            child,
            status: ChildStatus::Running,
            reaped: false,
            endpoint: Endpoint {
                host: config.port.host.clone(),
                port: config.port.fixed,
            },
            log_path: log_path.to_path_buf(),
            quit_timeout: timeouts.quit(),
        };

        let started = if config.port.dynamic {
            session.discover_port(&config.port.announce_pattern, timeouts.launch()).await
        } else {
            session.ensure_alive(STARTUP_GRACE.min(timeouts.launch())).await
        };

        if let Err(e) = started {
            let _ = session.kill();
            let _ = session.wait().await;
            return Err(e);
        }

        tracing::info!(pid = ?session.pid, endpoint = %session.endpoint, "Simulator ready");
        Ok(session)
    }

    async fn discover_port(&mut self, pattern: &str, timeout: Duration) -> Result<()> {
        let announce = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("Invalid announce_pattern '{}': {}", pattern, e)))?;
        let deadline = Instant::now() + timeout;

        loop {
            let output = std::fs::read_to_string(&self.log_path).unwrap_or_default();
            if let Some(port) = parse_port(&output, &announce) {
                self.endpoint.port = port;
                return Ok(());
            }
            self.check_not_exited()?;
            if Instant::now() >= deadline {
                return Err(Error::launch(
                    &self.program,
                    format!(
                        "no port announcement after {:.1}s\n{}",
                        timeout.as_secs_f64(),
                        self.log_tail(20)
                    ),
                ));
            }
            tokio::time::sleep(PORT_POLL).await;
        }
    }

    async fn ensure_alive(&mut self, grace: Duration) -> Result<()> {
        tokio::time::sleep(grace).await;
        self.check_not_exited()
    }

    fn check_not_exited(&mut self) -> Result<()> {
        if let Ok(Some(exit)) = self.child.try_wait() {
            self.status = ChildStatus::Exited(exit.code());
            self.reaped = true;
            return Err(Error::launch(
                &self.program,
                format!("exited during startup ({})\n{}", self.status, self.log_tail(20)),
            ));
        }
        Ok(())
    }

    /// Listening port
    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// Host and port for the debugger's attach command
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Last `lines` lines of the simulator log
    pub fn log_tail(&self, lines: usize) -> String {
        let output = std::fs::read_to_string(&self.log_path).unwrap_or_default();
        let all: Vec<&str> = output.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }

    /// Request termination; safe to call repeatedly
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped || self.status.is_terminated() {
            return Ok(());
        }
        if let Ok(Some(exit)) = self.child.try_wait() {
            self.status = ChildStatus::Exited(exit.code());
            self.reaped = true;
            return Ok(());
        }
        match self.child.start_kill() {
            Ok(()) => {
                self.status = ChildStatus::Killed;
                tracing::debug!(pid = ?self.pid, "Simulator killed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Reap the process; bounded, and escalates to a kill if it lingers
    pub async fn wait(&mut self) -> Result<ChildStatus> {
        if self.reaped {
            return Ok(self.status);
        }

        match tokio::time::timeout(self.quit_timeout, self.child.wait()).await {
            Ok(Ok(exit)) => {
                if self.status != ChildStatus::Killed {
                    self.status = ChildStatus::Exited(exit.code());
                }
            }
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => {
                tracing::warn!(pid = ?self.pid, "Simulator did not exit, killing");
                self.child.kill().await?;
                self.status = ChildStatus::Killed;
            }
        }

        self.reaped = true;
        Ok(self.status)
    }
}

impl Drop for SimulatorSession {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::PortConfig;

    fn announce() -> Regex {
        Regex::new(&PortConfig::default().announce_pattern).unwrap()
    }

    #[test]
    fn test_build_args_running_fixed_port() {
        let config = SimulatorConfig::default();
        let args = build_args(&config, Path::new("/tmp/debug"), StartMode::Running);
        assert_eq!(args, vec!["pk", "/tmp/debug"]);
    }

    #[test]
    fn test_build_args_halted_dynamic_port() {
        let mut config = SimulatorConfig::default();
        config.args = vec!["--isa=rv64gc".to_string()];
        config.port.dynamic = true;
        config.loader = None;
        let args = build_args(&config, Path::new("regs"), StartMode::Halted);
        assert_eq!(args, vec!["--isa=rv64gc", "-H", "--rbb-port=0", "regs"]);
    }

    #[test]
    fn test_parse_port() {
        let log = "warning: tohost and fromhost symbols not in ELF\n\
                   Listening for remote bitbang connection on port 40123.\n";
        assert_eq!(parse_port(log, &announce()), Some(40123));
        assert_eq!(parse_port("no announcement yet", &announce()), None);
    }

    #[test]
    fn test_parse_port_skips_out_of_range() {
        let log = "Listening for remote bitbang connection on port 99999\n\
                   Listening for remote bitbang connection on port 5555\n";
        assert_eq!(parse_port(log, &announce()), Some(5555));
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint {
            host: "localhost".to_string(),
            port: 9824,
        };
        assert_eq!(endpoint.to_string(), "localhost:9824");
    }

    #[tokio::test]
    async fn test_launch_error_for_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SimulatorConfig::default();
        config.path = PathBuf::from("/nonexistent/spike");
        let err = SimulatorSession::launch(
            &config,
            Path::new("image"),
            StartMode::Running,
            &dir.path().join("sim.log"),
            &Timeouts::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_error_when_simulator_exits_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SimulatorConfig::default();
        config.path = PathBuf::from("false");
        config.loader = None;
        let err = SimulatorSession::launch(
            &config,
            Path::new("image"),
            StartMode::Running,
            &dir.path().join("sim.log"),
            &Timeouts::default(),
        )
        .await
        .unwrap_err();
        match err {
            Error::Launch { reason, .. } => assert!(reason.contains("exited during startup")),
            other => panic!("Expected Launch, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_and_wait_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SimulatorConfig::default();
        config.path = PathBuf::from("sleep");
        config.loader = None;
        let mut sim = SimulatorSession::launch(
            &config,
            Path::new("30"),
            StartMode::Running,
            &dir.path().join("sim.log"),
            &Timeouts::default(),
        )
        .await
        .unwrap();

        sim.kill().unwrap();
        assert_eq!(sim.wait().await.unwrap(), ChildStatus::Killed);
        sim.kill().unwrap();
        assert_eq!(sim.wait().await.unwrap(), ChildStatus::Killed);
    }
}
