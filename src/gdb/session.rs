//! Typed operations over an interactive gdb
//!
//! Each operation encodes one command line, waits for the prompt, and
//! decodes the reply through the [`ReplyParser`]. Commands are strictly
//! one at a time; the only exception is a non-blocking continue, tracked
//! by [`ExecState::Running`], which can be ended by [`DebuggerSession::interrupt`]
//! or [`DebuggerSession::wait_for_stop`]. Nothing here is retried: a
//! repeated command against a REPL is not idempotent.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::common::config::{DebuggerConfig, Timeouts};
use crate::common::paths::resolve_program;
use crate::common::{Error, Result};
use crate::process::{InteractiveProcess, Interrupter, Transcript};
use crate::simulator::Endpoint;

use super::reply::{Breakpoint, ReplyContract, ReplyParser, StopEvent, Unit};

/// Settings applied right after the banner so replies are never paged
const SESSION_SETUP: &[&str] = &["set width 0", "set height 0", "set confirm off"];

/// How long an idle debugger gets to answer an interrupt that arrived late
const LATE_INTERRUPT_GRACE: Duration = Duration::from_millis(250);

/// Execution state as seen by the harness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// At a prompt, ready for a command
    Stopped,
    /// A non-blocking continue is outstanding
    Running,
    /// A wait timed out or the debugger exited; only teardown is possible
    Faulted,
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecState::Stopped => write!(f, "stopped"),
            ExecState::Running => write!(f, "running (a non-blocking continue is outstanding)"),
            ExecState::Faulted => write!(f, "faulted"),
        }
    }
}

/// A gdb process driven through its command line
#[derive(Debug)]
pub struct DebuggerSession {
    process: InteractiveProcess,
    parser: ReplyParser,
    state: ExecState,
    timeouts: Timeouts,
    closed: bool,
}

impl DebuggerSession {
    /// Spawn the debugger and wait for its first prompt
    pub async fn spawn(
        config: &DebuggerConfig,
        contract: &ReplyContract,
        timeouts: &Timeouts,
        transcript: Transcript,
    ) -> Result<Self> {
        let parser = ReplyParser::new(contract.clone())?;
        let display = config.path.display().to_string();
        let program =
            resolve_program(&config.path).map_err(|e| Error::launch(&display, e.to_string()))?;
        let process = InteractiveProcess::spawn(&program, &config.args, transcript, config.interrupt)?;

        let mut session = Self {
            process,
            parser,
            state: ExecState::Stopped,
            timeouts: timeouts.clone(),
            closed: false,
        };

        session
            .wait_prompt(timeouts.expect())
            .await
            .map_err(|e| Error::launch(&display, format!("no initial prompt: {}", e)))?;

        for setting in SESSION_SETUP {
            session.command(setting).await?;
        }

        tracing::info!(pid = ?session.process.pid(), "Debugger ready");
        Ok(session)
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn parser(&self) -> &ReplyParser {
        &self.parser
    }

    pub fn transcript(&self) -> &Transcript {
        self.process.transcript()
    }

    /// Handle that interrupts the debugger from another task
    pub fn interrupter(&self) -> Interrupter {
        self.process.interrupter()
    }

    fn ensure_stopped(&self, action: &str) -> Result<()> {
        match self.state {
            ExecState::Stopped => Ok(()),
            other => Err(Error::invalid_state(action, other)),
        }
    }

    /// Move to `Faulted` when an error leaves the reply stream out of sync
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.desynchronizes() {
                tracing::warn!("Debugger session faulted: {}", e);
                self.state = ExecState::Faulted;
            }
        }
        result
    }

    async fn wait_prompt(&mut self, timeout: Duration) -> Result<String> {
        let result = self
            .process
            .expect(self.parser.prompt(), timeout)
            .await
            .map(|m| m.before);
        self.track(result)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        let result = self.process.send_line(line).await;
        self.track(result)
    }

    /// Send one raw command and return its reply
    pub async fn command(&mut self, text: &str) -> Result<String> {
        self.command_with_timeout(text, self.timeouts.expect()).await
    }

    async fn command_with_timeout(&mut self, text: &str, timeout: Duration) -> Result<String> {
        self.ensure_stopped(text)?;
        self.send(text).await?;
        let reply = self.wait_prompt(timeout).await?;
        Ok(self.parser.body(&reply).to_string())
    }

    /// Load the debuggee's symbols (`file <path>`)
    pub async fn load_symbols(&mut self, path: &Path) -> Result<()> {
        let command = format!("file {}", path.display());
        let reply = self.command(&command).await?;
        match self.parser.file_error(&reply) {
            Some(message) => Err(Error::protocol(&command, message)),
            None => Ok(()),
        }
    }

    /// Attach to the simulator (`target extended-remote host:port`)
    pub async fn attach(&mut self, endpoint: &Endpoint) -> Result<String> {
        let command = format!("target extended-remote {}", endpoint);
        let reply = match self.command(&command).await {
            Ok(reply) => reply,
            Err(Error::Timeout { secs, .. }) => {
                return Err(Error::connect(endpoint, format!("timed out after {:.1}s", secs)))
            }
            Err(e) => return Err(e),
        };
        match self.parser.connect_error(&reply) {
            Some(reason) => Err(Error::connect(endpoint, reason)),
            None => Ok(reply),
        }
    }

    /// Evaluate an expression (`p <expr>`) to an integer
    pub async fn evaluate(&mut self, expression: &str) -> Result<u64> {
        let command = format!("p {}", expression);
        let reply = self.command(&command).await?;
        self.parser.parse_value(&command, &reply)
    }

    /// Assign a register (`p $<reg>=<value>`) and return the value read back
    pub async fn write_register(&mut self, register: &str, value: u64) -> Result<u64> {
        let register = register.trim_start_matches('$');
        self.evaluate(&format!("${}={}", register, value)).await
    }

    /// Read one unit of memory (`x/1<unit>x <address>`)
    pub async fn examine_memory(&mut self, address: &str, unit: Unit) -> Result<u64> {
        let command = format!("x/1{}x {}", unit.letter(), address);
        let reply = self.command(&command).await?;
        self.parser.parse_examine(&command, &reply)
    }

    /// Raw register listing: `info registers <group>`, or every register
    /// (`info all-registers`) when no group is given
    pub async fn info_registers(&mut self, group: Option<&str>) -> Result<String> {
        let command = match group {
            Some(group) => format!("info registers {}", group),
            None => "info all-registers".to_string(),
        };
        let reply = self.command(&command).await?;
        match self.parser.command_error(&reply) {
            Some(message) => Err(Error::protocol(&command, message)),
            None => Ok(reply),
        }
    }

    /// Execute a single instruction
    pub async fn step_instruction(&mut self) -> Result<()> {
        let reply = self.command("stepi").await?;
        match self.parser.command_error(&reply) {
            Some(message) => Err(Error::protocol("stepi", message)),
            None => Ok(()),
        }
    }

    /// Create a breakpoint; the label is the debugger's own numbering
    pub async fn set_breakpoint(&mut self, location: &str) -> Result<Breakpoint> {
        let command = format!("b {}", location);
        let reply = self.command(&command).await?;
        self.parser
            .parse_breakpoint(location, &reply)
            .ok_or_else(|| Error::protocol(&command, reply))
    }

    /// Resume the debuggee
    ///
    /// Blocking: returns the reply once the debuggee stops. Non-blocking:
    /// returns an empty reply immediately and leaves the session `Running`.
    pub async fn continue_execution(&mut self, blocking: bool) -> Result<String> {
        if blocking {
            let reply = self
                .command_with_timeout("c", self.timeouts.continue_())
                .await?;
            if let Some(message) = self.parser.command_error(&reply) {
                return Err(Error::protocol("c", message));
            }
            if !self.parser.is_continuing(&reply) {
                return Err(Error::protocol("c", "the debuggee was not resumed"));
            }
            return Ok(reply);
        }

        self.ensure_stopped("continue")?;
        self.send("c").await?;
        self.state = ExecState::Running;
        tracing::debug!("Non-blocking continue outstanding");
        Ok(String::new())
    }

    /// Halt a debuggee resumed by a non-blocking continue
    ///
    /// If the debuggee already stopped on its own, its reply is returned
    /// without raising an interrupt.
    pub async fn interrupt(&mut self) -> Result<String> {
        if self.state != ExecState::Running {
            return Err(Error::invalid_state("interrupt", self.state));
        }

        if let Some(m) = self.process.expect_now(self.parser.prompt()) {
            tracing::debug!("Debuggee stopped before the interrupt was needed");
            self.state = ExecState::Stopped;
            return Ok(self.parser.body(&m.before).to_string());
        }

        let raised = self.process.interrupt().await;
        self.track(raised)?;
        let reply = self.wait_prompt(self.timeouts.expect()).await?;
        self.state = ExecState::Stopped;
        let reply = self.parser.body(&reply).to_string();

        // The debuggee stopped on its own after the check above, so the
        // interrupt reached an idle prompt and earns one more reply
        if !matches!(self.parser.classify_stop(&reply), StopEvent::Signal { .. }) {
            if let Ok(m) = self
                .process
                .expect(self.parser.prompt(), LATE_INTERRUPT_GRACE)
                .await
            {
                tracing::debug!("Discarded reply to a late interrupt: {:?}", m.before);
            }
        }
        Ok(reply)
    }

    /// Wait for a non-blocking continue to stop on its own
    pub async fn wait_for_stop(&mut self) -> Result<String> {
        if self.state != ExecState::Running {
            return Err(Error::invalid_state("wait for a stop", self.state));
        }
        let reply = self.wait_prompt(self.timeouts.continue_()).await?;
        self.state = ExecState::Stopped;
        Ok(self.parser.body(&reply).to_string())
    }

    /// Download the loaded image into the target (`load`)
    pub async fn load(&mut self) -> Result<String> {
        let reply = self
            .command_with_timeout("load", self.timeouts.load())
            .await?;
        if self.parser.load_succeeded(&reply) {
            Ok(reply)
        } else {
            let message = reply.lines().last().unwrap_or("no transfer summary").to_string();
            Err(Error::protocol("load", message))
        }
    }

    /// Classify the stop described by a continue or interrupt reply
    pub fn stop_event(&self, reply: &str) -> StopEvent {
        self.parser.classify_stop(reply)
    }

    /// Quit the debugger; kills it if it does not exit in time
    ///
    /// Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.state == ExecState::Stopped {
            if let Err(e) = self.process.send_line("quit").await {
                tracing::debug!("quit not delivered: {}", e);
            }
        }
        self.process.close_stdin().await;

        match self.process.wait_for_exit(self.timeouts.quit()).await {
            Ok(status) => tracing::debug!("Debugger {}", status),
            Err(_) => {
                self.process.terminate().await?;
            }
        }
        Ok(())
    }
}
