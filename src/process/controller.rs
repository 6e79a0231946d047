//! Line-send / pattern-wait control of an interactive child process
//!
//! stdout and stderr are pumped by background tasks into a single channel
//! in arrival order; `expect` accumulates that stream until a regex
//! matches. Interrupts travel out of band (a signal, or a raw byte on
//! stdin) through an [`Interrupter`], so another task can raise one while
//! an `expect` is waiting.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::common::config::InterruptMode;
use crate::common::{Error, Result};

use super::transcript::Transcript;

const CONTROL_C: u8 = 0x03;

/// Output consumed by a successful `expect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// Everything before the match
    pub before: String,
    /// The matched text itself
    pub matched: String,
}

/// Lifecycle of the child process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    NotStarted,
    Running,
    Exited(Option<i32>),
    Killed,
}

impl ChildStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(self, ChildStatus::Exited(_) | ChildStatus::Killed)
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::NotStarted => write!(f, "not started"),
            ChildStatus::Running => write!(f, "running"),
            ChildStatus::Exited(Some(code)) => write!(f, "exited({})", code),
            ChildStatus::Exited(None) => write!(f, "exited(signal)"),
            ChildStatus::Killed => write!(f, "killed"),
        }
    }
}

/// Whether the controller is currently waiting on output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    AwaitingPrompt { deadline: Instant },
}

/// Child stdin, shared with interrupters in control-byte mode
type SharedStdin = Arc<tokio::sync::Mutex<Option<BufWriter<ChildStdin>>>>;

fn not_running() -> Error {
    Error::ProcessExited {
        pattern: "<interrupt>".to_string(),
        status: "not running".to_string(),
    }
}

/// Cloneable handle that interrupts the child from any task
///
/// Delivery follows the configured [`InterruptMode`], so a blocking
/// `expect` on the owning task can be ended from elsewhere.
#[derive(Clone)]
pub struct Interrupter {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    mode: InterruptMode,
    stdin: SharedStdin,
    transcript: Transcript,
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter")
            .field("pid", &self.pid)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Interrupter {
    pub fn mode(&self) -> InterruptMode {
        self.mode
    }

    /// Deliver one interrupt to the child
    pub async fn raise(&self) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(not_running());
        }
        match self.mode {
            InterruptMode::Signal => self.signal(),
            InterruptMode::ControlByte => self.control_byte().await,
        }
    }

    fn signal(&self) -> Result<()> {
        let pid = self.pid.ok_or_else(not_running)?;

        #[cfg(unix)]
        {
            let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
            if result != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            tracing::debug!(pid, "SIGINT raised");
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            Err(Error::Config(
                "signal interrupts are only supported on unix; use interrupt = \"control_byte\""
                    .to_string(),
            ))
        }
    }

    async fn control_byte(&self) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or_else(|| Error::ProcessExited {
            pattern: "<interrupt>".to_string(),
            status: "stdin closed".to_string(),
        })?;
        self.transcript.append(b"^C");
        stdin.write_all(&[CONTROL_C]).await?;
        stdin.flush().await?;
        tracing::debug!(pid = ?self.pid, "^C written");
        Ok(())
    }
}

/// An interactive child process with a transcript
pub struct InteractiveProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
    stdin: SharedStdin,
    output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Output received but not yet consumed by a match
    buffer: Vec<u8>,
    /// Both output streams have closed
    eof: bool,
    transcript: Transcript,
    state: ControllerState,
    status: ChildStatus,
    interrupt_mode: InterruptMode,
    alive: Arc<AtomicBool>,
}

impl fmt::Debug for InteractiveProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractiveProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("status", &self.status)
            .finish()
    }
}

/// Copy one output stream into the transcript and the match channel
fn pump<R>(mut reader: R, transcript: Transcript, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    transcript.append(&buf[..n]);
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Output stream closed with error: {}", e);
                    break;
                }
            }
        }
    });
}

impl InteractiveProcess {
    /// Spawn `program` with piped stdio
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        program: &Path,
        args: &[String],
        transcript: Transcript,
        interrupt_mode: InterruptMode,
    ) -> Result<Self> {
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::launch(&program.display().to_string(), e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::launch(&name, "failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::launch(&name, "failed to get stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::launch(&name, "failed to get stderr"))?;

        let (tx, output_rx) = mpsc::unbounded_channel();
        pump(stdout, transcript.clone(), tx.clone());
        pump(stderr, transcript.clone(), tx);

        let pid = child.id();
        tracing::debug!(name = %name, pid = ?pid, "Spawned interactive process");

        Ok(Self {
            name,
            child,
            pid,
            stdin: Arc::new(tokio::sync::Mutex::new(Some(BufWriter::new(stdin)))),
            output_rx,
            buffer: Vec::new(),
            eof: false,
            transcript,
            state: ControllerState::Idle,
            status: ChildStatus::Running,
            interrupt_mode,
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Output received but not consumed by any match yet
    pub fn pending_output(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    /// Refresh and return the child status without blocking
    pub fn status(&mut self) -> ChildStatus {
        if !self.status.is_terminated() {
            if let Ok(Some(exit)) = self.child.try_wait() {
                self.mark_terminated(ChildStatus::Exited(exit.code()));
            }
        }
        self.status
    }

    fn mark_terminated(&mut self, status: ChildStatus) {
        self.status = status;
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Write `text` plus a newline to the child
    pub async fn send_line(&mut self, text: &str) -> Result<()> {
        if let ControllerState::AwaitingPrompt { .. } = self.state {
            return Err(Error::invalid_state("send a line", "awaiting a prompt"));
        }

        let shared = self.stdin.clone();
        let mut guard = shared.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| Error::ProcessExited {
            pattern: format!("<send {:?}>", text),
            status: "stdin closed".to_string(),
        })?;

        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');

        tracing::debug!("{} >>> {}", self.name, text);
        self.transcript.append(&line);

        let written = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        }
        .await;

        written.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                Error::ProcessExited {
                    pattern: format!("<send {:?}>", text),
                    status: self.status.to_string(),
                }
            } else {
                Error::Io(e)
            }
        })
    }

    /// Wait until the output contains a match for `pattern`
    ///
    /// Consumes output up to the end of the match. On timeout the
    /// controller returns to `Idle` with unconsumed output preserved.
    pub async fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<Match> {
        let deadline = Instant::now() + timeout;
        self.state = ControllerState::AwaitingPrompt { deadline };
        let result = self.expect_until(pattern, deadline, timeout).await;
        self.state = ControllerState::Idle;

        match &result {
            Ok(m) => tracing::debug!("{} <<< {}", self.name, m.before.trim_end()),
            Err(e) => tracing::debug!(
                "{} expect failed: {} (pending: {:?})",
                self.name,
                e,
                self.pending_output()
            ),
        }
        result
    }

    async fn expect_until(
        &mut self,
        pattern: &Regex,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Match> {
        loop {
            if let Some(m) = self.take_match(pattern) {
                return Ok(m);
            }

            if self.eof {
                let status = self.reap().await;
                return Err(Error::ProcessExited {
                    pattern: pattern.as_str().to_string(),
                    status: status.to_string(),
                });
            }

            match tokio::time::timeout_at(deadline, self.output_rx.recv()).await {
                Err(_) => {
                    return Err(Error::Timeout {
                        pattern: pattern.as_str().to_string(),
                        secs: timeout.as_secs_f64(),
                    })
                }
                Ok(None) => self.eof = true,
                Ok(Some(chunk)) => self.buffer.extend_from_slice(&chunk),
            }
        }
    }

    /// Match against output that is already available, without waiting
    pub fn expect_now(&mut self, pattern: &Regex) -> Option<Match> {
        loop {
            match self.output_rx.try_recv() {
                Ok(chunk) => self.buffer.extend_from_slice(&chunk),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.eof = true;
                    break;
                }
            }
        }
        self.take_match(pattern)
    }

    fn take_match(&mut self, pattern: &Regex) -> Option<Match> {
        let (start, end) = pattern.find(&self.buffer).map(|m| (m.start(), m.end()))?;
        let before = String::from_utf8_lossy(&self.buffer[..start]).into_owned();
        let matched = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
        self.buffer.drain(..end);
        Some(Match { before, matched })
    }

    /// Collect the exit status once the output streams have closed
    async fn reap(&mut self) -> ChildStatus {
        if self.status.is_terminated() {
            return self.status;
        }
        if let Ok(Ok(exit)) = tokio::time::timeout(Duration::from_secs(1), self.child.wait()).await
        {
            self.mark_terminated(ChildStatus::Exited(exit.code()));
        }
        self.status
    }

    /// Handle for interrupting the child from another task
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            pid: self.pid,
            alive: self.alive.clone(),
            mode: self.interrupt_mode,
            stdin: self.stdin.clone(),
            transcript: self.transcript.clone(),
        }
    }

    /// Deliver an out-of-band interrupt
    pub async fn interrupt(&mut self) -> Result<()> {
        self.interrupter().raise().await
    }

    /// Close the child's stdin (EOF)
    pub async fn close_stdin(&mut self) {
        *self.stdin.lock().await = None;
    }

    /// Wait for the child to exit on its own
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> Result<ChildStatus> {
        if self.status.is_terminated() {
            return Ok(self.status);
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(exit)) => {
                self.mark_terminated(ChildStatus::Exited(exit.code()));
                Ok(self.status)
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout {
                pattern: format!("<{} exit>", self.name),
                secs: timeout.as_secs_f64(),
            }),
        }
    }

    /// Kill the child and reap it; a no-op once it has terminated
    pub async fn terminate(&mut self) -> Result<ChildStatus> {
        if self.status().is_terminated() {
            return Ok(self.status);
        }
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("{} kill failed (already gone?): {}", self.name, e);
        }
        self.child.wait().await?;
        self.mark_terminated(ChildStatus::Killed);
        tracing::debug!("{} terminated", self.name);
        Ok(self.status)
    }
}

impl Drop for InteractiveProcess {
    fn drop(&mut self) {
        // Best-effort, we can't await in drop
        if !self.status.is_terminated() {
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn re(pattern: &str) -> Regex {
        Regex::new(pattern).unwrap()
    }

    fn spawn_sh(script: &str) -> InteractiveProcess {
        InteractiveProcess::spawn(
            Path::new("sh"),
            &["-c".to_string(), script.to_string()],
            Transcript::in_memory(),
            InterruptMode::Signal,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_and_expect_round_trip() {
        let mut proc = spawn_sh("cat");
        proc.send_line("hello world").await.unwrap();

        let m = proc.expect(&re("world"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(m.before, "hello ");
        assert_eq!(m.matched, "world");
        assert_eq!(proc.state(), ControllerState::Idle);

        // The newline after the match is still pending
        let m = proc.expect(&re("\n"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(m.before, "");

        proc.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_transcript_records_before_matching() {
        let mut proc = spawn_sh("printf 'banner\\n(gdb) '; cat");
        proc.expect(&re(r"\(gdb\) "), Duration::from_secs(5))
            .await
            .unwrap();
        proc.send_line("p 1").await.unwrap();
        proc.expect(&re("p 1\n"), Duration::from_secs(5)).await.unwrap();

        let contents = proc.transcript().contents();
        assert!(contents.starts_with("banner\n(gdb) "));
        assert!(contents.contains("p 1\n"));
        proc.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_expect_timeout_preserves_output() {
        let mut proc = spawn_sh("printf 'partial'; cat");
        let err = proc
            .expect(&re("never"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(proc.state(), ControllerState::Idle);
        assert_eq!(proc.pending_output(), "partial");
        assert!(proc.transcript().contents().contains("partial"));

        // Still usable after a timeout
        let m = proc.expect(&re("tial"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(m.before, "par");
        proc.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_expect_reports_process_exit() {
        let mut proc = spawn_sh("echo goodbye; exit 3");
        let err = proc
            .expect(&re("never"), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            Error::ProcessExited { status, .. } => assert_eq!(status, "exited(3)"),
            other => panic!("Expected ProcessExited, got {other:?}"),
        }
        assert_eq!(proc.status(), ChildStatus::Exited(Some(3)));
    }

    #[tokio::test]
    async fn test_stderr_is_merged() {
        let mut proc = spawn_sh("echo oops 1>&2; cat");
        let m = proc.expect(&re("oops"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(m.matched, "oops");
        proc.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_expect_now_does_not_block() {
        let mut proc = spawn_sh("cat");
        assert!(proc.expect_now(&re("anything")).is_none());
        proc.send_line("ready").await.unwrap();
        proc.expect(&re("rea"), Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let m = proc.expect_now(&re("dy")).unwrap();
        assert_eq!(m.before, "");
        proc.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_signal_interrupt_reaches_child() {
        let mut proc = spawn_sh("trap 'echo interrupted' INT; echo armed; while true; do sleep 0.05; done");
        proc.expect(&re("armed"), Duration::from_secs(5)).await.unwrap();
        proc.interrupt().await.unwrap();
        proc.expect(&re("interrupted"), Duration::from_secs(5))
            .await
            .unwrap();
        proc.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_signal_interrupt_from_another_task() {
        let mut proc = spawn_sh("trap 'echo interrupted' INT; echo armed; while true; do sleep 0.05; done");
        proc.expect(&re("armed"), Duration::from_secs(5)).await.unwrap();

        let interrupter = proc.interrupter();
        assert_eq!(interrupter.mode(), InterruptMode::Signal);
        let raiser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            interrupter.raise().await
        });

        proc.expect(&re("interrupted"), Duration::from_secs(5))
            .await
            .unwrap();
        raiser.await.unwrap().unwrap();
        proc.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_control_byte_interrupt_from_another_task() {
        let mut proc = InteractiveProcess::spawn(
            Path::new("cat"),
            &[],
            Transcript::in_memory(),
            InterruptMode::ControlByte,
        )
        .unwrap();

        let interrupter = proc.interrupter();
        let raiser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            interrupter.raise().await
        });

        // cat echoes the raw byte back while this task is blocked in expect
        let m = proc.expect(&re(r"\x03"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(m.before, "");
        raiser.await.unwrap().unwrap();
        assert!(proc.transcript().contents().starts_with("^C"));
        proc.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_control_byte_interrupt_after_stdin_closed() {
        let mut proc = InteractiveProcess::spawn(
            Path::new("cat"),
            &[],
            Transcript::in_memory(),
            InterruptMode::ControlByte,
        )
        .unwrap();
        proc.close_stdin().await;
        let err = proc.interrupt().await.unwrap_err();
        assert!(matches!(err, Error::ProcessExited { .. }));
        proc.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut proc = spawn_sh("cat");
        assert_eq!(proc.terminate().await.unwrap(), ChildStatus::Killed);
        assert_eq!(proc.terminate().await.unwrap(), ChildStatus::Killed);
        assert!(proc.interrupter().raise().await.is_err());
        assert_eq!(
            proc.wait_for_exit(Duration::from_millis(10)).await.unwrap(),
            ChildStatus::Killed
        );
    }

    #[tokio::test]
    async fn test_launch_error_for_missing_binary() {
        let err = InteractiveProcess::spawn(
            Path::new("/nonexistent/gdb"),
            &[],
            Transcript::in_memory(),
            InterruptMode::Signal,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
    }
}
