//! Scenario runner
//!
//! Every scenario gets its own directory under the run directory, a fresh
//! simulator and a fresh debugger. Teardown is nested: the debugger is
//! closed inside the scope that owns the simulator, and the simulator is
//! killed and reaped before the next scenario starts, whatever the outcome.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use colored::Colorize;
use serde::Serialize;

use crate::common::config::Config;
use crate::common::paths::{resolve_program, scenario_dir_name};
use crate::common::Result;
use crate::gdb::DebuggerSession;
use crate::process::Transcript;
use crate::simulator::SimulatorSession;
use crate::toolchain::Toolchain;

use super::scenario::{Scenario, Target};

const TRANSCRIPT_FILE: &str = "gdb.log";
const SIMULATOR_LOG_FILE: &str = "sim.log";

/// Error kind of a scenario whose task panicked
const PANIC_KIND: &str = "PANIC";

/// Per-scenario resources opened before the scenario task starts
#[derive(Debug, Clone)]
struct ScenarioRun {
    name: String,
    dir: PathBuf,
    transcript_path: PathBuf,
    transcript: Transcript,
    started: Instant,
}

fn panic_message(e: tokio::task::JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Lifecycle of one scenario run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    Created,
    SessionsAcquired,
    ScriptExecuting,
    Passed,
    Failed(String),
    TornDown,
}

impl ScenarioState {
    fn is_outcome(&self) -> bool {
        matches!(self, ScenarioState::Passed | ScenarioState::Failed(_))
    }
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioState::Created => write!(f, "created"),
            ScenarioState::SessionsAcquired => write!(f, "sessions acquired"),
            ScenarioState::ScriptExecuting => write!(f, "script executing"),
            ScenarioState::Passed => write!(f, "passed"),
            ScenarioState::Failed(reason) => write!(f, "failed: {}", reason),
            ScenarioState::TornDown => write!(f, "torn down"),
        }
    }
}

/// Records and logs every state transition of one scenario
#[derive(Debug)]
struct Tracker {
    scenario: String,
    states: Vec<ScenarioState>,
}

impl Tracker {
    fn new(scenario: &str) -> Self {
        let mut tracker = Self {
            scenario: scenario.to_string(),
            states: Vec::new(),
        };
        tracker.advance(ScenarioState::Created);
        tracker
    }

    fn advance(&mut self, state: ScenarioState) {
        tracing::info!(scenario = %self.scenario, "-> {}", state);
        self.states.push(state);
    }

    /// Record Passed or Failed once, as soon as the outcome is known
    fn settle(&mut self, result: &Result<()>) {
        if self.states.iter().any(ScenarioState::is_outcome) {
            return;
        }
        match result {
            Ok(()) => self.advance(ScenarioState::Passed),
            Err(e) => self.advance(ScenarioState::Failed(e.to_string())),
        }
    }
}

/// Outcome of one scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub transcript: PathBuf,
    pub simulator_log: PathBuf,
    /// Last lines of the debugger transcript, on failure
    pub transcript_tail: Option<String>,
    pub states: Vec<ScenarioState>,
}

/// Outcome of a sequence of scenarios
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub run_dir: PathBuf,
    pub reports: Vec<ScenarioReport>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.reports.iter().filter(|r| r.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.passed()
    }

    /// 0 when every scenario passed, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.failed() == 0 {
            0
        } else {
            1
        }
    }

    pub fn print_summary(&self) {
        println!();
        for report in &self.reports {
            let mark = if report.passed {
                "✓".green()
            } else {
                "✗".red()
            };
            println!(
                "  {} {} {}",
                mark,
                report.name,
                format!("({} ms)", report.duration_ms).dimmed()
            );
        }

        let summary = format!("{} passed, {} failed", self.passed(), self.failed());
        if self.failed() == 0 {
            println!("\n{} {}", "✓".green().bold(), summary.green().bold());
        } else {
            println!("\n{} {}", "✗".red().bold(), summary.red().bold());
        }
        println!("  Logs: {}\n", self.run_dir.display().to_string().dimmed());
    }
}

/// Binaries a run needs, resolved ahead of time
#[derive(Debug, Clone, Serialize)]
pub struct Preflight {
    pub debugger: PathBuf,
    pub simulator: PathBuf,
    pub compiler: PathBuf,
}

/// Runs scenarios against freshly launched sessions
#[derive(Debug, Clone)]
pub struct Harness {
    config: Config,
    toolchain: Toolchain,
    run_dir: PathBuf,
}

impl Harness {
    pub fn new(config: Config, run_dir: PathBuf) -> Self {
        let toolchain = Toolchain::new(config.toolchain.clone());
        Self {
            config,
            toolchain,
            run_dir,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Locate the debugger, simulator and compiler before anything runs
    pub fn preflight(&self) -> Result<Preflight> {
        Ok(Preflight {
            debugger: resolve_program(&self.config.debugger.path)?,
            simulator: resolve_program(&self.config.simulator.path)?,
            compiler: resolve_program(&self.config.toolchain.cc)?,
        })
    }

    /// Run scenarios one after another
    ///
    /// Each scenario runs in its own task, so a panicking script is
    /// reported as a failure and the rest of the suite still runs.
    pub async fn run_suite(&self, scenarios: Vec<Box<dyn Scenario>>) -> SuiteReport {
        let mut reports = Vec::with_capacity(scenarios.len());

        for scenario in scenarios {
            println!(
                "\n{} {}",
                "Running:".blue().bold(),
                scenario.name().white().bold()
            );
            if !scenario.description().is_empty() {
                println!("  {}", scenario.description().dimmed());
            }

            let run = self.open_run(scenario.name());
            let harness = self.clone();
            let task_run = run.clone();
            let task = tokio::spawn(async move {
                let mut scenario = scenario;
                harness.run_opened(scenario.as_mut(), task_run).await
            });
            let report = match task.await {
                Ok(report) => report,
                Err(e) => self.abandoned(run, e),
            };

            if report.passed {
                println!("  {} Passed", "✓".green());
            } else {
                println!(
                    "  {} {}",
                    "✗".red(),
                    report.error.as_deref().unwrap_or("failed")
                );
                if let Some(tail) = &report.transcript_tail {
                    println!("  {}", "Transcript tail:".yellow());
                    for line in tail.lines() {
                        println!("    {}", line.dimmed());
                    }
                }
                println!(
                    "  Transcript: {}",
                    report.transcript.display().to_string().dimmed()
                );
            }

            reports.push(report);
        }

        SuiteReport {
            run_dir: self.run_dir.clone(),
            reports,
        }
    }

    /// Run one scenario; never panics on scenario failure and always tears down
    pub async fn run_scenario(&self, scenario: &mut dyn Scenario) -> ScenarioReport {
        let run = self.open_run(scenario.name());
        self.run_opened(scenario, run).await
    }

    /// Claim the scenario's directory and open its transcript
    fn open_run(&self, name: &str) -> ScenarioRun {
        let dir = self.scenario_dir(name);
        let transcript_path = dir.join(TRANSCRIPT_FILE);
        let transcript = match Transcript::create(&transcript_path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Transcript file unavailable, keeping it in memory: {}", e);
                Transcript::in_memory()
            }
        };
        ScenarioRun {
            name: name.to_string(),
            dir,
            transcript_path,
            transcript,
            started: Instant::now(),
        }
    }

    async fn run_opened(&self, scenario: &mut dyn Scenario, run: ScenarioRun) -> ScenarioReport {
        let simulator_log = run.dir.join(SIMULATOR_LOG_FILE);
        let mut tracker = Tracker::new(&run.name);

        let result = self
            .execute(scenario, &run.dir, &run.transcript, &simulator_log, &mut tracker)
            .await;
        tracker.settle(&result);
        tracker.advance(ScenarioState::TornDown);

        let (error_kind, error, transcript_tail) = match &result {
            Ok(()) => (None, None, None),
            Err(e) => (
                Some(e.kind().to_string()),
                Some(e.to_string()),
                Some(run.transcript.tail(self.config.output.transcript_tail_lines)),
            ),
        };

        ScenarioReport {
            name: run.name,
            passed: result.is_ok(),
            error_kind,
            error,
            duration_ms: run.started.elapsed().as_millis() as u64,
            transcript: run.transcript_path,
            simulator_log,
            transcript_tail,
            states: tracker.states,
        }
    }

    /// Report for a scenario task that panicked or was cancelled
    ///
    /// Dropping the task killed its child processes.
    fn abandoned(&self, run: ScenarioRun, e: tokio::task::JoinError) -> ScenarioReport {
        let error = format!("Scenario panicked: {}", panic_message(e));
        tracing::error!(scenario = %run.name, "{}", error);

        ScenarioReport {
            passed: false,
            error_kind: Some(PANIC_KIND.to_string()),
            duration_ms: run.started.elapsed().as_millis() as u64,
            simulator_log: run.dir.join(SIMULATOR_LOG_FILE),
            transcript_tail: Some(run.transcript.tail(self.config.output.transcript_tail_lines)),
            states: vec![
                ScenarioState::Created,
                ScenarioState::Failed(error.clone()),
                ScenarioState::TornDown,
            ],
            error: Some(error),
            name: run.name,
            transcript: run.transcript_path,
        }
    }

    /// `<run_dir>/<scenario>`, suffixed when a name repeats within a run
    fn scenario_dir(&self, name: &str) -> PathBuf {
        let base = scenario_dir_name(name);
        let mut dir = self.run_dir.join(&base);
        let mut n = 2;
        while dir.exists() {
            dir = self.run_dir.join(format!("{}-{}", base, n));
            n += 1;
        }
        dir
    }

    /// Prepare the target, then own the simulator for the rest of the run
    async fn execute(
        &self,
        scenario: &mut dyn Scenario,
        dir: &Path,
        transcript: &Transcript,
        simulator_log: &Path,
        tracker: &mut Tracker,
    ) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let target = scenario.prepare(&self.toolchain, dir).await?;
        tracing::debug!(image = %target.image.display(), mode = ?target.mode, "Target ready");

        let mut simulator = SimulatorSession::launch(
            &self.config.simulator,
            &target.image,
            target.mode,
            simulator_log,
            &self.config.timeouts,
        )
        .await?;

        let result = self
            .with_simulator(scenario, &target, &simulator, transcript, tracker)
            .await;
        tracker.settle(&result);

        if let Err(e) = simulator.kill() {
            tracing::warn!("Failed to kill simulator: {}", e);
        }
        match simulator.wait().await {
            Ok(status) => tracing::debug!("Simulator {}", status),
            Err(e) => tracing::warn!("Failed to reap simulator: {}", e),
        }

        result
    }

    /// Own the debugger; it is closed before the simulator goes away
    async fn with_simulator(
        &self,
        scenario: &mut dyn Scenario,
        target: &Target,
        simulator: &SimulatorSession,
        transcript: &Transcript,
        tracker: &mut Tracker,
    ) -> Result<()> {
        let mut gdb = DebuggerSession::spawn(
            &self.config.debugger,
            &self.config.contract,
            &self.config.timeouts,
            transcript.clone(),
        )
        .await?;
        tracker.advance(ScenarioState::SessionsAcquired);

        let result: Result<()> = async {
            gdb.load_symbols(&target.image).await?;
            gdb.attach(simulator.endpoint()).await?;
            tracker.advance(ScenarioState::ScriptExecuting);
            scenario.run(&mut gdb, target).await
        }
        .await;
        tracker.settle(&result);

        if let Err(e) = gdb.close().await {
            tracing::warn!("Failed to close debugger: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;

    fn report(name: &str, passed: bool) -> ScenarioReport {
        ScenarioReport {
            name: name.to_string(),
            passed,
            error_kind: None,
            error: None,
            duration_ms: 1,
            transcript: PathBuf::from("gdb.log"),
            simulator_log: PathBuf::from("sim.log"),
            transcript_tail: None,
            states: vec![ScenarioState::Created],
        }
    }

    #[test]
    fn test_exit_code() {
        let mut suite = SuiteReport {
            run_dir: PathBuf::from("/tmp/run"),
            reports: vec![report("a", true), report("b", true)],
        };
        assert_eq!(suite.exit_code(), 0);
        suite.reports.push(report("c", false));
        assert_eq!(suite.exit_code(), 1);
        assert_eq!(suite.passed(), 2);
        assert_eq!(suite.failed(), 1);
    }

    #[test]
    fn test_tracker_settles_once() {
        let mut tracker = Tracker::new("exit");
        tracker.settle(&Err(Error::Assertion("pc".into())));
        tracker.settle(&Ok(()));
        tracker.advance(ScenarioState::TornDown);
        assert_eq!(
            tracker.states,
            vec![
                ScenarioState::Created,
                ScenarioState::Failed("Assertion failed: pc".into()),
                ScenarioState::TornDown,
            ]
        );
    }

    #[test]
    fn test_preflight_reports_missing_binary() {
        let mut config = Config::default();
        config.debugger.path = PathBuf::from("definitely-not-a-debugger-xyz");
        let harness = Harness::new(config, PathBuf::from("/tmp"));
        assert!(matches!(
            harness.preflight(),
            Err(Error::BinaryNotFound { .. })
        ));
    }

    #[test]
    fn test_report_serializes_states() {
        let mut r = report("exit", false);
        r.states.push(ScenarioState::Failed("boom".into()));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["states"][0], "created");
        assert_eq!(json["states"][1]["failed"], "boom");
    }
}
