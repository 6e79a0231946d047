//! End-to-end integration tests for the harness
//!
//! These tests drive the real runner against `mock_gdb` and `mock_sim`,
//! with `sh` standing in for the cross compiler (it copies the first
//! source to the output path, which is all the mocks need):
//! 1. Running the built-in suite and YAML scenarios
//! 2. Failure classification (launch, connect, assertion, panic)
//! 3. Interrupts raised from another task and after a self-stop
//! 4. Isolation between consecutive runs and the CLI's exit codes

#![cfg(unix)]

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use harness::common::config::{Config, InterruptMode};
use harness::gdb::{DebuggerSession, ExecState, StopEvent};
use harness::simulator::StartMode;
use harness::testing::{compile_target, suite, Harness, Scenario, ScenarioState, SuiteReport, Target};
use harness::toolchain::Toolchain;

fn manifest_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

fn mock_gdb() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock_gdb"))
}

fn mock_sim() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock_sim"))
}

/// Configuration wired to the mocks
fn mock_config() -> Config {
    let mut config = Config::default();
    config.debugger.path = mock_gdb();
    config.simulator.path = mock_sim();
    config.simulator.loader = None;
    config.simulator.port.dynamic = true;
    config.toolchain.cc = PathBuf::from("sh");
    config.toolchain.cflags = vec![
        "-c".to_string(),
        "cp \"$3\" \"$2\"".to_string(),
        "cc".to_string(),
    ];
    config.toolchain.targets_dir = manifest_dir().join("targets");
    config.timeouts.expect_secs = 10;
    config.timeouts.continue_secs = 10;
    config.timeouts.quit_secs = 2;
    config
}

/// Same configuration as a TOML file for the CLI
fn write_mock_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    let content = format!(
        r#"
[debugger]
path = "{gdb}"

[simulator]
path = "{sim}"

[simulator.port]
dynamic = true

[toolchain]
cc = "sh"
cflags = ["-c", "cp \"$3\" \"$2\"", "cc"]
targets_dir = "{targets}"

[timeouts]
expect_secs = 10
continue_secs = 10
"#,
        gdb = mock_gdb().display(),
        sim = mock_sim().display(),
        targets = manifest_dir().join("targets").display(),
    );
    fs::write(&path, content).expect("Failed to write config");
    path
}

async fn run_builtin(config: Config, run_dir: &Path, filters: &[&str]) -> SuiteReport {
    let filters: Vec<String> = filters.iter().map(|s| s.to_string()).collect();
    let scenarios = suite::select(&config, &filters);
    let harness = Harness::new(config, run_dir.to_path_buf());
    harness.preflight().expect("mocks should resolve");
    harness.run_suite(scenarios).await
}

async fn debug_target(toolchain: &Toolchain, workdir: &Path) -> harness::Result<Target> {
    compile_target(toolchain, workdir, &[PathBuf::from("debug.c")], StartMode::Running).await
}

/// Ends a blocking continue from a second task through the interrupter
struct InterruptFromTask;

#[async_trait]
impl Scenario for InterruptFromTask {
    fn name(&self) -> &str {
        "interrupt_from_task"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> harness::Result<Target> {
        debug_target(toolchain, workdir).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> harness::Result<()> {
        let interrupter = gdb.interrupter();
        let raiser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            interrupter.raise().await
        });

        let output = gdb.continue_execution(true).await?;
        raiser.await.expect("raiser task")?;
        assert_eq!(
            gdb.stop_event(&output),
            StopEvent::Signal {
                name: "SIGINT".to_string()
            }
        );

        // The session is usable again, and listings come back raw
        let all = gdb.info_registers(None).await?;
        assert!(all.contains("fflags"), "{}", all);
        let general = gdb.info_registers(Some("general")).await?;
        assert!(general.contains("sp"), "{}", general);
        assert!(!general.contains("fflags"), "{}", general);
        Ok(())
    }
}

/// Interrupts a non-blocking continue that stops at a breakpoint on its own
struct LateInterrupt;

#[async_trait]
impl Scenario for LateInterrupt {
    fn name(&self) -> &str {
        "late_interrupt"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> harness::Result<Target> {
        debug_target(toolchain, workdir).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> harness::Result<()> {
        gdb.evaluate("i=0").await?;
        gdb.set_breakpoint("print_row").await?;

        for _ in 0..3 {
            gdb.continue_execution(false).await?;
            gdb.interrupt().await?;
            assert_eq!(gdb.state(), ExecState::Stopped);

            // Whatever the interrupt raced with, the next reply is this command's
            assert_eq!(gdb.evaluate("$pc").await?, 0x10040);
            assert_eq!(gdb.evaluate("i").await?, 0);
        }
        Ok(())
    }
}

/// A script with a bug in it
struct Panicking;

#[async_trait]
impl Scenario for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> harness::Result<Target> {
        debug_target(toolchain, workdir).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> harness::Result<()> {
        gdb.evaluate("$pc").await?;
        panic!("script bug");
    }
}

fn outcomes(report: &SuiteReport) -> Vec<(String, bool)> {
    report
        .reports
        .iter()
        .map(|r| (r.name.clone(), r.passed))
        .collect()
}

#[tokio::test]
async fn test_builtin_suite_passes_against_mocks() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_builtin(mock_config(), dir.path(), &[]).await;

    for r in &report.reports {
        assert!(r.passed, "{} failed: {:?}\n{:?}", r.name, r.error, r.transcript_tail);
        assert!(r.transcript.exists(), "missing transcript for {}", r.name);
        assert!(r.simulator_log.exists(), "missing simulator log for {}", r.name);
        assert_eq!(
            r.states,
            vec![
                ScenarioState::Created,
                ScenarioState::SessionsAcquired,
                ScenarioState::ScriptExecuting,
                ScenarioState::Passed,
                ScenarioState::TornDown,
            ]
        );
    }
    assert_eq!(report.reports.len(), 9);
    assert_eq!(report.exit_code(), 0);

    // Every command and reply lands in the transcript
    let transcript = fs::read_to_string(dir.path().join("breakpoint").join("gdb.log")).unwrap();
    assert!(transcript.contains("b print_row"));
    assert!(transcript.contains("length=9"));
    assert!(transcript.contains("Remote connection closed"));
}

#[tokio::test]
async fn test_runs_are_isolated() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let filters = ["exit", "interrupt", "write_csrs"];

    let a = run_builtin(mock_config(), first.path(), &filters).await;
    let b = run_builtin(mock_config(), second.path(), &filters).await;

    assert_eq!(outcomes(&a), outcomes(&b));
    assert_eq!(a.reports.len(), 3);
    assert!(a.reports.iter().all(|r| r.passed));
}

#[tokio::test]
async fn test_missing_image_is_launch_error() {
    let dir = tempfile::tempdir().unwrap();
    let scenario_path = dir.path().join("missing.yaml");
    fs::write(
        &scenario_path,
        "name: missing\ntarget:\n  sources: [debug.c]\nsteps: []\n",
    )
    .unwrap();

    // A compiler that "succeeds" without producing the image
    let mut config = mock_config();
    config.toolchain.cflags = vec!["-c".to_string(), "true".to_string()];

    let harness = Harness::new(config, dir.path().join("run"));
    let scenario = harness::testing::load_scenario(&scenario_path).unwrap();
    let report = harness.run_suite(vec![Box::new(scenario)]).await;

    let r = &report.reports[0];
    assert!(!r.passed);
    assert_eq!(r.error_kind.as_deref(), Some("LAUNCH"));
    assert_eq!(r.states.last(), Some(&ScenarioState::TornDown));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_unreachable_simulator_is_connect_error() {
    // Reserve a port, then release it so nothing is listening there
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut config = mock_config();
    config.simulator.path = PathBuf::from("sh");
    config.simulator.args = vec!["-c".to_string(), "sleep 30".to_string(), "sim".to_string()];
    config.simulator.port.dynamic = false;
    config.simulator.port.fixed = port;
    config.simulator.port.host = "127.0.0.1".to_string();

    let dir = tempfile::tempdir().unwrap();
    let report = run_builtin(config, dir.path(), &["exit"]).await;

    let r = &report.reports[0];
    assert!(!r.passed);
    assert_eq!(r.error_kind.as_deref(), Some("CONNECT"), "{:?}", r.error);
    assert!(r.states.contains(&ScenarioState::SessionsAcquired));
    assert!(!r.states.contains(&ScenarioState::ScriptExecuting));
    assert_eq!(r.states.last(), Some(&ScenarioState::TornDown));
    assert!(r.transcript_tail.as_deref().unwrap().contains("Connection refused"));
}

#[tokio::test]
async fn test_failed_assertion_keeps_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let scenario_path = dir.path().join("wrong_reset.yaml");
    fs::write(
        &scenario_path,
        r#"
name: wrong_reset
target:
  source: debug.c
  halted: true
steps:
  - action: evaluate
    expression: $pc
    expect:
      equals: 0x2000
  - action: stepi
"#,
    )
    .unwrap();

    let harness = Harness::new(mock_config(), dir.path().join("run"));
    let mut scenario = harness::testing::load_scenario(&scenario_path).unwrap();
    let r = harness.run_scenario(&mut scenario).await;

    assert!(!r.passed);
    assert_eq!(r.error_kind.as_deref(), Some("ASSERTION"));
    assert!(r.error.as_deref().unwrap().contains("8192"));
    assert!(r.transcript_tail.as_deref().unwrap().contains("p $pc"));
    // The script stopped at the failing step
    let transcript = fs::read_to_string(&r.transcript).unwrap();
    assert!(!transcript.contains("stepi"));
}

#[tokio::test]
async fn test_interrupt_from_another_task_in_both_modes() {
    for mode in [InterruptMode::Signal, InterruptMode::ControlByte] {
        let dir = tempfile::tempdir().unwrap();
        let mut config = mock_config();
        config.debugger.interrupt = mode;

        let harness = Harness::new(config, dir.path().to_path_buf());
        let report = harness.run_suite(vec![Box::new(InterruptFromTask)]).await;

        let r = &report.reports[0];
        assert!(r.passed, "{:?}: {:?}\n{:?}", mode, r.error, r.transcript_tail);
        if mode == InterruptMode::ControlByte {
            let transcript = fs::read_to_string(&r.transcript).unwrap();
            assert!(transcript.contains("^C"));
        }
    }
}

#[tokio::test]
async fn test_late_interrupt_keeps_replies_in_step() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(mock_config(), dir.path().to_path_buf());
    let report = harness.run_suite(vec![Box::new(LateInterrupt)]).await;

    let r = &report.reports[0];
    assert!(r.passed, "{:?}\n{:?}", r.error, r.transcript_tail);
}

#[tokio::test]
async fn test_panicking_scenario_does_not_stop_the_suite() {
    let dir = tempfile::tempdir().unwrap();
    let config = mock_config();
    let mut scenarios: Vec<Box<dyn Scenario>> = vec![Box::new(Panicking)];
    scenarios.extend(suite::select(&config, &["exit".to_string()]));

    let harness = Harness::new(config, dir.path().to_path_buf());
    let report = harness.run_suite(scenarios).await;

    assert_eq!(outcomes(&report), vec![
        ("panicking".to_string(), false),
        ("exit".to_string(), true),
    ]);
    let r = &report.reports[0];
    assert_eq!(r.error_kind.as_deref(), Some("PANIC"));
    assert!(r.error.as_deref().unwrap().contains("script bug"));
    assert_eq!(r.states.last(), Some(&ScenarioState::TornDown));
    assert!(r.transcript_tail.as_deref().unwrap().contains("p $pc"));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_yaml_scenarios_shipped_with_the_crate() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(mock_config(), dir.path().to_path_buf());

    let mut scenarios: Vec<Box<dyn harness::testing::Scenario>> = Vec::new();
    for name in ["halted_reset.yaml", "interrupt_and_finish.yaml"] {
        let path = manifest_dir().join("scenarios").join(name);
        scenarios.push(Box::new(harness::testing::load_scenario(&path).unwrap()));
    }

    let report = harness.run_suite(scenarios).await;
    for r in &report.reports {
        assert!(r.passed, "{} failed: {:?}\n{:?}", r.name, r.error, r.transcript_tail);
    }
}

#[test]
fn test_cli_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_mock_config(dir.path());
    let harness_bin = env!("CARGO_BIN_EXE_harness");

    let passing = Command::new(harness_bin)
        .arg("--config")
        .arg(&config)
        .arg("--log-dir")
        .arg(dir.path().join("logs"))
        .args(["run", "--filter", "exit", "--json"])
        .output()
        .expect("Failed to run harness");
    let stdout = String::from_utf8_lossy(&passing.stdout);
    assert_eq!(passing.status.code(), Some(0), "{}", stdout);
    assert!(stdout.contains("\"passed\": true"));

    let scenario_path = dir.path().join("bad.yaml");
    fs::write(
        &scenario_path,
        "name: bad\ntarget:\n  source: debug.c\n  halted: true\nsteps:\n  - action: evaluate\n    expression: $pc\n    expect:\n      equals: 1\n",
    )
    .unwrap();
    let failing = Command::new(harness_bin)
        .arg("--config")
        .arg(&config)
        .arg("--log-dir")
        .arg(dir.path().join("logs"))
        .arg("scenario")
        .arg(&scenario_path)
        .output()
        .expect("Failed to run harness");
    assert_eq!(failing.status.code(), Some(1));

    let missing_config = dir.path().join("missing-gdb.toml");
    fs::write(
        &missing_config,
        "[debugger]\npath = \"definitely-not-a-debugger-xyz\"\n",
    )
    .unwrap();
    let aborted = Command::new(harness_bin)
        .arg("--config")
        .arg(&missing_config)
        .arg("--log-dir")
        .arg(dir.path().join("logs"))
        .arg("run")
        .output()
        .expect("Failed to run harness");
    assert_eq!(aborted.status.code(), Some(2));
}

#[test]
fn test_cli_crc_matches_library() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("check.bin");
    fs::write(&file, b"123456789").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_harness"))
        .arg("crc")
        .arg(&file)
        .output()
        .expect("Failed to run harness");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("0xcbf43926"));
}
