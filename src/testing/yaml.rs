//! Scenarios described in YAML
//!
//! Each step maps onto one debugger session operation; expectations are
//! checked against the decoded reply. A failing step fails the scenario
//! and the remaining steps are skipped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use colored::Colorize;
use tokio::process::Command as TokioCommand;

use crate::common::{Error, Result};
use crate::gdb::{DebuggerSession, StopEvent, Unit};
use crate::simulator::StartMode;
use crate::toolchain::Toolchain;

use super::check::{ensure_contains, ensure_eq, ensure_lt, ensure_ne, ensure_not_contains};
use super::config::{
    OutputExpectation, StopExpectation, TestScenario, TestStep, ValueExpectation,
};
use super::scenario::{compile_target, Scenario, Target};

/// A scenario loaded from a YAML file
#[derive(Debug)]
pub struct YamlScenario {
    scenario: TestScenario,
    /// Directory of the YAML file; setup commands and images resolve here
    base_dir: PathBuf,
    verbose: bool,
}

/// Load and parse a scenario file
pub fn load_scenario(path: &Path) -> Result<YamlScenario> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;

    let scenario: TestScenario = serde_yaml::from_str(&content).map_err(|e| {
        Error::ConfigParse(format!("Failed to parse scenario '{}': {}", path.display(), e))
    })?;

    if scenario.target.sources.is_empty() && scenario.target.image.is_none() {
        return Err(Error::Config(format!(
            "Scenario '{}' needs target.sources or target.image",
            scenario.name
        )));
    }

    Ok(YamlScenario {
        scenario,
        base_dir: path.parent().unwrap_or(Path::new(".")).to_path_buf(),
        verbose: false,
    })
}

impl YamlScenario {
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn steps(&self) -> &[TestStep] {
        &self.scenario.steps
    }

    async fn run_setup(&self) -> Result<()> {
        let Some(setup_steps) = &self.scenario.setup else {
            return Ok(());
        };

        println!("  {}", "Setup:".cyan());
        for step in setup_steps {
            if self.verbose {
                println!("    $ {}", step.shell.dimmed());
            }

            let output = TokioCommand::new("sh")
                .arg("-c")
                .arg(&step.shell)
                .current_dir(&self.base_dir)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| Error::launch("sh", e.to_string()))?;

            if !output.status.success() {
                return Err(Error::Config(format!(
                    "Setup command '{}' failed with exit code {:?}: {}",
                    step.shell,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            println!("    {} {}", "✓".green(), step.shell.dimmed());
        }
        Ok(())
    }
}

#[async_trait]
impl Scenario for YamlScenario {
    fn name(&self) -> &str {
        &self.scenario.name
    }

    fn description(&self) -> &str {
        self.scenario.description.as_deref().unwrap_or("")
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> Result<Target> {
        self.run_setup().await?;

        let mode = StartMode::from(self.scenario.target.halted);
        match &self.scenario.target.image {
            Some(image) => {
                let image = if image.is_relative() {
                    self.base_dir.join(image)
                } else {
                    image.clone()
                };
                if !image.exists() {
                    return Err(Error::FileRead {
                        path: image.display().to_string(),
                        error: "image not found".to_string(),
                    });
                }
                Ok(Target { image, mode })
            }
            None => compile_target(toolchain, workdir, &self.scenario.target.sources, mode).await,
        }
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> Result<()> {
        println!("  {}", "Steps:".cyan());

        for (i, step) in self.scenario.steps.iter().enumerate() {
            let step_num = i + 1;
            if let Err(e) = execute_step(gdb, step, step_num, self.verbose).await {
                println!("    {} Step {}: {}", "✗".red(), step_num, e);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Execute a single step
async fn execute_step(
    gdb: &mut DebuggerSession,
    step: &TestStep,
    step_num: usize,
    verbose: bool,
) -> Result<()> {
    match step {
        TestStep::Command { command, expect } => {
            execute_command_step(gdb, command, expect.as_ref(), step_num, verbose).await
        }
        TestStep::Evaluate { expression, expect } => {
            let result = gdb.evaluate(expression).await;
            check_value(&format!("p {}", expression), result, expect.as_ref(), step_num)
        }
        TestStep::WriteRegister { register, value } => {
            let read_back = gdb.write_register(register, *value).await?;
            ensure_eq(&format!("${} read back", register), read_back, *value)?;
            println!(
                "    {} Step {}: ${} = {:#x}",
                "✓".green(),
                step_num,
                register,
                value
            );
            Ok(())
        }
        TestStep::Examine {
            address,
            unit,
            expect,
        } => {
            let result = gdb.examine_memory(address, *unit).await;
            check_value(&examine_label(address, *unit), result, expect.as_ref(), step_num)
        }
        TestStep::Stepi {
            count,
            expect_progress,
        } => execute_stepi_step(gdb, *count, *expect_progress, step_num).await,
        TestStep::Break { location } => {
            let bp = gdb.set_breakpoint(location).await?;
            println!(
                "    {} Step {}: breakpoint {} at {}",
                "✓".green(),
                step_num,
                bp.label,
                location.dimmed()
            );
            Ok(())
        }
        TestStep::Continue { blocking, expect } => {
            let output = gdb.continue_execution(*blocking).await?;
            if *blocking {
                check_stop(gdb, "continue", &output, expect.as_ref())?;
            }
            println!(
                "    {} Step {}: continue{}",
                "✓".green(),
                step_num,
                if *blocking { "" } else { " (running)" }
            );
            if verbose && !output.is_empty() {
                println!("      {}", output.dimmed());
            }
            Ok(())
        }
        TestStep::Interrupt { delay_ms, expect } => {
            if *delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
            let output = gdb.interrupt().await?;
            check_stop(gdb, "interrupt", &output, expect.as_ref())?;
            println!("    {} Step {}: interrupt", "✓".green(), step_num);
            Ok(())
        }
        TestStep::Load => {
            gdb.load().await?;
            println!("    {} Step {}: load", "✓".green(), step_num);
            Ok(())
        }
        TestStep::Sleep { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            Ok(())
        }
    }
}

fn examine_label(address: &str, unit: Unit) -> String {
    format!("x/1{}x {}", unit.letter(), address)
}

/// Execute a raw command step
async fn execute_command_step(
    gdb: &mut DebuggerSession,
    command: &str,
    expect: Option<&OutputExpectation>,
    step_num: usize,
    verbose: bool,
) -> Result<()> {
    let output = gdb.command(command).await?;

    if verbose {
        for line in output.lines() {
            println!("      {}", line.dimmed());
        }
    }

    if let Some(exp) = expect {
        let should_succeed = exp.success.unwrap_or(true);
        let error = gdb.parser().command_error(&output);
        if should_succeed && error.is_some() {
            return Err(Error::Assertion(format!(
                "'{}' expected success, got: {}",
                command,
                error.unwrap_or_default()
            )));
        }
        if !should_succeed && error.is_none() {
            return Err(Error::Assertion(format!(
                "'{}' expected an error reply, got:\n{}",
                command, output
            )));
        }
        for needle in &exp.contains {
            ensure_contains(command, &output, needle)?;
        }
        for needle in &exp.not_contains {
            ensure_not_contains(command, &output, needle)?;
        }
    }

    println!("    {} Step {}: {}", "✓".green(), step_num, command.dimmed());
    Ok(())
}

/// Check an integer result against its expectation
fn check_value(
    what: &str,
    result: Result<u64>,
    expect: Option<&ValueExpectation>,
    step_num: usize,
) -> Result<()> {
    let should_succeed = expect.and_then(|e| e.success).unwrap_or(true);

    let value = match (result, should_succeed) {
        (Ok(value), true) => value,
        (Err(e), true) => return Err(e),
        (Err(_), false) => {
            println!(
                "    {} Step {}: {} (expected failure)",
                "✓".green(),
                step_num,
                what.dimmed()
            );
            return Ok(());
        }
        (Ok(value), false) => {
            return Err(Error::Assertion(format!(
                "'{}' expected to fail, got {:#x}",
                what, value
            )))
        }
    };

    if let Some(exp) = expect {
        if let Some(expected) = exp.equals {
            ensure_eq(what, value, expected)?;
        }
        if let Some(unexpected) = exp.not_equals {
            ensure_ne(what, value, unexpected)?;
        }
        if let Some(bound) = exp.less_than {
            ensure_lt(what, value, bound)?;
        }
    }

    println!(
        "    {} Step {}: {} = {:#x}",
        "✓".green(),
        step_num,
        what.dimmed(),
        value
    );
    Ok(())
}

async fn execute_stepi_step(
    gdb: &mut DebuggerSession,
    count: usize,
    expect_progress: bool,
    step_num: usize,
) -> Result<()> {
    let mut last_pc = if expect_progress {
        Some(gdb.evaluate("$pc").await?)
    } else {
        None
    };

    for n in 0..count {
        gdb.step_instruction().await?;
        if let Some(previous) = last_pc {
            let pc = gdb.evaluate("$pc").await?;
            ensure_ne(&format!("$pc after stepi #{}", n + 1), pc, previous)?;
            last_pc = Some(pc);
        }
    }

    println!("    {} Step {}: stepi x{}", "✓".green(), step_num, count);
    Ok(())
}

/// Check a continue or interrupt reply against its expectation
fn check_stop(
    gdb: &DebuggerSession,
    what: &str,
    output: &str,
    expect: Option<&StopExpectation>,
) -> Result<()> {
    let Some(exp) = expect else {
        return Ok(());
    };

    if let Some(reason) = &exp.reason {
        let event = gdb.stop_event(output);
        if !stop_matches(&event, reason) {
            return Err(Error::Assertion(format!(
                "{}: expected stop reason '{}', got {:?}:\n{}",
                what, reason, event, output
            )));
        }
    }

    for needle in &exp.contains {
        ensure_contains(what, output, needle)?;
    }

    if let Some(hits) = exp.breakpoint_hits {
        let found = match gdb.stop_event(output) {
            StopEvent::Breakpoint { label } => gdb.parser().breakpoint_hits(output, &label),
            _ => 0,
        };
        ensure_eq(&format!("{}: breakpoint hits", what), found, hits)?;
    }
    Ok(())
}

fn stop_matches(event: &StopEvent, reason: &str) -> bool {
    match event {
        StopEvent::Breakpoint { .. } => reason == "breakpoint",
        StopEvent::Signal { name } => reason == "signal" || reason == name,
        StopEvent::ConnectionClosed => reason == "connection_closed",
        StopEvent::Exited => reason == "exited",
        StopEvent::Unknown => reason == "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_matches() {
        let bp = StopEvent::Breakpoint { label: "1".into() };
        assert!(stop_matches(&bp, "breakpoint"));
        assert!(!stop_matches(&bp, "signal"));

        let sig = StopEvent::Signal {
            name: "SIGINT".into(),
        };
        assert!(stop_matches(&sig, "signal"));
        assert!(stop_matches(&sig, "SIGINT"));
        assert!(stop_matches(&StopEvent::ConnectionClosed, "connection_closed"));
    }

    #[test]
    fn test_check_value() {
        let exp = ValueExpectation {
            equals: Some(0x1000),
            ..Default::default()
        };
        assert!(check_value("p $pc", Ok(0x1000), Some(&exp), 1).is_ok());
        assert!(matches!(
            check_value("p $pc", Ok(0x1004), Some(&exp), 1),
            Err(Error::Assertion(_))
        ));

        let failing = ValueExpectation {
            success: Some(false),
            ..Default::default()
        };
        let err = Error::parse("p nosuch", "No symbol \"nosuch\" in current context.");
        assert!(check_value("p nosuch", Err(err), Some(&failing), 2).is_ok());
        assert!(check_value("p 1", Ok(1), Some(&failing), 3).is_err());
    }

    #[test]
    fn test_load_scenario_requires_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.yaml");
        std::fs::write(&path, "name: empty\ntarget: {}\nsteps: []\n").unwrap();
        assert!(matches!(load_scenario(&path), Err(Error::Config(_))));

        let missing = load_scenario(&dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(Error::FileRead { .. })));
    }

    #[test]
    fn test_load_scenario_resolves_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("halt.yaml");
        std::fs::write(
            &path,
            "name: halt\ntarget:\n  sources: [debug.c]\n  halted: true\nsteps:\n  - action: stepi\n",
        )
        .unwrap();
        let scenario = load_scenario(&path).unwrap();
        assert_eq!(scenario.name(), "halt");
        assert_eq!(scenario.base_dir, dir.path());
        assert_eq!(scenario.steps().len(), 1);
    }
}
