//! Built-in remote-debugging scenarios
//!
//! Debuggee sources live in the toolchain's targets directory:
//! `debug.c` spins while `i` is non-zero, then calls `print_row(length)`
//! ten times and exits; `regs.S` stores every GPR to `data` from
//! `write_regs` and parks at `all_done`; `checksum.c` CRCs a generated
//! `data` array and passes the result to `all_done`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rand::SeedableRng;

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::gdb::{DebuggerSession, StopEvent, Unit};
use crate::simulator::StartMode;
use crate::toolchain::Toolchain;

use super::check::{ensure_contains, ensure_count, ensure_eq, ensure_lt, ensure_ne, ensure_not_contains};
use super::download::{self, DEFAULT_PAYLOAD_LEN};
use super::scenario::{compile_target, Scenario, Target};

/// Where a halted hart starts fetching
const RESET_VECTOR: u64 = 0x1000;

/// Iterations of the debuggee's `print_row` loop
const ROWS: usize = 10;

/// Registers written by `write_gprs`, in the order `regs.S` stores them
/// (a0 holds the destination address)
const GPRS: &[&str] = &[
    "ra", "sp", "gp", "tp", "t0", "t1", "t2", "fp", "s1", "a1", "a2", "a3", "a4", "a5", "a6",
    "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];

fn debug_c() -> Vec<PathBuf> {
    vec![PathBuf::from("debug.c")]
}

fn regs_s() -> Vec<PathBuf> {
    vec![PathBuf::from("regs.S")]
}

/// Every built-in scenario, in suite order
pub fn builtin(config: &Config) -> Vec<Box<dyn Scenario>> {
    vec![
        Box::new(InstantHalt),
        Box::new(Turbostep { steps: 100 }),
        Box::new(Exit),
        Box::new(BreakpointLoop),
        Box::new(Registers),
        Box::new(Interrupt {
            grace: config.timeouts.interrupt_grace(),
        }),
        Box::new(WriteGprs),
        Box::new(WriteCsrs),
        Box::new(Download::new(DEFAULT_PAYLOAD_LEN)),
    ]
}

/// Built-in scenarios whose names contain any of `filters`
pub fn select(config: &Config, filters: &[String]) -> Vec<Box<dyn Scenario>> {
    builtin(config)
        .into_iter()
        .filter(|s| filters.is_empty() || filters.iter().any(|f| s.name().contains(f.as_str())))
        .collect()
}

/// Continue and require the debuggee to leave through a closed connection
async fn run_to_exit(gdb: &mut DebuggerSession) -> Result<()> {
    let output = gdb.continue_execution(true).await?;
    ensure_contains("continue to exit", &output, "Continuing")?;
    ensure_contains("continue to exit", &output, "Remote connection closed")
}

/// Started halted: the hart sits at the reset vector until stepped
pub struct InstantHalt;

#[async_trait]
impl Scenario for InstantHalt {
    fn name(&self) -> &str {
        "instant_halt"
    }

    fn description(&self) -> &str {
        "A halted simulator reports the reset vector and moves on stepi"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> Result<Target> {
        compile_target(toolchain, workdir, &debug_c(), StartMode::Halted).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> Result<()> {
        ensure_eq("$pc at reset", gdb.evaluate("$pc").await?, RESET_VECTOR)?;
        // instret can be reset to 0 when the hart is halted
        ensure_lt("$instret at reset", gdb.evaluate("$instret").await?, 8)?;
        gdb.step_instruction().await?;
        ensure_ne("$pc after stepi", gdb.evaluate("$pc").await?, RESET_VECTOR)
    }
}

/// Single-step many times; the pc must change every time
pub struct Turbostep {
    pub steps: usize,
}

#[async_trait]
impl Scenario for Turbostep {
    fn name(&self) -> &str {
        "turbostep"
    }

    fn description(&self) -> &str {
        "Every stepi makes forward progress"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> Result<Target> {
        compile_target(toolchain, workdir, &debug_c(), StartMode::Running).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> Result<()> {
        gdb.evaluate("i=0").await?;
        let mut last_pc = gdb.evaluate("$pc").await?;
        for step in 0..self.steps {
            gdb.step_instruction().await?;
            let pc = gdb.evaluate("$pc").await?;
            ensure_ne(&format!("$pc after stepi #{}", step + 1), pc, last_pc)?;
            last_pc = pc;
        }
        Ok(())
    }
}

/// Run the debuggee to completion
pub struct Exit;

#[async_trait]
impl Scenario for Exit {
    fn name(&self) -> &str {
        "exit"
    }

    fn description(&self) -> &str {
        "Continue runs the debuggee to exit and the connection closes"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> Result<Target> {
        compile_target(toolchain, workdir, &debug_c(), StartMode::Running).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> Result<()> {
        gdb.evaluate("i=0").await?;
        run_to_exit(gdb).await
    }
}

/// A breakpoint in the loop body is hit once per iteration
pub struct BreakpointLoop;

#[async_trait]
impl Scenario for BreakpointLoop {
    fn name(&self) -> &str {
        "breakpoint"
    }

    fn description(&self) -> &str {
        "print_row's breakpoint is hit exactly once per loop iteration"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> Result<Target> {
        compile_target(toolchain, workdir, &debug_c(), StartMode::Running).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> Result<()> {
        gdb.evaluate("i=0").await?;
        let bp = gdb.set_breakpoint("print_row").await?;

        for row in 0..ROWS {
            let output = gdb.continue_execution(true).await?;
            let what = format!("continue #{}", row + 1);
            ensure_contains(&what, &output, "Continuing")?;
            ensure_count(&what, &output, &format!("length={}", row), 1)?;
            ensure_eq(
                &format!("{}: hits of breakpoint {}", what, bp.label),
                gdb.parser().breakpoint_hits(&output, &bp.label),
                1,
            )?;
        }

        run_to_exit(gdb).await
    }
}

/// Register listings are complete and instret keeps moving
pub struct Registers;

#[async_trait]
impl Scenario for Registers {
    fn name(&self) -> &str {
        "registers"
    }

    fn description(&self) -> &str {
        "Both register-listing forms work and instret advances"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> Result<Target> {
        compile_target(toolchain, workdir, &debug_c(), StartMode::Running).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> Result<()> {
        gdb.evaluate("i=0").await?;

        for group in [None, Some("all")] {
            let what = match group {
                Some(group) => format!("info registers {}", group),
                None => "info all-registers".to_string(),
            };
            let output = gdb.info_registers(group).await?;
            ensure_not_contains(&what, &output, "Could not")?;
            for reg in ["zero", "ra", "sp", "gp", "tp"] {
                ensure_contains(&what, &output, reg)?;
            }
        }

        let mut last_instret = None;
        for _ in 0..5 {
            let instret = Some(gdb.evaluate("$instret").await?);
            ensure_ne("$instret across stepi", instret, last_instret)?;
            last_instret = instret;
            gdb.step_instruction().await?;
        }
        Ok(())
    }
}

/// Interrupt a free-running debuggee, twice, then let it finish
pub struct Interrupt {
    pub grace: Duration,
}

impl Interrupt {
    async fn interrupt_running(&self, gdb: &mut DebuggerSession) -> Result<()> {
        gdb.continue_execution(false).await?;
        tokio::time::sleep(self.grace).await;
        let output = gdb.interrupt().await?;
        match gdb.stop_event(&output) {
            StopEvent::Signal { .. } => Ok(()),
            other => Err(Error::Assertion(format!(
                "interrupt: expected a signal stop, got {:?}:\n{}",
                other, output
            ))),
        }
    }
}

#[async_trait]
impl Scenario for Interrupt {
    fn name(&self) -> &str {
        "interrupt"
    }

    fn description(&self) -> &str {
        "An interrupt halts a running debuggee and the prompt stays usable"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> Result<Target> {
        compile_target(toolchain, workdir, &debug_c(), StartMode::Running).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> Result<()> {
        self.interrupt_running(gdb).await?;
        gdb.evaluate("$pc").await?;
        gdb.evaluate("i=123").await?;

        self.interrupt_running(gdb).await?;
        gdb.evaluate("i=0").await?;

        run_to_exit(gdb).await
    }
}

/// Registers written through the debugger land in memory unchanged
pub struct WriteGprs;

fn gpr_value(index: usize) -> u64 {
    (0xdead_beef_u64 << index).wrapping_add(17)
}

#[async_trait]
impl Scenario for WriteGprs {
    fn name(&self) -> &str {
        "write_gprs"
    }

    fn description(&self) -> &str {
        "GPR writes are stored to memory by the debuggee and read back"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> Result<Target> {
        compile_target(toolchain, workdir, &regs_s(), StartMode::Running).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> Result<()> {
        gdb.evaluate("$pc=write_regs").await?;
        for (i, reg) in GPRS.iter().enumerate() {
            gdb.write_register(reg, gpr_value(i)).await?;
        }
        gdb.evaluate("$a0=data").await?;
        let bp = gdb.set_breakpoint("all_done").await?;

        let output = gdb.continue_execution(true).await?;
        ensure_eq(
            "stop after write_regs",
            gdb.stop_event(&output),
            StopEvent::Breakpoint { label: bp.label },
        )?;

        // Just to get these into the transcript
        gdb.command(&format!("x/{}gx data", GPRS.len())).await?;
        gdb.command("info registers").await?;

        for (n, reg) in GPRS.iter().enumerate() {
            let stored = gdb
                .examine_memory(&format!("data+{}", n * Unit::Giant.bytes()), Unit::Giant)
                .await?;
            ensure_eq(&format!("data slot of ${}", reg), stored, gpr_value(n))?;
        }
        Ok(())
    }
}

/// CSR writes survive a step and are visible under every alias
pub struct WriteCsrs;

#[async_trait]
impl Scenario for WriteCsrs {
    fn name(&self) -> &str {
        "write_csrs"
    }

    fn description(&self) -> &str {
        "mscratch and fflags writes are observed by the debuggee"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> Result<Target> {
        compile_target(toolchain, workdir, &regs_s(), StartMode::Running).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> Result<()> {
        for value in [0, 123] {
            gdb.write_register("mscratch", value).await?;
            gdb.step_instruction().await?;
            ensure_eq("$mscratch after stepi", gdb.evaluate("$mscratch").await?, value)?;
        }

        gdb.write_register("fflags", 9).await?;
        gdb.evaluate("$pc=write_regs").await?;
        gdb.evaluate("$a0=data").await?;
        gdb.set_breakpoint("all_done").await?;
        gdb.continue_execution(true).await?;

        // regs.S copies fflags into x1 after storing the GPRs
        for alias in ["$fflags", "$x1", "$csr1"] {
            ensure_eq(alias, gdb.evaluate(alias).await?, 9)?;
        }
        Ok(())
    }
}

/// Bulk download of random data, verified by the debuggee's own CRC
pub struct Download {
    len: usize,
    expected_crc: Option<u32>,
}

impl Download {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            expected_crc: None,
        }
    }
}

#[async_trait]
impl Scenario for Download {
    fn name(&self) -> &str {
        "download"
    }

    fn description(&self) -> &str {
        "load transfers a random block intact (checked by CRC-32)"
    }

    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> Result<Target> {
        let mut rng = rand::rngs::StdRng::from_entropy();
        let payload = download::generate(&mut rng, self.len);
        let data_source = workdir.join("download_data.c");
        std::fs::write(&data_source, download::render_c_source(&payload))?;
        tracing::info!(bytes = self.len, crc = %format!("0x{:08x}", payload.crc), "Generated download payload");
        self.expected_crc = Some(payload.crc);

        let sources = vec![PathBuf::from("checksum.c"), data_source];
        compile_target(toolchain, workdir, &sources, StartMode::Halted).await
    }

    async fn run(&mut self, gdb: &mut DebuggerSession, _target: &Target) -> Result<()> {
        let expected = self
            .expected_crc
            .ok_or_else(|| Error::invalid_state("run download", "unprepared"))?;

        gdb.load().await?;
        let bp = gdb.set_breakpoint("all_done").await?;
        let output = gdb.continue_execution(true).await?;
        ensure_eq(
            "stop after checksum",
            gdb.stop_event(&output),
            StopEvent::Breakpoint { label: bp.label },
        )?;
        let a0 = gdb.evaluate("$a0").await?;
        ensure_eq("$a0 (debuggee crc32)", download::crc_from_register(a0), expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names_are_unique() {
        let config = Config::default();
        let scenarios = builtin(&config);
        let mut names: Vec<&str> = scenarios.iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), 9);
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 9);
    }

    #[test]
    fn test_select_filters_by_substring() {
        let config = Config::default();
        let names: Vec<String> = select(&config, &["write".to_string()])
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["write_gprs", "write_csrs"]);
        assert_eq!(select(&config, &[]).len(), 9);
    }

    #[test]
    fn test_gpr_values_are_distinct() {
        let values: Vec<u64> = (0..GPRS.len()).map(gpr_value).collect();
        assert_eq!(values[0], 0xdead_beef + 17);
        assert_eq!(values[1], (0xdead_beef << 1) + 17);
        for pair in values.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }
}
