//! CLI command handling
//!
//! Builds a [`Harness`] from the loaded configuration and formats output.

use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{logging, paths, Error, Result};
use crate::testing::{self, download, suite, Harness, Scenario, SuiteReport};

/// Exit code for a run aborted before any scenario started
pub const EXIT_PREFLIGHT: i32 = 2;

/// Options shared by every subcommand
#[derive(Debug, Default)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

/// Dispatch a CLI command; returns the process exit code
pub async fn dispatch(command: Commands, global: GlobalOptions) -> Result<i32> {
    let mut config = Config::load(global.config.as_deref())?;
    if let Some(dir) = global.log_dir {
        config.output.log_dir = Some(dir);
    }

    match command {
        Commands::Run {
            filter,
            json,
            verbose,
        } => {
            let scenarios = suite::select(&config, &filter);
            if scenarios.is_empty() {
                return Err(Error::Config(format!(
                    "No built-in scenario matches {:?}",
                    filter
                )));
            }
            run(config, scenarios, json, verbose).await
        }

        Commands::Scenario {
            paths,
            json,
            verbose,
        } => {
            let mut scenarios: Vec<Box<dyn Scenario>> = Vec::with_capacity(paths.len());
            for path in &paths {
                scenarios.push(Box::new(testing::load_scenario(path)?.verbose(verbose)));
            }
            run(config, scenarios, json, verbose).await
        }

        Commands::List => {
            logging::init_cli(false);
            for scenario in suite::builtin(&config) {
                println!("{:<14} {}", scenario.name(), scenario.description().dimmed());
            }
            Ok(0)
        }

        Commands::Doctor { json } => {
            logging::init_cli(false);
            doctor(&config, json)
        }

        Commands::Crc { file } => {
            logging::init_cli(false);
            let bytes = std::fs::read(&file).map_err(|e| Error::FileRead {
                path: file.display().to_string(),
                error: e.to_string(),
            })?;
            println!("0x{:08x}  {}", download::crc32(&bytes), file.display());
            Ok(0)
        }
    }
}

async fn run(
    config: Config,
    scenarios: Vec<Box<dyn Scenario>>,
    json: bool,
    verbose: bool,
) -> Result<i32> {
    let run_dir = paths::create_run_dir(config.output.log_dir.as_deref())?;
    if let Some(log) = logging::init_run(&run_dir, verbose) {
        tracing::info!("Logging to {}", log.display());
    }

    let harness = Harness::new(config, run_dir);
    match harness.preflight() {
        Ok(found) => tracing::debug!(?found, "Preflight passed"),
        Err(e @ Error::BinaryNotFound { .. }) => {
            eprintln!("{} {}", "Preflight failed:".red().bold(), e);
            return Ok(EXIT_PREFLIGHT);
        }
        Err(e) => return Err(e),
    }

    let report = harness.run_suite(scenarios).await;
    report.print_summary();
    if json {
        print_json(&report)?;
    }
    Ok(report.exit_code())
}

fn print_json(report: &SuiteReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn doctor(config: &Config, json: bool) -> Result<i32> {
    let checks = [
        ("debugger", config.debugger.path.as_path()),
        ("simulator", config.simulator.path.as_path()),
        ("compiler", config.toolchain.cc.as_path()),
    ];

    let results: Vec<(&str, &Path, Option<PathBuf>)> = checks
        .iter()
        .map(|(role, path)| (*role, *path, paths::resolve_program(path).ok()))
        .collect();
    let missing = results.iter().filter(|(_, _, found)| found.is_none()).count();

    if json {
        let value: serde_json::Value = results
            .iter()
            .map(|(role, path, found)| {
                (
                    role.to_string(),
                    serde_json::json!({
                        "configured": path.display().to_string(),
                        "resolved": found.as_ref().map(|p| p.display().to_string()),
                    }),
                )
            })
            .collect::<serde_json::Map<_, _>>()
            .into();
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for (role, path, found) in &results {
            match found {
                Some(resolved) => {
                    println!("  {} {:<10} {}", "✓".green(), role, resolved.display())
                }
                None => println!(
                    "  {} {:<10} {} {}",
                    "✗".red(),
                    role,
                    path.display(),
                    "(not found)".dimmed()
                ),
            }
        }
        match paths::config_path() {
            Some(p) if p.exists() => println!("  Config: {}", p.display()),
            Some(p) => println!("  Config: {} {}", p.display(), "(defaults)".dimmed()),
            None => println!("  Config: {}", "(defaults)".dimmed()),
        }
    }

    Ok(if missing == 0 { 0 } else { EXIT_PREFLIGHT })
}
