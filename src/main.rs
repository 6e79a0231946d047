//! Simulator debug-session harness
//!
//! Drives gdb against a RISC-V simulator through scripted scenarios and
//! reports which ones passed.

use std::path::PathBuf;

use clap::Parser;
use commands::Commands;
use harness::cli::{self, GlobalOptions};
use harness::commands;

#[derive(Parser)]
#[command(name = "harness", about = "Scripted gdb sessions against a RISC-V simulator")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file (default: the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory for per-run logs and transcripts
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let global = GlobalOptions {
        config: cli.config,
        log_dir: cli.log_dir,
    };

    match cli::dispatch(cli.command, global).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
