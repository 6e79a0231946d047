//! CLI command definitions
//!
//! Defines the clap commands for the harness CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the built-in scenario suite
    Run {
        /// Only run scenarios whose name contains this text
        /// Can be specified multiple times: --filter write --filter exit
        #[arg(long, short)]
        filter: Vec<String>,

        /// Also print the suite report as JSON
        #[arg(long)]
        json: bool,

        /// Verbose output
        #[arg(long, short)]
        verbose: bool,
    },

    /// Execute scenarios defined in YAML files
    Scenario {
        /// Paths to the YAML scenario files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Also print the suite report as JSON
        #[arg(long)]
        json: bool,

        /// Verbose output
        #[arg(long, short)]
        verbose: bool,
    },

    /// List the built-in scenarios
    List,

    /// Check that the debugger, simulator and compiler can be found
    Doctor {
        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the CRC-32 of a file, as computed for the download scenario
    Crc {
        /// File to checksum
        file: PathBuf,
    },
}
