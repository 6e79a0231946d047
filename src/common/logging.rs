//! Logging and tracing configuration
//!
//! Console output goes to stderr so that reports on stdout stay clean.
//! A harness run additionally keeps a full-detail log file next to the
//! per-scenario transcripts.

use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("harness=debug,info")
        } else {
            EnvFilter::new("harness=info,warn")
        }
    })
}

/// Initialize tracing for one-shot commands (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli(verbose: bool) {
    tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing for a harness run (file + stderr logging)
///
/// The file at `<run_dir>/harness.log` captures everything at DEBUG,
/// including every command line sent and every reply decoded.
pub fn init_run(run_dir: &Path, verbose: bool) -> Option<PathBuf> {
    let log_file = run_dir.join("harness.log");

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
    {
        Ok(file) => {
            let file_layer = fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(EnvFilter::new("harness=debug,info"));

            let stderr_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .compact()
                .with_filter(default_filter(verbose));

            tracing_subscriber::registry()
                .with(file_layer)
                .with(stderr_layer)
                .init();

            Some(log_file)
        }
        Err(e) => {
            eprintln!("Warning: Could not open log file: {}", e);
            init_cli(verbose);
            None
        }
    }
}
