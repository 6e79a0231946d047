//! Configuration, log and executable paths

use std::io;
use std::path::{Path, PathBuf};

use super::{Error, Result};

/// Name used for config and data directories
const APP_NAME: &str = "simdebug-harness";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/simdebug-harness/`
/// - macOS: `~/Library/Application Support/simdebug-harness/`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().join("logs"))
}

/// Create a fresh directory for one harness run
///
/// `<root>/run-<YYYYmmdd-HHMMSS>-<pid>`; root defaults to [`log_dir`],
/// then the system temp dir.
pub fn create_run_dir(root: Option<&Path>) -> io::Result<PathBuf> {
    let root = root
        .map(Path::to_path_buf)
        .or_else(log_dir)
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME));

    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let dir = root.join(format!("run-{}-{}", stamp, std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Turn a scenario name into a directory name
pub fn scenario_dir_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Resolve an executable either as a path or through `PATH`
pub fn resolve_program(program: &Path) -> Result<PathBuf> {
    which::which(program).map_err(|_| {
        let name = program.display().to_string();
        let searched = if program.components().count() > 1 {
            vec![name.clone()]
        } else {
            std::env::var("PATH")
                .map(|p| p.split(':').map(str::to_string).collect())
                .unwrap_or_default()
        };
        Error::binary_not_found(&name, &searched)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dir_is_valid() {
        let dir = config_dir();
        assert!(dir.is_some());
    }

    #[test]
    fn test_scenario_dir_name_is_sanitized() {
        assert_eq!(scenario_dir_name("write_gprs"), "write_gprs");
        assert_eq!(scenario_dir_name("my scenario/1"), "my_scenario_1");
    }

    #[test]
    fn test_resolve_program_reports_missing_binary() {
        let err = resolve_program(Path::new("/nonexistent/riscv64-unknown-elf-gdb")).unwrap_err();
        match err {
            Error::BinaryNotFound { name, searched } => {
                assert_eq!(name, "/nonexistent/riscv64-unknown-elf-gdb");
                assert_eq!(searched, "/nonexistent/riscv64-unknown-elf-gdb");
            }
            other => panic!("Expected BinaryNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_program_finds_shell() {
        assert!(resolve_program(Path::new("sh")).is_ok());
    }
}
