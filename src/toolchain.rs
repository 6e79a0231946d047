//! Cross-compilation of debuggee images
//!
//! The compiler is an external collaborator: it gets a command line and
//! reports success or failure through its exit status.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::common::config::ToolchainConfig;
use crate::common::paths::resolve_program;
use crate::common::{Error, Result};

/// A configured C cross compiler
#[derive(Debug, Clone)]
pub struct Toolchain {
    config: ToolchainConfig,
}

impl Toolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    /// Resolve a debuggee source against the targets directory
    pub fn source(&self, name: &Path) -> PathBuf {
        if name.is_absolute() {
            name.to_path_buf()
        } else {
            self.config.targets_dir.join(name)
        }
    }

    /// Full argument list for compiling `sources` into `output`
    pub fn command_line(&self, sources: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = self.config.cflags.clone();
        args.push("-o".to_string());
        args.push(output.display().to_string());
        args.extend(sources.iter().map(|s| s.display().to_string()));
        args
    }

    /// Compile `sources` into `output`
    pub async fn compile(&self, sources: &[PathBuf], output: &Path) -> Result<PathBuf> {
        let cc = resolve_program(&self.config.cc)?;
        let sources: Vec<PathBuf> = sources.iter().map(|s| self.source(s)).collect();
        let args = self.command_line(&sources, output);

        tracing::info!("Compiling: {} {}", cc.display(), args.join(" "));

        let result = Command::new(&cc)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::launch(&cc.display().to_string(), e.to_string()))?;

        if !result.status.success() {
            return Err(Error::Compile {
                output: output.display().to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        Ok(output.to_path_buf())
    }
}
