//! The unit of work the runner executes

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::common::Result;
use crate::gdb::DebuggerSession;
use crate::simulator::StartMode;
use crate::toolchain::Toolchain;

/// The debuggee image and how the simulator starts it
#[derive(Debug, Clone)]
pub struct Target {
    pub image: PathBuf,
    pub mode: StartMode,
}

/// A fixed, ordered script of debugger operations and assertions
///
/// The runner calls `prepare` once, acquires fresh sessions, loads the
/// image's symbols and attaches, then calls `run`.
#[async_trait]
pub trait Scenario: Send {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Build or locate the debuggee; `workdir` is private to this run
    async fn prepare(&mut self, toolchain: &Toolchain, workdir: &Path) -> Result<Target>;

    /// Execute the script against an attached debugger
    async fn run(&mut self, gdb: &mut DebuggerSession, target: &Target) -> Result<()>;
}

/// Compile `sources` into `<workdir>/<first source stem>`
pub async fn compile_target(
    toolchain: &Toolchain,
    workdir: &Path,
    sources: &[PathBuf],
    mode: StartMode,
) -> Result<Target> {
    let stem = sources
        .first()
        .and_then(|s| s.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let image = toolchain.compile(sources, &workdir.join(stem)).await?;
    Ok(Target { image, mode })
}
