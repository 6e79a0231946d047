//! Append-only record of everything exchanged with an interactive child
//!
//! Output bytes are appended by the stream pumps as soon as they are read,
//! before any pattern matching, so the log is complete even when a wait
//! times out. Lines written to the child are appended too, the way a
//! terminal echo would show them.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    bytes: Vec<u8>,
    file: Option<File>,
}

/// Shared handle to a transcript
#[derive(Clone, Default)]
pub struct Transcript {
    inner: Arc<Mutex<Inner>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

impl Transcript {
    /// Transcript mirrored to a log file (truncated on creation)
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                bytes: Vec::new(),
                file: Some(file),
            })),
            path: Some(path.to_path_buf()),
        })
    }

    /// Transcript kept only in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append raw bytes
    pub fn append(&self, bytes: &[u8]) {
        let mut inner = self.lock();
        inner.bytes.extend_from_slice(bytes);
        if let Some(file) = inner.file.as_mut() {
            if let Err(e) = file.write_all(bytes).and_then(|_| file.flush()) {
                tracing::warn!("Transcript write failed, continuing in memory: {}", e);
                inner.file = None;
            }
        }
    }

    /// Log file path, if mirrored to disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of bytes recorded
    pub fn len(&self) -> usize {
        self.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entire transcript, lossily decoded
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock().bytes).into_owned()
    }

    /// Last `lines` lines of the transcript
    pub fn tail(&self, lines: usize) -> String {
        let contents = self.contents();
        let all: Vec<&str> = contents.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}
