//! Persistence for the command log.
//!
//! The queue loads the log once, at `init` or before its first save, and
//! saves the full ordered list after every enqueue and dequeue.

use crate::command::PendingCommand;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

/// Durable storage for the ordered list of pending commands.
#[async_trait]
pub trait CommandLog: Send + Sync {
    async fn load(&self) -> Result<Vec<PendingCommand>>;
    async fn save(&self, entries: &[PendingCommand]) -> Result<()>;
}

/// Log kept in memory; survives queue re-creation but not the process.
#[derive(Debug, Default)]
pub struct MemoryCommandLog {
    entries: Mutex<Vec<PendingCommand>>,
}

impl MemoryCommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current persisted contents.
    pub fn entries(&self) -> Vec<PendingCommand> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl CommandLog for MemoryCommandLog {
    async fn load(&self) -> Result<Vec<PendingCommand>> {
        Ok(self.entries.lock().clone())
    }

    async fn save(&self, entries: &[PendingCommand]) -> Result<()> {
        *self.entries.lock() = entries.to_vec();
        Ok(())
    }
}

/// Log stored as a JSON array in a single file.
///
/// Saves write a sibling temp file and rename it over the log, so a crash
/// mid-save leaves the previous log intact.
#[derive(Debug, Clone)]
pub struct FileCommandLog {
    path: PathBuf,
}

impl FileCommandLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CommandLog for FileCommandLog {
    async fn load(&self) -> Result<Vec<PendingCommand>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entries: &[PendingCommand]) -> Result<()> {
        let bytes = serde_json::to_vec(entries)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}
