// Resume watermark persistence.
//
// The fleet records the source line of the oldest still-attached session.
// A restarted run skips that many lines so it picks up roughly where the
// previous one stopped.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub trait ResumeStore: Send + Sync {
    /// Records a new watermark. Must not block.
    fn record(&self, line: u64);
}

/// Writes `"<line>\n"` to a file from a single background task.
///
/// Only the latest watermark matters, so bursts of updates collapse into one
/// write.
pub struct FileResumeStore {
    tx: watch::Sender<Option<u64>>,
}

impl FileResumeStore {
    /// Spawns the writer task. Call from within a tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>) -> (Self, JoinHandle<()>) {
        let path = path.into();
        let (tx, rx) = watch::channel(None);
        let writer = tokio::spawn(write_loop(path, rx));
        (Self { tx }, writer)
    }
}

impl ResumeStore for FileResumeStore {
    fn record(&self, line: u64) {
        self.tx.send_replace(Some(line));
    }
}

async fn write_loop(path: PathBuf, mut rx: watch::Receiver<Option<u64>>) {
    while rx.changed().await.is_ok() {
        let Some(line) = *rx.borrow_and_update() else {
            continue;
        };
        match tokio::fs::write(&path, format!("{line}\n")).await {
            Ok(()) => debug!(line, path = %path.display(), "Resume state saved"),
            Err(e) => warn!(line, path = %path.display(), error = %e, "Failed to save resume state"),
        }
    }
}

/// Keeps the watermarks in memory.
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    lines: Mutex<Vec<u64>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<u64> {
        self.lines.lock().last().copied()
    }

    pub fn history(&self) -> Vec<u64> {
        self.lines.lock().clone()
    }
}

impl ResumeStore for MemoryResumeStore {
    fn record(&self, line: u64) {
        self.lines.lock().push(line);
    }
}

/// Reads a saved watermark. A missing or unreadable file means "start from the top".
pub async fn read_resume_state(path: &Path) -> u64 {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No resume state");
            return 0;
        }
    };
    match text.trim().parse::<u64>() {
        Ok(line) => {
            info!(line, path = %path.display(), "Resuming from saved state");
            line
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed resume state");
            0
        }
    }
}
