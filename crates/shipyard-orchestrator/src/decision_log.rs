use crate::collaborators::{DecisionEntry, DecisionLogger};
use async_trait::async_trait;
use parking_lot::Mutex;
use shipyard_core::{ShipyardError, ShipyardResult};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Entries buffered before `log` starts rejecting.
pub const DEFAULT_LOG_QUEUE: usize = 256;

/// Append-only JSONL decision log.
///
/// `log` never waits on disk: entries go into a bounded channel and a
/// background task appends them to the file. A full queue is reported as an
/// error to the caller, who treats it as best effort.
pub struct JsonlDecisionLogger {
    path: PathBuf,
    tx: Mutex<Option<mpsc::Sender<DecisionEntry>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl JsonlDecisionLogger {
    /// Must be called from within a Tokio runtime.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(path, DEFAULT_LOG_QUEUE)
    }

    pub fn with_capacity(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::channel::<DecisionEntry>(capacity.max(1));
        let file_path = path.clone();

        let writer = tokio::spawn(async move {
            if let Some(parent) = file_path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    warn!(
                        path = %parent.display(),
                        error = %e,
                        "cannot create decision log directory"
                    );
                }
            }
            while let Some(entry) = rx.recv().await {
                if let Err(e) = append_line(&file_path, &entry).await {
                    warn!(path = %file_path.display(), error = %e, "decision log write failed");
                }
            }
            debug!(path = %file_path.display(), "decision log writer stopped");
        });

        Self {
            path,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting entries and wait until everything queued is on disk.
    pub async fn close(&self) {
        self.tx.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "decision log writer panicked");
            }
        }
    }
}

async fn append_line(path: &Path, entry: &DecisionEntry) -> ShipyardResult<()> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl DecisionLogger for JsonlDecisionLogger {
    async fn log(&self, entry: DecisionEntry) -> ShipyardResult<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| ShipyardError::Orchestrator("decision log is closed".into()))?;
        tx.try_send(entry).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ShipyardError::Orchestrator("decision log queue is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                ShipyardError::Orchestrator("decision log writer stopped".into())
            }
        })
    }
}

/// Read a decision log back. Malformed lines are skipped.
pub async fn read_decision_log(path: &Path) -> ShipyardResult<Vec<DecisionEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
