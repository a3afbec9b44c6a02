//! Recording worker difficulty.
//!
//! The store is bookkeeping, not the source of truth: the live session keeps
//! the difficulty the miner was told about. Writes therefore never hold up
//! share processing. The controller hands them to a [`DifficultyRecorder`],
//! which queues them for a single writer task; the writer applies them in
//! order and logs failures without retrying.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::tracing::prelude::*;

/// Persistence collaborator.
#[async_trait]
pub trait DifficultyStore: Send + Sync {
    /// Remember the difficulty currently assigned to `worker`.
    async fn record_worker_difficulty(&self, worker: &str, difficulty: f64) -> Result<()>;

    /// Forget every recorded difficulty. Called once at startup, since no
    /// worker is connected yet.
    async fn clear_all_worker_difficulties(&self) -> Result<()>;
}

/// In-process [`DifficultyStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    difficulties: Arc<RwLock<HashMap<String, f64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, worker: &str) -> Option<f64> {
        self.difficulties.read().await.get(worker).copied()
    }

    pub async fn len(&self) -> usize {
        self.difficulties.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.difficulties.read().await.is_empty()
    }
}

#[async_trait]
impl DifficultyStore for MemoryStore {
    async fn record_worker_difficulty(&self, worker: &str, difficulty: f64) -> Result<()> {
        self.difficulties
            .write()
            .await
            .insert(worker.to_string(), difficulty);
        Ok(())
    }

    async fn clear_all_worker_difficulties(&self) -> Result<()> {
        self.difficulties.write().await.clear();
        Ok(())
    }
}

#[derive(Debug)]
enum RecorderCommand {
    Record { worker: String, difficulty: f64 },
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget handle to the difficulty writer task.
///
/// Cloneable. The writer task exits once every handle has been dropped and
/// the queue has drained.
#[derive(Debug, Clone)]
pub struct DifficultyRecorder {
    tx: mpsc::UnboundedSender<RecorderCommand>,
}

impl DifficultyRecorder {
    /// Queue a difficulty write. Never blocks.
    pub fn record(&self, worker: &str, difficulty: f64) {
        let command = RecorderCommand::Record {
            worker: worker.to_string(),
            difficulty,
        };
        if self.tx.send(command).is_err() {
            warn!(worker = %worker, difficulty, "Difficulty writer stopped, dropping write");
        }
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(RecorderCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Start the writer task for `store`.
pub fn spawn_recorder(store: Arc<dyn DifficultyStore>) -> (DifficultyRecorder, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(recorder_task(store, rx));
    (DifficultyRecorder { tx }, handle)
}

async fn recorder_task(
    store: Arc<dyn DifficultyStore>,
    mut rx: mpsc::UnboundedReceiver<RecorderCommand>,
) {
    trace!("Difficulty writer started.");

    while let Some(command) = rx.recv().await {
        match command {
            RecorderCommand::Record { worker, difficulty } => {
                if let Err(e) = store.record_worker_difficulty(&worker, difficulty).await {
                    warn!(
                        worker = %worker,
                        difficulty,
                        error = %e,
                        "Failed to record worker difficulty"
                    );
                }
            }
            RecorderCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    trace!("Difficulty writer stopped.");
}
