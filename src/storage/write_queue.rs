// src/storage/write_queue.rs
// Best-effort asynchronous persistence writes.
//
// The in-memory copy of the wallet and session state is authoritative;
// writes are mirrored here without blocking the caller. Each write is
// retried a bounded number of times and then dropped with a warning, so a
// crash can lose at most the writes still queued or in retry. That window
// is accepted in exchange for keeping the chat path non-blocking.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::KeyValueStore;

const MAX_WRITE_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);

enum WriteOp {
    Put { key: String, value: String },
    Remove { key: String },
    Shutdown,
}

/// Fire-and-forget write queue in front of a [`KeyValueStore`].
pub struct PersistenceQueue {
    tx: mpsc::UnboundedSender<WriteOp>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();
        let worker = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let result = match &op {
                        WriteOp::Put { key, value } => store.put(key, value.clone()).await,
                        WriteOp::Remove { key } => store.remove(key).await,
                        WriteOp::Shutdown => return,
                    };
                    match result {
                        Ok(()) => break,
                        Err(err) if attempt < MAX_WRITE_ATTEMPTS => {
                            debug!(attempt, %err, "persistence write failed, retrying");
                            tokio::time::sleep(RETRY_DELAY).await;
                        }
                        Err(err) => {
                            let key = match &op {
                                WriteOp::Put { key, .. } | WriteOp::Remove { key } => key,
                                WriteOp::Shutdown => unreachable!(),
                            };
                            warn!(%key, %err, "dropping persistence write after {MAX_WRITE_ATTEMPTS} attempts");
                            break;
                        }
                    }
                }
            }
        });
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues a write. Never blocks and never fails from the caller's
    /// perspective; writes enqueued after shutdown are silently dropped.
    pub fn put(&self, key: String, value: String) {
        let _ = self.tx.send(WriteOp::Put { key, value });
    }

    pub fn remove(&self, key: String) {
        let _ = self.tx.send(WriteOp::Remove { key });
    }

    /// Drains previously queued writes, then stops the worker.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteOp::Shutdown);
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }
}
