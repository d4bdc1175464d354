//! Save serializer.
//!
//! Handlers never write the document themselves. They mutate the store and
//! call [`SaveQueue::enqueue_save`], which parks a waiter on a bounded
//! channel. A single worker drains the channel in FIFO order; each write
//! persists the store as it is when the write starts, so every waiter already
//! queued at that moment is answered by the same write.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AtomicWriter, PersistError};
use crate::store::DocumentStore;

#[derive(Error, Debug, Clone)]
pub enum SaveError {
    #[error(transparent)]
    Persist(Arc<PersistError>),

    #[error("Persistence worker is not running")]
    Closed,
}

pub type SaveResult = Result<(), SaveError>;

type Waiter = oneshot::Sender<SaveResult>;

/// Cloneable handle used by handlers to request a save
#[derive(Debug, Clone)]
pub struct SaveQueue {
    tx: mpsc::Sender<Waiter>,
}

impl SaveQueue {
    /// Start the worker. It stops once every handle has been dropped and the
    /// remaining waiters are answered.
    pub fn spawn(
        store: Arc<DocumentStore>,
        writer: Arc<AtomicWriter>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = SaveWorker { store, writer, rx };
        let handle = tokio::spawn(worker.run());
        (Self { tx }, handle)
    }

    /// Resolve once the current in-memory state (or a later one) is on disk
    pub async fn enqueue_save(&self) -> SaveResult {
        let (tx, rx) = oneshot::channel();
        self.tx.send(tx).await.map_err(|_| SaveError::Closed)?;
        rx.await.map_err(|_| SaveError::Closed)?
    }
}

struct SaveWorker {
    store: Arc<DocumentStore>,
    writer: Arc<AtomicWriter>,
    rx: mpsc::Receiver<Waiter>,
}

impl SaveWorker {
    async fn run(mut self) {
        debug!(path = %self.writer.path().display(), "Persistence worker started");

        while let Some(first) = self.rx.recv().await {
            let mut waiters = vec![first];
            while let Ok(next) = self.rx.try_recv() {
                waiters.push(next);
            }

            let revision = self.store.revision();
            let snapshot = self.store.snapshot();
            let result = self
                .writer
                .write(&snapshot)
                .await
                .map_err(|e| SaveError::Persist(Arc::new(e)));

            match &result {
                Ok(()) => debug!(revision, waiters = waiters.len(), "Snapshot persisted"),
                Err(e) => warn!(revision, waiters = waiters.len(), error = %e, "Snapshot not persisted"),
            }

            for waiter in waiters {
                // The requester may have gone away (client disconnect)
                let _ = waiter.send(result.clone());
            }
        }

        info!("Persistence worker stopped");
    }
}
