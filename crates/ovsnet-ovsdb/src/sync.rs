//! The cache synchronizer: the single writer of [`DbCache`].
//!
//! Every batch is applied to the cache first and only then forwarded to the
//! optional downstream consumer, so a consumer reading the cache for a batch
//! always sees that batch applied.

use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ovsnet_core::{Cancellation, RetryError, RetryPolicy};

use crate::cache::DbCache;
use crate::client::OvsdbTransport;
use crate::context::ContextCache;
use crate::error::SyncError;
use crate::protocol::{TableUpdates, DATABASE};

/// Receives every batch after it has been applied to the cache.
pub type UpdateForwarder = mpsc::UnboundedSender<Arc<TableUpdates>>;

/// Running synchronizer. Dropping the handle leaves the task running; use
/// [`SyncHandle::abort`] or the cancellation token to stop it.
#[derive(Debug)]
pub struct SyncHandle {
    applied: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Number of incremental batches applied so far (the initial snapshot is not counted).
    pub fn applied(&self) -> u64 {
        *self.applied.borrow()
    }

    /// Wait until at least `count` incremental batches have been applied.
    /// Returns false if the task stopped first.
    pub async fn wait_applied(&self, count: u64) -> bool {
        let mut rx = self.applied.clone();
        let reached = rx.wait_for(|applied| *applied >= count).await.is_ok();
        reached
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Subscribe to every table, load the snapshot, rebuild the context cache,
/// start the apply loop and wait for the root row to show up.
pub async fn start(
    transport: Arc<dyn OvsdbTransport>,
    cache: DbCache,
    contexts: &ContextCache,
    forward: Option<UpdateForwarder>,
    root_poll: &RetryPolicy,
    cancel: &Cancellation,
) -> Result<SyncHandle, SyncError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let initial = transport.monitor_all(DATABASE, tx).await?;
    debug!("Initial OVSDB snapshot covers {} tables", initial.tables.len());
    cache.apply(&initial).await;
    contexts.rebuild(&cache).await;

    let (applied_tx, applied_rx) = watch::channel(0u64);
    let task = tokio::spawn(run(rx, cache.clone(), forward, applied_tx, cancel.clone()));
    let handle = SyncHandle {
        applied: applied_rx,
        task,
    };

    let waited = root_poll
        .poll_until(cancel, "root Open_vSwitch row", || {
            let cache = cache.clone();
            async move { Ok::<_, Infallible>(cache.root_uuid().await.is_some()) }
        })
        .await;

    match waited {
        Ok(()) => {
            info!("OVSDB cache synchronized");
            Ok(handle)
        }
        Err(e) => {
            handle.abort();
            match e {
                RetryError::Cancelled => Err(SyncError::Cancelled),
                RetryError::Exhausted { attempts, .. } => Err(SyncError::RootRow(format!(
                    "not visible after {} polls",
                    attempts
                ))),
            }
        }
    }
}

async fn run(
    mut updates: mpsc::UnboundedReceiver<TableUpdates>,
    cache: DbCache,
    mut forward: Option<UpdateForwarder>,
    applied: watch::Sender<u64>,
    cancel: Cancellation,
) {
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("OVSDB cache synchronizer cancelled");
                break;
            }
            batch = updates.recv() => batch,
        };
        let Some(batch) = batch else {
            warn!("OVSDB update stream ended, cache is no longer synchronized");
            break;
        };

        cache.apply(&batch).await;

        if let Some(tx) = &forward {
            if tx.send(Arc::new(batch)).is_err() {
                debug!("Update consumer is gone, no longer forwarding");
                forward = None;
            }
        }

        // counted once forwarded, so a waiter also sees the batch queued downstream
        applied.send_modify(|n| *n += 1);
    }
}
