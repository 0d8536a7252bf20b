//! Reconciliation of Bridge rows deleted behind the driver's back
//!
//! Only the database rows come back; the kernel device and its address and
//! NAT setup are not restored.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use ovsnet_core::Cancellation;
use ovsnet_ovsdb::{datum, TableUpdates};

use crate::bridge::BridgeManager;

/// Consume forwarded update batches until the channel closes or `cancel` fires.
pub async fn run(
    bridges: Arc<BridgeManager>,
    mut updates: mpsc::UnboundedReceiver<Arc<TableUpdates>>,
    cancel: Cancellation,
) {
    info!("Bridge watcher started");
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Bridge watcher cancelled");
                break;
            }
            batch = updates.recv() => batch,
        };
        match batch {
            Some(batch) => handle_batch(&bridges, &batch).await,
            None => {
                debug!("Update stream closed, bridge watcher exiting");
                break;
            }
        }
    }
}

pub fn spawn(
    bridges: Arc<BridgeManager>,
    updates: mpsc::UnboundedReceiver<Arc<TableUpdates>>,
    cancel: Cancellation,
) -> JoinHandle<()> {
    tokio::spawn(run(bridges, updates, cancel))
}

/// Restore every Bridge row the batch deletes, unless the driver deleted it itself.
pub async fn handle_batch(bridges: &BridgeManager, batch: &TableUpdates) {
    for (uuid, update) in batch.table("Bridge") {
        if !update.is_delete() {
            continue;
        }
        let Some(name) = update.old.as_ref().and_then(|row| datum::row_str(row, "name")) else {
            debug!("Deleted bridge {} has no name in its old image", uuid);
            continue;
        };

        if bridges.take_expected_deletion(name).await {
            debug!("Bridge {} was deleted by the driver", name);
            continue;
        }
        if bridges.cache().uuid_by_name("Bridge", name).await.is_some() {
            debug!("Bridge {} already exists again", name);
            continue;
        }

        info!("Bridge {} disappeared from the database, restoring its rows", name);
        if let Err(e) = bridges.restore_bridge_rows(name).await {
            error!("Failed to restore bridge {}: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestNode;
    use ovsnet_core::cancellation;
    use std::time::Duration;

    #[tokio::test]
    async fn test_restores_bridge_deleted_out_of_band() {
        let mut node = TestNode::start().await;
        node.bridges.ensure_bridge("ovsbr-aaaaa", "sgw", "aaaaa").await.unwrap();
        node.reconcile().await;
        let (old_uuid, _) = node.db.row_by_name("Bridge", "ovsbr-aaaaa").unwrap();

        node.db.delete_out_of_band("Bridge", "ovsbr-aaaaa");
        assert!(node.db.row_by_name("Port", "ovsbr-aaaaa").is_none());
        node.reconcile().await;

        let (new_uuid, _) = node.db.row_by_name("Bridge", "ovsbr-aaaaa").unwrap();
        assert_ne!(new_uuid, old_uuid);
        assert_eq!(node.db.root_bridges(), vec![new_uuid]);
        assert!(node.db.row_by_name("Port", "ovsbr-aaaaa").is_some());
        // the surviving BridgeOpt row is reused, not duplicated
        assert_eq!(node.db.rows("BridgeOpt").len(), 1);
        assert_eq!(
            node.bridges.bridge_service_type("ovsbr-aaaaa").await.unwrap().as_deref(),
            Some("sgw")
        );
    }

    #[tokio::test]
    async fn test_lost_bridge_opt_falls_back_to_sentinel() {
        let mut node = TestNode::start().await;
        node.bridges.ensure_bridge("ovsbr-aaaaa", "pgw", "aaaaa").await.unwrap();
        node.reconcile().await;

        node.db.delete_out_of_band("BridgeOpt", "ovsbr-aaaaa");
        node.db.delete_out_of_band("Bridge", "ovsbr-aaaaa");
        node.reconcile().await;

        assert!(node.db.row_by_name("Bridge", "ovsbr-aaaaa").is_some());
        assert_eq!(
            node.bridges.bridge_network_id("ovsbr-aaaaa").await.unwrap().as_deref(),
            Some("none")
        );
    }

    #[tokio::test]
    async fn test_driver_deletions_are_not_restored() {
        let mut node = TestNode::start().await;
        node.bridges.ensure_bridge("ovsbr-aaaaa", "", "aaaaa").await.unwrap();
        node.reconcile().await;
        let writes = node.db.write_transactions().len();

        node.bridges.delete_bridge("ovsbr-aaaaa").await.unwrap();
        node.reconcile().await;

        assert!(node.db.row_by_name("Bridge", "ovsbr-aaaaa").is_none());
        assert!(node.db.root_bridges().is_empty());
        assert_eq!(node.db.write_transactions().len(), writes + 1);
        assert!(!node.bridges.take_expected_deletion("ovsbr-aaaaa").await);
    }

    #[tokio::test]
    async fn test_other_tables_are_ignored() {
        let mut node = TestNode::start().await;
        node.bridges.ensure_bridge("ovsbr-aaaaa", "", "aaaaa").await.unwrap();
        node.bridges.add_port("ovsbr-aaaaa", "ovs-veth0-9f8a2").await.unwrap();
        node.reconcile().await;
        let writes = node.db.write_transactions().len();

        node.bridges.delete_port("ovsbr-aaaaa", "ovs-veth0-9f8a2").await.unwrap();
        node.reconcile().await;
        assert_eq!(node.db.write_transactions().len(), writes + 1);
    }

    #[tokio::test]
    async fn test_spawned_watcher_stops_on_cancel() {
        let node = TestNode::start().await;
        let (handle, token) = cancellation();
        let (_tx, rx) = mpsc::unbounded_channel();
        let task = spawn(node.bridges.clone(), rx, token);
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawned_watcher_exits_when_stream_closes() {
        let node = TestNode::start().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = spawn(node.bridges.clone(), rx, Cancellation::never());
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }
}
