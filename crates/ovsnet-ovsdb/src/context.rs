//! container id -> opaque container data, stashed in Interface `other_config`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::cache::DbCache;
use crate::protocol::datum;

pub const CONTEXT_KEY: &str = "container_id";
pub const CONTEXT_VALUE: &str = "container_data";

#[derive(Debug, Clone, Default)]
pub struct ContextCache {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl ContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with whatever the cached Interface rows carry.
    /// Rows with a container id but no data map to an empty string.
    pub async fn rebuild(&self, cache: &DbCache) -> usize {
        let mut rebuilt = HashMap::new();
        for row in cache.table("Interface").await.values() {
            let Some(other_config) = row.get("other_config") else {
                continue;
            };
            let config = datum::map_entries(other_config);
            if let Some(container_id) = config.get(CONTEXT_KEY) {
                let data = config.get(CONTEXT_VALUE).cloned().unwrap_or_default();
                rebuilt.insert(container_id.clone(), data);
            }
        }

        let count = rebuilt.len();
        *self.entries.write().await = rebuilt;
        debug!("Context cache rebuilt with {} entries", count);
        count
    }

    #[cfg(test)]
    pub(crate) async fn get(&self, container_id: &str) -> Option<String> {
        self.entries.read().await.get(container_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Row, RowUpdate, TableUpdates};
    use serde_json::json;

    fn interface(name: &str, other_config: serde_json::Value) -> RowUpdate {
        let mut row = Row::new();
        row.insert("name".into(), json!(name));
        row.insert("other_config".into(), other_config);
        RowUpdate {
            old: None,
            new: Some(row),
        }
    }

    #[tokio::test]
    async fn test_rebuild_from_interfaces() {
        let mut updates = TableUpdates::default();
        let rows = updates.tables.entry("Interface".into()).or_default();
        rows.insert(
            "i1".into(),
            interface(
                "ovs-veth0-abcde",
                datum::map([(CONTEXT_KEY, "c1"), (CONTEXT_VALUE, "payload")]),
            ),
        );
        rows.insert("i2".into(), interface("ovsbr-12345", json!(["map", []])));
        rows.insert("i3".into(), interface("ovs-veth0-fffff", datum::map([(CONTEXT_KEY, "c2")])));

        let cache = DbCache::new();
        cache.apply(&updates).await;

        let contexts = ContextCache::new();
        assert_eq!(contexts.rebuild(&cache).await, 2);
        assert_eq!(contexts.get("c1").await.as_deref(), Some("payload"));
        assert_eq!(contexts.get("c2").await.as_deref(), Some(""));
        assert!(contexts.get("missing").await.is_none());
        assert_eq!(contexts.len().await, 2);
    }
}
