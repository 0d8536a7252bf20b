//! In-memory mirror of the switch database.
//!
//! Only the synchronizer task writes; every other component gets cloned
//! snapshots through the read accessors.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::protocol::{datum, Row, TableUpdates};

/// Table name of the root singleton row.
pub const ROOT_TABLE: &str = "Open_vSwitch";

/// row uuid -> row
pub type TableRows = HashMap<String, Row>;

/// table -> row uuid -> row
#[derive(Debug, Clone, Default)]
pub struct DbCache {
    tables: Arc<RwLock<HashMap<String, TableRows>>>,
}

impl DbCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one change batch. A non-empty new image inserts or replaces the row,
    /// an empty or missing one removes it.
    pub(crate) async fn apply(&self, updates: &TableUpdates) {
        let mut tables = self.tables.write().await;
        for (table, rows) in &updates.tables {
            let cached = tables.entry(table.clone()).or_default();
            for (uuid, update) in rows {
                match &update.new {
                    Some(new) if !new.is_empty() => {
                        cached.insert(uuid.clone(), new.clone());
                    }
                    _ => {
                        cached.remove(uuid);
                    }
                }
            }
        }
        debug!("Applied OVSDB update touching {} tables", updates.tables.len());
    }

    /// Rows of `table` matching `predicate`, as of the last applied batch.
    pub async fn lookup<P>(&self, table: &str, predicate: P) -> Vec<(String, Row)>
    where
        P: Fn(&str, &Row) -> bool,
    {
        let tables = self.tables.read().await;
        tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(uuid, row)| predicate(uuid, row))
                    .map(|(uuid, row)| (uuid.clone(), row.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn table(&self, table: &str) -> TableRows {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn row(&self, table: &str, uuid: &str) -> Option<Row> {
        self.tables
            .read()
            .await
            .get(table)
            .and_then(|rows| rows.get(uuid))
            .cloned()
    }

    /// Uuid of the first row in `table` whose `name` column equals `name`.
    pub async fn uuid_by_name(&self, table: &str, name: &str) -> Option<String> {
        let tables = self.tables.read().await;
        tables.get(table)?.iter().find_map(|(uuid, row)| {
            (datum::row_str(row, "name") == Some(name)).then(|| uuid.clone())
        })
    }

    /// Identifier of the root `Open_vSwitch` row, once it has been seen.
    pub async fn root_uuid(&self) -> Option<String> {
        let tables = self.tables.read().await;
        tables.get(ROOT_TABLE)?.keys().next().cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, TableRows> {
        self.tables.read().await.clone()
    }
}
