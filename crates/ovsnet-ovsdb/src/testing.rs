//! In-memory stand-in for ovsdb-server, for tests of everything above the wire.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::client::OvsdbTransport;
use crate::error::OvsdbError;
use crate::protocol::{
    datum, Condition, Function, Mutator, OpKind, Operation, OperationResult, Row, RowUpdate,
    TableUpdates,
};
use crate::sync::SyncHandle;

pub const ROOT_UUID: &str = "5b4e5a52-0000-4000-8000-000000000001";

type Tables = BTreeMap<String, BTreeMap<String, Row>>;

#[derive(Default)]
struct State {
    tables: Tables,
    subscriber: Option<mpsc::UnboundedSender<TableUpdates>>,
    transactions: Vec<Vec<Operation>>,
    failures: VecDeque<(usize, String)>,
    short_replies: usize,
    unreachable: bool,
    published: u64,
    next_uuid: u64,
}

/// Executes select/insert/update/mutate/delete against in-memory tables with
/// `named-uuid` resolution and Port/Interface garbage collection, records every
/// submitted transaction and publishes row diffs to the monitor subscriber.
pub struct MemoryOvsdb {
    state: Mutex<State>,
}

impl Default for MemoryOvsdb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOvsdb {
    /// A database holding just the root `Open_vSwitch` row.
    pub fn new() -> Self {
        let db = Self::without_root();
        db.seed_root();
        db
    }

    pub fn without_root() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn root_uuid(&self) -> String {
        ROOT_UUID.to_string()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn seed_root(&self) {
        let mut row = Row::new();
        row.insert("bridges".into(), datum::set(vec![]));
        self.modify(|tables, _| {
            tables
                .entry("Open_vSwitch".into())
                .or_default()
                .insert(ROOT_UUID.to_string(), row);
        });
    }

    /// Insert a row out of band; returns its uuid.
    pub fn seed(&self, table: &str, row: Row) -> String {
        let mut uuid = String::new();
        self.modify(|tables, next| {
            uuid = fresh_uuid(next);
            tables
                .entry(table.to_string())
                .or_default()
                .insert(uuid.clone(), row);
        });
        uuid
    }

    /// Delete every row of `table` named `name` out of band, as an administrator would.
    pub fn delete_out_of_band(&self, table: &str, name: &str) {
        self.modify(|tables, _| {
            let before = tables.clone();
            let mut removed = Vec::new();
            if let Some(rows) = tables.get_mut(table) {
                rows.retain(|uuid, row| {
                    let keep = datum::row_str(row, "name") != Some(name);
                    if !keep {
                        removed.push(datum::uuid(uuid));
                    }
                    keep
                });
            }
            // drop dangling references from the root row as well
            for root in tables.entry("Open_vSwitch".into()).or_default().values_mut() {
                if let Some(bridges) = root.get("bridges") {
                    let kept = datum::set_elements(bridges)
                        .into_iter()
                        .filter(|b| !removed.contains(*b))
                        .cloned()
                        .collect();
                    root.insert("bridges".into(), datum::set(kept));
                }
            }
            collect_garbage(&before, tables);
        });
    }

    /// Make the next write transaction fail at operation `index` with `message`.
    /// Nothing is committed. Select-only transactions are not affected.
    pub fn fail_next(&self, index: usize, message: &str) {
        self.lock().failures.push_back((index, message.to_string()));
    }

    /// Commit the next write transaction but drop its last result.
    pub fn short_reply_next(&self) {
        self.lock().short_replies += 1;
    }

    /// Fail every request at the transport level.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn transactions(&self) -> Vec<Vec<Operation>> {
        self.lock().transactions.clone()
    }

    /// Transactions that did anything besides select.
    pub fn write_transactions(&self) -> Vec<Vec<Operation>> {
        self.transactions()
            .into_iter()
            .filter(|ops| ops.iter().any(|op| op.op != OpKind::Select))
            .collect()
    }

    /// Number of update batches sent to the monitor subscriber.
    pub fn published(&self) -> u64 {
        self.lock().published
    }

    pub fn rows(&self, table: &str) -> Vec<(String, Row)> {
        self.lock()
            .tables
            .get(table)
            .map(|rows| rows.iter().map(|(u, r)| (u.clone(), r.clone())).collect())
            .unwrap_or_default()
    }

    pub fn row_by_name(&self, table: &str, name: &str) -> Option<(String, Row)> {
        self.rows(table)
            .into_iter()
            .find(|(_, row)| datum::row_str(row, "name") == Some(name))
    }

    /// Uuids referenced by the root row's `bridges` set.
    pub fn root_bridges(&self) -> Vec<String> {
        self.lock()
            .tables
            .get("Open_vSwitch")
            .and_then(|rows| rows.get(ROOT_UUID))
            .and_then(|row| row.get("bridges"))
            .map(|set| {
                datum::set_elements(set)
                    .into_iter()
                    .filter_map(datum::as_uuid)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn modify<F>(&self, f: F)
    where
        F: FnOnce(&mut Tables, &mut u64),
    {
        let mut state = self.lock();
        let before = state.tables.clone();
        let State {
            tables, next_uuid, ..
        } = &mut *state;
        f(tables, next_uuid);
        publish(&mut state, &before);
    }
}

fn fresh_uuid(next: &mut u64) -> String {
    *next += 1;
    format!("5b4e5a52-0000-4000-9000-{:012x}", next)
}

/// Send the diff between `before` and the current tables to the subscriber.
fn publish(state: &mut State, before: &Tables) {
    let mut updates = TableUpdates::default();
    let tables: Vec<&String> = before.keys().chain(state.tables.keys()).collect();
    for table in tables {
        let old_rows = before.get(table);
        let new_rows = state.tables.get(table);
        let uuids: Vec<&String> = old_rows
            .into_iter()
            .flat_map(|r| r.keys())
            .chain(new_rows.into_iter().flat_map(|r| r.keys()))
            .collect();
        for uuid in uuids {
            let old = old_rows.and_then(|r| r.get(uuid));
            let new = new_rows.and_then(|r| r.get(uuid));
            if old == new {
                continue;
            }
            updates.tables.entry(table.clone()).or_default().insert(
                uuid.clone(),
                RowUpdate {
                    old: old.cloned(),
                    new: new.cloned(),
                },
            );
        }
    }

    if updates.is_empty() {
        return;
    }
    if let Some(tx) = &state.subscriber {
        if tx.send(updates).is_ok() {
            state.published += 1;
        }
    }
}

/// Ports that lost their last bridge reference and interfaces that lost their
/// last port reference are dropped, like ovsdb-server does for non-root tables.
fn collect_garbage(before: &Tables, tables: &mut Tables) {
    fn referenced(tables: &Tables, table: &str, column: &str) -> HashSet<String> {
        tables
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.values())
            .filter_map(|row| row.get(column))
            .flat_map(|set| datum::set_elements(set).into_iter().filter_map(datum::as_uuid))
            .map(str::to_string)
            .collect()
    }

    for (owner, column, child) in [("Bridge", "ports", "Port"), ("Port", "interfaces", "Interface")] {
        let was = referenced(before, owner, column);
        let now = referenced(tables, owner, column);
        if let Some(rows) = tables.get_mut(child) {
            rows.retain(|uuid, _| !was.contains(uuid) || now.contains(uuid));
        }
    }
}

fn matches(uuid: &str, row: &Row, conditions: &[Condition]) -> bool {
    conditions.iter().all(|c| {
        let actual = if c.column == "_uuid" {
            datum::uuid(uuid)
        } else {
            row.get(&c.column).cloned().unwrap_or(Value::Null)
        };
        match c.function {
            Function::Eq => actual == c.value,
            Function::Ne => actual != c.value,
            Function::Includes => datum::set_elements(&actual).contains(&&c.value),
            Function::Excludes => !datum::set_elements(&actual).contains(&&c.value),
        }
    })
}

/// Replace `["named-uuid", n]` with the uuid inserted earlier in the same transaction.
fn resolve(value: &Value, names: &HashMap<String, String>) -> Result<Value, String> {
    if let Some([tag, name]) = value.as_array().map(Vec::as_slice) {
        if tag == "named-uuid" {
            let name = name.as_str().unwrap_or_default();
            return names
                .get(name)
                .map(|uuid| datum::uuid(uuid))
                .ok_or_else(|| format!("unknown named-uuid {}", name));
        }
    }
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(v, names))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        _ => Ok(value.clone()),
    }
}

fn resolve_row(row: &Row, names: &HashMap<String, String>) -> Result<Row, String> {
    row.iter()
        .map(|(k, v)| resolve(v, names).map(|v| (k.clone(), v)))
        .collect()
}

fn execute(
    tables: &mut Tables,
    next_uuid: &mut u64,
    names: &mut HashMap<String, String>,
    op: &Operation,
) -> Result<OperationResult, String> {
    let conditions = op.conditions.as_deref().unwrap_or(&[]);
    let rows = tables.entry(op.table.clone()).or_default();

    match op.op {
        OpKind::Select => {
            let selected = rows
                .iter()
                .filter(|(uuid, row)| matches(uuid, row, conditions))
                .map(|(uuid, row)| {
                    let mut out = row.clone();
                    out.insert("_uuid".into(), datum::uuid(uuid));
                    out
                })
                .collect();
            Ok(OperationResult {
                rows: Some(selected),
                ..Default::default()
            })
        }
        OpKind::Insert => {
            let row = resolve_row(op.row.as_ref().unwrap_or(&Row::new()), names)?;
            let uuid = fresh_uuid(next_uuid);
            if let Some(name) = &op.uuid_name {
                names.insert(name.clone(), uuid.clone());
            }
            rows.insert(uuid.clone(), row);
            Ok(OperationResult {
                uuid: Some(datum::uuid(&uuid)),
                ..Default::default()
            })
        }
        OpKind::Update => {
            let changes = resolve_row(op.row.as_ref().unwrap_or(&Row::new()), names)?;
            let mut count = 0;
            for (uuid, row) in rows.iter_mut() {
                if matches(uuid, row, conditions) {
                    row.extend(changes.clone());
                    count += 1;
                }
            }
            Ok(OperationResult {
                count: Some(count),
                ..Default::default()
            })
        }
        OpKind::Mutate => {
            let mut count = 0;
            for (uuid, row) in rows.iter_mut() {
                if !matches(uuid, row, conditions) {
                    continue;
                }
                for mutation in op.mutations.as_deref().unwrap_or(&[]) {
                    let value = resolve(&mutation.value, names)?;
                    let current = row.get(&mutation.column).cloned().unwrap_or(json!(["set", []]));
                    let mut elements: Vec<Value> =
                        datum::set_elements(&current).into_iter().cloned().collect();
                    for element in datum::set_elements(&value) {
                        match mutation.mutator {
                            Mutator::Insert => {
                                if !elements.contains(element) {
                                    elements.push(element.clone());
                                }
                            }
                            Mutator::Delete => elements.retain(|e| e != element),
                        }
                    }
                    row.insert(mutation.column.clone(), datum::set(elements));
                }
                count += 1;
            }
            Ok(OperationResult {
                count: Some(count),
                ..Default::default()
            })
        }
        OpKind::Delete => {
            let before = rows.len();
            rows.retain(|uuid, row| !matches(uuid, row, conditions));
            Ok(OperationResult {
                count: Some((before - rows.len()) as u64),
                ..Default::default()
            })
        }
    }
}

#[async_trait]
impl OvsdbTransport for MemoryOvsdb {
    async fn transact(
        &self,
        _database: &str,
        operations: &[Operation],
    ) -> Result<Vec<OperationResult>, OvsdbError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(OvsdbError::Closed);
        }
        state.transactions.push(operations.to_vec());

        let writes = operations.iter().any(|op| op.op != OpKind::Select);
        let injected = if writes { state.failures.pop_front() } else { None };
        let before = state.tables.clone();
        let mut working = state.tables.clone();
        let mut next_uuid = state.next_uuid;
        let mut names = HashMap::new();
        let mut results = Vec::with_capacity(operations.len());

        for (index, op) in operations.iter().enumerate() {
            let outcome = match &injected {
                Some((at, message)) if *at == index => Err(message.clone()),
                _ => execute(&mut working, &mut next_uuid, &mut names, op),
            };
            match outcome {
                Ok(result) => results.push(result),
                Err(message) => {
                    // failed transactions commit nothing; unexecuted operations answer null
                    results.push(OperationResult {
                        error: Some(message),
                        ..Default::default()
                    });
                    results.resize(operations.len(), OperationResult::default());
                    return Ok(results);
                }
            }
        }

        collect_garbage(&before, &mut working);
        state.tables = working;
        state.next_uuid = next_uuid;
        publish(&mut state, &before);

        if writes && state.short_replies > 0 {
            state.short_replies -= 1;
            results.pop();
        }
        Ok(results)
    }

    async fn monitor_all(
        &self,
        _database: &str,
        updates: mpsc::UnboundedSender<TableUpdates>,
    ) -> Result<TableUpdates, OvsdbError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(OvsdbError::Closed);
        }
        let mut initial = TableUpdates::default();
        for (table, rows) in &state.tables {
            let entry = initial.tables.entry(table.clone()).or_default();
            for (uuid, row) in rows {
                entry.insert(
                    uuid.clone(),
                    RowUpdate {
                        old: None,
                        new: Some(row.clone()),
                    },
                );
            }
        }
        state.subscriber = Some(updates);
        Ok(initial)
    }
}

/// Wait until the synchronizer has applied everything the database published.
pub async fn settle(db: &MemoryOvsdb, handle: &SyncHandle) {
    handle.wait_applied(db.published()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Mutation;
    use crate::Transaction;

    fn named(name: &str) -> Row {
        let mut row = Row::new();
        row.insert("name".into(), json!(name));
        row
    }

    #[tokio::test]
    async fn test_named_uuid_resolution_and_gc() {
        let db = MemoryOvsdb::new();
        let mut port = named("br0");
        port.insert("interfaces".into(), datum::named_uuid("intf"));
        let mut bridge = named("br0");
        bridge.insert("ports".into(), datum::named_uuid("port"));

        Transaction::new()
            .add(Operation::insert_named("Interface", named("br0"), "intf"))
            .add(Operation::insert_named("Port", port, "port"))
            .add(Operation::insert_named("Bridge", bridge, "bridge"))
            .add(Operation::mutate(
                "Open_vSwitch",
                vec![Condition::uuid_eq(ROOT_UUID)],
                vec![Mutation::insert("bridges", datum::set(vec![datum::named_uuid("bridge")]))],
            ))
            .commit(&db)
            .await
            .unwrap();

        let (bridge_uuid, _) = db.row_by_name("Bridge", "br0").unwrap();
        assert_eq!(db.root_bridges(), vec![bridge_uuid]);
        let (_, port) = db.row_by_name("Port", "br0").unwrap();
        assert!(datum::as_uuid(&port["interfaces"]).is_some());

        db.delete_out_of_band("Bridge", "br0");
        assert!(db.row_by_name("Port", "br0").is_none());
        assert!(db.row_by_name("Interface", "br0").is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_commits_nothing() {
        let db = MemoryOvsdb::new();
        db.fail_next(1, "constraint violation");
        let err = Transaction::new()
            .add(Operation::insert("Bridge", named("br0")))
            .add(Operation::insert("BridgeOpt", named("br0")))
            .commit(&db)
            .await
            .unwrap_err();
        assert_eq!(err.first_error(), Some("constraint violation"));
        assert!(db.rows("Bridge").is_empty());
        assert_eq!(db.transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_select_and_delete_by_condition() {
        let db = MemoryOvsdb::new();
        db.seed("Port", named("a"));
        db.seed("Port", named("b"));

        let results = Transaction::new()
            .add(Operation::select("Port", vec![Condition::eq("name", "a")]))
            .add(Operation::delete("Port", vec![Condition::eq("name", "b")]))
            .commit(&db)
            .await
            .unwrap();
        assert_eq!(results[0].rows().len(), 1);
        assert_eq!(results[1].count, Some(1));
        assert_eq!(db.rows("Port").len(), 1);
    }
}
