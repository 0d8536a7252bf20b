//! OVSDB (RFC 7047) wire types: operations, conditions, mutations, results and table updates.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// The database every operation in this crate targets.
pub const DATABASE: &str = "Open_vSwitch";

/// A row image: column name -> OVSDB datum.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Select,
    Insert,
    Update,
    Mutate,
    Delete,
}

/// One operation of a `transact` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op: OpKind,
    pub table: String,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutations: Option<Vec<Mutation>>,
    #[serde(rename = "uuid-name", default, skip_serializing_if = "Option::is_none")]
    pub uuid_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
}

impl Operation {
    fn base(op: OpKind, table: &str) -> Self {
        Self {
            op,
            table: table.to_string(),
            conditions: None,
            row: None,
            mutations: None,
            uuid_name: None,
            columns: None,
        }
    }

    pub fn select(table: &str, conditions: Vec<Condition>) -> Self {
        Self {
            conditions: Some(conditions),
            ..Self::base(OpKind::Select, table)
        }
    }

    pub fn insert(table: &str, row: Row) -> Self {
        Self {
            row: Some(row),
            ..Self::base(OpKind::Insert, table)
        }
    }

    /// Insert whose uuid can be referenced by later operations as `["named-uuid", name]`.
    pub fn insert_named(table: &str, row: Row, uuid_name: &str) -> Self {
        Self {
            uuid_name: Some(uuid_name.to_string()),
            ..Self::insert(table, row)
        }
    }

    pub fn delete(table: &str, conditions: Vec<Condition>) -> Self {
        Self {
            conditions: Some(conditions),
            ..Self::base(OpKind::Delete, table)
        }
    }

    pub fn mutate(table: &str, conditions: Vec<Condition>, mutations: Vec<Mutation>) -> Self {
        Self {
            conditions: Some(conditions),
            mutations: Some(mutations),
            ..Self::base(OpKind::Mutate, table)
        }
    }

    pub fn update(table: &str, conditions: Vec<Condition>, row: Row) -> Self {
        Self {
            conditions: Some(conditions),
            row: Some(row),
            ..Self::base(OpKind::Update, table)
        }
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Function {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "includes")]
    Includes,
    #[serde(rename = "excludes")]
    Excludes,
}

/// `[column, function, value]`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub function: Function,
    pub value: Value,
}

impl Condition {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self {
            column: column.to_string(),
            function: Function::Eq,
            value: value.into(),
        }
    }

    pub fn uuid_eq(uuid: &str) -> Self {
        Self::eq("_uuid", datum::uuid(uuid))
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.column, &self.function, &self.value).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (column, function, value) = <(String, Function, Value)>::deserialize(deserializer)?;
        Ok(Self {
            column,
            function,
            value,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutator {
    Insert,
    Delete,
}

/// `[column, mutator, value]`
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub column: String,
    pub mutator: Mutator,
    pub value: Value,
}

impl Mutation {
    pub fn insert(column: &str, value: Value) -> Self {
        Self {
            column: column.to_string(),
            mutator: Mutator::Insert,
            value,
        }
    }

    pub fn delete(column: &str, value: Value) -> Self {
        Self {
            column: column.to_string(),
            mutator: Mutator::Delete,
            value,
        }
    }
}

impl Serialize for Mutation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.column, &self.mutator, &self.value).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Mutation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (column, mutator, value) = <(String, Mutator, Value)>::deserialize(deserializer)?;
        Ok(Self {
            column,
            mutator,
            value,
        })
    }
}

/// Per-operation reply of a `transact` request. `null` entries decode to the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl OperationResult {
    pub fn rows(&self) -> &[Row] {
        self.rows.as_deref().unwrap_or(&[])
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    pub fn inserted_uuid(&self) -> Option<&str> {
        self.uuid.as_ref().and_then(datum::as_uuid)
    }
}

/// Old/new image of one row in a monitor update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Row>,
}

impl RowUpdate {
    /// A missing or empty new image means the row is gone.
    pub fn is_delete(&self) -> bool {
        self.new.as_ref().map_or(true, |row| row.is_empty())
    }
}

/// table -> row uuid -> update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableUpdates {
    pub tables: BTreeMap<String, BTreeMap<String, RowUpdate>>,
}

impl TableUpdates {
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|rows| rows.is_empty())
    }

    pub fn table(&self, name: &str) -> impl Iterator<Item = (&String, &RowUpdate)> {
        self.tables.get(name).into_iter().flat_map(|rows| rows.iter())
    }
}

/// Helpers for the OVSDB JSON encoding of atoms, sets and maps.
pub mod datum {
    use super::*;

    pub fn uuid(id: &str) -> Value {
        json!(["uuid", id])
    }

    pub fn named_uuid(name: &str) -> Value {
        json!(["named-uuid", name])
    }

    pub fn set(items: Vec<Value>) -> Value {
        json!(["set", items])
    }

    pub fn map<'a, I>(pairs: I) -> Value
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let entries: Vec<Value> = pairs.into_iter().map(|(k, v)| json!([k, v])).collect();
        json!(["map", entries])
    }

    fn tagged<'a>(value: &'a Value, tag: &str) -> Option<&'a Value> {
        match value.as_array().map(Vec::as_slice) {
            Some([t, inner]) if t == tag => Some(inner),
            _ => None,
        }
    }

    /// `["uuid", "<id>"]` -> `"<id>"`
    pub fn as_uuid(value: &Value) -> Option<&str> {
        tagged(value, "uuid").and_then(Value::as_str)
    }

    /// Elements of a set. A bare atom is a one-element set.
    pub fn set_elements(value: &Value) -> Vec<&Value> {
        match tagged(value, "set").and_then(Value::as_array) {
            Some(items) => items.iter().collect(),
            None => vec![value],
        }
    }

    /// String entries of a `["map", [[k, v], ...]]` datum.
    pub fn map_entries(value: &Value) -> BTreeMap<String, String> {
        tagged(value, "map")
            .and_then(Value::as_array)
            .map(|pairs| {
                pairs
                    .iter()
                    .filter_map(|pair| match pair.as_array().map(Vec::as_slice) {
                        Some([k, v]) => Some((k.as_str()?.to_string(), v.as_str()?.to_string())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn row_str<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
        row.get(column).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_serialization() {
        let op = Operation::mutate(
            "Open_vSwitch",
            vec![Condition::uuid_eq("abc")],
            vec![Mutation::insert("bridges", datum::set(vec![datum::named_uuid("bridge")]))],
        );
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({
                "op": "mutate",
                "table": "Open_vSwitch",
                "where": [["_uuid", "==", ["uuid", "abc"]]],
                "mutations": [["bridges", "insert", ["set", [["named-uuid", "bridge"]]]]]
            })
        );
    }

    #[test]
    fn test_insert_named_serialization() {
        let mut row = Row::new();
        row.insert("name".into(), json!("ovsbr-28174"));
        let value = serde_json::to_value(Operation::insert_named("Interface", row, "intf")).unwrap();
        assert_eq!(value["uuid-name"], "intf");
        assert_eq!(value["op"], "insert");
        assert!(value.get("where").is_none());
    }

    #[test]
    fn test_result_decoding_with_nulls() {
        let results: Vec<Option<OperationResult>> = serde_json::from_value(json!([
            {"uuid": ["uuid", "1234"]},
            {"rows": [{"name": "br0"}]},
            null,
            {"error": "constraint violation", "details": "duplicate"}
        ]))
        .unwrap();
        let results: Vec<OperationResult> = results.into_iter().map(Option::unwrap_or_default).collect();

        assert_eq!(results[0].inserted_uuid(), Some("1234"));
        assert_eq!(results[1].rows().len(), 1);
        assert!(results[2].error().is_none());
        assert_eq!(results[3].error(), Some("constraint violation"));
    }

    #[test]
    fn test_table_updates_decoding() {
        let updates: TableUpdates = serde_json::from_value(json!({
            "Bridge": {
                "u1": {"new": {"name": "br0"}},
                "u2": {"old": {"name": "br1"}}
            }
        }))
        .unwrap();
        let rows: Vec<_> = updates.table("Bridge").collect();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].1.is_delete());
        assert!(rows[1].1.is_delete());
        assert_eq!(updates.table("Port").count(), 0);
    }

    #[test]
    fn test_datum_helpers() {
        let set = json!(["set", [["uuid", "a"], ["uuid", "b"]]]);
        let ids: Vec<_> = datum::set_elements(&set).into_iter().filter_map(datum::as_uuid).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let single = json!(["uuid", "c"]);
        assert_eq!(datum::set_elements(&single).len(), 1);

        let map = datum::map([("container_id", "abc"), ("container_data", "x")]);
        let entries = datum::map_entries(&map);
        assert_eq!(entries.get("container_id").map(String::as_str), Some("abc"));
        assert!(datum::map_entries(&json!("plain")).is_empty());
    }
}
