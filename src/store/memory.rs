//! In-Memory Store
//!
//! Row store living inside the process. Used by `fragstore start --memory`
//! and by tests. It understands the statement shapes of the operation
//! parser; anything else is rejected as a store error.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::RwLock;

use super::{NodeStore, QueryOutcome};
use crate::error::{Error, Result};
use crate::lock::RecordKey;
use crate::node::NodeId;
use crate::operation::{Filter, IsolationLevel, Operation, Projection, Statement, Value};

/// A stored row: column name to value
pub type Row = BTreeMap<String, Value>;

type Table = BTreeMap<String, Row>;

/// In-process row store for one node
pub struct MemoryStore {
    node: NodeId,
    key_column: String,
    partition_column: String,
    tables: RwLock<HashMap<String, Table>>,
    /// Statements applied, in order
    history: RwLock<Vec<String>>,
    reachable: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new(node: NodeId, key_column: &str, partition_column: &str) -> Self {
        Self {
            node,
            key_column: key_column.to_string(),
            partition_column: partition_column.to_string(),
            tables: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            reachable: AtomicBool::new(true),
            write_delay_ms: AtomicU64::new(0),
        }
    }

    /// Simulate connectivity loss (independent of fault injection)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Hold every write for `delay` before applying it
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Insert rows directly, bypassing history
    pub async fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let table = tables.entry(table.to_string()).or_default();
        for row in rows {
            let key = self.row_key(&row)?;
            table.insert(key, row);
        }
        Ok(())
    }

    /// Look up a row by key
    pub async fn row(&self, table: &str, id: &str) -> Option<Row> {
        let tables = self.tables.read().await;
        tables.get(table).and_then(|t| t.get(id)).cloned()
    }

    /// Number of rows in a table
    pub async fn len(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Statements this store has applied, in order
    pub async fn history(&self) -> Vec<String> {
        self.history.read().await.clone()
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::store(self.node, reason)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(self.error(format!("Can't connect to server on '{}' (111 \"Connection refused\")", self.node)))
        }
    }

    fn row_key(&self, row: &Row) -> Result<String> {
        row.iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(&self.key_column))
            .map(|(_, v)| v.key_string())
            .ok_or_else(|| self.error(format!("Field '{}' doesn't have a default value", self.key_column)))
    }

    fn matches(row: &Row, terms: &[(String, Value)]) -> bool {
        terms.iter().all(|(column, expected)| {
            row.iter()
                .find(|(c, _)| c.eq_ignore_ascii_case(column))
                .map(|(_, v)| v.key_string() == expected.key_string())
                .unwrap_or(false)
        })
    }

    fn matching_keys(&self, table: &Table, filter: &Filter) -> Result<Vec<String>> {
        match filter {
            Filter::All => Ok(table.keys().cloned().collect()),
            Filter::Equals(terms) => Ok(table
                .iter()
                .filter(|(_, row)| Self::matches(row, terms))
                .map(|(k, _)| k.clone())
                .collect()),
            Filter::Unsupported(clause) => {
                Err(self.error(format!("Unsupported WHERE clause for in-memory store: {}", clause)))
            }
        }
    }

    fn project(row: &Row, projection: &Projection) -> serde_json::Map<String, serde_json::Value> {
        match projection {
            Projection::All => row.iter().map(|(c, v)| (c.clone(), v.to_json())).collect(),
            Projection::Columns(columns) => columns
                .iter()
                .map(|c| {
                    let value = row
                        .iter()
                        .find(|(name, _)| name.eq_ignore_ascii_case(c))
                        .map(|(_, v)| v.to_json())
                        .unwrap_or(serde_json::Value::Null);
                    (c.clone(), value)
                })
                .collect(),
        }
    }

    async fn apply_write(&self, op: &Operation) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let affected = match &op.statement {
            Statement::Insert { table, columns, values } => {
                let row: Row = columns.iter().cloned().zip(values.iter().cloned()).collect();
                let key = self.row_key(&row)?;
                let table = tables.entry(table.clone()).or_default();
                if table.contains_key(&key) {
                    return Err(self.error(format!("Duplicate entry '{}' for key 'PRIMARY'", key)));
                }
                table.insert(key, row);
                1
            }
            Statement::Update { table, assignments, filter } => {
                if assignments.iter().any(|(c, _)| c.eq_ignore_ascii_case(&self.key_column)) {
                    return Err(self.error(format!("Updating key column '{}' is not supported", self.key_column)));
                }
                let Some(rows) = tables.get_mut(table) else {
                    self.matching_keys(&Table::new(), filter)?;
                    return Ok(0);
                };
                let keys = self.matching_keys(rows, filter)?;
                for key in &keys {
                    if let Some(row) = rows.get_mut(key) {
                        for (column, value) in assignments {
                            let existing = row
                                .keys()
                                .find(|c| c.eq_ignore_ascii_case(column))
                                .cloned()
                                .unwrap_or_else(|| column.clone());
                            row.insert(existing, value.clone());
                        }
                    }
                }
                keys.len() as u64
            }
            Statement::Delete { table, filter } => {
                let Some(rows) = tables.get_mut(table) else {
                    self.matching_keys(&Table::new(), filter)?;
                    return Ok(0);
                };
                let keys = self.matching_keys(rows, filter)?;
                for key in &keys {
                    rows.remove(key);
                }
                keys.len() as u64
            }
            Statement::Select { .. } | Statement::Other { .. } => {
                return Err(self.error(format!("Unsupported write for in-memory store: {}", op.summary())));
            }
        };

        self.history.write().await.push(op.text.clone());
        Ok(affected)
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    fn node(&self) -> NodeId {
        self.node
    }

    async fn execute(&self, op: &Operation, _isolation: IsolationLevel) -> Result<QueryOutcome> {
        self.check_reachable()?;
        tracing::debug!("[{}] Executing: {}", self.node, op.summary());

        if op.is_write() {
            let delay = self.write_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let affected_rows = self.apply_write(op).await?;
            return Ok(QueryOutcome::Affected { affected_rows });
        }

        match &op.statement {
            Statement::Select { table, projection, filter } => {
                let tables = self.tables.read().await;
                let empty = Table::new();
                let rows = tables.get(table).unwrap_or(&empty);
                let keys = self.matching_keys(rows, filter)?;
                let rows = keys
                    .iter()
                    .filter_map(|k| rows.get(k))
                    .map(|row| Self::project(row, projection))
                    .collect();
                Ok(QueryOutcome::Rows { rows })
            }
            _ => Err(self.error(format!("Unsupported read for in-memory store: {}", op.summary()))),
        }
    }

    async fn partition_value(&self, key: &RecordKey) -> Result<Option<NaiveDate>> {
        self.check_reachable()?;
        let Some(id) = &key.id else {
            return Ok(None);
        };
        let tables = self.tables.read().await;
        Ok(tables
            .get(&key.table)
            .and_then(|t| t.get(id))
            .and_then(|row| {
                row.iter()
                    .find(|(c, _)| c.eq_ignore_ascii_case(&self.partition_column))
                    .and_then(|(_, v)| v.as_date())
            }))
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(NodeId::Master, "trans_id", "date")
    }

    async fn run(store: &MemoryStore, sql: &str) -> Result<QueryOutcome> {
        store
            .execute(&Operation::parse(sql).unwrap(), IsolationLevel::default())
            .await
    }

    #[tokio::test]
    async fn test_insert_update_select_delete() {
        let store = store();
        run(&store, "INSERT INTO trans (trans_id, date, amount) VALUES (1, '1996-05-15', 100)").await.unwrap();

        let outcome = run(&store, "UPDATE trans SET amount = 250 WHERE trans_id = 1").await.unwrap();
        assert_eq!(outcome, QueryOutcome::Affected { affected_rows: 1 });

        let outcome = run(&store, "SELECT amount FROM trans WHERE trans_id = 1").await.unwrap();
        match outcome {
            QueryOutcome::Rows { rows } => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0]["amount"], serde_json::json!(250));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        run(&store, "DELETE FROM trans WHERE trans_id = 1").await.unwrap();
        assert_eq!(store.len("trans").await, 0);
        assert_eq!(store.history().await.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_store_error() {
        let store = store();
        let sql = "INSERT INTO trans (trans_id, date) VALUES (5, '1998-01-01')";
        run(&store, sql).await.unwrap();
        let err = run(&store, sql).await.unwrap_err();
        assert!(matches!(err, Error::Store { node: NodeId::Master, .. }));
        assert!(err.to_string().contains("Duplicate entry '5'"));
    }

    #[tokio::test]
    async fn test_partition_value_read_back() {
        let store = store();
        run(&store, "INSERT INTO trans (trans_id, date) VALUES ('T9', '1999-12-31')").await.unwrap();
        let date = store.partition_value(&RecordKey::row("trans", "T9")).await.unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(1999, 12, 31));
        assert_eq!(store.partition_value(&RecordKey::table("trans")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_everything() {
        let store = store();
        store.set_reachable(false);
        assert!(store.ping().await.is_err());
        assert!(run(&store, "SELECT * FROM trans").await.is_err());
        store.set_reachable(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_unsupported_statement_rejected() {
        let store = store();
        let err = run(&store, "ALTER TABLE trans ADD COLUMN x INT").await.unwrap_err();
        assert!(err.to_string().contains("Unsupported write"));
        assert!(store.history().await.is_empty());
    }
}
