//! MariaDB Store
//!
//! Runs operations against a node's MariaDB database through a sqlx pool.

use std::time::Duration;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row};

use super::{NodeStore, QueryOutcome};
use crate::config::{DatabaseConfig, FragmentationConfig};
use crate::error::{Error, Result};
use crate::lock::RecordKey;
use crate::node::NodeId;
use crate::operation::{parse_date, IsolationLevel, Operation};

/// MariaDB-backed store for one node
pub struct MariaDbStore {
    node: NodeId,
    pool: MySqlPool,
    key_column: String,
    partition_column: String,
}

impl MariaDbStore {
    /// Create a store with a lazily connecting pool
    pub fn new(node: NodeId, config: &DatabaseConfig, fragmentation: &FragmentationConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_lazy(&config.url())
            .map_err(|e| Error::Config(format!("invalid database settings for {}: {}", node, e)))?;

        tracing::info!(
            "Store for {} at {}:{}/{} (pool size {})",
            node, config.host, config.port, config.database, config.pool_size
        );

        Ok(Self {
            node,
            pool,
            key_column: fragmentation.key_column.clone(),
            partition_column: fragmentation.partition_column.clone(),
        })
    }

    fn error(&self, e: sqlx::Error) -> Error {
        Error::store(self.node, e.to_string())
    }
}

#[async_trait]
impl NodeStore for MariaDbStore {
    fn node(&self) -> NodeId {
        self.node
    }

    async fn execute(&self, op: &Operation, isolation: IsolationLevel) -> Result<QueryOutcome> {
        let mut conn = self.pool.acquire().await.map_err(|e| self.error(e))?;

        // Session level so it applies to the statement's implicit transaction
        sqlx::query(&format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", isolation.as_sql()))
            .execute(&mut *conn)
            .await
            .map_err(|e| self.error(e))?;

        tracing::debug!("[{}] Executing at {}: {}", self.node, isolation, op.summary());

        if op.is_write() {
            let result = sqlx::query(&op.text)
                .execute(&mut *conn)
                .await
                .map_err(|e| self.error(e))?;
            return Ok(QueryOutcome::Affected {
                affected_rows: result.rows_affected(),
            });
        }

        let rows = sqlx::query(&op.text)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.error(e))?;

        Ok(QueryOutcome::Rows {
            rows: rows.iter().map(row_to_json).collect(),
        })
    }

    async fn partition_value(&self, key: &RecordKey) -> Result<Option<NaiveDate>> {
        let Some(id) = &key.id else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT `{}` FROM `{}` WHERE `{}` = ? LIMIT 1",
            self.partition_column, key.table, self.key_column
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.error(e))?;

        Ok(row.and_then(|row| {
            if let Ok(date) = row.try_get::<Option<NaiveDate>, _>(0) {
                return date;
            }
            if let Ok(datetime) = row.try_get::<Option<NaiveDateTime>, _>(0) {
                return datetime.map(|dt| dt.date());
            }
            row.try_get::<Option<String>, _>(0)
                .ok()
                .flatten()
                .and_then(|s| parse_date(&s))
        }))
    }

    async fn ping(&self) -> Result<()> {
        let result: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.error(e))?;

        if result.0 == 1 {
            Ok(())
        } else {
            Err(Error::store(self.node, "unexpected health check result"))
        }
    }
}

/// Convert a result row to a JSON object, column by column
fn row_to_json(row: &MySqlRow) -> serde_json::Map<String, serde_json::Value> {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), column_value(row, col.ordinal())))
        .collect()
}

fn column_value(row: &MySqlRow, index: usize) -> serde_json::Value {
    use serde_json::Value;

    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveDate>, _>(index) {
        return v.map(|d| Value::from(d.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(index) {
        return v.map(|d| Value::from(d.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    // DECIMAL and other types without a native mapping come over as text
    row.try_get_unchecked::<Option<String>, _>(index)
        .ok()
        .flatten()
        .map(Value::from)
        .unwrap_or(Value::Null)
}
