//! Operation Module
//!
//! An operation is the SQL text a client submits against one node. It is
//! classified as a read or a write and, for the simple statement shapes
//! used against the fragmented table, parsed far enough to find the record
//! key and the partition date.

mod parser;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lock::RecordKey;

pub use parser::strip_leading_comments;

/// Read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Read,
    Write,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Read => write!(f, "read"),
            OperationKind::Write => write!(f, "write"),
        }
    }
}

/// Transaction isolation level requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    #[default]
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Level as written in `SET TRANSACTION ISOLATION LEVEL ...`
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Whether reads at this level wait for in-flight writes on the same key
    pub fn waits_for_writers(&self) -> bool {
        !matches!(self, IsolationLevel::ReadUncommitted)
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Literal value appearing in a statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// Convert to SQL literal
    pub fn to_sql(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    /// Unquoted form used for record keys
    pub fn key_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
        }
    }

    /// Interpret the value as a partition date
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::String(s) => parse_date(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::from(s.clone()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

/// Parse the leading `YYYY-MM-DD` of a date or datetime string
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Column list of a SELECT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    All,
    Columns(Vec<String>),
}

/// WHERE clause shapes the core understands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// No WHERE clause
    All,
    /// Conjunction of `column = literal`
    Equals(Vec<(String, Value)>),
    /// Anything else, kept verbatim
    Unsupported(String),
}

impl Filter {
    /// Literal compared against `column`, if any
    pub fn value_of(&self, column: &str) -> Option<&Value> {
        match self {
            Filter::Equals(terms) => terms
                .iter()
                .find(|(c, _)| c.eq_ignore_ascii_case(column))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Parsed statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Statement {
    Select {
        table: String,
        projection: Projection,
        filter: Filter,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        filter: Filter,
    },
    Delete {
        table: String,
        filter: Filter,
    },
    /// Statement forwarded verbatim
    Other { table: Option<String> },
}

impl Statement {
    pub fn table(&self) -> Option<&str> {
        match self {
            Statement::Select { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => Some(table),
            Statement::Other { table } => table.as_deref(),
        }
    }
}

/// A client operation against one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// SQL text as submitted (trailing semicolon removed)
    pub text: String,
    pub kind: OperationKind,
    pub statement: Statement,
}

impl Operation {
    /// Parse operation text
    pub fn parse(text: &str) -> Result<Self> {
        let statements = parser::split_sql_statements(text);
        let sql = match statements.as_slice() {
            [] => return Err(Error::Parse("empty operation".into())),
            [single] => *single,
            _ => {
                return Err(Error::Parse(format!(
                    "expected one statement, found {}",
                    statements.len()
                )))
            }
        };

        let kind = if parser::is_write_query(sql) {
            OperationKind::Write
        } else {
            OperationKind::Read
        };

        Ok(Self {
            text: sql.to_string(),
            kind,
            statement: parser::parse_statement(sql),
        })
    }

    pub fn is_write(&self) -> bool {
        self.kind == OperationKind::Write
    }

    /// Record key this operation touches. Statements that do not pin a
    /// single row by `key_column` map to a table-wide key.
    pub fn record_key(&self, key_column: &str) -> RecordKey {
        let table = self.statement.table().unwrap_or("*");
        let value = match &self.statement {
            Statement::Select { filter, .. }
            | Statement::Update { filter, .. }
            | Statement::Delete { filter, .. } => filter.value_of(key_column).cloned(),
            Statement::Insert { columns, values, .. } => columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(key_column))
                .and_then(|i| values.get(i).cloned()),
            Statement::Other { .. } => None,
        };

        match value {
            Some(v) => RecordKey::row(table, v.key_string()),
            None => RecordKey::table(table),
        }
    }

    /// Partition date carried by the operation itself
    pub fn partition_value(&self, partition_column: &str) -> Option<NaiveDate> {
        match &self.statement {
            Statement::Insert { columns, values, .. } => columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(partition_column))
                .and_then(|i| values.get(i))
                .and_then(Value::as_date),
            Statement::Update { assignments, .. } => assignments
                .iter()
                .find(|(c, _)| c.eq_ignore_ascii_case(partition_column))
                .and_then(|(_, v)| v.as_date()),
            _ => None,
        }
    }

    /// Shortened text for logs
    pub fn summary(&self) -> &str {
        let end = self
            .text
            .char_indices()
            .nth(80)
            .map(|(i, _)| i)
            .unwrap_or(self.text.len());
        &self.text[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_and_key_for_update() {
        let op = Operation::parse("UPDATE trans SET amount = 500 WHERE trans_id = 42;").unwrap();
        assert!(op.is_write());
        assert_eq!(op.text, "UPDATE trans SET amount = 500 WHERE trans_id = 42");
        assert_eq!(op.record_key("trans_id"), RecordKey::row("trans", "42"));
        assert_eq!(op.partition_value("date"), None);
    }

    #[test]
    fn test_insert_carries_partition_value() {
        let op = Operation::parse(
            "INSERT INTO trans (trans_id, account_id, date, amount) VALUES (9001, 12, '1996-05-15', 100.5)",
        )
        .unwrap();
        assert_eq!(op.record_key("trans_id"), RecordKey::row("trans", "9001"));
        assert_eq!(
            op.partition_value("date"),
            NaiveDate::from_ymd_opt(1996, 5, 15)
        );
    }

    #[test]
    fn test_unkeyed_read_maps_to_table_key() {
        let op = Operation::parse("select * from trans where amount > 10").unwrap();
        assert_eq!(op.kind, OperationKind::Read);
        assert_eq!(op.record_key("trans_id"), RecordKey::table("trans"));
    }

    #[test]
    fn test_rejects_empty_and_multi_statement() {
        assert!(matches!(Operation::parse("  ;  "), Err(Error::Parse(_))));
        assert!(matches!(
            Operation::parse("DELETE FROM trans WHERE trans_id = 1; DELETE FROM trans WHERE trans_id = 2"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_isolation_serde_and_policy() {
        let level: IsolationLevel = serde_json::from_str("\"READ_UNCOMMITTED\"").unwrap();
        assert_eq!(level, IsolationLevel::ReadUncommitted);
        assert!(!level.waits_for_writers());
        assert!(IsolationLevel::Serializable.waits_for_writers());
        assert_eq!(IsolationLevel::default().as_sql(), "REPEATABLE READ");
    }

    #[test]
    fn test_parse_date_accepts_datetime() {
        assert_eq!(
            parse_date("1997-01-01 00:00:00"),
            NaiveDate::from_ymd_opt(1997, 1, 1)
        );
        assert_eq!(parse_date("yesterday"), None);
    }
}
