//! FragStore Configuration
//!
//! This module provides configuration structures for the master and
//! fragment nodes, the fragmentation rule and the coordinator.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::node::NodeId;

/// Main FragStore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragStoreConfig {
    /// Per-node database connections
    pub nodes: NodesConfig,

    /// Horizontal fragmentation rule
    #[serde(default)]
    pub fragmentation: FragmentationConfig,

    /// Lock, read gate and health check tuning
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database connections for the three nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesConfig {
    /// Master (central) node, authoritative for all records
    pub master: DatabaseConfig,

    /// Fragment holding records before the boundary
    pub fragment_a: DatabaseConfig,

    /// Fragment holding records at or after the boundary
    pub fragment_b: DatabaseConfig,
}

impl NodesConfig {
    /// Database config of one node
    pub fn get(&self, node: NodeId) -> &DatabaseConfig {
        match node {
            NodeId::Master => &self.master,
            NodeId::FragmentA => &self.fragment_a,
            NodeId::FragmentB => &self.fragment_b,
        }
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// MariaDB host
    pub host: String,

    /// MariaDB port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    pub user: String,

    /// Database password
    pub password: String,

    /// Database name
    pub database: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Connection URL for sqlx
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Fragmentation rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentationConfig {
    /// Fragmented table
    #[serde(default = "default_table")]
    pub table: String,

    /// Column identifying a record (unit of locking)
    #[serde(default = "default_key_column")]
    pub key_column: String,

    /// Date column deciding which fragment owns a record
    #[serde(default = "default_partition_column")]
    pub partition_column: String,

    /// Dates before this go to fragment A, dates at/after it to fragment B
    #[serde(default = "default_boundary")]
    pub boundary: NaiveDate,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bound on lock acquisition and read admission waits
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Interval of the background connectivity probe
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Operation log capacity (oldest entries are evicted)
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS (the dashboard is served from another origin)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_db_port() -> u16 {
    3306
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_table() -> String {
    "trans".to_string()
}

fn default_key_column() -> String {
    "trans_id".to_string()
}

fn default_partition_column() -> String {
    "date".to_string()
}

fn default_boundary() -> NaiveDate {
    NaiveDate::from_ymd_opt(1997, 1, 1).unwrap_or_default()
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_health_check_interval_ms() -> u64 {
    5000
}

fn default_max_log_entries() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            key_column: default_key_column(),
            partition_column: default_partition_column(),
            boundary: default_boundary(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_address(),
            cors_enabled: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CoordinatorConfig {
    /// Lock and read admission timeout as Duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Health probe interval as Duration
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl FragStoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: FragStoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        for node in NodeId::ALL {
            let db = self.nodes.get(node);
            if db.host.is_empty() {
                return Err(crate::Error::Config(format!("nodes.{}.host cannot be empty", node.config_key())));
            }
            if db.database.is_empty() {
                return Err(crate::Error::Config(format!("nodes.{}.database cannot be empty", node.config_key())));
            }
            if db.pool_size == 0 {
                return Err(crate::Error::Config(format!("nodes.{}.pool_size must be at least 1", node.config_key())));
            }
        }

        if self.fragmentation.key_column.is_empty() || self.fragmentation.partition_column.is_empty() {
            return Err(crate::Error::Config("fragmentation columns cannot be empty".into()));
        }

        if self.coordinator.lock_timeout_ms == 0 {
            return Err(crate::Error::Config("coordinator.lock_timeout_ms must be positive".into()));
        }

        Ok(())
    }

    /// Sample configuration written by `fragstore init`
    pub fn sample() -> String {
        r#"# FragStore configuration

[nodes.master]
host = "127.0.0.1"
port = 3306
user = "root"
password = "password"
database = "financedata"

[nodes.fragment_a]
host = "127.0.0.1"
port = 3307
user = "root"
password = "password"
database = "financedata"

[nodes.fragment_b]
host = "127.0.0.1"
port = 3308
user = "root"
password = "password"
database = "financedata"

[fragmentation]
table = "trans"
key_column = "trans_id"
partition_column = "date"
boundary = "1997-01-01"

[coordinator]
lock_timeout_ms = 5000
health_check_interval_ms = 5000
max_log_entries = 1000

[api]
bind_address = "0.0.0.0:8080"
cors_enabled = true

[logging]
level = "info"
format = "pretty"
"#
        .to_string()
    }

    /// Connection summary per node, for `fragstore info`
    pub fn describe(&self) -> Vec<(String, String)> {
        NodeId::ALL
            .iter()
            .map(|node| {
                let db = self.nodes.get(*node);
                (node.to_string(), format!("{}:{}/{}", db.host, db.port, db.database))
            })
            .collect()
    }
}

/// Default config file path
pub fn default_config_path() -> PathBuf {
    PathBuf::from("fragstore.toml")
}
