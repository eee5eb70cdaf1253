//! FragCtl - Command line client for a running FragStore
//!
//! Usage:
//!   fragctl query master "SELECT * FROM trans WHERE trans_id = 1"
//!   fragctl kill fragmentA
//!   fragctl recover fragmentA
//!   fragctl health | ledger | locks | logs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// FragStore Control Tool
#[derive(Parser)]
#[command(name = "fragctl")]
#[command(about = "Drive and inspect a running FragStore", long_about = None)]
struct Cli {
    /// Path to config file (used to find the API address)
    #[arg(short, long, default_value = "fragstore.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute an operation on a node
    Query {
        /// master, fragmentA or fragmentB
        node: String,
        /// SQL text
        query: String,
        /// READ_UNCOMMITTED, READ_COMMITTED, REPEATABLE_READ or SERIALIZABLE
        #[arg(short, long, default_value = "REPEATABLE_READ")]
        isolation: String,
    },
    /// Inject a fault on a node
    Kill { node: String },
    /// Recover a node and replay failed replications
    Recover { node: String },
    /// Probe and show node health
    Health,
    /// Show the replication ledger
    Ledger {
        /// Only show counts
        #[arg(long)]
        stats: bool,
    },
    /// Show active write locks
    Locks,
    /// Show or clear the operation log
    Logs {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
        /// Clear the log instead of showing it
        #[arg(long)]
        clear: bool,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    code: String,
    #[serde(default)]
    retryable: bool,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    transaction_id: String,
    node: String,
    kind: String,
    result: serde_json::Value,
    #[serde(default)]
    replication: Vec<ReplicationSummary>,
    #[serde(default)]
    lock_wait_ms: u64,
    #[serde(default)]
    overwrote: Option<String>,
    #[serde(default)]
    dirty_read: bool,
    #[serde(default)]
    duration_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ReplicationSummary {
    entry_id: u64,
    target: String,
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeActionResponse {
    node: String,
    changed: bool,
}

#[derive(Debug, Deserialize)]
struct RecoverResponse {
    node: String,
    changed: bool,
    replayed: usize,
    failed_replays: usize,
    total_processed: usize,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    healthy: bool,
    nodes: BTreeMap<String, NodeState>,
}

#[derive(Debug, Deserialize)]
struct NodeState {
    status: String,
    #[serde(default)]
    fault_injected: bool,
    #[serde(default)]
    reachable: bool,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    last_check: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LedgerResponse {
    count: usize,
    entries: Vec<LedgerEntry>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct LedgerEntry {
    id: u64,
    transaction_id: String,
    source: String,
    target: String,
    status: String,
    #[serde(default)]
    error: Option<String>,
    timestamp: String,
    #[serde(default)]
    recovered_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocksResponse {
    count: usize,
    locks: Vec<LockMarker>,
}

#[derive(Debug, Deserialize)]
struct LockMarker {
    key: LockKey,
    owner: LockOwner,
    started_at: String,
}

#[derive(Debug, Deserialize)]
struct LockKey {
    table: String,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LockOwner {
    transaction_id: String,
    node: String,
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    count: usize,
    entries: Vec<LogEntry>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct LogEntry {
    id: u64,
    node: String,
    kind: String,
    isolation: String,
    query: String,
    status: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    lock_wait_ms: u64,
    #[serde(default)]
    overwrote: Option<String>,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// API endpoint from the config file, with 0.0.0.0 mapped to localhost
fn endpoint_from_config(path: &Path) -> String {
    let fallback = "http://127.0.0.1:8080".to_string();
    let Ok(content) = std::fs::read_to_string(path) else {
        return fallback;
    };
    match toml::from_str::<Config>(&content) {
        Ok(config) => {
            let addr = config.api.bind_address;
            if addr.starts_with("0.0.0.0") {
                format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("8080"))
            } else {
                format!("http://{}", addr)
            }
        }
        Err(_) => fallback,
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::Query { node, query, isolation } => {
            run_query(&client, &endpoint, node, query, isolation).await
        }
        Commands::Kill { node } => kill(&client, &endpoint, node).await,
        Commands::Recover { node } => recover(&client, &endpoint, node).await,
        Commands::Health => show_health(&client, &endpoint).await,
        Commands::Ledger { stats } => show_ledger(&client, &endpoint, *stats).await,
        Commands::Locks => show_locks(&client, &endpoint).await,
        Commands::Logs { limit, clear } => show_logs(&client, &endpoint, *limit, *clear).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Decode a JSON response, turning API errors into readable failures
async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.context("invalid response body");
    }

    match response.json::<ErrorResponse>().await {
        Ok(err) => {
            let hint = if err.retryable { " (retryable)" } else { "" };
            bail!("{} [{}]{}", err.error, err.code, hint)
        }
        Err(_) => bail!("API error: {}", status),
    }
}

// ============ Commands ============

async fn run_query(
    client: &reqwest::Client,
    endpoint: &str,
    node: &str,
    query: &str,
    isolation: &str,
) -> Result<()> {
    let response = client
        .post(format!("{}/query", endpoint))
        .json(&serde_json::json!({
            "node": node,
            "query": query,
            "isolation": isolation.to_ascii_uppercase(),
        }))
        .send()
        .await
        .with_context(|| format!("could not reach {}", endpoint))?;
    let result: ExecuteResponse = decode(response).await?;

    println!("Transaction {} ({} on {}, {} ms)", result.transaction_id, result.kind, result.node, result.duration_ms);
    if result.lock_wait_ms > 0 {
        println!("  Waited {} ms for in-flight write", result.lock_wait_ms);
    }
    if result.dirty_read {
        println!("  \x1b[33mDirty read\x1b[0m: a write on this key was in flight");
    }
    if let Some(previous) = &result.overwrote {
        println!("  \x1b[33mLast writer wins\x1b[0m: overwrote transaction {}", previous);
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&result.result)?);

    if !result.replication.is_empty() {
        println!();
        println!("{:<8} {:<12} {:<12} {}", "ENTRY", "TARGET", "STATUS", "ERROR");
        println!("{}", "-".repeat(60));
        for r in &result.replication {
            println!(
                "{:<8} {:<12} {} {}",
                r.entry_id,
                r.target,
                colored_status(&r.status),
                r.error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

async fn kill(client: &reqwest::Client, endpoint: &str, node: &str) -> Result<()> {
    let response = client
        .post(format!("{}/nodes/{}/kill", endpoint, node))
        .send()
        .await?;
    let result: NodeActionResponse = decode(response).await?;
    if result.changed {
        println!("✓ Node {} killed", result.node);
    } else {
        println!("Node {} was already down", result.node);
    }
    Ok(())
}

async fn recover(client: &reqwest::Client, endpoint: &str, node: &str) -> Result<()> {
    let response = client
        .post(format!("{}/nodes/{}/recover", endpoint, node))
        .send()
        .await?;
    let result: RecoverResponse = decode(response).await?;
    if result.changed {
        println!("✓ Node {} recovered", result.node);
    } else {
        println!("Node {} was not down", result.node);
    }
    println!(
        "  Replay: {} replayed, {} failed, {} processed",
        result.replayed, result.failed_replays, result.total_processed
    );
    Ok(())
}

async fn show_health(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = client.get(format!("{}/health", endpoint)).send().await?;
    let health: HealthResponse = decode(response).await?;

    println!();
    println!("FragStore Health (fragctl v{})", env!("CARGO_PKG_VERSION"));
    println!("================================");
    println!("Overall: {}", if health.healthy { "\x1b[32mhealthy\x1b[0m" } else { "\x1b[31mdegraded\x1b[0m" });
    println!();
    println!("{:<12} {:<10} {:<8} {:<10} {}", "NODE", "STATUS", "KILLED", "REACHABLE", "LAST CHECK");
    println!("{}", "-".repeat(70));
    for (node, state) in &health.nodes {
        println!(
            "{:<12} {} {:<8} {:<10} {}",
            node,
            colored_status(&state.status),
            if state.fault_injected { "yes" } else { "no" },
            if state.reachable { "yes" } else { "no" },
            state.last_check.as_deref().unwrap_or("-")
        );
        if let Some(error) = &state.last_error {
            println!("             {}", error);
        }
    }
    println!();
    Ok(())
}

async fn show_ledger(client: &reqwest::Client, endpoint: &str, stats: bool) -> Result<()> {
    if stats {
        let response = client
            .get(format!("{}/replication/stats", endpoint))
            .send()
            .await?;
        let stats: serde_json::Value = decode(response).await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let response = client.get(format!("{}/replication", endpoint)).send().await?;
    let ledger: LedgerResponse = decode(response).await?;

    println!("Replication ledger: {} entries", ledger.count);
    println!();
    println!("{:<6} {:<38} {:<11} {:<11} {:<12} {}", "ID", "TRANSACTION", "SOURCE", "TARGET", "STATUS", "DETAIL");
    println!("{}", "-".repeat(100));
    for e in &ledger.entries {
        let detail = match (&e.error, &e.recovered_at) {
            (Some(err), _) => err.clone(),
            (None, Some(at)) => format!("replayed at {}", at),
            (None, None) => String::new(),
        };
        println!(
            "{:<6} {:<38} {:<11} {:<11} {} {}",
            e.id,
            e.transaction_id,
            e.source,
            e.target,
            colored_status(&e.status),
            detail
        );
    }
    Ok(())
}

async fn show_locks(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = client.get(format!("{}/locks", endpoint)).send().await?;
    let locks: LocksResponse = decode(response).await?;

    if locks.count == 0 {
        println!("No active write locks");
        return Ok(());
    }

    println!("{:<24} {:<38} {:<11} {}", "KEY", "TRANSACTION", "NODE", "SINCE");
    println!("{}", "-".repeat(90));
    for lock in &locks.locks {
        let key = format!("{}/{}", lock.key.table, lock.key.id.as_deref().unwrap_or("*"));
        println!(
            "{:<24} {:<38} {:<11} {}",
            key, lock.owner.transaction_id, lock.owner.node, lock.started_at
        );
    }
    Ok(())
}

async fn show_logs(client: &reqwest::Client, endpoint: &str, limit: usize, clear: bool) -> Result<()> {
    if clear {
        let response = client.delete(format!("{}/logs", endpoint)).send().await?;
        let result: serde_json::Value = decode(response).await?;
        println!("✓ Cleared {} log entries", result["cleared"]);
        return Ok(());
    }

    let response = client
        .get(format!("{}/logs", endpoint))
        .query(&[("limit", limit)])
        .send()
        .await?;
    let logs: LogsResponse = decode(response).await?;

    println!("{:<6} {:<11} {:<6} {:<17} {:<10} {:>8} {:>8}  {}", "ID", "NODE", "KIND", "ISOLATION", "STATUS", "MS", "WAIT", "QUERY");
    println!("{}", "-".repeat(110));
    for e in &logs.entries {
        let status = match &e.error_code {
            Some(code) => code.clone(),
            None => e.status.clone(),
        };
        println!(
            "{:<6} {:<11} {:<6} {:<17} {:<10} {:>8} {:>8}  {}",
            e.id, e.node, e.kind, e.isolation, status, e.duration_ms, e.lock_wait_ms, e.query
        );
        if let Some(previous) = &e.overwrote {
            println!("       overwrote {}", previous);
        }
    }
    println!("({} shown)", logs.count);
    Ok(())
}

/// Status padded to fixed width before adding color codes
fn colored_status(status: &str) -> String {
    let padded = format!("{:<12}", status);
    match status {
        "online" | "replicated" | "committed" => format!("\x1b[32m{}\x1b[0m", padded),
        "pending" => format!("\x1b[33m{}\x1b[0m", padded),
        "offline" | "failed" => format!("\x1b[31m{}\x1b[0m", padded),
        _ => padded,
    }
}
