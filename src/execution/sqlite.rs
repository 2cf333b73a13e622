//! SQLite Sandbox
//!
//! Read-only execution against a SQLite file. Every call opens its own
//! read-only connection on the blocking pool; a timeout interrupts the
//! running statement.

use super::{ExecutionSandbox, SandboxOutcome};
use crate::config::MAX_SAMPLE_ROWS;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Rows beyond this are not materialized; the hash covers the first rows only
const MAX_HASHED_ROWS: usize = 100_000;

pub struct SqliteSandbox {
    path: PathBuf,
}

impl SqliteSandbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<Connection> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| PipelineError::Sandbox(format!("Cannot open {}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl ExecutionSandbox for SqliteSandbox {
    async fn execute(&self, sql: &str, timeout_ms: u64) -> Result<SandboxOutcome> {
        let conn = self.open()?;
        let interrupt = conn.get_interrupt_handle();
        let ordered = crate::sql::has_order_by(sql);
        let owned_sql = sql.to_string();
        let started = Instant::now();

        let task = tokio::task::spawn_blocking(move || run_query(&conn, &owned_sql, ordered));

        match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(join_error)) => Err(PipelineError::Sandbox(format!("Query worker failed: {}", join_error))),
            Err(_) => {
                interrupt.interrupt();
                warn!("Query interrupted after {} ms", timeout_ms);
                Ok(SandboxOutcome::failure(
                    format!("timeout after {} ms", timeout_ms),
                    started.elapsed().as_millis() as u64,
                ))
            }
        }
    }
}

fn run_query(conn: &Connection, sql: &str, ordered: bool) -> SandboxOutcome {
    let started = Instant::now();
    let elapsed = |s: &Instant| s.elapsed().as_millis() as u64;

    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => return SandboxOutcome::failure(e.to_string(), elapsed(&started)),
    };
    if !stmt.readonly() {
        return SandboxOutcome::failure(
            "read-only sandbox rejects statements that modify the database".to_string(),
            elapsed(&started),
        );
    }

    let column_count = stmt.column_count();
    let mut rows = match stmt.query([]) {
        Ok(rows) => rows,
        Err(e) => return SandboxOutcome::failure(e.to_string(), elapsed(&started)),
    };

    let mut encoded: Vec<String> = Vec::new();
    let mut sample_rows: Vec<Vec<serde_json::Value>> = Vec::new();
    let mut rows_returned: u64 = 0;

    loop {
        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) => return SandboxOutcome::failure(e.to_string(), elapsed(&started)),
        };
        rows_returned += 1;
        if encoded.len() >= MAX_HASHED_ROWS {
            continue;
        }

        let mut fields = Vec::with_capacity(column_count);
        let mut json = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value = match row.get_ref(i) {
                Ok(value) => value,
                Err(e) => return SandboxOutcome::failure(e.to_string(), elapsed(&started)),
            };
            fields.push(encode_value(&value));
            if sample_rows.len() < MAX_SAMPLE_ROWS {
                json.push(json_value(&value));
            }
        }
        encoded.push(fields.join("\u{1f}"));
        if sample_rows.len() < MAX_SAMPLE_ROWS {
            sample_rows.push(json);
        }
    }

    let plan_cost = plan_cost(conn, sql);
    debug!("Query returned {} rows in {} ms", rows_returned, elapsed(&started));

    SandboxOutcome {
        success: true,
        error: None,
        rows_returned,
        elapsed_ms: elapsed(&started),
        result_hash: result_hash(column_count, encoded, ordered),
        sample_rows,
        plan_cost,
    }
}

/// Rough cost from `EXPLAIN QUERY PLAN`: full scans weigh more than index searches
fn plan_cost(conn: &Connection, sql: &str) -> Option<f64> {
    let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {}", sql)).ok()?;
    let mut rows = stmt.query([]).ok()?;
    let mut cost = 0.0;
    while let Ok(Some(row)) = rows.next() {
        let detail: String = row.get(3).ok()?;
        if detail.starts_with("SCAN") {
            cost += 10.0;
        } else if detail.starts_with("SEARCH") {
            cost += 1.0;
        } else if detail.contains("TEMP B-TREE") {
            cost += 2.0;
        }
    }
    Some(cost)
}

fn encode_value(value: &ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "n".to_string(),
        ValueRef::Integer(i) => format!("i:{}", i),
        ValueRef::Real(f) => format!("r:{}", f),
        ValueRef::Text(t) => format!("t:{}", String::from_utf8_lossy(t)),
        ValueRef::Blob(b) => format!("b:{}", b.iter().map(|byte| format!("{:02x}", byte)).collect::<String>()),
    }
}

fn json_value(value: &ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(*i),
        ValueRef::Real(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}

/// SHA-256 over the column count and typed row encodings. Rows are hashed in
/// order when the query orders them, otherwise as a sorted multiset.
pub fn result_hash(column_count: usize, mut rows: Vec<String>, ordered: bool) -> String {
    if !ordered {
        rows.sort();
    }
    let mut hasher = Sha256::new();
    hasher.update(column_count.to_le_bytes());
    for row in &rows {
        hasher.update(row.as_bytes());
        hasher.update([0x1e]);
    }
    format!("{:x}", hasher.finalize())
}
