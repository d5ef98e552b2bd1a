//! SQLite storage layer -- schema, record types, read queries.
//!
//! Writes go through the single [`writer::RecordWriter`] thread; everything
//! here reads through the r2d2 pool.

pub mod schema;
pub mod writer;

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::alerts::{AlertEvent, AlertStatus};
use crate::detect::{AnomalyVerdict, Severity, VerdictState};
use crate::probes::ProbeResult;

pub use writer::{RecordWriter, WriteError};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Layout version stamped on every probe record.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = FULL;
     PRAGMA temp_store = MEMORY;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    ensure_parent(path)?;
    let manager = SqliteConnectionManager::file(path).with_init(|c| c.execute_batch(PRAGMAS));

    let pool = R2D2Pool::builder()
        .max_size(4)
        .build(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Open a dedicated connection with the same pragmas as the pool.
pub fn open_connection(path: &Path) -> Result<Connection> {
    ensure_parent(path)?;
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    conn.execute_batch(PRAGMAS)?;
    schema::migrate(&conn)?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One target's outcome for one tick, as persisted and exported.
///
/// `probes_*` and `rtt_samples` describe this tick's attempts; the feature
/// columns describe the whole window at the time of scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub schema_version: u32,
    pub target: String,
    pub tick: u64,
    pub recorded_at: DateTime<Utc>,
    pub probes_sent: u32,
    pub probes_received: u32,
    pub rtt_samples: Vec<f64>,
    pub rtt_mean_ms: Option<f64>,
    pub rtt_max_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub loss_ratio: f64,
    pub hour_of_day: u32,
    pub score: Option<f64>,
    pub cutoff: Option<f64>,
    pub is_anomalous: bool,
    pub state: VerdictState,
    pub method: String,
}

impl ProbeRecord {
    pub fn new(verdict: &AnomalyVerdict, results: &[ProbeResult]) -> Self {
        let f = &verdict.features;
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            target: verdict.target.clone(),
            tick: verdict.tick,
            recorded_at: verdict.timestamp,
            probes_sent: results.len() as u32,
            probes_received: results.iter().filter(|r| r.success).count() as u32,
            rtt_samples: results.iter().filter_map(|r| r.rtt_ms).collect(),
            rtt_mean_ms: f.rtt_mean_ms,
            rtt_max_ms: f.rtt_max_ms,
            jitter_ms: f.jitter_ms,
            loss_ratio: f.loss_ratio,
            hour_of_day: f.hour_of_day,
            score: verdict.score,
            cutoff: verdict.cutoff,
            is_anomalous: verdict.is_anomalous,
            state: verdict.state,
            method: verdict.method.label(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let samples: String = row.get("rtt_samples_json")?;
        let state: String = row.get("state")?;
        Ok(Self {
            schema_version: row.get("schema_version")?,
            target: row.get("target")?,
            tick: row.get::<_, i64>("tick")? as u64,
            recorded_at: parse_ts(row, "recorded_at")?,
            probes_sent: row.get("probes_sent")?,
            probes_received: row.get("probes_received")?,
            rtt_samples: serde_json::from_str(&samples).map_err(|e| conversion_error(e.into()))?,
            rtt_mean_ms: row.get("rtt_mean_ms")?,
            rtt_max_ms: row.get("rtt_max_ms")?,
            jitter_ms: row.get("jitter_ms")?,
            loss_ratio: row.get("loss_ratio")?,
            hour_of_day: row.get("hour_of_day")?,
            score: row.get("score")?,
            cutoff: row.get("cutoff")?,
            is_anomalous: row.get("is_anomalous")?,
            state: state.parse().map_err(|e: String| conversion_error(e.into()))?,
            method: row.get("method")?,
        })
    }
}

/// A settled alert event as stored in `alert_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub target: String,
    pub tick: u64,
    pub created_at: DateTime<Utc>,
    pub status: AlertStatus,
    pub severity: Severity,
    pub retries: u32,
    pub score: Option<f64>,
    pub summary: String,
    pub last_error: Option<String>,
    pub payload: serde_json::Value,
}

impl AlertRecord {
    pub fn from_event(event: &AlertEvent) -> Self {
        Self {
            id: event.id.to_string(),
            target: event.target.clone(),
            tick: event.verdict.tick,
            created_at: event.created_at,
            status: event.status,
            severity: event.severity,
            retries: event.retries,
            score: event.verdict.score,
            summary: event.summary(),
            last_error: event.last_error.clone(),
            payload: serde_json::to_value(event.payload()).unwrap_or_default(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let severity: String = row.get("severity")?;
        let payload: String = row.get("payload_json")?;
        Ok(Self {
            id: row.get("id")?,
            target: row.get("target")?,
            tick: row.get::<_, i64>("tick")? as u64,
            created_at: parse_ts(row, "created_at")?,
            status: status.parse().map_err(|e: String| conversion_error(e.into()))?,
            severity: severity.parse().map_err(|e: String| conversion_error(e.into()))?,
            retries: row.get("retries")?,
            score: row.get("score")?,
            summary: row.get("summary")?,
            last_error: row.get("last_error")?,
            payload: serde_json::from_str(&payload).unwrap_or_default(),
        })
    }
}

fn conversion_error(e: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e)
}

fn parse_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(Box::new(e)))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Highest tick ever persisted, if any.
pub fn last_tick(pool: &Pool) -> Result<Option<u64>> {
    let conn = pool.get()?;
    let tick: Option<i64> = conn.query_row("SELECT MAX(tick) FROM probe_records", [], |row| row.get(0))?;
    Ok(tick.map(|t| t as u64))
}

/// Most recent records for a target, newest first.
pub fn history(pool: &Pool, target: &str, limit: usize) -> Result<Vec<ProbeRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM probe_records WHERE target = ?1 ORDER BY tick DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![target, limit as i64], ProbeRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Most recent alert events across all targets, newest first.
pub fn recent_alerts(pool: &Pool, limit: usize) -> Result<Vec<AlertRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM alert_events ORDER BY created_at DESC LIMIT ?1")?;
    let rows = stmt.query_map(params![limit as i64], AlertRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Stream records as JSON lines in tick order, optionally for one target.
/// Returns the number of lines written.
pub fn export_jsonl(pool: &Pool, target: Option<&str>, out: &mut dyn Write) -> Result<usize> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM probe_records
         WHERE ?1 IS NULL OR target = ?1
         ORDER BY tick ASC, target ASC",
    )?;
    let rows = stmt.query_map(params![target], ProbeRecord::from_row)?;

    let mut written = 0;
    for row in rows {
        let record = row?;
        serde_json::to_writer(&mut *out, &record)?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}
