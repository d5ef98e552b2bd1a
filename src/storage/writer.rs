//! Single serialized writer for probe records and alert events.
//!
//! A dedicated OS thread owns the write connection. Async callers queue
//! requests over a channel and wait for the commit acknowledgement, so
//! records from concurrent targets never interleave inside SQLite.

use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{open_connection, AlertRecord, ProbeRecord};
use crate::alerts::AlertEvent;
use crate::config::StorageConfig;

/// Queue depth before `append` callers start waiting for the writer.
const QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WriteError {
    #[error("record writer has shut down")]
    Closed,

    #[error("record for target '{target}' tick {tick} already exists")]
    Duplicate { target: String, tick: u64 },

    #[error("sqlite: {0}")]
    Sqlite(String),
}

enum WriteRequest {
    Record {
        record: Box<ProbeRecord>,
        ack: oneshot::Sender<Result<(), WriteError>>,
    },
    Alert {
        record: Box<AlertRecord>,
        ack: oneshot::Sender<Result<(), WriteError>>,
    },
}

/// Cloneable handle to the writer thread. The thread exits once every
/// handle is dropped and the queue is drained.
#[derive(Clone)]
pub struct RecordWriter {
    tx: mpsc::Sender<WriteRequest>,
}

impl RecordWriter {
    pub fn spawn(config: &StorageConfig) -> Result<(Self, JoinHandle<()>)> {
        let conn = open_connection(&config.db_path)?;
        let retries = config.write_retries;
        let delay = Duration::from_millis(config.retry_delay_ms);
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);

        let handle = std::thread::Builder::new()
            .name("record-writer".into())
            .spawn(move || writer_loop(conn, rx, retries, delay))
            .context("failed to spawn record writer thread")?;

        Ok((Self { tx }, handle))
    }

    /// Append one probe record and wait until it is committed.
    pub async fn append(&self, record: ProbeRecord) -> Result<(), WriteError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteRequest::Record {
                record: Box::new(record),
                ack,
            })
            .await
            .map_err(|_| WriteError::Closed)?;
        done.await.map_err(|_| WriteError::Closed)?
    }

    /// Persist a settled alert event.
    pub async fn record_alert(&self, event: &AlertEvent) -> Result<(), WriteError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteRequest::Alert {
                record: Box::new(AlertRecord::from_event(event)),
                ack,
            })
            .await
            .map_err(|_| WriteError::Closed)?;
        done.await.map_err(|_| WriteError::Closed)?
    }
}

fn writer_loop(
    conn: Connection,
    mut rx: mpsc::Receiver<WriteRequest>,
    retries: u32,
    delay: Duration,
) {
    debug!("record writer started");
    let mut written = 0u64;

    while let Some(req) = rx.blocking_recv() {
        match req {
            WriteRequest::Record { record, ack } => {
                let result = with_retries(retries, delay, || insert_record(&conn, &record))
                    .map_err(|e| match e {
                        WriteError::Sqlite(_) if is_duplicate(&conn, &record) => WriteError::Duplicate {
                            target: record.target.clone(),
                            tick: record.tick,
                        },
                        other => other,
                    });
                if result.is_ok() {
                    written += 1;
                }
                // The caller may have given up waiting; that is fine.
                let _ = ack.send(result);
            }
            WriteRequest::Alert { record, ack } => {
                let result = with_retries(retries, delay, || insert_alert(&conn, &record));
                let _ = ack.send(result);
            }
        }
    }

    info!(records = written, "record writer drained and stopped");
}

/// Retry transient failures. Constraint violations are final.
fn with_retries<F>(retries: u32, delay: Duration, mut op: F) -> Result<(), WriteError>
where
    F: FnMut() -> rusqlite::Result<()>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, msg)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(WriteError::Sqlite(msg.unwrap_or_else(|| e.to_string())));
            }
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(attempt, error = %e, "write failed, retrying");
                std::thread::sleep(delay);
            }
            Err(e) => return Err(WriteError::Sqlite(e.to_string())),
        }
    }
}

fn is_duplicate(conn: &Connection, record: &ProbeRecord) -> bool {
    conn.query_row(
        "SELECT 1 FROM probe_records WHERE target = ?1 AND tick = ?2",
        params![record.target, record.tick as i64],
        |_| Ok(()),
    )
    .is_ok()
}

fn insert_record(conn: &Connection, r: &ProbeRecord) -> rusqlite::Result<()> {
    let samples = serde_json::to_string(&r.rtt_samples).unwrap_or_else(|_| "[]".into());
    conn.execute(
        "INSERT INTO probe_records (
            schema_version, target, tick, recorded_at, probes_sent, probes_received,
            rtt_samples_json, rtt_mean_ms, rtt_max_ms, jitter_ms, loss_ratio, hour_of_day,
            score, cutoff, is_anomalous, state, method
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            r.schema_version,
            r.target,
            r.tick as i64,
            r.recorded_at.to_rfc3339(),
            r.probes_sent,
            r.probes_received,
            samples,
            r.rtt_mean_ms,
            r.rtt_max_ms,
            r.jitter_ms,
            r.loss_ratio,
            r.hour_of_day,
            r.score,
            r.cutoff,
            r.is_anomalous,
            r.state.to_string(),
            r.method,
        ],
    )?;
    Ok(())
}

fn insert_alert(conn: &Connection, a: &AlertRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO alert_events (
            id, target, tick, created_at, status, severity, retries, score, summary,
            last_error, payload_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            a.id,
            a.target,
            a.tick as i64,
            a.created_at.to_rfc3339(),
            a.status.as_str(),
            a.severity.to_string(),
            a.retries,
            a.score,
            a.summary,
            a.last_error,
            a.payload.to_string(),
        ],
    )?;
    Ok(())
}
