//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Latest schema version written by `migrate`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS probe_records (
            id INTEGER PRIMARY KEY,
            schema_version INTEGER NOT NULL,
            target TEXT NOT NULL,
            tick INTEGER NOT NULL,
            recorded_at TEXT NOT NULL,
            probes_sent INTEGER NOT NULL,
            probes_received INTEGER NOT NULL,
            rtt_samples_json TEXT NOT NULL,
            rtt_mean_ms REAL,
            rtt_max_ms REAL,
            jitter_ms REAL,
            loss_ratio REAL NOT NULL,
            hour_of_day INTEGER NOT NULL,
            score REAL,
            cutoff REAL,
            is_anomalous INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL,
            method TEXT NOT NULL,
            UNIQUE (target, tick)
        );

        CREATE TABLE IF NOT EXISTS alert_events (
            id TEXT PRIMARY KEY,
            target TEXT NOT NULL,
            tick INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL,
            severity TEXT NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0,
            score REAL,
            summary TEXT NOT NULL,
            last_error TEXT,
            payload_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_probe_records_target_tick ON probe_records(target, tick);
        CREATE INDEX IF NOT EXISTS idx_probe_records_recorded ON probe_records(recorded_at);
        CREATE INDEX IF NOT EXISTS idx_alert_events_created ON alert_events(created_at);
        CREATE INDEX IF NOT EXISTS idx_alert_events_target ON alert_events(target);",
    )?;

    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    if current < SCHEMA_VERSION {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        // Verify tables exist by querying them
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM probe_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM alert_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_target_tick_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let insert = "INSERT INTO probe_records
            (schema_version, target, tick, recorded_at, probes_sent, probes_received,
             rtt_samples_json, loss_ratio, hour_of_day, state, method)
            VALUES (1, 'a', 7, '2024-01-01T00:00:00Z', 1, 1, '[]', 0.0, 0, 'normal', 'static')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
