use std::time::Duration;

use cronctl_core::Cache;
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Schema version recorded in `PRAGMA user_version` once the tables exist.
pub const DB_VERSION: i64 = 1;
/// Cache key that serialises concurrent schema creation.
pub const TABLE_CREATE_LOCK: &str = "cronctl_creating_table";

/// Initialise the events schema in `conn`.
///
/// Creates `cron_control_events` (idempotent) with its uniqueness key, plus a
/// small key/value table for durable flags.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cron_control_events (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp      INTEGER NOT NULL,
            action         TEXT    NOT NULL,
            action_hashed  TEXT    NOT NULL,
            instance       TEXT    NOT NULL,
            args           TEXT    NOT NULL,   -- JSON-encoded argument list
            schedule       TEXT,               -- NULL for one-shot events
            interval       INTEGER NOT NULL DEFAULT 0,
            status         TEXT    NOT NULL DEFAULT 'pending',
            created        TEXT    NOT NULL,
            last_modified  TEXT    NOT NULL,
            UNIQUE (timestamp, action, instance)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_events_status ON cron_control_events (status);
        -- Due scans: WHERE status = 'pending' AND timestamp <= ? ORDER BY timestamp
        CREATE INDEX IF NOT EXISTS idx_events_status_ts ON cron_control_events (status, timestamp);

        CREATE TABLE IF NOT EXISTS cron_control_settings (
            name   TEXT    NOT NULL PRIMARY KEY,
            value  INTEGER NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring the schema up to [`DB_VERSION`] unless another caller is doing so.
///
/// Returns whether the tables are known to be ready. Failure is non-fatal:
/// callers check again on next use.
pub fn prepare_tables(conn: &Connection, cache: &dyn Cache) -> bool {
    match schema_version(conn) {
        Ok(v) if v == DB_VERSION => return true,
        Ok(_) => {}
        Err(e) => {
            warn!("failed to read schema version: {e}");
            return false;
        }
    }

    if !cache.add(TABLE_CREATE_LOCK, Value::from(1), Some(Duration::from_secs(60))) {
        debug!("schema creation already in progress elsewhere");
        return false;
    }

    let created = init_db(conn).and_then(|_| {
        conn.pragma_update(None, "user_version", DB_VERSION)?;
        Ok(())
    });

    match created {
        Ok(()) => {
            info!(version = DB_VERSION, "events schema ready");
            true
        }
        Err(e) => {
            warn!("events schema creation failed: {e}");
            cache.delete(TABLE_CREATE_LOCK);
            false
        }
    }
}
