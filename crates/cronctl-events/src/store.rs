use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use cronctl_core::config::{ArgsSizeConfig, EventsConfig};
use cronctl_core::{now_ts, Cache};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::db::prepare_tables;
use crate::error::Result;
use crate::types::{
    placeholder_instance, Column, EventArgs, EventRow, EventStatus, NewEventRow, OrderBy,
    QueryArgs, RowChanges, SortOrder, StatusCounts, TimestampFilter,
};

/// Cache key holding the rendered list of pending events.
pub const PENDING_CACHE_KEY: &str = "cronctl_pending_events";
const PENDING_PAGE_SIZE: usize = 100;
const PENDING_MAX_PAGES: usize = 15;

const SELECT_COLUMNS: &str = "id, timestamp, action, action_hashed, instance, args, schedule,
     interval, status, created, last_modified";

/// Sole owner of the `cron_control_events` table.
///
/// Thread-safe: the connection sits behind a Mutex. Separate processes
/// coordinate through SQLite itself and the shared [`Cache`].
pub struct EventsStore {
    conn: Mutex<Connection>,
    cache: Arc<dyn Cache>,
    tables_ready: AtomicBool,
    pending_ttl: Duration,
    args_size: ArgsSizeConfig,
}

impl EventsStore {
    pub fn new(conn: Connection, cache: Arc<dyn Cache>) -> Self {
        Self::with_config(conn, cache, &EventsConfig::default())
    }

    pub fn with_config(conn: Connection, cache: Arc<dyn Cache>, config: &EventsConfig) -> Self {
        let ready = prepare_tables(&conn, cache.as_ref());
        Self {
            conn: Mutex::new(conn),
            cache,
            tables_ready: AtomicBool::new(ready),
            pending_ttl: Duration::from_secs(config.pending_cache_ttl_secs),
            args_size: config.args_size.clone(),
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.tables_ready.load(Ordering::Acquire) && prepare_tables(&conn, self.cache.as_ref())
        {
            self.tables_ready.store(true, Ordering::Release);
        }
        conn
    }

    // --- raw CRUD ----------------------------------------------------------

    /// Insert a new row. Returns the new id, or `None` when the data is
    /// incomplete or the uniqueness key is already taken.
    pub fn create(&self, row: &NewEventRow) -> Option<i64> {
        if row.action.is_empty() || row.instance.is_empty() || row.timestamp < 1 {
            debug!(action = %row.action, "refusing to create incomplete event row");
            return None;
        }
        let args = match row.args.encode() {
            Ok(a) => a,
            Err(e) => {
                warn!(action = %row.action, "failed to encode event args: {e}");
                return None;
            }
        };
        let now = Utc::now().to_rfc3339();

        let inserted = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO cron_control_events
                 (timestamp, action, action_hashed, instance, args, schedule, interval,
                  status, created, last_modified)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?9)
                 ON CONFLICT (timestamp, action, instance) DO NOTHING",
                params![
                    row.timestamp,
                    row.action,
                    row.action_hashed,
                    row.instance,
                    args,
                    row.schedule,
                    row.interval,
                    row.status.as_str(),
                    now
                ],
            )
            .map(|n| (n, conn.last_insert_rowid()))
        };

        match inserted {
            Ok((0, _)) => {
                debug!(action = %row.action, timestamp = row.timestamp, "event already exists");
                None
            }
            Ok((_, id)) => {
                self.flush_internal_caches();
                Some(id)
            }
            Err(e) => {
                warn!(action = %row.action, "event insert failed: {e}");
                None
            }
        }
    }

    /// Update `id` with `changes`, restricted by `extra_where`.
    ///
    /// `Column::Id` entries in `extra_where` are dropped so the id predicate
    /// can never be replaced or widened. Returns whether a row changed.
    pub fn update(&self, id: i64, changes: &RowChanges, extra_where: &[(Column, SqlValue)]) -> bool {
        if id < 1 || changes.is_empty() {
            return false;
        }
        let assignments = match changes.assignments() {
            Ok(a) => a,
            Err(e) => {
                warn!(event_id = id, "failed to encode event changes: {e}");
                return false;
            }
        };

        let mut sets: Vec<String> = Vec::with_capacity(assignments.len() + 1);
        let mut values: Vec<SqlValue> = Vec::with_capacity(assignments.len() + extra_where.len() + 2);
        for (col, value) in assignments {
            values.push(value);
            sets.push(format!("{} = ?{}", col.as_str(), values.len()));
        }
        values.push(SqlValue::Text(Utc::now().to_rfc3339()));
        sets.push(format!("last_modified = ?{}", values.len()));

        values.push(SqlValue::Integer(id));
        let mut conditions = vec![format!("id = ?{}", values.len())];
        for (col, value) in extra_where.iter().filter(|(c, _)| *c != Column::Id) {
            values.push(value.clone());
            conditions.push(format!("{} = ?{}", col.as_str(), values.len()));
        }

        let sql = format!(
            "UPDATE cron_control_events SET {} WHERE {}",
            sets.join(", "),
            conditions.join(" AND ")
        );

        let result = self.conn().execute(&sql, params_from_iter(values));
        match result {
            Ok(0) => false,
            Ok(_) => {
                self.flush_internal_caches();
                true
            }
            Err(e) => {
                warn!(event_id = id, "event update failed: {e}");
                false
            }
        }
    }

    /// Fetch one row by id. `None` for unknown or non-positive ids.
    pub fn get_raw(&self, id: i64) -> Option<EventRow> {
        if id < 1 {
            return None;
        }
        let conn = self.conn();
        let sql = format!("SELECT {SELECT_COLUMNS} FROM cron_control_events WHERE id = ?1");
        match conn.query_row(&sql, [id], row_to_event).optional() {
            Ok(row) => row,
            Err(e) => {
                warn!(event_id = id, "event lookup failed: {e}");
                None
            }
        }
    }

    /// Filtered, ordered, paginated rows.
    pub fn query(&self, args: &QueryArgs) -> Result<Vec<EventRow>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if !args.status.is_empty() {
            let mut slots = Vec::with_capacity(args.status.len());
            for status in &args.status {
                values.push(SqlValue::Text(status.to_string()));
                slots.push(format!("?{}", values.len()));
            }
            conditions.push(format!("status IN ({})", slots.join(", ")));
        }
        if let Some(action) = &args.action {
            values.push(SqlValue::Text(action.clone()));
            conditions.push(format!("action = ?{}", values.len()));
        }
        for (set, op) in [(&args.actions, "IN"), (&args.exclude_actions, "NOT IN")] {
            if set.is_empty() {
                continue;
            }
            let mut slots = Vec::with_capacity(set.len());
            for action in set {
                values.push(SqlValue::Text(action.clone()));
                slots.push(format!("?{}", values.len()));
            }
            conditions.push(format!("action {op} ({})", slots.join(", ")));
        }
        if let Some(hashed) = &args.action_hashed {
            values.push(SqlValue::Text(hashed.clone()));
            conditions.push(format!("action_hashed = ?{}", values.len()));
        }
        let instance = args
            .instance
            .clone()
            .or_else(|| args.args.as_ref().map(EventArgs::instance));
        if let Some(instance) = instance {
            values.push(SqlValue::Text(instance));
            conditions.push(format!("instance = ?{}", values.len()));
        }
        if let Some(schedule) = &args.schedule {
            values.push(SqlValue::Text(schedule.clone()));
            conditions.push(format!("schedule = ?{}", values.len()));
        }
        match args.timestamp {
            TimestampFilter::Any => {}
            TimestampFilter::DueNow => {
                values.push(SqlValue::Integer(now_ts()));
                conditions.push(format!("timestamp <= ?{}", values.len()));
            }
            TimestampFilter::Range { from, to } => {
                values.push(SqlValue::Integer(from));
                conditions.push(format!("timestamp >= ?{}", values.len()));
                values.push(SqlValue::Integer(to));
                conditions.push(format!("timestamp <= ?{}", values.len()));
            }
        }

        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM cron_control_events");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        let direction = match args.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        match args.orderby {
            OrderBy::Timestamp => {
                sql.push_str(&format!(" ORDER BY timestamp {direction}, id {direction}"))
            }
            OrderBy::Id => sql.push_str(&format!(" ORDER BY id {direction}")),
        }
        if args.limit > 0 {
            let offset = args.page.saturating_sub(1) * args.limit;
            sql.push_str(&format!(" LIMIT {} OFFSET {}", args.limit, offset));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- status bookkeeping -----------------------------------------------

    pub fn count_by_status(&self, status: EventStatus) -> Result<i64> {
        let conn = self.conn();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM cron_control_events WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM cron_control_events GROUP BY status")?;
        let mut counts = StatusCounts::default();
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, n) = row?;
            match status.parse::<EventStatus>() {
                Ok(EventStatus::Pending) => counts.pending = n,
                Ok(EventStatus::Running) => counts.running = n,
                Ok(EventStatus::Complete) => counts.complete = n,
                Err(_) => warn!(%status, rows = n, "rows with unknown status"),
            }
        }
        Ok(counts)
    }

    /// Delete every completed row. Returns the number removed.
    pub fn purge_completed(&self) -> Result<usize> {
        let n = self.conn().execute(
            "DELETE FROM cron_control_events WHERE status = ?1",
            [EventStatus::Complete.as_str()],
        )?;
        if n > 0 {
            info!(count = n, "purged completed events");
            self.flush_internal_caches();
        }
        Ok(n)
    }

    /// Id of the pending row with this uniqueness key, read straight from the table.
    pub fn find_pending_id(&self, timestamp: i64, action: &str, instance: &str) -> Result<Option<i64>> {
        let conn = self.conn();
        let id = conn
            .query_row(
                "SELECT id FROM cron_control_events
                 WHERE timestamp = ?1 AND action = ?2 AND instance = ?3 AND status = ?4
                 LIMIT 1",
                params![timestamp, action, instance, EventStatus::Pending.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Complete the pending row with this uniqueness key, freeing the key.
    pub fn mark_completed(&self, timestamp: i64, action: &str, instance: &str) -> Result<bool> {
        match self.find_pending_id(timestamp, action, instance)? {
            Some(id) => Ok(self.mark_record_completed(id)),
            None => Ok(false),
        }
    }

    fn mark_record_completed(&self, id: i64) -> bool {
        let changes = RowChanges {
            instance: Some(placeholder_instance()),
            ..RowChanges::status(EventStatus::Complete)
        };
        self.update(id, &changes, &[])
    }

    /// `(action, instance)` pairs with more than one pending recurring row.
    pub fn duplicate_recurring(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT action, instance FROM cron_control_events
             WHERE status = ?1 AND schedule IS NOT NULL AND interval > 0
             GROUP BY action, instance HAVING COUNT(*) > 1",
        )?;
        let pairs = stmt
            .query_map([EventStatus::Pending.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    // --- durable settings --------------------------------------------------

    pub fn get_setting(&self, name: &str) -> Result<Option<i64>> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM cron_control_settings WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, name: &str, value: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cron_control_settings (name, value) VALUES (?1, ?2)
             ON CONFLICT (name) DO UPDATE SET value = excluded.value",
            params![name, value],
        )?;
        Ok(())
    }

    // --- cached rendering of pending events -------------------------------

    /// Every pending event, oldest first, served from cache when possible.
    ///
    /// Rows with a non-positive timestamp are completed instead of listed.
    pub fn pending_events(&self) -> Result<Vec<EventRow>> {
        if let Some(cached) = self.cache.get(PENDING_CACHE_KEY) {
            match serde_json::from_value::<Vec<EventRow>>(cached) {
                Ok(rows) => return Ok(rows),
                Err(e) => debug!("discarding unreadable pending cache: {e}"),
            }
        }

        let mut pending = Vec::new();
        let mut invalid = Vec::new();
        for page in 1..=PENDING_MAX_PAGES {
            let rows = self.query(&QueryArgs {
                limit: PENDING_PAGE_SIZE,
                page,
                ..QueryArgs::default()
            })?;
            let full = rows.len() == PENDING_PAGE_SIZE;

            for row in rows {
                if row.timestamp <= 0 {
                    invalid.push(row.id);
                } else {
                    pending.push(row);
                }
            }

            if !full {
                break;
            }
            if page == PENDING_MAX_PAGES {
                warn!(
                    limit = PENDING_MAX_PAGES * PENDING_PAGE_SIZE,
                    "stopped runaway pending-events rebuild"
                );
            }
        }

        for id in invalid {
            warn!(event_id = id, "completing event with invalid timestamp");
            self.mark_record_completed(id);
        }

        self.cache.set(
            PENDING_CACHE_KEY,
            serde_json::to_value(&pending)?,
            Some(self.pending_ttl),
        );
        Ok(pending)
    }

    /// Drop the cached pending-events rendering.
    pub fn flush_internal_caches(&self) -> bool {
        self.cache.delete(PENDING_CACHE_KEY)
    }

    // --- args size policy --------------------------------------------------

    /// Whether the encoded args exceed the per-event share of the cache budget.
    ///
    /// Raw length decides clear-cut cases; compression runs only in between.
    pub fn args_too_large(&self, encoded: &str) -> bool {
        let threshold = self.args_size.threshold();
        let raw = encoded.len();
        if raw <= threshold {
            return false;
        }
        if raw > threshold.saturating_mul(self.args_size.compression_ceiling.max(1)) {
            return true;
        }
        match zstd::encode_all(encoded.as_bytes(), 3) {
            Ok(compressed) => compressed.len() > threshold,
            Err(e) => {
                debug!("args compression failed: {e}");
                true
            }
        }
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        action: row.get(2)?,
        action_hashed: row.get(3)?,
        instance: row.get(4)?,
        args: row.get(5)?,
        schedule: row.get(6)?,
        interval: row.get(7)?,
        status: row.get(8)?,
        created: row.get(9)?,
        last_modified: row.get(10)?,
    })
}
