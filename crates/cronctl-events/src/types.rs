use std::collections::BTreeSet;

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Lifecycle state of an event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for its timestamp.
    Pending,
    /// Claimed by a runner.
    Running,
    /// Terminal. Purged by the maintenance job.
    Complete,
}

impl EventStatus {
    pub const ALL: [EventStatus; 3] = [
        EventStatus::Pending,
        EventStatus::Running,
        EventStatus::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Running => "running",
            EventStatus::Complete => "complete",
        }
    }

    /// Pending and running events still occupy their uniqueness key.
    pub fn is_active(&self) -> bool {
        !matches!(self, EventStatus::Complete)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "running" => Ok(EventStatus::Running),
            "complete" => Ok(EventStatus::Complete),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// Ordered handler arguments.
///
/// JSON-encoded only when crossing into the store; the encoding is also what
/// the instance fingerprint hashes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventArgs(pub Vec<Value>);

impl EventArgs {
    pub fn new(args: Vec<Value>) -> Self {
        Self(args)
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(Self(serde_json::from_str(raw)?))
    }

    /// Fingerprint of the encoded args.
    pub fn instance(&self) -> String {
        // Vec<Value> encoding cannot fail: map keys are always strings.
        let encoded = serde_json::to_string(&self.0).unwrap_or_default();
        sha256_hex(&encoded)
    }
}

impl From<Vec<Value>> for EventArgs {
    fn from(args: Vec<Value>) -> Self {
        Self(args)
    }
}

/// Hash under which an action may be referenced over untrusted channels.
pub fn hash_action(action: &str) -> String {
    sha256_hex(action)
}

/// Instance value for a completed event, freeing the original uniqueness key.
pub fn placeholder_instance() -> String {
    format!("completed-{}", uuid::Uuid::new_v4().simple())
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// One row of `cron_control_events`, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: i64,
    pub timestamp: i64,
    pub action: String,
    pub action_hashed: String,
    pub instance: String,
    /// JSON-encoded [`EventArgs`].
    pub args: String,
    pub schedule: Option<String>,
    /// `0` for one-shot events.
    pub interval: i64,
    pub status: String,
    pub created: String,
    pub last_modified: String,
}

impl EventRow {
    pub fn decode_args(&self) -> Result<EventArgs> {
        EventArgs::decode(&self.args)
    }

    pub fn status(&self) -> Option<EventStatus> {
        self.status.parse().ok()
    }
}

/// Full column set for an insert.
#[derive(Debug, Clone)]
pub struct NewEventRow {
    pub timestamp: i64,
    pub action: String,
    pub action_hashed: String,
    pub instance: String,
    pub args: EventArgs,
    pub schedule: Option<String>,
    pub interval: i64,
    pub status: EventStatus,
}

/// Updatable columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Column {
    Id,
    Timestamp,
    Action,
    ActionHashed,
    Instance,
    Args,
    Schedule,
    Interval,
    Status,
}

impl Column {
    pub fn as_str(&self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::Timestamp => "timestamp",
            Column::Action => "action",
            Column::ActionHashed => "action_hashed",
            Column::Instance => "instance",
            Column::Args => "args",
            Column::Schedule => "schedule",
            Column::Interval => "interval",
            Column::Status => "status",
        }
    }
}

/// Partial update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct RowChanges {
    pub timestamp: Option<i64>,
    pub action: Option<String>,
    pub action_hashed: Option<String>,
    pub instance: Option<String>,
    pub args: Option<EventArgs>,
    /// `Some(None)` clears the schedule.
    pub schedule: Option<Option<String>>,
    pub interval: Option<i64>,
    pub status: Option<EventStatus>,
}

impl RowChanges {
    pub fn status(status: EventStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns().is_empty()
    }

    pub fn columns(&self) -> BTreeSet<Column> {
        let mut cols = BTreeSet::new();
        if self.timestamp.is_some() {
            cols.insert(Column::Timestamp);
        }
        if self.action.is_some() {
            cols.insert(Column::Action);
        }
        if self.action_hashed.is_some() {
            cols.insert(Column::ActionHashed);
        }
        if self.instance.is_some() {
            cols.insert(Column::Instance);
        }
        if self.args.is_some() {
            cols.insert(Column::Args);
        }
        if self.schedule.is_some() {
            cols.insert(Column::Schedule);
        }
        if self.interval.is_some() {
            cols.insert(Column::Interval);
        }
        if self.status.is_some() {
            cols.insert(Column::Status);
        }
        cols
    }

    /// Column/value pairs ready for binding, args encoded.
    pub(crate) fn assignments(&self) -> Result<Vec<(Column, SqlValue)>> {
        let mut out = Vec::new();
        if let Some(ts) = self.timestamp {
            out.push((Column::Timestamp, SqlValue::Integer(ts)));
        }
        if let Some(action) = &self.action {
            out.push((Column::Action, SqlValue::Text(action.clone())));
        }
        if let Some(hashed) = &self.action_hashed {
            out.push((Column::ActionHashed, SqlValue::Text(hashed.clone())));
        }
        if let Some(instance) = &self.instance {
            out.push((Column::Instance, SqlValue::Text(instance.clone())));
        }
        if let Some(args) = &self.args {
            out.push((Column::Args, SqlValue::Text(args.encode()?)));
        }
        if let Some(schedule) = &self.schedule {
            let value = match schedule {
                Some(name) => SqlValue::Text(name.clone()),
                None => SqlValue::Null,
            };
            out.push((Column::Schedule, value));
        }
        if let Some(interval) = self.interval {
            out.push((Column::Interval, SqlValue::Integer(interval)));
        }
        if let Some(status) = self.status {
            out.push((Column::Status, SqlValue::Text(status.to_string())));
        }
        Ok(out)
    }
}

/// Timestamp predicate for [`QueryArgs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFilter {
    #[default]
    Any,
    /// `timestamp <= now`.
    DueNow,
    /// Inclusive bounds.
    Range { from: i64, to: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    Timestamp,
    Id,
}

/// Filters for [`EventsStore::query`](crate::store::EventsStore::query).
#[derive(Debug, Clone)]
pub struct QueryArgs {
    /// Empty matches every status.
    pub status: Vec<EventStatus>,
    pub action: Option<String>,
    /// Empty matches every action.
    pub actions: Vec<String>,
    pub exclude_actions: Vec<String>,
    pub action_hashed: Option<String>,
    pub instance: Option<String>,
    /// Converted to an instance filter; ignored when `instance` is set.
    pub args: Option<EventArgs>,
    pub schedule: Option<String>,
    pub timestamp: TimestampFilter,
    /// `0` means no limit.
    pub limit: usize,
    /// 1-based.
    pub page: usize,
    pub order: SortOrder,
    pub orderby: OrderBy,
}

impl Default for QueryArgs {
    fn default() -> Self {
        Self {
            status: vec![EventStatus::Pending],
            action: None,
            actions: Vec::new(),
            exclude_actions: Vec::new(),
            action_hashed: None,
            instance: None,
            args: None,
            schedule: None,
            timestamp: TimestampFilter::Any,
            limit: 100,
            page: 1,
            order: SortOrder::Asc,
            orderby: OrderBy::Timestamp,
        }
    }
}

impl QueryArgs {
    /// Lookup of a single event by its uniqueness key, in any status.
    pub fn fingerprint(timestamp: i64, action: &str, instance: &str) -> Self {
        Self {
            status: Vec::new(),
            action: Some(action.to_string()),
            instance: Some(instance.to_string()),
            timestamp: TimestampFilter::Range {
                from: timestamp,
                to: timestamp,
            },
            limit: 1,
            ..Self::default()
        }
    }
}

/// Per-status row counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub complete: i64,
}
