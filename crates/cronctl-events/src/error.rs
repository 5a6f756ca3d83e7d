use thiserror::Error;

/// Errors returned by event lifecycle, store, and engine operations.
///
/// Every variant has a stable [`code`](EventError::code). The `run_if_allowed`
/// rejections are expected under load; see [`is_skip`](EventError::is_skip).
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid status")]
    InvalidStatus,

    #[error("action must not be empty")]
    InvalidAction,

    #[error("timestamp must be a positive unix time")]
    InvalidTimestamp,

    #[error("schedule and interval must both be set, or both be absent")]
    InvalidSchedule,

    /// Nothing changed since the last save. Not a failure.
    #[error("no save needed")]
    NoSaveNeeded,

    #[error("action and timestamp are required")]
    MissingProps,

    #[error("event does not exist and cannot be completed")]
    CannotComplete,

    #[error("event cannot be rescheduled")]
    CannotReschedule,

    #[error("event was completed elsewhere and cannot be rescheduled")]
    CannotRescheduleCompletedEvent,

    #[error("event is not due or not pending")]
    NotReadyYet,

    #[error("action lock unavailable for {action}")]
    ActionLockUnavailable { action: String },

    #[error("site concurrency limit of {limit} reached")]
    SiteConcurrencyLimitReached { limit: usize },

    #[error("event was claimed by another runner")]
    FailedToSetRunningStatus,

    #[error("handler failed: {reason}")]
    ErrorThrownDuringRun { reason: String },

    #[error("no handler registered for action {action}")]
    UnknownAction { action: String },

    #[error("failed to update event {id}")]
    FailedUpdate { id: i64 },

    #[error("failed to create event")]
    FailedCreate,

    #[error("no pending event matches the request")]
    NoEvent,

    #[error("automatic execution is disabled")]
    RunDisabled,

    #[error("no free run slots")]
    NoFreeThreads,

    #[error("disable timestamp must be in the future")]
    InvalidDisableTimestamp,

    #[error("unknown schedule: {name}")]
    UnknownSchedule { name: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventError {
    pub fn code(&self) -> &'static str {
        match self {
            EventError::InvalidStatus => "prop-validation:invalid-status",
            EventError::InvalidAction => "prop-validation:invalid-action",
            EventError::InvalidTimestamp => "prop-validation:invalid-timestamp",
            EventError::InvalidSchedule => "prop-validation:invalid-schedule",
            EventError::NoSaveNeeded => "no-save-needed",
            EventError::MissingProps => "missing-props",
            EventError::CannotComplete => "cannot-complete",
            EventError::CannotReschedule => "cannot-reschedule",
            EventError::CannotRescheduleCompletedEvent => "cannot-reschedule-completed-event",
            EventError::NotReadyYet => "not-ready-yet",
            EventError::ActionLockUnavailable { .. } => "action-lock-unavailable",
            EventError::SiteConcurrencyLimitReached { .. } => "site-concurrency-limit-reached",
            EventError::FailedToSetRunningStatus => "failed-to-set-running-status",
            EventError::ErrorThrownDuringRun { .. } => "error-thrown-during-run",
            EventError::UnknownAction { .. } => "unknown-action",
            EventError::FailedUpdate { .. } => "failed-update",
            EventError::FailedCreate => "failed-create",
            EventError::NoEvent => "no-event",
            EventError::RunDisabled => "run-disabled",
            EventError::NoFreeThreads => "no-free-threads",
            EventError::InvalidDisableTimestamp => "invalid-disable-timestamp",
            EventError::UnknownSchedule { .. } => "unknown-schedule",
            EventError::Database(_) => "database",
            EventError::Serialization(_) => "serialization",
        }
    }

    /// Guard-chain rejections: the event should simply be tried next cycle.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            EventError::NotReadyYet
                | EventError::ActionLockUnavailable { .. }
                | EventError::SiteConcurrencyLimitReached { .. }
                | EventError::FailedToSetRunningStatus
                | EventError::NoFreeThreads
        )
    }
}

pub type Result<T> = std::result::Result<T, EventError>;
