use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};

use cronctl_core::now_ts;
use rusqlite::types::Value as SqlValue;
use tracing::{debug, info, warn};

use crate::error::{EventError, Result};
use crate::events::Events;
use crate::registry::DispatchError;
use crate::store::EventsStore;
use crate::types::{
    hash_action, placeholder_instance, Column, EventArgs, EventRow, EventStatus, NewEventRow,
    QueryArgs, RowChanges,
};

/// One scheduled occurrence of an action.
///
/// Setters silently ignore invalid input and record which columns changed;
/// [`save`](Event::save) writes only those columns. `args` and `instance` are
/// always changed together.
#[derive(Debug, Clone, Default)]
pub struct Event {
    id: Option<i64>,
    status: Option<EventStatus>,
    action: Option<String>,
    action_hashed: Option<String>,
    args: EventArgs,
    instance: Option<String>,
    schedule: Option<String>,
    interval: Option<i64>,
    timestamp: Option<i64>,
    created: Option<String>,
    last_modified: Option<String>,
    changed: BTreeSet<Column>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an event by id.
    pub fn get(store: &EventsStore, id: i64) -> Option<Event> {
        store.get_raw(id).and_then(Event::from_row)
    }

    /// First event matching `query`.
    pub fn find(store: &EventsStore, query: &QueryArgs) -> Result<Option<Event>> {
        let query = QueryArgs {
            limit: 1,
            page: 1,
            ..query.clone()
        };
        Ok(store.query(&query)?.into_iter().next().and_then(Event::from_row))
    }

    /// Hydrate from a stored row. `None` if the stored args are unreadable.
    pub fn from_row(row: EventRow) -> Option<Event> {
        let args = match row.decode_args() {
            Ok(args) => args,
            Err(e) => {
                warn!(event_id = row.id, "unreadable event args: {e}");
                return None;
            }
        };

        let mut event = Event {
            id: Some(row.id),
            created: Some(row.created),
            last_modified: Some(row.last_modified),
            ..Event::default()
        };
        event.set_status(&row.status);
        event.set_action(&row.action);
        event.set_timestamp(row.timestamp);
        event.set_args(args);
        // completed rows carry a placeholder instance, keep what is stored
        event.instance = Some(row.instance);
        if let Some(schedule) = row.schedule.as_deref() {
            event.set_schedule(schedule, row.interval);
        }
        event.changed.clear();
        Some(event)
    }

    // --- getters -----------------------------------------------------------

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn status(&self) -> Option<EventStatus> {
        self.status
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn action_hashed(&self) -> Option<&str> {
        self.action_hashed.as_deref()
    }

    pub fn args(&self) -> &EventArgs {
        &self.args
    }

    /// Defaults to the fingerprint of the current args.
    pub fn instance(&self) -> String {
        self.instance
            .clone()
            .unwrap_or_else(|| self.args.instance())
    }

    pub fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref()
    }

    pub fn interval(&self) -> Option<i64> {
        self.interval
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn created(&self) -> Option<&str> {
        self.created.as_deref()
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    pub fn exists(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_recurring(&self) -> bool {
        matches!((&self.schedule, self.interval), (Some(s), Some(i)) if !s.is_empty() && i > 0)
    }

    pub fn is_internal(&self, events: &Events) -> bool {
        self.action
            .as_deref()
            .is_some_and(|action| events.is_internal_event(action))
    }

    // --- setters -----------------------------------------------------------

    /// Unknown statuses fall back to `pending`. Always marks status changed.
    pub fn set_status(&mut self, status: &str) {
        let status = status
            .to_lowercase()
            .parse()
            .unwrap_or(EventStatus::Pending);
        self.mark_status(status);
    }

    fn mark_status(&mut self, status: EventStatus) {
        self.status = Some(status);
        self.changed.insert(Column::Status);
    }

    /// Empty actions are ignored.
    pub fn set_action(&mut self, action: &str) {
        if action.is_empty() {
            return;
        }
        self.action = Some(action.to_string());
        self.action_hashed = Some(hash_action(action));
        self.changed.insert(Column::Action);
        self.changed.insert(Column::ActionHashed);
    }

    pub fn set_args(&mut self, args: EventArgs) {
        self.instance = Some(args.instance());
        self.args = args;
        self.changed.insert(Column::Args);
        self.changed.insert(Column::Instance);
    }

    /// Applied only when `schedule` is non-empty and `interval` positive.
    pub fn set_schedule(&mut self, schedule: &str, interval: i64) {
        if schedule.is_empty() || interval <= 0 {
            return;
        }
        self.schedule = Some(schedule.to_string());
        self.interval = Some(interval);
        self.changed.insert(Column::Schedule);
        self.changed.insert(Column::Interval);
    }

    /// Applied only when `timestamp >= 1`.
    pub fn set_timestamp(&mut self, timestamp: i64) {
        if timestamp < 1 {
            return;
        }
        self.timestamp = Some(timestamp);
        self.changed.insert(Column::Timestamp);
    }

    // --- persistence -------------------------------------------------------

    /// Write changed columns, or insert if the event is new.
    pub fn save(&mut self, store: &EventsStore) -> Result<()> {
        if self.changed.is_empty() {
            return Err(EventError::NoSaveNeeded);
        }
        if !self.exists() && self.action.is_none() && self.timestamp.is_none() {
            return Err(EventError::MissingProps);
        }

        let status = match (self.status, self.exists()) {
            (Some(status), _) => status,
            (None, false) => EventStatus::Pending,
            (None, true) => return Err(EventError::InvalidStatus),
        };
        self.validate()?;

        if self.changed.contains(&Column::Args) {
            let encoded = self.args.encode()?;
            if store.args_too_large(&encoded) {
                warn!(
                    action = self.action.as_deref().unwrap_or_default(),
                    bytes = encoded.len(),
                    "event args are large and will bloat the pending-events cache"
                );
            }
        }

        if let Some(id) = self.id {
            let changes = self.changed_row();
            if !store.update(id, &changes, &[]) {
                return Err(EventError::FailedUpdate { id });
            }
            self.changed.clear();
            return Ok(());
        }

        let recurring = self.is_recurring();
        let row = NewEventRow {
            timestamp: self.timestamp.unwrap_or_default(),
            action: self.action.clone().unwrap_or_default(),
            action_hashed: self.action_hashed.clone().unwrap_or_default(),
            instance: self.instance(),
            args: self.args.clone(),
            schedule: if recurring { self.schedule.clone() } else { None },
            interval: if recurring { self.interval.unwrap_or(0) } else { 0 },
            status,
        };
        let id = store.create(&row).ok_or(EventError::FailedCreate)?;

        self.id = Some(id);
        self.status = Some(status);
        self.changed.clear();
        info!(event_id = id, action = %row.action, timestamp = row.timestamp, "event created");
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.action.as_deref().map_or(true, str::is_empty) {
            return Err(EventError::InvalidAction);
        }
        if self.timestamp.map_or(true, |ts| ts < 1) {
            return Err(EventError::InvalidTimestamp);
        }
        match (&self.schedule, self.interval) {
            (None, None) => {}
            (Some(s), Some(i)) if !s.is_empty() && i > 0 => {}
            _ => return Err(EventError::InvalidSchedule),
        }
        Ok(())
    }

    fn changed_row(&self) -> RowChanges {
        let mut row = RowChanges::default();
        for col in &self.changed {
            match col {
                Column::Id => {}
                Column::Status => row.status = self.status,
                Column::Action => row.action = self.action.clone(),
                Column::ActionHashed => row.action_hashed = self.action_hashed.clone(),
                Column::Instance => row.instance = Some(self.instance()),
                Column::Args => row.args = Some(self.args.clone()),
                Column::Schedule => row.schedule = Some(self.schedule.clone()),
                Column::Interval => row.interval = Some(self.interval.unwrap_or(0)),
                Column::Timestamp => row.timestamp = self.timestamp,
            }
        }
        row
    }

    // --- lifecycle ---------------------------------------------------------

    /// Mark the event complete, releasing its uniqueness key.
    pub fn complete(&mut self, store: &EventsStore) -> Result<()> {
        if !self.exists() {
            return Err(EventError::CannotComplete);
        }
        self.instance = Some(placeholder_instance());
        self.changed.insert(Column::Instance);
        self.mark_status(EventStatus::Complete);
        self.save(store)?;
        debug!(event_id = ?self.id, "event completed");
        Ok(())
    }

    /// Move a recurring event to its next occurrence.
    ///
    /// One-shot events are completed instead and `CannotReschedule` returned.
    pub fn reschedule(&mut self, events: &Events) -> Result<()> {
        let id = self.id.ok_or(EventError::CannotReschedule)?;

        if !self.is_recurring() {
            if let Err(e) = self.complete(events.store()) {
                debug!(event_id = id, code = e.code(), "completing one-shot event failed");
            }
            return Err(EventError::CannotReschedule);
        }

        let stored = events.store().get_raw(id).and_then(|row| row.status());
        if !stored.is_some_and(|s| s.is_active()) {
            debug!(event_id = id, "stored event no longer active, not rescheduling");
            return Err(EventError::CannotRescheduleCompletedEvent);
        }

        let schedule = self.schedule.clone().unwrap_or_default();
        let current = self.interval.unwrap_or(0);
        let fresh = events.schedules().interval(&schedule).unwrap_or(current);
        let next = calculate_next_timestamp(self.timestamp.unwrap_or(0), fresh, now_ts());

        if fresh != current {
            self.set_schedule(&schedule, fresh);
        }
        self.set_timestamp(next);
        self.mark_status(EventStatus::Pending);
        self.save(events.store())?;

        info!(event_id = id, %schedule, next, "event rescheduled");
        Ok(())
    }

    // --- execution ---------------------------------------------------------

    /// Run the event if every guard passes.
    ///
    /// Guards, in order: due and pending; the per-action lock (skipped for
    /// actions allowed to overlap); the site-wide running ceiling (skipped for
    /// internal events); the conditional `pending → running` claim.
    pub fn run_if_allowed(&mut self, events: &Events) -> Result<()> {
        let id = self.id.ok_or(EventError::NotReadyYet)?;
        let timestamp = match self.timestamp {
            Some(ts) if ts <= now_ts() && self.status == Some(EventStatus::Pending) => ts,
            _ => return Err(EventError::NotReadyYet),
        };

        let action = self.action.clone().unwrap_or_default();
        let action_lock = if events.action_allows_concurrency(&action) {
            None
        } else {
            let name = action_lock_name(&action);
            events.lock().prime(&name, None);
            if !events.lock().check(&name, 1, events.action_lock_timeout()) {
                return Err(EventError::ActionLockUnavailable { action });
            }
            Some(name)
        };

        if !events.is_internal_event(&action) {
            let limit = events.concurrency_limit();
            let running = match events.store().count_by_status(EventStatus::Running) {
                Ok(n) => n,
                Err(e) => {
                    release_lock(events, action_lock.as_deref());
                    return Err(e);
                }
            };
            if running >= limit as i64 {
                release_lock(events, action_lock.as_deref());
                return Err(EventError::SiteConcurrencyLimitReached { limit });
            }
        }

        // Only the stored version that was found due may be claimed.
        let claim = [
            (
                Column::Status,
                SqlValue::Text(EventStatus::Pending.to_string()),
            ),
            (Column::Timestamp, SqlValue::Integer(timestamp)),
        ];
        if !events
            .store()
            .update(id, &RowChanges::status(EventStatus::Running), &claim)
        {
            release_lock(events, action_lock.as_deref());
            return Err(EventError::FailedToSetRunningStatus);
        }
        self.status = Some(EventStatus::Running);
        self.changed.remove(&Column::Status);

        let result = self.run(events);
        release_lock(events, action_lock.as_deref());
        result
    }

    /// Invoke the handler, then reschedule or complete.
    ///
    /// Handler errors and panics are logged and followed by the same
    /// bookkeeping as success. A bookkeeping failure takes precedence in the
    /// returned error.
    pub fn run(&mut self, events: &Events) -> Result<()> {
        let action = self.action.clone().unwrap_or_default();
        let args = &self.args;
        let registry = events.registry();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| registry.dispatch(&action, args)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(DispatchError::UnknownAction(action))) => Some(EventError::UnknownAction { action }),
            Ok(Err(DispatchError::Handler(e))) => Some(EventError::ErrorThrownDuringRun {
                reason: e.to_string(),
            }),
            Err(payload) => Some(EventError::ErrorThrownDuringRun {
                reason: panic_message(payload.as_ref()),
            }),
        };
        if let Some(err) = &failure {
            warn!(event_id = ?self.id, %action, code = err.code(), error = %err, "event handler failed");
        }

        let followup = if self.is_recurring() {
            self.reschedule(events)
        } else {
            self.complete(events.store())
        };

        match (failure, followup) {
            (None, result) => result,
            (Some(_), Err(e)) => Err(e),
            (Some(failure), Ok(())) => Err(failure),
        }
    }
}

/// Next due time for a recurring event, staying on the original cadence.
///
/// Early or on-time runs schedule a full interval ahead. Late runs land on the
/// next slot of the original grid: a 12h event running 6h late is due again
/// in 6h.
pub fn calculate_next_timestamp(timestamp: i64, interval: i64, now: i64) -> i64 {
    if interval <= 0 {
        return now;
    }
    if timestamp >= now {
        return now.saturating_add(interval);
    }
    let elapsed = now.saturating_sub(timestamp);
    now.saturating_add(interval - elapsed % interval)
}

pub(crate) fn action_lock_name(action: &str) -> String {
    format!("event_action_{action}")
}

fn release_lock(events: &Events, name: Option<&str>) {
    if let Some(name) = name {
        events.lock().free(name, None);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::test_events;
    use cronctl_lock::LockValue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn one_shot(action: &str, timestamp: i64, args: Vec<serde_json::Value>) -> Event {
        let mut event = Event::new();
        event.set_action(action);
        event.set_timestamp(timestamp);
        event.set_args(EventArgs::new(args));
        event
    }

    fn pending_count(events: &Events) -> i64 {
        events.store().count_by_status(EventStatus::Pending).unwrap()
    }

    #[test]
    fn next_timestamp_on_time_and_late() {
        let now = 1_000_000;
        assert_eq!(calculate_next_timestamp(now + 10, 3600, now), now + 3600);
        assert_eq!(calculate_next_timestamp(now, 3600, now), now + 3600);
        // 6h late on a 12h cadence: back on the grid in 6h
        assert_eq!(calculate_next_timestamp(now - 6 * 3600, 12 * 3600, now), now + 6 * 3600);
        // k whole intervals plus r late
        assert_eq!(calculate_next_timestamp(now - (3 * 600 + 45), 600, now), now + 555);
        // exactly on a grid point after missing runs
        assert_eq!(calculate_next_timestamp(now - 1200, 600, now), now + 600);
        // absurd intervals clamp instead of wrapping
        assert_eq!(calculate_next_timestamp(now, i64::MAX, now), i64::MAX);
        assert_eq!(calculate_next_timestamp(now - 10, i64::MAX, now), i64::MAX);
    }

    #[test]
    fn setters_ignore_invalid_input() {
        let mut event = Event::new();
        event.set_action("");
        event.set_timestamp(0);
        event.set_schedule("", 60);
        event.set_schedule("hourly", 0);
        assert!(event.action().is_none());
        assert!(event.timestamp().is_none());
        assert!(!event.is_recurring());
        assert!(event.changed.is_empty());
    }

    #[test]
    fn set_status_normalises() {
        let mut event = Event::new();
        event.set_status("RUNNING");
        assert_eq!(event.status(), Some(EventStatus::Running));
        event.set_status("bogus");
        assert_eq!(event.status(), Some(EventStatus::Pending));
    }

    #[test]
    fn args_and_instance_move_together() {
        let mut event = Event::new();
        let before = event.instance();
        event.set_args(EventArgs::new(vec![json!("weekly")]));
        assert_ne!(event.instance(), before);
        assert_eq!(event.instance(), EventArgs::new(vec![json!("weekly")]).instance());
        assert!(event.changed.contains(&Column::Instance));
        assert_eq!(event.action_hashed(), None);
        event.set_action("send_digest");
        assert_eq!(event.action_hashed(), Some(hash_action("send_digest").as_str()));
    }

    #[test]
    fn save_then_no_save_needed() {
        let events = test_events();
        let mut event = one_shot("noop", now_ts() + 60, vec![]);
        event.save(events.store()).unwrap();
        assert!(event.exists());
        assert_eq!(event.status(), Some(EventStatus::Pending));
        assert!(matches!(event.save(events.store()), Err(EventError::NoSaveNeeded)));
    }

    #[test]
    fn save_updates_only_changed_columns() {
        let events = test_events();
        let mut event = one_shot("noop", now_ts() + 60, vec![json!(1)]);
        event.save(events.store()).unwrap();
        let id = event.id().unwrap();

        event.set_timestamp(now_ts() + 120);
        assert_eq!(event.changed_row().columns(), BTreeSet::from([Column::Timestamp]));
        event.save(events.store()).unwrap();

        let loaded = Event::get(events.store(), id).unwrap();
        assert_eq!(loaded.timestamp(), event.timestamp());
        assert_eq!(loaded.args(), &EventArgs::new(vec![json!(1)]));
    }

    #[test]
    fn validation_gate_blocks_writes() {
        let events = test_events();

        let mut no_action = Event::new();
        no_action.set_timestamp(now_ts());
        assert!(matches!(no_action.save(events.store()), Err(EventError::InvalidAction)));

        let mut no_timestamp = Event::new();
        no_timestamp.set_action("a");
        assert!(matches!(no_timestamp.save(events.store()), Err(EventError::InvalidTimestamp)));

        let mut half_schedule = one_shot("a", now_ts(), vec![]);
        half_schedule.schedule = Some("hourly".into());
        assert!(matches!(half_schedule.save(events.store()), Err(EventError::InvalidSchedule)));

        let mut zero_interval = one_shot("a", now_ts(), vec![]);
        zero_interval.schedule = Some("hourly".into());
        zero_interval.interval = Some(0);
        assert!(matches!(zero_interval.save(events.store()), Err(EventError::InvalidSchedule)));

        let mut nothing = Event::new();
        nothing.set_args(EventArgs::default());
        assert!(matches!(nothing.save(events.store()), Err(EventError::MissingProps)));

        assert_eq!(pending_count(&events), 0);
    }

    #[test]
    fn invalid_status_on_existing_event() {
        let events = test_events();
        let ts = now_ts();
        let mut event = one_shot("a", ts, vec![]);
        event.save(events.store()).unwrap();
        event.status = None;
        event.set_timestamp(ts + 500);
        assert!(matches!(event.save(events.store()), Err(EventError::InvalidStatus)));
        let stored = Event::get(events.store(), event.id().unwrap()).unwrap();
        assert_eq!(stored.timestamp(), Some(ts));
    }

    #[test]
    fn duplicate_fingerprint_fails_create() {
        let events = test_events();
        let ts = now_ts() + 60;
        one_shot("dup", ts, vec![json!(1)]).save(events.store()).unwrap();
        let err = one_shot("dup", ts, vec![json!(1)]).save(events.store()).unwrap_err();
        assert!(matches!(err, EventError::FailedCreate));
        assert_eq!(pending_count(&events), 1);
    }

    #[test]
    fn complete_requires_existence_and_scrambles_instance() {
        let events = test_events();
        let mut event = one_shot("a", now_ts(), vec![json!("x")]);
        assert!(matches!(event.complete(events.store()), Err(EventError::CannotComplete)));

        event.save(events.store()).unwrap();
        let original = event.instance();
        event.complete(events.store()).unwrap();
        let row = events.store().get_raw(event.id().unwrap()).unwrap();
        assert_eq!(row.status, "complete");
        assert_ne!(row.instance, original);
        assert_eq!(event.instance(), row.instance);
    }

    #[test]
    fn reschedule_one_shot_completes() {
        let events = test_events();
        let mut event = one_shot("a", now_ts(), vec![]);
        assert!(matches!(event.reschedule(&events), Err(EventError::CannotReschedule)));

        event.save(events.store()).unwrap();
        assert!(matches!(event.reschedule(&events), Err(EventError::CannotReschedule)));
        assert_eq!(event.status(), Some(EventStatus::Complete));
        let row = events.store().get_raw(event.id().unwrap()).unwrap();
        assert_eq!(row.status, "complete");
    }

    #[test]
    fn reschedule_recurring_moves_forward() {
        let events = test_events();
        let now = now_ts();
        let mut event = one_shot("tick", now - 30, vec![]);
        event.set_schedule("hourly", 3600);
        event.save(events.store()).unwrap();

        event.reschedule(&events).unwrap();
        let ts = event.timestamp().unwrap();
        assert!(ts > now && ts <= now_ts() + 3600);
        assert_eq!(event.status(), Some(EventStatus::Pending));
    }

    #[test]
    fn reschedule_picks_up_redefined_interval() {
        let events = test_events();
        events.schedules().register("custom", 600);
        let now = now_ts();
        let mut event = one_shot("tick", now + 10, vec![]);
        event.set_schedule("custom", 600);
        event.save(events.store()).unwrap();

        events.schedules().register("custom", 120);
        event.reschedule(&events).unwrap();
        assert_eq!(event.interval(), Some(120));
        let row = events.store().get_raw(event.id().unwrap()).unwrap();
        assert_eq!(row.interval, 120);
        assert!(row.timestamp <= now_ts() + 120);
    }

    #[test]
    fn reschedule_refuses_completed_row() {
        let events = test_events();
        let mut event = one_shot("tick", now_ts(), vec![]);
        event.set_schedule("hourly", 3600);
        event.save(events.store()).unwrap();

        // another process completes the row; our copy is stale
        let mut other = Event::get(events.store(), event.id().unwrap()).unwrap();
        other.complete(events.store()).unwrap();

        assert!(matches!(
            event.reschedule(&events),
            Err(EventError::CannotRescheduleCompletedEvent)
        ));
        let row = events.store().get_raw(event.id().unwrap()).unwrap();
        assert_eq!(row.status, "complete");
    }

    #[test]
    fn run_if_allowed_not_ready() {
        let events = test_events();
        let mut future = one_shot("a", now_ts() + 3600, vec![]);
        future.save(events.store()).unwrap();
        assert!(matches!(future.run_if_allowed(&events), Err(EventError::NotReadyYet)));

        let mut unsaved = one_shot("a", now_ts() - 1, vec![]);
        assert!(matches!(unsaved.run_if_allowed(&events), Err(EventError::NotReadyYet)));
    }

    #[test]
    fn run_if_allowed_respects_action_lock() {
        let events = test_events();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        events.registry().register("locked", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut event = one_shot("locked", now_ts() - 1, vec![]);
        event.save(events.store()).unwrap();

        let lock_name = action_lock_name("locked");
        events.lock().prime(&lock_name, None);
        assert!(events.lock().check(&lock_name, 1, events.action_lock_timeout()));

        assert!(matches!(
            event.run_if_allowed(&events),
            Err(EventError::ActionLockUnavailable { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        events.lock().free(&lock_name, None);
        event.run_if_allowed(&events).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.lock().value(&lock_name), LockValue::Count(0));
    }

    #[test]
    fn run_if_allowed_site_limit_releases_lock() {
        let events = test_events();
        events.registry().register("work", |_| Ok(()));
        let limit = events.concurrency_limit();
        for i in 0..limit {
            let mut busy = one_shot("busy", now_ts() - 1, vec![json!(i)]);
            busy.save(events.store()).unwrap();
            events.store().update(
                busy.id().unwrap(),
                &RowChanges::status(EventStatus::Running),
                &[],
            );
        }

        let mut event = one_shot("work", now_ts() - 1, vec![]);
        event.save(events.store()).unwrap();
        assert!(matches!(
            event.run_if_allowed(&events),
            Err(EventError::SiteConcurrencyLimitReached { .. })
        ));
        assert_eq!(events.lock().value(&action_lock_name("work")), LockValue::Count(0));
    }

    #[test]
    fn run_if_allowed_lost_claim_releases_lock() {
        let events = test_events();
        events.registry().register("race", |_| Ok(()));
        let mut event = one_shot("race", now_ts() - 1, vec![]);
        event.save(events.store()).unwrap();

        // another runner claimed it after we loaded our copy
        events.store().update(
            event.id().unwrap(),
            &RowChanges::status(EventStatus::Running),
            &[],
        );

        assert!(matches!(
            event.run_if_allowed(&events),
            Err(EventError::FailedToSetRunningStatus)
        ));
        assert_eq!(events.lock().value(&action_lock_name("race")), LockValue::Count(0));
    }

    #[test]
    fn stale_copy_cannot_rerun_rescheduled_event() {
        let events = test_events();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        events.registry().register("hourly_sync", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let now = now_ts();
        let mut event = one_shot("hourly_sync", now - 5, vec![]);
        event.set_schedule("hourly", 3600);
        event.save(events.store()).unwrap();
        let id = event.id().unwrap();

        let mut first = Event::get(events.store(), id).unwrap();
        let mut stale = Event::get(events.store(), id).unwrap();
        first.run_if_allowed(&events).unwrap();
        let moved_to = events.store().get_raw(id).unwrap().timestamp;
        assert!(moved_to > now);

        // the row is pending again, but not the version `stale` saw as due
        assert!(matches!(
            stale.run_if_allowed(&events),
            Err(EventError::FailedToSetRunningStatus)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let row = events.store().get_raw(id).unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.timestamp, moved_to);
        assert_eq!(events.lock().value(&action_lock_name("hourly_sync")), LockValue::Count(0));
    }

    #[test]
    fn run_recovers_from_handler_error() {
        let events = test_events();
        events.registry().register("explode", |_| Err("boom".into()));
        let mut event = one_shot("explode", now_ts() - 1, vec![]);
        event.save(events.store()).unwrap();

        let err = event.run_if_allowed(&events).unwrap_err();
        assert!(matches!(err, EventError::ErrorThrownDuringRun { ref reason } if reason == "boom"));
        assert_eq!(event.status(), Some(EventStatus::Complete));
    }

    #[test]
    fn run_recovers_from_panic() {
        let events = test_events();
        events.registry().register("panics", |_| panic!("handler blew up"));
        let mut event = one_shot("panics", now_ts() - 1, vec![]);
        event.set_schedule("hourly", 3600);
        event.save(events.store()).unwrap();

        let err = event.run_if_allowed(&events).unwrap_err();
        assert!(
            matches!(err, EventError::ErrorThrownDuringRun { ref reason } if reason.contains("blew up"))
        );
        // recurring: still rescheduled
        assert_eq!(event.status(), Some(EventStatus::Pending));
        assert!(event.timestamp().unwrap() > now_ts());
    }

    #[test]
    fn run_unknown_action_still_completes() {
        let events = test_events();
        let mut event = one_shot("unregistered", now_ts() - 1, vec![]);
        event.save(events.store()).unwrap();
        assert!(matches!(
            event.run_if_allowed(&events),
            Err(EventError::UnknownAction { .. })
        ));
        let row = events.store().get_raw(event.id().unwrap()).unwrap();
        assert_eq!(row.status, "complete");
    }

    #[test]
    fn concurrent_action_skips_lock() {
        let events = test_events();
        events.registry().register("parallel", |_| Ok(()));
        let lock_name = action_lock_name("parallel");
        events.lock().prime(&lock_name, None);
        assert!(events.lock().check(&lock_name, 1, events.action_lock_timeout()));

        let mut event = one_shot("parallel", now_ts() - 1, vec![]);
        event.save(events.store()).unwrap();
        // held lock is irrelevant for allow-listed actions
        event.run_if_allowed(&events).unwrap();
        assert_eq!(events.lock().value(&lock_name), LockValue::Count(1));
    }

    #[test]
    fn find_by_fingerprint() {
        let events = test_events();
        let ts = now_ts() + 100;
        let mut event = one_shot("lookup", ts, vec![json!({"k": "v"})]);
        event.save(events.store()).unwrap();

        let found = Event::find(
            events.store(),
            &QueryArgs::fingerprint(ts, "lookup", &event.instance()),
        )
        .unwrap()
        .unwrap();
        assert_eq!(found.id(), event.id());
        assert!(found.created().is_some());
        assert!(Event::find(events.store(), &QueryArgs::fingerprint(ts, "lookup", "nope"))
            .unwrap()
            .is_none());
    }
}
