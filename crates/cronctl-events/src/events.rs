use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use cronctl_core::config::{CronControlConfig, LimitsConfig, RUN_LOCK};
use cronctl_core::now_ts;
use cronctl_lock::{Lock, LockValue};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{EventError, Result};
use crate::event::Event;
use crate::internal::{self, InternalEvents};
use crate::registry::{ActionHandler, ActionRegistry};
use crate::schedules::Schedules;
use crate::store::EventsStore;
use crate::types::{EventArgs, EventRow, EventStatus, QueryArgs, TimestampFilter};

/// Durable flag: `0` enabled, `1` disabled, anything larger disabled until then.
const RUN_DISABLED_SETTING: &str = "automatic_execution_disabled";
/// Rows completed per round by `clear_scheduled_hook`.
const CLEAR_BATCH_SIZE: usize = 500;

/// A due event as handed to runners. The plain action name is not exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DueEvent {
    pub timestamp: i64,
    pub action_hashed: String,
    pub instance: String,
}

impl From<&EventRow> for DueEvent {
    fn from(row: &EventRow) -> Self {
        Self {
            timestamp: row.timestamp,
            action_hashed: row.action_hashed.clone(),
            instance: row.instance.clone(),
        }
    }
}

/// Whether due batches are being handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "until", rename_all = "snake_case")]
pub enum RunState {
    Enabled,
    Disabled,
    DisabledUntil(i64),
}

/// One page of an administrative listing.
#[derive(Debug, Clone, Serialize)]
pub struct EventListing {
    pub events: Vec<EventRow>,
    pub total: i64,
    pub page: usize,
    pub total_pages: usize,
}

/// Snapshot of the site-wide run lock.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub value: LockValue,
    pub heartbeat: i64,
    pub limit: usize,
}

/// Scheduling engine: due batches, guarded execution, and admin operations.
///
/// Construct once per process and share via `Arc<Events>`.
pub struct Events {
    store: Arc<EventsStore>,
    lock: Lock,
    registry: Arc<ActionRegistry>,
    schedules: Arc<Schedules>,
    internal: Arc<InternalEvents>,
    limits: LimitsConfig,
    concurrent_actions: HashSet<String>,
    due_batch_size: usize,
}

impl Events {
    /// Build the engine and bind the internal maintenance handlers.
    pub fn new(
        store: Arc<EventsStore>,
        registry: Arc<ActionRegistry>,
        config: &CronControlConfig,
    ) -> Self {
        let lock = Lock::new(store.cache().clone());
        lock.prime(RUN_LOCK, None);

        let schedules = Arc::new(Schedules::new());
        let internal = Arc::new(InternalEvents::new());
        internal::register_handlers(&registry, &store, &schedules, &internal);

        Self {
            store,
            lock,
            registry,
            schedules,
            internal,
            limits: config.limits.clone(),
            concurrent_actions: config.events.concurrent_actions.iter().cloned().collect(),
            due_batch_size: config.events.due_batch_size.max(1),
        }
    }

    pub fn store(&self) -> &EventsStore {
        &self.store
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn schedules(&self) -> &Schedules {
        &self.schedules
    }

    pub fn internal_events(&self) -> &InternalEvents {
        &self.internal
    }

    pub fn concurrency_limit(&self) -> usize {
        self.limits.job_concurrency_limit.max(1)
    }

    pub fn action_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.job_lock_expiry_secs)
    }

    fn run_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.job_timeout_secs)
    }

    pub fn is_internal_event(&self, action: &str) -> bool {
        self.internal.contains(action)
    }

    pub fn action_allows_concurrency(&self, action: &str) -> bool {
        self.concurrent_actions.contains(action)
    }

    // --- due batches and execution ----------------------------------------

    /// Events due now, shaped for runners.
    ///
    /// Regular events are interleaved across actions and capped at the queue
    /// size; internal events are always included. Empty while automatic
    /// execution is disabled.
    pub fn get_events(&self) -> Result<Vec<DueEvent>> {
        if self.is_run_disabled()? {
            debug!("automatic execution disabled, returning empty batch");
            return Ok(Vec::new());
        }

        // Separate scans so a regular backlog cannot push maintenance out.
        let internal_actions: Vec<String> =
            self.internal.list().into_iter().map(|def| def.action).collect();
        let regular = self.store.query(&QueryArgs {
            exclude_actions: internal_actions.clone(),
            timestamp: TimestampFilter::DueNow,
            limit: self.due_batch_size,
            ..QueryArgs::default()
        })?;
        let internal = if internal_actions.is_empty() {
            Vec::new()
        } else {
            self.store.query(&QueryArgs {
                actions: internal_actions,
                timestamp: TimestampFilter::DueNow,
                limit: self.due_batch_size,
                ..QueryArgs::default()
            })?
        };

        let mut batch: Vec<DueEvent> = reduce_queue(regular, self.limits.job_queue_size)
            .iter()
            .map(DueEvent::from)
            .collect();
        batch.extend(internal.iter().map(DueEvent::from));
        Ok(batch)
    }

    /// Run the pending event identified by `(timestamp, action_hashed, instance)`.
    ///
    /// Non-internal events must also win a slot on the site-wide run lock.
    /// `force` skips the disabled flag, the run lock, and the guard chain.
    pub fn run_event(
        &self,
        timestamp: i64,
        action_hashed: &str,
        instance: &str,
        force: bool,
    ) -> Result<()> {
        if !force && self.is_run_disabled()? {
            return Err(EventError::RunDisabled);
        }
        if timestamp > now_ts() {
            return Err(EventError::NotReadyYet);
        }

        let query = QueryArgs {
            action_hashed: Some(action_hashed.to_string()),
            instance: Some(instance.to_string()),
            timestamp: TimestampFilter::Range {
                from: timestamp,
                to: timestamp,
            },
            ..QueryArgs::default()
        };
        let mut event = Event::find(&self.store, &query)?.ok_or(EventError::NoEvent)?;

        if force {
            info!(event_id = ?event.id(), action = ?event.action(), "force-running event");
            return event.run(self);
        }

        let internal = event.is_internal(self);
        if !internal && !self.lock.check(RUN_LOCK, self.concurrency_limit(), self.run_lock_timeout())
        {
            return Err(EventError::NoFreeThreads);
        }

        let result = event.run_if_allowed(self);
        if !internal {
            self.lock.free(RUN_LOCK, None);
        }
        if result.is_ok() {
            debug!(event_id = ?event.id(), action = ?event.action(), "event ran");
        }
        result
    }

    // --- automatic execution toggle ---------------------------------------

    /// Current state. An elapsed "disabled until" resets to enabled.
    pub fn run_state(&self) -> Result<RunState> {
        match self.store.get_setting(RUN_DISABLED_SETTING)?.unwrap_or(0) {
            0 => Ok(RunState::Enabled),
            1 => Ok(RunState::Disabled),
            until if until > now_ts() => Ok(RunState::DisabledUntil(until)),
            _ => {
                info!("automatic execution re-enabled after timed disable");
                self.store.set_setting(RUN_DISABLED_SETTING, 0)?;
                Ok(RunState::Enabled)
            }
        }
    }

    pub fn is_run_disabled(&self) -> Result<bool> {
        Ok(self.run_state()? != RunState::Enabled)
    }

    pub fn enable_automatic_execution(&self) -> Result<()> {
        self.store.set_setting(RUN_DISABLED_SETTING, 0)?;
        info!("automatic execution enabled");
        Ok(())
    }

    pub fn disable_automatic_execution(&self) -> Result<()> {
        self.store.set_setting(RUN_DISABLED_SETTING, 1)?;
        info!("automatic execution disabled");
        Ok(())
    }

    pub fn disable_automatic_execution_until(&self, until: i64) -> Result<()> {
        if until <= now_ts() {
            return Err(EventError::InvalidDisableTimestamp);
        }
        self.store.set_setting(RUN_DISABLED_SETTING, until)?;
        info!(until, "automatic execution disabled until timestamp");
        Ok(())
    }

    // --- admin -------------------------------------------------------------

    pub fn list_events(&self, status: EventStatus, limit: usize, page: usize) -> Result<EventListing> {
        let limit = limit.max(1);
        let page = page.max(1);
        let total = self.store.count_by_status(status)?;
        let events = self.store.query(&QueryArgs {
            status: vec![status],
            limit,
            page,
            ..QueryArgs::default()
        })?;
        Ok(EventListing {
            events,
            total,
            page,
            total_pages: (total.max(0) as usize).div_ceil(limit),
        })
    }

    pub fn flush_internal_caches(&self) -> bool {
        self.store.flush_internal_caches()
    }

    pub fn run_lock_status(&self) -> LockStatus {
        LockStatus {
            value: self.lock.value(RUN_LOCK),
            heartbeat: self.lock.heartbeat(RUN_LOCK),
            limit: self.concurrency_limit(),
        }
    }

    pub fn reset_run_lock(&self) {
        self.lock.reset(RUN_LOCK, None);
        info!(lock = RUN_LOCK, "run lock reset");
    }

    // --- scheduling --------------------------------------------------------

    /// Schedule a one-shot event. Returns the id of the new or existing row.
    pub fn schedule_single_event(&self, timestamp: i64, action: &str, args: EventArgs) -> Result<i64> {
        let mut event = Event::new();
        event.set_action(action);
        event.set_timestamp(timestamp);
        event.set_args(args);
        self.insert_unique(event)
    }

    /// Schedule a recurring event on a named schedule.
    pub fn schedule_recurring_event(
        &self,
        timestamp: i64,
        schedule: &str,
        action: &str,
        args: EventArgs,
    ) -> Result<i64> {
        let interval = self
            .schedules
            .interval(schedule)
            .ok_or_else(|| EventError::UnknownSchedule {
                name: schedule.to_string(),
            })?;
        let mut event = Event::new();
        event.set_action(action);
        event.set_timestamp(timestamp);
        event.set_args(args);
        event.set_schedule(schedule, interval);
        self.insert_unique(event)
    }

    fn insert_unique(&self, mut event: Event) -> Result<i64> {
        let action = event.action().unwrap_or_default().to_string();
        let timestamp = event.timestamp().unwrap_or_default();
        let instance = event.instance();

        if let Some(id) = self.store.find_pending_id(timestamp, &action, &instance)? {
            debug!(event_id = id, %action, "event already scheduled");
            return Ok(id);
        }
        match event.save(&self.store) {
            Ok(()) => event.id().ok_or(EventError::FailedCreate),
            // lost a race with another scheduler
            Err(EventError::FailedCreate) => self
                .store
                .find_pending_id(timestamp, &action, &instance)?
                .ok_or(EventError::FailedCreate),
            Err(e) => Err(e),
        }
    }

    /// Complete the pending occurrence with this fingerprint.
    pub fn unschedule_event(&self, timestamp: i64, action: &str, args: &EventArgs) -> Result<bool> {
        self.store.mark_completed(timestamp, action, &args.instance())
    }

    /// Complete every pending occurrence of `action`, optionally only those
    /// with matching args. Returns how many were completed.
    pub fn clear_scheduled_hook(&self, action: &str, args: Option<&EventArgs>) -> Result<usize> {
        let query = QueryArgs {
            action: Some(action.to_string()),
            args: args.cloned(),
            limit: CLEAR_BATCH_SIZE,
            ..QueryArgs::default()
        };

        let mut cleared = 0;
        loop {
            let rows = self.store.query(&query)?;
            if rows.is_empty() {
                break;
            }
            let mut progressed = false;
            for row in rows {
                if let Some(mut event) = Event::from_row(row) {
                    if event.complete(&self.store).is_ok() {
                        cleared += 1;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        if cleared > 0 {
            info!(%action, count = cleared, "cleared scheduled events");
        }
        Ok(cleared)
    }

    /// Next pending timestamp for this action and args, from the cached rendering.
    pub fn next_scheduled(&self, action: &str, args: &EventArgs) -> Result<Option<i64>> {
        let instance = args.instance();
        Ok(self
            .store
            .pending_events()?
            .into_iter()
            .filter(|row| row.action == action && row.instance == instance)
            .map(|row| row.timestamp)
            .min())
    }

    // --- internal events ---------------------------------------------------

    /// Register an additional internal event. Built-in actions cannot be replaced.
    pub fn add_internal_event(
        &self,
        action: &str,
        schedule: &str,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<()> {
        if self.schedules.interval(schedule).is_none() {
            return Err(EventError::UnknownSchedule {
                name: schedule.to_string(),
            });
        }
        if !self.internal.add(action, schedule) {
            return Err(EventError::InvalidAction);
        }
        self.registry.register_handler(action, handler);
        Ok(())
    }

    /// Schedule every internal event that has no pending occurrence.
    pub fn schedule_internal_events(&self) -> Result<usize> {
        let now = now_ts();
        let mut scheduled = 0;
        for def in self.internal.list() {
            let existing = self.store.query(&QueryArgs {
                action: Some(def.action.clone()),
                status: vec![EventStatus::Pending, EventStatus::Running],
                limit: 1,
                ..QueryArgs::default()
            })?;
            if existing.is_empty() {
                self.schedule_recurring_event(now, &def.schedule, &def.action, EventArgs::default())?;
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            info!(count = scheduled, "internal events scheduled");
        }
        Ok(scheduled)
    }
}

/// Interleave events across actions, taking at most `limit`.
///
/// One event per action per round, so a single flooded action cannot starve
/// the rest of the queue.
fn reduce_queue(rows: Vec<EventRow>, limit: usize) -> Vec<EventRow> {
    let mut order: Vec<String> = Vec::new();
    let mut by_action: HashMap<String, VecDeque<EventRow>> = HashMap::new();
    for row in rows {
        if !by_action.contains_key(&row.action) {
            order.push(row.action.clone());
        }
        by_action.entry(row.action.clone()).or_default().push_back(row);
    }

    let mut queue = Vec::with_capacity(limit);
    while queue.len() < limit {
        let mut took_any = false;
        for action in &order {
            if queue.len() >= limit {
                break;
            }
            if let Some(row) = by_action.get_mut(action).and_then(|q| q.pop_front()) {
                queue.push(row);
                took_any = true;
            }
        }
        if !took_any {
            break;
        }
    }
    queue
}
