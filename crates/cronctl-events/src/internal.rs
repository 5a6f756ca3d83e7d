use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::event::Event;
use crate::registry::{ActionRegistry, HandlerError};
use crate::schedules::{Schedules, DAILY, HOURLY, INTERNAL_TEN_MINUTES};
use crate::store::EventsStore;
use crate::types::{EventStatus, QueryArgs};

pub const PURGE_COMPLETED_EVENTS: &str = "cron_control_purge_completed_events";
pub const PRUNE_DUPLICATE_EVENTS: &str = "cron_control_prune_duplicate_events";
pub const REALIGN_INTERNAL_EVENTS: &str = "cron_control_realign_internal_events";

const BUILTIN: [(&str, &str); 3] = [
    (PURGE_COMPLETED_EVENTS, HOURLY),
    (PRUNE_DUPLICATE_EVENTS, INTERNAL_TEN_MINUTES),
    (REALIGN_INTERNAL_EVENTS, DAILY),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InternalEvent {
    pub action: String,
    pub schedule: String,
}

/// Maintenance events that bypass the site-wide concurrency ceiling.
pub struct InternalEvents {
    events: RwLock<Vec<InternalEvent>>,
}

impl InternalEvents {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(
                BUILTIN
                    .iter()
                    .map(|(action, schedule)| InternalEvent {
                        action: action.to_string(),
                        schedule: schedule.to_string(),
                    })
                    .collect(),
            ),
        }
    }

    pub fn contains(&self, action: &str) -> bool {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.iter().any(|e| e.action == action)
    }

    pub fn list(&self) -> Vec<InternalEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.clone()
    }

    /// Returns false if `action` is empty or already internal.
    pub(crate) fn add(&self, action: &str, schedule: &str) -> bool {
        if action.is_empty() {
            return false;
        }
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if events.iter().any(|e| e.action == action) {
            return false;
        }
        events.push(InternalEvent {
            action: action.to_string(),
            schedule: schedule.to_string(),
        });
        debug!(action, schedule, "internal event added");
        true
    }
}

impl Default for InternalEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind the built-in maintenance handlers.
pub(crate) fn register_handlers(
    registry: &ActionRegistry,
    store: &Arc<EventsStore>,
    schedules: &Arc<Schedules>,
    internal: &Arc<InternalEvents>,
) {
    let s = store.clone();
    registry.register(PURGE_COMPLETED_EVENTS, move |_| {
        s.purge_completed().map(|_| ()).map_err(handler_error)
    });

    let s = store.clone();
    registry.register(PRUNE_DUPLICATE_EVENTS, move |_| {
        prune_duplicate_events(&s).map(|_| ()).map_err(handler_error)
    });

    let (s, sched, int) = (store.clone(), schedules.clone(), internal.clone());
    registry.register(REALIGN_INTERNAL_EVENTS, move |_| {
        realign_internal_events(&s, &sched, &int)
            .map(|_| ())
            .map_err(handler_error)
    });
}

fn handler_error(e: crate::error::EventError) -> HandlerError {
    HandlerError(format!("{}: {e}", e.code()))
}

/// Complete all but the earliest pending occurrence of each recurring
/// `(action, instance)` pair. Returns how many were completed.
pub fn prune_duplicate_events(store: &EventsStore) -> Result<usize> {
    let mut pruned = 0;
    for (action, instance) in store.duplicate_recurring()? {
        let rows = store.query(&QueryArgs {
            action: Some(action.clone()),
            instance: Some(instance),
            limit: 0,
            ..QueryArgs::default()
        })?;
        let extras = rows
            .into_iter()
            .filter(|row| row.schedule.is_some() && row.interval > 0)
            .skip(1);
        for row in extras {
            let id = row.id;
            if let Some(mut event) = Event::from_row(row) {
                match event.complete(store) {
                    Ok(()) => pruned += 1,
                    Err(e) => debug!(event_id = id, code = e.code(), "could not prune duplicate"),
                }
            }
        }
    }
    if pruned > 0 {
        info!(count = pruned, "pruned duplicate recurring events");
    }
    Ok(pruned)
}

/// Bring pending internal events back onto their expected schedule.
/// Returns how many rows were changed.
pub fn realign_internal_events(
    store: &EventsStore,
    schedules: &Schedules,
    internal: &InternalEvents,
) -> Result<usize> {
    let mut realigned = 0;
    for def in internal.list() {
        let Some(expected) = schedules.interval(&def.schedule) else {
            debug!(action = %def.action, schedule = %def.schedule, "internal schedule not registered");
            continue;
        };
        let rows = store.query(&QueryArgs {
            action: Some(def.action.clone()),
            status: vec![EventStatus::Pending],
            limit: 0,
            ..QueryArgs::default()
        })?;
        for row in rows {
            if row.schedule.as_deref() == Some(def.schedule.as_str()) && row.interval == expected {
                continue;
            }
            if let Some(mut event) = Event::from_row(row) {
                event.set_schedule(&def.schedule, expected);
                event.save(store)?;
                realigned += 1;
            }
        }
    }
    if realigned > 0 {
        info!(count = realigned, "realigned internal events");
    }
    Ok(realigned)
}
