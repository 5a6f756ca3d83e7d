//! `cronctl-events`: durable cron events on SQLite.
//!
//! # Overview
//!
//! Every scheduled occurrence is one row in `cron_control_events`, unique on
//! `(timestamp, action, instance)` where `instance` fingerprints the args.
//! [`Events`] hands out due batches and runs events by fingerprint;
//! [`Event::run_if_allowed`] is the guarded path that claims a row with a
//! conditional `pending → running` update before invoking the handler
//! registered in the [`ActionRegistry`].
//!
//! # Event states
//!
//! | Status     | Meaning                                                  |
//! |------------|----------------------------------------------------------|
//! | `pending`  | Waiting for its timestamp; the only runnable state       |
//! | `running`  | Claimed by exactly one runner                            |
//! | `complete` | Terminal; instance scrambled, purged by a maintenance job |

pub mod db;
pub mod error;
pub mod event;
pub mod events;
pub mod internal;
pub mod registry;
pub mod runner;
pub mod schedules;
pub mod store;
pub mod types;

pub use error::{EventError, Result};
pub use event::{calculate_next_timestamp, Event};
pub use events::{DueEvent, EventListing, Events, LockStatus, RunState};
pub use internal::{InternalEvent, InternalEvents};
pub use registry::{ActionHandler, ActionRegistry, HandlerError};
pub use runner::{BatchReport, Runner};
pub use schedules::Schedules;
pub use store::EventsStore;
pub use types::{EventArgs, EventRow, EventStatus, QueryArgs, TimestampFilter};
