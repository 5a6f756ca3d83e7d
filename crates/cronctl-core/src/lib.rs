//! Shared plumbing for the cronctl workspace: configuration, the cache
//! abstraction used by locks and query snapshots, and common errors.

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{Cache, MemoryCache};
pub use config::CronControlConfig;
pub use error::{CoreError, Result};

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
