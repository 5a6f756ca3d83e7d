use std::sync::Arc;
use std::time::Duration;

use cronctl_core::{now_ts, Cache};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Stored value of a lock.
///
/// Single-slot locks hold a counter; multi-slot locks hold the claim time of
/// every outstanding slot. A counter found on a multi-slot lock is upgraded on
/// first use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LockValue {
    Count(u64),
    Claims(Vec<i64>),
}

impl LockValue {
    /// Number of slots currently held.
    pub fn held(&self) -> usize {
        match self {
            LockValue::Count(n) => *n as usize,
            LockValue::Claims(claims) => claims.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.held() == 0
    }
}

impl Default for LockValue {
    fn default() -> Self {
        LockValue::Count(0)
    }
}

/// Cache-backed semaphore registry. Cheap to clone.
#[derive(Clone)]
pub struct Lock {
    cache: Arc<dyn Cache>,
}

impl Lock {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    /// Try to claim a slot on `name`.
    ///
    /// A heartbeat older than `timeout` empties the lock and grants the caller
    /// without taking a slot, regardless of how many slots it claimed to hold.
    /// The caller's later `free` on the emptied lock only refreshes the heartbeat.
    /// A lock with no heartbeat at all is initialised and claimed normally.
    pub fn check(&self, name: &str, limit: usize, timeout: Duration) -> bool {
        let now = now_ts();
        let timeout_secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);

        let heartbeat = self.heartbeat(name);
        if heartbeat == 0 {
            self.reset(name, None);
        } else if heartbeat < now.saturating_sub(timeout_secs) {
            warn!(lock = %name, heartbeat, "lock heartbeat stale, recovering");
            self.reset(name, None);
            return true;
        }

        self.claim(name, limit.max(1), timeout_secs, now)
    }

    fn claim(&self, name: &str, limit: usize, timeout_secs: i64, now: i64) -> bool {
        if limit == 1 {
            return self.claim_single(name);
        }

        let mut claims = match self.value(name) {
            LockValue::Count(n) => vec![now; n as usize],
            LockValue::Claims(claims) => claims
                .into_iter()
                .filter(|claimed_at| *claimed_at > now.saturating_sub(timeout_secs))
                .collect(),
        };

        if claims.len() >= limit {
            debug!(lock = %name, held = claims.len(), limit, "lock full");
            return false;
        }

        claims.push(now);
        self.store(name, &LockValue::Claims(claims), None);
        true
    }

    fn claim_single(&self, name: &str) -> bool {
        if !self.value(name).is_empty() {
            debug!(lock = %name, "lock held");
            return false;
        }
        // A concurrent claimant may have incremented between the read and here.
        match self.cache.incr(&value_key(name), 1) {
            Some(1) => true,
            Some(_) => {
                self.cache.decr(&value_key(name), 1);
                false
            }
            None => {
                self.store(name, &LockValue::Count(1), None);
                true
            }
        }
    }

    /// Release one slot on `name` and refresh its heartbeat.
    pub fn free(&self, name: &str, expires: Option<Duration>) {
        match self.value(name) {
            LockValue::Count(n) if n > 1 => {
                self.cache.decr(&value_key(name), 1);
            }
            LockValue::Count(_) => self.store(name, &LockValue::Count(0), expires),
            LockValue::Claims(mut claims) => {
                if !claims.is_empty() {
                    claims.sort_unstable();
                    claims.remove(0);
                    self.store(name, &LockValue::Claims(claims), expires);
                }
            }
        }
        self.touch(name, expires);
    }

    /// Initialise value and heartbeat if either is absent.
    pub fn prime(&self, name: &str, expires: Option<Duration>) {
        self.cache.add(&value_key(name), Value::from(0u64), expires);
        self.cache
            .add(&heartbeat_key(name), Value::from(now_ts()), expires);
    }

    /// Empty the lock and refresh its heartbeat.
    pub fn reset(&self, name: &str, expires: Option<Duration>) {
        self.store(name, &LockValue::Count(0), expires);
        self.touch(name, expires);
    }

    /// Current value. A missing or unreadable entry resets the lock.
    pub fn value(&self, name: &str) -> LockValue {
        let stored = self
            .cache
            .get(&value_key(name))
            .and_then(|v| serde_json::from_value::<LockValue>(v).ok());
        match stored {
            Some(value) => value,
            None => {
                self.reset(name, None);
                LockValue::default()
            }
        }
    }

    /// Unix time of the last free or reset; `0` if never set.
    pub fn heartbeat(&self, name: &str) -> i64 {
        self.cache
            .get(&heartbeat_key(name))
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    fn store(&self, name: &str, value: &LockValue, expires: Option<Duration>) {
        match serde_json::to_value(value) {
            Ok(v) => self.cache.set(&value_key(name), v, expires),
            Err(e) => warn!(lock = %name, "failed to encode lock value: {e}"),
        }
    }

    fn touch(&self, name: &str, expires: Option<Duration>) {
        self.cache
            .set(&heartbeat_key(name), Value::from(now_ts()), expires);
    }
}

fn value_key(name: &str) -> String {
    format!("cronctl_lock_{name}")
}

fn heartbeat_key(name: &str) -> String {
    format!("cronctl_lock_ts_{name}")
}
