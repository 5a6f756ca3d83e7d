//! `cronctl-lock`: named counting semaphores kept in a shared cache.
//!
//! A lock with limit 1 is a plain mutex backed by a counter. Larger limits
//! track one timestamp per claim so abandoned slots age out individually.
//! Each lock also carries a heartbeat refreshed on every free; a heartbeat
//! older than the caller's timeout means the holders died, and the next
//! `check` recovers the lock.

pub mod lock;

pub use lock::{Lock, LockValue};
