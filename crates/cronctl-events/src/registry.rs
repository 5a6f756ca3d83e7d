use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::types::EventArgs;

/// Failure reported by an action handler.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Work performed when an event of a given action comes due.
///
/// Handlers run on the runner's blocking pool and may take as long as they
/// need; the registry imposes no timeout.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, args: &EventArgs) -> Result<(), HandlerError>;
}

impl<F> ActionHandler for F
where
    F: Fn(&EventArgs) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, args: &EventArgs) -> Result<(), HandlerError> {
        self(args)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for {0}")]
    UnknownAction(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Action name → handler mapping consulted by [`Event::run`](crate::Event::run).
///
/// Share one instance per process via `Arc<ActionRegistry>`.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a closure to `action`, replacing any previous binding.
    pub fn register<F>(&self, action: &str, handler: F)
    where
        F: Fn(&EventArgs) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register_handler(action, Arc::new(handler));
    }

    pub fn register_handler(&self, action: &str, handler: Arc<dyn ActionHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(action.to_string(), handler).is_some() {
            debug!(action, "action handler replaced");
        } else {
            debug!(action, "action handler registered");
        }
    }

    /// Silent no-op if nothing is bound.
    pub fn unregister(&self, action: &str) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.remove(action).is_some() {
            debug!(action, "action handler unregistered");
        }
    }

    pub fn contains(&self, action: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.contains_key(action)
    }

    pub fn dispatch(&self, action: &str, args: &EventArgs) -> Result<(), DispatchError> {
        // Clone out of the lock so long handlers don't block registration.
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            handlers.get(action).cloned()
        };
        match handler {
            Some(h) => Ok(h.handle(args)?),
            None => Err(DispatchError::UnknownAction(action.to_string())),
        }
    }
}
