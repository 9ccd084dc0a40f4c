//! Change subscriptions.
//!
//! Callbacks fire once per completed top-level unit of work, in
//! registration order, after the commit. They run on a snapshot of the
//! registry with no connection lock held, so a callback may subscribe,
//! unsubscribe or start another unit of work.

use std::error::Error;
use std::sync::Arc;

use tracing::{debug, warn};

/// What a subscriber callback returns. An error is logged and skipped.
pub type CallbackResult = Result<(), Box<dyn Error + Send + Sync>>;

pub(crate) type Callback = Arc<dyn Fn() -> CallbackResult + Send + Sync>;

#[derive(Default)]
pub(crate) struct Subscribers {
    entries: Vec<(String, Callback)>,
}

impl Subscribers {
    /// Register `id`. An existing id keeps its position and gets the new callback.
    pub(crate) fn insert(&mut self, id: String, callback: Callback) {
        match self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            Some(entry) => entry.1 = callback,
            None => self.entries.push((id, callback)),
        }
    }

    pub(crate) fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| existing != id);
        self.entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<(String, Callback)> {
        self.entries.clone()
    }
}

/// Run every callback; failures do not stop the rest.
pub(crate) fn dispatch(subscribers: &[(String, Callback)]) {
    for (id, callback) in subscribers {
        match callback() {
            Ok(()) => debug!(subscriber = %id, "notified subscriber"),
            Err(e) => warn!(subscriber = %id, error = %e, "subscriber callback failed"),
        }
    }
}
