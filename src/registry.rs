//! In-process subscriber registry.
//!
//! Maps transport channel names to the callbacks registered for them. The
//! registry reports the 0→1 and 1→0 transitions per channel so the dispatcher
//! knows when to LISTEN and UNLISTEN upstream.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A subscriber callback. Receives the raw notification payload.
///
/// Callbacks run on the dispatcher thread and must return quickly; hand
/// heavy work off to another thread.
pub type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Opaque identifier for one registered callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle returned by subscribe; consumed by unsubscribe.
#[derive(Debug, PartialEq, Eq)]
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) channel: String,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Thread-safe channel → callbacks map.
pub struct SubscriberRegistry {
    channels: Mutex<HashMap<String, Vec<(SubscriptionId, Callback)>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback. The flag is true iff it is the first callback for
    /// `channel`.
    pub fn add(&self, channel: &str, callback: Callback) -> (SubscriptionId, bool) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let mut channels = self.channels.lock();
        let callbacks = channels.entry(channel.to_string()).or_default();
        let first = callbacks.is_empty();
        callbacks.push((id, callback));

        (id, first)
    }

    /// Remove a callback. Returns true iff the channel is left with no
    /// callbacks; false if others remain or `id` was not registered.
    pub fn remove(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut channels = self.channels.lock();
        let Some(callbacks) = channels.get_mut(channel) else {
            return false;
        };

        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        if callbacks.len() == before {
            return false;
        }

        if callbacks.is_empty() {
            channels.remove(channel);
            true
        } else {
            false
        }
    }

    /// Invoke every callback registered for `channel` and return how many ran
    /// without panicking.
    ///
    /// The callback list is copied under the lock and invoked after releasing
    /// it, so callbacks may subscribe or unsubscribe freely.
    pub fn dispatch(&self, channel: &str, payload: &str) -> usize {
        let snapshot: Vec<Callback> = match self.channels.lock().get(channel) {
            Some(callbacks) => callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for callback in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    tracing::error!(channel, %reason, "subscriber callback panicked");
                }
            }
        }
        delivered
    }

    /// Channels with at least one callback.
    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
