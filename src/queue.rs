//! Ephemeral queue over a channel.
//!
//! Push sends a plain notification (nothing is persisted); pop blocks the
//! calling thread on a private buffer fed by a registry callback, so a
//! waiting consumer never holds up the dispatcher.

use crate::dispatcher::Dispatcher;
use crate::error::{PubSubError, Result};
use crate::registry::Subscription;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Transient push/pop queue bound to one channel.
pub struct EphemeralQueue {
    channel: String,
    dispatcher: Arc<Dispatcher>,
    payload_limit: usize,
    subscription: Mutex<Option<Subscription>>,
    receiver: Receiver<String>,
}

impl EphemeralQueue {
    pub(crate) fn open(
        dispatcher: Arc<Dispatcher>,
        channel: &str,
        payload_limit: usize,
    ) -> Result<Self> {
        let (tx, receiver) = unbounded();
        let subscription = dispatcher.subscribe(
            channel,
            Arc::new(move |payload: &str| {
                let _ = tx.send(payload.to_string());
            }),
        )?;

        Ok(Self {
            channel: channel.to_string(),
            dispatcher,
            payload_limit,
            subscription: Mutex::new(Some(subscription)),
            receiver,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Notify every listener of the channel, this queue included.
    pub fn push(&self, message: &str) -> Result<()> {
        if self.is_closed() {
            return Err(PubSubError::QueueClosed);
        }
        if message.len() > self.payload_limit {
            return Err(PubSubError::PayloadTooLarge {
                size: message.len(),
                limit: self.payload_limit,
            });
        }
        self.dispatcher
            .notify(&self.channel, message.to_string(), None)
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Fails with [`PubSubError::QueueTimeout`] when nothing arrives in time
    /// and [`PubSubError::QueueClosed`] once the queue is closed and drained.
    pub fn pop(&self, timeout: Duration) -> Result<String> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) => Err(PubSubError::QueueTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(PubSubError::QueueClosed),
        }
    }

    /// Take a message if one is already buffered.
    pub fn try_pop(&self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Unsubscribe. Messages already buffered can still be popped; after that
    /// pop reports [`PubSubError::QueueClosed`], including a pop already
    /// waiting on another thread.
    pub fn close(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            self.dispatcher.unsubscribe(subscription);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.lock().is_none()
    }
}

impl Drop for EphemeralQueue {
    fn drop(&mut self) {
        self.close();
    }
}
