//! Notification transport: the single LISTEN/NOTIFY connection.
//!
//! A [`Connector`] opens connections; a [`Transport`] is one open connection.
//! The dispatcher is the only owner of a `Transport` and the only thread that
//! ever calls it, because LISTEN state is scoped to the connection.
//!
//! Two implementations ship with the crate:
//! - [`LoopbackHub`]: in-process hub for single-node use and tests
//! - `PgConnector` (feature `postgres`): Postgres via `sqlx::PgListener`

mod loopback;
#[cfg(feature = "postgres")]
mod postgres;

pub use loopback::{LoopbackConnection, LoopbackHub};
#[cfg(feature = "postgres")]
pub use postgres::{PgConnector, PgTransport};

use crate::error::{PubSubError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::time::Duration;

/// A notification received on a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Opens transport connections. Called again on every reconnect.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// One open LISTEN/NOTIFY connection.
///
/// Any [`PubSubError::Connection`](crate::PubSubError::Connection) returned
/// from these methods tells the dispatcher to drop the connection and
/// reconnect.
pub trait Transport: Send {
    fn listen(&mut self, channel: &str) -> Result<()>;

    fn unlisten(&mut self, channel: &str) -> Result<()>;

    /// Send a notification. Oversized payloads fail with
    /// [`PubSubError::PayloadTooLarge`](crate::PubSubError::PayloadTooLarge).
    fn notify(&mut self, channel: &str, payload: &str) -> Result<()>;

    /// Block until a notification arrives, `wakeup` is signalled, or `timeout`
    /// passes. Returns whatever notifications are ready (possibly none).
    fn wait(&mut self, wakeup: &Wakeup, timeout: Duration) -> Result<Vec<Notification>>;
}

/// Reject payloads longer than `limit` bytes, as the server would.
pub(crate) fn check_payload(payload: &str, limit: usize) -> Result<()> {
    if payload.len() > limit {
        return Err(PubSubError::PayloadTooLarge {
            size: payload.len(),
            limit,
        });
    }
    Ok(())
}

/// Wakeup signal written whenever a command is queued, so a blocked
/// [`Transport::wait`] returns and the dispatcher drains its queue.
///
/// Signalling never blocks: the signal holds at most one pending token.
pub struct Wakeup {
    tx: Sender<()>,
    rx: Receiver<()>,
    #[cfg(feature = "postgres")]
    notify: tokio::sync::Notify,
}

impl Wakeup {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            tx,
            rx,
            #[cfg(feature = "postgres")]
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Wake the dispatcher.
    pub fn signal(&self) {
        let _ = self.tx.try_send(());
        #[cfg(feature = "postgres")]
        self.notify.notify_one();
    }

    /// Receiver side for blocking transports; selectable with other channels.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Future side for async transports.
    #[cfg(feature = "postgres")]
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

impl Default for Wakeup {
    fn default() -> Self {
        Self::new()
    }
}
