//! In-process LISTEN/NOTIFY hub.
//!
//! Behaves like a Postgres server seen through one connection per dispatcher:
//! a notification goes to every connection listening on the channel,
//! including the sender's own, and payloads over the limit are rejected.

use super::{check_payload, Connector, Notification, Transport, Wakeup};
use crate::config::DEFAULT_NOTIFY_PAYLOAD_LIMIT;
use crate::error::{PubSubError, Result};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct ConnectionState {
    channels: HashSet<String>,
    inbox: Sender<Notification>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<u64, ConnectionState>,
    refuse_connections: bool,
}

struct Shared {
    state: Mutex<HubState>,
    next_id: AtomicU64,
    payload_limit: usize,
}

/// In-process notification server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LoopbackHub {
    shared: Arc<Shared>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::with_payload_limit(DEFAULT_NOTIFY_PAYLOAD_LIMIT)
    }

    pub fn with_payload_limit(payload_limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(HubState::default()),
                next_id: AtomicU64::new(1),
                payload_limit,
            }),
        }
    }

    /// Sever every open connection, as a server restart would.
    pub fn drop_connections(&self) {
        let dropped = std::mem::take(&mut self.shared.state.lock().connections);
        tracing::debug!(count = dropped.len(), "loopback hub dropped connections");
    }

    /// Make subsequent connect attempts fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.state.lock().refuse_connections = refuse;
    }

    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    /// Connections currently listening on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.shared
            .state
            .lock()
            .connections
            .values()
            .filter(|c| c.channels.contains(channel))
            .count()
    }

    /// Send a notification from outside any dispatcher, like another process
    /// issuing NOTIFY on the same server.
    pub fn notify_external(&self, channel: &str, payload: &str) -> Result<()> {
        self.deliver(channel, payload)
    }

    fn deliver(&self, channel: &str, payload: &str) -> Result<()> {
        check_payload(payload, self.shared.payload_limit)?;

        let state = self.shared.state.lock();
        for conn in state.connections.values() {
            if conn.channels.contains(channel) {
                let _ = conn.inbox.send(Notification {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for LoopbackHub {
    fn connect(&self) -> Result<Box<dyn Transport>> {
        let mut state = self.shared.state.lock();
        if state.refuse_connections {
            return Err(PubSubError::Connection(
                "loopback hub refused connection".to_string(),
            ));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = unbounded();
        state.connections.insert(
            id,
            ConnectionState {
                channels: HashSet::new(),
                inbox: tx,
            },
        );

        Ok(Box::new(LoopbackConnection {
            id,
            hub: self.clone(),
            inbox: rx,
        }))
    }
}

/// One connection to a [`LoopbackHub`].
pub struct LoopbackConnection {
    id: u64,
    hub: LoopbackHub,
    inbox: Receiver<Notification>,
}

impl LoopbackConnection {
    fn with_state<T>(&self, f: impl FnOnce(&mut ConnectionState) -> T) -> Result<T> {
        let mut state = self.hub.shared.state.lock();
        match state.connections.get_mut(&self.id) {
            Some(conn) => Ok(f(conn)),
            None => Err(closed()),
        }
    }
}

fn closed() -> PubSubError {
    PubSubError::Connection("loopback connection closed".to_string())
}

impl Transport for LoopbackConnection {
    fn listen(&mut self, channel: &str) -> Result<()> {
        self.with_state(|conn| {
            conn.channels.insert(channel.to_string());
        })
    }

    fn unlisten(&mut self, channel: &str) -> Result<()> {
        self.with_state(|conn| {
            conn.channels.remove(channel);
        })
    }

    fn notify(&mut self, channel: &str, payload: &str) -> Result<()> {
        self.with_state(|_| ())?;
        self.hub.deliver(channel, payload)
    }

    fn wait(&mut self, wakeup: &Wakeup, timeout: Duration) -> Result<Vec<Notification>> {
        let ready: Vec<Notification> = self.inbox.try_iter().collect();
        if !ready.is_empty() {
            return Ok(ready);
        }

        select! {
            recv(self.inbox) -> msg => match msg {
                Ok(first) => {
                    let mut batch = vec![first];
                    batch.extend(self.inbox.try_iter());
                    Ok(batch)
                }
                Err(_) => Err(closed()),
            },
            recv(wakeup.receiver()) -> _ => Ok(Vec::new()),
            default(timeout) => Ok(Vec::new()),
        }
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.hub.shared.state.lock().connections.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_notify_reaches_listeners_only() {
        let hub = LoopbackHub::new();
        let wakeup = Wakeup::new();
        let mut a = hub.connect().unwrap();
        let mut b = hub.connect().unwrap();

        a.listen("stream:x").unwrap();
        b.notify("stream:x", "hello").unwrap();
        b.notify("stream:y", "ignored").unwrap();

        let got = a.wait(&wakeup, SHORT).unwrap();
        assert_eq!(
            got,
            vec![Notification {
                channel: "stream:x".to_string(),
                payload: "hello".to_string()
            }]
        );
        assert!(b.wait(&wakeup, SHORT).unwrap().is_empty());
    }

    #[test]
    fn test_sender_receives_own_notification() {
        let hub = LoopbackHub::new();
        let wakeup = Wakeup::new();
        let mut conn = hub.connect().unwrap();

        conn.listen("stream:x").unwrap();
        conn.notify("stream:x", "self").unwrap();
        assert_eq!(conn.wait(&wakeup, SHORT).unwrap().len(), 1);

        conn.unlisten("stream:x").unwrap();
        conn.notify("stream:x", "gone").unwrap();
        assert!(conn.wait(&wakeup, SHORT).unwrap().is_empty());
    }

    #[test]
    fn test_payload_limit() {
        let hub = LoopbackHub::with_payload_limit(8);
        let mut conn = hub.connect().unwrap();

        assert!(conn.notify("stream:x", "12345678").is_ok());
        let err = conn.notify("stream:x", "123456789").unwrap_err();
        assert!(matches!(err, PubSubError::PayloadTooLarge { size: 9, limit: 8 }));
    }

    #[test]
    fn test_wakeup_interrupts_wait() {
        let hub = LoopbackHub::new();
        let wakeup = Wakeup::new();
        let mut conn = hub.connect().unwrap();

        wakeup.signal();
        let start = std::time::Instant::now();
        assert!(conn.wait(&wakeup, Duration::from_secs(5)).unwrap().is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_dropped_connection_errors() {
        let hub = LoopbackHub::new();
        let wakeup = Wakeup::new();
        let mut conn = hub.connect().unwrap();

        hub.drop_connections();
        assert!(conn.listen("stream:x").unwrap_err().is_connection_error());
        assert!(conn.wait(&wakeup, SHORT).unwrap_err().is_connection_error());
    }

    #[test]
    fn test_refused_connection() {
        let hub = LoopbackHub::new();
        hub.refuse_connections(true);
        assert!(hub.connect().is_err());

        hub.refuse_connections(false);
        let _conn = hub.connect().unwrap();
        assert_eq!(hub.connection_count(), 1);
    }
}
