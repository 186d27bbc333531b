//! The pub/sub engine: durable publish, live subscribe, replay.

use crate::cleanup::Cleaner;
use crate::config::{PubSubConfig, TransportConfig};
use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherState};
use crate::error::{PubSubError, Result};
use crate::queue::EphemeralQueue;
use crate::registry::{SubscriberRegistry, Subscription};
use crate::store::{RetentionStore, SqliteStore};
use crate::transport::{Connector, LoopbackHub};
use crate::types::{channel_name, Event, Message, MessageId, Stream, TrimStats};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Publish locks; a stream always maps to the same one.
const PUBLISH_LOCK_STRIPES: usize = 64;

/// Durable pub/sub engine.
///
/// Publishing appends to the [`RetentionStore`] first and only then queues a
/// live notification, so every message a subscriber is told about can be
/// fetched again by ID, and a publish that fails sends nothing.
///
/// Append and notification enqueue for one stream happen under the same
/// publish lock, so concurrent publishers cannot enqueue a stream's events
/// out of sequence order.
pub struct PubSub {
    config: PubSubConfig,
    store: Arc<dyn RetentionStore>,
    dispatcher: Arc<Dispatcher>,
    cleaner: Cleaner,
    publish_locks: Box<[Mutex<()>]>,
}

impl PubSub {
    /// Open the engine described by `config`: SQLite storage plus the
    /// configured transport.
    pub fn open(config: PubSubConfig) -> Result<Self> {
        let store: Arc<dyn RetentionStore> = match &config.database_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(SqliteStore::open_in_memory()?),
        };
        let connector = connector_for(&config)?;
        Self::with_parts(config, store, connector)
    }

    /// Build the engine from an explicit store and connector.
    pub fn with_parts(
        config: PubSubConfig,
        store: Arc<dyn RetentionStore>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(
            connector,
            Arc::new(SubscriberRegistry::new()),
            DispatcherConfig::from(&config),
        ));
        let cleaner = Cleaner::new(Arc::clone(&store), config.retention)?;

        Ok(Self {
            config,
            store,
            dispatcher,
            cleaner,
            publish_locks: (0..PUBLISH_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Transport channel carrying `stream`'s notifications.
    pub fn channel_name(&self, stream: &str) -> String {
        channel_name(stream)
    }

    // --- Publishing ---

    /// Persist `data` on `stream` and notify its subscribers.
    ///
    /// Returns once the message is stored; the notification is queued and
    /// delivered best-effort. Envelopes over the payload limit go out without
    /// `data`, and subscribers fetch the message by ID.
    pub fn publish(&self, stream: &str, data: &str) -> Result<Message> {
        let ordered = self.publish_lock(stream).lock();
        let appended = self.store.append(stream, data)?;
        let message = appended.message;

        let event = Event::from_message(&message);
        let stripped = event.without_data().to_json()?;
        let full = event.to_json()?;

        let (payload, fallback) = if full.len() > self.config.notify_payload_limit {
            tracing::debug!(
                stream,
                id = %message.id,
                size = full.len(),
                limit = self.config.notify_payload_limit,
                "event too large for notification, sending id only"
            );
            (stripped, None)
        } else {
            (full, Some(stripped))
        };

        if let Err(e) = self
            .dispatcher
            .notify(&channel_name(stream), payload, fallback)
        {
            // Stored is published; subscribers catch up by replay.
            tracing::warn!(stream, id = %message.id, error = %e, "could not queue notification");
        }
        drop(ordered);

        if self.cleaner.over_threshold(appended.stream_messages) {
            self.cleaner.schedule(stream);
        }

        Ok(message)
    }

    fn publish_lock(&self, stream: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        stream.hash(&mut hasher);
        &self.publish_locks[hasher.finish() as usize % self.publish_locks.len()]
    }

    /// Send a raw notification on `channel` without persisting anything.
    pub fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let limit = self.config.notify_payload_limit;
        if payload.len() > limit {
            return Err(PubSubError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }
        self.dispatcher.notify(channel, payload.to_string(), None)
    }

    // --- Subscribing ---

    /// Call `callback` with every payload received on `channel`.
    ///
    /// Callbacks run on the dispatcher thread; keep them short.
    pub fn subscribe<F>(&self, channel: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if channel.is_empty() {
            return Err(PubSubError::InvalidChannel(channel.to_string()));
        }
        self.dispatcher.subscribe(channel, Arc::new(callback))
    }

    /// Subscribe to a stream's channel and receive decoded events.
    pub fn subscribe_stream<F>(&self, stream: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let stream_name = stream.to_string();
        self.subscribe(&channel_name(stream), move |payload| {
            match Event::parse(payload) {
                Ok(event) => callback(event),
                Err(e) => {
                    tracing::warn!(stream = %stream_name, error = %e, "undecodable event");
                }
            }
        })
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.dispatcher.unsubscribe(subscription);
    }

    /// Open an ephemeral push/pop queue on `channel`.
    pub fn queue(&self, channel: &str) -> Result<EphemeralQueue> {
        if channel.is_empty() {
            return Err(PubSubError::InvalidChannel(channel.to_string()));
        }
        EphemeralQueue::open(
            Arc::clone(&self.dispatcher),
            channel,
            self.config.notify_payload_limit,
        )
    }

    // --- Replay & lookup ---

    /// Stored messages of `streams` published after `since`, in ID order.
    pub fn replay_after(&self, streams: &[&str], since: MessageId) -> Result<Vec<Message>> {
        self.store.replay_after(streams, since)
    }

    /// The payload of an event, fetched from storage if it was stripped.
    pub fn resolve(&self, event: &Event) -> Result<String> {
        if let Some(data) = &event.data {
            return Ok(data.clone());
        }
        self.store
            .message(event.id)?
            .map(|m| m.data)
            .ok_or(PubSubError::MessageNotFound(event.id))
    }

    pub fn message(&self, id: MessageId) -> Result<Option<Message>> {
        self.store.message(id)
    }

    pub fn stream(&self, name: &str) -> Result<Option<Stream>> {
        self.store.stream(name)
    }

    // --- Retention ---

    /// Trim `stream` to the retention threshold now.
    pub fn cleanup(&self, stream: &str) -> Result<TrimStats> {
        self.cleaner.cleanup(stream)
    }

    // --- Lifecycle ---

    pub fn dispatcher_state(&self) -> DispatcherState {
        self.dispatcher.state()
    }

    /// Commands queued for the dispatcher.
    pub fn queue_depth(&self) -> usize {
        self.dispatcher.queue_depth()
    }

    /// Bring the dispatcher back after a shutdown or a failed reconnect.
    ///
    /// Background cleanup is started again too.
    pub fn restart(&self) -> Result<()> {
        self.cleaner.start()?;
        self.dispatcher.restart()
    }

    /// Stop the dispatcher and the cleanup thread.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        self.cleaner.shutdown();
    }
}

impl Drop for PubSub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn connector_for(config: &PubSubConfig) -> Result<Arc<dyn Connector>> {
    match &config.transport {
        TransportConfig::Loopback => Ok(Arc::new(LoopbackHub::with_payload_limit(
            config.notify_payload_limit,
        ))),
        #[cfg(feature = "postgres")]
        TransportConfig::Postgres { url } => {
            Ok(Arc::new(crate::transport::PgConnector::new(
                url.clone(),
                config.notify_payload_limit,
            )))
        }
        #[cfg(not(feature = "postgres"))]
        TransportConfig::Postgres { .. } => Err(PubSubError::Config(
            "postgres transport requires the `postgres` feature".to_string(),
        )),
    }
}
