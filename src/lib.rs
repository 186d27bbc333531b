//! # Durable Pub/Sub
//!
//! Ordered, replayable publish/subscribe over a database's LISTEN/NOTIFY.
//!
//! ## Core Concepts
//!
//! - **Streams**: named, append-only message logs with a per-stream sequence
//! - **Messages**: persisted before anyone is notified; global IDs order them
//! - **Dispatcher**: one thread owning the one LISTEN/NOTIFY connection
//! - **Subscriptions**: in-process callbacks keyed by channel name
//! - **Retention**: streams are trimmed to their newest N messages
//!
//! Live delivery is best-effort. A consumer that reconnects replays from the
//! last message ID it saw, and deduplicates by ID.
//!
//! ## Example
//!
//! ```ignore
//! use durable_pubsub::{MessageId, PubSub, PubSubConfig, Event};
//!
//! let pubsub = PubSub::open(PubSubConfig::default())?;
//!
//! let sub = pubsub.subscribe_stream("dashboard", |event: Event| {
//!     println!("#{} {:?}", event.sequence.0, event.data);
//! })?;
//!
//! let message = pubsub.publish("dashboard", "hello")?;
//! assert_eq!(message.sequence.0, 1);
//!
//! // Catch up after a disconnect.
//! let missed = pubsub.replay_after(&["dashboard"], MessageId(0))?;
//!
//! pubsub.unsubscribe(sub);
//! ```

pub mod cleanup;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pubsub;
pub mod queue;
pub mod registry;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports
pub use cleanup::Cleaner;
pub use config::{PubSubConfig, RetentionPolicy, TransportConfig, DEFAULT_NOTIFY_PAYLOAD_LIMIT};
pub use dispatcher::{backoff_delay, Dispatcher, DispatcherConfig, DispatcherState};
pub use error::{PubSubError, Result};
pub use pubsub::PubSub;
pub use queue::EphemeralQueue;
pub use registry::{Callback, SubscriberRegistry, Subscription, SubscriptionId};
pub use store::{RetentionStore, SqliteStore};
#[cfg(feature = "postgres")]
pub use transport::{PgConnector, PgTransport};
pub use transport::{Connector, LoopbackConnection, LoopbackHub, Notification, Transport, Wakeup};
pub use types::*;
