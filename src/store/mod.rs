//! Retention store: durable streams and their messages.
//!
//! The store is the authoritative copy of every published message. The live
//! notification path is best-effort; consumers that missed notifications
//! replay from here with [`RetentionStore::replay_after`].

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::{Appended, Message, MessageId, Stream, TrimStats};

/// Persistent storage for streams and messages.
///
/// Implementations must be safe to call from any thread.
pub trait RetentionStore: Send + Sync {
    /// Append a message, creating the stream on first use.
    ///
    /// The stream's sequence is incremented and the message inserted in one
    /// atomic step, so concurrent appends to the same stream never share a
    /// sequence.
    fn append(&self, stream: &str, data: &str) -> Result<Appended>;

    /// Messages of the given streams with an ID strictly greater than `since`,
    /// in ID order.
    fn replay_after(&self, streams: &[&str], since: MessageId) -> Result<Vec<Message>>;

    /// Delete all but the newest `keep` messages of a stream. The stream is
    /// removed once no messages remain.
    fn trim(&self, stream: &str, keep: u64) -> Result<TrimStats>;

    /// Fetch a single message by ID.
    fn message(&self, id: MessageId) -> Result<Option<Message>>;

    /// Look up a stream by name.
    fn stream(&self, name: &str) -> Result<Option<Stream>>;
}
