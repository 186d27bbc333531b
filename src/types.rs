//! Core types for the pub/sub engine.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Prefix prepended to a stream name to form its transport channel.
pub const CHANNEL_PREFIX: &str = "stream:";

/// Prefix of channels derived from a digest of an over-long stream name.
/// Differs from [`CHANNEL_PREFIX`] so a digest never collides with a stream
/// literally named after it.
pub const HASHED_CHANNEL_PREFIX: &str = "stream#";

/// Longest channel name Postgres accepts as an identifier.
pub const MAX_CHANNEL_NAME_LEN: usize = 63;

/// Derive the transport channel name for a stream.
///
/// Names that would exceed [`MAX_CHANNEL_NAME_LEN`] are replaced by
/// [`HASHED_CHANNEL_PREFIX`] and a truncated SHA-256 digest of the stream
/// name, so the mapping stays deterministic without being silently truncated
/// by the server.
pub fn channel_name(stream: &str) -> String {
    if CHANNEL_PREFIX.len() + stream.len() <= MAX_CHANNEL_NAME_LEN {
        return format!("{CHANNEL_PREFIX}{stream}");
    }

    let digest = hex::encode(Sha256::digest(stream.as_bytes()));
    let room = MAX_CHANNEL_NAME_LEN - HASHED_CHANNEL_PREFIX.len();
    format!("{HASHED_CHANNEL_PREFIX}{}", &digest[..room])
}

/// Globally unique, monotonically assigned message identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct MessageId(pub u64);

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a stream row.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

/// Position of a message within its stream. The first message is 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A named stream of retained messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stream {
    pub id: StreamId,
    pub name: String,
    /// Sequence assigned to the most recent message (0 before the first).
    pub sequence: Sequence,
    /// Number of messages currently retained.
    pub message_count: u64,
}

/// A persisted message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub stream_id: StreamId,
    pub stream: String,
    pub sequence: Sequence,
    pub data: String,
    pub created_at: Timestamp,
}

/// Result of appending a message.
#[derive(Clone, Debug)]
pub struct Appended {
    pub message: Message,
    /// Messages retained in the stream after the append.
    pub stream_messages: u64,
}

/// Outcome of trimming a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrimStats {
    /// Messages deleted.
    pub deleted: u64,
    /// Messages left in the stream.
    pub remaining: u64,
    /// Whether the stream record itself was removed.
    pub stream_deleted: bool,
}

/// Wire envelope sent on the live path.
///
/// `data` is omitted when the envelope would not fit in a notification; the
/// receiver then fetches the message by `id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: MessageId,
    #[serde(rename = "channel_id")]
    pub stream_id: StreamId,
    pub sequence: Sequence,
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Event {
    /// Build the full envelope for a message.
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id,
            stream_id: message.stream_id,
            sequence: message.sequence,
            stream: message.stream.clone(),
            data: Some(message.data.clone()),
        }
    }

    /// The same envelope with the payload stripped.
    pub fn without_data(&self) -> Self {
        Self {
            data: None,
            ..self.clone()
        }
    }

    /// Whether the receiver must fetch the message body by ID.
    pub fn is_stripped(&self) -> bool {
        self.data.is_none()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope received from a channel.
    pub fn parse(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}
