//! SQLite-backed retention store.

use super::RetentionStore;
use crate::error::Result;
use crate::types::{
    Appended, Message, MessageId, Sequence, Stream, StreamId, Timestamp, TrimStats,
};
use parking_lot::Mutex;
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Row, ToSql, Transaction,
    TransactionBehavior,
};
use std::path::Path;
use std::time::Duration;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lookups retried after losing a stream-creation race.
const STREAM_CREATE_RETRIES: u32 = 3;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT    NOT NULL UNIQUE,
    sequence      INTEGER NOT NULL DEFAULT 0,
    message_count INTEGER NOT NULL DEFAULT 0,
    created_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_id  INTEGER NOT NULL REFERENCES streams(id) ON DELETE CASCADE,
    sequence   INTEGER NOT NULL,
    data       TEXT    NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS messages_stream_sequence
    ON messages (stream_id, sequence);
"#;

const MESSAGE_COLUMNS: &str =
    "m.id, m.stream_id, s.name, m.sequence, m.data, m.created_at";

/// Retention store on a single SQLite connection.
///
/// Writes run in `BEGIN IMMEDIATE` transactions, which take the database
/// write lock up front; that is the per-stream lock for the
/// increment-then-insert step, and it also holds across processes sharing
/// the file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl RetentionStore for SqliteStore {
    fn append(&self, stream: &str, data: &str) -> Result<Appended> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stream_id = find_or_create_stream(&tx, stream)?;

        let (sequence, stream_messages): (i64, i64) = tx.query_row(
            "UPDATE streams
                SET sequence = sequence + 1, message_count = message_count + 1
              WHERE id = ?1
          RETURNING sequence, message_count",
            params![stream_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let created_at = Timestamp::now();
        tx.execute(
            "INSERT INTO messages (stream_id, sequence, data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![stream_id, sequence, data, created_at.0],
        )?;
        let id = tx.last_insert_rowid();

        tx.commit()?;

        Ok(Appended {
            message: Message {
                id: MessageId(id as u64),
                stream_id: StreamId(stream_id as u64),
                stream: stream.to_string(),
                sequence: Sequence(sequence as u64),
                data: data.to_string(),
                created_at,
            },
            stream_messages: stream_messages as u64,
        })
    }

    fn replay_after(&self, streams: &[&str], since: MessageId) -> Result<Vec<Message>> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..streams.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}
               FROM messages m JOIN streams s ON s.id = m.stream_id
              WHERE m.id > ?1 AND s.name IN ({placeholders})
              ORDER BY m.id"
        );

        let since = since.0 as i64;
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(streams.len() + 1);
        values.push(&since);
        values.extend(streams.iter().map(|s| s as &dyn ToSql));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(values.as_slice(), message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    fn trim(&self, stream: &str, keep: u64) -> Result<TrimStats> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(stream_id) = lookup_stream(&tx, stream)? else {
            return Ok(TrimStats::default());
        };

        // Everything at or below the (keep+1)-th newest ID goes.
        let cutoff: Option<i64> = tx
            .query_row(
                "SELECT id FROM messages WHERE stream_id = ?1
                 ORDER BY id DESC LIMIT 1 OFFSET ?2",
                params![stream_id, keep as i64],
                |row| row.get(0),
            )
            .optional()?;

        let deleted = match cutoff {
            Some(cutoff) => tx.execute(
                "DELETE FROM messages WHERE stream_id = ?1 AND id <= ?2",
                params![stream_id, cutoff],
            )? as u64,
            None => 0,
        };

        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM messages WHERE stream_id = ?1",
            params![stream_id],
            |row| row.get(0),
        )?;

        let stream_deleted = remaining == 0;
        if stream_deleted {
            tx.execute("DELETE FROM streams WHERE id = ?1", params![stream_id])?;
        } else {
            tx.execute(
                "UPDATE streams SET message_count = ?2 WHERE id = ?1",
                params![stream_id, remaining],
            )?;
        }

        tx.commit()?;

        Ok(TrimStats {
            deleted,
            remaining: remaining as u64,
            stream_deleted,
        })
    }

    fn message(&self, id: MessageId) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        let message = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS}
                       FROM messages m JOIN streams s ON s.id = m.stream_id
                      WHERE m.id = ?1"
                ),
                params![id.0 as i64],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    fn stream(&self, name: &str) -> Result<Option<Stream>> {
        let conn = self.conn.lock();
        let stream = conn
            .query_row(
                "SELECT id, name, sequence, message_count FROM streams WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Stream {
                        id: StreamId(row.get::<_, i64>(0)? as u64),
                        name: row.get(1)?,
                        sequence: Sequence(row.get::<_, i64>(2)? as u64),
                        message_count: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(stream)
    }
}

fn lookup_stream(tx: &Transaction<'_>, name: &str) -> rusqlite::Result<Option<i64>> {
    tx.query_row(
        "SELECT id FROM streams WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
    .optional()
}

/// Find a stream by name or insert it. Losing an insert race to another
/// writer shows up as a unique violation, after which the lookup is retried.
fn find_or_create_stream(tx: &Transaction<'_>, name: &str) -> Result<i64> {
    let mut attempt = 0;
    loop {
        if let Some(id) = lookup_stream(tx, name)? {
            return Ok(id);
        }

        match tx.execute(
            "INSERT INTO streams (name, sequence, message_count, created_at)
             VALUES (?1, 0, 0, ?2)",
            params![name, Timestamp::now().0],
        ) {
            Ok(_) => return Ok(tx.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation
                    && attempt < STREAM_CREATE_RETRIES =>
            {
                attempt += 1;
                tracing::debug!(stream = name, attempt, "stream created concurrently, retrying lookup");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId(row.get::<_, i64>(0)? as u64),
        stream_id: StreamId(row.get::<_, i64>(1)? as u64),
        stream: row.get(2)?,
        sequence: Sequence(row.get::<_, i64>(3)? as u64),
        data: row.get(4)?,
        created_at: Timestamp(row.get(5)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn data(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.data.as_str()).collect()
    }

    #[test]
    fn test_append_assigns_sequences() {
        let store = SqliteStore::open_in_memory().unwrap();

        let first = store.append("dashboard", "hello").unwrap();
        let second = store.append("dashboard", "world").unwrap();

        assert_eq!(first.message.sequence, Sequence(1));
        assert_eq!(second.message.sequence, Sequence(2));
        assert!(second.message.id > first.message.id);
        assert_eq!(first.message.stream_id, second.message.stream_id);
        assert_eq!(second.stream_messages, 2);
    }

    #[test]
    fn test_sequences_are_per_stream() {
        let store = SqliteStore::open_in_memory().unwrap();

        store.append("a", "1").unwrap();
        store.append("a", "2").unwrap();
        let b = store.append("b", "1").unwrap();

        assert_eq!(b.message.sequence, Sequence(1));
        assert_eq!(store.stream("a").unwrap().unwrap().sequence, Sequence(2));
    }

    #[test]
    fn test_replay_after() {
        let store = SqliteStore::open_in_memory().unwrap();

        store.append("a", "a1").unwrap();
        let b1 = store.append("b", "b1").unwrap();
        store.append("c", "c1").unwrap();
        let last = store.append("a", "a2").unwrap();

        let all = store.replay_after(&["a", "b"], MessageId(0)).unwrap();
        assert_eq!(data(&all), vec!["a1", "b1", "a2"]);

        let tail = store.replay_after(&["a", "b"], b1.message.id).unwrap();
        assert_eq!(data(&tail), vec!["a2"]);

        assert!(store
            .replay_after(&["a", "b"], last.message.id)
            .unwrap()
            .is_empty());
        assert!(store.replay_after(&[], MessageId(0)).unwrap().is_empty());
    }

    #[test]
    fn test_trim_keeps_newest() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 1..=10 {
            store.append("x", &format!("m{i}")).unwrap();
        }

        let stats = store.trim("x", 5).unwrap();
        assert_eq!(stats.deleted, 5);
        assert_eq!(stats.remaining, 5);
        assert!(!stats.stream_deleted);

        let left = store.replay_after(&["x"], MessageId(0)).unwrap();
        assert_eq!(data(&left), vec!["m6", "m7", "m8", "m9", "m10"]);
        assert_eq!(store.stream("x").unwrap().unwrap().message_count, 5);

        let again = store.trim("x", 5).unwrap();
        assert_eq!(again.deleted, 0);
        assert_eq!(again.remaining, 5);
    }

    #[test]
    fn test_trim_to_zero_deletes_stream() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append("x", "1").unwrap();
        store.append("x", "2").unwrap();

        let stats = store.trim("x", 0).unwrap();
        assert_eq!(stats.deleted, 2);
        assert!(stats.stream_deleted);
        assert!(store.stream("x").unwrap().is_none());
    }

    #[test]
    fn test_trim_leaves_other_streams() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append("x", "1").unwrap();
        store.append("y", "1").unwrap();

        store.trim("x", 0).unwrap();
        assert_eq!(store.stream("y").unwrap().unwrap().message_count, 1);
        assert_eq!(store.trim("missing", 3).unwrap(), TrimStats::default());
    }

    #[test]
    fn test_message_ids_not_reused_after_trim() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.append("x", "1").unwrap();
        store.trim("x", 0).unwrap();

        let again = store.append("x", "2").unwrap();
        assert!(again.message.id > first.message.id);
        assert_eq!(again.message.sequence, Sequence(1));
    }

    #[test]
    fn test_message_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let appended = store.append("x", "payload").unwrap();

        let found = store.message(appended.message.id).unwrap().unwrap();
        assert_eq!(found, appended.message);
        assert!(store.message(MessageId(999)).unwrap().is_none());
    }

    #[test]
    fn test_reopen_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pubsub.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.append("x", "1").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let next = store.append("x", "2").unwrap();
        assert_eq!(next.message.sequence, Sequence(2));
    }
}
