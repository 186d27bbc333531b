//! Retention cleanup.
//!
//! Publishing schedules cleanup for a stream once it holds more messages than
//! the retention threshold. Scheduled streams are trimmed on a background
//! thread so publish never waits on a delete; a stream already waiting in the
//! queue is not queued twice.

use crate::config::RetentionPolicy;
use crate::error::{PubSubError, Result};
use crate::store::RetentionStore;
use crate::types::TrimStats;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Applies a [`RetentionPolicy`] to streams in a [`RetentionStore`].
pub struct Cleaner {
    store: Arc<dyn RetentionStore>,
    policy: RetentionPolicy,
    pending: Arc<Mutex<HashSet<String>>>,
    sender: Mutex<Option<Sender<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Cleaner {
    /// Create a cleaner. A background thread is spawned only for bounded
    /// policies.
    pub fn new(store: Arc<dyn RetentionStore>, policy: RetentionPolicy) -> Result<Self> {
        let cleaner = Self {
            store,
            policy,
            pending: Arc::new(Mutex::new(HashSet::new())),
            sender: Mutex::new(None),
            worker: Mutex::new(None),
        };
        cleaner.start()?;
        Ok(cleaner)
    }

    /// Spawn the background thread if it is not running. Idempotent.
    pub fn start(&self) -> Result<()> {
        let Some(keep) = self.policy.threshold() else {
            return Ok(());
        };

        let mut sender = self.sender.lock();
        if sender.is_some() {
            return Ok(());
        }

        let (tx, rx) = unbounded::<String>();
        let store = Arc::clone(&self.store);
        let pending = Arc::clone(&self.pending);
        let handle = thread::Builder::new()
            .name("pubsub-cleanup".to_string())
            .spawn(move || {
                for stream in rx {
                    // Cleared before trimming so appends racing the trim can
                    // schedule another pass.
                    pending.lock().remove(&stream);
                    let _ = trim_stream(store.as_ref(), &stream, keep);
                }
            })
            .map_err(PubSubError::Io)?;

        *sender = Some(tx);
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Whether a stream holding `stream_messages` messages is over the
    /// threshold.
    pub fn over_threshold(&self, stream_messages: u64) -> bool {
        self.policy
            .threshold()
            .is_some_and(|keep| stream_messages > keep)
    }

    /// Queue `stream` for background cleanup. Never blocks.
    pub fn schedule(&self, stream: &str) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return;
        };

        if self.pending.lock().insert(stream.to_string()) {
            tracing::debug!(stream, "cleanup scheduled");
            if sender.send(stream.to_string()).is_err() {
                self.pending.lock().remove(stream);
            }
        }
    }

    /// Trim `stream` now, on the calling thread. Idempotent: once the stream
    /// is at or below the threshold this deletes nothing.
    pub fn cleanup(&self, stream: &str) -> Result<TrimStats> {
        match self.policy.threshold() {
            Some(keep) => trim_stream(self.store.as_ref(), stream, keep),
            None => Ok(TrimStats::default()),
        }
    }

    /// Stop the background thread after it finishes queued streams.
    /// [`start`](Self::start) brings it back.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        self.pending.lock().clear();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("cleanup thread panicked");
            }
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn trim_stream(store: &dyn RetentionStore, stream: &str, keep: u64) -> Result<TrimStats> {
    match store.trim(stream, keep) {
        Ok(stats) => {
            if stats.deleted > 0 {
                tracing::debug!(
                    stream,
                    deleted = stats.deleted,
                    remaining = stats.remaining,
                    stream_deleted = stats.stream_deleted,
                    "trimmed stream"
                );
            }
            Ok(stats)
        }
        Err(e) => {
            tracing::warn!(stream, error = %e, "stream cleanup failed");
            Err(e)
        }
    }
}
