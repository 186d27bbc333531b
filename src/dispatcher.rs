//! Command queue and dispatcher thread.
//!
//! One worker thread owns the transport connection. Every other thread talks
//! to it through an unbounded command queue; enqueueing writes a wakeup
//! signal so the worker's blocking wait returns and the queue is drained in
//! FIFO order. Notifications read from the connection are fanned out through
//! the [`SubscriberRegistry`] on the worker thread.
//!
//! The connection never leaves the worker: it is created inside the worker
//! closure and no method of [`Dispatcher`] hands it out, so LISTEN, UNLISTEN
//! and NOTIFY are always issued from the one thread that owns the session.

use crate::config::PubSubConfig;
use crate::error::{PubSubError, Result};
use crate::registry::{Callback, SubscriberRegistry, Subscription};
use crate::transport::{Connector, Transport, Wakeup};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Dispatcher lifecycle.
///
/// `Stopped → Starting → Running → (Reconnecting → Running)* → Stopped`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Starting,
    Running,
    Reconnecting,
}

/// Work for the dispatcher thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Listen(String),
    Unlisten(String),
    Notify {
        channel: String,
        payload: String,
        /// Smaller payload to send if the transport rejects `payload` as too
        /// large.
        fallback: Option<String>,
    },
    Shutdown,
}

/// Dispatcher tuning, taken from [`PubSubConfig`].
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub queue_high_water: usize,
    pub poll_interval: Duration,
}

impl From<&PubSubConfig> for DispatcherConfig {
    fn from(config: &PubSubConfig) -> Self {
        Self {
            reconnect_attempts: config.reconnect_attempts,
            reconnect_base_delay: config.reconnect_base_delay,
            queue_high_water: config.queue_high_water,
            poll_interval: config.poll_interval,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&PubSubConfig::default())
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

enum Worker {
    /// Never started.
    Idle,
    Running(JoinHandle<()>),
    /// Told to stop from its own thread; joined by the next restart or
    /// shutdown.
    Stopping(JoinHandle<()>),
    /// Shut down; only [`Dispatcher::restart`] starts it again.
    Halted,
}

enum Flow {
    Continue,
    Shutdown,
}

/// State shared between the handle and the worker thread.
struct Shared {
    connector: Arc<dyn Connector>,
    registry: Arc<SubscriberRegistry>,
    config: DispatcherConfig,
    commands: Receiver<Command>,
    wakeup: Wakeup,
    state: RwLock<DispatcherState>,
    stopping: AtomicBool,
    worker_thread: Mutex<Option<ThreadId>>,
}

/// Handle to the dispatcher thread.
pub struct Dispatcher {
    shared: Arc<Shared>,
    sender: Sender<Command>,
    worker: Mutex<Worker>,
    /// Serializes shutdown and restart. Never held by the worker thread, and
    /// never taken by subscribe or notify, so callbacks cannot block on it.
    lifecycle: Mutex<()>,
    /// Keeps a registry transition and its LISTEN/UNLISTEN enqueue together,
    /// so concurrent subscribe/unsubscribe on a channel cannot reorder them.
    subscription_lock: Mutex<()>,
    backlogged: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher. The worker thread starts lazily on the first
    /// subscribe or notify.
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<SubscriberRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        let (sender, commands) = unbounded();
        Self {
            shared: Arc::new(Shared {
                connector,
                registry,
                config,
                commands,
                wakeup: Wakeup::new(),
                state: RwLock::new(DispatcherState::Stopped),
                stopping: AtomicBool::new(false),
                worker_thread: Mutex::new(None),
            }),
            sender,
            worker: Mutex::new(Worker::Idle),
            lifecycle: Mutex::new(()),
            subscription_lock: Mutex::new(()),
            backlogged: AtomicBool::new(false),
        }
    }

    /// Start the worker if it has never run. Idempotent; a dispatcher that
    /// was shut down or gave up reconnecting stays stopped.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if let Worker::Idle = *worker {
            *worker = Worker::Running(self.spawn()?);
        }
        Ok(())
    }

    /// Start the worker again after a shutdown or a fatal reconnect failure.
    /// No-op while it is still running, and when called from a callback.
    pub fn restart(&self) -> Result<()> {
        if self.shared.is_worker_thread() {
            return Ok(());
        }
        let _lifecycle = self.lifecycle.lock();

        let previous = {
            let mut worker = self.worker.lock();
            if let Worker::Running(handle) = &*worker {
                if !handle.is_finished() {
                    return Ok(());
                }
            }
            std::mem::replace(&mut *worker, Worker::Halted)
        };
        // Joined without the worker lock; a stopping worker may still be
        // inside a callback.
        if let Worker::Running(handle) | Worker::Stopping(handle) = previous {
            let _ = handle.join();
        }

        *self.worker.lock() = Worker::Running(self.spawn()?);
        Ok(())
    }

    /// Stop the worker after it drains the commands queued so far.
    ///
    /// Called from a callback, the worker is only told to stop; it exits once
    /// the callback returns.
    pub fn shutdown(&self) {
        let on_worker = self.shared.is_worker_thread();
        let _lifecycle = (!on_worker).then(|| self.lifecycle.lock());

        // The worker lock is released before joining: a callback running on
        // the worker may need it to publish or subscribe.
        let previous = std::mem::replace(&mut *self.worker.lock(), Worker::Halted);
        let handle = match previous {
            Worker::Running(handle) => {
                self.shared.stopping.store(true, Ordering::SeqCst);
                self.enqueue(Command::Shutdown);
                handle.thread().unpark();
                handle
            }
            Worker::Stopping(handle) => handle,
            Worker::Idle | Worker::Halted => return,
        };

        if on_worker {
            *self.worker.lock() = Worker::Stopping(handle);
            return;
        }
        if handle.join().is_err() {
            tracing::error!("dispatcher thread panicked");
        }
        self.shared.set_state(DispatcherState::Stopped);
    }

    /// Register a callback for `channel`, issuing LISTEN if it is the first.
    pub fn subscribe(&self, channel: &str, callback: Callback) -> Result<Subscription> {
        self.start()?;

        let _guard = self.subscription_lock.lock();
        let (id, first) = self.shared.registry.add(channel, callback);
        if first {
            self.enqueue(Command::Listen(channel.to_string()));
        }

        Ok(Subscription {
            id,
            channel: channel.to_string(),
        })
    }

    /// Remove a callback, issuing UNLISTEN if it was the last one. Returns
    /// whether the channel was released.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let _guard = self.subscription_lock.lock();
        let last = self
            .shared
            .registry
            .remove(&subscription.channel, subscription.id);
        if last {
            self.enqueue(Command::Unlisten(subscription.channel));
        }
        last
    }

    /// Queue a notification. Returns once queued; delivery is best-effort.
    ///
    /// Fails with [`PubSubError::DispatcherStopped`] after [`shutdown`](Self::shutdown)
    /// until the next [`restart`](Self::restart).
    pub fn notify(&self, channel: &str, payload: String, fallback: Option<String>) -> Result<()> {
        self.start()?;
        if let Worker::Halted | Worker::Stopping(_) = *self.worker.lock() {
            return Err(PubSubError::DispatcherStopped);
        }
        self.enqueue(Command::Notify {
            channel: channel.to_string(),
            payload,
            fallback,
        });
        Ok(())
    }

    pub fn state(&self) -> DispatcherState {
        *self.shared.state.read()
    }

    /// Commands waiting for the worker.
    pub fn queue_depth(&self) -> usize {
        self.sender.len()
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.shared.registry
    }

    fn enqueue(&self, command: Command) {
        // The receiver lives in `shared`, so the queue is never disconnected.
        let _ = self.sender.send(command);
        self.shared.wakeup.signal();

        let depth = self.sender.len();
        let high_water = self.shared.config.queue_high_water;
        if depth >= high_water {
            if !self.backlogged.swap(true, Ordering::Relaxed) {
                tracing::warn!(depth, high_water, "dispatcher command queue is backing up");
            }
        } else if depth < high_water / 2 {
            self.backlogged.store(false, Ordering::Relaxed);
        }
    }

    fn spawn(&self) -> Result<JoinHandle<()>> {
        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.set_state(DispatcherState::Starting);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("pubsub-dispatcher".to_string())
            .spawn(move || shared.run());

        match handle {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.shared.set_state(DispatcherState::Stopped);
                Err(PubSubError::Io(e))
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn set_state(&self, state: DispatcherState) {
        *self.state.write() = state;
    }

    fn is_worker_thread(&self) -> bool {
        *self.worker_thread.lock() == Some(thread::current().id())
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Worker thread body.
    fn run(&self) {
        *self.worker_thread.lock() = Some(thread::current().id());

        let Some(mut conn) = self.establish(None) else {
            self.set_state(DispatcherState::Stopped);
            return;
        };
        self.set_state(DispatcherState::Running);
        tracing::info!("dispatcher running");

        // A command interrupted by a connection failure; retried first after
        // reconnecting.
        let mut carry: Option<Command> = None;

        loop {
            let failure = match self.drain_commands(conn.as_mut(), &mut carry) {
                Ok(Flow::Shutdown) => break,
                Ok(Flow::Continue) => {
                    match conn.wait(&self.wakeup, self.config.poll_interval) {
                        Ok(notifications) => {
                            for n in notifications {
                                self.registry.dispatch(&n.channel, &n.payload);
                            }
                            None
                        }
                        Err(e) if e.is_connection_error() => Some(e),
                        Err(e) => {
                            tracing::warn!(error = %e, "transport wait failed");
                            None
                        }
                    }
                }
                Err(e) => Some(e),
            };

            if let Some(error) = failure {
                drop(conn);
                self.set_state(DispatcherState::Reconnecting);
                tracing::warn!(error = %error, "transport connection lost, reconnecting");

                match self.establish(Some(error)) {
                    Some(new_conn) => {
                        conn = new_conn;
                        self.set_state(DispatcherState::Running);
                    }
                    None => break,
                }
            }
        }

        self.set_state(DispatcherState::Stopped);
        tracing::info!("dispatcher stopped");
    }

    /// Apply queued commands until the queue is empty. Only connection
    /// errors are returned; the failed command is left in `carry`.
    fn drain_commands(
        &self,
        conn: &mut dyn Transport,
        carry: &mut Option<Command>,
    ) -> Result<Flow> {
        loop {
            let command = match carry.take() {
                Some(command) => command,
                None => match self.commands.try_recv() {
                    Ok(command) => command,
                    Err(_) => return Ok(Flow::Continue),
                },
            };

            if command == Command::Shutdown {
                if self.is_stopping() {
                    return Ok(Flow::Shutdown);
                }
                tracing::debug!("ignoring stale shutdown command");
                continue;
            }

            if let Err(e) = self.apply(conn, &command) {
                *carry = Some(command);
                return Err(e);
            }
        }
    }

    fn apply(&self, conn: &mut dyn Transport, command: &Command) -> Result<()> {
        let result = match command {
            Command::Listen(channel) => {
                tracing::debug!(channel = %channel, "LISTEN");
                conn.listen(channel)
            }
            Command::Unlisten(channel) => {
                tracing::debug!(channel = %channel, "UNLISTEN");
                conn.unlisten(channel)
            }
            Command::Notify {
                channel,
                payload,
                fallback,
            } => match (conn.notify(channel, payload), fallback) {
                (Err(PubSubError::PayloadTooLarge { size, limit }), Some(fallback)) => {
                    tracing::debug!(
                        channel = %channel,
                        size,
                        limit,
                        "notification too large, sending without payload"
                    );
                    conn.notify(channel, fallback)
                }
                (result, _) => result,
            },
            Command::Shutdown => Ok(()),
        };

        match result {
            Err(e) if e.is_connection_error() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, command = ?command, "dropping dispatcher command");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Open a connection and LISTEN on every registered channel.
    ///
    /// With `failure` set (a lost connection), waits out the backoff before
    /// the first attempt. Gives up after `reconnect_attempts` consecutive
    /// failures, or when shutdown is requested.
    fn establish(&self, mut failure: Option<PubSubError>) -> Option<Box<dyn Transport>> {
        let mut attempt = 0;
        loop {
            if let Some(error) = failure.take() {
                attempt += 1;
                if attempt > self.config.reconnect_attempts {
                    tracing::error!(
                        attempts = self.config.reconnect_attempts,
                        error = %error,
                        "could not reconnect to transport, dispatcher giving up"
                    );
                    return None;
                }

                let delay = backoff_delay(self.config.reconnect_base_delay, attempt);
                tracing::warn!(attempt, ?delay, error = %error, "transport reconnect scheduled");
                if !self.sleep(delay) {
                    return None;
                }
            }

            if self.is_stopping() {
                return None;
            }

            match self.connect_and_listen() {
                Ok(conn) => {
                    if attempt > 0 {
                        tracing::info!(attempt, "transport reconnected");
                    }
                    return Some(conn);
                }
                Err(e) => failure = Some(e),
            }
        }
    }

    fn connect_and_listen(&self) -> Result<Box<dyn Transport>> {
        let mut conn = self.connector.connect()?;
        for channel in self.registry.channels() {
            conn.listen(&channel)?;
        }
        Ok(conn)
    }

    /// Sleep for `delay` unless shutdown is requested. Returns false if
    /// interrupted by shutdown.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_stopping() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::park_timeout(deadline - now);
        }
    }
}
