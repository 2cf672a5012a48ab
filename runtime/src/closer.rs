//! Coordinated shutdown.
//!
//! A [`Closer`] collects cleanup callbacks from independent subsystems and
//! runs them all, concurrently and exactly once, when shutdown is triggered
//! either explicitly ([`Closer::close_all`]) or by an OS signal
//! ([`Closer::with_signals`]).
//!
//! ## Guarantees
//!
//! - Registration is thread-safe and never waits on running callbacks.
//! - The first `close_all` wins; every later call is a no-op.
//! - Callbacks run in parallel with no ordering between them. Total shutdown
//!   time is bounded by the slowest callback, not their sum.
//! - A failing, panicking or (with [`CloserConfig::callback_timeout`]) slow
//!   callback is logged and never affects its siblings. Failures are not
//!   returned to anyone: `close_all` and `wait` only report completion.
//! - Any number of tasks may [`wait`](Closer::wait); all are released
//!   together once every callback has finished.
//!
//! Callbacks registered after the trigger has captured the pending set are
//! not run by it. A warning is logged when that happens.
//!
//! ## Usage
//!
//! ```no_run
//! use platform_common_runtime::closer::Closer;
//! use platform_common_runtime::signal::ShutdownSignal;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let closer = Closer::with_signals(&ShutdownSignal::DEFAULT)?;
//!
//! closer.add_named("http-server", || async { Ok::<_, String>(()) });
//! closer.add_named("db-pool", || async { Ok::<_, String>(()) });
//!
//! // ... serve until SIGINT/SIGTERM ...
//! closer.wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Process-wide instance
//!
//! [`install_global`] lets the composition root register its `Closer` as the
//! process-wide default; [`add`], [`close_all`] and [`wait`] forward to it.

use crate::signal::{ShutdownSignal, SignalListener};
use futures::future::join_all;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Why a cleanup callback failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CleanupError {
    /// The callback returned an error.
    #[error("{0}")]
    Failed(String),

    /// The callback panicked.
    #[error("callback panicked: {0}")]
    Panicked(String),

    /// The callback exceeded [`CloserConfig::callback_timeout`].
    #[error("callback timed out after {0:?}")]
    TimedOut(Duration),
}

/// Errors from setting up a [`Closer`].
#[derive(Error, Debug)]
pub enum CloserError {
    /// A signal handler could not be installed.
    #[error("failed to subscribe to shutdown signals: {0}")]
    Signal(#[from] std::io::Error),

    /// Signal listening needs a Tokio runtime and none is running.
    #[error("no Tokio runtime available to listen for signals")]
    NoRuntime,
}

/// Boxed future produced by a cleanup callback.
pub type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), CleanupError>> + Send>>;

type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

struct Callback {
    name: String,
    run: CleanupFn,
}

/// [`Closer`] configuration.
#[derive(Debug, Clone, Default)]
pub struct CloserConfig {
    /// Maximum time a single callback may take. `None` waits indefinitely.
    pub callback_timeout: Option<Duration>,
}

impl CloserConfig {
    /// Set the per-callback timeout.
    #[must_use]
    pub const fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = Some(timeout);
        self
    }
}

#[derive(Default)]
struct Registry {
    callbacks: Vec<Callback>,
    /// Set once the trigger has taken the pending callbacks.
    captured: bool,
}

struct Inner {
    config: CloserConfig,
    registry: Mutex<Registry>,
    triggered: AtomicBool,
    done: watch::Sender<bool>,
    next_id: AtomicUsize,
}

/// Shutdown coordinator.
///
/// Cheap to clone; clones share the same registry and completion signal.
#[derive(Clone)]
pub struct Closer {
    inner: Arc<Inner>,
}

impl Closer {
    /// Create a closer that only runs when [`close_all`](Self::close_all) is called.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CloserConfig::default())
    }

    /// Create a closer with the given configuration.
    #[must_use]
    pub fn with_config(config: CloserConfig) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(Registry::default()),
                triggered: AtomicBool::new(false),
                done,
                next_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a closer that triggers itself on the first of `signals`.
    ///
    /// With an empty slice this is equivalent to [`Closer::new`].
    ///
    /// Once subscribed, the signals keep Tokio's handler for the life of the
    /// process. Further deliveries after the first are absorbed, so a second
    /// Ctrl+C does not kill a shutdown that hangs. Bound hung callbacks with
    /// [`CloserConfig::callback_timeout`] instead.
    ///
    /// # Errors
    ///
    /// Returns [`CloserError`] if called outside a Tokio runtime or if a
    /// signal cannot be subscribed.
    pub fn with_signals(signals: &[ShutdownSignal]) -> Result<Self, CloserError> {
        let closer = Self::new();
        closer.listen_for_signals(signals)?;
        Ok(closer)
    }

    /// Trigger this closer on the first of `signals`.
    ///
    /// The subscriptions are made before returning; the wait happens on a
    /// spawned task. Signals delivered after the first are ignored (see
    /// [`Closer::with_signals`]).
    ///
    /// # Errors
    ///
    /// Returns [`CloserError`] if called outside a Tokio runtime or if a
    /// signal cannot be subscribed.
    pub fn listen_for_signals(&self, signals: &[ShutdownSignal]) -> Result<(), CloserError> {
        if signals.is_empty() {
            return Ok(());
        }

        let handle = Handle::try_current().map_err(|_| CloserError::NoRuntime)?;
        let listener = {
            let _guard = handle.enter();
            SignalListener::subscribe(signals)?
        };

        let closer = self.clone();
        handle.spawn(async move {
            let signal = listener.recv().await;
            info!(%signal, "Received shutdown signal");
            closer.close_all();
        });

        Ok(())
    }

    /// Register a cleanup callback.
    ///
    /// The callback gets a generated name (`callback-N`) for diagnostics.
    pub fn add<F, Fut, E>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.add_named(format!("callback-{id}"), f);
    }

    /// Register a cleanup callback under `name`.
    ///
    /// The name appears in the log line emitted if the callback fails.
    pub fn add_named<F, Fut, E>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        self.push(Callback {
            name: name.into(),
            run: Box::new(move || {
                Box::pin(async move {
                    f().await
                        .map_err(|err| CleanupError::Failed(err.to_string()))
                })
            }),
        });
    }

    /// Register a synchronous cleanup callback under `name`.
    ///
    /// It runs on Tokio's blocking pool so it may do blocking I/O.
    pub fn add_blocking<F, E>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.push(Callback {
            name: name.into(),
            run: Box::new(move || {
                Box::pin(async move {
                    match tokio::task::spawn_blocking(f).await {
                        Ok(result) => result.map_err(|err| CleanupError::Failed(err.to_string())),
                        Err(join_err) => Err(join_error(join_err)),
                    }
                })
            }),
        });
    }

    fn push(&self, callback: Callback) {
        let mut registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if registry.captured {
            warn!(
                callback = %callback.name,
                "Cleanup callback registered after shutdown was triggered; it will not run"
            );
        }
        registry.callbacks.push(callback);
    }

    /// Number of callbacks registered and not yet taken by the trigger.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }

    /// Whether shutdown has been triggered (it may still be running).
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Whether every callback of the shutdown run has finished.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Trigger shutdown.
    ///
    /// Only the first call has an effect. It takes every pending callback and
    /// starts running them in the background, then returns without waiting.
    /// Use [`wait`](Self::wait) to wait for completion.
    ///
    /// Outside a Tokio runtime the callbacks run on a dedicated thread with
    /// its own single-threaded runtime.
    pub fn close_all(&self) {
        if self
            .inner
            .triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let callbacks = {
            let mut registry = self
                .inner
                .registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            registry.captured = true;
            std::mem::take(&mut registry.callbacks)
        };

        if let Ok(handle) = Handle::try_current() {
            handle.spawn(Arc::clone(&self.inner).run(callbacks));
            return;
        }

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("closer".to_string())
            .spawn(move || {
                let completion = CompletionGuard(Arc::clone(&inner));
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(inner.run(callbacks)),
                    Err(err) => error!(error = %err, "Failed to start runtime for shutdown callbacks"),
                }
                drop(completion);
            });

        if let Err(err) = spawned {
            error!(error = %err, "Failed to spawn shutdown thread");
            self.inner.done.send_replace(true);
        }
    }

    /// Wait until shutdown has completed.
    ///
    /// Returns immediately if it already has. Does not trigger shutdown.
    pub async fn wait(&self) {
        let mut done = self.inner.done.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = done.wait_for(|closed| *closed).await;
    }

    /// Blocking variant of [`wait`](Self::wait) for synchronous callers.
    ///
    /// Must not be called from inside an async task.
    pub fn wait_blocking(&self) {
        futures::executor::block_on(self.wait());
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Closer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closer")
            .field("pending", &self.pending())
            .field("triggered", &self.is_triggered())
            .field("closed", &self.is_closed())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Inner {
    /// Run every callback concurrently, log failures, then signal completion.
    async fn run(self: Arc<Self>, callbacks: Vec<Callback>) {
        let _completion = CompletionGuard(Arc::clone(&self));
        let total = callbacks.len();
        let timeout = self.config.callback_timeout;

        info!(callbacks = total, "Running shutdown callbacks");

        let tasks = callbacks.into_iter().map(|callback| {
            let Callback { name, run } = callback;
            let task = tokio::spawn(async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, run())
                        .await
                        .unwrap_or(Err(CleanupError::TimedOut(limit))),
                    None => run().await,
                }
            });
            async move {
                let result = task.await.unwrap_or_else(|join_err| Err(join_error(join_err)));
                (name, result)
            }
        });

        let mut failures = 0_usize;
        for (name, result) in join_all(tasks).await {
            if let Err(err) = result {
                failures += 1;
                error!(callback = %name, error = %err, "Error returned from shutdown callback");
                metrics::counter!("platform_common.closer.callback_failures").increment(1);
            }
        }

        info!(callbacks = total, failures, "Shutdown callbacks finished");
    }
}

/// Publishes completion when dropped, so waiters are released even if the
/// run itself unwinds.
struct CompletionGuard(Arc<Inner>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.done.send_replace(true);
    }
}

fn join_error(err: tokio::task::JoinError) -> CleanupError {
    if err.is_panic() {
        CleanupError::Panicked(panic_message(err.into_panic().as_ref()))
    } else {
        CleanupError::Failed(err.to_string())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

static GLOBAL: OnceLock<Closer> = OnceLock::new();

/// Install `closer` as the process-wide instance.
///
/// Call this once from the composition root, before anything uses
/// [`global`].
///
/// # Errors
///
/// Returns `closer` back if a global instance already exists (installed
/// earlier or created lazily by [`global`]).
pub fn install_global(closer: Closer) -> Result<(), Closer> {
    GLOBAL.set(closer)
}

/// The process-wide instance; a plain [`Closer::new`] if none was installed.
pub fn global() -> &'static Closer {
    GLOBAL.get_or_init(Closer::new)
}

/// Register a callback with the process-wide instance. See [`Closer::add`].
pub fn add<F, Fut, E>(f: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + 'static,
{
    global().add(f);
}

/// Trigger the process-wide instance. See [`Closer::close_all`].
pub fn close_all() {
    global().close_all();
}

/// Wait for the process-wide instance. See [`Closer::wait`].
pub async fn wait() {
    global().wait().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_wait_pends_until_closed() {
        let closer = Closer::new();
        let mut waiter = task::spawn(closer.wait());
        assert_pending!(waiter.poll());

        closer.inner.done.send_replace(true);

        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_add_generates_names() {
        let closer = Closer::new();
        closer.add(|| async { Ok::<_, String>(()) });
        closer.add(|| async { Ok::<_, String>(()) });

        let registry = closer.inner.registry.lock().unwrap();
        let names: Vec<&str> = registry.callbacks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["callback-0", "callback-1"]);
    }

    #[tokio::test]
    async fn test_close_all_with_nothing_registered() {
        let closer = Closer::new();
        closer.close_all();
        closer.wait().await;

        assert!(closer.is_triggered());
        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn test_blocking_callback_failure_is_contained() {
        let closer = Closer::new();
        closer.add_blocking("sync-flush", || Err::<(), _>("flush failed"));

        closer.close_all();
        closer.wait().await;

        assert!(closer.is_closed());
    }

    #[test]
    fn test_panic_message_variants() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
