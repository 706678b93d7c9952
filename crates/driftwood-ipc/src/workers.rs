//! Short-lived worker tasks with a bounded shutdown join.
//!
//! # Design
//! - Workers never touch scheduler state; they post results through a queue.
//! - `close` stops admission and raises the shutdown signal in one step.
//! - `join_with_deadline` aborts whatever is still running at the deadline.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Receiver side of the shutdown signal handed to every worker.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown is requested (or the worker set is dropped).
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

/// Outcome of [`WorkerSet::join_with_deadline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinReport {
    /// Workers that finished before the deadline.
    pub finished: usize,
    /// Workers aborted at the deadline.
    pub abandoned: usize,
}

#[derive(Debug)]
struct Inner {
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Shared set of outstanding workers.
#[derive(Debug, Clone)]
pub struct WorkerSet {
    inner: Arc<Inner>,
}

impl Default for WorkerSet {
    fn default() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(JoinSet::new()),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        }
    }
}

impl WorkerSet {
    /// Empty, open worker set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker built from the shutdown signal. Returns `false` once the
    /// set is closed.
    pub fn spawn<F, Fut>(&self, name: &'static str, make: F) -> bool
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            debug!(worker = name, "worker set closed; refusing new work");
            return false;
        }
        let signal = ShutdownSignal(self.inner.shutdown.subscribe());
        let mut tasks = self.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(make(signal));
        true
    }

    /// Stop accepting work and ask running workers to finish.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);
    }

    /// Whether [`WorkerSet::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Workers spawned and not yet reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no workers are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join every outstanding worker, aborting those still running after `deadline`.
    pub async fn join_with_deadline(&self, deadline: Duration) -> JoinReport {
        let mut tasks = std::mem::take(&mut *self.lock());
        let until = Instant::now() + deadline;
        let mut report = JoinReport::default();
        loop {
            match tokio::time::timeout_at(until, tasks.join_next()).await {
                Ok(Some(result)) => {
                    if let Err(err) = result
                        && err.is_panic()
                    {
                        warn!(error = %err, "worker panicked");
                    }
                    report.finished += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    report.abandoned = tasks.len();
                    warn!(
                        abandoned = report.abandoned,
                        "workers missed the shutdown deadline"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
