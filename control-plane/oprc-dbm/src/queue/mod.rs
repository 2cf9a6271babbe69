//! Keyed work queue with per-key serialization and rate-limited requeue.
//!
//! A key is in at most one of two places at a time: waiting in the channel or
//! held by a worker. Adding a key that is already waiting is a no-op; adding
//! a key that a worker holds marks it dirty and it goes back on the channel
//! once the worker calls [`WorkQueue::done`].

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod queue_tests;

#[derive(Default)]
struct QueueState {
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
}

struct Inner {
    tx: flume::Sender<String>,
    rx: flume::Receiver<String>,
    state: Mutex<QueueState>,
    token: CancellationToken,
    base_delay: Duration,
    max_delay: Duration,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx,
                state: Mutex::new(QueueState::default()),
                token: CancellationToken::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> T {
        // A poisoned lock only means a worker panicked mid-update; the sets
        // are still usable.
        let mut guard = match self.inner.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn add(&self, key: impl Into<String>) {
        if self.is_shutdown() {
            return;
        }
        let key = key.into();
        let send = self.with_state(|s| {
            if !s.dirty.insert(key.clone()) {
                return false;
            }
            !s.processing.contains(&key)
        });
        if send {
            let _ = self.inner.tx.send(key);
        }
    }

    /// Next key to work on, or `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let key = tokio::select! {
                biased;
                _ = self.inner.token.cancelled() => return None,
                res = self.inner.rx.recv_async() => res.ok()?,
            };
            let taken = self.with_state(|s| {
                if s.dirty.remove(&key) {
                    s.processing.insert(key.clone());
                    true
                } else {
                    false
                }
            });
            if taken {
                return Some(key);
            }
        }
    }

    /// Release a key taken by [`WorkQueue::get`]. A key re-added while held
    /// is queued again now.
    pub fn done(&self, key: &str) {
        let requeue = self.with_state(|s| {
            s.processing.remove(key);
            s.dirty.contains(key)
        });
        if requeue && !self.is_shutdown() {
            let _ = self.inner.tx.send(key.to_string());
        }
    }

    /// Re-add after `base * 2^(n-1)`, capped, where `n` counts the failures
    /// of this key since it was last forgotten.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let failures = self.with_state(|s| {
            let n = s.failures.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        });
        let delay = self.backoff(failures);
        debug!(%key, failures, ?delay, "requeue with backoff");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.inner.token.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.inner
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.inner.max_delay)
    }

    pub fn forget(&self, key: &str) {
        self.with_state(|s| {
            s.failures.remove(key);
        });
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.with_state(|s| s.failures.get(key).copied().unwrap_or(0))
    }

    /// Number of keys waiting to be picked up.
    pub fn len(&self) -> usize {
        self.with_state(|s| s.dirty.difference(&s.processing).count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.inner.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.token.is_cancelled()
    }
}

#[async_trait::async_trait]
pub trait KeyHandler: Send + Sync + 'static {
    type Error: Display + Send + Sync;

    async fn handle(&self, key: &str) -> Result<(), Self::Error>;

    /// Called once a key has failed more often than the requeue budget
    /// allows. The key is dropped afterwards.
    async fn on_exhausted(&self, _key: &str, _err: &Self::Error) {}
}

/// Fixed pool of workers draining a [`WorkQueue`] into a [`KeyHandler`].
pub struct Dispatcher<H> {
    queue: WorkQueue,
    handler: Arc<H>,
    workers: usize,
    max_requeues: u32,
}

impl<H: KeyHandler> Dispatcher<H> {
    pub fn new(
        queue: WorkQueue,
        handler: Arc<H>,
        workers: usize,
        max_requeues: u32,
    ) -> Self {
        Self {
            queue,
            handler,
            workers: workers.max(1),
            max_requeues,
        }
    }

    /// Runs until the queue is shut down and every worker has finished its
    /// current key.
    pub async fn run(self) {
        info!(workers = self.workers, "dispatcher: starting workers");
        let mut set = JoinSet::new();
        for i in 0..self.workers {
            let queue = self.queue.clone();
            let handler = self.handler.clone();
            let max_requeues = self.max_requeues;
            set.spawn(async move {
                while let Some(key) = queue.get().await {
                    process(&queue, handler.as_ref(), &key, max_requeues).await;
                    queue.done(&key);
                }
                debug!(worker = i, "dispatcher: worker stopped");
            });
        }
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "dispatcher: worker task failed");
            }
        }
        info!("dispatcher: stopped");
    }
}

/// Why a handler pass did not succeed. A panic counts as a failure so the
/// key is released and retried like any other error.
enum Failure<E> {
    Error(E),
    Panic(String),
}

impl<E: Display> Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Error(e) => e.fmt(f),
            Failure::Panic(msg) => write!(f, "handler panicked: {msg}"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}

async fn process<H: KeyHandler>(
    queue: &WorkQueue,
    handler: &H,
    key: &str,
    max_requeues: u32,
) {
    let failure = match AssertUnwindSafe(handler.handle(key))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {
            queue.forget(key);
            return;
        }
        Ok(Err(e)) => Failure::Error(e),
        Err(payload) => Failure::Panic(panic_message(payload.as_ref())),
    };

    let attempt = queue.num_requeues(key);
    if attempt < max_requeues {
        warn!(
            %key,
            error = %failure,
            attempt = attempt + 1,
            "handler failed, requeueing"
        );
        queue.add_rate_limited(key);
        return;
    }
    error!(
        %key,
        error = %failure,
        max_requeues,
        "dropping key after exhausting requeues"
    );
    queue.forget(key);
    if let Failure::Error(e) = &failure {
        handler.on_exhausted(key, e).await;
    }
}
