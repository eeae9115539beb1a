//! Pacing queue - ordered, rate-limited execution of async operations.
//!
//! The coordinator staggers worker startup through this queue so spawns land
//! no closer together than an external rate limit allows. At most one item
//! is in flight; the next item starts only after the current operation has
//! settled AND its pacing delay has elapsed since the operation *started*,
//! making the rate limit independent of how long the operation itself took.
//!
//! Draining is an explicit state machine over {Idle, Draining, Paused}:
//! - `add` in auto mode starts draining when idle
//! - `stop` pauses after the in-flight item settles
//! - `resume` continues from the front of the queue
//! - `next` steps one item manually

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::Instant;

type ItemOp<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// Whether `add` may begin draining on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Adding to an idle, unpaused queue starts draining implicitly.
    #[default]
    Auto,
    /// Draining only happens through explicit `start`/`next` calls.
    Manual,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub mode: QueueMode,
    /// Minimum spacing between consecutive item starts.
    pub settle_delay: Duration,
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: QueueMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            mode: QueueMode::Auto,
            settle_delay: Duration::from_millis(7000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Idle,
    Draining,
    Paused,
}

struct QueueItem<T> {
    op: ItemOp<T>,
    delay: Duration,
    accepted_at: DateTime<Utc>,
    done: oneshot::Sender<anyhow::Result<T>>,
}

/// Handle to one queued operation; settles with that operation's own result.
pub struct ItemHandle<T> {
    accepted_at: DateTime<Utc>,
    rx: oneshot::Receiver<anyhow::Result<T>>,
}

impl<T> ItemHandle<T> {
    /// Wall-clock time the item was accepted into the queue.
    pub fn accepted_at(&self) -> DateTime<Utc> {
        self.accepted_at
    }

    /// Suspend until the operation settles. An item failure arrives here and
    /// only here; it never stops the queue.
    pub async fn wait(self) -> anyhow::Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("pacing queue dropped before the operation ran")),
        }
    }
}

struct Shared<T> {
    items: VecDeque<QueueItem<T>>,
    state: DrainState,
    /// True while a drain task is alive. Distinguishes "paused with the
    /// in-flight item still settling" from "paused and fully quiescent" so
    /// resume never ends up with two drain tasks.
    worker_alive: bool,
}

struct Inner<T> {
    shared: StdMutex<Shared<T>>,
    mode: QueueMode,
    settle_delay: Duration,
}

/// FIFO of deferred async operations with at most one in flight.
pub struct PacingQueue<T = ()> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PacingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

// Shared state is never held across an await; poisoning can only come from a
// panicking caller thread, so recover the guard rather than propagate.
fn lock<T>(shared: &StdMutex<Shared<T>>) -> std::sync::MutexGuard<'_, Shared<T>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Send + 'static> PacingQueue<T> {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: StdMutex::new(Shared {
                    items: VecDeque::new(),
                    state: DrainState::Idle,
                    worker_alive: false,
                }),
                mode: options.mode,
                settle_delay: options.settle_delay,
            }),
        }
    }

    /// Append an operation using the queue's default pacing delay.
    pub fn add<F, Fut>(&self, op: F) -> ItemHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.add_with_delay(op, self.inner.settle_delay)
    }

    /// Append an operation with a per-item pacing delay.
    pub fn add_with_delay<F, Fut>(&self, op: F, delay: Duration) -> ItemHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let accepted_at = Utc::now();
        let item = QueueItem {
            op: Box::new(move || {
                let fut: BoxFuture<'static, anyhow::Result<T>> = Box::pin(op());
                fut
            }),
            delay,
            accepted_at,
            done,
        };

        let start_draining = {
            let mut shared = lock(&self.inner.shared);
            shared.items.push_back(item);
            tracing::trace!(queued = shared.items.len(), "Accepted queue item");

            if self.inner.mode == QueueMode::Auto && shared.state == DrainState::Idle {
                shared.state = DrainState::Draining;
                shared.worker_alive = true;
                true
            } else {
                false
            }
        };
        if start_draining {
            Inner::spawn_drain(Arc::clone(&self.inner));
        }

        ItemHandle { accepted_at, rx }
    }

    /// Begin draining from the front. No-op when already draining or paused.
    pub fn start(&self) {
        let start_draining = {
            let mut shared = lock(&self.inner.shared);
            if shared.state == DrainState::Idle && !shared.items.is_empty() {
                shared.state = DrainState::Draining;
                shared.worker_alive = true;
                true
            } else {
                false
            }
        };
        if start_draining {
            Inner::spawn_drain(Arc::clone(&self.inner));
        }
    }

    /// Pause draining. The in-flight item (if any) still settles; nothing
    /// further starts until [`resume`](Self::resume). Queued items are kept.
    pub fn stop(&self) {
        let mut shared = lock(&self.inner.shared);
        shared.state = DrainState::Paused;
        tracing::debug!(queued = shared.items.len(), "Queue paused");
    }

    /// Clear the paused flag and continue draining.
    pub fn resume(&self) {
        let start_draining = {
            let mut shared = lock(&self.inner.shared);
            if shared.state != DrainState::Paused {
                false
            } else if shared.worker_alive {
                // Drain task is mid-item and has not observed the pause yet;
                // flipping the state back is enough.
                shared.state = DrainState::Draining;
                false
            } else if shared.items.is_empty() {
                shared.state = DrainState::Idle;
                false
            } else {
                shared.state = DrainState::Draining;
                shared.worker_alive = true;
                true
            }
        };
        if start_draining {
            Inner::spawn_drain(Arc::clone(&self.inner));
        }
    }

    /// Run the front item to settlement plus its pacing delay. Returns
    /// `false` (with no effect) on an empty queue. Intended for manual
    /// stepping; auto-mode callers should let the drain task do this.
    pub async fn next(&self) -> bool {
        let item = lock(&self.inner.shared).items.pop_front();
        match item {
            Some(item) => {
                run_item(item).await;
                true
            }
            None => false,
        }
    }

    /// Number of items waiting to run (the in-flight item is not counted).
    pub fn len(&self) -> usize {
        lock(&self.inner.shared).items.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.shared).items.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.inner.shared).state == DrainState::Paused
    }
}

impl<T: Send + 'static> Inner<T> {
    fn spawn_drain(inner: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let item = {
                    let mut shared = lock(&inner.shared);
                    if shared.state == DrainState::Paused {
                        shared.worker_alive = false;
                        break;
                    }
                    match shared.items.pop_front() {
                        Some(item) => item,
                        None => {
                            shared.state = DrainState::Idle;
                            shared.worker_alive = false;
                            break;
                        }
                    }
                };
                run_item(item).await;
            }
            tracing::trace!("Drain task exiting");
        });
    }
}

async fn run_item<T>(item: QueueItem<T>) {
    let started = Instant::now();
    let queued_ms = (Utc::now() - item.accepted_at).num_milliseconds();
    tracing::debug!(
        queued_ms,
        delay_ms = item.delay.as_millis() as u64,
        "Running queued operation"
    );

    let result = (item.op)().await;
    if let Err(error) = &result {
        tracing::warn!(%error, "Queued operation failed");
    }
    let _ = item.done.send(result);

    // Hold the slot until the pacing delay has elapsed since the operation
    // started, regardless of how quickly it settled.
    let elapsed = started.elapsed();
    if elapsed < item.delay {
        tokio::time::sleep(item.delay - elapsed).await;
    }
}
