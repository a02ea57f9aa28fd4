use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};
use tracing::trace;

use crate::{retry::Backoff, store::ObjectKey};

/// What happened to an object, as delivered by the watch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    /// Collapse two pending events for the same object into one.
    ///
    /// A deletion supersedes everything, a creation supersedes later updates.
    pub fn merge(self, later: EventKind) -> EventKind {
        match (self, later) {
            (EventKind::Deleted, _) | (_, EventKind::Deleted) => EventKind::Deleted,
            (EventKind::Created, _) | (_, EventKind::Created) => EventKind::Created,
            _ => EventKind::Updated,
        }
    }
}

/// What to do with an object after reconciling it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile the object again after `duration`
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Wait for the next event on the object
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<ObjectKey>,
    /// Queued keys and their collapsed event
    pending: HashMap<ObjectKey, EventKind>,
    /// Keys handed to a worker and not yet done
    processing: HashSet<ObjectKey>,
    /// Events that arrived for keys being processed
    dirty: HashMap<ObjectKey, EventKind>,
    /// Earliest pending delayed add per key
    scheduled: HashMap<ObjectKey, (Instant, EventKind)>,
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

/// Deduplicating work queue.
///
/// A key is queued at most once, however many events arrive for it, and is never
/// handed to two workers at the same time: events arriving while a key is being
/// processed are held back until [`WorkQueue::done`].
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    backoff: Backoff,
}

impl WorkQueue {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            inner: Arc::default(),
            notify: Arc::new(Notify::new()),
            backoff,
        }
    }

    pub async fn add(&self, key: ObjectKey, kind: EventKind) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return;
        }
        if inner.processing.contains(&key) {
            trace!(%key, ?kind, "deferring event for key in flight");
            let merged = inner.dirty.get(&key).map_or(kind, |k| k.merge(kind));
            inner.dirty.insert(key, merged);
            return;
        }
        if let Some(pending) = inner.pending.get_mut(&key) {
            *pending = pending.merge(kind);
            return;
        }
        inner.pending.insert(key.clone(), kind);
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has passed.
    ///
    /// A key has at most one pending delayed add: the earliest deadline wins, and
    /// handing the key to a worker cancels it.
    pub async fn add_after(&self, key: ObjectKey, kind: EventKind, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return;
            }
            match inner.scheduled.get_mut(&key) {
                Some((earlier, pending)) if *earlier <= deadline => {
                    *pending = pending.merge(kind);
                    return;
                }
                Some(slot) => *slot = (deadline, slot.1.merge(kind)),
                None => {
                    inner.scheduled.insert(key.clone(), (deadline, kind));
                }
            }
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            queue.fire(key, deadline).await;
        });
    }

    async fn fire(&self, key: ObjectKey, deadline: Instant) {
        let kind = {
            let mut inner = self.inner.lock().await;
            match inner.scheduled.get(&key) {
                Some((scheduled, kind)) if *scheduled == deadline => {
                    let kind = *kind;
                    inner.scheduled.remove(&key);
                    kind
                }
                // superseded by an earlier deadline or already picked up
                _ => return,
            }
        };
        self.add(key, kind).await;
    }

    /// Requeue `key` after its exponential backoff, returning the delay
    pub async fn add_rate_limited(&self, key: ObjectKey, kind: EventKind) -> Duration {
        let failures = {
            let mut inner = self.inner.lock().await;
            let failures = inner.failures.entry(key.clone()).or_default();
            *failures += 1;
            *failures
        };
        let delay = self.backoff.delay(failures);
        self.add_after(key, kind, delay).await;
        delay
    }

    /// Reset the backoff of `key`
    pub async fn forget(&self, key: &ObjectKey) {
        self.inner.lock().await.failures.remove(key);
    }

    pub async fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.inner
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Wait for the next key; `None` once the queue shuts down.
    pub async fn get(&self) -> Option<(ObjectKey, EventKind)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if let Some(key) = inner.queue.pop_front() {
                    let kind = inner.pending.remove(&key).unwrap_or(EventKind::Updated);
                    inner.scheduled.remove(&key);
                    inner.processing.insert(key.clone());
                    // more work left, wake another worker
                    if !inner.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some((key, kind));
                }
                if inner.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as processed, requeueing it if events arrived meanwhile
    pub async fn done(&self, key: &ObjectKey) {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(key);
        let Some(kind) = inner.dirty.remove(key) else {
            return;
        };
        if inner.shutting_down {
            return;
        }
        inner.pending.insert(key.clone(), kind);
        inner.queue.push_back(key.clone());
        drop(inner);
        self.notify.notify_one();
    }

    /// Stop handing out keys; blocked workers return `None`
    pub async fn shutdown(&self) {
        self.inner.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Number of queued keys, not counting the ones in flight
    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
