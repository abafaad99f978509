//! Deduplicating work queue with delayed retries
//!
//! Every key has at most one pending task. A notification for a key that is
//! already pending is coalesced into it, so the worker always sees the
//! freshest payload. A key handed to the worker is not handed out again
//! until the worker calls [`WorkQueue::done`].
//!
//! A failed task waits out its retry delay outside the queue. A newer
//! notification for its key absorbs it instead of replacing it, so the
//! failed transition is retried together with the newer state.

use crate::model::{Notification, ResourceKey};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Merging of two payloads queued for the same key
pub trait Coalesce {
    fn coalesce(self, newer: Self) -> Self;
}

impl Coalesce for Notification {
    fn coalesce(self, newer: Self) -> Self {
        Notification::coalesce(self, newer)
    }
}

/// Queue of cluster notifications keyed by resource
pub type NotificationQueue = WorkQueue<ResourceKey, Notification>;

/// A unit of work handed out by the queue
#[derive(Debug, Clone)]
pub struct Task<K, T> {
    pub key: K,
    pub payload: T,
    seq: u64,
    requeues: u32,
}

struct State<K, T> {
    order: VecDeque<K>,
    pending: HashMap<K, Task<K, T>>,
    processing: HashSet<K>,
    // Failed tasks waiting out their retry delay, at most one per key
    retrying: HashMap<K, Task<K, T>>,
    next_seq: u64,
    shutting_down: bool,
}

struct Inner<K, T> {
    state: Mutex<State<K, T>>,
    notify: Notify,
}

/// WorkQueue is cheap to clone; clones share the same queue
pub struct WorkQueue<K, T> {
    inner: Arc<Inner<K, T>>,
}

impl<K, T> Clone for WorkQueue<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T> WorkQueue<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Coalesce + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    order: VecDeque::new(),
                    pending: HashMap::new(),
                    processing: HashSet::new(),
                    retrying: HashMap::new(),
                    next_seq: 0,
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K, T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a payload for `key`. Returns false once the queue is shut down.
    ///
    /// A retry still waiting out its delay and any payload already pending
    /// for the key are folded into the new one, oldest first. The result is
    /// a fresh task with no requeues.
    pub fn add(&self, key: K, payload: T) -> bool {
        let mut state = self.lock();
        if state.shutting_down {
            return false;
        }

        let mut merged: Option<T> = None;
        if let Some(retry) = state.retrying.remove(&key) {
            debug!("Folding pending retry into new notification");
            merged = Some(retry.payload);
        }
        if let Some(queued) = state.pending.remove(&key) {
            merged = Some(match merged {
                Some(older) => older.coalesce(queued.payload),
                None => queued.payload,
            });
        }
        let payload = match merged {
            Some(older) => older.coalesce(payload),
            None => payload,
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        let task = Task {
            key,
            payload,
            seq,
            requeues: 0,
        };
        self.enqueue(&mut state, task);
        true
    }

    fn enqueue(&self, state: &mut State<K, T>, task: Task<K, T>) {
        let key = task.key.clone();
        let fresh = state.pending.insert(key.clone(), task).is_none();
        if fresh && !state.processing.contains(&key) && !state.order.contains(&key) {
            state.order.push_back(key);
            self.inner.notify.notify_one();
        }
    }

    /// Wait for the next task. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<Task<K, T>> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                while let Some(key) = state.order.pop_front() {
                    if let Some(task) = state.pending.remove(&key) {
                        state.processing.insert(key);
                        return Some(task);
                    }
                }
            }
            notified.await;
        }
    }

    /// Mark a task as finished. A payload queued for the same key while it
    /// was processing becomes ready.
    pub fn done(&self, task: &Task<K, T>) {
        let mut state = self.lock();
        state.processing.remove(&task.key);
        if state.pending.contains_key(&task.key) && !state.order.contains(&task.key) {
            state.order.push_back(task.key.clone());
            self.inner.notify.notify_one();
        }
    }

    /// Stop retrying the task
    pub fn forget(&self, task: &Task<K, T>) {
        let mut state = self.lock();
        if state.retrying.get(&task.key).map(|t| t.seq) == Some(task.seq) {
            state.retrying.remove(&task.key);
        }
    }

    /// How many times this task's payload has been requeued
    pub fn num_requeues(&self, task: &Task<K, T>) -> u32 {
        task.requeues
    }

    /// Count a retry for the task and re-add it after `delay`
    pub fn requeue(&self, mut task: Task<K, T>, delay: Duration) {
        task.requeues += 1;
        self.add_after(task, delay);
    }

    /// Re-add a task after `delay` without blocking the caller.
    ///
    /// If a newer payload for the key is already pending, the task is folded
    /// into it right away. A newer payload arriving during the delay absorbs
    /// the task the same way, and the timer then finds nothing to do.
    pub fn add_after(&self, task: Task<K, T>, delay: Duration) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }

        if let Some(queued) = state.pending.remove(&task.key) {
            debug!("Folding retry into pending notification");
            let merged = Task {
                key: queued.key,
                payload: task.payload.coalesce(queued.payload),
                seq: queued.seq,
                requeues: 0,
            };
            state.pending.insert(merged.key.clone(), merged);
            return;
        }

        let key = task.key.clone();
        let seq = task.seq;
        state.retrying.insert(key.clone(), task);
        drop(state);

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.fire_retry(&key, seq);
        });
    }

    fn fire_retry(&self, key: &K, seq: u64) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.retrying.get(key).map(|t| t.seq) != Some(seq) {
            return;
        }
        if let Some(task) = state.retrying.remove(key) {
            self.enqueue(&mut state, task);
        }
    }

    /// Stop accepting work and release any waiting `get`
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.retrying.clear();
        drop(state);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of tasks waiting to be handed out
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of failed tasks waiting out their retry delay
    pub fn retrying(&self) -> usize {
        self.lock().retrying.len()
    }
}

impl<K, T> Default for WorkQueue<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Coalesce + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Payload(u32);

    impl Coalesce for Payload {
        fn coalesce(self, newer: Self) -> Self {
            newer
        }
    }

    fn queue() -> WorkQueue<&'static str, Payload> {
        WorkQueue::new()
    }

    #[tokio::test]
    async fn test_fifo_order_across_keys() {
        let q = queue();
        q.add("a", Payload(1));
        q.add("b", Payload(2));
        q.add("c", Payload(3));

        let keys: Vec<_> = [q.get().await, q.get().await, q.get().await]
            .into_iter()
            .map(|t| t.unwrap().key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_same_key_collapses_to_latest_payload() {
        let q = queue();
        q.add("a", Payload(1));
        q.add("a", Payload(2));
        assert_eq!(q.len(), 1);

        let task = q.get().await.unwrap();
        assert_eq!(task.payload, Payload(2));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_key_in_flight_is_held_until_done() {
        let q = queue();
        q.add("a", Payload(1));
        let first = q.get().await.unwrap();

        q.add("a", Payload(2));
        q.add("b", Payload(3));

        // "a" is still processing, so "b" comes first
        let next = q.get().await.unwrap();
        assert_eq!(next.key, "b");

        q.done(&first);
        let again = q.get().await.unwrap();
        assert_eq!(again.key, "a");
        assert_eq!(again.payload, Payload(2));
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiting_get() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shut_down();
        assert!(waiter.await.unwrap().is_none());
        assert!(!q.add("a", Payload(1)));
        assert!(q.is_shutting_down());
    }

    /// Payload that keeps every merged value
    #[derive(Debug, Clone, PartialEq)]
    struct History(Vec<u32>);

    impl Coalesce for History {
        fn coalesce(mut self, newer: Self) -> Self {
            self.0.extend(newer.0);
            self
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_counts_and_delays() {
        let q = queue();
        q.add("a", Payload(1));
        let task = q.get().await.unwrap();
        q.done(&task);
        assert_eq!(q.num_requeues(&task), 0);

        q.requeue(task, Duration::from_secs(1));
        assert_eq!(q.retrying(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        let retried = q.get().await.unwrap();
        assert_eq!(retried.payload, Payload(1));
        assert_eq!(q.num_requeues(&retried), 1);
        assert_eq!(q.retrying(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_notification_absorbs_waiting_retry() {
        let q: WorkQueue<&'static str, History> = WorkQueue::new();
        q.add("a", History(vec![1]));
        let task = q.get().await.unwrap();
        q.done(&task);
        q.requeue(task, Duration::from_secs(1));

        q.add("a", History(vec![2]));
        assert_eq!(q.retrying(), 0);

        let merged = q.get().await.unwrap();
        assert_eq!(merged.payload, History(vec![1, 2]));
        assert_eq!(q.num_requeues(&merged), 0);
        q.done(&merged);
        q.forget(&merged);

        // The absorbed retry's timer finds nothing left to re-add
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_folds_into_pending_notification() {
        let q: WorkQueue<&'static str, History> = WorkQueue::new();
        q.add("a", History(vec![1]));
        let task = q.get().await.unwrap();

        // Arrives while the first payload is still being handled
        q.add("a", History(vec![2]));
        q.done(&task);
        q.requeue(task, Duration::from_secs(1));
        assert_eq!(q.retrying(), 0);
        assert_eq!(q.len(), 1);

        let merged = q.get().await.unwrap();
        assert_eq!(merged.payload, History(vec![1, 2]));
        assert_eq!(q.num_requeues(&merged), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_cancels_waiting_retry() {
        let q = queue();
        q.add("a", Payload(1));
        let task = q.get().await.unwrap();
        q.done(&task);
        q.requeue(task.clone(), Duration::from_secs(1));

        q.forget(&task);
        assert_eq!(q.retrying(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(q.is_empty());
    }
}
