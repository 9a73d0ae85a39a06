//! Shared min-heap of pending tasks ordered by readiness time.
//!
//! Every configured check keeps exactly one task alive in this queue (or in
//! a worker's hands). The heap is guarded by a plain mutex; each access is
//! O(log n) and never held across an await point.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type Job = Box<dyn FnOnce() -> BoxFuture + Send + 'static>;

/// A queued unit of work.
pub struct Task {
    pub ready_at: DateTime<Utc>,
    seq: u64,
    run: Job,
}

impl Task {
    /// Consume the task and produce the future that performs it.
    pub fn run(self) -> BoxFuture {
        (self.run)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("ready_at", &self.ready_at)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

// BinaryHeap is a max-heap; invert so the earliest `ready_at` sits on top.
// Equal timestamps pop in insertion order.
impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Task {}

struct Inner {
    heap: Mutex<BinaryHeap<Task>>,
    seq: AtomicU64,
    wake: Notify,
}

/// Cloneable handle to the shared task queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                heap: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                wake: Notify::new(),
            }),
        }
    }

    // A panic inside a task never happens while the lock is held, but a
    // poisoned heap is still structurally valid, so keep going.
    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Task>> {
        self.inner.heap.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a task that is immediately eligible.
    pub fn enqueue<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.enqueue_at(Utc::now(), f);
    }

    /// Enqueue a task that becomes eligible at `ready_at`.
    pub fn enqueue_at<F, Fut>(&self, ready_at: DateTime<Utc>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let task = Task {
            ready_at,
            seq,
            run: Box::new(move || Box::pin(f()) as BoxFuture),
        };
        self.heap().push(task);
        self.inner.wake.notify_one();
    }

    /// Pop the earliest task if it is due according to the wall clock.
    pub fn pop_if_ready(&self) -> Option<Task> {
        self.pop_ready_at(Utc::now())
    }

    /// Pop the earliest task if `ready_at <= now`; otherwise leave the heap
    /// untouched.
    pub fn pop_ready_at(&self, now: DateTime<Utc>) -> Option<Task> {
        let mut heap = self.heap();
        match heap.peek() {
            Some(task) if task.ready_at <= now => heap.pop(),
            _ => None,
        }
    }

    /// Readiness time of the head of the queue, if any.
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.heap().peek().map(|t| t.ready_at)
    }

    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap().is_empty()
    }

    /// Resolves after the next enqueue (or immediately if one raced ahead).
    pub async fn enqueued(&self) {
        self.inner.wake.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> impl Future<Output = ()> + Send + 'static {
        async {}
    }

    #[test]
    fn test_pops_in_ready_order() {
        let queue = TaskQueue::new();
        let base = Utc::now();
        let offsets = [40, 5, 90, 5, 0, 61, 13];
        for s in offsets {
            queue.enqueue_at(base + Duration::seconds(s), noop);
        }

        let far_future = base + Duration::days(1);
        let mut popped = Vec::new();
        while let Some(task) = queue.pop_ready_at(far_future) {
            popped.push(task.ready_at);
        }

        assert_eq!(popped.len(), offsets.len());
        assert!(popped.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_future_task_is_not_returned_early() {
        let queue = TaskQueue::new();
        let now = Utc::now();
        queue.enqueue_at(now + Duration::seconds(30), noop);

        assert!(queue.pop_ready_at(now).is_none());
        assert!(queue.pop_ready_at(now + Duration::seconds(29)).is_none());
        // Not-ready head must stay queued.
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_ready_at(), Some(now + Duration::seconds(30)));

        let task = queue.pop_ready_at(now + Duration::seconds(30)).unwrap();
        assert_eq!(task.ready_at, now + Duration::seconds(30));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_simulated_clock_releases_tasks_gradually() {
        let queue = TaskQueue::new();
        let base = Utc::now();
        for s in [10, 20, 30] {
            queue.enqueue_at(base + Duration::seconds(s), noop);
        }

        let mut clock = base;
        let mut released = Vec::new();
        for _ in 0..40 {
            clock += Duration::seconds(1);
            while let Some(task) = queue.pop_ready_at(clock) {
                assert!(task.ready_at <= clock);
                released.push((task.ready_at, clock));
            }
        }

        assert_eq!(released.len(), 3);
        for (ready_at, popped_at) in released {
            assert_eq!(ready_at, popped_at);
        }
    }

    #[test]
    fn test_enqueue_defaults_to_now() {
        let queue = TaskQueue::new();
        queue.enqueue(noop);
        assert!(queue.pop_if_ready().is_some());
    }

    #[test]
    fn test_equal_ready_at_pops_fifo() {
        let queue = TaskQueue::new();
        let at = Utc::now();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            queue.enqueue_at(at, move || async move {
                order.lock().unwrap().push(i);
            });
        }

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        while let Some(task) = queue.pop_ready_at(at) {
            rt.block_on(task.run());
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_task_run_executes_closure() {
        let queue = TaskQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        queue.enqueue(move || async move {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        queue.pop_if_ready().unwrap().run().await;
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }
}
