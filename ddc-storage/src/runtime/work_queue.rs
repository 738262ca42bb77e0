//! Priority work queue drained by a fixed set of tokio worker tasks.
//!
//! Entries are ordered by priority, then FIFO. Re-queuing the same work at a
//! new priority leaves the old entry in place; work items must ignore
//! executions after the first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ddc_core::Priority;
use tokio::runtime::Handle;
use tokio::sync::Notify;

/// Work that can be executed by a queue worker.
#[async_trait]
pub trait QueuedWork: Send + Sync {
    async fn execute_queued(self: Arc<Self>);
}

struct QueuedEntry {
    priority: Priority,
    sequence: u64,
    work: Arc<dyn QueuedWork>,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    // Max-heap: higher priority first, then lower sequence first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedEntry>,
    next_sequence: u64,
    closed: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    available: Notify,
    worker_count: usize,
}

impl WorkQueue {
    /// Create the queue and spawn `worker_count` workers on `handle`.
    pub fn start(handle: &Handle, worker_count: usize) -> Arc<Self> {
        let queue = Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            worker_count,
        });
        for worker in 0..worker_count {
            let queue = Arc::clone(&queue);
            handle.spawn(async move {
                while let Some(work) = queue.pop().await {
                    work.execute_queued().await;
                }
                tracing::trace!(worker, "Cache worker exiting");
            });
        }
        queue
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue `work`. Returns false once the queue is closed.
    pub fn push(&self, work: Arc<dyn QueuedWork>, priority: Priority) -> bool {
        {
            let mut state = self.state();
            if state.closed {
                return false;
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.heap.push(QueuedEntry {
                priority,
                sequence,
                work,
            });
        }
        self.available.notify_one();
        true
    }

    /// Next entry, or `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Arc<dyn QueuedWork>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(entry) = state.heap.pop() {
                    return Some(entry.work);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.state().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting work; workers exit once the heap is drained.
    pub fn close(&self) {
        self.state().closed = true;
        self.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct Tagged {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl QueuedWork for Tagged {
        async fn execute_queued(self: Arc<Self>) {
            self.runs.fetch_add(1, AtomicOrdering::SeqCst);
            self.log.lock().expect("lock").push(self.tag);
        }
    }

    fn tagged(tag: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Tagged> {
        Arc::new(Tagged {
            tag,
            log: Arc::clone(log),
            runs: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        // No workers, so entries are drained by hand.
        let queue = WorkQueue::start(&Handle::current(), 0);
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.push(tagged("low", &log), Priority::Low);
        queue.push(tagged("high-1", &log), Priority::High);
        queue.push(tagged("normal", &log), Priority::Normal);
        queue.push(tagged("high-2", &log), Priority::High);
        assert_eq!(queue.len(), 4);

        queue.close();
        while let Some(work) = queue.pop().await {
            work.execute_queued().await;
        }
        assert_eq!(
            *log.lock().expect("lock"),
            vec!["high-1", "high-2", "normal", "low"]
        );
    }

    #[tokio::test]
    async fn test_push_after_close_is_rejected() {
        let queue = WorkQueue::start(&Handle::current(), 0);
        queue.close();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(!queue.push(tagged("late", &log), Priority::Normal));
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workers_drain_queue() {
        let queue = WorkQueue::start(&Handle::current(), 2);
        let log = Arc::new(Mutex::new(Vec::new()));
        let items: Vec<_> = (0..8).map(|_| tagged("item", &log)).collect();
        for item in &items {
            assert!(queue.push(item.clone(), Priority::Normal));
        }

        for _ in 0..200 {
            if log.lock().expect("lock").len() == items.len() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(items.iter().all(|i| i.runs.load(AtomicOrdering::SeqCst) == 1));
        queue.close();
    }
}
