//! Request owners.
//!
//! A [`RequestOwner`] carries the priority of a caller's structured requests
//! and tracks the ones still outstanding so they can be waited on, cancelled
//! or re-prioritised together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ddc_core::Priority;

/// An outstanding structured request registered with an owner.
#[async_trait]
pub trait Request: Send + Sync {
    fn id(&self) -> u64;

    /// Re-queue at a new priority if the request has not started.
    fn set_priority(&self, priority: Priority);

    /// Abandon the request if it has not started, otherwise wait for it.
    async fn cancel(&self);

    /// Run the request inline if it has not started, otherwise wait for it.
    async fn wait(&self);
}

struct OwnerInner {
    priority: Mutex<Priority>,
    requests: Mutex<HashMap<u64, Arc<dyn Request>>>,
}

/// Handle shared by every request a caller issues.
#[derive(Clone)]
pub struct RequestOwner {
    inner: Arc<OwnerInner>,
}

impl std::fmt::Debug for RequestOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOwner")
            .field("priority", &self.priority())
            .field("pending", &self.pending())
            .finish()
    }
}

impl RequestOwner {
    pub fn new(priority: Priority) -> Self {
        Self {
            inner: Arc::new(OwnerInner {
                priority: Mutex::new(priority),
                requests: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Owner whose requests run inline on the calling task.
    pub fn blocking() -> Self {
        Self::new(Priority::Blocking)
    }

    fn requests(&self) -> MutexGuard<'_, HashMap<u64, Arc<dyn Request>>> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn priority(&self) -> Priority {
        *self
            .inner
            .priority
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_blocking(&self) -> bool {
        self.priority().is_blocking()
    }

    /// Change the priority and propagate it to every outstanding request.
    pub fn set_priority(&self, priority: Priority) {
        *self
            .inner
            .priority
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = priority;

        let pending: Vec<_> = self.requests().values().cloned().collect();
        for request in pending {
            request.set_priority(priority);
        }
    }

    /// Register an outstanding request.
    pub fn begin(&self, request: Arc<dyn Request>) {
        self.requests().insert(request.id(), request);
    }

    /// Deregister a finished request.
    pub fn end(&self, id: u64) {
        self.requests().remove(&id);
    }

    pub fn pending(&self) -> usize {
        self.requests().len()
    }

    /// Cancel every outstanding request.
    pub async fn cancel(&self) {
        loop {
            let pending: Vec<_> = self.requests().values().cloned().collect();
            if pending.is_empty() {
                return;
            }
            for request in pending {
                request.cancel().await;
            }
        }
    }

    /// Wait for every outstanding request, including ones issued meanwhile.
    pub async fn wait(&self) {
        loop {
            let pending: Vec<_> = self.requests().values().cloned().collect();
            if pending.is_empty() {
                return;
            }
            for request in pending {
                request.wait().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorded {
        id: u64,
        owner: RequestOwner,
        priorities: Mutex<Vec<Priority>>,
        waits: AtomicUsize,
    }

    #[async_trait]
    impl Request for Recorded {
        fn id(&self) -> u64 {
            self.id
        }

        fn set_priority(&self, priority: Priority) {
            self.priorities
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(priority);
        }

        async fn cancel(&self) {
            self.owner.end(self.id);
        }

        async fn wait(&self) {
            self.waits.fetch_add(1, Ordering::SeqCst);
            self.owner.end(self.id);
        }
    }

    fn recorded(id: u64, owner: &RequestOwner) -> Arc<Recorded> {
        Arc::new(Recorded {
            id,
            owner: owner.clone(),
            priorities: Mutex::new(Vec::new()),
            waits: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_blocking_owner() {
        assert!(RequestOwner::blocking().is_blocking());
        assert!(!RequestOwner::new(Priority::Highest).is_blocking());
    }

    #[test]
    fn test_set_priority_propagates() {
        let owner = RequestOwner::new(Priority::Low);
        let request = recorded(1, &owner);
        owner.begin(request.clone());

        owner.set_priority(Priority::High);
        assert_eq!(owner.priority(), Priority::High);
        assert_eq!(
            *request.priorities.lock().expect("lock"),
            vec![Priority::High]
        );
    }

    #[tokio::test]
    async fn test_wait_drains_requests() {
        let owner = RequestOwner::new(Priority::Normal);
        let a = recorded(1, &owner);
        let b = recorded(2, &owner);
        owner.begin(a.clone());
        owner.begin(b.clone());
        assert_eq!(owner.pending(), 2);

        owner.wait().await;
        assert_eq!(owner.pending(), 0);
        assert_eq!(a.waits.load(Ordering::SeqCst), 1);
        assert_eq!(b.waits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_drains_requests() {
        let owner = RequestOwner::new(Priority::Normal);
        owner.begin(recorded(7, &owner));
        owner.cancel().await;
        assert_eq!(owner.pending(), 0);
    }
}
