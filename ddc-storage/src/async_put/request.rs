//! Queued structured requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use ddc_core::{ChunkRequest, CompletionStatus, GetRequest, Priority, PutRequest};
use tokio::sync::watch;

use crate::backend::{CacheBackend, OnChunkComplete, OnGetComplete, OnPutComplete};
use crate::runtime::{CacheRuntime, QueuedWork, Request, RequestOwner};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A batch of structured work and its completion callback.
pub(crate) enum AsyncOperation {
    Put {
        requests: Vec<PutRequest>,
        on_complete: OnPutComplete,
    },
    Get {
        requests: Vec<GetRequest>,
        on_complete: OnGetComplete,
    },
    Chunks {
        requests: Vec<ChunkRequest>,
        on_complete: OnChunkComplete,
    },
}

impl AsyncOperation {
    fn len(&self) -> usize {
        match self {
            Self::Put { requests, .. } => requests.len(),
            Self::Get { requests, .. } => requests.len(),
            Self::Chunks { requests, .. } => requests.len(),
        }
    }

    async fn execute(self, backend: &dyn CacheBackend) {
        // Already on a worker: the inner backend runs inline.
        let owner = RequestOwner::blocking();
        match self {
            Self::Put {
                requests,
                on_complete,
            } => backend.put_records(requests, &owner, on_complete).await,
            Self::Get {
                requests,
                on_complete,
            } => backend.get_records(requests, &owner, on_complete).await,
            Self::Chunks {
                requests,
                on_complete,
            } => backend.get_chunks(requests, &owner, on_complete).await,
        }
    }

    /// Complete every item as canceled.
    fn abandon(self) {
        match self {
            Self::Put {
                requests,
                on_complete,
            } => {
                for request in &requests {
                    on_complete(request.make_response(CompletionStatus::Canceled));
                }
            }
            Self::Get {
                requests,
                on_complete,
            } => {
                for request in &requests {
                    on_complete(request.make_response(None, CompletionStatus::Canceled));
                }
            }
            Self::Chunks {
                requests,
                on_complete,
            } => {
                for request in &requests {
                    on_complete(request.make_response(None, CompletionStatus::Canceled));
                }
            }
        }
    }
}

enum RequestState {
    Queued(AsyncOperation),
    Running,
    Finished,
}

/// A structured request queued for a worker.
///
/// The operation is taken out of the state exactly once, either to run it
/// or to abandon it, so completions fire exactly once per item.
pub struct AsyncRequest {
    id: u64,
    weak_self: Weak<AsyncRequest>,
    backend: Arc<dyn CacheBackend>,
    runtime: Arc<CacheRuntime>,
    owner: RequestOwner,
    state: Mutex<RequestState>,
    done: watch::Sender<bool>,
}

fn queue_priority(priority: Priority) -> Priority {
    priority.min(Priority::Highest)
}

impl AsyncRequest {
    /// Register with `owner` and queue at the owner's priority.
    pub(crate) fn launch(
        backend: Arc<dyn CacheBackend>,
        runtime: Arc<CacheRuntime>,
        owner: &RequestOwner,
        operation: AsyncOperation,
    ) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        let request = Arc::new_cyclic(|weak_self| Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            weak_self: weak_self.clone(),
            backend,
            runtime,
            owner: owner.clone(),
            state: Mutex::new(RequestState::Queued(operation)),
            done,
        });
        request.start(owner.priority());
        request
    }

    fn start(self: &Arc<Self>, priority: Priority) {
        self.runtime.begin_task();
        self.owner.begin(Arc::clone(self) as Arc<dyn Request>);
        let queued = self
            .runtime
            .queue()
            .push(Arc::clone(self) as Arc<dyn QueuedWork>, queue_priority(priority));
        if !queued {
            if let Some(operation) = self.take(RequestState::Finished) {
                tracing::debug!(
                    request = self.id,
                    backend = self.backend.name(),
                    "Work queue closed, abandoning request"
                );
                operation.abandon();
                self.finish();
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_queued(&self) -> bool {
        matches!(*self.state(), RequestState::Queued(_))
    }

    pub fn is_finished(&self) -> bool {
        matches!(*self.state(), RequestState::Finished)
    }

    /// Take the operation if still queued, moving to `next`.
    fn take(&self, next: RequestState) -> Option<AsyncOperation> {
        let mut state = self.state();
        if !matches!(*state, RequestState::Queued(_)) {
            return None;
        }
        match std::mem::replace(&mut *state, next) {
            RequestState::Queued(operation) => Some(operation),
            _ => None,
        }
    }

    async fn run(&self, operation: AsyncOperation) {
        tracing::trace!(
            request = self.id,
            backend = self.backend.name(),
            items = operation.len(),
            "Executing cache request"
        );
        operation.execute(self.backend.as_ref()).await;
        self.finish();
    }

    fn finish(&self) {
        *self.state() = RequestState::Finished;
        self.owner.end(self.id);
        self.done.send_replace(true);
        self.runtime.end_task();
    }

    async fn wait_done(&self) {
        let mut done = self.done.subscribe();
        loop {
            if *done.borrow_and_update() {
                return;
            }
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl QueuedWork for AsyncRequest {
    async fn execute_queued(self: Arc<Self>) {
        // Stale entries left behind by a re-prioritisation find nothing.
        if let Some(operation) = self.take(RequestState::Running) {
            self.run(operation).await;
        }
    }
}

#[async_trait]
impl Request for AsyncRequest {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_priority(&self, priority: Priority) {
        if !self.is_queued() {
            return;
        }
        if let Some(this) = self.weak_self.upgrade() {
            self.runtime
                .queue()
                .push(this as Arc<dyn QueuedWork>, queue_priority(priority));
        }
    }

    async fn cancel(&self) {
        match self.take(RequestState::Finished) {
            Some(operation) => {
                tracing::debug!(
                    request = self.id,
                    backend = self.backend.name(),
                    items = operation.len(),
                    "Cache request canceled before start"
                );
                operation.abandon();
                self.finish();
            }
            None => self.wait_done().await,
        }
    }

    async fn wait(&self) {
        match self.take(RequestState::Running) {
            Some(operation) => self.run(operation).await,
            None => self.wait_done().await,
        }
    }
}
