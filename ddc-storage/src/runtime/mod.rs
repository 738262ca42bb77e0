//! Shared cache runtime.
//!
//! Replaces process-wide state with one explicit object shared by `Arc`:
//! the priority work queue, a counter of outstanding background tasks, and
//! the shutdown flag. Backends built from the same graph share a runtime.

mod owner;
mod work_queue;

pub use owner::{Request, RequestOwner};
pub use work_queue::{QueuedWork, WorkQueue};

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ddc_core::{BackendError, DdcResult, RuntimeConfig};
use tokio::runtime::Handle;
use tokio::sync::Notify;

pub struct CacheRuntime {
    handle: Handle,
    config: RuntimeConfig,
    queue: Arc<WorkQueue>,
    outstanding: AtomicUsize,
    idle: Notify,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for CacheRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRuntime")
            .field("workers", &self.config.worker_count)
            .field("outstanding", &self.outstanding())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Decrements the outstanding counter when dropped, even if the task panics.
struct TaskGuard {
    runtime: Arc<CacheRuntime>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.runtime.end_task();
    }
}

impl CacheRuntime {
    /// Build a runtime on the ambient tokio runtime.
    pub fn new(config: RuntimeConfig) -> DdcResult<Arc<Self>> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|e| BackendError::RuntimeUnavailable {
            reason: e.to_string(),
        })?;
        Ok(Self::with_handle(handle, config))
    }

    pub fn with_handle(handle: Handle, config: RuntimeConfig) -> Arc<Self> {
        let queue = WorkQueue::start(&handle, config.worker_count);
        tracing::debug!(workers = config.worker_count, "Cache runtime started");
        Arc::new(Self {
            handle,
            config,
            queue,
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn has_workers(&self) -> bool {
        self.queue.worker_count() > 0
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn begin_task(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_task(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Spawn a background task counted until it completes.
    pub fn spawn_tracked<F>(self: &Arc<Self>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.begin_task();
        let guard = TaskGuard {
            runtime: Arc::clone(self),
        };
        self.handle.spawn(async move {
            let _guard = guard;
            future.await;
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// New write-behind work to remote tiers is abandoned from now on.
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            tracing::info!(outstanding = self.outstanding(), "Cache runtime shutting down");
        }
    }

    /// Wait until no background task or queued request is outstanding.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Begin shutdown, drain outstanding work and stop the workers.
    pub async fn shutdown(&self) {
        self.begin_shutdown();
        self.wait_for_idle().await;
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_without_runtime_fails() {
        let err = CacheRuntime::new(RuntimeConfig::default()).expect_err("no ambient runtime");
        assert!(matches!(
            err,
            ddc_core::DdcError::Backend(BackendError::RuntimeUnavailable { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_for_idle_tracks_spawned_tasks() {
        let runtime = CacheRuntime::new(RuntimeConfig::default().with_worker_count(1))
            .expect("runtime");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        runtime.spawn_tracked(async move {
            let _ = rx.await;
        });
        assert_eq!(runtime.outstanding(), 1);

        let waiter = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.wait_for_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.send(()).expect("task still waiting");
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("idle in time")
            .expect("waiter panicked");
        assert_eq!(runtime.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_sets_flag() {
        let runtime = CacheRuntime::new(RuntimeConfig::default().with_worker_count(0))
            .expect("runtime");
        assert!(!runtime.has_workers());
        runtime.shutdown().await;
        assert!(runtime.is_shutting_down());
    }
}
