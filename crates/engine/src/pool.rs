//! Worker pool that runs scheduled work once its dependency completes.
//!
//! Work is never parked on a worker thread waiting for its dependency.
//! It is spawned onto the pool by a continuation on the dependency handle,
//! so a long dependency chain cannot starve the pool.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use jobit_core::{EngineConfig, JobError};
use tracing::{debug, error};

use crate::handle::DependencyHandle;

/// Shared handle to the rayon pool that executes batch work.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<rayon::ThreadPool>,
    threads: usize,
}

impl WorkerPool {
    pub fn new(config: &EngineConfig) -> Result<Self, JobError> {
        let threads = config.resolved_worker_threads();
        let prefix = config.thread_name_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .map_err(|e| JobError::Config(format!("failed to build worker pool: {e}")))?;
        debug!(threads, "worker pool ready");
        Ok(Self {
            inner: Arc::new(pool),
            threads,
        })
    }

    /// Pool with an explicit thread count and default naming.
    pub fn with_threads(threads: usize) -> Result<Self, JobError> {
        Self::new(&EngineConfig {
            worker_threads: threads,
            ..EngineConfig::default()
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `work` on the pool after `depends_on` completes.
    ///
    /// The returned handle completes once `work` has returned. A panic in
    /// `work` is logged and still completes the handle.
    pub fn schedule<F>(&self, depends_on: &DependencyHandle, work: F) -> DependencyHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (handle, completion) = DependencyHandle::manual();
        let pool = Arc::clone(&self.inner);
        depends_on.when_complete(move || {
            pool.spawn(move || {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
                    error!(panic = %panic_message(payload.as_ref()), "scheduled work panicked");
                }
                completion.complete();
            });
        });
        handle
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("threads", &self.threads).finish()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
