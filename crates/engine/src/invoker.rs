//! Priority-banded dispatch of one phase's jobs.
//!
//! Jobs are kept sorted ascending by priority (stable for ties). A cycle
//! pre-starts every job, then starts them band by band: all jobs sharing a
//! priority start on the same dependency, and the next band depends on the
//! combined handles of the previous one. Lower priority values run first.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use jobit_core::{Diagnostic, JobError};
use tracing::{debug, warn};

use crate::completer::CompletionStrategy;
use crate::container::ScheduledJob;
use crate::handle::DependencyHandle;
use crate::metrics::{CycleReport, InvokerMetrics};
use crate::pool::panic_message;

/// A job as the invoker sees it.
pub type SharedJob = Arc<Mutex<dyn ScheduledJob>>;

struct OrderedJob {
    priority: i32,
    name: String,
    job: Weak<Mutex<dyn ScheduledJob>>,
}

fn lock_job<'a>(
    job: &'a Mutex<dyn ScheduledJob + 'static>,
) -> MutexGuard<'a, dyn ScheduledJob + 'static> {
    job.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panicked(job: &str, payload: Box<dyn Any + Send>) -> JobError {
    JobError::Panicked {
        job: job.to_string(),
        message: panic_message(payload.as_ref()),
    }
}

fn thin_ptr<T: ?Sized>(ptr: *const T) -> *const () {
    ptr as *const ()
}

pub struct PriorityInvoker {
    name: String,
    jobs: Vec<OrderedJob>,
    running: bool,
    current_dependency: DependencyHandle,
    completer: Box<dyn CompletionStrategy>,
    metrics: InvokerMetrics,
}

impl PriorityInvoker {
    pub fn new(name: impl Into<String>, completer: Box<dyn CompletionStrategy>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
            running: false,
            current_dependency: DependencyHandle::completed(),
            completer,
            metrics: InvokerMetrics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `job` at `priority`. Ties keep registration order.
    ///
    /// The invoker holds the job weakly; dropping the last strong reference
    /// removes it on the next cycle.
    pub fn register_job(&mut self, job: SharedJob, priority: i32) {
        let name = lock_job(&job).name().to_string();
        self.jobs.push(OrderedJob {
            priority,
            name,
            job: Arc::downgrade(&job),
        });
        self.jobs.sort_by_key(|j| j.priority);
        debug!(invoker = %self.name, priority, jobs = self.jobs.len(), "job registered");
    }

    /// Remove `job`. Returns false if it was not registered here.
    pub fn withdraw_job<J: ScheduledJob + ?Sized>(&mut self, job: &Arc<Mutex<J>>) -> bool {
        let target = thin_ptr(Arc::as_ptr(job));
        let before = self.jobs.len();
        self.jobs.retain(|j| thin_ptr(j.job.as_ptr()) != target);
        before != self.jobs.len()
    }

    /// Dispatch one cycle. Returns `None` when there is nothing to run or
    /// the previous cycle has not been resolved yet.
    ///
    /// A job that fails or panics while draining or starting is logged,
    /// recorded in the report, and contributes its band's input dependency
    /// in place of its own handle, so later bands still wait on earlier ones.
    pub fn run_jobs(&mut self) -> Option<CycleReport> {
        if self.running {
            debug!(invoker = %self.name, "previous cycle still in flight, skipping");
            return None;
        }
        let jobs = self.live_jobs();
        if jobs.is_empty() {
            return None;
        }
        let dispatch_started = Instant::now();

        // A job whose drain panics is skipped for the rest of the cycle.
        let pre_start_errors: Vec<Option<JobError>> = jobs
            .iter()
            .map(|(_, name, job)| {
                let mut guard = lock_job(job);
                let drained = panic::catch_unwind(AssertUnwindSafe(|| guard.pre_start()));
                drained.err().map(|payload| panicked(name, payload))
            })
            .collect();

        let mut report = CycleReport::default();
        let mut dependency = DependencyHandle::completed();
        let mut band: Vec<DependencyHandle> = Vec::new();
        let mut band_priority: Option<i32> = None;

        for ((priority, name, job), pre_start_error) in jobs.iter().zip(pre_start_errors) {
            if band_priority != Some(*priority) {
                if band_priority.is_some() {
                    dependency = DependencyHandle::combine(&band);
                    band.clear();
                }
                band_priority = Some(*priority);
                report.bands += 1;
            }

            let outcome = match pre_start_error {
                Some(error) => Err(error),
                None => {
                    let mut guard = lock_job(job);
                    let started =
                        panic::catch_unwind(AssertUnwindSafe(|| guard.start_job(&dependency)));
                    started.unwrap_or_else(|payload| Err(panicked(name, payload)))
                }
            };
            let error = match outcome {
                Ok(handle) => {
                    report.started += 1;
                    band.push(handle);
                    continue;
                }
                Err(e) => e,
            };
            warn!(invoker = %self.name, job = %name, error = %error, "job failed to start");
            report.failed.push(Diagnostic::StartFailed {
                job: name.clone(),
                error: error.to_string(),
            });
            band.push(dependency.clone());
        }

        let handle = DependencyHandle::combine(&band);
        self.current_dependency = handle.clone();
        self.completer.set_handle(handle);
        self.running = true;
        self.metrics.record_cycle(&report, dispatch_started.elapsed());
        debug!(
            invoker = %self.name,
            bands = report.bands,
            started = report.started,
            failed = report.failed.len(),
            "cycle dispatched"
        );
        Some(report)
    }

    /// Ask the completion strategy to finish the in-flight cycle. On
    /// success every job is ended before the invoker's listeners fire.
    /// Each job's own listeners run with that job unlocked, so they may
    /// lock it to read back.
    pub fn resolve(&mut self) -> bool {
        if !self.completer.is_pending() {
            return false;
        }
        let jobs = self.live_jobs();
        let running = &mut self.running;
        let resolved = self.completer.resolve(&mut || {
            *running = false;
            for (_, _, job) in &jobs {
                let mut listeners = lock_job(job).finish_cycle();
                for listener in &mut listeners {
                    listener();
                }
                lock_job(job).restore_listeners(listeners);
            }
        });
        if resolved {
            self.current_dependency = DependencyHandle::completed();
        }
        resolved
    }

    /// Listener fired after every resolved cycle, once all jobs have ended.
    pub fn on_complete(&mut self, listener: impl FnMut() + Send + 'static) {
        self.completer.subscribe(Box::new(listener));
    }

    /// Finish any in-flight cycle and forget every job.
    pub fn teardown(&mut self) {
        self.current_dependency.join();
        self.resolve();
        self.running = false;
        self.jobs.clear();
    }

    fn live_jobs(&mut self) -> Vec<(i32, String, SharedJob)> {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.job.strong_count() > 0);
        if self.jobs.len() != before {
            debug!(invoker = %self.name, pruned = before - self.jobs.len(), "dropped jobs pruned");
        }
        self.jobs
            .iter()
            .filter_map(|j| j.job.upgrade().map(|job| (j.priority, j.name.clone(), job)))
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.job.strong_count() > 0).count()
    }

    /// Priorities in dispatch order.
    pub fn priorities(&self) -> Vec<i32> {
        self.jobs.iter().map(|j| j.priority).collect()
    }

    /// Job names in dispatch order.
    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Combined handle of the in-flight cycle, complete when idle.
    pub fn current_dependency(&self) -> &DependencyHandle {
        &self.current_dependency
    }

    pub fn metrics(&self) -> &InvokerMetrics {
        &self.metrics
    }
}
