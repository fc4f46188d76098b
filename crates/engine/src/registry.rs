//! Process-wide routing from job type to its single live instance.
//!
//! The first registration for a job type builds its [`BatchContainer`] and
//! subscribes it to the invoker of the job's [`Phase`] at the job's
//! priority. Every later call for that type is routed to the same instance
//! until [`JobRegistry::clean_all`] tears everything down.
//!
//! Lock order is registry state → invoker → job. The state lock is released
//! before any job or invoker is locked, except while a job is being built.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use jobit_core::{Diagnostic, EngineConfig, JobError, Owner};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::completer;
use crate::container::{BatchContainer, BatchKernel};
use crate::invoker::{PriorityInvoker, SharedJob};
use crate::metrics::CycleReport;
use crate::pool::WorkerPool;

/// Host phase an invoker is driven from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// The main per-tick update.
    Update,
    /// After every `Update` phase job has been started.
    LateUpdate,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Update => write!(f, "update"),
            Phase::LateUpdate => write!(f, "late_update"),
        }
    }
}

/// A kernel the registry knows how to build and schedule.
pub trait RegisteredJob: BatchKernel + Sized {
    /// Band within the phase; lower values run first.
    const PRIORITY: i32 = 0;
    const PHASE: Phase = Phase::Update;

    fn create(config: &EngineConfig) -> Self;
}

/// Typed handle to a registry-owned job.
pub type JobRef<J> = Arc<Mutex<BatchContainer<J>>>;

pub type SharedInvoker = Arc<Mutex<PriorityInvoker>>;

struct RegistryEntry {
    name: String,
    job: SharedJob,
    /// The same job as a `JobRef<J>`.
    typed: Box<dyn Any + Send + Sync>,
}

struct RegistryState {
    config: EngineConfig,
    pool: Option<WorkerPool>,
    jobs: HashMap<TypeId, RegistryEntry>,
    invokers: HashMap<Phase, SharedInvoker>,
    diagnostics: Vec<Diagnostic>,
}

impl RegistryState {
    fn lookup<J: RegisteredJob>(&self) -> Option<JobRef<J>> {
        self.jobs
            .get(&TypeId::of::<J>())
            .and_then(|entry| entry.typed.downcast_ref::<JobRef<J>>())
            .cloned()
    }

    fn pool(&mut self) -> Result<WorkerPool, JobError> {
        if let Some(pool) = &self.pool {
            return Ok(pool.clone());
        }
        let pool = WorkerPool::new(&self.config)?;
        self.pool = Some(pool.clone());
        Ok(pool)
    }

    fn invoker(&mut self, phase: Phase) -> SharedInvoker {
        let mode = self.config.completion;
        Arc::clone(self.invokers.entry(phase).or_insert_with(|| {
            debug!(phase = %phase, completion = ?mode, "invoker created");
            Arc::new(Mutex::new(PriorityInvoker::new(
                phase.to_string(),
                completer::for_mode(mode),
            )))
        }))
    }

    fn missing<J: RegisteredJob>(&mut self) {
        let job = std::any::type_name::<J>().to_string();
        warn!(job = %job, "job has no live instance");
        self.diagnostics.push(Diagnostic::MissingJob { job });
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct JobRegistry {
    state: Mutex<RegistryState>,
    active: AtomicBool,
}

impl JobRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                config,
                pool: None,
                jobs: HashMap::new(),
                invokers: HashMap::new(),
                diagnostics: Vec::new(),
            }),
            active: AtomicBool::new(false),
        }
    }

    /// Shared registry, configured from `JOBIT_*` environment variables on
    /// first use.
    pub fn global() -> &'static JobRegistry {
        static GLOBAL: OnceLock<JobRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = EngineConfig::from_env().unwrap_or_else(|e| {
                warn!(error = %e, "invalid engine config in environment, using defaults");
                EngineConfig::default()
            });
            JobRegistry::new(config)
        })
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        lock(&self.state)
    }

    // ── Host lifecycle ────────────────────────────────────────

    /// Mark the host as running. Required before `update_job_data`.
    pub fn init(&self) {
        self.state().config.log_summary();
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting updates and dispose every job.
    pub fn teardown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.clean_all();
    }

    /// Dispose everything and start over with `config`.
    pub fn reset(&self, config: EngineConfig) {
        self.clean_all();
        let mut state = self.state();
        state.config = config;
        state.pool = None;
        state.diagnostics.clear();
    }

    // ── Routing ───────────────────────────────────────────────

    /// Queue `data` for `owner` on job `J`, building the job on first use.
    /// Returns false if the owner is already dead or the job could not be
    /// built.
    pub fn register<J, O>(&self, owner: &Arc<O>, data: J::Data) -> bool
    where
        J: RegisteredJob,
        O: Owner + 'static,
    {
        if !owner.is_alive() {
            return false;
        }
        let job = match self.get_or_create::<J>() {
            Ok(job) => job,
            Err(e) => {
                warn!(job = %std::any::type_name::<J>(), error = %e, "failed to create job");
                return false;
            }
        };
        lock(&job).register_item(owner, data);
        true
    }

    /// Queue removal of `owner` from job `J`. Returns false if `J` has no
    /// live instance.
    pub fn withdraw<J, O>(&self, owner: &Arc<O>) -> bool
    where
        J: RegisteredJob,
        O: Owner + 'static,
    {
        let Some(job) = self.lookup_or_report::<J>() else {
            return false;
        };
        lock(&job).withdraw_item(owner);
        true
    }

    /// Queue new data for `owner` on job `J`. Requires an active registry
    /// and a live owner.
    pub fn update_job_data<J, O>(&self, owner: &Arc<O>, data: J::Data) -> bool
    where
        J: RegisteredJob,
        O: Owner + 'static,
    {
        if !self.is_active() {
            warn!(job = %std::any::type_name::<J>(), "registry is not active, update ignored");
            return false;
        }
        if !owner.is_alive() {
            return false;
        }
        let Some(job) = self.lookup_or_report::<J>() else {
            return false;
        };
        lock(&job).update_item(owner, data);
        true
    }

    pub fn get_job_object<J: RegisteredJob>(&self) -> Option<JobRef<J>> {
        self.state().lookup::<J>()
    }

    /// Current payload for `owner` on job `J`. `None` if there is no
    /// instance, the owner is unknown, or the job is mid-cycle.
    pub fn try_read_job_data<J, O>(&self, owner: &O) -> Option<J::Data>
    where
        J: RegisteredJob,
        O: Owner + ?Sized,
    {
        let job = self.get_job_object::<J>()?;
        let guard = lock(&job);
        if guard.is_running() {
            let name = guard.kernel().name().to_string();
            drop(guard);
            warn!(job = %name, "job is currently running, readback is disabled");
            self.state().diagnostics.push(Diagnostic::ReadWhileRunning { job: name });
            return None;
        }
        guard.try_read_item(owner)
    }

    fn lookup_or_report<J: RegisteredJob>(&self) -> Option<JobRef<J>> {
        let mut state = self.state();
        let job = state.lookup::<J>();
        if job.is_none() {
            state.missing::<J>();
        }
        job
    }

    fn get_or_create<J: RegisteredJob>(&self) -> Result<JobRef<J>, JobError> {
        let mut state = self.state();
        if let Some(job) = state.lookup::<J>() {
            return Ok(job);
        }

        let pool = state.pool()?;
        let kernel = J::create(&state.config);
        let name = kernel.name().to_string();
        let mut container = BatchContainer::with_capacity(kernel, pool, state.config.initial_capacity);
        container.set_unknown_remove_policy(state.config.unknown_remove);

        let job: JobRef<J> = Arc::new(Mutex::new(container));
        let shared: SharedJob = job.clone();
        let invoker = state.invoker(J::PHASE);
        lock(&invoker).register_job(Arc::clone(&shared), J::PRIORITY);

        info!(job = %name, phase = %J::PHASE, priority = J::PRIORITY, "job created");
        state.jobs.insert(
            TypeId::of::<J>(),
            RegistryEntry {
                name,
                job: shared,
                typed: Box::new(job.clone()),
            },
        );
        Ok(job)
    }

    // ── Driving ───────────────────────────────────────────────

    pub fn invoker(&self, phase: Phase) -> Option<SharedInvoker> {
        self.state().invokers.get(&phase).cloned()
    }

    /// Dispatch one cycle of `phase`. `None` if the phase has no jobs or
    /// its previous cycle is unresolved.
    pub fn run_phase(&self, phase: Phase) -> Option<CycleReport> {
        let invoker = self.invoker(phase)?;
        let report = lock(&invoker).run_jobs()?;
        if !report.failed.is_empty() {
            self.state().diagnostics.extend(report.failed.iter().cloned());
        }
        Some(report)
    }

    /// Resolve the in-flight cycle of `phase`.
    pub fn resolve_phase(&self, phase: Phase) -> bool {
        match self.invoker(phase) {
            Some(invoker) => lock(&invoker).resolve(),
            None => false,
        }
    }

    pub fn job_count(&self) -> usize {
        self.state().jobs.len()
    }

    /// Names of the live jobs, sorted.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().jobs.values().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    /// Diagnostics recorded since the last call, including those drained
    /// from every live job.
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        let (mut diagnostics, jobs) = {
            let mut state = self.state();
            let jobs: Vec<SharedJob> = state.jobs.values().map(|e| Arc::clone(&e.job)).collect();
            (std::mem::take(&mut state.diagnostics), jobs)
        };
        for job in &jobs {
            diagnostics.extend(lock(job).take_diagnostics());
        }
        diagnostics
    }

    /// Finish every in-flight cycle, dispose every job and forget them.
    /// A later registration builds a fresh instance.
    pub fn clean_all(&self) {
        let (jobs, invokers) = {
            let mut state = self.state();
            let jobs: Vec<RegistryEntry> = state.jobs.drain().map(|(_, entry)| entry).collect();
            let invokers: Vec<SharedInvoker> = state.invokers.drain().map(|(_, inv)| inv).collect();
            (jobs, invokers)
        };
        for invoker in &invokers {
            lock(invoker).teardown();
        }
        for entry in &jobs {
            lock(&entry.job).dispose();
        }
        if !jobs.is_empty() {
            info!(jobs = jobs.len(), invokers = invokers.len(), "registry cleaned");
        }
    }
}

#[cfg(test)]
mod tests {
    use jobit_core::{OwnerKey, UnknownRemovePolicy};

    use super::*;
    use crate::test_support::{DoublingKernel, MockOwner};

    struct Physics;
    struct Audio;
    struct Camera;

    type PhysicsJob = DoublingKernel<Physics>;
    type AudioJob = DoublingKernel<Audio>;
    type CameraJob = DoublingKernel<Camera>;

    impl RegisteredJob for PhysicsJob {
        fn create(_config: &EngineConfig) -> Self {
            DoublingKernel::new("physics")
        }
    }

    impl RegisteredJob for AudioJob {
        const PRIORITY: i32 = 10;

        fn create(_config: &EngineConfig) -> Self {
            DoublingKernel::new("audio")
        }
    }

    impl RegisteredJob for CameraJob {
        const PHASE: Phase = Phase::LateUpdate;

        fn create(_config: &EngineConfig) -> Self {
            DoublingKernel::new("camera")
        }
    }

    fn registry() -> JobRegistry {
        JobRegistry::new(EngineConfig {
            worker_threads: 2,
            initial_capacity: 16,
            ..EngineConfig::default()
        })
    }

    fn tick(registry: &JobRegistry, phase: Phase) {
        registry.run_phase(phase);
        registry.resolve_phase(phase);
    }

    #[test]
    fn first_register_creates_job_once() {
        let registry = registry();
        assert_eq!(registry.job_count(), 0);
        assert!(registry.get_job_object::<PhysicsJob>().is_none());

        let (a, b) = (MockOwner::new(1), MockOwner::new(2));
        assert!(registry.register::<PhysicsJob, _>(&a, 1));
        assert!(registry.register::<PhysicsJob, _>(&b, 2));

        assert_eq!(registry.job_count(), 1);
        let invoker = registry.invoker(Phase::Update).unwrap();
        assert_eq!(invoker.lock().unwrap().job_count(), 1, "job subscribed twice");
        assert_eq!(registry.job_names(), vec!["physics".to_string()]);
    }

    #[test]
    fn register_dead_owner_is_a_noop() {
        let registry = registry();
        let owner = MockOwner::new(1);
        owner.retire();

        assert!(!registry.register::<PhysicsJob, _>(&owner, 1));
        assert_eq!(registry.job_count(), 0, "job built for a dead owner");
    }

    #[test]
    fn full_cycle_reads_back_results() {
        let registry = registry();
        registry.init();
        let (a, b) = (MockOwner::new(1), MockOwner::new(2));
        registry.register::<PhysicsJob, _>(&a, 1);
        registry.register::<PhysicsJob, _>(&b, 5);

        let report = registry.run_phase(Phase::Update).unwrap();
        assert_eq!(report.started, 1);
        assert!(registry.resolve_phase(Phase::Update));

        assert_eq!(registry.try_read_job_data::<PhysicsJob, _>(a.as_ref()), Some(2));
        assert_eq!(registry.try_read_job_data::<PhysicsJob, _>(b.as_ref()), Some(10));
    }

    #[test]
    fn withdraw_without_instance_reports() {
        let registry = registry();
        let owner = MockOwner::new(1);

        assert!(!registry.withdraw::<PhysicsJob, _>(&owner));
        let diagnostics = registry.take_diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert!(matches!(diagnostics[0], Diagnostic::MissingJob { .. }));
    }

    #[test]
    fn withdraw_removes_after_next_cycle() {
        let registry = registry();
        let owner = MockOwner::new(1);
        registry.register::<PhysicsJob, _>(&owner, 1);
        tick(&registry, Phase::Update);

        assert!(registry.withdraw::<PhysicsJob, _>(&owner));
        tick(&registry, Phase::Update);

        assert_eq!(registry.try_read_job_data::<PhysicsJob, _>(owner.as_ref()), None);
        let job = registry.get_job_object::<PhysicsJob>().unwrap();
        assert!(job.lock().unwrap().is_empty());
    }

    #[test]
    fn update_requires_active_registry() {
        let registry = registry();
        let owner = MockOwner::new(1);
        registry.register::<PhysicsJob, _>(&owner, 1);
        tick(&registry, Phase::Update);

        assert!(!registry.update_job_data::<PhysicsJob, _>(&owner, 7), "update accepted while inactive");

        registry.init();
        assert!(registry.update_job_data::<PhysicsJob, _>(&owner, 7));
        tick(&registry, Phase::Update);
        assert_eq!(registry.try_read_job_data::<PhysicsJob, _>(owner.as_ref()), Some(14));
    }

    #[test]
    fn update_without_instance_reports() {
        let registry = registry();
        registry.init();
        let owner = MockOwner::new(1);

        assert!(!registry.update_job_data::<AudioJob, _>(&owner, 3));
        assert!(matches!(
            registry.take_diagnostics().as_slice(),
            [Diagnostic::MissingJob { .. }]
        ));
    }

    #[test]
    fn read_while_running_is_refused() {
        let registry = registry();
        let owner = MockOwner::new(1);
        registry.register::<PhysicsJob, _>(&owner, 1);

        registry.run_phase(Phase::Update).unwrap();
        assert_eq!(registry.try_read_job_data::<PhysicsJob, _>(owner.as_ref()), None);
        registry.resolve_phase(Phase::Update);
        assert_eq!(registry.try_read_job_data::<PhysicsJob, _>(owner.as_ref()), Some(2));

        assert!(matches!(
            registry.take_diagnostics().as_slice(),
            [Diagnostic::ReadWhileRunning { .. }]
        ));
    }

    #[test]
    fn job_priority_comes_from_trait() {
        let registry = registry();
        let owner = MockOwner::new(1);
        registry.register::<AudioJob, _>(&owner, 1);
        registry.register::<PhysicsJob, _>(&owner, 1);

        let invoker = registry.invoker(Phase::Update).unwrap();
        let invoker = invoker.lock().unwrap();
        assert_eq!(invoker.priorities(), vec![0, 10]);
        assert_eq!(invoker.job_names(), vec!["physics", "audio"]);
    }

    #[test]
    fn phases_are_driven_independently() {
        let registry = registry();
        let owner = MockOwner::new(1);
        registry.register::<PhysicsJob, _>(&owner, 1);
        registry.register::<CameraJob, _>(&owner, 1);

        tick(&registry, Phase::Update);
        assert_eq!(registry.try_read_job_data::<PhysicsJob, _>(owner.as_ref()), Some(2));
        assert_eq!(
            registry.try_read_job_data::<CameraJob, _>(owner.as_ref()),
            None,
            "late job ran in the update phase"
        );

        tick(&registry, Phase::LateUpdate);
        assert_eq!(registry.try_read_job_data::<CameraJob, _>(owner.as_ref()), Some(2));
    }

    #[test]
    fn config_policy_reaches_containers() {
        let registry = JobRegistry::new(EngineConfig {
            worker_threads: 1,
            unknown_remove: UnknownRemovePolicy::Continue,
            ..EngineConfig::default()
        });
        let (known, stranger) = (MockOwner::new(1), MockOwner::new(2));
        registry.register::<PhysicsJob, _>(&known, 1);
        tick(&registry, Phase::Update);

        registry.withdraw::<PhysicsJob, _>(&stranger);
        let late = MockOwner::new(3);
        registry.register::<PhysicsJob, _>(&late, 4);
        tick(&registry, Phase::Update);

        assert_eq!(registry.try_read_job_data::<PhysicsJob, _>(late.as_ref()), Some(8));
        let job = registry.get_job_object::<PhysicsJob>().unwrap();
        assert_eq!(job.lock().unwrap().index_of(OwnerKey(3)), Some(1));
    }

    #[test]
    fn clean_all_disposes_and_allows_rebuild() {
        let registry = registry();
        let owner = MockOwner::new(1);
        registry.register::<PhysicsJob, _>(&owner, 1);
        registry.register::<CameraJob, _>(&owner, 1);
        registry.run_phase(Phase::Update);
        let old = registry.get_job_object::<PhysicsJob>().unwrap();

        registry.clean_all();
        assert_eq!(registry.job_count(), 0);
        assert!(registry.invoker(Phase::Update).is_none());
        {
            let old = old.lock().unwrap();
            assert!(old.is_disposed());
            assert!(!old.is_running());
        }
        assert!(registry.get_job_object::<PhysicsJob>().is_none());

        registry.register::<PhysicsJob, _>(&owner, 3);
        let fresh = registry.get_job_object::<PhysicsJob>().unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh), "clean_all left a stale instance");
        tick(&registry, Phase::Update);
        assert_eq!(registry.try_read_job_data::<PhysicsJob, _>(owner.as_ref()), Some(6));
    }

    #[test]
    fn teardown_deactivates() {
        let registry = registry();
        registry.init();
        let owner = MockOwner::new(1);
        registry.register::<PhysicsJob, _>(&owner, 1);

        registry.teardown();
        assert!(!registry.is_active());
        assert_eq!(registry.job_count(), 0);
        assert!(registry.run_phase(Phase::Update).is_none());
    }

    #[test]
    fn reset_applies_new_config() {
        let registry = registry();
        let owner = MockOwner::new(1);
        registry.register::<PhysicsJob, _>(&owner, 1);

        registry.reset(EngineConfig {
            worker_threads: 1,
            initial_capacity: 4,
            ..EngineConfig::default()
        });
        assert_eq!(registry.job_count(), 0);
        registry.register::<PhysicsJob, _>(&owner, 1);
        tick(&registry, Phase::Update);
        assert_eq!(registry.try_read_job_data::<PhysicsJob, _>(owner.as_ref()), Some(2));
    }

    #[test]
    fn job_listener_reads_back_through_the_registry() {
        let registry = Arc::new(registry());
        let owner = MockOwner::new(1);
        registry.register::<PhysicsJob, _>(&owner, 4);

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let (weak, seen, owner) = (Arc::downgrade(&registry), Arc::clone(&seen), Arc::clone(&owner));
            let job = registry.get_job_object::<PhysicsJob>().unwrap();
            job.lock().unwrap().subscribe_complete(move || {
                if let Some(registry) = weak.upgrade() {
                    let value = registry.try_read_job_data::<PhysicsJob, _>(owner.as_ref());
                    seen.lock().unwrap().push(value);
                }
            });
        }

        tick(&registry, Phase::Update);
        tick(&registry, Phase::Update);
        assert_eq!(*seen.lock().unwrap(), vec![Some(8), Some(16)]);
        assert!(registry.take_diagnostics().is_empty(), "listener saw the job as running");
    }

    #[test]
    fn global_registry_is_shared() {
        assert!(std::ptr::eq(JobRegistry::global(), JobRegistry::global()));
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Update.to_string(), "update");
        assert_eq!(Phase::LateUpdate.to_string(), "late_update");
    }
}
