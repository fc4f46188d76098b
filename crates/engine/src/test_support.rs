//! Mocks shared by the unit tests.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use jobit_core::{JobError, Owner, OwnerKey};
use rayon::prelude::*;

use crate::container::{BatchContainer, BatchKernel};
use crate::handle::DependencyHandle;
use crate::lane::SharedLane;
use crate::pool::WorkerPool;

/// Owner whose liveness the test controls.
pub(crate) struct MockOwner {
    key: OwnerKey,
    alive: AtomicBool,
}

impl MockOwner {
    pub(crate) fn new(key: u64) -> Arc<Self> {
        Arc::new(Self {
            key: OwnerKey(key),
            alive: AtomicBool::new(true),
        })
    }

    /// Mark the owner as destroyed without dropping it.
    pub(crate) fn retire(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl Owner for MockOwner {
    fn owner_key(&self) -> OwnerKey {
        self.key
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KernelMode {
    Normal,
    /// `schedule_work` returns an error.
    Fail,
    /// `schedule_work` panics.
    Panic,
    /// `can_run` is false.
    Disabled,
    /// `add_element` panics, so the queue drain fails.
    PanicOnAdd,
}

/// Doubles every value in parallel each cycle.
///
/// `M` only distinguishes job types for the registry.
pub(crate) struct DoublingKernel<M = ()> {
    pub(crate) name: String,
    pub(crate) values: SharedLane<i32>,
    pub(crate) completions: usize,
    pub(crate) released: bool,
    pub(crate) mode: KernelMode,
    _marker: PhantomData<fn() -> M>,
}

impl<M> DoublingKernel<M> {
    pub(crate) fn new(name: &str) -> Self {
        Self::with_mode(name, KernelMode::Normal)
    }

    pub(crate) fn with_mode(name: &str, mode: KernelMode) -> Self {
        Self {
            name: name.to_string(),
            values: SharedLane::new(),
            completions: 0,
            released: false,
            mode,
            _marker: PhantomData,
        }
    }
}

impl<M: 'static> BatchKernel for DoublingKernel<M> {
    type Data = i32;

    fn name(&self) -> &str {
        &self.name
    }

    fn add_element(&mut self, data: i32) {
        if self.mode == KernelMode::PanicOnAdd {
            panic!("{} panicked while adding {data}", self.name);
        }
        self.values.push(data);
    }

    fn remove_element_swap_back(&mut self, index: usize) {
        self.values.swap_remove(index);
    }

    fn update_element(&mut self, index: usize, data: i32) {
        self.values.set(index, data);
    }

    fn read_element(&self, index: usize) -> Option<i32> {
        self.values.get(index)
    }

    fn schedule_work(
        &mut self,
        pool: &WorkerPool,
        depends_on: &DependencyHandle,
    ) -> Result<DependencyHandle, JobError> {
        match self.mode {
            KernelMode::Fail => return Err(JobError::Schedule(format!("{} refused to schedule", self.name))),
            KernelMode::Panic => panic!("{} panicked while scheduling", self.name),
            KernelMode::Normal | KernelMode::Disabled | KernelMode::PanicOnAdd => {}
        }
        let values = self.values.clone();
        Ok(pool.schedule(depends_on, move || {
            values.write().par_iter_mut().for_each(|v| *v *= 2);
        }))
    }

    fn on_batch_complete(&mut self) {
        self.completions += 1;
    }

    fn can_run(&self) -> bool {
        self.mode != KernelMode::Disabled
    }

    fn release(&mut self) {
        self.values.clear_and_release();
        self.released = true;
    }
}

pub(crate) fn test_pool() -> WorkerPool {
    static POOL: OnceLock<WorkerPool> = OnceLock::new();
    POOL.get_or_init(|| WorkerPool::with_threads(4).expect("test pool"))
        .clone()
}

pub(crate) fn doubling_container(name: &str) -> BatchContainer<DoublingKernel> {
    BatchContainer::new(DoublingKernel::new(name), test_pool())
}

/// One standalone start/end cycle with no dependency.
pub(crate) fn run_cycle<K: BatchKernel>(container: &mut BatchContainer<K>) {
    container
        .start_job(&DependencyHandle::completed())
        .expect("cycle start");
    container.end_job();
}
