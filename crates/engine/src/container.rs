//! Per-job batch container: queued owner mutations over a swap-back arena.
//!
//! Owners register, update and withdraw payloads at any time, but nothing
//! is applied until the next cycle drains the queue. The container keeps an
//! owner lane in lockstep with the kernel's storage lanes plus an
//! owner→index map, so that for every live element `index[owners[i]] == i`.
//! Removal is swap-back: O(1), insertion order is not preserved.
//!
//! Lifecycle: `Idle → start_job → Running → end_job → Idle`, with
//! `Disposed` reachable from any state and terminal.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use jobit_core::{Diagnostic, JobError, Owner, OwnerKey, UnknownRemovePolicy};
use tracing::{debug, warn};

use crate::handle::DependencyHandle;
use crate::pool::WorkerPool;

/// Completion listener attached to a job or an invoker.
pub type Listener = Box<dyn FnMut() + Send>;

/// The per-job parallel computation and its storage lanes.
///
/// The container owns identity and ordering; the kernel owns the payload
/// lanes and must keep them index-aligned with the calls it receives.
pub trait BatchKernel: Send + 'static {
    /// Payload registered for one owner.
    type Data: Clone + Send + 'static;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Append a payload at the tail of every lane.
    fn add_element(&mut self, data: Self::Data);

    /// Remove `index` by moving the last element of every lane into it.
    ///
    /// A plain ordered remove here breaks the owner→index map.
    fn remove_element_swap_back(&mut self, index: usize);

    fn update_element(&mut self, index: usize, data: Self::Data);

    fn read_element(&self, index: usize) -> Option<Self::Data>;

    /// Build and dispatch this cycle's parallel work over the current
    /// lanes, depending on `depends_on`.
    fn schedule_work(
        &mut self,
        pool: &WorkerPool,
        depends_on: &DependencyHandle,
    ) -> Result<DependencyHandle, JobError>;

    /// Called once per cycle after the job's handle joined, before the
    /// job's completion listeners fire.
    fn on_batch_complete(&mut self) {}

    /// Host switch to skip the job, e.g. while paused.
    fn can_run(&self) -> bool {
        true
    }

    /// Free lane storage. Called once, on dispose.
    fn release(&mut self) {}
}

/// Type-erased view of a job used by the invoker and the registry.
pub trait ScheduledJob: Send {
    fn name(&self) -> &str;

    /// Apply queued mutations. Runs at most once per cycle.
    fn pre_start(&mut self);

    fn start_job(&mut self, depends_on: &DependencyHandle) -> Result<DependencyHandle, JobError>;

    /// Join this cycle's work and run the completion hook. Returns the
    /// listeners to fire; the caller fires them after releasing the job
    /// and hands them back through `restore_listeners`. A disposed job
    /// returns none.
    fn finish_cycle(&mut self) -> Vec<Listener>;

    fn restore_listeners(&mut self, listeners: Vec<Listener>);

    fn dispose(&mut self);

    fn is_running(&self) -> bool;

    fn is_disposed(&self) -> bool;

    /// Number of live elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Diagnostics recorded since the last call.
    fn take_diagnostics(&mut self) -> Vec<Diagnostic>;
}

enum Action<T> {
    Add(T),
    Update(T),
    Remove,
}

struct PendingAction<T> {
    owner: Weak<dyn Owner>,
    key: OwnerKey,
    action: Action<T>,
}

fn owner_alive(owner: &Weak<dyn Owner>) -> bool {
    owner.upgrade().is_some_and(|o| o.is_alive())
}

pub struct BatchContainer<K: BatchKernel> {
    kernel: K,
    pool: WorkerPool,
    queue: VecDeque<PendingAction<K::Data>>,
    /// Owner lane, index-aligned with the kernel lanes.
    owners: Vec<OwnerKey>,
    index: HashMap<OwnerKey, usize>,
    handle: DependencyHandle,
    running: bool,
    /// Set once this cycle's queue has been applied.
    drained: bool,
    disposed: bool,
    unknown_remove: UnknownRemovePolicy,
    listeners: Vec<Listener>,
    diagnostics: Vec<Diagnostic>,
}

impl<K: BatchKernel> BatchContainer<K> {
    pub fn new(kernel: K, pool: WorkerPool) -> Self {
        Self::with_capacity(kernel, pool, 0)
    }

    pub fn with_capacity(kernel: K, pool: WorkerPool, capacity: usize) -> Self {
        Self {
            kernel,
            pool,
            queue: VecDeque::new(),
            owners: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            handle: DependencyHandle::completed(),
            running: false,
            drained: false,
            disposed: false,
            unknown_remove: UnknownRemovePolicy::default(),
            listeners: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn set_unknown_remove_policy(&mut self, policy: UnknownRemovePolicy) {
        self.unknown_remove = policy;
    }

    // ── Queued mutation ───────────────────────────────────────

    /// Queue `data` for `owner`. Takes effect on the next cycle; if the
    /// owner is already registered by then, this acts as an update.
    pub fn register_item<O: Owner + 'static>(&mut self, owner: &Arc<O>, data: K::Data) {
        self.enqueue(owner, Action::Add(data));
    }

    /// Queue removal of `owner`. Takes effect on the next cycle.
    pub fn withdraw_item<O: Owner + 'static>(&mut self, owner: &Arc<O>) {
        self.enqueue(owner, Action::Remove);
    }

    /// Queue new data for `owner`. Until the next cycle the kernel keeps
    /// the stale payload.
    pub fn update_item<O: Owner + 'static>(&mut self, owner: &Arc<O>, data: K::Data) {
        self.enqueue(owner, Action::Update(data));
    }

    fn enqueue<O: Owner + 'static>(&mut self, owner: &Arc<O>, action: Action<K::Data>) {
        if self.disposed {
            return;
        }
        let key = owner.owner_key();
        let weak = Arc::downgrade(owner);
        let weak: Weak<dyn Owner> = weak;
        self.queue.push_back(PendingAction { owner: weak, key, action });
    }

    // ── Readback ──────────────────────────────────────────────

    /// Current payload for `owner`, unless the job is mid-cycle or the
    /// owner has no live element.
    pub fn try_read_item<O: Owner + ?Sized>(&self, owner: &O) -> Option<K::Data> {
        self.try_read_key(owner.owner_key())
    }

    pub fn try_read_key(&self, key: OwnerKey) -> Option<K::Data> {
        if self.running {
            warn!(job = %self.kernel.name(), "job is currently running, readback is disabled");
            return None;
        }
        let index = *self.index.get(&key)?;
        self.kernel.read_element(index)
    }

    // ── Cycle ─────────────────────────────────────────────────

    /// Join any previous work and apply the queue. A second call in the
    /// same cycle is a no-op.
    pub fn pre_start(&mut self) {
        if self.disposed || self.drained || !self.kernel.can_run() {
            return;
        }
        self.handle.join();
        self.drain();
        self.drained = true;
    }

    /// Start this cycle's work after `depends_on`.
    ///
    /// A disposed or disabled job passes `depends_on` straight through.
    pub fn start_job(&mut self, depends_on: &DependencyHandle) -> Result<DependencyHandle, JobError> {
        if self.disposed || !self.kernel.can_run() {
            return Ok(depends_on.clone());
        }
        self.pre_start();
        self.drained = false;
        let handle = self.kernel.schedule_work(&self.pool, depends_on)?;
        self.handle = handle.clone();
        self.running = true;
        Ok(handle)
    }

    /// Join this job's work and, unless disposed, run the kernel's
    /// completion hook and then the listeners.
    pub fn end_job(&mut self) {
        let mut listeners = self.finish_cycle();
        for listener in &mut listeners {
            listener();
        }
        self.restore_listeners(listeners);
    }

    /// First half of [`end_job`](Self::end_job): join, run the completion
    /// hook and hand the listeners out so the caller can fire them without
    /// holding this job. Hand them back with
    /// [`restore_listeners`](Self::restore_listeners).
    pub fn finish_cycle(&mut self) -> Vec<Listener> {
        self.handle.join();
        self.running = false;
        self.drained = false;
        if self.disposed {
            return Vec::new();
        }
        self.kernel.on_batch_complete();
        std::mem::take(&mut self.listeners)
    }

    /// Put fired listeners back ahead of any subscribed while they ran.
    pub fn restore_listeners(&mut self, mut listeners: Vec<Listener>) {
        if self.disposed {
            return;
        }
        listeners.append(&mut self.listeners);
        self.listeners = listeners;
    }

    /// Release everything. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.end_job();
        self.queue.clear();
        self.queue.shrink_to_fit();
        self.owners.clear();
        self.owners.shrink_to_fit();
        self.index.clear();
        self.index.shrink_to_fit();
        self.kernel.release();
        self.listeners.clear();
        debug!(job = %self.kernel.name(), "job disposed");
    }

    // ── Drain ─────────────────────────────────────────────────

    fn drain(&mut self) {
        let queued = self.queue.len();
        while let Some(pending) = self.queue.pop_front() {
            let key = pending.key;
            let current = self.index.get(&key).copied();

            if !owner_alive(&pending.owner) {
                if let Some(index) = current {
                    self.remove_swap_back(index);
                }
                continue;
            }

            match (pending.action, current) {
                (Action::Remove, Some(index)) => self.remove_swap_back(index),
                (Action::Remove, None) => {
                    warn!(job = %self.kernel.name(), key = %key, "attempted to remove a non-existing job element");
                    self.record(|job| Diagnostic::UnknownRemove { job, key });
                    if self.unknown_remove == UnknownRemovePolicy::AbortPreserve {
                        debug!(
                            job = %self.kernel.name(),
                            remaining = self.queue.len(),
                            "drain stopped, remaining actions wait for the next cycle"
                        );
                        break;
                    }
                }
                (Action::Add(data) | Action::Update(data), Some(index)) => {
                    self.kernel.update_element(index, data);
                }
                (Action::Add(data), None) => self.insert(key, data),
                (Action::Update(_), None) => {
                    warn!(job = %self.kernel.name(), key = %key, "attempted to update an unregistered job element");
                    self.record(|job| Diagnostic::UnknownUpdate { job, key });
                }
            }
        }
        if queued > 0 {
            debug!(job = %self.kernel.name(), queued, live = self.owners.len(), "queue drained");
        }
        self.debug_check_index();
    }

    fn insert(&mut self, key: OwnerKey, data: K::Data) {
        self.kernel.add_element(data);
        self.owners.push(key);
        self.index.insert(key, self.owners.len() - 1);
    }

    /// O(1) removal: the last element moves into `index`.
    fn remove_swap_back(&mut self, index: usize) {
        self.kernel.remove_element_swap_back(index);
        let removed = self.owners.swap_remove(index);
        self.index.remove(&removed);
        if let Some(&moved) = self.owners.get(index) {
            self.index.insert(moved, index);
        }
    }

    fn record(&mut self, make: impl FnOnce(String) -> Diagnostic) {
        let job = self.kernel.name().to_string();
        self.diagnostics.push(make(job));
    }

    fn debug_check_index(&self) {
        debug_assert_eq!(
            self.owners.len(),
            self.index.len(),
            "owner lane and index map diverged"
        );
        debug_assert!(
            self.owners
                .iter()
                .enumerate()
                .all(|(i, key)| self.index.get(key) == Some(&i)),
            "owner index map points at the wrong slot"
        );
    }

    // ── Accessors ─────────────────────────────────────────────

    /// Number of live elements.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Actions waiting for the next drain.
    pub fn pending_actions(&self) -> usize {
        self.queue.len()
    }

    pub fn owner_at(&self, index: usize) -> Option<OwnerKey> {
        self.owners.get(index).copied()
    }

    pub fn index_of(&self, key: OwnerKey) -> Option<usize> {
        self.index.get(&key).copied()
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    /// Handle of the most recently started work.
    pub fn current_handle(&self) -> &DependencyHandle {
        &self.handle
    }

    /// Listener fired at the end of every cycle, once data is safe to read.
    pub fn subscribe_complete(&mut self, listener: impl FnMut() + Send + 'static) {
        if self.disposed {
            return;
        }
        self.listeners.push(Box::new(listener));
    }

    /// Diagnostics recorded since the last call.
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}

impl<K: BatchKernel> ScheduledJob for BatchContainer<K> {
    fn name(&self) -> &str {
        self.kernel.name()
    }

    fn pre_start(&mut self) {
        BatchContainer::pre_start(self);
    }

    fn start_job(&mut self, depends_on: &DependencyHandle) -> Result<DependencyHandle, JobError> {
        BatchContainer::start_job(self, depends_on)
    }

    fn finish_cycle(&mut self) -> Vec<Listener> {
        BatchContainer::finish_cycle(self)
    }

    fn restore_listeners(&mut self, listeners: Vec<Listener>) {
        BatchContainer::restore_listeners(self, listeners);
    }

    fn dispose(&mut self) {
        BatchContainer::dispose(self);
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn len(&self) -> usize {
        self.owners.len()
    }

    fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        BatchContainer::take_diagnostics(self)
    }
}

impl<K: BatchKernel> Drop for BatchContainer<K> {
    fn drop(&mut self) {
        self.dispose();
    }
}
