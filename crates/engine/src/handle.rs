//! Dependency handles for in-flight parallel work.
//!
//! A [`DependencyHandle`] is a cheap, cloneable token. Handles combine into
//! one handle meaning "all of these are done", and [`DependencyHandle::join`]
//! blocks the calling thread until the work is complete. Combining never
//! blocks: it counts down through continuations registered on each input.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

type Continuation = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SignalState {
    complete: bool,
    continuations: Vec<Continuation>,
}

/// One-shot completion signal shared by every clone of a handle.
struct Signal {
    state: Mutex<SignalState>,
    done: Condvar,
}

impl Signal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SignalState::default()),
            done: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self) {
        let continuations = {
            let mut state = self.lock();
            if state.complete {
                return;
            }
            state.complete = true;
            std::mem::take(&mut state.continuations)
        };
        self.done.notify_all();
        for continuation in continuations {
            continuation();
        }
    }

    fn is_complete(&self) -> bool {
        self.lock().complete
    }

    fn wait(&self) {
        let mut state = self.lock();
        while !state.complete {
            state = self.done.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn when_complete(&self, continuation: Continuation) {
        {
            let mut state = self.lock();
            if !state.complete {
                state.continuations.push(continuation);
                return;
            }
        }
        continuation();
    }
}

/// Opaque token for in-flight parallel work.
///
/// The default handle is already complete.
#[derive(Clone, Default)]
pub struct DependencyHandle {
    signal: Option<Arc<Signal>>,
}

impl DependencyHandle {
    /// A handle that is already complete.
    pub fn completed() -> Self {
        Self::default()
    }

    /// A pending handle plus the [`Completion`] that resolves it.
    ///
    /// For backends that run work outside the engine's [`WorkerPool`](crate::WorkerPool).
    pub fn manual() -> (Self, Completion) {
        let signal = Signal::new();
        (
            Self { signal: Some(Arc::clone(&signal)) },
            Completion { signal },
        )
    }

    /// Combine handles into one that completes when all inputs have.
    pub fn combine(handles: &[DependencyHandle]) -> Self {
        let pending: Vec<&Arc<Signal>> = handles
            .iter()
            .filter_map(|h| h.signal.as_ref())
            .filter(|s| !s.is_complete())
            .collect();

        match pending.as_slice() {
            [] => Self::completed(),
            [only] => Self { signal: Some(Arc::clone(only)) },
            inputs => {
                let (combined, completion) = Self::manual();
                let completion = Arc::new(Mutex::new(Some(completion)));
                let remaining = Arc::new(AtomicUsize::new(inputs.len()));
                for input in inputs {
                    let completion = Arc::clone(&completion);
                    let remaining = Arc::clone(&remaining);
                    input.when_complete(Box::new(move || {
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            let last = completion
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .take();
                            drop(last);
                        }
                    }));
                }
                combined
            }
        }
    }

    /// Block until the work is complete. Returns immediately if it already is.
    pub fn join(&self) {
        if let Some(signal) = &self.signal {
            signal.wait();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.signal.as_ref().map_or(true, |s| s.is_complete())
    }

    /// Whether both handles track the same piece of work.
    pub fn same_as(&self, other: &DependencyHandle) -> bool {
        match (&self.signal, &other.signal) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Run `f` once the work completes, or right away if it already has.
    ///
    /// `f` runs on whichever thread completes the work.
    pub fn when_complete<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.signal {
            Some(signal) => signal.when_complete(Box::new(f)),
            None => f(),
        }
    }
}

impl std::fmt::Debug for DependencyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyHandle")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Resolves the pending handle it was created with.
///
/// Dropping a `Completion` completes the handle too, so a handle can never
/// be left pending by a worker that bailed out.
pub struct Completion {
    signal: Arc<Signal>,
}

impl Completion {
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.signal.complete();
    }
}
