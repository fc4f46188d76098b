//! Completion strategies: when an invoker's in-flight cycle is finished.
//!
//! The invoker hands its combined handle to a strategy after dispatch. The
//! host driver later calls [`CompletionStrategy::resolve`] at its join
//! point; on success the strategy runs the invoker's end-of-cycle hook and
//! then the subscribed listeners, exactly once per handle.

use jobit_core::CompletionMode;

use crate::container::Listener;
use crate::handle::DependencyHandle;

pub trait CompletionStrategy: Send {
    /// Track the handle of a newly dispatched cycle.
    fn set_handle(&mut self, handle: DependencyHandle);

    /// Whether a handle is set and not yet resolved.
    fn is_pending(&self) -> bool;

    /// Try to finish the pending cycle.
    ///
    /// On success `before_notify` runs first, then every listener, and the
    /// handle is cleared. Returns false when nothing was resolved.
    fn resolve(&mut self, before_notify: &mut dyn FnMut()) -> bool;

    fn subscribe(&mut self, listener: Listener);
}

/// Build the strategy for `mode`.
pub fn for_mode(mode: CompletionMode) -> Box<dyn CompletionStrategy> {
    match mode {
        CompletionMode::Join => Box::new(JoinOnResolve::default()),
        CompletionMode::WhenReady => Box::new(ResolveWhenReady::default()),
    }
}

#[derive(Default)]
struct PendingCompletion {
    handle: Option<DependencyHandle>,
    listeners: Vec<Listener>,
}

impl PendingCompletion {
    fn finish(&mut self, before_notify: &mut dyn FnMut()) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        handle.join();
        before_notify();
        for listener in &mut self.listeners {
            listener();
        }
        true
    }
}

/// Blocks on the handle whenever resolution is requested.
#[derive(Default)]
pub struct JoinOnResolve {
    pending: PendingCompletion,
}

impl CompletionStrategy for JoinOnResolve {
    fn set_handle(&mut self, handle: DependencyHandle) {
        self.pending.handle = Some(handle);
    }

    fn is_pending(&self) -> bool {
        self.pending.handle.is_some()
    }

    fn resolve(&mut self, before_notify: &mut dyn FnMut()) -> bool {
        self.pending.finish(before_notify)
    }

    fn subscribe(&mut self, listener: Listener) {
        self.pending.listeners.push(listener);
    }
}

/// Resolves only once the work has already finished; never blocks.
#[derive(Default)]
pub struct ResolveWhenReady {
    pending: PendingCompletion,
}

impl CompletionStrategy for ResolveWhenReady {
    fn set_handle(&mut self, handle: DependencyHandle) {
        self.pending.handle = Some(handle);
    }

    fn is_pending(&self) -> bool {
        self.pending.handle.is_some()
    }

    fn resolve(&mut self, before_notify: &mut dyn FnMut()) -> bool {
        match &self.pending.handle {
            Some(handle) if handle.is_complete() => self.pending.finish(before_notify),
            _ => false,
        }
    }

    fn subscribe(&mut self, listener: Listener) {
        self.pending.listeners.push(listener);
    }
}
