//! Batching engine for dynamic sets of owners.
//!
//! Owners register per-element payloads with a job through the
//! [`JobRegistry`]; each job keeps them in a [`BatchContainer`] whose
//! mutations are queued and applied once per cycle. A [`PriorityInvoker`]
//! starts all its jobs in priority bands, chaining each band on the combined
//! [`DependencyHandle`] of the previous one, and a [`CompletionStrategy`]
//! joins the cycle when the host driver asks for it.

pub mod completer;
pub mod container;
pub mod handle;
pub mod invoker;
pub mod lane;
pub mod metrics;
pub mod pool;
pub mod registry;

#[cfg(test)]
mod test_support;

pub use completer::{CompletionStrategy, JoinOnResolve, ResolveWhenReady};
pub use container::{BatchContainer, BatchKernel, Listener, ScheduledJob};
pub use handle::{Completion, DependencyHandle};
pub use invoker::{PriorityInvoker, SharedJob};
pub use lane::SharedLane;
pub use metrics::{CycleReport, InvokerMetrics};
pub use pool::WorkerPool;
pub use registry::{JobRef, JobRegistry, Phase, RegisteredJob, SharedInvoker};

pub use jobit_core::{
    CompletionMode, Diagnostic, EngineConfig, JobError, Owner, OwnerKey, UnknownRemovePolicy,
};
