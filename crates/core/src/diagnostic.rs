//! Recoverable, non-fatal conditions reported by the engine.
//!
//! None of these cross the public API as errors. They are logged where they
//! happen and collected so callers and tests can inspect what was dropped.

use serde::Serialize;

use crate::owner::OwnerKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A withdraw reached the drain for an owner that was never registered.
    UnknownRemove { job: String, key: OwnerKey },
    /// An update reached the drain for an owner that is not registered.
    UnknownUpdate { job: String, key: OwnerKey },
    /// A job failed or panicked while starting; the rest of the cycle ran.
    StartFailed { job: String, error: String },
    /// A call was routed to a job type that has no live instance.
    MissingJob { job: String },
    /// Readback was attempted while the job was mid-cycle.
    ReadWhileRunning { job: String },
}

impl Diagnostic {
    /// Name of the job the condition was observed on.
    pub fn job(&self) -> &str {
        match self {
            Diagnostic::UnknownRemove { job, .. }
            | Diagnostic::UnknownUpdate { job, .. }
            | Diagnostic::StartFailed { job, .. }
            | Diagnostic::MissingJob { job }
            | Diagnostic::ReadWhileRunning { job } => job,
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::UnknownRemove { job, key } => {
                write!(f, "attempted to remove a non-existing element {key} from {job}")
            }
            Diagnostic::UnknownUpdate { job, key } => {
                write!(f, "attempted to update an unregistered element {key} in {job}")
            }
            Diagnostic::StartFailed { job, error } => write!(f, "failed to start job {job}: {error}"),
            Diagnostic::MissingJob { job } => write!(f, "no live instance of job {job}"),
            Diagnostic::ReadWhileRunning { job } => {
                write!(f, "job {job} is currently running, readback is disabled")
            }
        }
    }
}
