use serde::{Deserialize, Serialize};

/// Stable, unique identity of an owner while it is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerKey(pub u64);

impl From<u64> for OwnerKey {
    fn from(value: u64) -> Self {
        OwnerKey(value)
    }
}

impl std::fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// An external entity that batched data is registered on behalf of.
///
/// The engine never owns an owner: it keeps the key plus a weak reference
/// and asks [`Owner::is_alive`] every time a queued action is applied.
pub trait Owner: Send + Sync {
    fn owner_key(&self) -> OwnerKey;

    /// Liveness as seen by the host. Dropping the last strong reference
    /// also counts as dead.
    fn is_alive(&self) -> bool {
        true
    }
}
