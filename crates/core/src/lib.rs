pub mod config;
pub mod diagnostic;
pub mod error;
pub mod owner;

pub use config::{CompletionMode, EngineConfig, UnknownRemovePolicy};
pub use diagnostic::Diagnostic;
pub use error::JobError;
pub use owner::{Owner, OwnerKey};
