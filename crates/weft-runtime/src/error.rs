use std::path::PathBuf;

use thiserror::Error;
use weft_core::MarshalError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The engine is unusable; the environment resets itself on next access.
    #[error("runtime fault: {0}")]
    Fault(String),

    #[error("script error: {0}")]
    Script(String),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error("cannot read artifact {}: {message}", path.display())]
    Artifact { path: PathBuf, message: String },

    #[error("export `{export}` not found in {}", path.display())]
    EntryNotFound { path: PathBuf, export: String },

    #[error("promise can never settle: no pending jobs or timers")]
    Stalled,

    #[error("result from runtime epoch {executed} discarded, current epoch is {current}")]
    Stale { executed: u64, current: u64 },

    #[error("debug inspector: {0}")]
    Inspector(String),
}

impl RuntimeError {
    pub fn is_fault(&self) -> bool {
        matches!(self, RuntimeError::Fault(_))
    }
}
