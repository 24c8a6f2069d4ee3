use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("build failed: {0}")]
    BuildError(String),

    #[error("builder could not be started: {0}")]
    BuilderUnavailable(String),

    #[error("no built artifact at {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("source archive error: {0}")]
    ArchiveError(#[from] zip::result::ZipError),

    #[error("no entry file in {}", .0.display())]
    MissingEntry(PathBuf),

    #[error("unsafe path in source archive: {0}")]
    UnsafeArchivePath(String),

    #[error("file watcher error: {0}")]
    WatchError(#[from] notify::Error),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("persisted state error: {0}")]
    StateError(#[from] weft_core::StateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
