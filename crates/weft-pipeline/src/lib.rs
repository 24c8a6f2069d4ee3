//! Build pipeline for weft script components.
//!
//! - [`builder`]: the bundler facade and its esbuild implementation
//! - [`watcher`]: debounced rebuilds of a source tree into one artifact
//! - [`state`]: the per-component working directory and what gets persisted
//! - [`archive`]: zip snapshots of a source tree
//! - [`template`]: project scaffolding and type declaration files
//! - [`toolchain`]: version checks for node, npx and the editor
//! - [`config`]: `weft.toml`

pub mod archive;
pub mod builder;
pub mod config;
pub mod error;
pub mod metrics;
pub mod state;
pub mod template;
pub mod toolchain;
pub mod watcher;

pub use builder::{Builder, EsbuildBuilder, StubBuilder};
pub use config::WeftConfig;
pub use error::PipelineError;
pub use metrics::{BuildMetrics, LoggingMetricsBackend, MetricsBackend, MetricsSnapshot};
pub use state::{ComponentStateStore, RestoreOutcome};
pub use template::Language;
pub use watcher::{BuildWatcher, WatchConfig, WatchEvent};
