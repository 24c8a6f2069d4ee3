use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::builder::EsbuildBuilder;
use crate::error::PipelineError;
use crate::metrics::{LoggingMetricsBackend, MetricsBackend};

/// Environment variable overriding `workspace.root`.
pub const WORKSPACE_ENV: &str = "WEFT_WORKSPACE";

#[derive(Debug, Default, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Deserialize)]
pub struct BuildConfig {
    /// Program that runs the bundler.
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments placed before the entry path.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub minify: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Emit build counters and durations as debug-level log events.
    #[serde(default)]
    pub log_metrics: bool,
}

fn default_command() -> String {
    "npx".into()
}
fn default_args() -> Vec<String> {
    vec!["--yes".into(), "esbuild".into()]
}
fn default_debounce_ms() -> u64 {
    150
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            minify: false,
            debounce_ms: default_debounce_ms(),
            log_metrics: false,
        }
    }
}

impl BuildConfig {
    /// Where build watchers forward their counters, if anywhere.
    pub fn metrics_backend(&self) -> Option<Arc<dyn MetricsBackend>> {
        self.log_metrics
            .then(|| Arc::new(LoggingMetricsBackend) as Arc<dyn MetricsBackend>)
    }
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Script heap limit in MiB; 0 disables the limit.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,
    /// Script stack limit in KiB; 0 disables the limit.
    #[serde(default = "default_max_stack_kb")]
    pub max_stack_kb: usize,
    /// Open the debug inspector on this port at startup.
    pub debugger_port: Option<u16>,
}

fn default_memory_limit_mb() -> usize {
    256
}
fn default_max_stack_kb() -> usize {
    1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: default_memory_limit_mb(),
            max_stack_kb: default_max_stack_kb(),
            debugger_port: None,
        }
    }
}

impl RuntimeConfig {
    pub fn memory_limit_bytes(&self) -> Option<usize> {
        (self.memory_limit_mb > 0).then(|| self.memory_limit_mb * 1024 * 1024)
    }

    pub fn max_stack_bytes(&self) -> Option<usize> {
        (self.max_stack_kb > 0).then(|| self.max_stack_kb * 1024)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkspaceConfig {
    /// Root of the `Source/` and `Cache/` trees.
    pub root: Option<PathBuf>,
}

impl WeftConfig {
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(PipelineError::IoError)?;
        toml::from_str(&content)
            .map_err(|e| PipelineError::ConfigError(format!("Failed to parse {}: {e}", path.display())))
    }

    /// Load `path`, or the default location when `path` is `None`. A missing
    /// file yields the defaults; a malformed one is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, PipelineError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        let mut config = if path.exists() {
            tracing::debug!(path = %path.display(), "Loading config");
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        if let Some(root) = std::env::var_os(WORKSPACE_ENV).filter(|v| !v.is_empty()) {
            config.workspace.root = Some(PathBuf::from(root));
        }
        Ok(config)
    }

    /// Default config location: ~/.weft/weft.toml
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".weft")
            .join("weft.toml")
    }

    /// Working directory root, `<tmp>/weft` unless configured.
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace
            .root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("weft"))
    }

    pub fn build_builder(&self) -> EsbuildBuilder {
        EsbuildBuilder::new()
            .with_bin(self.build.command.clone())
            .with_args(self.build.args.clone())
    }
}
