//! Source watching and rebuilds.
//!
//! A [`BuildWatcher`] owns one tokio task per component. Filesystem callbacks
//! (notify's thread) and host calls only enqueue signals; the task debounces
//! them, runs the builder and reports [`WatchEvent`]s on a queue the host
//! drains from its own thread.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use weft_core::{BuildDiagnostic, Level};

use crate::builder::Builder;
use crate::error::PipelineError;
use crate::metrics::{BuildMetrics, MetricsSnapshot};

/// File suffixes whose changes trigger a rebuild.
pub const WATCHED_SUFFIXES: &[&str] = &[".js", ".mjs", ".cjs", ".ts", ".mts", ".cts", ".json"];

/// Directory names never looked into.
pub const IGNORED_DIRS: &[&str] = &["node_modules", "bin", "obj"];

const TYPESCRIPT_SUFFIXES: &[&str] = &[".ts", ".mts", ".cts"];

/// Something the host should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The artifact has new content, from a build or an outside write.
    ArtifactChanged(PathBuf),
    BuildFailed(Vec<BuildDiagnostic>),
    /// A TypeScript source changed; the host re-derives source-dependent state.
    SourceStructureChanged(PathBuf),
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Entry file handed to the builder; its directory is the source root.
    pub entry: PathBuf,
    /// Where the built bundle lives.
    pub artifact: PathBuf,
    pub debounce: Duration,
    pub minify: bool,
    /// Watch the filesystem with notify. When false, changes are only
    /// delivered through [`BuildWatcher::notify_changed`].
    pub filesystem: bool,
}

impl WatchConfig {
    pub fn new(entry: impl Into<PathBuf>, artifact: impl Into<PathBuf>) -> Self {
        Self {
            entry: entry.into(),
            artifact: artifact.into(),
            debounce: Duration::from_millis(150),
            minify: false,
            filesystem: true,
        }
    }

    pub fn manual(mut self) -> Self {
        self.filesystem = false;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_minify(mut self, minify: bool) -> Self {
        self.minify = minify;
        self
    }
}

/// True when a change to `path` under `root` should trigger a rebuild.
pub fn is_relevant_source(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    let in_ignored_dir = relative.components().any(|c| match c {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name)),
        _ => false,
    });
    if in_ignored_dir {
        return false;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.ends_with('~') {
        return false;
    }
    WATCHED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn is_typescript(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| TYPESCRIPT_SUFFIXES.iter().any(|s| name.ends_with(s)))
}

#[derive(Debug)]
enum Signal {
    Source(PathBuf),
    Artifact,
    Build,
}

/// Maps changed paths to signals. Cloned into the notify callback.
#[derive(Debug, Clone)]
struct Classifier {
    source_root: PathBuf,
    artifact: PathBuf,
}

impl Classifier {
    fn classify(&self, path: &Path) -> Option<Signal> {
        let path = normalize(path);
        if path == self.artifact {
            Some(Signal::Artifact)
        } else if is_relevant_source(&self.source_root, &path) {
            Some(Signal::Source(path))
        } else {
            None
        }
    }
}

/// Canonical form of `path`, resolving through the parent when the file
/// itself is gone.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Sibling file the builder writes before it replaces the artifact.
pub fn temp_artifact_path(artifact: &Path) -> PathBuf {
    let mut name = artifact
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    artifact.with_file_name(name)
}

/// Watches one component's sources and rebuilds its artifact.
pub struct BuildWatcher {
    entry: PathBuf,
    artifact: PathBuf,
    classifier: Classifier,
    signals: mpsc::UnboundedSender<Signal>,
    events: mpsc::UnboundedReceiver<WatchEvent>,
    metrics: Arc<BuildMetrics>,
    task: JoinHandle<()>,
    _fs: Option<RecommendedWatcher>,
}

impl BuildWatcher {
    /// Start watching. The build task runs on `runtime`.
    pub fn start(
        config: WatchConfig,
        builder: Arc<dyn Builder>,
        runtime: &Handle,
    ) -> Result<Self, PipelineError> {
        Self::start_with_metrics(config, builder, runtime, Arc::new(BuildMetrics::new()))
    }

    pub fn start_with_metrics(
        config: WatchConfig,
        builder: Arc<dyn Builder>,
        runtime: &Handle,
        metrics: Arc<BuildMetrics>,
    ) -> Result<Self, PipelineError> {
        let entry = normalize(&config.entry);
        let source_root = entry
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| PipelineError::BuildError(format!("entry {} has no directory", entry.display())))?;
        if let Some(parent) = config.artifact.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let artifact = normalize(&config.artifact);
        let classifier = Classifier {
            source_root: source_root.clone(),
            artifact: artifact.clone(),
        };

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let fs = if config.filesystem {
            Some(watch_filesystem(&classifier, signal_tx.clone())?)
        } else {
            None
        };

        let task = runtime.spawn(
            BuildLoop {
                entry: entry.clone(),
                artifact: artifact.clone(),
                builder,
                events: event_tx,
                metrics: Arc::clone(&metrics),
                debounce: config.debounce,
                minify: config.minify,
                last_hash: read_hash(&artifact),
            }
            .run(signal_rx),
        );

        tracing::info!(
            entry = %entry.display(),
            artifact = %artifact.display(),
            filesystem = config.filesystem,
            "Build watcher started"
        );
        Ok(Self {
            entry,
            artifact,
            classifier,
            signals: signal_tx,
            events: event_rx,
            metrics,
            task,
            _fs: fs,
        })
    }

    pub fn entry(&self) -> &Path {
        &self.entry
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Report a changed path, as the filesystem watcher would.
    pub fn notify_changed(&self, path: impl AsRef<Path>) {
        if let Some(signal) = self.classifier.classify(path.as_ref()) {
            let _ = self.signals.send(signal);
        }
    }

    /// Build now, regardless of changes.
    pub fn request_build(&self) {
        let _ = self.signals.send(Signal::Build);
    }

    /// Next event if one is queued. Never blocks.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.events.try_recv().ok()
    }

    /// Everything queued so far.
    pub fn drain(&mut self) -> Vec<WatchEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn stop(self) {}
}

impl Drop for BuildWatcher {
    fn drop(&mut self) {
        self.task.abort();
        tracing::debug!(entry = %self.entry.display(), "Build watcher stopped");
    }
}

fn watch_filesystem(
    classifier: &Classifier,
    signals: mpsc::UnboundedSender<Signal>,
) -> Result<RecommendedWatcher, PipelineError> {
    let callback_classifier = classifier.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "File watcher error");
                return;
            }
        };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            || matches!(event.kind, EventKind::Modify(ModifyKind::Metadata(_)))
        {
            return;
        }
        for path in &event.paths {
            if let Some(signal) = callback_classifier.classify(path) {
                let _ = signals.send(signal);
            }
        }
    })?;

    watcher.watch(&classifier.source_root, RecursiveMode::Recursive)?;
    if let Some(artifact_dir) = classifier.artifact.parent()
        && !artifact_dir.starts_with(&classifier.source_root)
    {
        watcher.watch(artifact_dir, RecursiveMode::NonRecursive)?;
    }
    Ok(watcher)
}

fn read_hash(path: &Path) -> Option<String> {
    std::fs::read(path)
        .ok()
        .map(|bytes| hex::encode(Sha256::digest(&bytes)))
}

struct BuildLoop {
    entry: PathBuf,
    artifact: PathBuf,
    builder: Arc<dyn Builder>,
    events: mpsc::UnboundedSender<WatchEvent>,
    metrics: Arc<BuildMetrics>,
    debounce: Duration,
    minify: bool,
    /// Hash of the artifact content last reported, ours or external.
    last_hash: Option<String>,
}

impl BuildLoop {
    async fn run(mut self, mut signals: mpsc::UnboundedReceiver<Signal>) {
        while let Some(signal) = signals.recv().await {
            if !self.accept(signal) {
                continue;
            }
            // Coalesce everything arriving within the debounce window.
            let deadline = tokio::time::Instant::now() + self.debounce;
            loop {
                match tokio::time::timeout_at(deadline, signals.recv()).await {
                    Ok(Some(signal)) => {
                        if self.accept(signal) {
                            self.metrics.record_event_coalesced();
                        }
                    }
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            loop {
                self.build().await;
                // Changes that arrived mid-build earn exactly one follow-up.
                let mut follow_up = false;
                while let Ok(signal) = signals.try_recv() {
                    if self.accept(signal) {
                        if follow_up {
                            self.metrics.record_event_coalesced();
                        }
                        follow_up = true;
                    }
                }
                if !follow_up {
                    break;
                }
            }
        }
    }

    /// Handle a signal; returns whether it asks for a build.
    fn accept(&mut self, signal: Signal) -> bool {
        match signal {
            Signal::Artifact => {
                self.artifact_touched();
                false
            }
            Signal::Source(path) => {
                if is_typescript(&path) {
                    self.emit(WatchEvent::SourceStructureChanged(path));
                }
                true
            }
            Signal::Build => true,
        }
    }

    fn artifact_touched(&mut self) {
        let Some(hash) = read_hash(&self.artifact) else {
            return;
        };
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            self.metrics.record_echo_suppressed();
            return;
        }
        tracing::info!(artifact = %self.artifact.display(), "Artifact changed outside the build");
        self.last_hash = Some(hash);
        self.emit(WatchEvent::ArtifactChanged(self.artifact.clone()));
    }

    async fn build(&mut self) {
        self.metrics.record_build_started();
        tracing::info!(entry = %self.entry.display(), "Building");
        let started = Instant::now();
        let temp = temp_artifact_path(&self.artifact);

        let result = self.builder.build(&self.entry, &temp, self.minify).await;
        for warning in result.diagnostics.iter().filter(|d| d.level == Level::Warning) {
            tracing::warn!(entry = %self.entry.display(), "{}", warning.text());
        }

        if !result.success {
            let _ = tokio::fs::remove_file(&temp).await;
            self.fail(result.diagnostics);
            return;
        }

        match self.replace_artifact(&temp).await {
            Ok(hash) => {
                let millis = started.elapsed().as_millis() as u64;
                self.metrics.record_build_succeeded(millis);
                tracing::info!(artifact = %self.artifact.display(), millis, "Build succeeded");
                self.last_hash = Some(hash);
                self.emit(WatchEvent::ArtifactChanged(self.artifact.clone()));
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                self.fail(vec![BuildDiagnostic::error(format!(
                    "Could not update {}: {e}",
                    self.artifact.display()
                ))]);
            }
        }
    }

    async fn replace_artifact(&self, temp: &Path) -> std::io::Result<String> {
        let bytes = tokio::fs::read(temp).await?;
        tokio::fs::rename(temp, &self.artifact).await?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    fn fail(&mut self, mut diagnostics: Vec<BuildDiagnostic>) {
        if diagnostics.is_empty() {
            diagnostics.push(BuildDiagnostic::error("build failed without diagnostics"));
        }
        self.metrics.record_build_failed();
        tracing::warn!(
            entry = %self.entry.display(),
            errors = diagnostics.iter().filter(|d| d.level == Level::Error).count(),
            "Build failed"
        );
        self.emit(WatchEvent::BuildFailed(diagnostics));
    }

    fn emit(&self, event: WatchEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StubBuilder;

    #[test]
    fn relevance_follows_suffixes_and_ignored_dirs() {
        let root = Path::new("/work/Source/Component-1");
        assert!(is_relevant_source(root, &root.join("index.js")));
        assert!(is_relevant_source(root, &root.join("lib/util.mts")));
        assert!(is_relevant_source(root, &root.join("package.json")));
        assert!(!is_relevant_source(root, &root.join("README.md")));
        assert!(!is_relevant_source(root, &root.join("node_modules/pkg/index.js")));
        assert!(!is_relevant_source(root, &root.join("bin/index.js")));
        assert!(!is_relevant_source(root, &root.join("obj/cache.json")));
        assert!(!is_relevant_source(root, &root.join(".index.js.swp")));
        assert!(!is_relevant_source(root, &root.join("index.js~")));
        assert!(!is_relevant_source(root, Path::new("/elsewhere/index.js")));
    }

    #[test]
    fn temp_path_is_a_sibling() {
        assert_eq!(
            temp_artifact_path(Path::new("/cache/abc/index.js")),
            PathBuf::from("/cache/abc/index.js.tmp")
        );
    }

    #[test]
    fn typescript_detection() {
        assert!(is_typescript(Path::new("a/index.ts")));
        assert!(is_typescript(Path::new("a/index.cts")));
        assert!(!is_typescript(Path::new("a/index.js")));
    }

    #[tokio::test]
    async fn requested_build_replaces_artifact() {
        let tmp = tempfile::TempDir::new().unwrap();
        let entry = tmp.path().join("src").join("index.js");
        std::fs::create_dir_all(entry.parent().unwrap()).unwrap();
        std::fs::write(&entry, "export const x = 1;").unwrap();
        let artifact = tmp.path().join("cache").join("index.js");

        let stub = Arc::new(StubBuilder::copying());
        let config = WatchConfig::new(&entry, &artifact)
            .manual()
            .with_debounce(Duration::from_millis(10));
        let mut watcher = BuildWatcher::start(config, stub.clone(), &Handle::current()).unwrap();

        watcher.request_build();
        let event = watcher.next_event().await.unwrap();
        assert_eq!(event, WatchEvent::ArtifactChanged(watcher.artifact().to_path_buf()));
        assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "export const x = 1;");
        assert!(!temp_artifact_path(&artifact).exists());
        assert_eq!(watcher.metrics().builds_succeeded, 1);
    }
}
