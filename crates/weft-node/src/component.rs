//! A script component: schema, working state, watcher and a handle on the
//! shared runtime, driven from the host thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use uuid::Uuid;
use weft_core::{
    BuildDiagnostic, HandleTable, Level, NodeMessage, ParameterSchema, PersistedState, RuntimeValue, SchemaError,
};
use weft_pipeline::template::write_type_declarations;
use weft_pipeline::{
    BuildMetrics, BuildWatcher, Builder, ComponentStateStore, Language, MetricsBackend, MetricsSnapshot, WatchConfig, WatchEvent, WeftConfig,
};
use weft_runtime::{EntryCall, RuntimeEnvironment, RuntimeError};

use crate::error::ComponentError;
use crate::io::{CollectError, DataAccess, SlotData, apply_outputs, collect_inputs};

/// Export every component artifact must provide.
pub const ENTRY_EXPORT: &str = "runScript";

/// What a component shares with every other component in the process.
#[derive(Clone)]
pub struct HostContext {
    pub env: RuntimeEnvironment,
    pub builder: Arc<dyn Builder>,
    /// Runs watcher tasks.
    pub runtime: Handle,
    pub workspace_root: PathBuf,
    pub debounce: Duration,
    pub minify: bool,
    /// Watch sources with notify. Off means rebuilds only happen on request.
    pub watch_filesystem: bool,
    /// Receives the build counters of every watcher this context starts.
    pub metrics_backend: Option<Arc<dyn MetricsBackend>>,
}

impl HostContext {
    pub fn new(env: RuntimeEnvironment, builder: Arc<dyn Builder>, runtime: Handle, workspace_root: PathBuf) -> Self {
        Self {
            env,
            builder,
            runtime,
            workspace_root,
            debounce: Duration::from_millis(150),
            minify: false,
            watch_filesystem: true,
            metrics_backend: None,
        }
    }

    pub fn from_config(config: &WeftConfig, env: RuntimeEnvironment, runtime: Handle) -> Self {
        Self {
            debounce: Duration::from_millis(config.build.debounce_ms),
            minify: config.build.minify,
            metrics_backend: config.build.metrics_backend(),
            ..Self::new(env, Arc::new(config.build_builder()), runtime, config.workspace_root())
        }
    }
}

/// Schema plus persisted state: everything a saved component consists of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDocument {
    pub schema: ParameterSchema,
    pub state: PersistedState,
}

impl ComponentDocument {
    pub fn from_json(text: &str) -> Result<Self, ComponentError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ComponentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ready,
    /// The last build failed; execution waits for a successful one.
    BuildFailed,
    InvalidParameters(SchemaError),
    MissingArtifact,
}

/// Everything one solve produced besides output data.
#[derive(Debug, Default)]
pub struct SolveReport {
    pub messages: Vec<NodeMessage>,
    /// The entry function ran to completion.
    pub executed: bool,
    pub epoch: Option<u64>,
}

impl SolveReport {
    fn push(&mut self, message: NodeMessage) {
        self.messages.push(message);
    }

    pub fn errors(&self) -> impl Iterator<Item = &NodeMessage> {
        self.messages.iter().filter(|m| m.level == Level::Error)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }
}

pub struct ScriptComponent {
    host: HostContext,
    schema: ParameterSchema,
    store: ComponentStateStore,
    watcher: Option<BuildWatcher>,
    build_diagnostics: Vec<BuildDiagnostic>,
    /// Load-time notes, reported with the next solve.
    notes: Vec<NodeMessage>,
    expired: bool,
}

impl ScriptComponent {
    /// A new component with the default `a + b` template.
    pub fn create(host: HostContext, language: Language) -> Result<Self, ComponentError> {
        let schema = ParameterSchema::default();
        let store = ComponentStateStore::create_from_template(&host.workspace_root, language, &schema)?;
        Ok(Self {
            host,
            schema,
            store,
            watcher: None,
            build_diagnostics: Vec::new(),
            notes: Vec::new(),
            expired: true,
        })
    }

    /// Load a saved component. It can solve straight away from its cached
    /// artifact; the source is only unpacked by [`edit_source`](Self::edit_source).
    pub fn restore(host: HostContext, document: &ComponentDocument) -> Result<Self, ComponentError> {
        let outcome = ComponentStateStore::restore(&host.workspace_root, &document.state)?;
        let mut schema = document.schema.clone();
        schema.set_output_channel(document.state.output_channel);
        let mut build_diagnostics = Vec::new();
        if outcome.store.compile_error() {
            build_diagnostics.push(BuildDiagnostic::error(
                "The last build before saving failed. Edit the source to rebuild.",
            ));
        }
        Ok(Self {
            host,
            schema,
            store: outcome.store,
            watcher: None,
            build_diagnostics,
            notes: outcome.note.into_iter().collect(),
            expired: true,
        })
    }

    pub fn save(&mut self) -> Result<ComponentDocument, ComponentError> {
        self.store.set_output_channel(self.schema.output_channel());
        let state = self.store.capture()?;
        tracing::debug!(component = %self.id(), "Saved component");
        Ok(ComponentDocument {
            schema: self.schema.clone(),
            state,
        })
    }

    pub fn id(&self) -> Uuid {
        self.store.id()
    }

    pub fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    pub fn language(&self) -> Language {
        self.store.language()
    }

    pub fn store(&self) -> &ComponentStateStore {
        &self.store
    }

    pub fn build_diagnostics(&self) -> &[BuildDiagnostic] {
        &self.build_diagnostics
    }

    /// Whether the host should solve this component again.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn watcher_metrics(&self) -> Option<MetricsSnapshot> {
        self.watcher.as_ref().map(BuildWatcher::metrics)
    }

    pub fn status(&self) -> Status {
        if let Err(e) = self.schema.validate() {
            return Status::InvalidParameters(e);
        }
        if self.store.compile_error() {
            return Status::BuildFailed;
        }
        if !self.store.artifact_path().is_file() {
            return Status::MissingArtifact;
        }
        Status::Ready
    }

    /// Apply a schema edit. When it changed anything the type declarations
    /// are regenerated, the runtime is reset and the component expires.
    pub fn edit_schema<R>(&mut self, edit: impl FnOnce(&mut ParameterSchema) -> R) -> R {
        let before = self.schema.revision();
        let result = edit(&mut self.schema);
        if self.schema.revision() == before {
            return result;
        }

        if let Err(e) = self.schema.validate() {
            tracing::warn!(component = %self.id(), error = %e, "Parameters are invalid");
        }
        self.refresh_declarations();
        self.store.set_output_channel(self.schema.output_channel());
        self.store.mark_dirty();
        self.host.env.reset();
        self.expired = true;
        result
    }

    /// Make the source editable and start watching it. Returns the entry file.
    pub fn edit_source(&mut self) -> Result<PathBuf, ComponentError> {
        let entry = self.store.ensure_source(&self.schema)?;
        self.refresh_declarations();

        if self.watcher.is_none() {
            let mut config = WatchConfig::new(&entry, self.store.artifact_path())
                .with_debounce(self.host.debounce)
                .with_minify(self.host.minify);
            if !self.host.watch_filesystem {
                config = config.manual();
            }
            let metrics = match &self.host.metrics_backend {
                Some(backend) => BuildMetrics::with_backend(Arc::clone(backend)),
                None => BuildMetrics::new(),
            };
            let watcher = BuildWatcher::start_with_metrics(
                config,
                Arc::clone(&self.host.builder),
                &self.host.runtime,
                Arc::new(metrics),
            )?;
            if !self.store.artifact_path().is_file() {
                watcher.request_build();
            }
            self.watcher = Some(watcher);
        }
        tracing::info!(component = %self.id(), entry = %entry.display(), "Editing component source");
        Ok(entry)
    }

    /// Ask the watcher for a build now. Starts editing if needed.
    pub fn rebuild(&mut self) -> Result<(), ComponentError> {
        self.edit_source()?;
        if let Some(watcher) = &self.watcher {
            watcher.request_build();
        }
        Ok(())
    }

    /// Apply every queued watcher event. Returns how many were applied.
    pub fn pump(&mut self) -> usize {
        let events = match self.watcher.as_mut() {
            Some(watcher) => watcher.drain(),
            None => return 0,
        };
        let count = events.len();
        for event in events {
            self.apply(event);
        }
        count
    }

    /// Block the host thread until a watcher event arrives or `timeout`
    /// passes, then pump. Must not be called from inside the tokio runtime.
    pub fn wait_for_events(&mut self, timeout: Duration) -> usize {
        let Some(watcher) = self.watcher.as_mut() else {
            return 0;
        };
        let runtime = self.host.runtime.clone();
        let first = runtime.block_on(async { tokio::time::timeout(timeout, watcher.next_event()).await });
        let mut count = 0;
        if let Ok(Some(event)) = first {
            self.apply(event);
            count += 1;
        }
        count + self.pump()
    }

    fn apply(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::ArtifactChanged(path) => {
                tracing::info!(component = %self.id(), artifact = %path.display(), "Artifact updated");
                self.build_diagnostics.clear();
                self.store.set_compile_error(false);
                self.store.mark_dirty();
                self.host.env.reset();
                self.expired = true;
            }
            WatchEvent::BuildFailed(diagnostics) => {
                self.build_diagnostics = diagnostics;
                self.store.set_compile_error(true);
                self.store.mark_dirty();
                self.expired = true;
            }
            WatchEvent::SourceStructureChanged(path) => {
                tracing::debug!(component = %self.id(), path = %path.display(), "Source structure changed");
                self.refresh_declarations();
                self.store.mark_dirty();
            }
        }
    }

    fn refresh_declarations(&self) {
        if !self.language().is_typescript() {
            return;
        }
        let Some(dir) = self.store.source_dir() else {
            return;
        };
        match write_type_declarations(dir, &self.schema) {
            Ok(true) => tracing::debug!(component = %self.id(), "Type declarations regenerated"),
            Ok(false) => {}
            Err(e) => tracing::warn!(component = %self.id(), error = %e, "Could not write type declarations"),
        }
    }

    /// Run the entry function once against `data`, blocking until it settles.
    pub fn solve(&mut self, data: &mut dyn DataAccess) -> SolveReport {
        self.expired = false;
        let mut report = SolveReport::default();
        report.messages.append(&mut self.notes);

        match self.status() {
            Status::Ready => {}
            Status::BuildFailed => {
                for diagnostic in &self.build_diagnostics {
                    report.push(NodeMessage::new(diagnostic.level, diagnostic.text()));
                }
                if !report.has_errors() {
                    report.push(NodeMessage::new(Level::Error, "The last build failed"));
                }
                return report;
            }
            Status::InvalidParameters(e) => {
                let message = NodeMessage::new(Level::Error, e.to_string());
                report.push(match e.slot() {
                    Some((side, index)) => message.at(side, index),
                    None => message,
                });
                return report;
            }
            Status::MissingArtifact => {
                report.push(NodeMessage::new(
                    Level::Error,
                    format!(
                        "No built artifact at {}. Has the component been built yet?",
                        self.store.artifact_path().display()
                    ),
                ));
                return report;
            }
        }

        let mut handles = HandleTable::new();
        let inputs = match collect_inputs(&self.schema, &*data, &mut handles) {
            Ok(inputs) => inputs,
            Err(CollectError::Missing(message) | CollectError::Marshal(message)) => {
                report.push(message);
                return report;
            }
        };
        let context = RuntimeValue::from_pairs([
            ("component", RuntimeValue::String(self.id().to_string())),
            ("epoch", RuntimeValue::Number(self.host.env.epoch() as f64)),
        ]);
        let call = EntryCall::new(self.store.artifact_path(), ENTRY_EXPORT)
            .with_inputs(inputs)
            .with_context(context);

        tracing::debug!(component = %self.id(), "Executing");
        let outcome = match self.host.env.execute_entry(call).wait() {
            Ok(outcome) => outcome,
            Err(e) => {
                self.report_runtime_error(&mut report, e);
                return report;
            }
        };
        report.epoch = Some(outcome.epoch);

        if self.schema.output_channel() {
            let lines = outcome
                .console
                .iter()
                .map(|m| m.text.clone().into())
                .collect();
            data.set_output(0, SlotData::List(lines));
        }
        for message in &outcome.console {
            report.push(NodeMessage::new(message.level, message.text.clone()));
        }

        match outcome.value {
            Ok(result) => {
                report.executed = true;
                for message in apply_outputs(&self.schema, &result, &handles, data) {
                    report.push(message);
                }
            }
            Err(e) => self.report_runtime_error(&mut report, e),
        }
        report
    }

    fn report_runtime_error(&mut self, report: &mut SolveReport, err: RuntimeError) {
        tracing::warn!(component = %self.id(), error = %err, "Execution failed");
        match err {
            RuntimeError::Stale { .. } => {
                report.push(NodeMessage::new(
                    Level::Warning,
                    "The runtime was reset while this component ran; its result was discarded",
                ));
                self.expired = true;
            }
            RuntimeError::Fault(detail) => report.push(NodeMessage::new(
                Level::Error,
                format!("The script runtime failed and will be recreated: {detail}"),
            )),
            other => report.push(NodeMessage::new(Level::Error, other.to_string())),
        }
    }

    /// Stop watching and delete this component's directories.
    pub fn remove(mut self) -> Result<(), ComponentError> {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        self.store.dispose()?;
        tracing::info!(component = %self.id(), "Component removed");
        Ok(())
    }
}
