//! On-disk working state of one component.
//!
//! Layout under the working directory root:
//!
//! ```text
//! <root>/Source/Component-<uuid>/   editable source tree
//! <root>/Cache/<uuid>/index.js      built artifact
//! ```
//!
//! A loaded component can run from its cached artifact straight away; its
//! source archive is only unpacked when someone asks to edit it.

use std::path::{Path, PathBuf};

use uuid::Uuid;
use weft_core::{NodeMessage, ParameterSchema, PersistedState};

use crate::archive;
use crate::error::PipelineError;
use crate::template::{self, Language};

pub const SOURCE_DIR: &str = "Source";
pub const CACHE_DIR: &str = "Cache";
pub const ARTIFACT_FILE: &str = "index.js";

#[derive(Debug)]
enum Source {
    /// Nothing to edit and nothing to extract.
    Absent,
    /// Archived bytes waiting for the first edit.
    Deferred(Vec<u8>),
    Present { dir: PathBuf, entry: PathBuf },
}

/// Result of loading a persisted state.
#[derive(Debug)]
pub struct RestoreOutcome {
    pub store: ComponentStateStore,
    /// The source archive was kept and will be extracted on first edit.
    pub source_deferred: bool,
    /// Set when the state was written by a different tool version.
    pub note: Option<NodeMessage>,
}

#[derive(Debug)]
pub struct ComponentStateStore {
    root: PathBuf,
    id: Uuid,
    language: Language,
    source: Source,
    artifact: PathBuf,
    dirty: bool,
    cached_archive: Option<Vec<u8>>,
    cached_code: Option<String>,
    output_channel: bool,
    compile_error: bool,
}

impl ComponentStateStore {
    /// Scaffold a fresh source tree from the built-in template.
    pub fn create_from_template(
        root: &Path,
        language: Language,
        schema: &ParameterSchema,
    ) -> Result<Self, PipelineError> {
        let id = Uuid::new_v4();
        let dir = source_dir(root, id);
        let entry = template::scaffold(&dir, language, schema)?;
        let artifact = artifact_path(root, id);
        create_parent(&artifact)?;

        tracing::info!(component = %id, source = %dir.display(), %language, "Created component source");
        Ok(Self {
            root: root.to_path_buf(),
            id,
            language,
            source: Source::Present { dir, entry },
            artifact,
            dirty: true,
            cached_archive: None,
            cached_code: None,
            output_channel: schema.output_channel(),
            compile_error: false,
        })
    }

    /// Materialize the artifact of `state` at a fresh cache path.
    pub fn restore(root: &Path, state: &PersistedState) -> Result<RestoreOutcome, PipelineError> {
        let id = Uuid::new_v4();
        let artifact = artifact_path(root, id);
        create_parent(&artifact)?;
        std::fs::write(&artifact, &state.bundle_code)?;

        let source = match &state.source_archive {
            Some(bytes) => Source::Deferred(bytes.clone()),
            None => Source::Absent,
        };
        let source_deferred = matches!(source, Source::Deferred(_));
        tracing::info!(
            component = %id,
            artifact = %artifact.display(),
            source_deferred,
            "Restored component state"
        );

        let store = Self {
            root: root.to_path_buf(),
            id,
            language: Language::from_typescript(state.is_typescript),
            source,
            artifact,
            dirty: false,
            cached_archive: state.source_archive.clone(),
            cached_code: Some(state.bundle_code.clone()),
            output_channel: state.output_channel,
            compile_error: state.compile_error,
        };
        Ok(RestoreOutcome {
            store,
            source_deferred,
            note: state.version_note(),
        })
    }

    /// Snapshot everything needed to load this component again.
    ///
    /// A dirty store with a source tree is re-archived and its artifact
    /// re-read; otherwise the bytes captured last time are reused.
    pub fn capture(&mut self) -> Result<PersistedState, PipelineError> {
        if self.dirty || self.cached_code.is_none() {
            match std::fs::read_to_string(&self.artifact) {
                Ok(code) => self.cached_code = Some(code),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if self.dirty
            && let Source::Present { dir, .. } = &self.source
        {
            self.cached_archive = Some(archive::archive_dir(dir)?);
        }

        let bundle_code = self
            .cached_code
            .clone()
            .ok_or_else(|| PipelineError::MissingArtifact(self.artifact.clone()))?;
        self.dirty = false;

        let mut state = PersistedState::new(bundle_code);
        state.bundle_path = Some(self.bundle_path());
        state.source_archive = self.cached_archive.clone();
        state.is_typescript = self.language.is_typescript();
        state.output_channel = self.output_channel;
        state.compile_error = self.compile_error;
        tracing::debug!(
            component = %self.id,
            archive_bytes = state.source_archive.as_ref().map_or(0, Vec::len),
            "Captured component state"
        );
        Ok(state)
    }

    /// Make sure an editable source tree exists and return its entry file.
    ///
    /// A deferred archive is unpacked into a directory no other component
    /// uses. A store with neither source nor archive gets a fresh template.
    pub fn ensure_source(&mut self, schema: &ParameterSchema) -> Result<PathBuf, PipelineError> {
        match std::mem::replace(&mut self.source, Source::Absent) {
            Source::Present { dir, entry } => {
                self.source = Source::Present {
                    dir,
                    entry: entry.clone(),
                };
                Ok(entry)
            }
            Source::Deferred(bytes) => {
                let dir = source_dir(&self.root, Uuid::new_v4());
                let extracted = archive::extract_archive(&bytes, &dir).and_then(|files| {
                    template::find_entry(&dir)
                        .map(|found| (files, found))
                        .ok_or_else(|| PipelineError::MissingEntry(dir.clone()))
                });
                let (files, (entry, language)) = match extracted {
                    Ok(found) => found,
                    Err(e) => {
                        let _ = std::fs::remove_dir_all(&dir);
                        self.source = Source::Deferred(bytes);
                        return Err(e);
                    }
                };
                tracing::info!(component = %self.id, dir = %dir.display(), files, "Extracted component source");
                self.language = language;
                self.source = Source::Present {
                    dir,
                    entry: entry.clone(),
                };
                Ok(entry)
            }
            Source::Absent => {
                let dir = source_dir(&self.root, Uuid::new_v4());
                let entry = template::scaffold(&dir, self.language, schema)?;
                tracing::info!(
                    component = %self.id,
                    dir = %dir.display(),
                    "No saved source, starting from the template"
                );
                self.source = Source::Present {
                    dir,
                    entry: entry.clone(),
                };
                self.dirty = true;
                Ok(entry)
            }
        }
    }

    /// Something the next capture must pick up has changed.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Remove every directory this store created.
    pub fn dispose(&mut self) -> Result<(), PipelineError> {
        if let Source::Present { dir, .. } = std::mem::replace(&mut self.source, Source::Absent) {
            remove_dir(&dir)?;
        }
        if let Some(cache) = self.artifact.parent() {
            remove_dir(cache)?;
        }
        tracing::debug!(component = %self.id, "Disposed component directories");
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact
    }

    pub fn source_dir(&self) -> Option<&Path> {
        match &self.source {
            Source::Present { dir, .. } => Some(dir),
            _ => None,
        }
    }

    pub fn entry_path(&self) -> Option<&Path> {
        match &self.source {
            Source::Present { entry, .. } => Some(entry),
            _ => None,
        }
    }

    pub fn source_deferred(&self) -> bool {
        matches!(self.source, Source::Deferred(_))
    }

    pub fn compile_error(&self) -> bool {
        self.compile_error
    }

    pub fn set_compile_error(&mut self, failed: bool) {
        self.compile_error = failed;
    }

    pub fn output_channel(&self) -> bool {
        self.output_channel
    }

    pub fn set_output_channel(&mut self, enabled: bool) {
        self.output_channel = enabled;
    }

    /// Artifact path relative to the root, with forward slashes.
    fn bundle_path(&self) -> String {
        let relative = self.artifact.strip_prefix(&self.root).unwrap_or(&self.artifact);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn source_dir(root: &Path, id: Uuid) -> PathBuf {
    root.join(SOURCE_DIR).join(format!("Component-{id}"))
}

fn artifact_path(root: &Path, id: Uuid) -> PathBuf {
    root.join(CACHE_DIR).join(id.to_string()).join(ARTIFACT_FILE)
}

fn create_parent(path: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn remove_dir(dir: &Path) -> Result<(), PipelineError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
