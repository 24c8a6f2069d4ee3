use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::diagnostic::{Level, NodeMessage};
use crate::error::StateError;

pub const KEY_BUNDLE_CODE: &str = "bundle_code";
pub const KEY_BUNDLE_PATH: &str = "bundle_path";
pub const KEY_SOURCE_ARCHIVE: &str = "source_archive";
pub const KEY_IS_TYPESCRIPT: &str = "is_typescript";
pub const KEY_OUTPUT_CHANNEL: &str = "output_channel";
pub const KEY_COMPILE_ERROR: &str = "compile_error";
pub const KEY_TOOL_VERSION: &str = "tool_version";

/// Version written into every persisted state.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a component needs to run again after a save/load cycle.
///
/// `bundle_code` is always present so a loaded component can execute without
/// its source tree or any build tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub bundle_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_path: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "hex_bytes"
    )]
    pub source_archive: Option<Vec<u8>>,
    #[serde(default)]
    pub is_typescript: bool,
    #[serde(default = "default_true")]
    pub output_channel: bool,
    #[serde(default)]
    pub compile_error: bool,
    #[serde(default)]
    pub tool_version: String,
}

fn default_true() -> bool {
    true
}

/// One value in the host's opaque key/value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValue {
    Text(String),
    Bytes(Vec<u8>),
    Bool(bool),
}

pub type Record = BTreeMap<String, RecordValue>;

impl PersistedState {
    pub fn new(bundle_code: impl Into<String>) -> Self {
        Self {
            bundle_code: bundle_code.into(),
            bundle_path: None,
            source_archive: None,
            is_typescript: false,
            output_channel: true,
            compile_error: false,
            tool_version: TOOL_VERSION.to_string(),
        }
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(
            KEY_BUNDLE_CODE.into(),
            RecordValue::Text(self.bundle_code.clone()),
        );
        if let Some(path) = &self.bundle_path {
            record.insert(KEY_BUNDLE_PATH.into(), RecordValue::Text(path.clone()));
        }
        if let Some(archive) = &self.source_archive {
            record.insert(KEY_SOURCE_ARCHIVE.into(), RecordValue::Bytes(archive.clone()));
        }
        record.insert(KEY_IS_TYPESCRIPT.into(), RecordValue::Bool(self.is_typescript));
        record.insert(KEY_OUTPUT_CHANNEL.into(), RecordValue::Bool(self.output_channel));
        record.insert(KEY_COMPILE_ERROR.into(), RecordValue::Bool(self.compile_error));
        record.insert(
            KEY_TOOL_VERSION.into(),
            RecordValue::Text(self.tool_version.clone()),
        );
        record
    }

    /// Read a state back. Only the bundle code is mandatory.
    pub fn from_record(record: &Record) -> Result<Self, StateError> {
        let bundle_code = match record.get(KEY_BUNDLE_CODE) {
            Some(RecordValue::Text(code)) => code.clone(),
            Some(_) => return Err(StateError::WrongType(KEY_BUNDLE_CODE)),
            None => return Err(StateError::MissingField(KEY_BUNDLE_CODE)),
        };
        let text = |key: &'static str| match record.get(key) {
            Some(RecordValue::Text(s)) => Ok(Some(s.clone())),
            Some(_) => Err(StateError::WrongType(key)),
            None => Ok(None),
        };
        let flag = |key: &'static str, default: bool| match record.get(key) {
            Some(RecordValue::Bool(b)) => Ok(*b),
            Some(_) => Err(StateError::WrongType(key)),
            None => Ok(default),
        };
        let source_archive = match record.get(KEY_SOURCE_ARCHIVE) {
            Some(RecordValue::Bytes(bytes)) => Some(bytes.clone()),
            Some(_) => return Err(StateError::WrongType(KEY_SOURCE_ARCHIVE)),
            None => None,
        };

        Ok(Self {
            bundle_code,
            bundle_path: text(KEY_BUNDLE_PATH)?,
            source_archive,
            is_typescript: flag(KEY_IS_TYPESCRIPT, false)?,
            output_channel: flag(KEY_OUTPUT_CHANNEL, true)?,
            compile_error: flag(KEY_COMPILE_ERROR, false)?,
            tool_version: text(KEY_TOOL_VERSION)?.unwrap_or_default(),
        })
    }

    /// A note for the user when the state was written by another version.
    pub fn version_note(&self) -> Option<NodeMessage> {
        if self.tool_version == TOOL_VERSION {
            return None;
        }
        let written_by = if self.tool_version.is_empty() {
            "an unknown version"
        } else {
            self.tool_version.as_str()
        };
        Some(NodeMessage::new(
            Level::Info,
            format!("component was saved by weft {written_by}, running {TOOL_VERSION}"),
        ))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        text.map(|t| hex::decode(t).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_state() -> PersistedState {
        PersistedState {
            bundle_path: Some("Cache/1234/index.js".into()),
            source_archive: Some(vec![0x50, 0x4b, 0x03, 0x04]),
            is_typescript: true,
            output_channel: false,
            compile_error: true,
            ..PersistedState::new("export function runScript() {}")
        }
    }

    #[test]
    fn record_keeps_every_field() {
        let state = full_state();
        let back = PersistedState::from_record(&state.to_record()).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn record_needs_only_bundle_code() {
        let mut record = Record::new();
        record.insert(KEY_BUNDLE_CODE.into(), RecordValue::Text("x".into()));
        let state = PersistedState::from_record(&record).unwrap();
        assert_eq!(state.bundle_code, "x");
        assert!(state.source_archive.is_none());
        assert!(state.output_channel);
        assert!(!state.compile_error);
    }

    #[test]
    fn record_without_bundle_code_is_rejected() {
        let record = Record::new();
        assert_eq!(
            PersistedState::from_record(&record),
            Err(StateError::MissingField(KEY_BUNDLE_CODE))
        );
    }

    #[test]
    fn record_with_wrong_type_is_rejected() {
        let mut record = PersistedState::new("x").to_record();
        record.insert(KEY_IS_TYPESCRIPT.into(), RecordValue::Text("yes".into()));
        assert_eq!(
            PersistedState::from_record(&record),
            Err(StateError::WrongType(KEY_IS_TYPESCRIPT))
        );
    }

    #[test]
    fn json_encodes_archive_as_hex() {
        let state = full_state();
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"source_archive\":\"504b0304\""));
        let back: PersistedState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn version_note_only_for_other_versions() {
        assert!(PersistedState::new("x").version_note().is_none());
        let mut old = PersistedState::new("x");
        old.tool_version = "0.0.1".into();
        let note = old.version_note().unwrap();
        assert!(note.text.contains("0.0.1"));
    }
}
