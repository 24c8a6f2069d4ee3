use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::Side;

/// Severity of a message surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    /// Level used for a `console.<method>` call in a script.
    pub fn from_console_method(method: &str) -> Level {
        match method {
            "debug" | "trace" => Level::Debug,
            "warn" => Level::Warning,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Debug => write!(f, "debug"),
            Level::Info => write!(f, "info"),
            Level::Warning => write!(f, "warning"),
            Level::Error => write!(f, "error"),
        }
    }
}

/// One leveled message from the external builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDiagnostic {
    pub level: Level,
    pub lines: Vec<String>,
}

impl BuildDiagnostic {
    pub fn new(level: Level, lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            level,
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Level::Error, [message.into()])
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Outcome of one builder invocation. Failure is reported, never thrown.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    pub diagnostics: Vec<BuildDiagnostic>,
}

impl BuildResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            diagnostics: Vec::new(),
        }
    }

    pub fn failed(diagnostics: Vec<BuildDiagnostic>) -> Self {
        Self {
            success: false,
            diagnostics,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &BuildDiagnostic> {
        self.diagnostics.iter().filter(|d| d.level == Level::Error)
    }
}

/// A console call captured while a script executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub level: Level,
    pub text: String,
}

impl ConsoleMessage {
    pub fn new(level: Level, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}

/// A message attributed to a component and optionally one of its slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMessage {
    pub level: Level,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<SlotRef>,
}

impl NodeMessage {
    pub fn new(level: Level, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
            slot: None,
        }
    }

    pub fn at(mut self, side: Side, index: usize) -> Self {
        self.slot = Some(SlotRef { side, index });
        self
    }
}

impl fmt::Display for NodeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Some(slot) => write!(f, "[{}] {} {}: {}", self.level, slot.side, slot.index, self.text),
            None => write!(f, "[{}] {}", self.level, self.text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRef {
    pub side: Side,
    pub index: usize,
}
