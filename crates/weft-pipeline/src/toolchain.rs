//! Checks for the external tools that editing and building depend on.

use std::path::Path;

use serde::Serialize;

use crate::error::PipelineError;

/// One external tool and whether it answered `--version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub required: bool,
    pub version: Option<String>,
    pub hint: &'static str,
}

impl ToolStatus {
    pub fn is_available(&self) -> bool {
        self.version.is_some()
    }
}

const TOOLS: &[(&str, bool, &str)] = &[
    ("node", true, "Install Node.js from https://nodejs.org"),
    ("npx", true, "npx ships with npm; reinstall Node.js if it is missing"),
    (
        "code",
        false,
        "Install Visual Studio Code and add `code` to PATH to open sources from weft",
    ),
];

/// Run `<program> --version`, returning the first line of its output.
pub async fn tool_version(program: &str) -> Option<String> {
    let output = tokio::process::Command::new(program)
        .arg("--version")
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
}

/// Probe every known tool.
pub async fn doctor() -> Vec<ToolStatus> {
    let mut statuses = Vec::with_capacity(TOOLS.len());
    for &(name, required, hint) in TOOLS {
        let version = tool_version(name).await;
        match &version {
            Some(v) => tracing::debug!(tool = name, version = %v, "Found tool"),
            None => tracing::warn!(tool = name, required, "Tool not found"),
        }
        statuses.push(ToolStatus {
            name: name.to_string(),
            required,
            version,
            hint,
        });
    }
    statuses
}

/// `npm install` in a source tree so editors resolve its packages.
pub async fn npm_install(dir: &Path) -> Result<(), PipelineError> {
    tracing::info!(dir = %dir.display(), "Installing npm packages");
    let output = tokio::process::Command::new("npm")
        .arg("install")
        .arg("--no-audit")
        .arg("--no-fund")
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| PipelineError::BuilderUnavailable(format!("npm: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::BuildError(format!(
            "npm install failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Open `dir` in Visual Studio Code with `entry` in front. Returns false
/// when `code` could not be run, so the caller can fall back to printing
/// the path.
pub async fn open_in_editor(dir: &Path, entry: &Path) -> bool {
    match tokio::process::Command::new("code")
        .arg("-r")
        .arg(dir)
        .arg(entry)
        .status()
        .await
    {
        Ok(status) if status.success() => true,
        Ok(status) => {
            tracing::warn!(dir = %dir.display(), %status, "Editor exited with an error");
            false
        }
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Could not launch the editor");
            false
        }
    }
}
