use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use weft_core::{BuildDiagnostic, BuildResult, Level};

/// Facade trait for the external bundler.
///
/// A build never fails with an error: problems running the tool and problems
/// in the sources alike come back as diagnostics in a failed [`BuildResult`].
pub trait Builder: Send + Sync {
    fn build<'a>(
        &'a self,
        entry: &'a Path,
        out: &'a Path,
        minify: bool,
    ) -> Pin<Box<dyn Future<Output = BuildResult> + Send + 'a>>;
}

/// Bundles with esbuild, by default through `npx --yes esbuild`.
pub struct EsbuildBuilder {
    bin: String,
    args: Vec<String>,
}

impl EsbuildBuilder {
    pub fn new() -> Self {
        Self {
            bin: "npx".into(),
            args: vec!["--yes".into(), "esbuild".into()],
        }
    }

    /// Override the program used to run esbuild.
    /// Useful when npx is not on PATH or a local esbuild binary is preferred.
    pub fn with_bin(mut self, path: impl Into<String>) -> Self {
        self.bin = path.into();
        self
    }

    /// Arguments placed between the program and the entry path.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn command_args(&self, entry: &Path, out: &Path, minify: bool) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(entry.display().to_string());
        args.extend(
            [
                "--bundle",
                "--format=esm",
                "--platform=node",
                "--target=es2020",
                "--sourcemap=inline",
            ]
            .map(String::from),
        );
        args.push(format!("--outfile={}", out.display()));
        if minify {
            args.push("--minify".into());
        }
        args
    }
}

impl Default for EsbuildBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder for EsbuildBuilder {
    fn build<'a>(
        &'a self,
        entry: &'a Path,
        out: &'a Path,
        minify: bool,
    ) -> Pin<Box<dyn Future<Output = BuildResult> + Send + 'a>> {
        Box::pin(async move {
            let mut command = tokio::process::Command::new(&self.bin);
            command.args(self.command_args(entry, out, minify));
            if let Some(dir) = entry.parent() {
                command.current_dir(dir);
            }

            tracing::debug!(entry = %entry.display(), out = %out.display(), "Running esbuild");
            let output = match command.output().await {
                Ok(output) => output,
                Err(e) => {
                    return BuildResult::failed(vec![BuildDiagnostic::error(format!(
                        "Failed to run {}: {e}. Are Node.js and npm installed?",
                        self.bin
                    ))]);
                }
            };

            let stderr = String::from_utf8_lossy(&output.stderr);
            let diagnostics = parse_diagnostics(&stderr);
            if output.status.success() {
                return BuildResult {
                    success: true,
                    diagnostics,
                };
            }

            if diagnostics.iter().any(|d| d.level == Level::Error) {
                BuildResult::failed(diagnostics)
            } else {
                let mut diagnostics = diagnostics;
                let detail = stderr.trim();
                diagnostics.push(BuildDiagnostic::error(if detail.is_empty() {
                    format!("{} exited with {}", self.bin, output.status)
                } else {
                    detail.to_string()
                }));
                BuildResult::failed(diagnostics)
            }
        })
    }
}

const ERROR_MARKER: &str = "✘ [ERROR]";
const WARNING_MARKER: &str = "▲ [WARNING]";

/// Split esbuild's stderr into one diagnostic per `✘ [ERROR]` / `▲ [WARNING]`
/// block. Blank lines are dropped and the trailing summary ends the last block.
pub fn parse_diagnostics(stderr: &str) -> Vec<BuildDiagnostic> {
    let mut diagnostics = Vec::new();
    let mut current: Option<BuildDiagnostic> = None;

    for line in stderr.lines() {
        let trimmed = line.trim();
        let header = trimmed
            .strip_prefix(ERROR_MARKER)
            .map(|rest| (Level::Error, rest))
            .or_else(|| {
                trimmed
                    .strip_prefix(WARNING_MARKER)
                    .map(|rest| (Level::Warning, rest))
            });

        if let Some((level, rest)) = header {
            diagnostics.extend(current.take());
            current = Some(BuildDiagnostic::new(level, [rest.trim()]));
            continue;
        }
        if is_summary(trimmed) {
            diagnostics.extend(current.take());
            continue;
        }
        if let Some(diagnostic) = current.as_mut()
            && !trimmed.is_empty()
        {
            diagnostic.lines.push(line.trim_end().to_string());
        }
    }
    diagnostics.extend(current);
    diagnostics
}

/// `1 error`, `2 warnings`, `1 warning and 1 error`, ...
fn is_summary(line: &str) -> bool {
    let mut words = line.split_whitespace();
    matches!(
        (words.next().map(|w| w.parse::<u32>()), words.next()),
        (Some(Ok(_)), Some("error" | "errors" | "warning" | "warnings"))
    )
}

/// Deterministic builder for tests: copies the entry to the output, or
/// fails with preset diagnostics.
pub struct StubBuilder {
    failure: Mutex<Option<Vec<BuildDiagnostic>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubBuilder {
    pub fn copying() -> Self {
        Self {
            failure: Mutex::new(None),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(diagnostics: Vec<BuildDiagnostic>) -> Self {
        let stub = Self::copying();
        stub.set_failure(Some(diagnostics));
        stub
    }

    /// Make every build take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failure(&self, failure: Option<Vec<BuildDiagnostic>>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = failure;
    }

    /// Number of builds started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Builder for StubBuilder {
    fn build<'a>(
        &'a self,
        entry: &'a Path,
        out: &'a Path,
        _minify: bool,
    ) -> Pin<Box<dyn Future<Output = BuildResult> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failure = self
                .failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(diagnostics) = failure {
                return BuildResult::failed(diagnostics);
            }
            match tokio::fs::copy(entry, out).await {
                Ok(_) => BuildResult::ok(),
                Err(e) => BuildResult::failed(vec![BuildDiagnostic::error(format!(
                    "Could not read {}: {e}",
                    entry.display()
                ))]),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const ESBUILD_FAILURE: &str = "\
✘ [ERROR] Expected \";\" but found \"}\"

    index.js:3:2:
      3 │   }
        ╵   ^

▲ [WARNING] Comparison with -0 using the \"===\" operator will also match 0

    index.js:1:4:
      1 │ if (x === -0) {}
        ╵     ~~

1 warning and 1 error
";

    #[test]
    fn parses_error_and_warning_blocks() {
        let diagnostics = parse_diagnostics(ESBUILD_FAILURE);
        assert_eq!(diagnostics.len(), 2);

        assert_eq!(diagnostics[0].level, Level::Error);
        assert_eq!(diagnostics[0].lines[0], "Expected \";\" but found \"}\"");
        assert_eq!(diagnostics[0].lines[1].trim(), "index.js:3:2:");
        assert_eq!(diagnostics[0].lines.len(), 4);

        assert_eq!(diagnostics[1].level, Level::Warning);
        assert!(diagnostics[1].text().contains("index.js:1:4:"));
        assert!(!diagnostics[1].text().contains("1 warning and 1 error"));
    }

    #[test]
    fn clean_output_has_no_diagnostics() {
        assert!(parse_diagnostics("\n  bin/index.js  1.2kb\n\n⚡ Done in 3ms\n").is_empty());
    }

    #[test]
    fn command_line_matches_bundle_contract() {
        let builder = EsbuildBuilder::new();
        let args = builder.command_args(
            &PathBuf::from("/src/index.ts"),
            &PathBuf::from("/cache/index.js.tmp"),
            true,
        );
        assert_eq!(
            args,
            vec![
                "--yes",
                "esbuild",
                "/src/index.ts",
                "--bundle",
                "--format=esm",
                "--platform=node",
                "--target=es2020",
                "--sourcemap=inline",
                "--outfile=/cache/index.js.tmp",
                "--minify",
            ]
        );
    }

    #[tokio::test]
    async fn missing_program_is_a_failed_build() {
        let tmp = tempfile::TempDir::new().unwrap();
        let builder = EsbuildBuilder::new().with_bin("weft-no-such-bundler");
        let result = builder
            .build(&tmp.path().join("index.js"), &tmp.path().join("out.js"), false)
            .await;
        assert!(!result.success);
        assert!(result.diagnostics[0].text().contains("weft-no-such-bundler"));
    }

    #[tokio::test]
    async fn stub_copies_entry_and_counts_calls() {
        let tmp = tempfile::TempDir::new().unwrap();
        let entry = tmp.path().join("index.js");
        let out = tmp.path().join("out.js");
        std::fs::write(&entry, "export const x = 1;").unwrap();

        let stub = StubBuilder::copying();
        assert!(stub.build(&entry, &out, false).await.success);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "export const x = 1;");

        stub.set_failure(Some(vec![BuildDiagnostic::error("nope")]));
        let result = stub.build(&entry, &out, false).await;
        assert!(!result.success);
        assert_eq!(result.errors().count(), 1);
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    #[ignore = "requires Node.js with npx and network access for esbuild"]
    async fn esbuild_bundles_a_module() {
        let tmp = tempfile::TempDir::new().unwrap();
        let entry = tmp.path().join("index.js");
        std::fs::write(&entry, "export function runScript(i) { return { x: i.a + i.b }; }").unwrap();
        let out = tmp.path().join("bin").join("index.js");

        let result = EsbuildBuilder::new().build(&entry, &out, false).await;
        assert!(result.success, "{:?}", result.diagnostics);
        assert!(std::fs::read_to_string(&out).unwrap().contains("runScript"));
    }
}
