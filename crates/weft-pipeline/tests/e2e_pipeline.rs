//! Watcher and state store driven end to end with a stub builder.
//!
//! The esbuild variant at the bottom needs Node.js and is skipped by default:
//!
//! ```bash
//! cargo test -p weft-pipeline --test e2e_pipeline -- --ignored --nocapture
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::runtime::Handle;
use weft_core::{BuildDiagnostic, ParameterSchema};
use weft_pipeline::watcher::temp_artifact_path;
use weft_pipeline::{
    BuildWatcher, ComponentStateStore, EsbuildBuilder, Language, StubBuilder, WatchConfig, WatchEvent,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

struct Fixture {
    _tmp: TempDir,
    entry: PathBuf,
    artifact: PathBuf,
}

fn fixture(entry_name: &str) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let root = std::fs::canonicalize(tmp.path()).unwrap();
    let source = root.join("Source").join("Component-test");
    std::fs::create_dir_all(&source).unwrap();
    let entry = source.join(entry_name);
    std::fs::write(&entry, "export const x = 1;").unwrap();
    let artifact = root.join("Cache").join("test").join("index.js");
    Fixture {
        _tmp: tmp,
        entry,
        artifact,
    }
}

fn manual(f: &Fixture, stub: Arc<StubBuilder>, debounce_ms: u64) -> BuildWatcher {
    let config = WatchConfig::new(&f.entry, &f.artifact)
        .manual()
        .with_debounce(Duration::from_millis(debounce_ms));
    BuildWatcher::start(config, stub, &Handle::current()).unwrap()
}

async fn expect_event(watcher: &mut BuildWatcher) -> WatchEvent {
    tokio::time::timeout(EVENT_TIMEOUT, watcher.next_event())
        .await
        .expect("timed out waiting for a watch event")
        .expect("watcher closed")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn burst_of_changes_builds_once() {
    let f = fixture("index.js");
    let stub = Arc::new(StubBuilder::copying());
    let mut watcher = manual(&f, stub.clone(), 100);

    for _ in 0..5 {
        watcher.notify_changed(&f.entry);
    }

    assert!(matches!(expect_event(&mut watcher).await, WatchEvent::ArtifactChanged(_)));
    settle().await;
    assert!(watcher.try_next().is_none());
    assert_eq!(stub.calls(), 1);

    let metrics = watcher.metrics();
    assert_eq!(metrics.builds_started, 1);
    assert_eq!(metrics.events_coalesced, 4);
}

#[tokio::test]
async fn changes_during_a_build_earn_one_follow_up() {
    let f = fixture("index.js");
    let stub = Arc::new(StubBuilder::copying().with_delay(Duration::from_millis(300)));
    let mut watcher = manual(&f, stub.clone(), 10);

    watcher.notify_changed(&f.entry);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(stub.calls(), 1);
    watcher.notify_changed(&f.entry);
    watcher.notify_changed(&f.entry);
    watcher.notify_changed(&f.entry);

    assert!(matches!(expect_event(&mut watcher).await, WatchEvent::ArtifactChanged(_)));
    assert!(matches!(expect_event(&mut watcher).await, WatchEvent::ArtifactChanged(_)));
    settle().await;
    assert_eq!(stub.calls(), 2);
    assert!(watcher.try_next().is_none());
}

#[tokio::test]
async fn failed_build_leaves_previous_artifact() {
    let f = fixture("index.js");
    std::fs::create_dir_all(f.artifact.parent().unwrap()).unwrap();
    std::fs::write(&f.artifact, "export const previous = true;").unwrap();

    let stub = Arc::new(StubBuilder::failing(vec![BuildDiagnostic::error(
        "index.js:1:1: Unexpected end of file",
    )]));
    let mut watcher = manual(&f, stub.clone(), 10);
    watcher.request_build();

    match expect_event(&mut watcher).await {
        WatchEvent::BuildFailed(diagnostics) => {
            assert_eq!(diagnostics.len(), 1);
            assert!(diagnostics[0].text().contains("Unexpected end of file"));
        }
        other => panic!("expected a build failure, got {other:?}"),
    }
    assert_eq!(
        std::fs::read_to_string(&f.artifact).unwrap(),
        "export const previous = true;"
    );
    assert!(!temp_artifact_path(&f.artifact).exists());
    assert_eq!(watcher.metrics().builds_failed, 1);

    stub.set_failure(None);
    watcher.request_build();
    assert!(matches!(expect_event(&mut watcher).await, WatchEvent::ArtifactChanged(_)));
    assert_eq!(std::fs::read_to_string(&f.artifact).unwrap(), "export const x = 1;");
}

#[tokio::test]
async fn typescript_change_reports_structure_then_builds() {
    let f = fixture("index.ts");
    let mut watcher = manual(&f, Arc::new(StubBuilder::copying()), 10);

    watcher.notify_changed(&f.entry);
    assert_eq!(
        expect_event(&mut watcher).await,
        WatchEvent::SourceStructureChanged(f.entry.clone())
    );
    assert!(matches!(expect_event(&mut watcher).await, WatchEvent::ArtifactChanged(_)));
}

#[tokio::test]
async fn unrelated_paths_are_ignored() {
    let f = fixture("index.js");
    let stub = Arc::new(StubBuilder::copying());
    let mut watcher = manual(&f, stub.clone(), 10);
    let source = f.entry.parent().unwrap();

    watcher.notify_changed(source.join("README.md"));
    watcher.notify_changed(source.join("node_modules").join("lib").join("index.js"));
    watcher.notify_changed(source.join("bin").join("index.js"));
    watcher.notify_changed(temp_artifact_path(&f.artifact));

    settle().await;
    assert!(watcher.try_next().is_none());
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn external_artifact_writes_are_reported_once() {
    let f = fixture("index.js");
    let stub = Arc::new(StubBuilder::copying());
    let mut watcher = manual(&f, stub.clone(), 10);

    watcher.request_build();
    assert!(matches!(expect_event(&mut watcher).await, WatchEvent::ArtifactChanged(_)));

    // Our own write comes back as an echo.
    watcher.notify_changed(&f.artifact);
    settle().await;
    assert!(watcher.try_next().is_none());
    assert_eq!(watcher.metrics().echoes_suppressed, 1);

    std::fs::write(&f.artifact, "export const x = 42;").unwrap();
    watcher.notify_changed(&f.artifact);
    assert_eq!(
        expect_event(&mut watcher).await,
        WatchEvent::ArtifactChanged(f.artifact.clone())
    );
    watcher.notify_changed(&f.artifact);
    settle().await;
    assert!(watcher.try_next().is_none());
    assert_eq!(stub.calls(), 1);
}

#[tokio::test]
async fn filesystem_changes_trigger_builds() {
    let f = fixture("index.js");
    let config = WatchConfig::new(&f.entry, &f.artifact).with_debounce(Duration::from_millis(50));
    let mut watcher = BuildWatcher::start(config, Arc::new(StubBuilder::copying()), &Handle::current()).unwrap();

    // Give the platform watcher a moment to register.
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(&f.entry, "export const x = 2;").unwrap();

    loop {
        if let WatchEvent::ArtifactChanged(path) = expect_event(&mut watcher).await {
            assert_eq!(path, f.artifact);
            break;
        }
    }
    assert_eq!(std::fs::read_to_string(&f.artifact).unwrap(), "export const x = 2;");
}

#[tokio::test]
async fn built_component_survives_save_and_load() {
    let tmp = TempDir::new().unwrap();
    let root = std::fs::canonicalize(tmp.path()).unwrap();
    let schema = ParameterSchema::default();
    let mut store = ComponentStateStore::create_from_template(&root, Language::JavaScript, &schema).unwrap();
    let entry = store.entry_path().unwrap().to_path_buf();

    let config = WatchConfig::new(&entry, store.artifact_path()).manual();
    let mut watcher = BuildWatcher::start(config, Arc::new(StubBuilder::copying()), &Handle::current()).unwrap();
    watcher.request_build();
    assert!(matches!(expect_event(&mut watcher).await, WatchEvent::ArtifactChanged(_)));
    watcher.stop();

    store.mark_dirty();
    let state = store.capture().unwrap();
    assert!(state.bundle_code.contains("runScript"));
    let record = state.to_record();

    let other = TempDir::new().unwrap();
    let restored = weft_core::PersistedState::from_record(&record).unwrap();
    let outcome = ComponentStateStore::restore(other.path(), &restored).unwrap();
    assert!(outcome.source_deferred);
    let mut loaded = outcome.store;
    assert_eq!(
        std::fs::read_to_string(loaded.artifact_path()).unwrap(),
        state.bundle_code
    );

    let extracted = loaded.ensure_source(&schema).unwrap();
    assert_eq!(
        std::fs::read_to_string(&extracted).unwrap(),
        std::fs::read_to_string(&entry).unwrap()
    );
    assert!(extracted.starts_with(other.path().join("Source")));

    store.dispose().unwrap();
    loaded.dispose().unwrap();
    assert!(!Path::new(&entry).exists());
}

#[tokio::test]
#[ignore = "requires Node.js with npx and network access for esbuild"]
async fn esbuild_builds_the_template() {
    let tmp = TempDir::new().unwrap();
    let schema = ParameterSchema::default();
    let store = ComponentStateStore::create_from_template(tmp.path(), Language::TypeScript, &schema).unwrap();
    let config = WatchConfig::new(store.entry_path().unwrap(), store.artifact_path()).manual();
    let mut watcher = BuildWatcher::start(config, Arc::new(EsbuildBuilder::new()), &Handle::current()).unwrap();

    watcher.request_build();
    let event = tokio::time::timeout(Duration::from_secs(120), watcher.next_event())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, WatchEvent::ArtifactChanged(_)), "{event:?}");
    assert!(std::fs::read_to_string(store.artifact_path()).unwrap().contains("runScript"));
}
