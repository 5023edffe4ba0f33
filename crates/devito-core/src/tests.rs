//! End-to-end behaviour of the coordinator with the bus and watch layer.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use devito_cache::{CacheKey, CacheManager, DerivedSources};
use devito_graph::runtime::test_utils::MemoryRuntime;
use devito_graph::NativeRuntime;

use crate::compiler::test_utils::{bundle_output, ScriptedCompiler};
use crate::watch::test_utils::ManualWatcher;
use crate::*;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl BuildObserver for Recorder {
    async fn on_change(&self, paths: &[PathBuf]) {
        let names: Vec<_> = paths.iter().map(|p| p.display().to_string()).collect();
        self.events.lock().push(format!("change {}", names.join(",")));
    }

    async fn on_before_rebuild(&self, generation: u64) {
        self.events.lock().push(format!("before {generation}"));
    }

    async fn on_applied(&self, generation: u64) {
        self.events.lock().push(format!("applied {generation}"));
    }

    async fn on_failed(&self, failure: &CompileFailure) {
        self.events.lock().push(format!("failed {}", failure.message));
    }
}

struct Harness {
    compiler: Arc<ScriptedCompiler>,
    watcher: Arc<ManualWatcher>,
    caches: Arc<CacheManager>,
    sources: DerivedSources,
    recorder: Arc<Recorder>,
    coordinator: Arc<BuildCoordinator>,
}

fn harness(compiler: ScriptedCompiler, options: CoordinatorOptions) -> Harness {
    let runtime = Arc::new(MemoryRuntime::new());
    let compiler = Arc::new(compiler);
    let watcher = Arc::new(ManualWatcher::new());
    let caches = Arc::new(CacheManager::new());
    let sources = DerivedSources::new(&caches, runtime, "/");
    let recorder = Arc::new(Recorder::default());
    let coordinator = BuildCoordinator::new(
        options,
        compiler.clone(),
        sources.clone(),
        caches.clone(),
        watcher.clone(),
        recorder.clone(),
    );
    Harness {
        compiler,
        watcher,
        caches,
        sources,
        recorder,
        coordinator,
    }
}

fn js(map: &ArtifactMap) -> String {
    String::from_utf8(map.get("/bundle.js").unwrap().contents.to_vec()).unwrap()
}

fn ok(js: &str) -> ScriptedCompiler {
    let js = js.to_string();
    ScriptedCompiler::new(move |_| Ok(bundle_output(&js, &["/app/index.ts", "/app/util.ts"])))
}

#[tokio::test(start_paused = true)]
async fn initial_build_publishes_artifacts_and_watches_inputs() {
    let h = harness(ok("one"), CoordinatorOptions::new("/app/index.ts"));

    h.coordinator.initial_build().await.unwrap();

    let artifacts = h.coordinator.artifacts();
    assert_eq!(js(&artifacts), "one");
    assert_eq!(artifacts.get("/bundle.css").unwrap().meta.size, 0);
    assert!(h.coordinator.status().is_applied());
    assert_eq!(h.watcher.watched_dirs(), vec![PathBuf::from("/app")]);
    assert_eq!(h.recorder.events(), vec!["before 1", "applied 1"]);
}

#[tokio::test(start_paused = true)]
async fn stale_generation_never_overwrites_a_newer_one() {
    let h = harness(ok("unused"), CoordinatorOptions::new("/app/index.ts"));
    h.compiler.push(
        Duration::from_millis(500),
        Ok(bundle_output("first", &["/app/index.ts"])),
    );
    h.compiler.push(
        Duration::from_millis(10),
        Ok(bundle_output("second", &["/app/index.ts"])),
    );

    assert_eq!(h.coordinator.start_build(), 1);
    tokio::task::yield_now().await;
    assert_eq!(h.coordinator.start_build(), 2);

    h.coordinator.wait_for_build().await.unwrap();
    assert_eq!(js(&h.coordinator.artifacts()), "second");

    // let the first build finish late
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(js(&h.coordinator.artifacts()), "second");
    assert!(matches!(
        h.coordinator.status(),
        BuildStatus::Applied { generation: 2, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn waiting_on_a_superseded_build_waits_for_the_newer_one() {
    let h = harness(ok("unused"), CoordinatorOptions::new("/app/index.ts"));
    h.compiler.push(Duration::from_millis(300), Ok(bundle_output("old", &[])));
    h.compiler.push(Duration::from_millis(300), Ok(bundle_output("new", &[])));

    h.coordinator.start_build();
    let coordinator = h.coordinator.clone();
    let waiter = tokio::spawn(async move { coordinator.wait_for_build().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.coordinator.start_build();

    waiter.await.unwrap().unwrap();
    assert_eq!(js(&h.coordinator.artifacts()), "new");
}

#[tokio::test(start_paused = true)]
async fn a_burst_of_rebuilds_runs_one_build() {
    let h = harness(
        ok("x"),
        CoordinatorOptions::new("/app/index.ts").with_debounce(Duration::from_millis(200)),
    );

    for _ in 0..5 {
        h.coordinator.rebuild();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(h.compiler.calls(), 1);
    assert_eq!(h.coordinator.generation(), 1);
    h.coordinator.wait_for_build().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_rebuild_keeps_the_last_good_artifacts() {
    let h = harness(ok("unused"), CoordinatorOptions::new("/app/index.ts"));
    let bus = ChangeBus::new();
    let mut client = bus.connect();
    client.recv().await.unwrap();
    let notifier = BusNotifier::new(bus.clone());

    h.compiler.push(Duration::ZERO, Ok(bundle_output("good", &["/app/index.ts"])));
    h.coordinator.initial_build().await.unwrap();

    let failure = CompileFailure::new("Build failed with 1 error").with_diagnostic(Diagnostic {
        file: Some("app/index.ts".into()),
        line: Some(1),
        column: Some(4),
        text: "Unexpected end of file".into(),
    });
    h.compiler.push(Duration::ZERO, Err(failure.clone()));
    h.coordinator.start_build();

    let err = h.coordinator.wait_for_build().await.unwrap_err();
    assert_eq!(err, BuildError::Compile(failure.clone()));
    assert_eq!(js(&h.coordinator.artifacts()), "good");
    assert_eq!(h.coordinator.status().error(), Some(failure.to_string().as_str()));
    assert_eq!(
        h.recorder.events(),
        vec![
            "before 1",
            "applied 1",
            "before 2",
            "failed Build failed with 1 error"
        ]
    );

    notifier.on_failed(&err.to_failure()).await;
    let message: BusMessage = serde_json::from_str(&client.recv().await.unwrap()).unwrap();
    assert_eq!(message, BusMessage::Error(failure));
}

#[tokio::test(start_paused = true)]
async fn empty_output_is_a_failure() {
    let h = harness(
        ScriptedCompiler::new(|_| Ok(CompileOutput::default())),
        CoordinatorOptions::new("/app/index.ts"),
    );
    let err = h.coordinator.initial_build().await.unwrap_err();
    assert_eq!(err, BuildError::NoOutput);
    assert!(h.coordinator.artifacts().is_empty());
    // the entry is watched so a fix triggers a rebuild
    assert_eq!(h.watcher.watched_dirs(), vec![PathBuf::from("/app")]);
}

#[tokio::test(start_paused = true)]
async fn watched_change_evicts_caches_then_rebuilds() {
    let h = harness(
        ok("x"),
        CoordinatorOptions::new("/app/index.ts").with_debounce(Duration::from_millis(50)),
    );
    h.coordinator.initial_build().await.unwrap();

    h.sources.prime_source(Path::new("/app/util.ts"), "export const x = 1;");
    assert!(h.sources.source_cache().contains(&CacheKey::new("/app/util.ts")));

    h.watcher.emit(FileChange::Modified("/app/util.ts".into()));
    h.watcher.emit(FileChange::Modified("/app/util.ts".into()));
    h.watcher.emit(FileChange::Modified("/app/untracked.ts".into()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.coordinator.wait_for_build().await.unwrap();

    assert!(!h.sources.source_cache().contains(&CacheKey::new("/app/util.ts")));
    assert_eq!(h.compiler.calls(), 2);
    assert_eq!(
        h.recorder.events(),
        vec![
            "before 1",
            "applied 1",
            "change /app/util.ts",
            "before 2",
            "applied 2"
        ]
    );
    assert!(h.caches.stats().iter().all(|s| s.entries == 0));
}

#[tokio::test(start_paused = true)]
async fn change_evicts_before_the_debounced_rebuild() {
    let h = harness(
        ok("x"),
        CoordinatorOptions::new("/app/index.ts").with_debounce(Duration::from_millis(50)),
    );
    h.coordinator.initial_build().await.unwrap();
    h.sources.prime_source(Path::new("/app/util.ts"), "export const x = 1;");

    h.watcher.emit(FileChange::Modified("/app/util.ts".into()));
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert!(!h.sources.source_cache().contains(&CacheKey::new("/app/util.ts")));
    assert_eq!(h.compiler.calls(), 1);
    assert_eq!(h.recorder.events(), vec!["before 1", "applied 1"]);

    h.sources.prime_source(Path::new("/app/index.ts"), "import './util.ts';");
    h.coordinator.notify_change("/app/index.ts");
    assert!(!h.sources.source_cache().contains(&CacheKey::new("/app/index.ts")));

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.coordinator.wait_for_build().await.unwrap();
    assert_eq!(h.compiler.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn entry_source_is_passed_and_primed() {
    let h = harness(
        ok("x"),
        CoordinatorOptions::new("/virtual/entry.ts").with_entry_source("console.log('mem')"),
    );
    h.coordinator.initial_build().await.unwrap();

    let request = &h.compiler.requests()[0];
    assert_eq!(request.entry_source.as_deref(), Some("console.log('mem')"));
    assert!(request.bundle);

    let source = h.sources.source(Path::new("/virtual/entry.ts")).await.unwrap();
    assert_eq!(&*source.payload, "console.log('mem')");
}

/// Concatenates the entry and the files it names, reading from disk.
fn concat_compiler(dir: PathBuf) -> ScriptedCompiler {
    ScriptedCompiler::new(move |req| {
        let index = std::fs::read_to_string(&req.entry).map_err(|e| CompileFailure::new(e.to_string()))?;
        let util_path = dir.join("util.ts");
        let util = std::fs::read_to_string(&util_path).map_err(|e| CompileFailure::new(e.to_string()))?;
        let mut outputs = BTreeMap::new();
        outputs.insert("/bundle.js".to_string(), format!("{util}\n{index}").into_bytes());
        Ok(CompileOutput {
            outputs,
            inputs: vec![req.entry.clone(), util_path],
        })
    })
}

#[tokio::test]
async fn modified_dependency_produces_new_bundle_and_evicts_its_entry() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let index = root.join("index.ts");
    let util = root.join("util.ts");
    std::fs::write(&index, "import { x } from './util.ts';\nconsole.log(x);\n").unwrap();
    std::fs::write(&util, "export const x = 1;\n").unwrap();

    let runtime = Arc::new(NativeRuntime::new());
    let caches = Arc::new(CacheManager::new());
    let sources = DerivedSources::new(&caches, runtime, root.clone());
    let compiler = Arc::new(concat_compiler(root.clone()));
    let coordinator = BuildCoordinator::new(
        CoordinatorOptions::new(&index).with_debounce(Duration::from_millis(10)),
        compiler.clone(),
        sources.clone(),
        caches,
        Arc::new(ManualWatcher::new()),
        Arc::new(NoopObserver),
    );

    coordinator.initial_build().await.unwrap();
    let first = coordinator.artifacts();
    assert!(js(&first).contains("x = 1"));

    // unchanged: waiting again does not compile again
    coordinator.wait_for_build().await.unwrap();
    assert_eq!(compiler.calls(), 1);

    sources.source(&util).await.unwrap();
    std::fs::write(&util, "export const x = 1000;\n").unwrap();
    coordinator.notify_change(&util);
    tokio::time::sleep(Duration::from_millis(100)).await;
    coordinator.wait_for_build().await.unwrap();

    assert!(js(&coordinator.artifacts()).contains("x = 1000"));
    assert!(js(&first).contains("x = 1;"));
    assert!(!sources.source_cache().contains(&CacheKey::new(&util)));
}

#[tokio::test]
async fn one_client_leaving_mid_broadcast_does_not_affect_another() {
    let bus = ChangeBus::new();
    let mut staying = bus.connect();
    let leaving = bus.connect();
    staying.recv().await.unwrap();

    let sender = bus.clone();
    let broadcast = tokio::spawn(async move {
        sender
            .broadcast(&BusMessage::update(BUNDLE_PATHS))
            .await
    });
    drop(leaving);

    let report = broadcast.await.unwrap();
    assert!(report.delivered >= 1);
    assert_eq!(
        staying.recv().await.unwrap(),
        BusMessage::update(BUNDLE_PATHS).to_json()
    );
    assert_eq!(bus.client_count(), 1);
}
