//! Pipeline behaviour with real child processes
#![cfg(unix)]

mod helpers;

use helpers::{fast_config, scenario_workspace, stage, visual_stages};
use scorelink_common::config::{ExecutionMode, TomlConfig};
use scorelink_engine::input::{load_performance, load_score};
use scorelink_engine::manifest::{corrupt_path_for, ManifestManager};
use scorelink_engine::pipeline::{BreakerState, PipelineEvent, RunContext, StageKind};
use scorelink_engine::run::{self, RegistrySource, RunLayout, RunOptions};
use scorelink_engine::{RegistrySnapshot, StageErrorKind, StageExecutor, StageGraph, StageStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn options(ws: &helpers::Workspace, config: TomlConfig) -> RunOptions {
    RunOptions {
        source: RegistrySource::Inputs {
            score: ws.score.clone(),
            performance: ws.performance.clone(),
        },
        output_dir: ws.output_dir.clone(),
        mode: ExecutionMode::Sequential,
        config,
    }
}

/// Snapshot, manifest and executor wired to `ws.output_dir`
fn executor(ws: &helpers::Workspace, config: &TomlConfig) -> StageExecutor {
    let score = load_score(&ws.score).unwrap();
    let performance = load_performance(&ws.performance).unwrap();
    let (snapshot, _) = run::build_registry(&score, &performance, config).unwrap();

    let layout = RunLayout::new(&ws.output_dir);
    layout.ensure().unwrap();
    snapshot.write(&layout.registry()).unwrap();

    let snapshot = Arc::new(snapshot);
    let manifest = Arc::new(
        ManifestManager::open(
            &layout.manifest(),
            &snapshot,
            layout.output_dir(),
            &StageKind::ALL.map(StageKind::name),
        )
        .unwrap(),
    );
    let context = RunContext {
        snapshot: layout.registry(),
        output_dir: layout.output_dir().to_path_buf(),
        manifest: layout.manifest(),
    };
    StageExecutor::new(snapshot, manifest, context, config.pipeline.clone())
}

#[tokio::test]
async fn test_missing_output_skips_dependents() {
    let ws = scenario_workspace();
    let mut config = fast_config();
    visual_stages(&mut config);
    // exits 0 without writing coordinates.json
    config.stages.insert(
        "coordinates".to_string(),
        stage(&["sh", "-c", "true"], &["{stage_dir}/coordinates.json"]),
    );

    let report = run::run(&options(&ws, config), CancellationToken::new(), None)
        .await
        .unwrap();

    assert!(!report.success());
    let coordinates = report.execution.stage("coordinates").unwrap();
    assert_eq!(coordinates.status, StageStatus::Failed);
    assert_eq!(coordinates.error_kind, Some(StageErrorKind::OutputMissing));
    assert_eq!(coordinates.attempts, 2);

    for name in ["note_images", "composite"] {
        let stage = report.execution.stage(name).unwrap();
        assert_eq!(stage.status, StageStatus::Skipped);
        assert_eq!(stage.root_kind, Some(StageErrorKind::OutputMissing));
    }

    // manifest is still valid JSON with nothing recorded
    let layout = RunLayout::new(&ws.output_dir);
    let manifest = ManifestManager::read_latest(&layout.manifest()).unwrap();
    assert!(manifest.is_empty());
    assert!(layout.report().exists());
}

#[tokio::test]
async fn test_non_critical_failure_keeps_visual_branch() {
    let ws = scenario_workspace();
    let mut config = fast_config();
    visual_stages(&mut config);
    config.stages.insert(
        "audio_render".to_string(),
        stage(&["sh", "-c", "echo synth crashed >&2; exit 4"], &["{stage_dir}/mix.wav"]),
    );
    config.stages.insert(
        "audio_features".to_string(),
        stage(&["sh", "-c", "echo ok > \"$0\"", "{stage_dir}/{id}.json"], &[]),
    );

    let report = run::run(&options(&ws, config), CancellationToken::new(), None)
        .await
        .unwrap();

    assert!(!report.success());
    assert!(report.execution.aborted_by.is_none());
    let audio = report.execution.stage("audio_render").unwrap();
    assert_eq!(audio.status, StageStatus::Failed);
    assert_eq!(audio.error_kind, Some(StageErrorKind::Process));
    assert!(audio.error.as_deref().unwrap().contains("synth crashed"));
    assert_eq!(
        report.execution.stage("audio_features").unwrap().status,
        StageStatus::Skipped
    );
    assert_eq!(
        report.execution.stage("composite").unwrap().status,
        StageStatus::Completed
    );
}

#[tokio::test]
async fn test_open_breaker_rejects_without_invoking() {
    let ws = scenario_workspace();
    let counter = ws.path("invocations.log");
    let counter_arg = counter.to_string_lossy().into_owned();

    let mut config = fast_config();
    config.pipeline.retry.max_attempts = 1;
    config.pipeline.circuit_breaker.failure_threshold = 2;
    config.pipeline.circuit_breaker.cooldown_ms = 60_000;
    config.stages.insert(
        "audio_render".to_string(),
        stage(
            &["sh", "-c", "echo call >> \"$0\"; exit 1", &counter_arg],
            &["{stage_dir}/mix.wav"],
        ),
    );

    let (tx, mut rx) = mpsc::channel(1024);
    let executor = executor(&ws, &config).with_events(tx);

    for _ in 0..3 {
        let mut graph = StageGraph::build(&config).unwrap();
        executor.execute(&mut graph, ExecutionMode::Sequential).await.unwrap();
    }

    let calls = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(calls, 2, "third run must be rejected by the open breaker");
    assert_eq!(executor.breaker("audio_render").state(), BreakerState::Open);

    let mut graph = StageGraph::build(&config).unwrap();
    let report = executor.execute(&mut graph, ExecutionMode::Sequential).await.unwrap();
    let audio = report.stage("audio_render").unwrap();
    assert_eq!(audio.status, StageStatus::Skipped);
    assert_eq!(audio.error_kind, Some(StageErrorKind::CircuitOpen));
    assert_eq!(audio.attempts, 0);

    drop(executor);
    let mut opened = 0;
    while let Some(event) = rx.recv().await {
        if let PipelineEvent::BreakerStateChanged { to: BreakerState::Open, .. } = event {
            opened += 1;
        }
    }
    assert_eq!(opened, 1);
}

#[tokio::test]
async fn test_timeout_is_reported() {
    let ws = scenario_workspace();
    let mut config = fast_config();
    config.pipeline.retry.max_attempts = 1;
    let mut slow = stage(&["sh", "-c", "sleep 5"], &["{stage_dir}/mix.wav"]);
    slow.timeout_secs = Some(1);
    config.stages.insert("audio_render".to_string(), slow);

    let started = Instant::now();
    let report = run::run(&options(&ws, config), CancellationToken::new(), None)
        .await
        .unwrap();

    let audio = report.execution.stage("audio_render").unwrap();
    assert_eq!(audio.error_kind, Some(StageErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_cancellation_stops_running_stage() {
    let ws = scenario_workspace();
    let mut config = fast_config();
    config.stages.insert(
        "coordinates".to_string(),
        stage(&["sh", "-c", "sleep 5"], &["{stage_dir}/coordinates.json"]),
    );
    config.stages.insert(
        "note_images".to_string(),
        stage(&["sh", "-c", "echo x > \"$0\"", "{stage_dir}/{id}.svg"], &[]),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = run::run(&options(&ws, config), cancel, None).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(report.execution.cancelled);
    assert!(!report.success());
    let coordinates = report.execution.stage("coordinates").unwrap();
    assert_eq!(coordinates.status, StageStatus::Failed);
    assert_eq!(coordinates.error_kind, Some(StageErrorKind::Cancelled));
    assert_eq!(
        report.execution.stage("note_images").unwrap().error_kind,
        Some(StageErrorKind::Cancelled)
    );
}

#[tokio::test]
async fn test_corrupt_manifest_is_reconstructed() {
    let ws = scenario_workspace();
    let mut config = fast_config();
    visual_stages(&mut config);
    let first = run::run(&options(&ws, config), CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(first.success());

    let layout = RunLayout::new(&ws.output_dir);
    std::fs::write(layout.manifest(), b"{\"truncated\": ").unwrap();

    // reuse the snapshot with no stages configured
    let rerun = RunOptions {
        source: RegistrySource::Snapshot(layout.registry()),
        ..options(&ws, fast_config())
    };
    let second = run::run(&rerun, CancellationToken::new(), None).await.unwrap();

    assert!(second.manifest_degraded);
    assert!(second.matching.is_none());
    assert!(corrupt_path_for(&layout.manifest()).exists());

    let snapshot = RegistrySnapshot::load(&layout.registry()).unwrap();
    let manifest = ManifestManager::read_latest(&layout.manifest()).unwrap();
    for id in snapshot.ids() {
        assert_eq!(manifest.artifacts(&id, "note_images").len(), 1);
    }
}
