//! Integration tests for the filesystem store used by local mode.

mod common;

use std::time::Duration;

use tempfile::TempDir;
use tracklab_core::{
    storage, Array, DispatchConfig, Image, LineValue, LocalBackend, LogData, LogLevel, Run, RunMode,
    RunRegistry, RunState, Text,
};

use common::config;

fn make_run(tmp: &TempDir) -> Run {
    Run::builder(config(tmp, RunMode::Local).with_param("lr", 0.001).with_param("epochs", 100))
        .registry(RunRegistry::new())
        .start()
        .expect("Failed to start local run")
}

#[test]
fn test_run_creates_run_dir() {
    let tmp = TempDir::new().unwrap();
    let mut run = make_run(&tmp);
    let run_dir = run.run_dir().to_path_buf();
    assert!(run_dir.exists(), "Run directory should be created");
    assert!(run_dir.join("run.yaml").exists(), "run.yaml should exist");
    run.finish();
}

#[test]
fn test_log_metrics_writes_parquet() {
    let tmp = TempDir::new().unwrap();
    let mut run = make_run(&tmp);

    for i in 0..100u64 {
        let data = LogData::new()
            .with("loss", 1.0 - i as f64 * 0.01)
            .with("acc", i as f64 * 0.01);
        run.log(data, Some(i));
    }
    run.finish();

    let backend = LocalBackend::new(run.run_dir()).unwrap();
    let metrics_path = backend.metrics_path();
    assert!(metrics_path.exists(), "metrics.parquet should exist after finish");

    let rows = storage::read_scalars(&metrics_path).unwrap();
    assert_eq!(rows.len(), 200, "Should have 100 rows per key");
    let loss: Vec<u64> = rows.iter().filter(|r| r.key == "loss").map(|r| r.step).collect();
    assert_eq!(loss, (0..100).collect::<Vec<_>>());
}

#[test]
fn test_sentinels_survive_parquet() {
    let tmp = TempDir::new().unwrap();
    let mut run = make_run(&tmp);
    run.log([("v", f64::NAN)], None);
    run.log([("v", f64::INFINITY)], None);
    run.log([("v", 2.5)], None);
    run.finish();

    let rows = storage::read_scalars(&run.run_dir().join("metrics.parquet")).unwrap();
    let values: Vec<LineValue> = rows.iter().map(|r| r.value).collect();
    assert_eq!(values, vec![LineValue::NaN, LineValue::Inf, LineValue::Number(2.5)]);
}

#[test]
fn test_config_written_to_files_dir() {
    let tmp = TempDir::new().unwrap();
    let mut run = make_run(&tmp);
    run.update_config([("batch_size", 64)]).unwrap();
    run.finish();

    let config_path = run.run_dir().join("files").join("config.yaml");
    assert!(config_path.exists(), "config.yaml should exist");
    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("lr"), "config should contain 'lr'");
    assert!(content.contains("epochs"), "config should contain 'epochs'");
    assert!(content.contains("batch_size"), "config should contain 'batch_size'");
    assert!(run.run_dir().join("files").join("metadata.json").exists());
}

#[test]
fn test_log_is_fast() {
    // 10,000 log calls stay in the millisecond range with delivery in the background
    let tmp = TempDir::new().unwrap();
    let dispatch = DispatchConfig {
        queue_capacity: 20_000,
        batch_size: 1_000,
        ..common::fast_dispatch()
    };
    let mut run = Run::builder(config(&tmp, RunMode::Local).with_dispatch(dispatch))
        .registry(RunRegistry::new())
        .start()
        .unwrap();

    let start = std::time::Instant::now();
    for i in 0..10_000u64 {
        run.log([("loss", i as f64 * 0.0001)], Some(i));
    }
    let elapsed = start.elapsed();

    println!("10,000 log calls took: {:?}", elapsed);
    assert!(
        elapsed < Duration::from_secs(2),
        "10k log calls should complete in < 2s, took {:?}",
        elapsed
    );
    run.finish();
}

#[test]
fn test_run_status_written_on_finish() {
    let tmp = TempDir::new().unwrap();
    let mut run = make_run(&tmp);
    run.crash("loss exploded");

    let meta = storage::load_run_metadata(run.run_dir()).unwrap();
    assert_eq!(meta.status, RunState::Crashed);
    assert_eq!(meta.project, "test_project");
    assert!(meta.finished_at.is_some());
    assert!(meta.duration_secs.is_some());

    let log = std::fs::read_to_string(run.run_dir().join("run.log")).unwrap();
    assert!(log.contains("[ERROR] loss exploded"), "{log}");
}

#[test]
fn test_columns_and_media_are_stored() {
    let tmp = TempDir::new().unwrap();
    let mut run = make_run(&tmp);

    let image = Image::from_array(Array::new(vec![0.5f32; 8 * 8 * 3], vec![8, 8, 3]).unwrap()).unwrap();
    let results = run.log(
        LogData::new()
            .with("train/loss", 0.3)
            .with("samples", image)
            .with("note", Text::new("hello")),
        Some(1),
    );
    run.console(LogLevel::Info, "epoch done");
    run.finish();

    let backend = LocalBackend::new(run.run_dir()).unwrap();
    let columns = std::fs::read_to_string(backend.columns_path()).unwrap();
    for key in ["train/loss", "samples", "note"] {
        assert!(columns.contains(key), "columns.yaml missing {key}");
    }

    let buffer = &results["samples"].buffers.as_ref().unwrap()[0];
    let stored = backend.media_dir().join(&buffer.path);
    assert!(stored.exists(), "media buffer should be written");
    assert_eq!(std::fs::read(stored).unwrap(), buffer.bytes.to_vec());

    let index = std::fs::read_to_string(backend.media_dir().join("index.jsonl")).unwrap();
    assert_eq!(index.lines().count(), 2);
    assert!(index.contains("hello"));

    let log = std::fs::read_to_string(backend.log_path()).unwrap();
    assert!(log.contains("[INFO] epoch done"));
}

#[test]
fn test_run_yaml_round_trip() {
    let tmp = TempDir::new().unwrap();
    let run_config = config(&tmp, RunMode::Local);
    let path = tmp.path().join("run_config.yaml");
    run_config.save_yaml(&path).unwrap();

    let loaded = tracklab_core::RunConfig::from_yaml_file(&path).unwrap();
    assert_eq!(loaded.project, run_config.project);
    assert_eq!(loaded.mode, RunMode::Local);
    assert_eq!(loaded.dispatch.workers, run_config.dispatch.workers);
}
