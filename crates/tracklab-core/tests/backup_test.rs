//! Backup file contents and offline replay.

mod common;

use std::io::Write;
use std::time::Duration;

use tempfile::TempDir;
use tracklab_core::backup::{self, BackupEntry, BACKUP_FILE};
use tracklab_core::{
    Array, Audio, BackendError, DeliveryStatus, DispatchConfig, LogData, LogLevel, Run, RunMode,
    RunRegistry, RunState, Text,
};

use common::{config, fast_dispatch, Call, RecordingBackend};

fn offline_run(tmp: &TempDir) -> Run {
    Run::builder(config(tmp, RunMode::Offline).with_param("lr", 0.1))
        .registry(RunRegistry::new())
        .start()
        .unwrap()
}

fn log_sample_data(run: &mut Run) {
    let audio = Audio::from_array(Array::new(vec![0.1f64; 2 * 32], vec![2, 32]).unwrap(), 16_000).unwrap();
    for step in 0..3u64 {
        run.log(LogData::new().with("loss", 1.0 / (step + 1) as f64), Some(step));
    }
    run.log(LogData::new().with("clip", audio).with("note", Text::new("ok")), None);
    run.log(LogData::new().with("loss", "bad"), None);
    run.console(LogLevel::Info, "done");
}

#[test]
fn test_offline_run_writes_backup() {
    let tmp = TempDir::new().unwrap();
    let mut run = offline_run(&tmp);
    log_sample_data(&mut run);
    run.finish();

    let entries = backup::read_entries(&run.run_dir().join(BACKUP_FILE)).unwrap();
    assert!(matches!(entries.first(), Some(BackupEntry::Run { .. })));
    assert!(matches!(entries.last(), Some(BackupEntry::Stop { stop }) if stop.state == RunState::Success));

    let columns = entries
        .iter()
        .filter(|e| matches!(e, BackupEntry::Column { .. }))
        .count();
    assert_eq!(columns, 3);

    let media_bytes: usize = entries
        .iter()
        .filter_map(|e| match e {
            BackupEntry::Metric { buffers, .. } => Some(buffers.iter().map(|b| b.len()).sum::<usize>()),
            _ => None,
        })
        .sum();
    assert!(media_bytes > 0, "audio bytes should be in the backup");

    // Offline mode delivers nothing else
    assert!(!run.run_dir().join("metrics.parquet").exists());
}

#[test]
fn test_replay_delivers_backup_in_order() {
    let tmp = TempDir::new().unwrap();
    let mut run = offline_run(&tmp);
    log_sample_data(&mut run);
    run.crash("oom");

    let backend = RecordingBackend::new();
    let report = backup::replay(&run.run_dir().join(BACKUP_FILE), backend.as_ref()).unwrap();

    assert_eq!(report.columns, 3);
    assert_eq!(report.scalars, 3);
    assert_eq!(report.media, 2);
    assert_eq!(report.errored, 1);
    assert_eq!(report.files, 2);
    assert_eq!(report.logs, 2);
    assert_eq!(report.final_state, Some(RunState::Crashed));

    let calls = backend.calls();
    assert!(matches!(calls.first(), Some(Call::RegisterRun(id)) if id == run.id()));
    assert_eq!(calls.last(), Some(&Call::State(RunState::Crashed)));
    assert_eq!(
        backend.scalars(),
        vec![("loss".to_string(), 0), ("loss".to_string(), 1), ("loss".to_string(), 2)]
    );
    let upload_at = calls.iter().position(|c| matches!(c, Call::Upload(_))).unwrap();
    let media_at = calls
        .iter()
        .position(|c| matches!(c, Call::Media(m) if m[0].0 == "clip"))
        .unwrap();
    assert!(upload_at < media_at, "buffers are uploaded before the media record");
}

#[test]
fn test_replay_skips_truncated_lines() {
    let tmp = TempDir::new().unwrap();
    let mut run = offline_run(&tmp);
    run.log([("loss", 0.5)], None);
    run.finish();

    let path = run.run_dir().join(BACKUP_FILE);
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    write!(file, "{{\"kind\":\"metric\",\"event\":{{").unwrap();
    drop(file);

    let report = backup::replay(&path, RecordingBackend::new().as_ref()).unwrap();
    assert_eq!(report.skipped_lines, 1);
    assert_eq!(report.scalars, 1);
}

#[test]
fn test_replay_stops_at_backend_error() {
    let tmp = TempDir::new().unwrap();
    let mut run = offline_run(&tmp);
    run.log([("loss", 0.5)], None);
    run.finish();

    let backend = RecordingBackend::new().fail_always(BackendError::from_status(403, "forbidden"));
    let result = backup::replay(&run.run_dir().join(BACKUP_FILE), backend.as_ref());
    assert!(result.is_err());
}

#[test]
fn test_backup_is_complete_when_upload_fails() {
    let tmp = TempDir::new().unwrap();
    let backend = RecordingBackend::new().fail_always(BackendError::from_status(400, "rejected"));
    let mut run = Run::builder(config(&tmp, RunMode::Cloud))
        .registry(RunRegistry::new())
        .backend(backend.clone())
        .start()
        .unwrap();

    for step in 0..5u64 {
        run.log([("loss", step as f64)], Some(step));
    }
    let record = run.finish();
    assert!(matches!(record.delivery, DeliveryStatus::Degraded { .. }));
    assert_eq!(record.state, RunState::Success);

    let entries = backup::read_entries(&run.run_dir().join(BACKUP_FILE)).unwrap();
    let metrics = entries
        .iter()
        .filter(|e| matches!(e, BackupEntry::Metric { .. }))
        .count();
    assert_eq!(metrics, 5);

    // The backup replays cleanly once the backend recovers
    let healthy = RecordingBackend::new();
    let report = backup::replay(&run.run_dir().join(BACKUP_FILE), healthy.as_ref()).unwrap();
    assert_eq!(report.scalars, 5);
}

#[test]
fn test_backup_stop_records_abandoned_drain() {
    let tmp = TempDir::new().unwrap();
    let backend = RecordingBackend::new().slow_scalars(Duration::from_millis(300));
    let dispatch = DispatchConfig {
        workers: 1,
        batch_size: 1,
        drain_timeout_ms: 50,
        ..fast_dispatch()
    };
    let mut run = Run::builder(config(&tmp, RunMode::Cloud).with_dispatch(dispatch))
        .registry(RunRegistry::new())
        .backend(backend.clone())
        .start()
        .unwrap();

    for step in 0..5u64 {
        run.log([("loss", step as f64)], Some(step));
    }
    let record = run.finish();
    assert_eq!(record.state, RunState::Crashed);
    assert_eq!(record.delivery, DeliveryStatus::Abandoned);

    let path = run.run_dir().join(BACKUP_FILE);
    let entries = backup::read_entries(&path).unwrap();
    match entries.last() {
        Some(BackupEntry::Stop { stop }) => {
            assert_eq!(stop.state, RunState::Crashed);
            assert!(stop.error.as_deref().is_some_and(|e| e.contains("abandoned")));
        }
        other => panic!("Expected a stop entry last, got {other:?}"),
    }

    let report = backup::replay(&path, RecordingBackend::new().as_ref()).unwrap();
    assert_eq!(report.final_state, Some(RunState::Crashed));
}
