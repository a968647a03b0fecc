//! Dispatch queue: ordering, retries, backpressure and draining.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracklab_core::{
    BackendError, DeliverySignal, DeliveryStatus, DispatchConfig, DispatchError, Dispatcher,
    LineValue, OverflowPolicy, ScalarRecord, StaticSession, UploadRecord,
};

use common::{fast_dispatch, Call, CountingSession, RecordingBackend};

fn scalar(key: &str, step: u64) -> UploadRecord {
    UploadRecord::Scalar(ScalarRecord {
        key: key.to_string(),
        step,
        epoch: step + 1,
        value: LineValue::Number(step as f64),
        created_at: Utc::now(),
    })
}

fn start(config: &DispatchConfig, backend: &Arc<RecordingBackend>) -> (Dispatcher, DeliverySignal) {
    let signal = DeliverySignal::new();
    let dispatcher = Dispatcher::start(
        config,
        backend.clone(),
        Arc::new(StaticSession),
        signal.clone(),
    )
    .expect("Failed to start dispatcher");
    (dispatcher, signal)
}

#[test]
fn test_per_column_order_is_preserved() {
    let backend = RecordingBackend::new();
    let config = DispatchConfig {
        workers: 4,
        batch_size: 3,
        ..fast_dispatch()
    };
    let (mut dispatcher, signal) = start(&config, &backend);

    for step in 0..200 {
        for key in ["loss", "acc", "lr", "grad/norm"] {
            dispatcher.enqueue(scalar(key, step)).unwrap();
        }
    }
    let report = dispatcher.finish();
    assert!(report.drained);
    assert_eq!(report.stats.enqueued, 800);
    assert_eq!(report.stats.delivered, 800);
    assert_eq!(signal.status(), DeliveryStatus::Complete);

    let delivered = backend.scalars();
    for key in ["loss", "acc", "lr", "grad/norm"] {
        let steps: Vec<u64> = delivered
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(steps, (0..200).collect::<Vec<_>>(), "order broken for {key}");
    }
}

#[test]
fn test_transient_errors_are_retried() {
    let backend = RecordingBackend::new().fail_scalars([
        BackendError::Transient("connection reset".into()),
        BackendError::from_status(503, "unavailable"),
    ]);
    let (mut dispatcher, signal) = start(&fast_dispatch(), &backend);

    dispatcher.enqueue(scalar("loss", 0)).unwrap();
    let report = dispatcher.finish();

    assert_eq!(backend.scalar_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(backend.scalars(), vec![("loss".to_string(), 0)]);
    assert_eq!(report.stats.failed, 0);
    assert_eq!(signal.status(), DeliveryStatus::Complete);
}

#[test]
fn test_retries_are_bounded() {
    let backend = RecordingBackend::new().fail_scalars(
        (0..5).map(|_| BackendError::Transient("timeout".into())),
    );
    let (mut dispatcher, signal) = start(&fast_dispatch(), &backend);

    dispatcher.enqueue(scalar("loss", 0)).unwrap();
    let report = dispatcher.finish();

    assert_eq!(backend.scalar_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(report.stats.failed, 1);
    assert!(matches!(signal.status(), DeliveryStatus::Degraded { failures: 1, .. }));
}

#[test]
fn test_fatal_errors_are_not_retried() {
    let backend = RecordingBackend::new().fail_scalars([BackendError::from_status(422, "bad metric")]);
    // Both records in one batch
    let config = DispatchConfig {
        batch_size: 100,
        flush_interval_ms: 60_000,
        ..fast_dispatch()
    };
    let (mut dispatcher, signal) = start(&config, &backend);

    dispatcher.enqueue(scalar("loss", 0)).unwrap();
    dispatcher.enqueue(scalar("loss", 1)).unwrap();
    dispatcher.finish();

    assert_eq!(backend.scalar_attempts.load(Ordering::SeqCst), 1);
    match signal.status() {
        DeliveryStatus::Degraded { failures, last_error } => {
            assert_eq!(failures, 2);
            assert!(last_error.contains("bad metric"), "{last_error}");
        }
        other => panic!("expected degraded delivery, got {other:?}"),
    }
}

#[test]
fn test_unauthorized_refreshes_session_once() {
    let backend = RecordingBackend::new().fail_scalars([BackendError::from_status(401, "expired")]);
    let session = Arc::new(CountingSession::default());
    let signal = DeliverySignal::new();
    let mut dispatcher =
        Dispatcher::start(&fast_dispatch(), backend.clone(), session.clone(), signal.clone()).unwrap();

    dispatcher.enqueue(scalar("loss", 0)).unwrap();
    dispatcher.finish();

    assert_eq!(session.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(backend.scalars().len(), 1);
    assert_eq!(signal.status(), DeliveryStatus::Complete);
}

#[test]
fn test_expiring_session_is_refreshed_before_delivery() {
    let backend = RecordingBackend::new();
    let session = Arc::new(CountingSession::default());
    session.expiring.store(true, Ordering::SeqCst);
    let mut dispatcher = Dispatcher::start(
        &fast_dispatch(),
        backend.clone(),
        session.clone(),
        DeliverySignal::new(),
    )
    .unwrap();

    dispatcher.enqueue(scalar("loss", 0)).unwrap();
    dispatcher.flush().unwrap();
    assert_eq!(session.refreshes.load(Ordering::SeqCst), 1);
    dispatcher.finish();
}

#[test]
fn test_flush_delivers_pending_records() {
    let backend = RecordingBackend::new();
    let config = DispatchConfig {
        batch_size: 1_000,
        flush_interval_ms: 60_000,
        ..fast_dispatch()
    };
    let (mut dispatcher, _) = start(&config, &backend);

    dispatcher.enqueue(scalar("loss", 0)).unwrap();
    dispatcher.enqueue(scalar("loss", 1)).unwrap();
    dispatcher.flush().unwrap();
    assert_eq!(backend.scalars().len(), 2);
    dispatcher.finish();
}

#[test]
fn test_enqueue_after_finish_is_rejected() {
    let backend = RecordingBackend::new();
    let (mut dispatcher, _) = start(&fast_dispatch(), &backend);
    let first = dispatcher.finish();

    assert!(dispatcher.is_closed());
    assert_eq!(dispatcher.enqueue(scalar("loss", 0)), Err(DispatchError::Closed));
    assert_eq!(dispatcher.flush(), Err(DispatchError::Closed));
    assert_eq!(dispatcher.finish(), first);
}

#[test]
fn test_drop_policy_counts_dropped_records() {
    let backend = RecordingBackend::new().slow_scalars(Duration::from_millis(50));
    let config = DispatchConfig {
        workers: 1,
        queue_capacity: 1,
        batch_size: 1,
        overflow: OverflowPolicy::Drop,
        ..fast_dispatch()
    };
    let (mut dispatcher, _) = start(&config, &backend);

    let mut full = 0;
    for step in 0..20 {
        if dispatcher.enqueue(scalar("loss", step)) == Err(DispatchError::QueueFull) {
            full += 1;
        }
    }
    let report = dispatcher.finish();

    assert!(full > 0, "a one-slot queue behind a slow backend must overflow");
    assert_eq!(report.stats.dropped, full);
    assert_eq!(report.stats.enqueued + report.stats.dropped, 20);
    assert_eq!(backend.scalars().len() as u64, report.stats.delivered);
}

#[test]
fn test_drain_timeout_abandons_pending_records() {
    let backend = RecordingBackend::new().slow_scalars(Duration::from_millis(300));
    let config = DispatchConfig {
        workers: 1,
        batch_size: 1,
        drain_timeout_ms: 50,
        ..fast_dispatch()
    };
    let (mut dispatcher, signal) = start(&config, &backend);

    for step in 0..5 {
        dispatcher.enqueue(scalar("loss", step)).unwrap();
    }
    let report = dispatcher.finish();

    assert!(!report.drained);
    assert_eq!(signal.status(), DeliveryStatus::Abandoned);
    assert!(report.stats.delivered < 5);
}

#[test]
fn test_columns_go_out_before_metrics_in_a_batch() {
    let backend = RecordingBackend::new();
    let config = DispatchConfig {
        workers: 1,
        ..fast_dispatch()
    };
    let (mut dispatcher, _) = start(&config, &backend);

    let column = tracklab_core::ColumnInfo {
        kid: 0,
        key: "loss".into(),
        key_encoded: "bG9zcw".into(),
        chart_type: tracklab_core::ChartType::Line,
        section: None,
        error: None,
    };
    dispatcher.enqueue(UploadRecord::Column(column)).unwrap();
    dispatcher.enqueue(scalar("loss", 0)).unwrap();
    dispatcher.finish();

    let calls = backend.calls();
    let column_at = calls.iter().position(|c| matches!(c, Call::Columns(_))).unwrap();
    let scalar_at = calls.iter().position(|c| matches!(c, Call::Scalars(_))).unwrap();
    assert!(column_at < scalar_at);
}

#[test]
fn test_invalid_config_is_rejected() {
    let backend = RecordingBackend::new();
    let config = DispatchConfig {
        workers: 0,
        ..fast_dispatch()
    };
    let result = Dispatcher::start(&config, backend, Arc::new(StaticSession), DeliverySignal::new());
    assert!(result.is_err());
}
