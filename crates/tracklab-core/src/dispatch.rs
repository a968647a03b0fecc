//! Dispatch queue: bounded, sharded delivery of upload records to a backend.
//!
//! `Dispatcher::start()` builds a dedicated tokio runtime and spawns a fixed
//! number of workers, each owning one bounded channel. Records are routed to
//! a worker by their shard key, so everything logged to one column is
//! delivered by one worker in enqueue order. Workers batch records and flush
//! when a batch fills up or the flush interval ticks.
//!
//! `enqueue()` is the only call that may block the training loop: with
//! [`OverflowPolicy::Block`] it waits for room in a full worker queue.
//! It must not be called from inside an async runtime.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendResult, SessionProvider};
use crate::config::{DispatchConfig, OverflowPolicy};
use crate::error::{BackendError, DispatchError, Result};
use crate::models::{ColumnInfo, DeliveryStatus, LogLine};
use crate::record::{FileRecord, MediaRecord, ScalarRecord, UploadRecord};

/// Commands sent to a worker.
enum WorkerCommand {
    Record(UploadRecord),
    /// Deliver the current buffer, then reply.
    Flush(oneshot::Sender<()>),
    /// Deliver everything queued before this command, then stop.
    Shutdown(oneshot::Sender<()>),
}

// ─── Shared status ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SignalInner {
    failures: AtomicU64,
    abandoned: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Delivery health shared between a run and its dispatch workers.
#[derive(Debug, Clone, Default)]
pub struct DeliverySignal {
    inner: Arc<SignalInner>,
}

impl DeliverySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, records: u64, error: &BackendError) {
        self.inner.failures.fetch_add(records.max(1), Ordering::SeqCst);
        let mut last = self.inner.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(error.to_string());
    }

    pub fn abandon(&self) {
        self.inner.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.inner.abandoned.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> DeliveryStatus {
        if self.is_abandoned() {
            return DeliveryStatus::Abandoned;
        }
        let failures = self.inner.failures.load(Ordering::SeqCst);
        if failures == 0 {
            return DeliveryStatus::Complete;
        }
        let last_error = self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default();
        DeliveryStatus::Degraded {
            failures,
            last_error,
        }
    }
}

/// Record counters, updated by the caller and the workers.
#[derive(Debug, Default)]
pub struct DispatchStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    attempts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    /// Backend calls made, retries included.
    pub attempts: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            delivered: self.delivered.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            attempts: self.attempts.load(Ordering::SeqCst),
        }
    }
}

/// Result of [`Dispatcher::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// `false` when the drain timed out and pending records were abandoned.
    pub drained: bool,
    pub stats: StatsSnapshot,
}

// ─── Retry policy ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Exponential delay before retry number `attempt` (1-based).
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

struct WorkerContext {
    backend: Arc<dyn Backend>,
    session: Arc<dyn SessionProvider>,
    stats: Arc<DispatchStats>,
    signal: DeliverySignal,
    policy: RetryPolicy,
}

pub struct Dispatcher {
    shards: Vec<mpsc::Sender<WorkerCommand>>,
    runtime: Option<Runtime>,
    closed: AtomicBool,
    overflow: OverflowPolicy,
    drain_timeout: Duration,
    stats: Arc<DispatchStats>,
    signal: DeliverySignal,
    report: Option<DrainReport>,
}

impl Dispatcher {
    /// Build the runtime and spawn the workers.
    pub fn start(
        config: &DispatchConfig,
        backend: Arc<dyn Backend>,
        session: Arc<dyn SessionProvider>,
        signal: DeliverySignal,
    ) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.workers.min(4))
            .thread_name("tracklab-dispatch")
            .enable_all()
            .build()
            .map_err(|e| DispatchError::RuntimeUnavailable(e.to_string()))?;

        let stats = Arc::new(DispatchStats::default());
        let ctx = Arc::new(WorkerContext {
            backend,
            session,
            stats: Arc::clone(&stats),
            signal: signal.clone(),
            policy: RetryPolicy::from_config(config),
        });

        let mut shards = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            runtime.spawn(worker_loop(
                id,
                rx,
                Arc::clone(&ctx),
                config.batch_size,
                config.flush_interval(),
            ));
            shards.push(tx);
        }

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Dispatcher started"
        );

        Ok(Self {
            shards,
            runtime: Some(runtime),
            closed: AtomicBool::new(false),
            overflow: config.overflow,
            drain_timeout: config.drain_timeout(),
            stats,
            signal,
            report: None,
        })
    }

    /// Queue a record for delivery.
    pub fn enqueue(&self, record: UploadRecord) -> std::result::Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        let shard = &self.shards[self.shard_for(record.shard_key())];
        let command = WorkerCommand::Record(record);
        let sent = match self.overflow {
            OverflowPolicy::Block => shard.blocking_send(command).map_err(|_| DispatchError::Closed),
            OverflowPolicy::Drop => shard.try_send(command).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
            }),
        };
        match &sent {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::SeqCst);
            }
            Err(DispatchError::QueueFull) => {
                self.stats.dropped.fetch_add(1, Ordering::SeqCst);
                warn!("Dispatch queue full, record dropped");
            }
            Err(_) => {}
        }
        sent
    }

    /// Deliver everything queued so far and wait for it.
    pub fn flush(&self) -> std::result::Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        let runtime = self.runtime.as_ref().ok_or(DispatchError::Closed)?;
        let shards = self.shards.clone();
        runtime.block_on(async move {
            let mut replies = Vec::with_capacity(shards.len());
            for tx in &shards {
                let (reply, rx) = oneshot::channel();
                tx.send(WorkerCommand::Flush(reply))
                    .await
                    .map_err(|_| DispatchError::Closed)?;
                replies.push(rx);
            }
            for rx in replies {
                rx.await.map_err(|_| DispatchError::Closed)?;
            }
            Ok::<(), DispatchError>(())
        })
    }

    /// Stop accepting records and drain the queues, waiting at most the
    /// configured drain timeout. Later calls return the first report.
    pub fn finish(&mut self) -> DrainReport {
        if let Some(report) = self.report {
            return report;
        }
        self.closed.store(true, Ordering::SeqCst);

        let shards = std::mem::take(&mut self.shards);
        let drained = match self.runtime.take() {
            Some(runtime) => {
                let timeout = self.drain_timeout;
                let drained = runtime.block_on(async move {
                    let drain = async {
                        let mut replies = Vec::with_capacity(shards.len());
                        for tx in &shards {
                            let (reply, rx) = oneshot::channel();
                            if tx.send(WorkerCommand::Shutdown(reply)).await.is_ok() {
                                replies.push(rx);
                            }
                        }
                        for rx in replies {
                            let _ = rx.await;
                        }
                    };
                    tokio::time::timeout(timeout, drain).await.is_ok()
                });
                if drained {
                    runtime.shutdown_timeout(Duration::from_secs(1));
                } else {
                    runtime.shutdown_background();
                }
                drained
            }
            None => true,
        };

        if !drained {
            self.signal.abandon();
            error!(
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Dispatch drain timed out, pending records abandoned"
            );
        }

        let report = DrainReport {
            drained,
            stats: self.stats.snapshot(),
        };
        info!(
            delivered = report.stats.delivered,
            failed = report.stats.failed,
            dropped = report.stats.dropped,
            "Dispatcher finished"
        );
        self.report = Some(report);
        report
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn shard_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Best-effort drain if the owner never called finish()
        if self.report.is_none() {
            self.finish();
        }
    }
}

// ─── Worker ───────────────────────────────────────────────────────────────────

async fn worker_loop(
    id: usize,
    mut receiver: mpsc::Receiver<WorkerCommand>,
    ctx: Arc<WorkerContext>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<UploadRecord> = Vec::with_capacity(batch_size);
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // Prioritize incoming commands
            biased;

            cmd = receiver.recv() => {
                match cmd {
                    None => {
                        deliver_batch(&ctx, &mut buffer).await;
                        break;
                    }
                    Some(WorkerCommand::Record(record)) => {
                        buffer.push(record);
                        if buffer.len() >= batch_size {
                            deliver_batch(&ctx, &mut buffer).await;
                        }
                    }
                    Some(WorkerCommand::Flush(reply)) => {
                        deliver_batch(&ctx, &mut buffer).await;
                        let _ = reply.send(());
                    }
                    Some(WorkerCommand::Shutdown(reply)) => {
                        deliver_batch(&ctx, &mut buffer).await;
                        let _ = reply.send(());
                        break;
                    }
                }
            }

            // Periodic flush
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    deliver_batch(&ctx, &mut buffer).await;
                }
            }
        }
    }
    debug!(worker = id, "Dispatch worker stopped");
}

/// Deliver a buffered batch, grouped by kind. Relative order within each
/// kind is kept, and column definitions go out before metrics.
async fn deliver_batch(ctx: &Arc<WorkerContext>, buffer: &mut Vec<UploadRecord>) {
    if buffer.is_empty() {
        return;
    }

    if ctx.session.is_expiring_soon() {
        debug!("Refreshing session before delivery");
        if let Err(e) = blocking(ctx, |_, session| session.refresh()).await {
            warn!(error = %e, "Session refresh failed");
        }
    }

    let mut columns: Vec<ColumnInfo> = Vec::new();
    let mut scalars: Vec<ScalarRecord> = Vec::new();
    let mut media: Vec<MediaRecord> = Vec::new();
    let mut logs: Vec<LogLine> = Vec::new();
    let mut files: Vec<FileRecord> = Vec::new();
    for record in buffer.drain(..) {
        match record {
            UploadRecord::Column(c) => columns.push(c),
            UploadRecord::Scalar(s) => scalars.push(s),
            UploadRecord::Media(m) => media.push(m),
            UploadRecord::Log(l) => logs.push(l),
            UploadRecord::File(f) => files.push(f),
        }
    }

    if !columns.is_empty() {
        let n = columns.len() as u64;
        let result = call_with_retry(ctx, "columns", move |b| b.post_columns(&columns)).await;
        settle(ctx, "columns", n, result);
    }
    if !scalars.is_empty() {
        let n = scalars.len() as u64;
        let result = call_with_retry(ctx, "scalars", move |b| b.post_scalars(&scalars)).await;
        settle(ctx, "scalars", n, result);
    }
    if !media.is_empty() {
        deliver_media(ctx, media).await;
    }
    if !logs.is_empty() {
        let n = logs.len() as u64;
        let result = call_with_retry(ctx, "logs", move |b| b.post_logs(&logs)).await;
        settle(ctx, "logs", n, result);
    }
    for file in files {
        let result = call_with_retry(ctx, "file", move |b| b.post_file(&file)).await;
        settle(ctx, "file", 1, result);
    }
}

/// Upload every buffer of a media record, then post the records whose
/// uploads all succeeded.
async fn deliver_media(ctx: &Arc<WorkerContext>, media: Vec<MediaRecord>) {
    let mut uploaded = Vec::with_capacity(media.len());
    'records: for record in media {
        for buffer in &record.buffers {
            let buffer = buffer.clone();
            let result = call_with_retry(ctx, "media upload", move |b| b.upload_media(&buffer)).await;
            if let Err(e) = result {
                warn!(key = %record.key, step = record.step, error = %e, "Media upload failed");
                settle(ctx, "media", 1, Err(e));
                continue 'records;
            }
        }
        uploaded.push(record);
    }
    if !uploaded.is_empty() {
        let n = uploaded.len() as u64;
        let result = call_with_retry(ctx, "media", move |b| b.post_media(&uploaded)).await;
        settle(ctx, "media", n, result);
    }
}

fn settle(ctx: &WorkerContext, op: &'static str, records: u64, result: BackendResult) {
    match result {
        Ok(()) => {
            ctx.stats.delivered.fetch_add(records, Ordering::SeqCst);
        }
        Err(e) => {
            ctx.stats.failed.fetch_add(records, Ordering::SeqCst);
            ctx.signal.record_failure(records, &e);
            error!(op, records, error = %e, "Delivery failed");
        }
    }
}

/// Run a blocking backend call on the runtime's blocking pool.
async fn blocking<F>(ctx: &Arc<WorkerContext>, f: F) -> BackendResult
where
    F: FnOnce(&dyn Backend, &dyn SessionProvider) -> BackendResult + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    match tokio::task::spawn_blocking(move || f(ctx.backend.as_ref(), ctx.session.as_ref())).await {
        Ok(result) => result,
        Err(e) => Err(BackendError::Fatal {
            status: 0,
            message: format!("backend call panicked: {e}"),
        }),
    }
}

/// Retry transient failures with exponential backoff; refresh the session
/// once on `Unauthorized`; give up at once on anything else.
async fn call_with_retry<F>(ctx: &Arc<WorkerContext>, op: &'static str, call: F) -> BackendResult
where
    F: Fn(&dyn Backend) -> BackendResult + Send + Sync + 'static,
{
    let call = Arc::new(call);
    let mut attempt: u32 = 0;
    let mut refreshed = false;
    loop {
        attempt += 1;
        ctx.stats.attempts.fetch_add(1, Ordering::SeqCst);
        let call = Arc::clone(&call);
        let result = blocking(ctx, move |backend, _| (*call)(backend)).await;
        match result {
            Ok(()) => return Ok(()),
            Err(BackendError::Unauthorized) if !refreshed => {
                refreshed = true;
                warn!(op, "Credential rejected, refreshing session");
                blocking(ctx, |_, session| session.refresh()).await?;
            }
            Err(e) if e.is_transient() && attempt < ctx.policy.max_attempts => {
                let delay = ctx.policy.delay(attempt);
                warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Transient backend error, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_signal_status() {
        let signal = DeliverySignal::new();
        assert_eq!(signal.status(), DeliveryStatus::Complete);
        signal.record_failure(3, &BackendError::from_status(500, "oops"));
        assert!(matches!(signal.status(), DeliveryStatus::Degraded { failures: 3, .. }));
        signal.abandon();
        assert_eq!(signal.status(), DeliveryStatus::Abandoned);
    }
}
