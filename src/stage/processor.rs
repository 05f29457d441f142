//! Stage processor: one continuous incremental transform.
//!
//! Epistemic foundation:
//! - K_i: One micro-batch at a time within a stage; output is committed
//!   before the checkpoint advances (at-least-once on retry, never loss)
//! - K_i: Shutdown is cooperative; the signal is observed only between
//!   micro-batches, so a batch is always applied all-or-nothing
//! - B_i: The upstream may be transiently unreadable → retry with backoff,
//!   checkpoint untouched
//! - I^B: Unrecoverable errors surface through the handle and move the
//!   stage to Stopped

use super::{StageState, Trigger};
use crate::checkpoint::CheckpointStore;
use crate::models::{MedallionError, Record, Result, Schema, StageCheckpoint};
use crate::pipeline::StageMetrics;
use crate::source::{Batch, StageSource};
use crate::table::{RecordLog, SummaryTable};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Where a stage writes its output.
pub enum StageWriter {
    /// Append-only log (ingest, cleanse)
    Log(Arc<RecordLog>),
    /// Replace-on-write summary (aggregate)
    Summary(Arc<SummaryTable>),
}

/// Result of applying a transform to one micro-batch.
pub enum Transformed {
    /// Records to append, plus non-conforming records for the sideline
    Append {
        records: Vec<Record>,
        sidelined: Vec<(Record, String)>,
    },
    /// Freshly recomputed summary that replaces the sink's contents
    Replace(BTreeMap<String, i64>),
}

/// Per-batch context handed to a transform.
pub struct TransformCtx<'a> {
    /// Name of the stage running the transform
    pub stage: &'a str,
    /// Schema negotiated at first read; transforms may initialize it
    pub schema: &'a mut Option<Schema>,
    /// The stage's upstream, for transforms needing full history
    pub source: &'a dyn StageSource,
}

/// One stage's transform policy.
///
/// The processor task holds its transform across awaits, so shared
/// access from the runtime's threads must be safe.
pub trait Transform: Send + Sync {
    /// Apply the transform to a micro-batch.
    fn apply(&self, batch: &[Record], ctx: &mut TransformCtx<'_>) -> Result<Transformed>;
}

/// A continuous incremental stage: source → transform → output,
/// guarded by its own checkpoint.
pub struct StageProcessor {
    name: String,
    source: Arc<dyn StageSource>,
    transform: Box<dyn Transform>,
    output: StageWriter,
    sideline: Option<Arc<RecordLog>>,
    checkpoints: Arc<CheckpointStore>,
    trigger: Trigger,
    metrics: Arc<StageMetrics>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl StageProcessor {
    /// Build a stage processor. Not yet running; call [`StageProcessor::start`].
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn StageSource>,
        transform: Box<dyn Transform>,
        output: StageWriter,
        checkpoints: Arc<CheckpointStore>,
        trigger: Trigger,
        metrics: Arc<StageMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            transform,
            output,
            sideline: None,
            checkpoints,
            trigger,
            metrics,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }

    /// Attach a sideline log for non-conforming records.
    pub fn with_sideline(mut self, sideline: Arc<RecordLog>) -> Self {
        self.sideline = Some(sideline);
        self
    }

    /// Override the upstream retry policy.
    pub fn with_retry(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Begin continuous processing. Non-blocking; returns a handle for
    /// waiting and shutdown.
    ///
    /// Resumes strictly after the last durably written checkpoint.
    pub fn start(mut self) -> Result<StageHandle> {
        let checkpoint = self.checkpoints.read(&self.name)?;
        let position = checkpoint.as_ref().map_or(0, |c| c.position);
        let schema = checkpoint.and_then(|c| c.schema);

        match position {
            0 => info!(stage = %self.name, "Starting stage"),
            p => info!(stage = %self.name, position = p, "Resuming stage from checkpoint"),
        }

        let (state_tx, state_rx) = watch::channel(StageState::NotStarted);
        let (position_tx, position_rx) = watch::channel(position);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Draining begins as soon as the stage is started, so a caller
        // holding the handle can rely on an output location existing.
        let _ = state_tx.send(StageState::BacklogDraining);

        let name = self.name.clone();
        let source = Arc::clone(&self.source);

        let task = tokio::spawn(async move {
            let result = self
                .run(position, schema, &state_tx, &position_tx, shutdown_rx)
                .await;
            if let Err(e) = &result {
                error!(stage = %self.name, error = %e, "Stage failed");
            }
            let _ = state_tx.send(StageState::Stopped);
            result
        });

        Ok(StageHandle {
            name,
            source,
            state_rx,
            position_rx,
            shutdown_tx,
            task: Some(task),
        })
    }

    async fn run(
        &mut self,
        mut position: u64,
        mut schema: Option<Schema>,
        state_tx: &watch::Sender<StageState>,
        position_tx: &watch::Sender<u64>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut trigger = TriggerState::new(&self.trigger);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // Sender dropped means the handle is gone: nothing can
                    // ever stop us, so stop now.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                _ = trigger.wait() => {}
            }

            match self.cycle(&mut position, &mut schema).await {
                Ok(end) => {
                    let _ = position_tx.send(position);
                    if *state_tx.borrow() == StageState::BacklogDraining && position >= end {
                        info!(stage = %self.name, position, "Initial backlog drained");
                        let _ = state_tx.send(StageState::Streaming);
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        stage = %self.name,
                        error = %e,
                        "Upstream unavailable, retrying on next trigger"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        info!(stage = %self.name, position, "Stage stopped");
        Ok(())
    }

    /// Process one micro-batch. Returns the upstream end position observed
    /// at fetch time (used for the backlog-drained transition).
    async fn cycle(&mut self, position: &mut u64, schema: &mut Option<Schema>) -> Result<u64> {
        let batch = self.fetch_with_retry(*position).await?;
        let end = batch.next_position;
        if batch.is_empty() && end == *position {
            return Ok(end);
        }

        let batch_len = batch.records.len();
        self.metrics.add_records_in(batch_len as u64);

        let mut ctx = TransformCtx {
            stage: &self.name,
            schema,
            source: self.source.as_ref(),
        };
        let transformed = self.transform.apply(&batch.records, &mut ctx)?;

        match (&self.output, transformed) {
            (StageWriter::Log(log), Transformed::Append { records, sidelined }) => {
                let dropped = batch_len - records.len() - sidelined.len();
                if !records.is_empty() {
                    log.append_batch(&records)?;
                }
                self.metrics.add_records_out(records.len() as u64);
                if dropped > 0 {
                    self.metrics.add_dropped(dropped as u64);
                }
                if !sidelined.is_empty() {
                    self.write_sideline(sidelined)?;
                }
            }
            (StageWriter::Summary(table), Transformed::Replace(rows)) => {
                self.metrics.add_records_out(rows.len() as u64);
                table.replace(rows)?;
            }
            _ => {
                return Err(MedallionError::Internal(format!(
                    "stage '{}': transform output does not match its writer",
                    self.name
                )));
            }
        }

        // Output is durable; only now may the checkpoint move past it.
        let checkpoint = StageCheckpoint::new(&self.name, end, schema.clone());
        self.checkpoints.write(&checkpoint)?;
        *position = end;
        self.metrics.add_batch();
        Ok(end)
    }

    fn write_sideline(&self, sidelined: Vec<(Record, String)>) -> Result<()> {
        let sideline = self.sideline.as_ref().ok_or_else(|| {
            MedallionError::Internal(format!(
                "stage '{}' sidelined records but has no sideline log",
                self.name
            ))
        })?;

        let count = sidelined.len();
        let now = Utc::now().to_rfc3339();
        let annotated: Vec<Record> = sidelined
            .into_iter()
            .map(|(mut record, reason)| {
                record.set("_reject_reason", serde_json::json!(reason));
                record.set("_sidelined_at", serde_json::json!(now));
                record
            })
            .collect();
        sideline.append_batch(&annotated)?;

        self.metrics.add_sidelined(count as u64);
        warn!(stage = %self.name, count, "Sidelined non-conforming records");
        Ok(())
    }

    async fn fetch_with_retry(&self, from: u64) -> Result<Batch> {
        let mut backoff = self.retry_backoff;
        let mut attempt = 0;
        loop {
            match self.source.fetch(from) {
                Ok(batch) => return Ok(batch),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        stage = %self.name,
                        attempt,
                        error = %e,
                        "Fetch failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Owned trigger state for the run loop.
enum TriggerState {
    Ticker(tokio::time::Interval),
    Manual(Arc<Notify>),
}

impl TriggerState {
    fn new(trigger: &Trigger) -> Self {
        match trigger {
            Trigger::Interval(period) => TriggerState::Ticker(tokio::time::interval(*period)),
            Trigger::Manual(notify) => TriggerState::Manual(Arc::clone(notify)),
        }
    }

    async fn wait(&mut self) {
        match self {
            TriggerState::Ticker(interval) => {
                interval.tick().await;
            }
            TriggerState::Manual(notify) => notify.notified().await,
        }
    }
}

/// Handle to a running stage.
pub struct StageHandle {
    name: String,
    source: Arc<dyn StageSource>,
    state_rx: watch::Receiver<StageState>,
    position_rx: watch::Receiver<u64>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
}

impl StageHandle {
    /// Stage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StageState {
        *self.state_rx.borrow()
    }

    /// Last durably committed upstream position.
    pub fn position(&self) -> u64 {
        *self.position_rx.borrow()
    }

    /// Block until everything available upstream at call time has been
    /// committed by this stage.
    ///
    /// B_i(drains within the bound) → `Timeout` otherwise. Records arriving
    /// after the call may or may not be included; they never cause a hang.
    pub async fn await_backlog_drained(&mut self, timeout: Duration) -> Result<()> {
        let target = self.source.end_position()?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if *self.position_rx.borrow() >= target {
                return Ok(());
            }
            if *self.state_rx.borrow() == StageState::Stopped {
                return Err(MedallionError::StageStopped(self.name.clone()));
            }

            let Some(remaining) =
                deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                return Err(MedallionError::Timeout(timeout));
            };

            let position_rx = &mut self.position_rx;
            let state_rx = &mut self.state_rx;
            let changed = tokio::time::timeout(remaining, async {
                tokio::select! {
                    r = position_rx.changed() => r,
                    r = state_rx.changed() => r,
                }
            })
            .await;

            match changed {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    // Stage task finished and dropped its senders.
                    if *self.position_rx.borrow() >= target {
                        return Ok(());
                    }
                    return Err(MedallionError::StageStopped(self.name.clone()));
                }
                Err(_) => return Err(MedallionError::Timeout(timeout)),
            }
        }
    }

    /// Graceful shutdown: the stage finishes its current micro-batch,
    /// persists its checkpoint, then halts. Returns the stage's final
    /// result; idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(MedallionError::Internal(format!(
                    "stage '{}' task panicked: {e}",
                    self.name
                ))),
            },
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::IngestTransform;
    use serde_json::json;
    use tempfile::TempDir;

    fn stage(
        temp: &TempDir,
        trigger: Trigger,
    ) -> (StageProcessor, Arc<RecordLog>, Arc<RecordLog>, Arc<CheckpointStore>) {
        let upstream =
            Arc::new(RecordLog::open("upstream", &temp.path().join("upstream.jsonl")).unwrap());
        let output =
            Arc::new(RecordLog::open("output", &temp.path().join("output.jsonl")).unwrap());
        let checkpoints = Arc::new(CheckpointStore::new(&temp.path().join("ckpt")).unwrap());

        let processor = StageProcessor::new(
            "copy",
            Arc::clone(&upstream) as Arc<dyn StageSource>,
            Box::new(IngestTransform),
            StageWriter::Log(Arc::clone(&output)),
            Arc::clone(&checkpoints),
            trigger,
            StageMetrics::new(),
        );
        (processor, upstream, output, checkpoints)
    }

    #[tokio::test]
    async fn test_manual_trigger_drives_one_batch() {
        let temp = TempDir::new().unwrap();
        let (trigger, notify) = Trigger::manual();
        let (processor, upstream, output, checkpoints) = stage(&temp, trigger);

        upstream
            .append_batch(&[
                Record::new().with_field("state", json!("CA")),
                Record::new().with_field("state", json!("NY")),
            ])
            .unwrap();

        let mut handle = processor.start().unwrap();
        notify.notify_one();
        handle
            .await_backlog_drained(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(output.len(), 2);
        assert_eq!(handle.position(), 2);
        assert_eq!(handle.state(), StageState::Streaming);
        assert_eq!(checkpoints.read("copy").unwrap().unwrap().position, 2);

        handle.stop().await.unwrap();
        assert_eq!(handle.state(), StageState::Stopped);
        // Idempotent
        handle.stop().await.unwrap();
    }

    /// Fails the first `failures` fetches, then delegates to the log.
    struct FlakySource {
        inner: Arc<RecordLog>,
        failures: std::sync::atomic::AtomicU32,
    }

    impl FlakySource {
        fn new(inner: Arc<RecordLog>, failures: u32) -> Self {
            Self {
                inner,
                failures: std::sync::atomic::AtomicU32::new(failures),
            }
        }
    }

    impl StageSource for FlakySource {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn end_position(&self) -> Result<u64> {
            self.inner.end_position()
        }
        fn fetch(&self, from: u64) -> Result<Batch> {
            use std::sync::atomic::Ordering;
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(MedallionError::upstream(
                    "flaky upstream",
                    std::io::Error::new(std::io::ErrorKind::Interrupted, "try again"),
                ));
            }
            self.inner.fetch(from)
        }
    }

    #[tokio::test]
    async fn test_flaky_upstream_never_advances_checkpoint_until_success() {
        let temp = TempDir::new().unwrap();
        let upstream =
            Arc::new(RecordLog::open("upstream", &temp.path().join("upstream.jsonl")).unwrap());
        let output =
            Arc::new(RecordLog::open("output", &temp.path().join("output.jsonl")).unwrap());
        let checkpoints = Arc::new(CheckpointStore::new(&temp.path().join("ckpt")).unwrap());
        upstream
            .append_batch(&[Record::new().with_field("state", json!("CA"))])
            .unwrap();

        // Five failures outlast one full cycle (initial fetch + 3 retries),
        // so the first trigger must fail retryably and leave no checkpoint.
        let (trigger, notify) = Trigger::manual();
        let source = Arc::new(FlakySource::new(Arc::clone(&upstream), 5));
        let processor = StageProcessor::new(
            "copy",
            Arc::clone(&source) as Arc<dyn StageSource>,
            Box::new(IngestTransform),
            StageWriter::Log(Arc::clone(&output)),
            Arc::clone(&checkpoints),
            trigger,
            StageMetrics::new(),
        )
        .with_retry(3, Duration::from_millis(1));

        let mut handle = processor.start().unwrap();
        notify.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(checkpoints.read("copy").unwrap().is_none());
        assert!(output.is_empty());
        assert_eq!(handle.position(), 0);

        // One failure is left; the next cycle backs off once, then the
        // batch goes through and the checkpoint advances.
        notify.notify_one();
        handle
            .await_backlog_drained(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(output.len(), 1);
        assert_eq!(checkpoints.read("copy").unwrap().unwrap().position, 1);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out_without_progress() {
        let temp = TempDir::new().unwrap();
        let (trigger, _notify) = Trigger::manual();
        let (processor, upstream, _output, _checkpoints) = stage(&temp, trigger);

        upstream
            .append_batch(&[Record::new().with_field("state", json!("CA"))])
            .unwrap();

        // Never notified: the stage can make no progress.
        let mut handle = processor.start().unwrap();
        let err = handle
            .await_backlog_drained(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MedallionError::Timeout(_)));

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_skips_consumed_records() {
        let temp = TempDir::new().unwrap();

        {
            let (trigger, notify) = Trigger::manual();
            let (processor, upstream, _output, _c) = stage(&temp, trigger);
            upstream
                .append_batch(&[Record::new().with_field("state", json!("CA"))])
                .unwrap();
            let mut handle = processor.start().unwrap();
            notify.notify_one();
            handle
                .await_backlog_drained(Duration::from_secs(5))
                .await
                .unwrap();
            handle.stop().await.unwrap();
        }

        // Rebuild everything over the same files; the already-committed
        // record is not processed a second time.
        let (trigger, notify) = Trigger::manual();
        let (processor, upstream, output, _c) = stage(&temp, trigger);
        assert_eq!(output.len(), 1);
        upstream
            .append_batch(&[Record::new().with_field("state", json!("NY"))])
            .unwrap();

        let mut handle = processor.start().unwrap();
        assert_eq!(handle.position(), 1);
        notify.notify_one();
        handle
            .await_backlog_drained(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(output.len(), 2);
        handle.stop().await.unwrap();
    }
}
