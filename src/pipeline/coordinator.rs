//! Three-hop pipeline coordinator.
//!
//! Epistemic foundation:
//! - K_i: Hops are chained through durable tables, so each stage's upstream
//!   is exactly what the previous stage has committed
//! - K_i: Quiescence is checked hop by hop in topological order; when a
//!   downstream wait begins, its target already reflects the drained
//!   upstream output
//! - B_i: Any stage can fail independently → per-stage handles, first
//!   error wins on shutdown

use super::{MetricsSnapshot, PipelineRun, StageMetrics};
use crate::checkpoint::CheckpointStore;
use crate::models::{Config, MedallionError, Record, Result};
use crate::source::{DirectorySource, StageSource};
use crate::stage::{
    AggregateTransform, CleanseTransform, IngestTransform, StageHandle, StageProcessor,
    StageState, StageWriter, Trigger,
};
use crate::table::{RecordLog, SummaryTable};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const BRONZE: &str = "bronze";
const SILVER: &str = "silver";
const GOLD: &str = "gold";

/// Raw → cleansed → aggregated, each hop independently checkpointed.
///
/// Stage outputs double as the next stage's source, so restart recovery
/// composes: every hop resumes from its own checkpoint against a durable
/// upstream.
pub struct MultiHopPipeline {
    config: Config,
    trigger: Trigger,
    bronze: Arc<RecordLog>,
    silver: Arc<RecordLog>,
    gold: Arc<SummaryTable>,
    sideline: Arc<RecordLog>,
    checkpoints: Arc<CheckpointStore>,
    metrics: BTreeMap<&'static str, Arc<StageMetrics>>,
    handles: Vec<StageHandle>,
}

impl MultiHopPipeline {
    /// Open (or reopen) the run's tables and wire the three hops.
    pub fn new(config: Config, run: &PipelineRun) -> Result<Self> {
        let trigger = Trigger::Interval(Duration::from_millis(
            config.pipeline.trigger_interval_ms,
        ));
        Self::with_trigger(config, run, trigger)
    }

    /// Same as [`MultiHopPipeline::new`] with an explicit trigger, so tests
    /// can use short intervals.
    pub fn with_trigger(config: Config, run: &PipelineRun, trigger: Trigger) -> Result<Self> {
        let bronze = Arc::new(RecordLog::open(BRONZE, &run.table_path(BRONZE))?);
        let silver = Arc::new(RecordLog::open(SILVER, &run.table_path(SILVER))?);
        let gold = Arc::new(SummaryTable::open(GOLD, &run.summary_path(GOLD))?);
        let sideline = Arc::new(RecordLog::open(
            "bronze_sideline",
            &run.sideline_path(BRONZE),
        )?);

        let metrics = [BRONZE, SILVER, GOLD]
            .into_iter()
            .map(|stage| (stage, StageMetrics::new()))
            .collect();

        Ok(Self {
            config,
            trigger,
            bronze,
            silver,
            gold,
            sideline,
            checkpoints: run.checkpoints(),
            metrics,
            handles: Vec::new(),
        })
    }

    /// Start all three stages. Each resumes from its own checkpoint.
    pub fn start(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(MedallionError::Internal(
                "pipeline already started".to_string(),
            ));
        }

        let retry_backoff = Duration::from_millis(self.config.source.retry_backoff_ms);

        let ingest = StageProcessor::new(
            BRONZE,
            Arc::new(DirectorySource::new(
                &self.config.source.dir,
                self.config.source.pattern.clone(),
            )),
            Box::new(IngestTransform),
            StageWriter::Log(Arc::clone(&self.bronze)),
            Arc::clone(&self.checkpoints),
            self.trigger.clone(),
            Arc::clone(&self.metrics[BRONZE]),
        )
        .with_sideline(Arc::clone(&self.sideline))
        .with_retry(self.config.source.max_retries, retry_backoff);

        let cleanse = StageProcessor::new(
            SILVER,
            Arc::clone(&self.bronze) as Arc<dyn StageSource>,
            Box::new(CleanseTransform::new(
                self.config.cleanse.required_field.clone(),
                BRONZE,
            )),
            StageWriter::Log(Arc::clone(&self.silver)),
            Arc::clone(&self.checkpoints),
            self.trigger.clone(),
            Arc::clone(&self.metrics[SILVER]),
        );

        let aggregate = StageProcessor::new(
            GOLD,
            Arc::clone(&self.silver) as Arc<dyn StageSource>,
            Box::new(AggregateTransform::new(
                self.config.aggregate.group_by.clone(),
                self.config.aggregate.count_field.clone(),
            )),
            StageWriter::Summary(Arc::clone(&self.gold)),
            Arc::clone(&self.checkpoints),
            self.trigger.clone(),
            Arc::clone(&self.metrics[GOLD]),
        );

        // Start order is the data order; each handle is kept for shutdown.
        for stage in [ingest, cleanse, aggregate] {
            self.handles.push(stage.start()?);
        }
        info!("All stages started");
        Ok(())
    }

    /// Wait until every hop has committed everything visible upstream.
    ///
    /// Waits in topological order within one shared deadline: by the time
    /// the silver wait begins, bronze has drained, so silver's call-time
    /// target includes bronze's output, and likewise for gold.
    pub async fn wait_until_quiescent(&mut self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        for handle in &mut self.handles {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(MedallionError::Timeout(timeout))?;
            handle.await_backlog_drained(remaining).await?;
        }
        info!("Pipeline quiescent");
        Ok(())
    }

    /// Stop every stage gracefully, upstream first. Returns the first
    /// stage error, after all stages have halted.
    pub async fn stop(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in &mut self.handles {
            if let Err(e) = handle.stop().await {
                first_err.get_or_insert(e);
            }
        }
        self.handles.clear();
        match first_err {
            Some(e) => Err(e),
            None => {
                info!("Pipeline stopped");
                Ok(())
            }
        }
    }

    /// All records the ingest stage has committed.
    pub fn bronze_records(&self) -> Vec<Record> {
        self.bronze.read_from(0)
    }

    /// All records the cleanse stage has committed.
    pub fn silver_records(&self) -> Vec<Record> {
        self.silver.read_from(0)
    }

    /// Current aggregated summary.
    pub fn gold_summary(&self) -> BTreeMap<String, i64> {
        self.gold.snapshot()
    }

    /// Records sidelined by the ingest stage.
    pub fn sidelined_records(&self) -> Vec<Record> {
        self.sideline.read_from(0)
    }

    /// Lifecycle state per stage, in hop order.
    pub fn stage_states(&self) -> Vec<(String, StageState)> {
        self.handles
            .iter()
            .map(|h| (h.name().to_string(), h.state()))
            .collect()
    }

    /// Counters per stage, in hop order.
    pub fn metrics(&self) -> BTreeMap<String, MetricsSnapshot> {
        self.metrics
            .iter()
            .map(|(stage, m)| (stage.to_string(), m.snapshot()))
            .collect()
    }
}
