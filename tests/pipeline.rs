//! End-to-end pipeline tests: arrivals directory through bronze, silver
//! and gold, including restart recovery.

use medallion::models::{
    AggregateConfig, CleanseConfig, Config, PipelineConfig, SourceConfig,
};
use medallion::{MultiHopPipeline, PipelineRun, StageState, Trigger};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const DRAIN: Duration = Duration::from_secs(10);

// Write-then-rename so a polling pipeline never sees a half-written file.
fn write_arrival(dir: &Path, name: &str, lines: &[serde_json::Value]) {
    let content: Vec<String> = lines.iter().map(|v| v.to_string()).collect();
    let temp = dir.join(format!("{name}.tmp"));
    std::fs::write(&temp, content.join("\n")).unwrap();
    std::fs::rename(&temp, dir.join(name)).unwrap();
}

fn test_config(source_dir: &Path, data_dir: &Path) -> Config {
    Config {
        source: SourceConfig {
            dir: source_dir.to_path_buf(),
            pattern: "*.json".to_string(),
            max_retries: 3,
            retry_backoff_ms: 10,
        },
        pipeline: PipelineConfig {
            data_dir: data_dir.to_path_buf(),
            trigger_interval_ms: 10,
            quiesce_timeout_secs: 10,
        },
        cleanse: CleanseConfig::default(),
        aggregate: AggregateConfig::default(),
    }
}

fn fast_pipeline(config: Config, run: &PipelineRun) -> MultiHopPipeline {
    MultiHopPipeline::with_trigger(
        config,
        run,
        Trigger::Interval(Duration::from_millis(10)),
    )
    .unwrap()
}

fn customer(state: &str, postcode: i64) -> serde_json::Value {
    json!({"state": state, "postcode": postcode})
}

#[tokio::test]
async fn test_backlog_then_incremental_arrival() {
    let arrivals = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    write_arrival(
        arrivals.path(),
        "part-0001.json",
        &[customer("CA", 94105), customer("CA", 94016)],
    );
    write_arrival(arrivals.path(), "part-0002.json", &[customer("NY", 10001)]);

    let run = PipelineRun::setup(data.path(), "run-1").unwrap();
    let mut pipeline = fast_pipeline(test_config(arrivals.path(), data.path()), &run);
    pipeline.start().unwrap();
    pipeline.wait_until_quiescent(DRAIN).await.unwrap();

    assert_eq!(pipeline.bronze_records().len(), 3);
    assert_eq!(pipeline.silver_records().len(), 3);
    let gold = pipeline.gold_summary();
    assert_eq!(gold.get("CA"), Some(&2));
    assert_eq!(gold.get("NY"), Some(&1));

    for (_, state) in pipeline.stage_states() {
        assert_eq!(state, StageState::Streaming);
    }

    // A late arrival flows through all three hops, and the summary is a
    // fresh full recomputation rather than a merge of deltas.
    write_arrival(arrivals.path(), "part-0003.json", &[customer("NY", 10002)]);
    pipeline.wait_until_quiescent(DRAIN).await.unwrap();

    let gold = pipeline.gold_summary();
    assert_eq!(gold.get("CA"), Some(&2));
    assert_eq!(gold.get("NY"), Some(&2));

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_cleanse_drops_and_enriches() {
    let arrivals = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    write_arrival(
        arrivals.path(),
        "part-0001.json",
        &[
            customer("CA", 94105),
            customer("TX", 0),
            customer("TX", -5),
            json!({"state": "WA", "postcode": null}),
        ],
    );

    let run = PipelineRun::setup(data.path(), "run-1").unwrap();
    let mut pipeline = fast_pipeline(test_config(arrivals.path(), data.path()), &run);
    pipeline.start().unwrap();
    pipeline.wait_until_quiescent(DRAIN).await.unwrap();
    pipeline.stop().await.unwrap();

    // All four land in bronze; only the positive postcode survives cleanse.
    assert_eq!(pipeline.bronze_records().len(), 4);
    let silver = pipeline.silver_records();
    assert_eq!(silver.len(), 1);

    let survivor = &silver[0];
    assert_eq!(survivor.get("state"), Some(&json!("CA")));
    assert_eq!(survivor.get("source"), Some(&json!("bronze")));
    assert_eq!(survivor.get("source_file"), Some(&json!("part-0001.json")));
    assert!(survivor.get("receipt_time").is_some());

    assert_eq!(pipeline.gold_summary().get("CA"), Some(&1));
    assert_eq!(pipeline.metrics()["silver"].dropped, 3);
}

#[tokio::test]
async fn test_type_drift_is_sidelined_not_fatal() {
    let arrivals = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    write_arrival(arrivals.path(), "part-0001.json", &[customer("CA", 94105)]);

    let run = PipelineRun::setup(data.path(), "run-1").unwrap();
    let mut pipeline = fast_pipeline(test_config(arrivals.path(), data.path()), &run);
    pipeline.start().unwrap();
    pipeline.wait_until_quiescent(DRAIN).await.unwrap();

    // Schema is now fixed from the first batch; a string postcode in a
    // later file violates it.
    write_arrival(
        arrivals.path(),
        "part-0002.json",
        &[json!({"state": "NY", "postcode": "oops"}), customer("NY", 10001)],
    );
    pipeline.wait_until_quiescent(DRAIN).await.unwrap();
    pipeline.stop().await.unwrap();

    assert_eq!(pipeline.bronze_records().len(), 2);

    let sidelined = pipeline.sidelined_records();
    assert_eq!(sidelined.len(), 1);
    assert_eq!(sidelined[0].get("state"), Some(&json!("NY")));
    let reason = sidelined[0].get("_reject_reason").unwrap();
    assert!(reason.as_str().unwrap().contains("postcode"));
    assert!(sidelined[0].get("_sidelined_at").is_some());

    // The conforming sibling from the same file still made it through.
    assert_eq!(pipeline.gold_summary().get("NY"), Some(&1));
}

#[tokio::test]
async fn test_restart_resumes_without_reingesting() {
    let arrivals = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    write_arrival(
        arrivals.path(),
        "part-0001.json",
        &[customer("CA", 94105), customer("NY", 10001)],
    );

    let run = PipelineRun::setup(data.path(), "run-1").unwrap();
    let mut pipeline = fast_pipeline(test_config(arrivals.path(), data.path()), &run);
    pipeline.start().unwrap();
    pipeline.wait_until_quiescent(DRAIN).await.unwrap();
    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.bronze_records().len(), 2);
    drop(pipeline);

    // Same run id: tables and checkpoints are reloaded, and the already
    // consumed file is not ingested a second time.
    let run = PipelineRun::setup(data.path(), "run-1").unwrap();
    let mut pipeline = fast_pipeline(test_config(arrivals.path(), data.path()), &run);
    pipeline.start().unwrap();
    pipeline.wait_until_quiescent(DRAIN).await.unwrap();

    assert_eq!(pipeline.bronze_records().len(), 2);
    let gold = pipeline.gold_summary();
    assert_eq!(gold.get("CA"), Some(&1));
    assert_eq!(gold.get("NY"), Some(&1));

    // New arrivals after the restart still flow through.
    write_arrival(arrivals.path(), "part-0002.json", &[customer("CA", 94110)]);
    pipeline.wait_until_quiescent(DRAIN).await.unwrap();
    assert_eq!(pipeline.bronze_records().len(), 3);
    assert_eq!(pipeline.gold_summary().get("CA"), Some(&2));

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent_and_graceful() {
    let arrivals = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    write_arrival(arrivals.path(), "part-0001.json", &[customer("CA", 94105)]);

    let run = PipelineRun::setup(data.path(), "run-1").unwrap();
    let mut pipeline = fast_pipeline(test_config(arrivals.path(), data.path()), &run);
    pipeline.start().unwrap();
    pipeline.wait_until_quiescent(DRAIN).await.unwrap();

    pipeline.stop().await.unwrap();
    pipeline.stop().await.unwrap();

    // Committed state survives the shutdown intact.
    assert_eq!(pipeline.bronze_records().len(), 1);
    assert_eq!(pipeline.gold_summary().get("CA"), Some(&1));
}

#[tokio::test]
async fn test_empty_source_drains_immediately() {
    let arrivals = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();

    let run = PipelineRun::setup(data.path(), "run-1").unwrap();
    let mut pipeline = fast_pipeline(test_config(arrivals.path(), data.path()), &run);
    pipeline.start().unwrap();
    pipeline.wait_until_quiescent(DRAIN).await.unwrap();
    pipeline.stop().await.unwrap();

    assert!(pipeline.bronze_records().is_empty());
    assert!(pipeline.gold_summary().is_empty());
}
