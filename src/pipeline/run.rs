//! On-disk layout for one pipeline run.

use crate::checkpoint::CheckpointStore;
use crate::models::{MedallionError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Filesystem root for a single run: its checkpoints and stage outputs.
///
/// ```text
/// <data_dir>/<run_id>/
///   checkpoints/<stage>.json
///   tables/<stage>.jsonl           append-only stage output
///   tables/<stage>.json            replace-on-write summary
///   tables/<stage>_sideline.jsonl  non-conforming records
/// ```
///
/// Re-running with the same `run_id` resumes from the surviving
/// checkpoints; a fresh `run_id` starts from scratch.
pub struct PipelineRun {
    run_id: String,
    root: PathBuf,
    checkpoints: Arc<CheckpointStore>,
}

impl PipelineRun {
    /// Create (or reattach to) the run directory under `data_dir`.
    pub fn setup(data_dir: &Path, run_id: impl Into<String>) -> Result<Self> {
        let run_id = run_id.into();
        let root = data_dir.join(&run_id);
        fs::create_dir_all(root.join("tables"))
            .map_err(|e| MedallionError::io("creating run directory", e))?;
        let checkpoints = Arc::new(CheckpointStore::new(&root.join("checkpoints"))?);

        info!(run_id = %run_id, root = %root.display(), "Run directory ready");
        Ok(Self {
            run_id,
            root,
            checkpoints,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoints(&self) -> Arc<CheckpointStore> {
        Arc::clone(&self.checkpoints)
    }

    /// Path for an append-only stage output.
    pub fn table_path(&self, stage: &str) -> PathBuf {
        self.root.join("tables").join(format!("{stage}.jsonl"))
    }

    /// Path for a replace-on-write summary output.
    pub fn summary_path(&self, stage: &str) -> PathBuf {
        self.root.join("tables").join(format!("{stage}.json"))
    }

    /// Path for a stage's sideline of non-conforming records.
    pub fn sideline_path(&self, stage: &str) -> PathBuf {
        self.root
            .join("tables")
            .join(format!("{stage}_sideline.jsonl"))
    }

    /// Delete everything this run wrote. Consumes the run.
    pub fn cleanup(self) -> Result<()> {
        info!(run_id = %self.run_id, "Removing run directory");
        fs::remove_dir_all(&self.root)
            .map_err(|e| MedallionError::io("removing run directory", e))
    }
}
