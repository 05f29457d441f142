//! Durable per-stage checkpoint persistence.
//!
//! Epistemic foundation:
//! - K_i: One checkpoint file per stage, written atomically (write-then-rename)
//! - K_i: Position is monotone; a rollback attempt is a corruption signal
//! - B_i: Checkpoint file may not exist → Option
//! - I^B: Crash during write → the previous file stays intact

use crate::models::{MedallionError, Result, StageCheckpoint};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Checkpoint store for a single pipeline run.
///
/// Single-writer per stage; readers may observe only fully-committed files
/// because commits go through an atomic rename.
pub struct CheckpointStore {
    /// Directory holding one `<stage_id>.json` per stage
    dir: PathBuf,
}

impl CheckpointStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| MedallionError::io("creating checkpoint dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, stage_id: &str) -> PathBuf {
        self.dir.join(format!("{stage_id}.json"))
    }

    /// Read the checkpoint for a stage, `None` if it has never committed.
    ///
    /// An unreadable or mismatched file is `CheckpointCorruption`: the
    /// stage must not silently resume from a wrong position.
    pub fn read(&self, stage_id: &str) -> Result<Option<StageCheckpoint>> {
        let path = self.path(stage_id);
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(&path).map_err(|e| MedallionError::io("opening checkpoint", e))?;
        let reader = BufReader::new(file);
        let checkpoint: StageCheckpoint =
            serde_json::from_reader(reader).map_err(|e| MedallionError::CheckpointCorruption {
                stage: stage_id.to_string(),
                detail: format!("unreadable checkpoint file: {e}"),
            })?;

        if checkpoint.stage_id != stage_id {
            return Err(MedallionError::CheckpointCorruption {
                stage: stage_id.to_string(),
                detail: format!(
                    "checkpoint file belongs to stage '{}'",
                    checkpoint.stage_id
                ),
            });
        }

        Ok(Some(checkpoint))
    }

    /// Write a checkpoint atomically.
    ///
    /// Idempotent: re-writing an unchanged checkpoint is a no-op.
    /// A position lower than the stored one is rejected as corruption;
    /// progress must never roll back.
    pub fn write(&self, checkpoint: &StageCheckpoint) -> Result<()> {
        if let Some(existing) = self.read(&checkpoint.stage_id)? {
            if existing.same_progress(checkpoint) {
                debug!(stage = %checkpoint.stage_id, "Checkpoint unchanged, skipping write");
                return Ok(());
            }
            if existing.position > checkpoint.position {
                return Err(MedallionError::CheckpointCorruption {
                    stage: checkpoint.stage_id.clone(),
                    detail: format!(
                        "position would move backwards: {} -> {}",
                        existing.position, checkpoint.position
                    ),
                });
            }
        }

        // Write to temp file, then atomic rename. A failure part-way
        // leaves the previous checkpoint untouched.
        let temp_path = self.dir.join(format!("{}.tmp.json", checkpoint.stage_id));
        {
            let file = File::create(&temp_path)
                .map_err(|e| MedallionError::io("creating temp checkpoint", e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, checkpoint)
                .map_err(|e| MedallionError::Internal(format!("Serializing checkpoint: {e}")))?;
            writer
                .flush()
                .map_err(|e| MedallionError::io("flushing temp checkpoint", e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| MedallionError::io("syncing temp checkpoint", e))?;
        }

        fs::rename(&temp_path, self.path(&checkpoint.stage_id))
            .map_err(|e| MedallionError::io("renaming checkpoint", e))?;

        debug!(
            stage = %checkpoint.stage_id,
            position = checkpoint.position,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Schema;
    use tempfile::TempDir;

    #[test]
    fn test_read_missing_returns_none() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        assert!(store.read("bronze").unwrap().is_none());
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();

        let schema = Schema::infer(&[crate::models::Record::new()
            .with_field("state", serde_json::json!("CA"))]);
        let checkpoint = StageCheckpoint::new("bronze", 3, Some(schema.clone()));
        store.write(&checkpoint).unwrap();

        let loaded = store.read("bronze").unwrap().unwrap();
        assert_eq!(loaded.stage_id, "bronze");
        assert_eq!(loaded.position, 3);
        assert_eq!(loaded.schema, Some(schema));
    }

    #[test]
    fn test_rewrite_same_checkpoint_is_noop() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();

        let checkpoint = StageCheckpoint::new("silver", 7, None);
        store.write(&checkpoint).unwrap();
        let before = std::fs::read_to_string(temp.path().join("silver.json")).unwrap();

        // Same progress, different timestamp: file must not change
        let mut again = checkpoint.clone();
        again.updated_at = again.updated_at + chrono::Duration::seconds(5);
        store.write(&again).unwrap();
        let after = std::fs::read_to_string(temp.path().join("silver.json")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_rollback_rejected_as_corruption() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();

        store.write(&StageCheckpoint::new("gold", 10, None)).unwrap();
        let err = store
            .write(&StageCheckpoint::new("gold", 4, None))
            .unwrap_err();
        assert!(matches!(
            err,
            MedallionError::CheckpointCorruption { .. }
        ));

        // Stored checkpoint is untouched
        assert_eq!(store.read("gold").unwrap().unwrap().position, 10);
    }

    #[test]
    fn test_garbage_file_is_corruption() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        std::fs::write(temp.path().join("bronze.json"), "not json").unwrap();

        assert!(matches!(
            store.read("bronze").unwrap_err(),
            MedallionError::CheckpointCorruption { .. }
        ));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        store.write(&StageCheckpoint::new("bronze", 1, None)).unwrap();
        assert!(!temp.path().join("bronze.tmp.json").exists());
    }
}
