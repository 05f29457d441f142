//! Replace-on-write summary table backing the aggregate stage output.

use crate::models::{MedallionError, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Materialized grouped summary, fully replaced on every update cycle.
///
/// K_i: Readers take whole-table snapshots and can never observe a
/// partially-written summary: the in-memory swap is atomic and the
/// on-disk copy goes through write-then-rename.
pub struct SummaryTable {
    name: String,
    path: PathBuf,
    rows: RwLock<BTreeMap<String, i64>>,
}

impl SummaryTable {
    /// Open a summary table at `path`, reloading a persisted copy if present.
    pub fn open(name: impl Into<String>, path: &Path) -> Result<Self> {
        let name = name.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MedallionError::io("creating table dir", e))?;
        }

        let mut rows = BTreeMap::new();
        if path.exists() {
            let file =
                File::open(path).map_err(|e| MedallionError::io("opening summary table", e))?;
            rows = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                MedallionError::ParseError(format!("{}: {e}", path.display()))
            })?;
            debug!(table = %name, rows = rows.len(), "Reloaded summary table");
        }

        Ok(Self {
            name,
            path: path.to_path_buf(),
            rows: RwLock::new(rows),
        })
    }

    /// Replace the entire contents with a freshly computed summary.
    ///
    /// Persists first (temp-write + rename), then swaps the in-memory
    /// copy under the write lock.
    pub fn replace(&self, rows: BTreeMap<String, i64>) -> Result<()> {
        let temp_path = self.path.with_extension("tmp.json");
        {
            let file = File::create(&temp_path)
                .map_err(|e| MedallionError::io("creating temp summary", e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &rows)
                .map_err(|e| MedallionError::Internal(format!("Serializing summary: {e}")))?;
            writer
                .flush()
                .map_err(|e| MedallionError::io("flushing temp summary", e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| MedallionError::io("syncing temp summary", e))?;
        }
        fs::rename(&temp_path, &self.path)
            .map_err(|e| MedallionError::io("renaming summary", e))?;

        let mut guard = self
            .rows
            .write()
            .map_err(|_| MedallionError::Internal("summary table lock poisoned".into()))?;
        *guard = rows;
        Ok(())
    }

    /// Read-only snapshot of the current summary.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        match self.rows.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }
}
