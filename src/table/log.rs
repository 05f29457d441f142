//! Append-only record log backing the ingest and cleanse stage outputs.
//!
//! K_i: Exactly one producer appends; any number of readers take
//! point-in-time snapshots. A micro-batch is appended durably as a unit
//! before it becomes visible in memory, so readers never observe a
//! partially-applied batch.

use crate::models::{MedallionError, Record, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Append-only ordered sequence of records, persisted as JSONL.
#[derive(Debug)]
pub struct RecordLog {
    name: String,
    path: PathBuf,
    /// In-memory copy; extended only after a durable append
    records: RwLock<Vec<Record>>,
    /// Append handle, serialized across writers
    file: Mutex<File>,
}

impl RecordLog {
    /// Open a log at `path`, creating the file if absent and reloading
    /// any records persisted by an earlier run.
    ///
    /// A torn trailing line (crash mid-append before sync) is dropped
    /// with a warning and truncated away, so the next append starts on
    /// a fresh line. A record counts as committed only once its
    /// terminating newline is on disk; a malformed line anywhere else
    /// is an error.
    pub fn open(name: impl Into<String>, path: &Path) -> Result<Self> {
        let name = name.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MedallionError::io("creating table dir", e))?;
        }

        let mut records = Vec::new();
        let mut keep_len = 0u64;
        let mut disk_len = 0u64;
        if path.exists() {
            let data = std::fs::read_to_string(path)
                .map_err(|e| MedallionError::io("reading record log", e))?;
            disk_len = data.len() as u64;
            let chunks: Vec<&str> = data.split_inclusive('\n').collect();
            let last = chunks.len().saturating_sub(1);

            for (idx, chunk) in chunks.iter().enumerate() {
                if !chunk.ends_with('\n') {
                    // Only a crash mid-append leaves an unterminated
                    // tail; that record was never acknowledged.
                    warn!(log = %name, "Dropping torn trailing line");
                    break;
                }
                let line = chunk.trim();
                if line.is_empty() {
                    keep_len += chunk.len() as u64;
                    continue;
                }
                match serde_json::from_str::<Record>(line) {
                    Ok(record) => {
                        records.push(record);
                        keep_len += chunk.len() as u64;
                    }
                    Err(e) if idx == last => {
                        warn!(log = %name, "Dropping torn trailing line: {e}");
                        break;
                    }
                    Err(e) => {
                        return Err(MedallionError::ParseError(format!(
                            "{}: line {}: {e}",
                            path.display(),
                            idx + 1
                        )));
                    }
                }
            }
            debug!(log = %name, records = records.len(), "Reloaded record log");
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| MedallionError::io("opening record log for append", e))?;

        if keep_len < disk_len {
            // Drop the fragment from disk too; appending after it would
            // glue the next record onto the torn line and lose both.
            file.set_len(keep_len)
                .map_err(|e| MedallionError::io("truncating record log", e))?;
            file.sync_all()
                .map_err(|e| MedallionError::io("syncing record log", e))?;
        }

        Ok(Self {
            name,
            path: path.to_path_buf(),
            records: RwLock::new(records),
            file: Mutex::new(file),
        })
    }

    /// Append a micro-batch, all-or-nothing.
    ///
    /// Lines are written and synced before the in-memory copy is extended,
    /// so the batch becomes visible to readers only once durable.
    /// Returns the new length of the log.
    pub fn append_batch(&self, batch: &[Record]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(self.len());
        }

        let mut buf = Vec::with_capacity(batch.len() * 64);
        for record in batch {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| MedallionError::Internal(format!("Serializing record: {e}")))?;
            buf.push(b'\n');
        }

        {
            let mut file = self
                .file
                .lock()
                .map_err(|_| MedallionError::Internal("record log file lock poisoned".into()))?;
            file.write_all(&buf)
                .map_err(|e| MedallionError::io("appending to record log", e))?;
            file.sync_all()
                .map_err(|e| MedallionError::io("syncing record log", e))?;
        }

        let mut records = self
            .records
            .write()
            .map_err(|_| MedallionError::Internal("record log lock poisoned".into()))?;
        records.extend_from_slice(batch);
        Ok(records.len() as u64)
    }

    /// Snapshot of all records at or after `offset`.
    pub fn read_from(&self, offset: u64) -> Vec<Record> {
        let records = match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        records
            .get(offset as usize..)
            .map(|slice| slice.to_vec())
            .unwrap_or_default()
    }

    /// Number of committed records.
    pub fn len(&self) -> u64 {
        match self.records.read() {
            Ok(guard) => guard.len() as u64,
            Err(poisoned) => poisoned.into_inner().len() as u64,
        }
    }

    /// Whether the log has no committed records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log name (usually the stage output table name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// On-disk path of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
