//! Directory source: a folder of arriving JSONL files.
//!
//! Epistemic foundation:
//! - K_i: Arrival is append-only; files are never modified in place and
//!   names grow monotonically, so the sorted file list is a stable sequence
//! - B_i: The directory may be temporarily unreadable → UpstreamUnavailable
//! - I^B: A malformed line cannot become a record; it is logged and skipped
//!   rather than stalling ingestion

use super::{Batch, StageSource};
use crate::models::{MedallionError, Record, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Polls a directory for arriving row files.
///
/// Position is the index into the lexicographically sorted list of files
/// matching the configured glob pattern. Each accepted record is annotated
/// with its originating file under `source_file` (ingestion metadata).
pub struct DirectorySource {
    name: String,
    dir: PathBuf,
    pattern: String,
}

impl DirectorySource {
    /// Create a source over `dir` matching `pattern` (e.g. `*.json`).
    pub fn new(dir: &Path, pattern: impl Into<String>) -> Self {
        let dir = dir.to_path_buf();
        Self {
            name: dir.to_string_lossy().into_owned(),
            dir,
            pattern: pattern.into(),
        }
    }

    /// Sorted list of files currently matching the pattern.
    fn matching_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Err(MedallionError::upstream(
                format!("source dir {} does not exist", self.dir.display()),
                std::io::Error::new(std::io::ErrorKind::NotFound, "missing directory"),
            ));
        }

        let pattern = self.dir.join(&self.pattern);
        let entries = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| MedallionError::Internal(format!("Invalid glob pattern: {e}")))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| MedallionError::upstream("listing source dir", e.into()))?;
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Read one arrival file into records, annotating each with the file name.
    fn read_file(&self, path: &Path) -> Result<Vec<Record>> {
        let file = File::open(path).map_err(|e| {
            MedallionError::upstream(format!("opening {}", path.display()), e)
        })?;
        let reader = BufReader::new(file);

        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut records = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                MedallionError::upstream(format!("reading {}", path.display()), e)
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(&line) {
                Ok(mut record) => {
                    record.set("source_file", serde_json::json!(source_file));
                    records.push(record);
                }
                Err(e) => {
                    warn!(
                        file = %path.display(),
                        line = line_num + 1,
                        "Skipping malformed line: {e}"
                    );
                }
            }
        }
        Ok(records)
    }
}

impl StageSource for DirectorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn end_position(&self) -> Result<u64> {
        Ok(self.matching_files()?.len() as u64)
    }

    fn fetch(&self, from: u64) -> Result<Batch> {
        let files = self.matching_files()?;
        let next_position = files.len() as u64;

        let mut records = Vec::new();
        for path in files.iter().skip(from as usize) {
            records.extend(self.read_file(path)?);
        }

        Ok(Batch {
            records,
            next_position,
        })
    }
}
