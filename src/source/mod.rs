//! Upstream sources for stage processors.
//!
//! A stage reads from either the arrival directory (`DirectorySource`)
//! or another stage's output log; both sit behind `StageSource`.

mod dir;

pub use dir::*;

use crate::models::{Record, Result};
use crate::table::RecordLog;

/// A batch of newly-available records plus the position to resume from.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Records in arrival order
    pub records: Vec<Record>,
    /// Offset of the next unread element
    pub next_position: u64,
}

impl Batch {
    /// Whether the batch carries no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read side of a stage's upstream.
///
/// Positions are opaque monotone offsets: file index for the arrival
/// directory, record offset for a stage output log. `fetch` must be a
/// consistent snapshot of everything available at `from` when called.
pub trait StageSource: Send + Sync {
    /// Human-readable source name for logs and enrichment.
    fn name(&self) -> &str;

    /// Position just past the last currently-available element.
    fn end_position(&self) -> Result<u64>;

    /// All records from `from` up to the current end.
    fn fetch(&self, from: u64) -> Result<Batch>;
}

impl StageSource for RecordLog {
    fn name(&self) -> &str {
        RecordLog::name(self)
    }

    fn end_position(&self) -> Result<u64> {
        Ok(self.len())
    }

    fn fetch(&self, from: u64) -> Result<Batch> {
        let records = self.read_from(from);
        let next_position = from + records.len() as u64;
        Ok(Batch {
            records,
            next_position,
        })
    }
}
