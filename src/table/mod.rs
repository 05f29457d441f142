//! Stage output tables.
//!
//! - `RecordLog`: append-only ordered record sequence (ingest, cleanse)
//! - `SummaryTable`: replace-on-write materialized summary (aggregate)

mod log;
mod summary;

pub use log::*;
pub use summary::*;
