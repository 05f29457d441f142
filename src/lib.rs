//! medallion - Incremental multi-hop dataflow over durable local tables.
//!
//! ## Architecture
//!
//! Three chained hops, each a continuous micro-batch stage with its own
//! checkpoint:
//! - **Bronze (ingest)**: Raw arrival files → append-only log, schema
//!   inferred on first read, non-conforming records sidelined
//! - **Silver (cleanse)**: Filter on a required positive field, enrich
//!   with receipt metadata
//! - **Gold (aggregate)**: Full group-by-count recomputation that
//!   replaces the summary each batch
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Filesystem/upstream uncertainties (retry, backoff)

pub mod checkpoint;
pub mod models;
pub mod pipeline;
pub mod source;
pub mod stage;
pub mod table;

// Re-exports for convenience
pub use checkpoint::CheckpointStore;
pub use models::{Config, MedallionError, Record, Result, Schema, StageCheckpoint};
pub use pipeline::{MultiHopPipeline, PipelineRun, StageMetrics};
pub use source::{DirectorySource, StageSource};
pub use stage::{StageProcessor, StageState, Trigger};
pub use table::{RecordLog, SummaryTable};
