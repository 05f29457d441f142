//! Checkpoint module for resumable stage execution.
//!
//! Provides:
//! - `CheckpointStore`: Atomic persistence and loading of per-stage
//!   positions and inferred schemas

mod store;

pub use store::*;
