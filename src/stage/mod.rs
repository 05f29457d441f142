//! Stage module - continuous incremental stage processors.
//!
//! A stage is a long-lived task pulling micro-batches from an upstream
//! source, applying one transform, and committing output + checkpoint.

mod aggregate;
mod cleanse;
mod ingest;
mod processor;

pub use aggregate::*;
pub use cleanse::*;
pub use ingest::*;
pub use processor::*;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Lifecycle state of a stage.
///
/// `NotStarted → BacklogDraining → Streaming → Stopped`; any state can
/// move to `Stopped` on shutdown or unrecoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Processor built but not yet started
    NotStarted,
    /// Consuming the backlog present at start time
    BacklogDraining,
    /// Caught up; processing new arrivals as they appear
    Streaming,
    /// Halted, gracefully or by an unrecoverable error
    Stopped,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageState::NotStarted => "not-started",
            StageState::BacklogDraining => "backlog-draining",
            StageState::Streaming => "streaming",
            StageState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What wakes a stage between micro-batches.
///
/// I^R: injectable so tests can drive micro-batches deterministically
/// with `Manual` instead of wall-clock waits.
#[derive(Clone)]
pub enum Trigger {
    /// Timer-driven micro-batches
    Interval(Duration),
    /// One micro-batch per `notify_one` call
    Manual(Arc<Notify>),
}

impl Trigger {
    /// Build a manual trigger plus the notifier that drives it.
    pub fn manual() -> (Trigger, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        (Trigger::Manual(Arc::clone(&notify)), notify)
    }
}
