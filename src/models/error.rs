//! Error types for medallion.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (non-conforming record, bad config)
//! - I^B materialized: Infrastructure failures (source unreadable, timeout)
//! - K_i violated: Internal invariant violations (checkpoint corruption, bugs)

use thiserror::Error;

/// Top-level error type for medallion.
#[derive(Debug, Error)]
pub enum MedallionError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Wait timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Upstream unavailable: {context}")]
    UpstreamUnavailable {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (requires operator intervention)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Checkpoint corruption for stage '{stage}': {detail}")]
    CheckpointCorruption { stage: String, detail: String },

    #[error("Stage '{0}' stopped before completing the awaited work")]
    StageStopped(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MedallionError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an upstream-unavailable error with context.
    pub fn upstream(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::UpstreamUnavailable {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Retryable errors never advance a stage checkpoint; the batch is
    /// re-read in full on the next attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::UpstreamUnavailable { .. }
        )
    }
}

/// Result type alias for medallion.
pub type Result<T> = std::result::Result<T, MedallionError>;
