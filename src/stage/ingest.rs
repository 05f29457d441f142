//! Ingest stage transform: raw arrivals → bronze.
//!
//! Schema is negotiated once, from the first non-empty batch, and stored
//! in the stage checkpoint. Every later batch validates against it;
//! non-conforming records are sidelined rather than crashing the stage.

use super::{Transform, TransformCtx, Transformed};
use crate::models::{Record, Result, Schema};
use tracing::info;

/// Raw ingest: passes conforming records through unchanged.
///
/// Ingestion metadata (`source_file`) is already attached by the
/// directory source when the row is read.
///
/// A field that is null in every record of the first batch gets no
/// schema entry, so later non-null values for it are sidelined as
/// unknown fields. Sources where a column can be entirely null at
/// start should declare it by shipping at least one typed value in
/// the first file.
pub struct IngestTransform;

impl Transform for IngestTransform {
    fn apply(&self, batch: &[Record], ctx: &mut TransformCtx<'_>) -> Result<Transformed> {
        if ctx.schema.is_none() && !batch.is_empty() {
            let inferred = Schema::infer(batch);
            info!(
                stage = %ctx.stage,
                fields = inferred.len(),
                "Inferred schema from first batch"
            );
            *ctx.schema = Some(inferred);
        }

        let mut records = Vec::with_capacity(batch.len());
        let mut sidelined = Vec::new();

        if let Some(schema) = ctx.schema.as_ref() {
            for record in batch {
                match schema.validate(record) {
                    Ok(()) => records.push(record.clone()),
                    Err(violation) => sidelined.push((record.clone(), violation.to_string())),
                }
            }
        }

        Ok(Transformed::Append { records, sidelined })
    }
}
