//! Cleanse stage transform: bronze → silver.
//!
//! Drops records whose required numeric field is missing, non-numeric or
//! non-positive, and enriches survivors with `receipt_time` and `source`.
//! Both derived fields are computed here, at transform time, not copied
//! from upstream.

use super::{Transform, TransformCtx, Transformed};
use crate::models::{Record, Result};
use chrono::Utc;

/// Predicate filter plus enrichment.
pub struct CleanseTransform {
    required_field: String,
    source_id: String,
}

impl CleanseTransform {
    /// `required_field` must be numeric and positive for a record to
    /// survive; `source_id` names the upstream this stage reads from.
    pub fn new(required_field: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            required_field: required_field.into(),
            source_id: source_id.into(),
        }
    }

    fn keeps(&self, record: &Record) -> bool {
        record
            .get(&self.required_field)
            .and_then(|v| v.as_f64())
            .map(|v| v > 0.0)
            .unwrap_or(false)
    }
}

impl Transform for CleanseTransform {
    fn apply(&self, batch: &[Record], _ctx: &mut TransformCtx<'_>) -> Result<Transformed> {
        let receipt_time = Utc::now().to_rfc3339();
        let records = batch
            .iter()
            .filter(|record| self.keeps(record))
            .map(|record| {
                let mut enriched = record.clone();
                enriched.set("receipt_time", serde_json::json!(receipt_time));
                enriched.set("source", serde_json::json!(self.source_id));
                enriched
            })
            .collect();

        Ok(Transformed::Append {
            records,
            sidelined: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Schema;
    use crate::source::{Batch, StageSource};
    use serde_json::json;

    struct NullSource;
    impl StageSource for NullSource {
        fn name(&self) -> &str {
            "null"
        }
        fn end_position(&self) -> Result<u64> {
            Ok(0)
        }
        fn fetch(&self, _from: u64) -> Result<Batch> {
            Ok(Batch::default())
        }
    }

    #[test]
    fn test_filter_and_enrich() {
        let transform = CleanseTransform::new("postcode", "bronze");
        let batch = vec![
            Record::new().with_field("postcode", json!(94105)),
            Record::new().with_field("postcode", json!(0)),
            Record::new().with_field("postcode", json!(null)),
            Record::new().with_field("name", json!("no postcode at all")),
        ];

        let mut schema: Option<Schema> = None;
        let source = NullSource;
        let mut ctx = TransformCtx {
            stage: "silver",
            schema: &mut schema,
            source: &source,
        };
        let out = transform.apply(&batch, &mut ctx).unwrap();

        match out {
            Transformed::Append { records, sidelined } => {
                assert!(sidelined.is_empty());
                assert_eq!(records.len(), 1);
                let survivor = &records[0];
                assert_eq!(survivor.get("postcode"), Some(&json!(94105)));
                assert!(survivor.get("receipt_time").is_some_and(|v| !v.is_null()));
                assert_eq!(survivor.get("source"), Some(&json!("bronze")));
            }
            Transformed::Replace(_) => panic!("cleanse must append"),
        }
    }
}
