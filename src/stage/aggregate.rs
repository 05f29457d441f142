//! Aggregate stage transform: silver → gold.
//!
//! Every cycle recomputes the complete summary from the full
//! upstream-visible history and replaces the sink's contents. This is
//! deliberately not an incremental merge: the two stop being equivalent
//! once upstream dedup or deletes exist, and the testable output is the
//! full recomputation.

use super::{Transform, TransformCtx, Transformed};
use crate::models::{Record, Result};
use std::collections::BTreeMap;

/// Group-by-key count over the full upstream history.
pub struct AggregateTransform {
    group_by: String,
    count_field: Option<String>,
}

impl AggregateTransform {
    /// Group by `group_by`; if `count_field` is set, only records with a
    /// non-null value there are counted.
    pub fn new(group_by: impl Into<String>, count_field: Option<String>) -> Self {
        Self {
            group_by: group_by.into(),
            count_field,
        }
    }
}

impl Transform for AggregateTransform {
    fn apply(&self, _batch: &[Record], ctx: &mut TransformCtx<'_>) -> Result<Transformed> {
        // The new batch only signals that something changed; the summary
        // is always rebuilt from offset zero.
        let history = ctx.source.fetch(0)?;

        let mut rows: BTreeMap<String, i64> = BTreeMap::new();
        for record in &history.records {
            if let Some(field) = &self.count_field {
                if record.get(field).map_or(true, |v| v.is_null()) {
                    continue;
                }
            }
            let Some(key) = record.get(&self.group_by) else {
                continue;
            };
            if key.is_null() {
                continue;
            }
            let key = match key {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            *rows.entry(key).or_insert(0) += 1;
        }

        Ok(Transformed::Replace(rows))
    }
}
