//! Record, schema and checkpoint types.
//!
//! K_i: These types represent the core data flow through the pipeline.
//! A record is an immutable key-value row; a schema is the typed shape
//! negotiated at first read and validated on every batch after that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One input row flowing through the pipeline.
///
/// Identity never changes across stages; shape may (stages add fields).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    /// Field name → JSON value
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a field value by name.
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Set a field, replacing any existing value.
    pub fn set(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.fields.insert(name.into(), value);
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.set(name, value);
        self
    }
}

/// Primitive type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Boolean,
    Integer,
    Float,
    String,
    /// Nested array or object, kept opaque
    Json,
}

impl FieldType {
    /// Type of a JSON value. `None` for null (null conforms to anything).
    pub fn of(value: &serde_json::Value) -> Option<FieldType> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::Integer),
            Value::Number(_) => Some(FieldType::Float),
            Value::String(_) => Some(FieldType::String),
            Value::Array(_) | Value::Object(_) => Some(FieldType::Json),
        }
    }

    /// Widen two observed types into one.
    ///
    /// Integer ∪ Float → Float; any other conflict falls back to String,
    /// which every scalar renders into losslessly.
    pub fn merge(self, other: FieldType) -> FieldType {
        use FieldType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Float) | (Float, Integer) => Float,
            _ => String,
        }
    }

    /// Whether a value of type `actual` is acceptable where `self` is expected.
    pub fn accepts(self, actual: FieldType) -> bool {
        self == actual || (self == FieldType::Float && actual == FieldType::Integer)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Json => "json",
        };
        f.write_str(name)
    }
}

/// Typed schema descriptor, inferred from the first observed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Field name → inferred type
    pub fields: BTreeMap<String, FieldType>,
}

impl Schema {
    /// Infer a schema from a batch of records.
    ///
    /// Nulls are ignored; types seen for the same field across records are
    /// widened via [`FieldType::merge`].
    pub fn infer(records: &[Record]) -> Schema {
        let mut fields: BTreeMap<String, FieldType> = BTreeMap::new();
        for record in records {
            for (name, value) in &record.fields {
                if let Some(ty) = FieldType::of(value) {
                    fields
                        .entry(name.clone())
                        .and_modify(|existing| *existing = existing.merge(ty))
                        .or_insert(ty);
                }
            }
        }
        Schema { fields }
    }

    /// Validate a record against this schema.
    ///
    /// B_i(record conforms) → Result. Null values and absent fields are
    /// acceptable; unknown fields and type mismatches are violations.
    pub fn validate(&self, record: &Record) -> Result<(), SchemaViolation> {
        for (name, value) in &record.fields {
            let Some(actual) = FieldType::of(value) else {
                continue;
            };
            match self.fields.get(name) {
                None => {
                    return Err(SchemaViolation {
                        field: name.clone(),
                        expected: None,
                        actual,
                    });
                }
                Some(expected) if !expected.accepts(actual) => {
                    return Err(SchemaViolation {
                        field: name.clone(),
                        expected: Some(*expected),
                        actual,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Number of fields in the schema.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A record that failed schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaViolation {
    /// Offending field
    pub field: String,
    /// Expected type, `None` if the field is unknown to the schema
    pub expected: Option<FieldType>,
    /// Observed type
    pub actual: FieldType,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expected {
            Some(expected) => write!(
                f,
                "field '{}': expected {}, got {}",
                self.field, expected, self.actual
            ),
            None => write!(f, "field '{}' not present in schema", self.field),
        }
    }
}

/// Durable processing position of one stage.
///
/// K_i: `position` only moves forward. The store rejects rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCheckpoint {
    /// Stage this checkpoint belongs to
    pub stage_id: String,

    /// Upstream offset of the next unprocessed element
    pub position: u64,

    /// Schema inferred at first read, if the stage negotiates one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,

    /// Timestamp of the last successful batch
    pub updated_at: DateTime<Utc>,
}

impl StageCheckpoint {
    /// Create a checkpoint at the given position.
    pub fn new(stage_id: impl Into<String>, position: u64, schema: Option<Schema>) -> Self {
        Self {
            stage_id: stage_id.into(),
            position,
            schema,
            updated_at: Utc::now(),
        }
    }

    /// Whether two checkpoints describe the same progress.
    ///
    /// Ignores `updated_at`; used to make re-writes a no-op.
    pub fn same_progress(&self, other: &StageCheckpoint) -> bool {
        self.stage_id == other.stage_id
            && self.position == other.position
            && self.schema == other.schema
    }
}
