//! Field descriptors: the data-only metadata that drives coercion.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::value::CellValue;

/// Primitive kind of a field. Coercion dispatches on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Date,
    Datetime,
    Boolean,
    Email,
    Phone,
    Reference,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Date => "date",
            Self::Datetime => "datetime",
            Self::Boolean => "boolean",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Reference => "reference",
        }
    }

    /// Kinds whose canonical text form round-trips through the store, and
    /// can therefore take part in a business key.
    pub fn is_key_compatible(&self) -> bool {
        matches!(
            self,
            Self::Text | Self::Integer | Self::Date | Self::Email | Self::Phone | Self::Reference
        )
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One allowed value of an enumerated field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

impl Choice {
    pub fn new(value: &str, label: &str) -> Self {
        Self {
            value: value.to_string(),
            label: label.to_string(),
        }
    }
}

/// Target of a many-to-one reference: the lookup key in the source cell is
/// matched against `lookup_field` of `entity`, and the stored value is
/// taken from `value_column` of the matching record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceTarget {
    pub entity: String,
    pub lookup_field: String,
    pub value_column: String,
}

/// Produces a value for a required field that has neither a mapped column
/// nor a static default.
pub trait FieldGenerator: Send + Sync + fmt::Debug {
    fn generate(&self) -> CellValue;

    /// Prefix shared by every value this generator produces, when it should
    /// continue after values already in the store.
    fn stored_prefix(&self) -> Option<String> {
        None
    }

    /// Continue after `last`, the highest stored value with
    /// [`Self::stored_prefix`]. Never moves the generator backwards.
    fn resume_after(&self, _last: &str) {}
}

/// Generates `PREFIX-000001`, `PREFIX-000002`, ... codes.
#[derive(Debug)]
pub struct SequenceGenerator {
    prefix: String,
    width: usize,
    next: AtomicU64,
}

impl SequenceGenerator {
    pub fn new(prefix: &str, width: usize, start: u64) -> Self {
        Self {
            prefix: prefix.to_string(),
            width,
            next: AtomicU64::new(start),
        }
    }

    fn lead(&self) -> String {
        format!("{}-", self.prefix)
    }
}

impl FieldGenerator for SequenceGenerator {
    fn generate(&self) -> CellValue {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        CellValue::Text(format!("{}-{:0width$}", self.prefix, n, width = self.width))
    }

    fn stored_prefix(&self) -> Option<String> {
        Some(self.lead())
    }

    fn resume_after(&self, last: &str) {
        let Some(n) = last
            .strip_prefix(&self.lead())
            .and_then(|digits| digits.parse::<u64>().ok())
        else {
            return;
        };
        self.next.fetch_max(n.saturating_add(1), Ordering::Relaxed);
    }
}

/// Immutable description of one importable field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    pub unique: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<CellValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferenceTarget>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub synonyms: Vec<String>,
    #[serde(skip)]
    pub generator: Option<Arc<dyn FieldGenerator>>,
}

impl FieldDescriptor {
    pub fn new(name: &str, label: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind,
            required: false,
            unique: false,
            max_length: None,
            min_value: None,
            max_value: None,
            choices: Vec::new(),
            default_value: None,
            reference: None,
            synonyms: Vec::new(),
            generator: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_value = min;
        self.max_value = max;
        self
    }

    pub fn choices(mut self, choices: Vec<Choice>) -> Self {
        self.choices = choices;
        self
    }

    pub fn default_value(mut self, value: impl Into<CellValue>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn references(mut self, entity: &str, lookup_field: &str, value_column: &str) -> Self {
        self.reference = Some(ReferenceTarget {
            entity: entity.to_string(),
            lookup_field: lookup_field.to_string(),
            value_column: value_column.to_string(),
        });
        self
    }

    pub fn synonyms(mut self, synonyms: &[&str]) -> Self {
        self.synonyms = synonyms.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn generated_by(mut self, generator: Arc<dyn FieldGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn is_enumerated(&self) -> bool {
        !self.choices.is_empty()
    }

    /// Comma-separated list of valid choice values, for error messages.
    pub fn choice_list(&self) -> String {
        self.choices
            .iter()
            .map(|c| c.value.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
