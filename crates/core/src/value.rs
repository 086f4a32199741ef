//! Cell values flowing through the import pipeline.
//!
//! The same enum carries raw cells (as read from a CSV/XLSX file) and
//! typed values (after coercion), so coercion of an already-typed value is
//! a cheap pass-through.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use serde::Serialize;
use uuid::Uuid;

/// A single cell, raw or typed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Date(NaiveDate),
    /// A timestamp without any offset information.
    LocalDateTime(NaiveDateTime),
    /// A timestamp carrying an explicit offset.
    DateTime(DateTime<FixedOffset>),
    Uuid(Uuid),
}

/// One source row: column name to raw cell, in file column order.
pub type Row = IndexMap<String, CellValue>;

/// One target record: field name to typed value, in descriptor order.
pub type Record = IndexMap<String, CellValue>;

/// Literal strings treated as "no value" by coercion and profiling.
const NULL_LITERALS: &[&str] = &["nan", "null", "none", "n/a"];

impl CellValue {
    /// Build a text cell.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Returns `true` for null, empty/whitespace text, and `nan`-style
    /// literals (including a NaN float from a spreadsheet).
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => {
                let trimmed = s.trim();
                trimmed.is_empty()
                    || NULL_LITERALS
                        .iter()
                        .any(|lit| trimmed.eq_ignore_ascii_case(lit))
            }
            Self::Decimal(f) => f.is_nan(),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns `true` if this value is a timestamp (with or without offset).
    pub fn is_timestamp(&self) -> bool {
        matches!(self, Self::LocalDateTime(_) | Self::DateTime(_))
    }

    /// Canonical text used for business-key comparison.
    ///
    /// Comparison is case-sensitive and exact; `None` for null values, which
    /// never participate in key matching.
    pub fn key_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str(""),
            Self::Text(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::LocalDateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
            Self::DateTime(dt) => f.write_str(&dt.to_rfc3339()),
            Self::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for CellValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for CellValue {
    fn from(f: f64) -> Self {
        Self::Decimal(f)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}
