//! Field coercion: raw cell + field descriptor -> typed value or error.
//!
//! Dispatches on [`FieldKind`]; enumerated fields are matched against their
//! choices before any kind-specific rule runs. Pure logic, no I/O.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::Serialize;

use crate::registry::{FieldDescriptor, FieldKind};
use crate::value::CellValue;

// ── Error taxonomy ───────────────────────────────────────────────────

/// Classified per-cell / per-row failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RequiredFieldMissing,
    InvalidChoice,
    InvalidNumberFormat,
    ValueOutOfRange,
    InvalidDateFormat,
    InvalidBoolean,
    StringTooLong,
    DuplicateKey,
    MissingRequiredReference,
    /// `update_only` row whose business key matches no stored record.
    RecordNotFound,
    ConstraintViolation,
    DatabaseTimeout,
    BulkWriteError,
    CriticalError,
}

impl ErrorKind {
    /// Kinds that only skip their row and never abort a strict run: a
    /// repeated or already existing key, or a key with nothing to update.
    pub fn is_planned_skip(&self) -> bool {
        matches!(self, Self::DuplicateKey | Self::RecordNotFound)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequiredFieldMissing => "required_field_missing",
            Self::InvalidChoice => "invalid_choice",
            Self::InvalidNumberFormat => "invalid_number_format",
            Self::ValueOutOfRange => "value_out_of_range",
            Self::InvalidDateFormat => "invalid_date_format",
            Self::InvalidBoolean => "invalid_boolean",
            Self::StringTooLong => "string_too_long",
            Self::DuplicateKey => "duplicate_key",
            Self::MissingRequiredReference => "missing_required_reference",
            Self::RecordNotFound => "record_not_found",
            Self::ConstraintViolation => "constraint_violation",
            Self::DatabaseTimeout => "database_timeout",
            Self::BulkWriteError => "bulk_write_error",
            Self::CriticalError => "critical_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured validation failure for one field of one row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ValidationError {
    pub fn new(field: &str, kind: ErrorKind, message: impl Into<String>, value: Option<&CellValue>) -> Self {
        Self {
            field: field.to_string(),
            kind,
            message: message.into(),
            value: value.filter(|v| !v.is_null()).map(ToString::to_string),
        }
    }
}

/// Successful coercion, possibly with a non-blocking warning.
#[derive(Debug, Clone, PartialEq)]
pub struct Coerced {
    pub value: CellValue,
    pub warning: Option<String>,
}

impl Coerced {
    fn ok(value: CellValue) -> Self {
        Self {
            value,
            warning: None,
        }
    }
}

// ── Formats ──────────────────────────────────────────────────────────

/// Date formats tried in order; the first successful parse wins.
pub const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y"];

/// Time suffixes appended to each date format for datetime parsing.
const TIME_FORMATS: &[&str] = &[" %H:%M:%S", " %H:%M", "T%H:%M:%S%.f", "T%H:%M:%S", "T%H:%M"];

/// Offset-carrying datetime formats tried after RFC 3339.
const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M:%S%:z"];

const TRUE_LITERALS: &[&str] = &["true", "1", "yes", "si", "sí"];
const FALSE_LITERALS: &[&str] = &["false", "0", "no"];

/// Characters stripped from phone numbers.
const PHONE_NOISE: &[char] = &['-', '(', ')', '.'];

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid regex")
});

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9]{4,20}$").expect("valid regex"));

// ── Coercion ─────────────────────────────────────────────────────────

/// Coerce a raw cell according to `field`.
///
/// Blank input yields the field default (or null) unless the field is
/// required. Already-typed values of the right kind pass through unchanged.
pub fn coerce(raw: &CellValue, field: &FieldDescriptor) -> Result<Coerced, ValidationError> {
    if raw.is_blank() {
        if field.required {
            return Err(ValidationError::new(
                &field.name,
                ErrorKind::RequiredFieldMissing,
                format!("{} is required", field.label),
                None,
            ));
        }
        return Ok(Coerced::ok(
            field.default_value.clone().unwrap_or(CellValue::Null),
        ));
    }

    if field.is_enumerated() {
        return coerce_choice(raw, field).map(Coerced::ok);
    }

    match field.kind {
        FieldKind::Text => coerce_text(raw, field).map(Coerced::ok),
        FieldKind::Integer | FieldKind::Decimal => coerce_number(raw, field).map(Coerced::ok),
        FieldKind::Date => coerce_date(raw, field).map(Coerced::ok),
        FieldKind::Datetime => coerce_datetime(raw, field).map(Coerced::ok),
        FieldKind::Boolean => coerce_boolean(raw, field).map(Coerced::ok),
        FieldKind::Email => coerce_email(raw, field),
        FieldKind::Phone => coerce_phone(raw, field),
        FieldKind::Reference => Ok(Coerced::ok(CellValue::Text(raw.to_string().trim().to_string()))),
    }
}

fn coerce_choice(raw: &CellValue, field: &FieldDescriptor) -> Result<CellValue, ValidationError> {
    let text = raw.to_string();
    let text = text.trim();

    if let Some(choice) = field.choices.iter().find(|c| c.value == text) {
        return Ok(CellValue::Text(choice.value.clone()));
    }
    if let Some(value) = match_choice_ignore_case(text, field) {
        return Ok(value);
    }
    // `Status.ACTIVE` style qualified names.
    if let Some((_, unqualified)) = text.rsplit_once('.') {
        if let Some(value) = match_choice_ignore_case(unqualified.trim(), field) {
            return Ok(value);
        }
    }

    Err(ValidationError::new(
        &field.name,
        ErrorKind::InvalidChoice,
        format!(
            "'{text}' is not a valid {}. Must be one of: {}",
            field.label,
            field.choice_list()
        ),
        Some(raw),
    ))
}

fn match_choice_ignore_case(text: &str, field: &FieldDescriptor) -> Option<CellValue> {
    let lowered = text.to_lowercase();
    field
        .choices
        .iter()
        .find(|c| c.value.to_lowercase() == lowered || c.label.to_lowercase() == lowered)
        .map(|c| CellValue::Text(c.value.clone()))
}

fn coerce_text(raw: &CellValue, field: &FieldDescriptor) -> Result<CellValue, ValidationError> {
    let text = raw.to_string().trim().to_string();
    check_length(&text, raw, field)?;
    Ok(CellValue::Text(text))
}

fn check_length(text: &str, raw: &CellValue, field: &FieldDescriptor) -> Result<(), ValidationError> {
    if let Some(max) = field.max_length {
        let len = text.chars().count();
        if len > max {
            return Err(ValidationError::new(
                &field.name,
                ErrorKind::StringTooLong,
                format!("{} is {len} characters long, maximum is {max}", field.label),
                Some(raw),
            ));
        }
    }
    Ok(())
}

fn coerce_number(raw: &CellValue, field: &FieldDescriptor) -> Result<CellValue, ValidationError> {
    let invalid = || {
        ValidationError::new(
            &field.name,
            ErrorKind::InvalidNumberFormat,
            format!("{} must be a number", field.label),
            Some(raw),
        )
    };

    let number = match raw {
        CellValue::Integer(i) => *i as f64,
        CellValue::Decimal(f) => *f,
        CellValue::Text(s) => parse_number(s).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    if !number.is_finite() {
        return Err(invalid());
    }

    if field.min_value.is_some_and(|min| number < min)
        || field.max_value.is_some_and(|max| number > max)
    {
        return Err(ValidationError::new(
            &field.name,
            ErrorKind::ValueOutOfRange,
            format!(
                "{} must be between {} and {}",
                field.label,
                field.min_value.map_or("-inf".to_string(), |v| v.to_string()),
                field.max_value.map_or("inf".to_string(), |v| v.to_string()),
            ),
            Some(raw),
        ));
    }

    if field.kind == FieldKind::Integer {
        if let CellValue::Integer(i) = raw {
            return Ok(CellValue::Integer(*i));
        }
        if number.fract() != 0.0 || number < i64::MIN as f64 || number > i64::MAX as f64 {
            return Err(ValidationError::new(
                &field.name,
                ErrorKind::InvalidNumberFormat,
                format!("{} must be a whole number", field.label),
                Some(raw),
            ));
        }
        return Ok(CellValue::Integer(number as i64));
    }
    Ok(CellValue::Decimal(number))
}

fn coerce_date(raw: &CellValue, field: &FieldDescriptor) -> Result<CellValue, ValidationError> {
    let date = match raw {
        CellValue::Date(d) => Some(*d),
        CellValue::LocalDateTime(dt) => Some(dt.date()),
        CellValue::DateTime(dt) => Some(dt.date_naive()),
        CellValue::Text(s) => parse_date(s).or_else(|| parse_naive_datetime(s).map(|dt| dt.date())),
        _ => None,
    };
    date.map(CellValue::Date)
        .ok_or_else(|| invalid_date(raw, field))
}

fn coerce_datetime(raw: &CellValue, field: &FieldDescriptor) -> Result<CellValue, ValidationError> {
    match raw {
        CellValue::DateTime(_) | CellValue::LocalDateTime(_) => Ok(raw.clone()),
        CellValue::Date(d) => Ok(CellValue::LocalDateTime(d.and_time(NaiveTime::MIN))),
        CellValue::Text(s) => parse_datetime(s).ok_or_else(|| invalid_date(raw, field)),
        _ => Err(invalid_date(raw, field)),
    }
}

fn invalid_date(raw: &CellValue, field: &FieldDescriptor) -> ValidationError {
    ValidationError::new(
        &field.name,
        ErrorKind::InvalidDateFormat,
        format!(
            "{} is not a recognised date (expected one of: YYYY-MM-DD, DD/MM/YYYY, MM/DD/YYYY, DD-MM-YYYY)",
            field.label
        ),
        Some(raw),
    )
}

fn coerce_boolean(raw: &CellValue, field: &FieldDescriptor) -> Result<CellValue, ValidationError> {
    let parsed = match raw {
        CellValue::Boolean(b) => Some(*b),
        CellValue::Integer(1) => Some(true),
        CellValue::Integer(0) => Some(false),
        CellValue::Decimal(f) if *f == 1.0 => Some(true),
        CellValue::Decimal(f) if *f == 0.0 => Some(false),
        CellValue::Text(s) => parse_boolean(s),
        _ => None,
    };
    parsed.map(CellValue::Boolean).ok_or_else(|| {
        ValidationError::new(
            &field.name,
            ErrorKind::InvalidBoolean,
            format!("{} must be yes/no, true/false or 1/0", field.label),
            Some(raw),
        )
    })
}

fn coerce_email(raw: &CellValue, field: &FieldDescriptor) -> Result<Coerced, ValidationError> {
    let text = raw.to_string().trim().to_string();
    check_length(&text, raw, field)?;
    let warning = (!EMAIL_RE.is_match(&text))
        .then(|| format!("{} '{text}' does not look like an email address", field.label));
    Ok(Coerced {
        value: CellValue::Text(text),
        warning,
    })
}

fn coerce_phone(raw: &CellValue, field: &FieldDescriptor) -> Result<Coerced, ValidationError> {
    let cleaned: String = raw
        .to_string()
        .chars()
        .filter(|c| !c.is_whitespace() && !PHONE_NOISE.contains(c))
        .collect();
    check_length(&cleaned, raw, field)?;
    let warning = (!PHONE_RE.is_match(&cleaned))
        .then(|| format!("{} '{cleaned}' does not look like a phone number", field.label));
    Ok(Coerced {
        value: CellValue::Text(cleaned),
        warning,
    })
}

// ── Parsers (shared with file profiling) ─────────────────────────────

/// Parse a floating-point literal. Returns `None` for non-numeric or
/// non-finite input.
pub fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Parse a date using [`DATE_FORMATS`] in order.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Parse a datetime without offset: each date format combined with each
/// time suffix.
pub fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    DATE_FORMATS.iter().find_map(|date_fmt| {
        TIME_FORMATS.iter().find_map(|time_fmt| {
            NaiveDateTime::parse_from_str(s, &format!("{date_fmt}{time_fmt}")).ok()
        })
    })
}

/// Parse a datetime cell. Offset-carrying input keeps its offset; naive
/// input stays naive; a bare date becomes midnight.
pub fn parse_datetime(s: &str) -> Option<CellValue> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(CellValue::DateTime(dt));
    }
    if let Some(dt) = OFFSET_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| DateTime::<FixedOffset>::parse_from_str(s, fmt).ok())
    {
        return Some(CellValue::DateTime(dt));
    }
    if let Some(dt) = parse_naive_datetime(s) {
        return Some(CellValue::LocalDateTime(dt));
    }
    parse_date(s).map(|d| CellValue::LocalDateTime(d.and_time(NaiveTime::MIN)))
}

/// Case-insensitive boolean literal parsing.
pub fn parse_boolean(s: &str) -> Option<bool> {
    let lowered = s.trim().to_lowercase();
    if TRUE_LITERALS.contains(&lowered.as_str()) {
        Some(true)
    } else if FALSE_LITERALS.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

// ── Tests ────────────────────────────────────────────────────────────
