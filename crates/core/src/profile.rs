//! File profiling heuristics: format, encoding, delimiter, headers, and
//! per-column type guesses.
//!
//! Only the decisions live here; the engine's readers feed them bytes and
//! rows.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use serde::Serialize;

use crate::coercion::{parse_date, parse_datetime, parse_number};
use crate::value::{CellValue, Row};

/// Rows inspected for column samples and type guesses.
pub const SAMPLE_WINDOW_ROWS: usize = 100;

/// Sample values kept per detected column.
pub const SAMPLE_VALUES_PER_COLUMN: usize = 5;

/// Fraction of non-blank samples that must parse as a kind to guess it.
pub const TYPE_GUESS_THRESHOLD: f64 = 0.8;

/// Delimiters considered by [`detect_delimiter`], in tie-break order.
pub const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

// ── Format / encoding ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Csv,
    Xlsx,
    Xls,
}

impl FileFormat {
    /// Detect the format from a file name's extension (case-insensitive).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "xlsx" => Some(Self::Xlsx),
            "xls" => Some(Self::Xls),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Xls => "xls",
        }
    }

    pub fn is_spreadsheet(&self) -> bool {
        !matches!(self, Self::Csv)
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    Utf8,
    /// The usual encoding of spreadsheet exports that are not UTF-8.
    Windows1252,
}

impl TextEncoding {
    /// UTF-8 if `sample` carries a UTF-8 BOM or decodes cleanly, otherwise
    /// Windows-1252. A multi-byte sequence cut off at the end of the sample
    /// does not count against UTF-8.
    pub fn detect(sample: &[u8]) -> Self {
        if let Some((encoding, _)) = Encoding::for_bom(sample) {
            if encoding == UTF_8 {
                return Self::Utf8;
            }
        }
        let valid = Encoding::utf8_valid_up_to(sample);
        if valid == sample.len() || is_truncated_utf8(&sample[valid..]) {
            Self::Utf8
        } else {
            Self::Windows1252
        }
    }

    pub fn encoding(&self) -> &'static Encoding {
        match self {
            Self::Utf8 => UTF_8,
            Self::Windows1252 => WINDOWS_1252,
        }
    }

    /// Decode one field. Malformed sequences are replaced rather than
    /// rejected; a BOM is kept for header normalisation to strip.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let (text, _had_errors) = self.encoding().decode_without_bom_handling(bytes);
        text.into_owned()
    }
}

/// Whether `tail` is the start of a UTF-8 sequence missing only its last
/// continuation bytes.
fn is_truncated_utf8(tail: &[u8]) -> bool {
    let Some((&lead, rest)) = tail.split_first() else {
        return false;
    };
    let width = match lead {
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => return false,
    };
    tail.len() < width && rest.iter().all(|b| (0x80..=0xBF).contains(b))
}

/// Pick the candidate delimiter occurring most often in the header line.
/// Defaults to a comma when none occurs.
pub fn detect_delimiter(header_line: &[u8]) -> u8 {
    let mut best = (b',', 0usize);
    for candidate in CANDIDATE_DELIMITERS {
        let count = header_line.iter().filter(|b| **b == candidate).count();
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

/// The first line of `bytes`, without BOM or line terminator.
pub fn first_line(bytes: &[u8]) -> &[u8] {
    let body = Encoding::for_bom(bytes).map_or(bytes, |(_, bom_len)| &bytes[bom_len..]);
    let end = body.iter().position(|b| *b == b'\n').unwrap_or(body.len());
    let line = &body[..end];
    line.strip_suffix(b"\r").unwrap_or(line)
}

// ── Headers ──────────────────────────────────────────────────────────

/// Trim headers, name blank ones `column_N` (1-based position), and
/// suffix repeats with `_2`, `_3`, ...
pub fn normalize_headers(raw: &[String]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    raw.iter()
        .enumerate()
        .map(|(idx, header)| {
            let trimmed = header.trim().trim_start_matches('\u{feff}').trim();
            let base = if trimmed.is_empty() {
                format!("column_{}", idx + 1)
            } else {
                trimmed.to_string()
            };
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{base}_{count}")
            }
        })
        .collect()
}

/// A row is blank when every cell is blank text or null.
pub fn is_blank_row<'a>(cells: impl IntoIterator<Item = &'a CellValue>) -> bool {
    cells
        .into_iter()
        .all(|c| matches!(c, CellValue::Null) || matches!(c, CellValue::Text(s) if s.trim().is_empty()))
}

// ── Column profiling ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Numeric,
    Date,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedColumn {
    pub name: String,
    pub samples: Vec<CellValue>,
    pub guessed_type: ColumnType,
}

/// What the session manager learned about an uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileProfile {
    pub file_name: String,
    pub size_bytes: u64,
    pub format: FileFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<TextEncoding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
    pub total_rows: usize,
}

/// Profile each column over the sample window rows.
pub fn detect_columns(headers: &[String], window: &[Row]) -> Vec<DetectedColumn> {
    headers
        .iter()
        .map(|name| {
            let values: Vec<&CellValue> = window
                .iter()
                .filter_map(|row| row.get(name))
                .filter(|v| !v.is_blank())
                .collect();
            DetectedColumn {
                name: name.clone(),
                samples: values
                    .iter()
                    .take(SAMPLE_VALUES_PER_COLUMN)
                    .map(|v| (*v).clone())
                    .collect(),
                guessed_type: guess_column_type(&values),
            }
        })
        .collect()
}

/// Guess a coarse column type from non-blank sample values.
pub fn guess_column_type(values: &[&CellValue]) -> ColumnType {
    if values.is_empty() {
        return ColumnType::Text;
    }
    let total = values.len() as f64;
    let numeric = values.iter().filter(|v| looks_numeric(v)).count() as f64;
    if numeric / total >= TYPE_GUESS_THRESHOLD {
        return ColumnType::Numeric;
    }
    let dates = values.iter().filter(|v| looks_like_date(v)).count() as f64;
    if dates / total >= TYPE_GUESS_THRESHOLD {
        return ColumnType::Date;
    }
    ColumnType::Text
}

fn looks_numeric(value: &CellValue) -> bool {
    match value {
        CellValue::Integer(_) | CellValue::Decimal(_) => true,
        CellValue::Text(s) => parse_number(s).is_some(),
        _ => false,
    }
}

fn looks_like_date(value: &CellValue) -> bool {
    match value {
        CellValue::Date(_) | CellValue::LocalDateTime(_) | CellValue::DateTime(_) => true,
        CellValue::Text(s) => parse_date(s).is_some() || parse_datetime(s).is_some(),
        _ => false,
    }
}
