//! Readers turning a staged file into headers and rows.
//!
//! Both formats are visited row by row: the first row is the header,
//! fully blank rows are skipped, and data rows are numbered densely from 0.
//! Counting, range reads, and batch walks share that walk, so a row index
//! means the same thing to all of them. The functions here block; callers run them on the
//! blocking pool.

pub mod delimited;
pub mod spreadsheet;

use std::ops::ControlFlow;
use std::path::Path;

use tabload_core::profile::{
    is_blank_row, normalize_headers, FileFormat, TextEncoding, SAMPLE_WINDOW_ROWS,
};
use tabload_core::value::{CellValue, Row};

use crate::error::{EngineError, EngineResult};

/// How to read a staged file, fixed when the session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLayout {
    pub format: FileFormat,
    /// Text encoding, for delimited files.
    pub encoding: Option<TextEncoding>,
    /// Field delimiter, for delimited files.
    pub delimiter: Option<u8>,
}

/// Everything learned from one full pass over a file.
#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub layout: SourceLayout,
    pub headers: Vec<String>,
    /// Non-blank data rows.
    pub total_rows: usize,
    /// The first data rows, up to [`SAMPLE_WINDOW_ROWS`].
    pub window: Vec<Row>,
}

/// Detect the layout, read the header, count rows, and keep a sample
/// window. Rows beyond the window are counted but never held.
pub fn profile(path: &Path, format: FileFormat) -> EngineResult<SourceProfile> {
    let layout = match format {
        FileFormat::Csv => delimited::sniff(path)?,
        FileFormat::Xlsx | FileFormat::Xls => SourceLayout {
            format,
            encoding: None,
            delimiter: None,
        },
    };

    let mut headers: Option<Vec<String>> = None;
    let mut total_rows = 0;
    let mut window = Vec::new();
    visit_rows(path, &layout, &mut |cells: Vec<CellValue>| {
        match &headers {
            None => {
                let raw: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
                headers = Some(normalize_headers(&raw));
            }
            Some(names) => {
                if !is_blank_row(&cells) {
                    if window.len() < SAMPLE_WINDOW_ROWS {
                        window.push(to_row(names, cells));
                    }
                    total_rows += 1;
                }
            }
        }
        ControlFlow::Continue(())
    })?;

    let headers = headers.ok_or_else(|| EngineError::Parse("File has no header row".into()))?;
    if headers.is_empty() {
        return Err(EngineError::Parse("Header row has no columns".into()));
    }
    Ok(SourceProfile {
        layout,
        headers,
        total_rows,
        window,
    })
}

/// Data rows `[start, start + len)`, clipped to the rows present.
pub fn read_rows(
    path: &Path,
    layout: &SourceLayout,
    headers: &[String],
    start: usize,
    len: usize,
) -> EngineResult<Vec<Row>> {
    let end = start.saturating_add(len);
    let mut rows = Vec::with_capacity(len.min(SAMPLE_WINDOW_ROWS * 10));
    let mut seen_header = false;
    let mut index = 0;
    visit_rows(path, layout, &mut |cells: Vec<CellValue>| {
        if !seen_header {
            seen_header = true;
            return ControlFlow::Continue(());
        }
        if is_blank_row(&cells) {
            return ControlFlow::Continue(());
        }
        if index >= end {
            return ControlFlow::Break(());
        }
        if index >= start {
            rows.push(to_row(headers, cells));
        }
        index += 1;
        ControlFlow::Continue(())
    })?;
    Ok(rows)
}

/// Visit every data row in consecutive batches of `batch_size` during a
/// single walk of the file. The last batch may be shorter; nothing is
/// visited for a file without data rows.
pub fn visit_batches(
    path: &Path,
    layout: &SourceLayout,
    headers: &[String],
    batch_size: usize,
    visit: &mut dyn FnMut(Vec<Row>) -> ControlFlow<()>,
) -> EngineResult<()> {
    let batch_size = batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut seen_header = false;
    let mut stopped = false;
    visit_rows(path, layout, &mut |cells: Vec<CellValue>| {
        if !seen_header {
            seen_header = true;
            return ControlFlow::Continue(());
        }
        if is_blank_row(&cells) {
            return ControlFlow::Continue(());
        }
        batch.push(to_row(headers, cells));
        if batch.len() == batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if visit(full).is_break() {
                stopped = true;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    })?;
    if !stopped && !batch.is_empty() {
        let _ = visit(batch);
    }
    Ok(())
}

fn visit_rows(
    path: &Path,
    layout: &SourceLayout,
    visit: &mut dyn FnMut(Vec<CellValue>) -> ControlFlow<()>,
) -> EngineResult<()> {
    match layout.format {
        FileFormat::Csv => delimited::visit_rows(path, layout, visit),
        FileFormat::Xlsx | FileFormat::Xls => spreadsheet::visit_rows(path, visit),
    }
}

/// Pair cells with headers. Short rows are padded with nulls; cells past
/// the last header are dropped.
fn to_row(headers: &[String], cells: Vec<CellValue>) -> Row {
    let mut cells = cells.into_iter();
    headers
        .iter()
        .map(|name| (name.clone(), cells.next().unwrap_or(CellValue::Null)))
        .collect()
}
