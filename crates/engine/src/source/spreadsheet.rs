//! XLSX / XLS workbooks. Only the first worksheet is read.
//!
//! Cells keep their spreadsheet types: numbers, booleans, and dates reach
//! coercion already typed. The sheet is loaded whole by `calamine`, so
//! these files are bounded by the upload size limit rather than streamed.

use std::ops::ControlFlow;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use chrono::Timelike;
use tabload_core::value::CellValue;

use crate::error::{EngineError, EngineResult};

pub fn visit_rows(
    path: &Path,
    visit: &mut dyn FnMut(Vec<CellValue>) -> ControlFlow<()>,
) -> EngineResult<()> {
    let mut workbook = open_workbook_auto(path)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| EngineError::Parse("Workbook has no worksheets".into()))??;

    for row in range.rows() {
        if visit(row.iter().map(cell_value).collect()).is_break() {
            break;
        }
    }
    Ok(())
}

fn cell_value(cell: &Data) -> CellValue {
    match cell {
        Data::Empty | Data::Error(_) => CellValue::Null,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Int(i) => CellValue::Integer(*i),
        Data::Float(f) => CellValue::Decimal(*f),
        Data::Bool(b) => CellValue::Boolean(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(naive) if naive.num_seconds_from_midnight() == 0 && naive.nanosecond() == 0 => {
                CellValue::Date(naive.date())
            }
            Some(naive) => CellValue::LocalDateTime(naive),
            None => CellValue::Decimal(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_cells_are_preserved() {
        assert_eq!(cell_value(&Data::Int(7)), CellValue::Integer(7));
        assert_eq!(cell_value(&Data::Float(2.5)), CellValue::Decimal(2.5));
        assert_eq!(cell_value(&Data::Bool(true)), CellValue::Boolean(true));
        assert_eq!(
            cell_value(&Data::String("Acme".into())),
            CellValue::text("Acme")
        );
    }

    #[test]
    fn empty_and_error_cells_are_null() {
        assert_eq!(cell_value(&Data::Empty), CellValue::Null);
        assert_eq!(
            cell_value(&Data::Error(calamine::CellErrorType::Div0)),
            CellValue::Null
        );
    }

    #[test]
    fn iso_dates_pass_as_text() {
        assert_eq!(
            cell_value(&Data::DateTimeIso("2024-03-01T10:00:00".into())),
            CellValue::text("2024-03-01T10:00:00")
        );
    }

    #[test]
    fn missing_workbook_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = visit_rows(&dir.path().join("nope.xlsx"), &mut |_: Vec<CellValue>| {
            ControlFlow::Continue(())
        });
        assert!(result.is_err());
    }
}
