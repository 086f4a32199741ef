//! CSV and other delimited text files.

use std::fs::File;
use std::io::Read;
use std::ops::ControlFlow;
use std::path::Path;

use tabload_core::profile::{detect_delimiter, first_line, FileFormat, TextEncoding};
use tabload_core::value::CellValue;

use super::SourceLayout;
use crate::error::EngineResult;

/// Bytes inspected for encoding and delimiter detection.
const SNIFF_BYTES: u64 = 64 * 1024;

/// Detect encoding and delimiter from the head of the file.
pub fn sniff(path: &Path) -> EngineResult<SourceLayout> {
    let mut head = Vec::new();
    File::open(path)?.take(SNIFF_BYTES).read_to_end(&mut head)?;

    let encoding = TextEncoding::detect(&head);
    let delimiter = detect_delimiter(first_line(&head));
    tracing::debug!(
        path = %path.display(),
        ?encoding,
        delimiter = %char::from(delimiter),
        "Sniffed delimited file",
    );
    Ok(SourceLayout {
        format: FileFormat::Csv,
        encoding: Some(encoding),
        delimiter: Some(delimiter),
    })
}

/// Visit every record, header included, as text cells.
pub fn visit_rows(
    path: &Path,
    layout: &SourceLayout,
    visit: &mut dyn FnMut(Vec<CellValue>) -> ControlFlow<()>,
) -> EngineResult<()> {
    let encoding = layout.encoding.unwrap_or(TextEncoding::Utf8);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(layout.delimiter.unwrap_or(b','))
        .from_path(path)?;

    let mut record = csv::ByteRecord::new();
    while reader.read_byte_record(&mut record)? {
        let cells = record
            .iter()
            .map(|field| CellValue::Text(encoding.decode(field)))
            .collect();
        if visit(cells).is_break() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    fn collect(file: &tempfile::NamedTempFile) -> Vec<Vec<CellValue>> {
        let layout = sniff(file.path()).unwrap();
        let mut rows = Vec::new();
        visit_rows(file.path(), &layout, &mut |cells: Vec<CellValue>| {
            rows.push(cells);
            ControlFlow::Continue(())
        })
        .unwrap();
        rows
    }

    #[test]
    fn sniffs_semicolons_and_utf8() {
        let file = make_file("código;nombre\n1;Caja\n".as_bytes());
        let layout = sniff(file.path()).unwrap();
        assert_eq!(layout.delimiter, Some(b';'));
        assert_eq!(layout.encoding, Some(TextEncoding::Utf8));
    }

    #[test]
    fn windows_1252_bytes_are_decoded() {
        // "año;€ 12" as exported by a Windows spreadsheet.
        let file = make_file(b"name;price\na\xF1o;\x80 12\n");
        let layout = sniff(file.path()).unwrap();
        assert_eq!(layout.encoding, Some(TextEncoding::Windows1252));
        let rows = collect(&file);
        assert_eq!(rows[1], vec![CellValue::text("año"), CellValue::text("€ 12")]);
    }

    #[test]
    fn quoted_fields_keep_delimiters() {
        let file = make_file(b"name,notes\n\"Acme, Inc\",\"said \"\"hi\"\"\"\n");
        let rows = collect(&file);
        assert_eq!(
            rows[1],
            vec![CellValue::text("Acme, Inc"), CellValue::text("said \"hi\"")]
        );
    }

    #[test]
    fn visiting_stops_on_break() {
        let file = make_file(b"n\n1\n2\n3\n");
        let layout = sniff(file.path()).unwrap();
        let mut seen = 0;
        visit_rows(file.path(), &layout, &mut |_: Vec<CellValue>| {
            seen += 1;
            if seen == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
        assert_eq!(seen, 2);
    }
}
