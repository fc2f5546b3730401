use calamine::{open_workbook_auto, Data, Range, Reader, Sheets};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::types::*;
use crate::sync::TableSource;

/// Reads sheets from workbooks on disk (xlsx, xlsm, xls, ods)
#[derive(Debug, Clone, Default)]
pub struct ExcelSource;

impl ExcelSource {
    pub fn new() -> Self {
        ExcelSource
    }
}

impl TableSource for ExcelSource {
    type Error = ExcelError;

    fn read_table(&self, path: &Path, table: &str) -> Result<RowSet, ExcelError> {
        read_sheet(path, table)
    }
}

/// Read a whole sheet as text rows, anchored at cell A1
pub fn read_sheet(path: &Path, sheet: &str) -> Result<RowSet, ExcelError> {
    tracing::debug!(path = %path.display(), sheet, "reading sheet");

    if !path.exists() {
        return Err(ExcelError::file_not_found(path));
    }

    let mut workbook: Sheets<_> = open_workbook_auto(path)
        .map_err(|e| ExcelError::invalid_format(format!("Failed to open workbook: {}", e)))?;

    if !workbook.sheet_names().iter().any(|name| name == sheet) {
        return Err(ExcelError::sheet_not_found(sheet));
    }

    let range = workbook
        .worksheet_range(sheet)
        .map_err(|e| ExcelError::read_error(format!("Failed to read sheet '{}': {}", sheet, e)))?;

    let rows = range_to_rows(&range);
    tracing::debug!(sheet, rows = rows.len(), "read sheet");
    Ok(rows)
}

/// Convert a used range to rows starting at A1.
///
/// calamine trims the range to its used area, so the offset of the first used
/// cell is re-applied as leading empty rows and cells. Trailing empty cells of
/// every row and trailing empty rows are dropped.
fn range_to_rows(range: &Range<Data>) -> RowSet {
    let (start_row, start_col) = range.start().unwrap_or((0, 0));

    let mut rows: RowSet = Vec::with_capacity(start_row as usize + range.height());
    rows.resize_with(start_row as usize, Vec::new);

    for cells in range.rows() {
        let mut row: Row = Vec::with_capacity(start_col as usize + cells.len());
        row.resize_with(start_col as usize, String::new);
        row.extend(cells.iter().map(cell_to_text));

        while row.last().is_some_and(|cell| cell.is_empty()) {
            row.pop();
        }
        rows.push(row);
    }

    while rows.last().is_some_and(|row| row.is_empty()) {
        rows.pop();
    }

    rows
}

/// Convert calamine Data to the text a user would see in the cell
fn cell_to_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::DateTime(dt) => {
            let f = dt.as_f64();
            format_excel_datetime(f).unwrap_or_else(|| f.to_string())
        }
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => e.to_string(),
    }
}

/// Format Excel datetime (days since 1899-12-30) to ISO 8601
fn format_excel_datetime(value: f64) -> Option<String> {
    let days = value.floor() as i64;
    let time_fraction = value.fract();

    let epoch = chrono::NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let date = epoch.checked_add_signed(chrono::Duration::days(days))?;

    let total_seconds = (time_fraction * 86400.0).round() as u32;
    if total_seconds == 0 {
        return Some(date.format("%Y-%m-%d").to_string());
    }

    // Rounding can push a value just below midnight up to 86400
    let total_seconds = total_seconds.min(86399);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    let time = chrono::NaiveTime::from_hms_opt(hours, minutes, seconds)?;
    let datetime = chrono::NaiveDateTime::new(date, time);

    Some(datetime.format("%Y-%m-%dT%H:%M:%S").to_string())
}

/// Compute SHA-256 checksum of a file
pub fn compute_checksum(path: &Path) -> Result<String, ExcelError> {
    let mut file = File::open(path)
        .map_err(|e| ExcelError::read_error(format!("Failed to open file for checksum: {}", e)))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| {
                ExcelError::read_error(format!("Failed to read file for checksum: {}", e))
            })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    let result = hasher.finalize();
    Ok(format!("{:x}", result))
}
