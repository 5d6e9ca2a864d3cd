use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook, Data, Reader, Xlsx};
use chrono::NaiveDate;
use std::path::Path;
use tracing::{debug, info};

use super::RawTable;

/// Read the first worksheet of an XLSX source file into a raw table.
///
/// The first non-empty row is the header. Date cells are rendered as
/// `YYYY-MM-DD` so the validator sees the same text as in a CSV export.
pub fn read_table<P: AsRef<Path>>(file_path: P) -> Result<RawTable> {
    let path = file_path.as_ref();
    info!("Reading Excel source file: {:?}", path);

    let mut workbook: Xlsx<_> = open_workbook(path).context("Failed to open Excel file")?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("Workbook has no worksheets"))?;
    debug!("Using worksheet: {}", sheet_name);

    let range = workbook
        .worksheet_range(&sheet_name)
        .context("Failed to read worksheet")?;

    let mut rows = range
        .rows()
        .map(|row| row.iter().map(cell_text).collect::<Result<Vec<String>>>())
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .skip_while(|row| row.iter().all(|c| c.is_empty()));

    let headers = rows.next().unwrap_or_default();
    Ok(RawTable {
        headers,
        rows: rows.collect(),
    })
}

fn cell_text(cell: &Data) -> Result<String> {
    let text = match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64())?
            .format("%Y-%m-%d")
            .to_string(),
        Data::DateTimeIso(s) => s.chars().take(10).collect(),
        Data::Error(e) => return Err(anyhow!("Excel cell error: {:?}", e)),
        other => other.to_string(),
    };
    Ok(text)
}

/// Excel stores dates as days since 1899-12-30
pub(crate) fn excel_serial_to_date(serial: f64) -> Result<NaiveDate> {
    let excel_epoch =
        NaiveDate::from_ymd_opt(1899, 12, 30).ok_or_else(|| anyhow!("Invalid Excel epoch"))?;
    excel_epoch
        .checked_add_signed(chrono::Duration::days(serial.floor() as i64))
        .ok_or_else(|| anyhow!("Date overflow for Excel serial {}", serial))
}
