//! Trade source file importers
//!
//! Source files are broker exports named `trades*.csv|xlsx`, or any file
//! whose name contains `sgb` (sovereign gold bond purchases). Each file is
//! read into a [`RawTable`] and validated as a whole: one bad row rejects the
//! file.

pub mod source_csv;
pub mod source_excel;
pub mod validation;

use std::path::Path;
use tracing::info;

use crate::error::LedgerError;

pub use validation::{ParsedTrade, RowIssue};

/// Supported on-disk layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    Xlsx,
}

/// Header plus data rows of a source file, cells as trimmed strings
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Decide whether a directory entry is a trade source file
pub fn detect_source_file(file_name: &str) -> Option<SourceFormat> {
    let lower = file_name.to_lowercase();
    if lower.starts_with('.') || lower.starts_with("~$") {
        return None;
    }
    let format = if lower.ends_with(".csv") {
        SourceFormat::Csv
    } else if lower.ends_with(".xlsx") {
        SourceFormat::Xlsx
    } else {
        return None;
    };
    if lower.starts_with("trades") || lower.contains("sgb") {
        Some(format)
    } else {
        None
    }
}

/// Files named after sovereign gold bonds mark every row as a bond
pub fn is_bond_file(file_name: &str) -> bool {
    file_name.to_lowercase().contains("sgb")
}

/// Parse and validate a single source file
pub fn parse_source_file(path: &Path) -> Result<Vec<ParsedTrade>, LedgerError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let malformed = |reason: String| LedgerError::MalformedTradeFile {
        file: file_name.clone(),
        reason,
    };

    let format = detect_source_file(&file_name)
        .ok_or_else(|| malformed("not a recognised trade file name".to_string()))?;

    let table = match format {
        SourceFormat::Csv => source_csv::read_table(path),
        SourceFormat::Xlsx => source_excel::read_table(path),
    }
    .map_err(|e| malformed(format!("{:#}", e)))?;

    let trades = validation::validate_table(&file_name, &table, is_bond_file(&file_name))?;
    info!("Parsed {} trades from {}", trades.len(), file_name);
    Ok(trades)
}
