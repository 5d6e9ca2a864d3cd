use anyhow::{Context, Result};
use csv::ReaderBuilder;
use encoding_rs::WINDOWS_1252;
use std::path::Path;
use tracing::{debug, info};

use super::RawTable;

/// Read a CSV source file into a raw table.
///
/// Broker exports arrive as UTF-8 (with or without BOM) or Windows-1252;
/// anything that is not valid UTF-8 is decoded as Windows-1252.
pub fn read_table<P: AsRef<Path>>(file_path: P) -> Result<RawTable> {
    let path = file_path.as_ref();
    info!("Reading CSV source file: {:?}", path);

    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let text = decode_text(&bytes);
    parse_text(&text)
}

pub(crate) fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            debug!("Source is not UTF-8, decoding as Windows-1252");
            let (decoded, _, _) = WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

pub(crate) fn parse_text(text: &str) -> Result<RawTable> {
    if text.trim().is_empty() {
        return Ok(RawTable::default());
    }

    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();
    debug!("CSV headers: {:?}", headers);

    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read CSV row {}", idx + 1))?;
        rows.push(record.iter().map(|c| c.to_string()).collect());
    }

    Ok(RawTable { headers, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_strips_utf8_bom() {
        let table = parse_text(&decode_text(b"\xEF\xBB\xBFDate,Ticker\n2025-01-01,AAPL\n")).unwrap();
        assert_eq!(table.headers, vec!["Date", "Ticker"]);
        assert_eq!(table.rows, vec![vec!["2025-01-01", "AAPL"]]);
    }

    #[test]
    fn test_windows_1252_fallback() {
        // 0xE9 is 'é' in Windows-1252 and invalid as a lone UTF-8 byte
        let text = decode_text(b"Ticker,Name\nNESTLE,Soci\xE9t\xE9\n");
        assert!(text.contains("Société"));
    }

    #[test]
    fn test_trims_cells_and_keeps_ragged_rows() {
        let table = parse_text("Date , Ticker\n 2025-01-01 , AAPL , extra\n").unwrap();
        assert_eq!(table.headers, vec!["Date", "Ticker"]);
        assert_eq!(table.rows[0], vec!["2025-01-01", "AAPL", "extra"]);
    }

    #[test]
    fn test_empty_file_is_empty_table() {
        let table = parse_text("").unwrap();
        assert!(table.headers.is_empty());
        assert!(table.rows.is_empty());
    }

    #[test]
    fn test_read_table_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Date,Ticker,Type,Qty,Price,Currency").unwrap();
        writeln!(file, "2025-01-01,AAPL,BUY,10,150,USD").unwrap();

        let table = read_table(file.path()).unwrap();
        assert_eq!(table.headers.len(), 6);
        assert_eq!(table.rows.len(), 1);
    }
}
