//! Consolidated trade ledger
//!
//! The ledger is the single CSV that every downstream computation replays.
//! Rows are kept sorted by replay order and written atomically.

pub mod consolidator;
pub mod manifest;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::models::{BondTerms, Currency, InstrumentClass, Side, Trade, TradeOrigin};

pub use consolidator::{ConsolidationReport, Consolidator};
pub use manifest::{Manifest, SourceFileRecord, SourceFileState};

pub const LEDGER_COLUMNS: [&str; 14] = [
    "Date",
    "Ticker",
    "Type",
    "Qty",
    "Price",
    "Currency",
    "Country",
    "Is_SGB",
    "Issue Date",
    "Maturity Date",
    "Series",
    "Source_File",
    "Source_Row",
    "Exchange_Rate",
];

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    trades: Vec<Trade>,
}

impl Ledger {
    pub fn new(mut trades: Vec<Trade>) -> Self {
        sort_trades(&mut trades);
        Self { trades }
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Trades dated on or before `cutoff`, in replay order
    pub fn trades_through(&self, cutoff: NaiveDate) -> impl Iterator<Item = &Trade> {
        self.trades.iter().filter(move |t| t.date <= cutoff)
    }

    /// Trades dated strictly after `after` and on or before `through`
    pub fn trades_between(
        &self,
        after: NaiveDate,
        through: NaiveDate,
    ) -> impl Iterator<Item = &Trade> {
        self.trades
            .iter()
            .filter(move |t| t.date > after && t.date <= through)
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.trades.first().map(|t| t.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.trades.last().map(|t| t.date)
    }

    pub fn instruments(&self) -> BTreeSet<&str> {
        self.trades.iter().map(|t| t.instrument.as_str()).collect()
    }

    /// Drop every row that came from `file`, returning how many were removed
    pub fn remove_source(&mut self, file: &str) -> usize {
        let before = self.trades.len();
        self.trades.retain(|t| t.origin.file != file);
        before - self.trades.len()
    }

    pub fn extend(&mut self, trades: impl IntoIterator<Item = Trade>) {
        self.trades.extend(trades);
        sort_trades(&mut self.trades);
    }

    /// Load the ledger. A missing file is an empty ledger; anything
    /// unreadable is [`LedgerError::Corrupt`].
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No ledger at {:?}, starting empty", path);
            return Ok(Self::default());
        }

        let corrupt = |reason: String| LedgerError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let mut reader = ReaderBuilder::new()
            .from_path(path)
            .map_err(|e| corrupt(e.to_string()))?;
        let headers = reader.headers().map_err(|e| corrupt(e.to_string()))?.clone();
        let columns = LedgerColumns::locate(&headers).map_err(corrupt)?;

        let mut trades = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record.map_err(|e| corrupt(format!("row {}: {}", idx + 1, e)))?;
            let trade = columns
                .parse(&record)
                .map_err(|e| corrupt(format!("row {}: {}", idx + 1, e)))?;
            trades.push(trade);
        }

        info!("Loaded {} trades from ledger", trades.len());
        Ok(Self::new(trades))
    }

    /// Serialize to CSV bytes in replay order
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = WriterBuilder::new().from_writer(Vec::new());
        writer.write_record(LEDGER_COLUMNS)?;
        for trade in &self.trades {
            writer.write_record(trade_record(trade))?;
        }
        writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush ledger: {}", e))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_csv()?;
        write_atomic(path, &bytes)?;
        info!("Wrote {} trades to {:?}", self.trades.len(), path);
        Ok(())
    }
}

fn sort_trades(trades: &mut [Trade]) {
    trades.sort_by(|a, b| a.replay_key().cmp(&b.replay_key()));
}

fn fmt_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

fn fmt_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format(DATE_FORMAT).to_string())
        .unwrap_or_default()
}

fn trade_record(trade: &Trade) -> [String; 14] {
    [
        trade.date.format(DATE_FORMAT).to_string(),
        trade.instrument.clone(),
        trade.side.as_str().to_string(),
        fmt_decimal(trade.quantity),
        fmt_decimal(trade.price),
        trade.currency.code().to_string(),
        trade.country.clone().unwrap_or_default(),
        if trade.class.is_bond() { "True" } else { "False" }.to_string(),
        fmt_date(trade.bond_terms.issue_date),
        fmt_date(trade.bond_terms.maturity_date),
        trade.bond_terms.series.clone().unwrap_or_default(),
        trade.origin.file.clone(),
        trade.origin.row.to_string(),
        fmt_decimal(trade.exchange_rate),
    ]
}

/// Column positions in a ledger file, found by header name
struct LedgerColumns {
    positions: [usize; 14],
}

impl LedgerColumns {
    fn locate(headers: &StringRecord) -> std::result::Result<Self, String> {
        let mut positions = [0usize; 14];
        for (slot, name) in LEDGER_COLUMNS.iter().enumerate() {
            positions[slot] = headers
                .iter()
                .position(|h| h.trim() == *name)
                .ok_or_else(|| format!("missing column {}", name))?;
        }
        Ok(Self { positions })
    }

    fn get<'r>(&self, record: &'r StringRecord, slot: usize) -> &'r str {
        record.get(self.positions[slot]).map(str::trim).unwrap_or("")
    }

    fn parse(&self, record: &StringRecord) -> std::result::Result<Trade, String> {
        let field = |slot: usize| self.get(record, slot);
        let decimal = |slot: usize| {
            Decimal::from_str(field(slot))
                .map_err(|_| format!("invalid {} '{}'", LEDGER_COLUMNS[slot], field(slot)))
        };
        let date = |slot: usize| {
            NaiveDate::parse_from_str(field(slot), DATE_FORMAT)
                .map_err(|_| format!("invalid {} '{}'", LEDGER_COLUMNS[slot], field(slot)))
        };
        let optional_date = |slot: usize| {
            if field(slot).is_empty() {
                Ok(None)
            } else {
                date(slot).map(Some)
            }
        };
        let optional_text = |slot: usize| Some(field(slot).to_string()).filter(|s| !s.is_empty());

        Ok(Trade {
            date: date(0)?,
            instrument: field(1).to_string(),
            side: Side::from_str(field(2))?,
            quantity: decimal(3)?,
            price: decimal(4)?,
            currency: Currency::from_str(field(5))?,
            country: optional_text(6),
            class: InstrumentClass::from_bond_flag(field(7).eq_ignore_ascii_case("true")),
            bond_terms: BondTerms {
                issue_date: optional_date(8)?,
                maturity_date: optional_date(9)?,
                series: optional_text(10),
            },
            origin: TradeOrigin {
                file: field(11).to_string(),
                row: field(12)
                    .parse()
                    .map_err(|_| format!("invalid Source_Row '{}'", field(12)))?,
            },
            exchange_rate: decimal(13)?,
        })
    }
}

/// Write via a sibling temp file and rename so readers never see a partial file
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    std::fs::write(&tmp_path, bytes)
        .with_context(|| format!("Failed to write {:?}", tmp_path))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move {:?} into place", tmp_path))?;
    Ok(())
}
