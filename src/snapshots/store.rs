//! Snapshot persistence
//!
//! One snapshot is three files in the snapshots directory:
//!
//! - `holdings_snapshot_<date>.csv`: one row per instrument ever traded
//! - `lots_snapshot_<date>.csv`: open lots in FIFO order
//! - `cashflows_snapshot_<date>.json`: every cash flow up to the cutoff
//!
//! The holdings file is written last and its presence is what makes a
//! snapshot exist.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use super::{Snapshot, SnapshotStore};
use crate::error::SnapshotError;
use crate::ledger::write_atomic;
use crate::models::{CashFlow, Currency, InstrumentClass, InstrumentPosition, Lot};

const HOLDINGS_PREFIX: &str = "holdings_snapshot_";
const LOTS_PREFIX: &str = "lots_snapshot_";
const CASHFLOWS_PREFIX: &str = "cashflows_snapshot_";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Serialize, Deserialize)]
struct HoldingRecord {
    #[serde(rename = "Instrument")]
    instrument: String,
    #[serde(rename = "Qty")]
    #[serde(with = "rust_decimal::serde::str")]
    quantity: Decimal,
    #[serde(rename = "Avg Cost")]
    #[serde(with = "rust_decimal::serde::str")]
    average_cost: Decimal,
    #[serde(rename = "Total Invested")]
    #[serde(with = "rust_decimal::serde::str")]
    total_invested: Decimal,
    #[serde(rename = "Realized Profit")]
    #[serde(with = "rust_decimal::serde::str")]
    realized_profit: Decimal,
    #[serde(rename = "Currency")]
    currency: Currency,
    #[serde(rename = "Exchange Rate")]
    #[serde(with = "rust_decimal::serde::str")]
    exchange_rate: Decimal,
    #[serde(rename = "Instrument Class")]
    class: InstrumentClass,
    #[serde(rename = "Year End Price", with = "rust_decimal::serde::str_option")]
    year_end_price: Option<Decimal>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LotRecord {
    #[serde(rename = "Instrument")]
    instrument: String,
    #[serde(rename = "Date")]
    date: NaiveDate,
    #[serde(rename = "Qty")]
    #[serde(with = "rust_decimal::serde::str")]
    quantity: Decimal,
    #[serde(rename = "Unit Cost")]
    #[serde(with = "rust_decimal::serde::str")]
    unit_cost: Decimal,
    #[serde(rename = "Currency")]
    currency: Currency,
    #[serde(rename = "Exchange Rate")]
    #[serde(with = "rust_decimal::serde::str")]
    exchange_rate: Decimal,
}

impl From<&Lot> for LotRecord {
    fn from(lot: &Lot) -> Self {
        Self {
            instrument: lot.instrument.clone(),
            date: lot.date,
            quantity: lot.quantity,
            unit_cost: lot.unit_cost,
            currency: lot.currency,
            exchange_rate: lot.exchange_rate,
        }
    }
}

impl From<LotRecord> for Lot {
    fn from(record: LotRecord) -> Self {
        Self {
            instrument: record.instrument,
            date: record.date,
            quantity: record.quantity,
            unit_cost: record.unit_cost,
            currency: record.currency,
            exchange_rate: record.exchange_rate,
        }
    }
}

/// Snapshots stored as files under one directory
pub struct DirSnapshotStore {
    dir: PathBuf,
}

impl DirSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, prefix: &str, cutoff: NaiveDate, ext: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}.{}", prefix, cutoff.format(DATE_FORMAT), ext))
    }

    pub fn holdings_path(&self, cutoff: NaiveDate) -> PathBuf {
        self.file(HOLDINGS_PREFIX, cutoff, "csv")
    }

    fn lots_path(&self, cutoff: NaiveDate) -> PathBuf {
        self.file(LOTS_PREFIX, cutoff, "csv")
    }

    fn cashflows_path(&self, cutoff: NaiveDate) -> PathBuf {
        self.file(CASHFLOWS_PREFIX, cutoff, "json")
    }

    fn read_lots(&self, cutoff: NaiveDate) -> Result<BTreeMap<String, Vec<Lot>>> {
        let path = self.lots_path(cutoff);
        let mut lots: BTreeMap<String, Vec<Lot>> = BTreeMap::new();
        if !path.exists() {
            return Ok(lots);
        }
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        for record in reader.deserialize::<LotRecord>() {
            let lot: Lot = record
                .with_context(|| format!("Invalid lot row in {:?}", path))?
                .into();
            lots.entry(lot.instrument.clone()).or_default().push(lot);
        }
        Ok(lots)
    }

    fn read_cash_flows(&self, cutoff: NaiveDate) -> Result<Vec<CashFlow>> {
        let path = self.cashflows_path(cutoff);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid cash flows in {:?}", path))
    }
}

fn csv_bytes<T: Serialize>(rows: impl IntoIterator<Item = T>) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to flush snapshot rows: {}", e))
}

impl SnapshotStore for DirSnapshotStore {
    fn cutoffs(&self) -> Result<Vec<NaiveDate>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut cutoffs: Vec<NaiveDate> = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {:?}", self.dir))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let date = name.strip_prefix(HOLDINGS_PREFIX)?.strip_suffix(".csv")?;
                NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
            })
            .collect();
        cutoffs.sort();
        Ok(cutoffs)
    }

    fn load(&self, cutoff: NaiveDate) -> Result<Option<Snapshot>> {
        let path = self.holdings_path(cutoff);
        if !path.exists() {
            return Ok(None);
        }
        debug!("Loading snapshot {:?}", path);
        let mut lots = self.read_lots(cutoff)?;
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;

        let mut positions = Vec::new();
        let mut year_end_prices = BTreeMap::new();
        for record in reader.deserialize::<HoldingRecord>() {
            let row = record.with_context(|| format!("Invalid holding row in {:?}", path))?;
            if let Some(price) = row.year_end_price {
                year_end_prices.insert(row.instrument.clone(), price);
            }
            positions.push(InstrumentPosition {
                lots: lots.remove(&row.instrument).unwrap_or_default(),
                instrument: row.instrument,
                quantity: row.quantity,
                average_cost: row.average_cost,
                total_invested: row.total_invested,
                realized_profit: row.realized_profit,
                currency: row.currency,
                exchange_rate: row.exchange_rate,
                class: row.class,
            });
        }

        Ok(Some(Snapshot {
            cutoff,
            positions,
            year_end_prices,
            cash_flows: self.read_cash_flows(cutoff)?,
        }))
    }

    fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        let holdings_path = self.holdings_path(snapshot.cutoff);
        if holdings_path.exists() {
            return Err(SnapshotError::AlreadyExists {
                cutoff: snapshot.cutoff,
                path: holdings_path,
            }
            .into());
        }

        let lots = csv_bytes(
            snapshot
                .positions
                .iter()
                .flat_map(|p| p.lots.iter().map(LotRecord::from)),
        )?;
        write_atomic(&self.lots_path(snapshot.cutoff), &lots)?;

        let flows = serde_json::to_vec_pretty(&snapshot.cash_flows)?;
        write_atomic(&self.cashflows_path(snapshot.cutoff), &flows)?;

        let holdings = csv_bytes(snapshot.positions.iter().map(|p| HoldingRecord {
            instrument: p.instrument.clone(),
            quantity: p.quantity,
            average_cost: p.average_cost,
            total_invested: p.total_invested,
            realized_profit: p.realized_profit,
            currency: p.currency,
            exchange_rate: p.exchange_rate,
            class: p.class,
            year_end_price: snapshot.year_end_prices.get(&p.instrument).copied(),
        }))?;
        write_atomic(&holdings_path, &holdings)?;

        info!(
            "Wrote snapshot {} ({} instruments) to {:?}",
            snapshot.cutoff,
            snapshot.positions.len(),
            holdings_path
        );
        Ok(())
    }

    fn clear(&self) -> Result<usize> {
        let cutoffs = self.cutoffs()?;
        for cutoff in &cutoffs {
            for path in [
                self.holdings_path(*cutoff),
                self.lots_path(*cutoff),
                self.cashflows_path(*cutoff),
            ] {
                if path.exists() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("Failed to remove {:?}", path))?;
                }
            }
        }
        if !cutoffs.is_empty() {
            info!("Removed {} snapshots from {:?}", cutoffs.len(), self.dir);
        }
        Ok(cutoffs.len())
    }
}

/// In-memory snapshot store for tests
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<BTreeMap<NaiveDate, Snapshot>>,
}

impl MemorySnapshotStore {
    fn guard(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<NaiveDate, Snapshot>>> {
        self.snapshots
            .lock()
            .map_err(|_| anyhow!("snapshot store lock poisoned"))
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn cutoffs(&self) -> Result<Vec<NaiveDate>> {
        Ok(self.guard()?.keys().copied().collect())
    }

    fn load(&self, cutoff: NaiveDate) -> Result<Option<Snapshot>> {
        Ok(self.guard()?.get(&cutoff).cloned())
    }

    fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        let mut snapshots = self.guard()?;
        if snapshots.contains_key(&snapshot.cutoff) {
            return Err(SnapshotError::AlreadyExists {
                cutoff: snapshot.cutoff,
                path: PathBuf::from("<memory>"),
            }
            .into());
        }
        snapshots.insert(snapshot.cutoff, snapshot.clone());
        Ok(())
    }

    fn clear(&self) -> Result<usize> {
        let mut snapshots = self.guard()?;
        let removed = snapshots.len();
        snapshots.clear();
        Ok(removed)
    }
}
