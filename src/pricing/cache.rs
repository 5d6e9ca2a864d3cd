//! Persistent last-known-price cache
//!
//! One row per (instrument, date). Legacy files without a date column load
//! with `date = None`, which sorts as the earliest entry and is rewritten
//! in the current layout on the next save.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use csv::{ReaderBuilder, WriterBuilder};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ledger::write_atomic;

const HEADERS: [&str; 3] = ["Ticker", "Date", "Closing Price"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceCacheEntry {
    pub instrument: String,
    pub date: Option<NaiveDate>,
    pub price: Decimal,
}

impl PriceCacheEntry {
    pub fn new(instrument: impl Into<String>, date: NaiveDate, price: Decimal) -> Self {
        Self {
            instrument: instrument.into(),
            date: Some(date),
            price,
        }
    }
}

/// Latest and previous distinct-date prices for an instrument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPrice {
    pub latest: PriceCacheEntry,
    pub previous: Option<PriceCacheEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub updated: usize,
    pub added: usize,
}

/// Storage backend for cached prices. Backends only read and replace the
/// full entry list; merge and lookup rules live in the provided methods.
pub trait PriceCacheStore {
    fn entries(&self) -> Result<Vec<PriceCacheEntry>>;

    fn replace_all(&self, entries: &[PriceCacheEntry]) -> Result<()>;

    /// Most recent and second most recent price per instrument, ignoring
    /// entries dated after `through`
    fn load(&self, through: NaiveDate) -> Result<HashMap<String, CachedPrice>> {
        let mut entries: Vec<PriceCacheEntry> = self
            .entries()?
            .into_iter()
            .filter(|e| e.date.map_or(true, |d| d <= through))
            .collect();
        entries.sort_by(storage_order);

        let mut cached: HashMap<String, CachedPrice> = HashMap::new();
        for entry in entries {
            match cached.get_mut(&entry.instrument) {
                None => {
                    cached.insert(
                        entry.instrument.clone(),
                        CachedPrice {
                            latest: entry,
                            previous: None,
                        },
                    );
                }
                Some(c) if c.previous.is_none() && c.latest.date != entry.date => {
                    c.previous = Some(entry);
                }
                Some(_) => {}
            }
        }
        Ok(cached)
    }

    /// Latest entry for `instrument` dated on or before `date`
    fn lookup(&self, instrument: &str, date: NaiveDate) -> Result<Option<PriceCacheEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.instrument == instrument && e.date.map_or(true, |d| d <= date))
            .max_by(|a, b| a.date.cmp(&b.date)))
    }

    /// Upsert by (instrument, date) and persist
    fn save(&self, updates: &[PriceCacheEntry]) -> Result<SaveStats> {
        if updates.is_empty() {
            return Ok(SaveStats::default());
        }
        let mut entries = self.entries()?;
        let stats = merge_entries(&mut entries, updates);
        self.replace_all(&entries)?;
        info!(
            "Price cache saved: updated {}, added {}",
            stats.updated, stats.added
        );
        Ok(stats)
    }
}

/// Instrument ascending, date descending, undated (legacy) rows last
fn storage_order(a: &PriceCacheEntry, b: &PriceCacheEntry) -> Ordering {
    a.instrument
        .cmp(&b.instrument)
        .then_with(|| b.date.cmp(&a.date))
}

pub fn merge_entries(entries: &mut Vec<PriceCacheEntry>, updates: &[PriceCacheEntry]) -> SaveStats {
    let mut stats = SaveStats::default();
    for update in updates {
        match entries
            .iter_mut()
            .find(|e| e.instrument == update.instrument && e.date == update.date)
        {
            Some(existing) => {
                existing.price = update.price;
                stats.updated += 1;
            }
            None => {
                entries.push(update.clone());
                stats.added += 1;
            }
        }
    }
    entries.sort_by(storage_order);
    stats
}

/// CSV-backed cache (`Ticker, Date, Closing Price`)
#[derive(Debug, Clone)]
pub struct CsvPriceCache {
    path: PathBuf,
}

impl CsvPriceCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PriceCacheStore for CsvPriceCache {
    fn entries(&self) -> Result<Vec<PriceCacheEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .with_context(|| format!("Failed to open price cache {:?}", self.path))?;

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.to_lowercase().replace([' ', '_'], ""))
            .collect();
        let find = |names: &[&str]| headers.iter().position(|h| names.contains(&h.as_str()));

        let instrument_idx = find(&["ticker", "instrument", "symbol"])
            .ok_or_else(|| anyhow!("price cache {:?} has no Ticker column", self.path))?;
        let price_idx = find(&["closingprice", "currentprice", "price"])
            .ok_or_else(|| anyhow!("price cache {:?} has no price column", self.path))?;
        let date_idx = find(&["date"]);
        if date_idx.is_none() {
            debug!("Price cache {:?} uses the legacy layout", self.path);
        }

        let mut entries = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record?;
            let instrument = record.get(instrument_idx).unwrap_or("").to_uppercase();
            let price_text = record.get(price_idx).unwrap_or("");
            if instrument.is_empty() || price_text.is_empty() {
                continue;
            }
            let Ok(price) = Decimal::from_str(price_text) else {
                warn!("Skipping price cache row {}: invalid price '{}'", idx + 1, price_text);
                continue;
            };
            let date = match date_idx.and_then(|i| record.get(i)).filter(|d| !d.is_empty()) {
                Some(text) => match NaiveDate::parse_from_str(text, "%Y-%m-%d") {
                    Ok(d) => Some(d),
                    Err(_) => {
                        warn!("Skipping price cache row {}: invalid date '{}'", idx + 1, text);
                        continue;
                    }
                },
                None => None,
            };
            entries.push(PriceCacheEntry {
                instrument,
                date,
                price,
            });
        }
        Ok(entries)
    }

    fn replace_all(&self, entries: &[PriceCacheEntry]) -> Result<()> {
        let mut writer = WriterBuilder::new().from_writer(Vec::new());
        writer.write_record(HEADERS)?;
        for entry in entries {
            writer.write_record([
                entry.instrument.clone(),
                entry
                    .date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
                entry.price.normalize().to_string(),
            ])?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| anyhow!("Failed to flush price cache: {}", e))?;
        write_atomic(&self.path, &bytes)
    }
}

/// In-memory cache for tests and offline dry runs
#[derive(Debug, Default)]
pub struct MemoryPriceCache {
    entries: Mutex<Vec<PriceCacheEntry>>,
}

impl MemoryPriceCache {
    pub fn with_entries(entries: Vec<PriceCacheEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl PriceCacheStore for MemoryPriceCache {
    fn entries(&self) -> Result<Vec<PriceCacheEntry>> {
        let guard = self
            .entries
            .lock()
            .map_err(|_| anyhow!("price cache lock poisoned"))?;
        Ok(guard.clone())
    }

    fn replace_all(&self, entries: &[PriceCacheEntry]) -> Result<()> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| anyhow!("price cache lock poisoned"))?;
        *guard = entries.to_vec();
        Ok(())
    }
}
