//! Holdings snapshots
//!
//! A snapshot freezes the replayed state at a cutoff date so later
//! valuations resume from it instead of replaying the whole ledger.
//! Snapshots are immutable: a cutoff is written once and never overwritten.

pub mod store;

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use crate::cost_basis::replay_through;
use crate::error::SnapshotError;
use crate::ledger::Ledger;
use crate::models::{CashFlow, InstrumentPosition};
use crate::pricing::resolver::QuoteRequest;
use crate::pricing::{NoYearEndPrices, PriceResolver, YearEndPrices};

pub use store::{DirSnapshotStore, MemorySnapshotStore};

/// Replayed state at a cutoff date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub cutoff: NaiveDate,
    /// Every instrument traded up to the cutoff, open lots included
    pub positions: Vec<InstrumentPosition>,
    /// Prices of open positions at the cutoff, where one was resolved
    pub year_end_prices: BTreeMap<String, Decimal>,
    pub cash_flows: Vec<CashFlow>,
}

impl Snapshot {
    pub fn position(&self, instrument: &str) -> Option<&InstrumentPosition> {
        self.positions.iter().find(|p| p.instrument == instrument)
    }

    /// Whether the ledger's trades up to the cutoff are still the ones frozen
    /// here. Trades absorbed later with earlier dates make a snapshot stale.
    pub fn matches_ledger(&self, ledger: &Ledger) -> bool {
        let mut flows = ledger.trades_through(self.cutoff).map(|t| t.cash_flow());
        let frozen = self.cash_flows.iter().all(|saved| flows.next().as_ref() == Some(saved));
        frozen && flows.next().is_none()
    }
}

pub trait SnapshotStore {
    /// Stored cutoffs, ascending
    fn cutoffs(&self) -> Result<Vec<NaiveDate>>;

    fn load(&self, cutoff: NaiveDate) -> Result<Option<Snapshot>>;

    /// Persist a new snapshot; fails with [`SnapshotError::AlreadyExists`]
    /// when the cutoff is taken
    fn insert(&self, snapshot: &Snapshot) -> Result<()>;

    /// Remove every snapshot, returning how many there were
    fn clear(&self) -> Result<usize>;

    /// Snapshot with the greatest cutoff on or before `date`
    fn load_latest(&self, date: NaiveDate) -> Result<Option<Snapshot>> {
        match self.cutoffs()?.into_iter().rev().find(|c| *c <= date) {
            Some(cutoff) => self.load(cutoff),
            None => Ok(None),
        }
    }
}

/// December 31st of `year`
pub fn year_end_cutoff(year: i32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 12, 31).ok_or_else(|| anyhow!("year {} is out of range", year))
}

/// Replay the ledger through `cutoff` and persist the result.
///
/// Returns `None` without writing when no trade is dated on or before the
/// cutoff. When a `pricer` is given, open positions are priced at the
/// cutoff and the prices stored with the snapshot.
pub fn write_snapshot(
    store: &dyn SnapshotStore,
    ledger: &Ledger,
    cutoff: NaiveDate,
    pricer: Option<&PriceResolver>,
) -> Result<Option<Snapshot>> {
    if ledger.trades_through(cutoff).next().is_none() {
        info!("No trades on or before {}, skipping snapshot", cutoff);
        return Ok(None);
    }
    if store.cutoffs()?.contains(&cutoff) {
        return Err(SnapshotError::AlreadyExists {
            cutoff,
            path: cutoff.to_string().into(),
        }
        .into());
    }

    let outcome = replay_through(ledger, cutoff);
    if !outcome.errors.is_empty() {
        return Err(SnapshotError::Integrity {
            cutoff,
            instruments: outcome.failed_instruments(),
        }
        .into());
    }

    let year_end_prices = match pricer {
        Some(pricer) => {
            let requests: Vec<QuoteRequest> = outcome
                .open_positions()
                .map(|p| QuoteRequest::new(p.instrument.clone(), p.class))
                .collect();
            pricer
                .resolve_batch_historical(&requests, cutoff, &NoYearEndPrices, |_| {})
                .quotes
                .into_iter()
                .filter_map(|q| q.price.map(|price| (q.instrument, price)))
                .collect()
        }
        None => BTreeMap::new(),
    };

    let snapshot = Snapshot {
        cutoff,
        positions: outcome.positions,
        year_end_prices,
        cash_flows: outcome.cash_flows,
    };
    store.insert(&snapshot)?;
    Ok(Some(snapshot))
}

/// Differences between a stored snapshot and a fresh replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    pub cutoff: NaiveDate,
    pub mismatches: Vec<String>,
}

impl Verification {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Recompute the state at a stored cutoff by full replay and compare
pub fn verify(store: &dyn SnapshotStore, ledger: &Ledger, cutoff: NaiveDate) -> Result<Verification> {
    let stored = store
        .load(cutoff)?
        .ok_or_else(|| anyhow!("no snapshot for {}", cutoff))?;
    let replayed = replay_through(ledger, cutoff);

    let mut mismatches = Vec::new();
    for position in &replayed.positions {
        match stored.position(&position.instrument) {
            None => mismatches.push(format!("{}: missing from snapshot", position.instrument)),
            Some(saved) if saved != position => mismatches.push(format!(
                "{}: snapshot has qty {} realized {}, replay has qty {} realized {}",
                position.instrument,
                saved.quantity,
                saved.realized_profit,
                position.quantity,
                position.realized_profit
            )),
            Some(_) => {}
        }
    }
    for saved in &stored.positions {
        if replayed.position(&saved.instrument).is_none() {
            mismatches.push(format!("{}: not in ledger", saved.instrument));
        }
    }
    if stored.cash_flows != replayed.cash_flows {
        mismatches.push(format!(
            "cash flows: snapshot has {}, replay has {}",
            stored.cash_flows.len(),
            replayed.cash_flows.len()
        ));
    }
    for err in &replayed.errors {
        mismatches.push(err.to_string());
    }

    if mismatches.is_empty() {
        info!("Snapshot {} matches full replay", cutoff);
    } else {
        warn!("Snapshot {} differs from full replay in {} places", cutoff, mismatches.len());
    }
    Ok(Verification { cutoff, mismatches })
}

/// Year-end prices read from stored snapshots, exact cutoff match
pub struct StoreYearEndPrices<'a> {
    store: &'a dyn SnapshotStore,
    loaded: RefCell<HashMap<NaiveDate, BTreeMap<String, Decimal>>>,
}

impl<'a> StoreYearEndPrices<'a> {
    pub fn new(store: &'a dyn SnapshotStore) -> Self {
        Self {
            store,
            loaded: RefCell::new(HashMap::new()),
        }
    }
}

impl YearEndPrices for StoreYearEndPrices<'_> {
    fn year_end_price(&self, instrument: &str, date: NaiveDate) -> Option<Decimal> {
        let mut loaded = self.loaded.borrow_mut();
        let prices = loaded.entry(date).or_insert_with(|| match self.store.load(date) {
            Ok(Some(snapshot)) => snapshot.year_end_prices,
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!("Snapshot {} unreadable: {:#}", date, e);
                BTreeMap::new()
            }
        });
        prices.get(instrument).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost_basis::{replay_from, replay_full};
    use crate::ledger::test_support::trade;
    use crate::models::{InstrumentClass, Side};
    use crate::pricing::resolver::test_support::ScriptedSource;
    use crate::pricing::{MemoryPriceCache, PriceSource, RetryPolicy};
    use rust_decimal_macros::dec;
    use std::rc::Rc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ledger() -> Ledger {
        Ledger::new(vec![
            trade("AAPL", (2024, 1, 1), Side::Buy, dec!(10), dec!(150)),
            trade("AAPL", (2024, 3, 1), Side::Buy, dec!(10), dec!(160)),
            trade("INFY", (2024, 5, 1), Side::Buy, dec!(4), dec!(1500)),
            trade("AAPL", (2025, 6, 1), Side::Sell, dec!(12), dec!(170)),
            trade("INFY", (2025, 7, 1), Side::Buy, dec!(2), dec!(1600)),
        ])
    }

    #[test]
    fn test_snapshot_matches_truncated_replay() {
        let store = MemorySnapshotStore::default();
        let cutoff = date(2024, 12, 31);
        let snapshot = write_snapshot(&store, &ledger(), cutoff, None).unwrap().unwrap();

        assert_eq!(snapshot.positions, replay_through(&ledger(), cutoff).positions);
        assert!(verify(&store, &ledger(), cutoff).unwrap().is_consistent());
    }

    #[test]
    fn test_resumed_replay_equals_full_replay() {
        let store = MemorySnapshotStore::default();
        let cutoff = date(2024, 12, 31);
        write_snapshot(&store, &ledger(), cutoff, None).unwrap();

        let snapshot = store.load_latest(date(2025, 12, 31)).unwrap().unwrap();
        let resumed = replay_from(&snapshot, &ledger(), date(2025, 12, 31));
        let full = replay_full(&ledger());

        assert_eq!(resumed.positions, full.positions);
        assert_eq!(resumed.cash_flows, full.cash_flows);
        assert_eq!(resumed.total_realized, full.total_realized);
        assert_eq!(resumed.trades_applied, 2);
    }

    #[test]
    fn test_snapshot_goes_stale_when_earlier_trade_arrives() {
        let store = MemorySnapshotStore::default();
        let snapshot = write_snapshot(&store, &ledger(), date(2024, 12, 31), None)
            .unwrap()
            .unwrap();
        assert!(snapshot.matches_ledger(&ledger()));

        let mut trades = ledger().trades().to_vec();
        trades.push(trade("TCS", (2025, 2, 1), Side::Buy, dec!(1), dec!(4000)));
        assert!(snapshot.matches_ledger(&Ledger::new(trades.clone())));

        trades.push(trade("TCS", (2024, 6, 1), Side::Buy, dec!(1), dec!(3900)));
        assert!(!snapshot.matches_ledger(&Ledger::new(trades)));
    }

    #[test]
    fn test_no_trades_before_cutoff() {
        let store = MemorySnapshotStore::default();
        let written = write_snapshot(&store, &ledger(), date(2023, 12, 31), None).unwrap();
        assert!(written.is_none());
        assert!(store.cutoffs().unwrap().is_empty());
    }

    #[test]
    fn test_oversold_state_is_not_frozen() {
        let mut trades = ledger().trades().to_vec();
        trades.push(trade("TSLA", (2024, 8, 1), Side::Sell, dec!(1), dec!(200)));
        let store = MemorySnapshotStore::default();

        let err = write_snapshot(&store, &Ledger::new(trades), date(2024, 12, 31), None).unwrap_err();
        match err.downcast_ref::<SnapshotError>() {
            Some(SnapshotError::Integrity { instruments, .. }) => assert_eq!(instruments, &vec!["TSLA"]),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(store.cutoffs().unwrap().is_empty());
    }

    #[test]
    fn test_existing_cutoff_is_rejected() {
        let store = MemorySnapshotStore::default();
        write_snapshot(&store, &ledger(), date(2024, 12, 31), None).unwrap();
        assert!(write_snapshot(&store, &ledger(), date(2024, 12, 31), None).is_err());
    }

    #[test]
    fn test_verify_reports_drift() {
        let store = MemorySnapshotStore::default();
        let cutoff = date(2024, 12, 31);
        write_snapshot(&store, &ledger(), cutoff, None).unwrap();

        let mut trades = ledger().trades().to_vec();
        trades.push(trade("INFY", (2024, 9, 1), Side::Buy, dec!(1), dec!(1550)));
        let report = verify(&store, &Ledger::new(trades), cutoff).unwrap();

        assert!(!report.is_consistent());
        assert!(report.mismatches.iter().any(|m| m.starts_with("INFY")));
    }

    #[test]
    fn test_year_end_prices_recorded_and_served() {
        let source = Rc::new(ScriptedSource::new("primary").close(Ok(dec!(190.5))));
        let pricer = PriceResolver::new(Box::new(MemoryPriceCache::default()), RetryPolicy::once())
            .with_primary(Box::new(source.clone()));
        let store = MemorySnapshotStore::default();
        let cutoff = date(2024, 12, 31);

        let ledger = Ledger::new(vec![trade("AAPL", (2024, 1, 1), Side::Buy, dec!(10), dec!(150))]);
        let snapshot = write_snapshot(&store, &ledger, cutoff, Some(&pricer)).unwrap().unwrap();
        assert_eq!(snapshot.year_end_prices["AAPL"], dec!(190.5));

        let year_end = StoreYearEndPrices::new(&store);
        let quote = pricer.resolve_historical("AAPL", InstrumentClass::Ordinary, cutoff, &year_end);
        assert_eq!(quote.price, Some(dec!(190.5)));
        assert_eq!(quote.source, PriceSource::YearEnd);
        assert!(year_end.year_end_price("AAPL", date(2024, 6, 30)).is_none());
    }

    #[test]
    fn test_year_end_cutoff() {
        assert_eq!(year_end_cutoff(2024).unwrap(), date(2024, 12, 31));
    }
}
