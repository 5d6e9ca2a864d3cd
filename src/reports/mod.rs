//! Portfolio valuation
//!
//! Resumes from the latest snapshot on or before the valuation date when one
//! exists, replays the rest of the ledger, prices open positions and
//! aggregates the result.

pub mod returns;
pub mod summary;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::cost_basis::{replay_from, replay_through, ReplayOutcome};
use crate::ledger::Ledger;
use crate::models::Currency;
use crate::pricing::resolver::{BatchResolution, QuoteRequest};
use crate::pricing::{PriceQuote, PriceResolver};
use crate::snapshots::{SnapshotStore, StoreYearEndPrices};

pub use returns::{annualized_return, xirr};
pub use summary::{aggregate, HoldingRow, PortfolioReport, PortfolioSummary};

/// Replay state at `as_of`, resuming from a snapshot where possible.
/// Returns the outcome and the cutoff it resumed from.
pub fn replay_at(
    ledger: &Ledger,
    store: &dyn SnapshotStore,
    as_of: NaiveDate,
) -> (ReplayOutcome, Option<NaiveDate>) {
    match store.load_latest(as_of) {
        Ok(Some(snapshot)) if !snapshot.matches_ledger(ledger) => {
            warn!(
                "Snapshot {} no longer matches the ledger, replaying the full ledger",
                snapshot.cutoff
            );
            (replay_through(ledger, as_of), None)
        }
        Ok(Some(snapshot)) => {
            info!("Resuming replay from snapshot {}", snapshot.cutoff);
            (replay_from(&snapshot, ledger, as_of), Some(snapshot.cutoff))
        }
        Ok(None) => (replay_through(ledger, as_of), None),
        Err(e) => {
            warn!("Snapshot unreadable, replaying the full ledger: {:#}", e);
            (replay_through(ledger, as_of), None)
        }
    }
}

/// Price the open positions of a replay, skipping instruments whose replay
/// failed. Dates before the resolver's today are priced historically,
/// preferring year-end prices recorded in snapshots.
pub fn price_positions(
    outcome: &ReplayOutcome,
    store: &dyn SnapshotStore,
    resolver: &PriceResolver,
    as_of: NaiveDate,
    progress: impl FnMut(&PriceQuote),
) -> BatchResolution {
    let requests: Vec<QuoteRequest> = outcome
        .open_positions()
        .filter(|p| outcome.error_for(&p.instrument).is_none())
        .map(|p| QuoteRequest::new(p.instrument.clone(), p.class))
        .collect();
    if as_of >= resolver.today() {
        resolver.resolve_batch(&requests, progress)
    } else {
        let year_end = StoreYearEndPrices::new(store);
        resolver.resolve_batch_historical(&requests, as_of, &year_end, progress)
    }
}

/// Value the portfolio as of a date
pub fn value_portfolio(
    ledger: &Ledger,
    store: &dyn SnapshotStore,
    resolver: &PriceResolver,
    as_of: NaiveDate,
    reporting_currency: Currency,
    progress: impl FnMut(&PriceQuote),
) -> Result<PortfolioReport> {
    let (outcome, resumed_from) = replay_at(ledger, store, as_of);
    for err in &outcome.errors {
        warn!("{}", err);
    }
    let priced = price_positions(&outcome, store, resolver, as_of, progress);

    let mut report = aggregate(&outcome, &priced.quotes, as_of, reporting_currency);
    report.summary.resumed_from = resumed_from;
    Ok(report)
}
