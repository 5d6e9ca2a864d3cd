//! FIFO cost-basis engine
//!
//! Replays ledger trades in order, keeping a queue of open lots per
//! instrument. A sell consumes lots from the front; realized profit is
//! `(sell price − lot cost) × consumed × sell-trade exchange rate`.
//!
//! An oversell is recorded against its instrument and stops replay of that
//! instrument only; the instrument's state stays as it was just before the
//! offending sell.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

use crate::error::OversellError;
use crate::ledger::Ledger;
use crate::models::{CashFlow, Currency, InstrumentClass, InstrumentPosition, Lot, Side, Trade};
use crate::snapshots::Snapshot;

#[derive(Debug, Clone)]
struct InstrumentBook {
    lots: VecDeque<Lot>,
    realized: Decimal,
    currency: Currency,
    exchange_rate: Decimal,
    class: InstrumentClass,
    failed: bool,
}

impl InstrumentBook {
    fn new(trade: &Trade) -> Self {
        Self {
            lots: VecDeque::new(),
            realized: Decimal::ZERO,
            currency: trade.currency,
            exchange_rate: trade.exchange_rate,
            class: trade.class,
            failed: false,
        }
    }

    fn held(&self) -> Decimal {
        self.lots.iter().map(|l| l.quantity).sum()
    }

    fn buy(&mut self, trade: &Trade) {
        self.lots.push_back(Lot {
            instrument: trade.instrument.clone(),
            date: trade.date,
            quantity: trade.quantity,
            unit_cost: trade.price,
            currency: trade.currency,
            exchange_rate: trade.exchange_rate,
        });
    }

    /// Consume lots front to back. Nothing is mutated when the sell exceeds
    /// the held quantity.
    fn sell(&mut self, trade: &Trade) -> Result<Decimal, OversellError> {
        let held = self.held();
        if trade.quantity > held {
            return Err(OversellError {
                instrument: trade.instrument.clone(),
                date: trade.date,
                requested: trade.quantity,
                held,
            });
        }

        let mut remaining = trade.quantity;
        let mut realized = Decimal::ZERO;
        while remaining > Decimal::ZERO {
            let Some(front) = self.lots.front_mut() else {
                break;
            };
            let consumed = remaining.min(front.quantity);
            realized += (trade.price - front.unit_cost) * consumed * trade.exchange_rate;
            front.quantity -= consumed;
            remaining -= consumed;
            if front.quantity.is_zero() {
                self.lots.pop_front();
            }
        }
        self.realized += realized;
        Ok(realized)
    }

    fn position(&self, instrument: &str) -> InstrumentPosition {
        let quantity = self.held();
        let cost: Decimal = self.lots.iter().map(Lot::cost).sum();
        let average_cost = if quantity > Decimal::ZERO {
            cost / quantity
        } else {
            Decimal::ZERO
        };
        InstrumentPosition {
            instrument: instrument.to_string(),
            quantity,
            average_cost,
            total_invested: self.lots.iter().map(Lot::cost_reporting).sum(),
            realized_profit: self.realized,
            currency: self.currency,
            exchange_rate: self.exchange_rate,
            class: self.class,
            lots: self.lots.iter().cloned().collect(),
        }
    }
}

/// Result of replaying trades
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// One entry per instrument ever traded, sorted by instrument
    pub positions: Vec<InstrumentPosition>,
    /// Signed reporting-currency flows, in replay order
    pub cash_flows: Vec<CashFlow>,
    pub errors: Vec<OversellError>,
    pub total_invested: Decimal,
    pub total_realized: Decimal,
    /// Trades applied in this replay (excluding any resumed snapshot)
    pub trades_applied: usize,
}

impl ReplayOutcome {
    pub fn position(&self, instrument: &str) -> Option<&InstrumentPosition> {
        self.positions.iter().find(|p| p.instrument == instrument)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &InstrumentPosition> {
        self.positions.iter().filter(|p| p.is_open())
    }

    pub fn error_for(&self, instrument: &str) -> Option<&OversellError> {
        self.errors.iter().find(|e| e.instrument == instrument)
    }

    pub fn failed_instruments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.errors.iter().map(|e| e.instrument.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

#[derive(Debug, Default)]
pub struct CostBasisEngine {
    books: BTreeMap<String, InstrumentBook>,
    cash_flows: Vec<CashFlow>,
    errors: Vec<OversellError>,
    applied: usize,
}

impl CostBasisEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine state as recorded in a snapshot
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let books = snapshot
            .positions
            .iter()
            .map(|p| {
                let book = InstrumentBook {
                    lots: p.lots.iter().cloned().collect(),
                    realized: p.realized_profit,
                    currency: p.currency,
                    exchange_rate: p.exchange_rate,
                    class: p.class,
                    failed: false,
                };
                (p.instrument.clone(), book)
            })
            .collect();
        Self {
            books,
            cash_flows: snapshot.cash_flows.clone(),
            errors: Vec::new(),
            applied: 0,
        }
    }

    pub fn apply(&mut self, trade: &Trade) {
        let book = self
            .books
            .entry(trade.instrument.clone())
            .or_insert_with(|| InstrumentBook::new(trade));
        if book.failed {
            debug!("Skipping {} trade on {}: replay halted", trade.instrument, trade.date);
            return;
        }

        match trade.side {
            Side::Buy => book.buy(trade),
            Side::Sell => {
                if let Err(e) = book.sell(trade) {
                    warn!("{}", e);
                    book.failed = true;
                    self.errors.push(e);
                    return;
                }
            }
        }
        book.currency = trade.currency;
        book.exchange_rate = trade.exchange_rate;
        book.class = trade.class;
        self.cash_flows.push(trade.cash_flow());
        self.applied += 1;
    }

    pub fn replay<'a>(mut self, trades: impl IntoIterator<Item = &'a Trade>) -> ReplayOutcome {
        for trade in trades {
            self.apply(trade);
        }
        self.finish()
    }

    pub fn finish(self) -> ReplayOutcome {
        let positions: Vec<InstrumentPosition> = self
            .books
            .iter()
            .map(|(instrument, book)| book.position(instrument))
            .collect();
        ReplayOutcome {
            total_invested: positions.iter().map(|p| p.total_invested).sum(),
            total_realized: positions.iter().map(|p| p.realized_profit).sum(),
            positions,
            cash_flows: self.cash_flows,
            errors: self.errors,
            trades_applied: self.applied,
        }
    }
}

/// Replay the whole ledger
pub fn replay_full(ledger: &Ledger) -> ReplayOutcome {
    CostBasisEngine::new().replay(ledger.trades())
}

/// Replay every trade dated on or before `cutoff`
pub fn replay_through(ledger: &Ledger, cutoff: NaiveDate) -> ReplayOutcome {
    CostBasisEngine::new().replay(ledger.trades_through(cutoff))
}

/// Resume from a snapshot, applying trades after its cutoff up to `through`
pub fn replay_from(snapshot: &Snapshot, ledger: &Ledger, through: NaiveDate) -> ReplayOutcome {
    CostBasisEngine::from_snapshot(snapshot).replay(ledger.trades_between(snapshot.cutoff, through))
}
