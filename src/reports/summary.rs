//! Portfolio metrics aggregation
//!
//! Combines replayed positions with resolved prices. Unpriced instruments
//! stay in the report with their cost-basis data but are left out of every
//! priced aggregate. So are instruments whose replay stopped on an oversell,
//! since their quantity no longer reflects the ledger.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::returns::annualized_return;
use crate::cost_basis::ReplayOutcome;
use crate::models::{CashFlow, Currency, InstrumentClass, InstrumentPosition};
use crate::pricing::{default_display_name, PriceQuote, PriceSource, ProvenanceSummary};

/// One instrument in the report. Price-derived fields are `None` when no
/// price was resolved or the instrument's replay failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoldingRow {
    pub instrument: String,
    pub display_name: String,
    pub class: InstrumentClass,
    pub currency: Currency,
    pub quantity: Decimal,
    /// Trade currency
    pub average_cost: Decimal,
    /// Reporting currency from here down
    pub total_invested: Decimal,
    pub realized_profit: Decimal,
    /// Trade currency
    pub price: Option<Decimal>,
    pub current_value: Option<Decimal>,
    pub unrealized_profit: Option<Decimal>,
    pub return_pct: Option<Decimal>,
    pub daily_change: Option<Decimal>,
    /// `None` for closed positions, which are not priced
    pub source: Option<PriceSource>,
    pub replay_error: Option<String>,
}

impl HoldingRow {
    pub fn is_open(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_priced(&self) -> bool {
        self.price.is_some()
    }

    pub fn is_valued(&self) -> bool {
        self.replay_error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioSummary {
    pub as_of: NaiveDate,
    pub reporting_currency: Currency,
    /// Cost of every open position, priced or not
    pub total_invested: Decimal,
    /// Cost of open positions that have a price
    pub invested_priced: Decimal,
    pub current_value: Decimal,
    pub unrealized_profit: Decimal,
    pub realized_profit: Decimal,
    pub daily_change: Option<Decimal>,
    pub daily_change_pct: Option<Decimal>,
    pub annualized_return: Option<f64>,
    /// Why the annualized return is missing
    pub annualized_return_note: Option<String>,
    /// Open, priced positions
    pub holdings_count: usize,
    pub unpriced: Vec<String>,
    pub provenance: ProvenanceSummary,
    pub replay_errors: Vec<String>,
    /// Snapshot the replay resumed from, if any
    pub resumed_from: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioReport {
    pub summary: PortfolioSummary,
    pub holdings: Vec<HoldingRow>,
}

fn pct(part: Decimal, whole: Decimal) -> Option<Decimal> {
    if whole.is_zero() {
        None
    } else {
        Some(part / whole * Decimal::ONE_HUNDRED)
    }
}

fn holding_row(
    position: &InstrumentPosition,
    quote: Option<&PriceQuote>,
    replay_error: Option<String>,
) -> HoldingRow {
    let display_name = quote
        .map(|q| q.display_name.clone())
        .unwrap_or_else(|| default_display_name(&position.instrument, position.class.is_bond()));
    let mut row = HoldingRow {
        instrument: position.instrument.clone(),
        display_name,
        class: position.class,
        currency: position.currency,
        quantity: position.quantity,
        average_cost: position.average_cost,
        total_invested: position.total_invested,
        realized_profit: position.realized_profit,
        price: None,
        current_value: None,
        unrealized_profit: None,
        return_pct: None,
        daily_change: None,
        source: quote.map(|q| q.source),
        replay_error,
    };

    if row.replay_error.is_some() {
        return row;
    }
    if !position.is_open() {
        row.current_value = Some(Decimal::ZERO);
        row.unrealized_profit = Some(Decimal::ZERO);
        return row;
    }

    let Some(price) = quote.and_then(|q| q.price) else {
        return row;
    };
    let value = position.quantity * price * position.exchange_rate;
    let unrealized = value - position.total_invested;
    row.price = Some(price);
    row.current_value = Some(value);
    row.unrealized_profit = Some(unrealized);
    row.return_pct = pct(unrealized, position.total_invested);
    row.daily_change = quote
        .and_then(|q| q.previous_close)
        .map(|prev| position.quantity * (price - prev) * position.exchange_rate);
    row
}

/// Build the report from a replay and the quotes for its open positions
pub fn aggregate(
    outcome: &ReplayOutcome,
    quotes: &[PriceQuote],
    as_of: NaiveDate,
    reporting_currency: Currency,
) -> PortfolioReport {
    let by_instrument: HashMap<&str, &PriceQuote> =
        quotes.iter().map(|q| (q.instrument.as_str(), q)).collect();

    let holdings: Vec<HoldingRow> = outcome
        .positions
        .iter()
        .map(|p| {
            let error = outcome.error_for(&p.instrument).map(|e| e.to_string());
            holding_row(p, by_instrument.get(p.instrument.as_str()).copied(), error)
        })
        .collect();

    let open: Vec<&HoldingRow> = holdings.iter().filter(|h| h.is_open()).collect();
    let valued: Vec<&HoldingRow> = open.iter().copied().filter(|h| h.is_valued()).collect();
    let priced: Vec<&HoldingRow> = valued.iter().copied().filter(|h| h.is_priced()).collect();
    let unpriced: Vec<String> = valued
        .iter()
        .filter(|h| !h.is_priced())
        .map(|h| h.instrument.clone())
        .collect();

    let total_invested: Decimal = open.iter().map(|h| h.total_invested).sum();
    let invested_priced: Decimal = priced.iter().map(|h| h.total_invested).sum();
    let current_value: Decimal = priced.iter().filter_map(|h| h.current_value).sum();

    let changes: Vec<Decimal> = priced.iter().filter_map(|h| h.daily_change).collect();
    let daily_change = if changes.is_empty() {
        None
    } else {
        Some(changes.iter().copied().sum::<Decimal>())
    };
    let daily_change_pct = daily_change.and_then(|c| pct(c, current_value - c));

    let excluded: HashSet<&str> = unpriced
        .iter()
        .map(String::as_str)
        .chain(outcome.errors.iter().map(|e| e.instrument.as_str()))
        .collect();
    let flows: Vec<CashFlow> = outcome
        .cash_flows
        .iter()
        .filter(|f| !excluded.contains(f.instrument.as_str()))
        .cloned()
        .collect();
    let (annualized, note) = match annualized_return(&flows, current_value, as_of) {
        Ok(rate) => (Some(rate), None),
        Err(e) => {
            debug!("Annualized return undefined: {}", e);
            (None, Some(e.to_string()))
        }
    };

    let provenance: ProvenanceSummary = quotes.iter().collect();
    let summary = PortfolioSummary {
        as_of,
        reporting_currency,
        total_invested,
        invested_priced,
        current_value,
        unrealized_profit: current_value - invested_priced,
        realized_profit: outcome.total_realized,
        daily_change,
        daily_change_pct,
        annualized_return: annualized,
        annualized_return_note: note,
        holdings_count: priced.len(),
        unpriced,
        provenance,
        replay_errors: outcome.errors.iter().map(|e| e.to_string()).collect(),
        resumed_from: None,
    };
    info!(
        "Valued {} holdings at {} ({} unpriced)",
        summary.holdings_count,
        summary.current_value.round_dp(2),
        summary.unpriced.len()
    );
    PortfolioReport { summary, holdings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost_basis::replay_full;
    use crate::ledger::test_support::trade;
    use crate::ledger::Ledger;
    use crate::models::Side;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn quote(instrument: &str, price: Option<Decimal>, previous: Option<Decimal>) -> PriceQuote {
        PriceQuote {
            instrument: instrument.to_string(),
            price,
            previous_close: previous,
            display_name: instrument.to_string(),
            source: if price.is_some() {
                PriceSource::Cache
            } else {
                PriceSource::Unavailable
            },
            as_of: date(2025, 12, 31),
        }
    }

    fn scenario() -> ReplayOutcome {
        replay_full(&Ledger::new(vec![
            trade("AAPL", (2025, 1, 1), Side::Buy, dec!(10), dec!(150)),
            trade("AAPL", (2025, 3, 1), Side::Buy, dec!(10), dec!(160)),
            trade("AAPL", (2025, 6, 1), Side::Sell, dec!(5), dec!(170)),
        ]))
    }

    #[test]
    fn test_single_instrument_scenario() {
        let report = aggregate(
            &scenario(),
            &[quote("AAPL", Some(dec!(165)), None)],
            date(2025, 12, 31),
            Currency::Inr,
        );
        let s = &report.summary;
        assert_eq!(s.total_invested, dec!(2350));
        assert_eq!(s.current_value, dec!(2475));
        assert_eq!(s.unrealized_profit, dec!(125));
        assert_eq!(s.realized_profit, dec!(100));
        assert_eq!(s.holdings_count, 1);
        assert!(s.daily_change.is_none());
        assert!(s.annualized_return.unwrap() > 0.0);
    }

    #[test]
    fn test_unpriced_instrument_is_listed_but_excluded() {
        let outcome = replay_full(&Ledger::new(vec![
            trade("AAPL", (2025, 1, 1), Side::Buy, dec!(10), dec!(150)),
            trade("SGBX", (2025, 2, 1), Side::Buy, dec!(2), dec!(6000)),
        ]));
        let report = aggregate(
            &outcome,
            &[
                quote("AAPL", Some(dec!(160)), Some(dec!(158))),
                quote("SGBX", None, None),
            ],
            date(2025, 12, 31),
            Currency::Inr,
        );

        let s = &report.summary;
        assert_eq!(s.total_invested, dec!(13500));
        assert_eq!(s.invested_priced, dec!(1500));
        assert_eq!(s.current_value, dec!(1600));
        assert_eq!(s.unrealized_profit, dec!(100));
        assert_eq!(s.daily_change, Some(dec!(20)));
        assert_eq!(s.unpriced, vec!["SGBX"]);
        assert_eq!(s.holdings_count, 1);
        assert_eq!(s.provenance.count(PriceSource::Unavailable), 1);

        let sgb = report.holdings.iter().find(|h| h.instrument == "SGBX").unwrap();
        assert_eq!(sgb.total_invested, dec!(12000));
        assert!(sgb.current_value.is_none());
        assert!(sgb.unrealized_profit.is_none());
    }

    #[test]
    fn test_closed_positions_stay_in_report() {
        let outcome = replay_full(&Ledger::new(vec![
            trade("TCS", (2025, 1, 1), Side::Buy, dec!(2), dec!(3500)),
            trade("TCS", (2025, 6, 1), Side::Sell, dec!(2), dec!(4000)),
        ]));
        let report = aggregate(&outcome, &[], date(2025, 12, 31), Currency::Inr);

        assert_eq!(report.holdings.len(), 1);
        assert_eq!(report.holdings[0].realized_profit, dec!(1000));
        assert_eq!(report.summary.holdings_count, 0);
        assert!(report.summary.unpriced.is_empty());
        assert_eq!(report.summary.realized_profit, dec!(1000));
    }

    #[test]
    fn test_undefined_return_is_reported() {
        let outcome = replay_full(&Ledger::new(vec![trade(
            "AAPL",
            (2025, 1, 1),
            Side::Buy,
            dec!(10),
            dec!(150),
        )]));
        let report = aggregate(
            &outcome,
            &[quote("AAPL", None, None)],
            date(2025, 12, 31),
            Currency::Inr,
        );
        assert!(report.summary.annualized_return.is_none());
        assert!(report.summary.annualized_return_note.is_some());
    }

    #[test]
    fn test_replay_error_is_attached_to_row() {
        let outcome = replay_full(&Ledger::new(vec![trade(
            "TSLA",
            (2025, 1, 1),
            Side::Sell,
            dec!(1),
            dec!(200),
        )]));
        let report = aggregate(&outcome, &[], date(2025, 12, 31), Currency::Inr);
        assert!(report.holdings[0].replay_error.as_ref().unwrap().contains("oversell"));
        assert_eq!(report.summary.replay_errors.len(), 1);
    }

    #[test]
    fn test_oversold_instrument_is_not_valued() {
        let outcome = replay_full(&Ledger::new(vec![
            trade("INFY", (2025, 1, 1), Side::Buy, dec!(10), dec!(150)),
            trade("INFY", (2025, 2, 1), Side::Sell, dec!(15), dec!(160)),
            trade("INFY", (2025, 3, 1), Side::Buy, dec!(100), dec!(170)),
            trade("AAPL", (2025, 1, 1), Side::Buy, dec!(10), dec!(150)),
        ]));
        let report = aggregate(
            &outcome,
            &[
                quote("INFY", Some(dec!(200)), Some(dec!(190))),
                quote("AAPL", Some(dec!(160)), Some(dec!(158))),
            ],
            date(2025, 12, 31),
            Currency::Inr,
        );

        let infy = report.holdings.iter().find(|h| h.instrument == "INFY").unwrap();
        assert!(infy.replay_error.is_some());
        assert!(infy.current_value.is_none());
        assert!(infy.unrealized_profit.is_none());
        assert!(infy.daily_change.is_none());

        let s = &report.summary;
        assert_eq!(s.current_value, dec!(1600));
        assert_eq!(s.invested_priced, dec!(1500));
        assert_eq!(s.daily_change, Some(dec!(20)));
        assert_eq!(s.holdings_count, 1);
        assert!(s.unpriced.is_empty());
        assert_eq!(s.replay_errors.len(), 1);
    }
}
