//! Annualized money-weighted return (XIRR)
//!
//! Solves for `r` where `Σ flow / (1 + r)^(days_from_first / 365) = 0`.
//! Newton-Raphson from a 10% guess, with bisection over a bracketed range
//! when Newton stalls or wanders off.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use tracing::debug;

use crate::error::SolverError;
use crate::models::CashFlow;

const MAX_ITERATIONS: u32 = 100;
const TOLERANCE: f64 = 1e-10;
const MIN_RATE: f64 = -0.9999;
const MAX_RATE: f64 = 1e6;

/// (years from first flow, amount)
type Series = Vec<(f64, f64)>;

fn to_series(flows: &[(NaiveDate, f64)]) -> Series {
    let first = flows.iter().map(|(d, _)| *d).min().unwrap_or(NaiveDate::MIN);
    flows
        .iter()
        .map(|(date, amount)| ((*date - first).num_days() as f64 / 365.0, *amount))
        .collect()
}

fn npv_and_derivative(series: &Series, rate: f64) -> (f64, f64) {
    let mut npv = 0.0;
    let mut dnpv = 0.0;
    for (years, amount) in series {
        let discount = (1.0 + rate).powf(*years);
        npv += amount / discount;
        dnpv -= years * amount / (discount * (1.0 + rate));
    }
    (npv, dnpv)
}

fn newton(series: &Series) -> Option<f64> {
    let mut rate = 0.1;
    for _ in 0..MAX_ITERATIONS {
        let (npv, dnpv) = npv_and_derivative(series, rate);
        if !npv.is_finite() || dnpv.abs() < TOLERANCE {
            return None;
        }
        let next = (rate - npv / dnpv).clamp(MIN_RATE, MAX_RATE);
        if (next - rate).abs() < TOLERANCE {
            return Some(next);
        }
        rate = next;
    }
    None
}

fn bisection(series: &Series) -> Option<f64> {
    let npv = |rate: f64| npv_and_derivative(series, rate).0;
    let grid = [MIN_RATE, -0.9, -0.5, 0.0, 0.5, 1.0, 10.0, 100.0, 1e3, MAX_RATE];
    let (mut lo, mut hi) = grid
        .windows(2)
        .map(|w| (w[0], w[1]))
        .find(|(a, b)| npv(*a).signum() != npv(*b).signum())?;

    for _ in 0..(MAX_ITERATIONS * 2) {
        let mid = (lo + hi) / 2.0;
        if (hi - lo).abs() < TOLERANCE {
            return Some(mid);
        }
        if npv(lo).signum() == npv(mid).signum() {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Some((lo + hi) / 2.0)
}

/// Annualized return of dated flows. Outflows are negative.
pub fn xirr(flows: &[(NaiveDate, f64)]) -> Result<f64, SolverError> {
    if flows.len() < 2 {
        return Err(SolverError::InsufficientFlows);
    }
    let has_outflow = flows.iter().any(|(_, a)| *a < 0.0);
    let has_inflow = flows.iter().any(|(_, a)| *a > 0.0);
    if !(has_outflow && has_inflow) {
        return Err(SolverError::SameSign);
    }

    let series = to_series(flows);
    if let Some(rate) = newton(&series) {
        let (npv, _) = npv_and_derivative(&series, rate);
        let scale: f64 = series.iter().map(|(_, a)| a.abs()).fold(1.0, f64::max);
        if npv.abs() <= scale * 1e-6 {
            return Ok(rate);
        }
        debug!("Newton settled on {} with residual {}, trying bisection", rate, npv);
    }
    bisection(&series).ok_or(SolverError::NonConvergence {
        iterations: MAX_ITERATIONS,
    })
}

/// [`xirr`] over ledger cash flows plus a terminal mark-to-market inflow
pub fn annualized_return(
    flows: &[CashFlow],
    terminal_value: rust_decimal::Decimal,
    as_of: NaiveDate,
) -> Result<f64, SolverError> {
    let mut series: Vec<(NaiveDate, f64)> = flows
        .iter()
        .filter_map(|f| f.amount.to_f64().map(|a| (f.date, a)))
        .collect();
    if let Some(value) = terminal_value.to_f64().filter(|v| *v != 0.0) {
        series.push((as_of, value));
    }
    xirr(&series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-6, "{} != {}", actual, expected);
    }

    #[test]
    fn test_one_year_gain() {
        let rate = xirr(&[(date(2024, 1, 1), -1000.0), (date(2024, 12, 31), 1100.0)]).unwrap();
        assert_close(rate, 0.10);
    }

    #[test]
    fn test_one_year_loss() {
        let rate = xirr(&[(date(2024, 1, 1), -1000.0), (date(2024, 12, 31), 500.0)]).unwrap();
        assert_close(rate, -0.5);
    }

    #[test]
    fn test_multiple_flows_zero_npv() {
        let flows = [
            (date(2023, 1, 15), -5000.0),
            (date(2023, 7, 1), -2500.0),
            (date(2024, 2, 10), 1200.0),
            (date(2024, 11, 30), 7900.0),
        ];
        let rate = xirr(&flows).unwrap();
        let (npv, _) = npv_and_derivative(&to_series(&flows), rate);
        assert!(npv.abs() < 1e-4);
    }

    #[test]
    fn test_single_flow_is_undefined() {
        assert_eq!(
            xirr(&[(date(2024, 1, 1), -1000.0)]),
            Err(SolverError::InsufficientFlows)
        );
    }

    #[test]
    fn test_same_sign_is_undefined() {
        let flows = [(date(2024, 1, 1), -1000.0), (date(2024, 6, 1), -500.0)];
        assert_eq!(xirr(&flows), Err(SolverError::SameSign));
    }

    #[test]
    fn test_same_day_flows_do_not_converge() {
        let flows = [(date(2024, 1, 1), -100.0), (date(2024, 1, 1), 110.0)];
        assert!(matches!(xirr(&flows), Err(SolverError::NonConvergence { .. })));
    }

    #[test]
    fn test_annualized_return_adds_terminal_value() {
        let flows = vec![CashFlow {
            date: date(2024, 1, 1),
            amount: dec!(-1000),
            instrument: "AAPL".to_string(),
        }];
        let rate = annualized_return(&flows, dec!(1100), date(2024, 12, 31)).unwrap();
        assert_close(rate, 0.10);

        assert_eq!(
            annualized_return(&flows, dec!(0), date(2024, 12, 31)),
            Err(SolverError::InsufficientFlows)
        );
    }
}
