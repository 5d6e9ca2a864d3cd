//! Utility functions for formatting and common operations
//!
//! Centralized formatting for money and percentages so every report prints
//! amounts the same way.

use rust_decimal::Decimal;

use crate::models::Currency;

/// Digit grouping convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    /// 12,34,567.89: last three digits, then pairs
    Indian,
    /// 1,234,567.89
    Western,
}

impl Grouping {
    pub fn for_currency(currency: Currency) -> Self {
        match currency {
            Currency::Inr => Grouping::Indian,
            Currency::Usd => Grouping::Western,
        }
    }
}

/// Core formatting function with full control over output.
///
/// # Examples
/// ```
/// use tradebook::utils::{format_amount_with_width, Grouping};
/// use rust_decimal_macros::dec;
///
/// assert_eq!(
///     format_amount_with_width(dec!(1234567.891), 0, Grouping::Indian, "₹"),
///     "₹12,34,567.89"
/// );
/// assert_eq!(
///     format_amount_with_width(dec!(1234), 10, Grouping::Western, ""),
///     "  1,234.00"
/// );
/// ```
pub fn format_amount_with_width(
    value: Decimal,
    width: usize,
    grouping: Grouping,
    symbol: &str,
) -> String {
    let is_negative = value < Decimal::ZERO;
    let formatted = format!("{:.2}", value.abs().round_dp(2));
    let (integer_part, decimal_part) = formatted
        .split_once('.')
        .unwrap_or((formatted.as_str(), "00"));

    let grouped = match grouping {
        Grouping::Western => group_digits(integer_part, 3, 3),
        Grouping::Indian => group_digits(integer_part, 3, 2),
    };

    // A value that rounds to zero prints without a sign
    let sign = if is_negative && formatted != "0.00" { "-" } else { "" };
    let result = format!("{}{}{}.{}", sign, symbol, grouped, decimal_part);

    if width > 0 && result.chars().count() < width {
        format!("{:>width$}", result, width = width)
    } else {
        result
    }
}

fn group_digits(digits: &str, first: usize, rest: usize) -> String {
    if digits.len() <= first {
        return digits.to_string();
    }
    let (head, tail) = digits.split_at(digits.len() - first);
    let mut groups: Vec<&str> = Vec::new();
    let mut end = head.len();
    while end > 0 {
        let start = end.saturating_sub(rest);
        groups.push(&head[start..end]);
        end = start;
    }
    groups.reverse();
    format!("{},{}", groups.join(","), tail)
}

// ============ Convenience functions ============

/// Format in a currency's own convention: "₹12,34,567.89" or "$1,234,567.89"
///
/// # Examples
/// ```
/// use tradebook::utils::format_money;
/// use tradebook::models::Currency;
/// use rust_decimal_macros::dec;
///
/// assert_eq!(format_money(dec!(250000), Currency::Inr), "₹2,50,000.00");
/// assert_eq!(format_money(dec!(-1500.5), Currency::Usd), "-$1,500.50");
/// ```
pub fn format_money(value: Decimal, currency: Currency) -> String {
    format_amount_with_width(value, 0, Grouping::for_currency(currency), currency.symbol())
}

/// Indian-grouped number without symbol, for table cells
pub fn format_inr_plain(value: Decimal) -> String {
    format_amount_with_width(value, 0, Grouping::Indian, "")
}

/// Optional money value, "N/A" when absent
pub fn format_money_opt(value: Option<Decimal>, currency: Currency) -> String {
    value
        .map(|v| format_money(v, currency))
        .unwrap_or_else(|| "N/A".to_string())
}

/// Percentage with sign: "+5.32%", "N/A" when absent
pub fn format_pct(value: Option<Decimal>) -> String {
    match value {
        Some(v) => {
            let sign = if v > Decimal::ZERO { "+" } else { "" };
            format!("{}{:.2}%", sign, v.round_dp(2))
        }
        None => "N/A".to_string(),
    }
}

/// Quantity without trailing zeros: 10.500 -> "10.5"
pub fn format_quantity(value: Decimal) -> String {
    value.normalize().to_string()
}
