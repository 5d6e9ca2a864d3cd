//! Row validation for trade source files
//!
//! Collects every issue in a file instead of stopping at the first one, so
//! a rejected file reports all of its problems at once.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

use super::RawTable;
use crate::error::LedgerError;
use crate::models::{BondTerms, Currency, InstrumentClass, Side, Trade, TradeOrigin};

/// How many issues are spelled out in a rejection message
const MAX_REPORTED_ISSUES: usize = 5;

/// A validation issue found in a source row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIssue {
    /// 1-based data row (the header is not counted)
    pub row: usize,
    /// Column the issue was found in
    pub field: String,
    pub value: String,
    pub reason: String,
}

impl RowIssue {
    pub fn new(
        row: usize,
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            row,
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RowIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {}, column {}: '{}' ({})",
            self.row, self.field, self.value, self.reason
        )
    }
}

/// A validated source row, not yet enriched with an exchange rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTrade {
    pub instrument: String,
    pub date: NaiveDate,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub currency: Currency,
    pub country: Option<String>,
    pub class: InstrumentClass,
    pub bond_terms: BondTerms,
    pub origin: TradeOrigin,
}

impl ParsedTrade {
    pub fn into_trade(self, exchange_rate: Decimal) -> Trade {
        Trade {
            instrument: self.instrument,
            date: self.date,
            side: self.side,
            quantity: self.quantity,
            price: self.price,
            currency: self.currency,
            country: self.country,
            class: self.class,
            bond_terms: self.bond_terms,
            origin: self.origin,
            exchange_rate,
        }
    }
}

#[derive(Debug)]
struct ColumnMapping {
    date: usize,
    ticker: usize,
    side: usize,
    quantity: usize,
    price: usize,
    currency: usize,
    country: Option<usize>,
    is_bond: Option<usize>,
    issue_date: Option<usize>,
    maturity_date: Option<usize>,
    series: Option<usize>,
}

/// Header names compare without case, spaces or underscores
fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

impl ColumnMapping {
    fn from_headers(headers: &[String]) -> Result<Self, String> {
        let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
        let find = |names: &[&str]| normalized.iter().position(|h| names.contains(&h.as_str()));

        let date = find(&["date", "tradedate"]);
        let ticker = find(&["ticker", "symbol", "instrument"]);
        let side = find(&["type", "side", "tradetype"]);
        let quantity = find(&["qty", "quantity", "units"]);
        let price = find(&["price", "unitprice"]);
        let currency = find(&["currency", "ccy"]);

        let missing: Vec<&str> = [
            ("Date", date),
            ("Ticker", ticker),
            ("Type", side),
            ("Qty", quantity),
            ("Price", price),
            ("Currency", currency),
        ]
        .iter()
        .filter(|(_, idx)| idx.is_none())
        .map(|(name, _)| *name)
        .collect();

        match (date, ticker, side, quantity, price, currency) {
            (Some(date), Some(ticker), Some(side), Some(quantity), Some(price), Some(currency)) => {
                Ok(Self {
                    date,
                    ticker,
                    side,
                    quantity,
                    price,
                    currency,
                    country: find(&["country"]),
                    is_bond: find(&["issgb", "isbond", "bond"]),
                    issue_date: find(&["issuedate"]),
                    maturity_date: find(&["maturitydate", "maturity"]),
                    series: find(&["series"]),
                })
            }
            _ => Err(format!("missing required column(s): {}", missing.join(", "))),
        }
    }
}

/// Validate a whole table. Any issue rejects the file.
pub fn validate_table(
    file_name: &str,
    table: &RawTable,
    bond_file: bool,
) -> Result<Vec<ParsedTrade>, LedgerError> {
    if table.headers.is_empty() && table.rows.is_empty() {
        return Ok(Vec::new());
    }

    let mapping =
        ColumnMapping::from_headers(&table.headers).map_err(|reason| LedgerError::MalformedTradeFile {
            file: file_name.to_string(),
            reason,
        })?;

    let mut trades = Vec::new();
    let mut issues = Vec::new();

    for (idx, row) in table.rows.iter().enumerate() {
        match parse_row(file_name, idx + 1, row, &mapping, bond_file) {
            Ok(Some(trade)) => trades.push(trade),
            Ok(None) => continue,
            Err(mut row_issues) => issues.append(&mut row_issues),
        }
    }

    if issues.is_empty() {
        return Ok(trades);
    }

    let mut reason = issues
        .iter()
        .take(MAX_REPORTED_ISSUES)
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    if issues.len() > MAX_REPORTED_ISSUES {
        reason.push_str(&format!(" (and {} more)", issues.len() - MAX_REPORTED_ISSUES));
    }
    Err(LedgerError::MalformedTradeFile {
        file: file_name.to_string(),
        reason,
    })
}

fn parse_row(
    file_name: &str,
    row_number: usize,
    row: &[String],
    mapping: &ColumnMapping,
    bond_file: bool,
) -> Result<Option<ParsedTrade>, Vec<RowIssue>> {
    if row.iter().all(|c| c.trim().is_empty()) {
        return Ok(None);
    }

    let cell = |idx: usize| row.get(idx).map(|c| c.trim()).unwrap_or("");
    let optional = |idx: Option<usize>| idx.map(cell).filter(|c| !c.is_empty());
    let mut issues = Vec::new();

    let date = match parse_date(cell(mapping.date)) {
        Some(d) => Some(d),
        None => {
            issues.push(RowIssue::new(row_number, "Date", cell(mapping.date), "unrecognised date"));
            None
        }
    };

    let instrument = cell(mapping.ticker).to_uppercase();
    if instrument.is_empty() {
        issues.push(RowIssue::new(row_number, "Ticker", "", "ticker is empty"));
    }

    let side = match Side::from_str(cell(mapping.side)) {
        Ok(s) => Some(s),
        Err(e) => {
            issues.push(RowIssue::new(row_number, "Type", cell(mapping.side), e));
            None
        }
    };

    let quantity = parse_positive(row_number, "Qty", cell(mapping.quantity), &mut issues);
    let price = parse_positive(row_number, "Price", cell(mapping.price), &mut issues);

    let currency = match Currency::from_str(cell(mapping.currency)) {
        Ok(c) => Some(c),
        Err(e) => {
            issues.push(RowIssue::new(row_number, "Currency", cell(mapping.currency), e));
            None
        }
    };

    let mut optional_date = |field: &str, idx: Option<usize>| match optional(idx) {
        Some(text) => match parse_date(text) {
            Some(d) => Some(d),
            None => {
                issues.push(RowIssue::new(row_number, field, text, "unrecognised date"));
                None
            }
        },
        None => None,
    };
    let issue_date = optional_date("Issue Date", mapping.issue_date);
    let maturity_date = optional_date("Maturity Date", mapping.maturity_date);

    let is_bond = bond_file || optional(mapping.is_bond).map(is_truthy).unwrap_or(false);

    match (date, side, quantity, price, currency) {
        (Some(date), Some(side), Some(quantity), Some(price), Some(currency)) if issues.is_empty() => {
            Ok(Some(ParsedTrade {
                instrument,
                date,
                side,
                quantity,
                price,
                currency,
                country: optional(mapping.country).map(|c| c.to_string()),
                class: InstrumentClass::from_bond_flag(is_bond),
                bond_terms: BondTerms {
                    issue_date,
                    maturity_date,
                    series: optional(mapping.series).map(|s| s.to_string()),
                },
                origin: TradeOrigin {
                    file: file_name.to_string(),
                    row: row_number,
                },
            }))
        }
        _ => Err(issues),
    }
}

/// Accepts ISO, day-first and Excel serial dates
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    // Drop a time component ("2025-01-01 00:00:00")
    let date_part = text.split_whitespace().next().unwrap_or(text);

    for format in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(date_part, format) {
            return Some(date);
        }
    }

    // Plausible serial range: 1950..2100
    match date_part.parse::<f64>() {
        Ok(serial) if (18264.0..73051.0).contains(&serial) => {
            super::source_excel::excel_serial_to_date(serial).ok()
        }
        _ => None,
    }
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    let cleaned: String = text.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()
}

fn parse_positive(row: usize, field: &str, text: &str, issues: &mut Vec<RowIssue>) -> Option<Decimal> {
    match parse_decimal(text) {
        Some(v) if v > Decimal::ZERO => Some(v),
        Some(_) => {
            issues.push(RowIssue::new(row, field, text, "must be positive"));
            None
        }
        None => {
            issues.push(RowIssue::new(row, field, text, "not a number"));
            None
        }
    }
}

fn is_truthy(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "y"
    )
}
