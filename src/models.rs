//! Core domain types shared by the ledger, cost-basis engine and reports

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// Same-day ordering: buys are applied before sells
    pub fn replay_rank(&self) -> u8 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" | "B" => Ok(Side::Buy),
            "SELL" | "S" => Ok(Side::Sell),
            other => Err(format!("unknown trade type '{}'", other)),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported trade and reporting currencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Inr,
    Usd,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Inr => "INR",
            Currency::Usd => "USD",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Currency::Inr => "₹",
            Currency::Usd => "$",
        }
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INR" | "₹" => Ok(Currency::Inr),
            "USD" | "$" => Ok(Currency::Usd),
            other => Err(format!("unsupported currency '{}'", other)),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Instrument classification. Bonds are priced through the bond exchange
/// source instead of the primary quote source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstrumentClass {
    Ordinary,
    FixedMaturityBond,
}

impl InstrumentClass {
    pub fn is_bond(&self) -> bool {
        matches!(self, InstrumentClass::FixedMaturityBond)
    }

    pub fn from_bond_flag(is_bond: bool) -> Self {
        if is_bond {
            InstrumentClass::FixedMaturityBond
        } else {
            InstrumentClass::Ordinary
        }
    }
}

/// Issue terms carried by fixed-maturity bond trades
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondTerms {
    pub issue_date: Option<NaiveDate>,
    pub maturity_date: Option<NaiveDate>,
    pub series: Option<String>,
}

/// Where a ledger row came from: source file name and 1-based data row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradeOrigin {
    pub file: String,
    pub row: usize,
}

/// One row of the consolidated ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
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
    /// Reporting-currency units per unit of `currency` on the trade date
    pub exchange_rate: Decimal,
}

impl Trade {
    /// quantity × price in the trade currency
    pub fn gross(&self) -> Decimal {
        self.quantity * self.price
    }

    /// quantity × price converted at the trade's exchange rate
    pub fn gross_reporting(&self) -> Decimal {
        self.gross() * self.exchange_rate
    }

    /// Signed reporting-currency cash flow: buys are outflows
    pub fn cash_flow(&self) -> CashFlow {
        let amount = match self.side {
            Side::Buy => -self.gross_reporting(),
            Side::Sell => self.gross_reporting(),
        };
        CashFlow {
            date: self.date,
            amount,
            instrument: self.instrument.clone(),
        }
    }

    /// Replay order: date, buys before sells, then file position
    pub fn replay_key(&self) -> (NaiveDate, u8, &str, usize) {
        (
            self.date,
            self.side.replay_rank(),
            self.origin.file.as_str(),
            self.origin.row,
        )
    }
}

/// An open purchase lot awaiting FIFO consumption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub instrument: String,
    pub date: NaiveDate,
    pub quantity: Decimal,
    /// Price per unit in the trade currency
    pub unit_cost: Decimal,
    pub currency: Currency,
    pub exchange_rate: Decimal,
}

impl Lot {
    pub fn cost(&self) -> Decimal {
        self.quantity * self.unit_cost
    }

    pub fn cost_reporting(&self) -> Decimal {
        self.cost() * self.exchange_rate
    }
}

/// Derived per-instrument state after replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentPosition {
    pub instrument: String,
    pub quantity: Decimal,
    /// Quantity-weighted unit cost of open lots, trade currency
    pub average_cost: Decimal,
    /// Cost of open lots in the reporting currency
    pub total_invested: Decimal,
    pub realized_profit: Decimal,
    pub currency: Currency,
    /// Rate of the most recent trade, used to value the open quantity
    pub exchange_rate: Decimal,
    pub class: InstrumentClass,
    pub lots: Vec<Lot>,
}

impl InstrumentPosition {
    pub fn is_open(&self) -> bool {
        self.quantity > Decimal::ZERO
    }
}

/// A dated reporting-currency cash flow. Negative amounts are outflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashFlow {
    pub date: NaiveDate,
    pub amount: Decimal,
    pub instrument: String,
}
