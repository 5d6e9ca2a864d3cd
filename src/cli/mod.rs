use anyhow::{bail, Result};
use chrono::{Datelike, NaiveDate};
use clap::{Parser, Subcommand};

pub mod formatters;

#[derive(Parser)]
#[command(name = "tradebook")]
#[command(
    version,
    about = "Multi-currency trade ledger with FIFO cost basis and annualized returns"
)]
#[command(
    long_about = "Consolidate trade files from several brokers into one ledger, replay it with FIFO lot matching, price holdings through a live-then-cache fallback chain and report invested capital, realized and unrealized profit and the annualized return."
)]
pub struct Cli {
    /// Disable colorized/ANSI output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Output results in JSON format
    #[arg(long = "json", global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show ledger, manifest and snapshot status
    Status,

    /// Absorb new and changed trade files into the ledger
    Consolidate,

    /// Rebuild the ledger from scratch and regenerate year-end snapshots
    Rebuild {
        /// Rebuild the ledger only
        #[arg(long)]
        skip_snapshots: bool,

        /// Record year-end prices in the regenerated snapshots
        #[arg(long)]
        with_prices: bool,
    },

    /// Year-end holdings snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotCommands,
    },

    /// Resolve prices for open positions
    Prices {
        /// Valuation date (YYYY-MM-DD, YYYY-MM or YYYY)
        #[arg(long)]
        at: Option<String>,
    },

    /// Portfolio totals: invested, value, profit, annualized return
    Summary {
        /// Valuation date (YYYY-MM-DD, YYYY-MM or YYYY)
        #[arg(long)]
        at: Option<String>,
    },

    /// Per-instrument detail
    Holdings {
        /// Valuation date (YYYY-MM-DD, YYYY-MM or YYYY)
        #[arg(long)]
        at: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Write the snapshot for December 31st of a year
    Write {
        year: i32,

        /// Record year-end prices for open positions
        #[arg(long)]
        with_prices: bool,
    },

    /// Compare a stored snapshot with a full replay of the ledger
    Verify { year: i32 },

    /// List stored snapshots
    List,
}

/// Parse YYYY-MM-DD, YYYY-MM (last day of month) or YYYY (December 31st)
pub fn parse_flexible_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date);
    }

    if let Ok(first) = NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d") {
        let next_month = if first.month() == 12 {
            NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
        };
        if let Some(last) = next_month.and_then(|d| d.pred_opt()) {
            return Ok(last);
        }
    }

    if let Ok(year) = s.parse::<i32>() {
        if let Some(date) = NaiveDate::from_ymd_opt(year, 12, 31).filter(|_| (1900..=2100).contains(&year)) {
            return Ok(date);
        }
    }

    bail!("Invalid date '{}'. Use YYYY-MM-DD, YYYY-MM, or YYYY", s)
}
