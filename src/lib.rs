//! Tradebook - multi-currency securities ledger and valuation engine
//!
//! Consolidates trade files from several sources into a single ledger,
//! replays it with FIFO lot matching, resolves prices through a live and
//! cached fallback chain, and reports cost basis, realized and unrealized
//! profit and the annualized return.

pub mod config;
pub mod cost_basis;
pub mod error;
pub mod fx;
pub mod importers;
pub mod ledger;
pub mod models;
pub mod pricing;
pub mod rebuild;
pub mod reports;
pub mod snapshots;
pub mod utils;
