//! Error handling for the tradebook engine
//!
//! Typed errors for the failure modes callers branch on, plus a unified
//! Result alias using anyhow for context chaining everywhere else.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading trade source files or the consolidated ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// A source file that cannot be parsed or fails validation. Only that
    /// file is skipped; consolidation continues with the others.
    #[error("malformed trade file {file}: {reason}")]
    MalformedTradeFile { file: String, reason: String },

    /// A trade whose currency could not be converted to the reporting currency
    #[error("no exchange rate for {currency} on {date} (file {file})")]
    MissingExchangeRate {
        file: String,
        currency: String,
        date: NaiveDate,
    },

    /// The consolidated ledger itself is unreadable. Always fatal.
    #[error("ledger {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// A sell that exceeds the quantity held at that point in history
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("oversell of {instrument} on {date}: selling {requested} but only {held} held")]
pub struct OversellError {
    pub instrument: String,
    pub date: NaiveDate,
    pub requested: Decimal,
    pub held: Decimal,
}

/// Errors from the snapshot store
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot for {cutoff} already exists at {path}")]
    AlreadyExists { cutoff: NaiveDate, path: PathBuf },

    #[error("refusing to snapshot {cutoff}: replay failed for {}", .instruments.join(", "))]
    Integrity {
        cutoff: NaiveDate,
        instruments: Vec<String>,
    },
}

/// How a failed source call may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Permanent failure, retrying cannot help
    Never,
    /// Transient failure, retry with exponential backoff
    WithBackoff,
    /// Throttled by the provider, retry after a longer pause
    RateLimited,
}

/// Errors from live quote and exchange-rate sources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("{source_id}: rate limited")]
    RateLimited { source_id: String },

    #[error("{source_id}: no data for {symbol}")]
    NotFound { source_id: String, symbol: String },

    #[error("{source_id}: request failed: {message}")]
    Http { source_id: String, message: String },

    #[error("{source_id}: unexpected response: {message}")]
    Parse { source_id: String, message: String },

    #[error("{source_id}: {what} is not supported")]
    Unsupported { source_id: String, what: String },
}

impl SourceError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            SourceError::RateLimited { .. } => RetryClass::RateLimited,
            SourceError::Http { .. } => RetryClass::WithBackoff,
            SourceError::NotFound { .. }
            | SourceError::Parse { .. }
            | SourceError::Unsupported { .. } => RetryClass::Never,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SourceError::RateLimited { .. })
    }

    /// Map a transport error from reqwest, keeping 429 distinguishable
    pub fn from_reqwest(source_id: &str, err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            return SourceError::RateLimited {
                source_id: source_id.to_string(),
            };
        }
        if err.is_decode() {
            return SourceError::Parse {
                source_id: source_id.to_string(),
                message: err.to_string(),
            };
        }
        SourceError::Http {
            source_id: source_id.to_string(),
            message: err.to_string(),
        }
    }
}

/// Errors from the annualized return solver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SolverError {
    #[error("at least two cash flows are required")]
    InsufficientFlows,

    #[error("cash flows must contain both an outflow and an inflow")]
    SameSign,

    #[error("solver did not converge after {iterations} iterations")]
    NonConvergence { iterations: u32 },
}

/// Result type alias for engine operations
pub type Result<T> = anyhow::Result<T>;
