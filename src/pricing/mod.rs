//! Pricing: live quote sources, the persistent price cache and the resolver
//! that walks the fallback chain between them.

pub mod cache;
pub mod nse;
pub mod resolver;
pub mod retry;
pub mod yahoo;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::SourceError;

pub use cache::{CsvPriceCache, MemoryPriceCache, PriceCacheEntry, PriceCacheStore};
pub use resolver::{NoYearEndPrices, PriceResolver, YearEndPrices};
pub use retry::RetryPolicy;

/// Quote returned by a live source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveQuote {
    pub price: Decimal,
    pub previous_close: Option<Decimal>,
    pub display_name: Option<String>,
}

/// A live market-data source
pub trait QuoteSource {
    /// Short identifier used in logs and errors
    fn id(&self) -> &'static str;

    /// Latest price for `symbol`
    fn fetch_quote(&self, symbol: &str) -> Result<LiveQuote, SourceError>;

    /// Closing price on `date`, or the nearest earlier close
    fn fetch_close_on(&self, symbol: &str, date: NaiveDate) -> Result<Decimal, SourceError>;
}

/// Which step of the fallback chain produced a price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceSource {
    PrimaryLive,
    SecondaryLive,
    /// Recorded in a year-end snapshot
    YearEnd,
    Cache,
    Unavailable,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::PrimaryLive => "primary-live",
            PriceSource::SecondaryLive => "secondary-live",
            PriceSource::YearEnd => "year-end",
            PriceSource::Cache => "cache",
            PriceSource::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved price for one instrument. `price` is `None` only when every
/// source failed, in which case `source` is [`PriceSource::Unavailable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub instrument: String,
    pub price: Option<Decimal>,
    pub previous_close: Option<Decimal>,
    pub display_name: String,
    pub source: PriceSource,
    pub as_of: NaiveDate,
}

impl PriceQuote {
    pub fn unavailable(instrument: &str, display_name: String, as_of: NaiveDate) -> Self {
        Self {
            instrument: instrument.to_string(),
            price: None,
            previous_close: None,
            display_name,
            source: PriceSource::Unavailable,
            as_of,
        }
    }

    pub fn is_priced(&self) -> bool {
        self.price.is_some()
    }
}

/// Count of quotes per source tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceSummary {
    counts: BTreeMap<PriceSource, usize>,
}

impl ProvenanceSummary {
    pub fn record(&mut self, source: PriceSource) {
        *self.counts.entry(source).or_insert(0) += 1;
    }

    pub fn count(&self, source: PriceSource) -> usize {
        self.counts.get(&source).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PriceSource, usize)> + '_ {
        self.counts.iter().map(|(s, n)| (*s, *n))
    }
}

impl<'a> FromIterator<&'a PriceQuote> for ProvenanceSummary {
    fn from_iter<I: IntoIterator<Item = &'a PriceQuote>>(iter: I) -> Self {
        let mut summary = Self::default();
        for quote in iter {
            summary.record(quote.source);
        }
        summary
    }
}

impl fmt::Display for ProvenanceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .counts
            .iter()
            .map(|(source, n)| format!("{}: {}", source, n))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Display name used when no source supplies one
pub fn default_display_name(instrument: &str, is_bond: bool) -> String {
    if is_bond {
        format!("{} (Sovereign Gold Bond)", instrument)
    } else {
        instrument.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(source: PriceSource) -> PriceQuote {
        PriceQuote {
            instrument: "X".to_string(),
            price: None,
            previous_close: None,
            display_name: "X".to_string(),
            source,
            as_of: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        }
    }

    #[test]
    fn test_provenance_counts_and_display() {
        let quotes = [
            quote(PriceSource::PrimaryLive),
            quote(PriceSource::Cache),
            quote(PriceSource::PrimaryLive),
        ];
        let summary: ProvenanceSummary = quotes.iter().collect();
        assert_eq!(summary.count(PriceSource::PrimaryLive), 2);
        assert_eq!(summary.count(PriceSource::Unavailable), 0);
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.to_string(), "primary-live: 2, cache: 1");
    }

    #[test]
    fn test_source_tags_serialize_kebab_case() {
        let json = serde_json::to_string(&PriceSource::SecondaryLive).unwrap();
        assert_eq!(json, "\"secondary-live\"");
    }

    #[test]
    fn test_default_display_name() {
        assert_eq!(default_display_name("AAPL", false), "AAPL");
        assert_eq!(
            default_display_name("SGBJUN31", true),
            "SGBJUN31 (Sovereign Gold Bond)"
        );
    }
}
