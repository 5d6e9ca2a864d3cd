//! Currency conversion for ledger enrichment
//!
//! Every trade is stamped with the rate from its currency to the reporting
//! currency on the trade date. Rates come from a live dated source, then an
//! undated alternate source, then the local rate cache, then a configured
//! constant. The chain always produces a rate when a fallback is configured.

pub mod sources;

use anyhow::Result;
use chrono::{Local, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::models::Currency;
use crate::pricing::cache::{PriceCacheEntry, PriceCacheStore, SaveStats};
use crate::pricing::RetryPolicy;

pub use sources::{ExchangeRateApiSource, YahooFxSource};

/// A source of exchange rates between two currencies
pub trait ExchangeRateSource {
    fn id(&self) -> &'static str;

    /// Units of `to` per unit of `from` on `date`
    fn rate_on(&self, from: Currency, to: Currency, date: NaiveDate) -> Result<Decimal, SourceError>;
}

/// Where a resolved rate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateSource {
    /// Trade already in the reporting currency
    Identity,
    Live,
    Cache,
    Alternate,
    Fallback,
}

impl fmt::Display for RateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RateSource::Identity => "identity",
            RateSource::Live => "live",
            RateSource::Cache => "cache",
            RateSource::Alternate => "alternate",
            RateSource::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRate {
    pub rate: Decimal,
    pub source: RateSource,
}

/// Cache key for a currency pair, e.g. `USDINR`
pub fn pair_key(from: Currency, to: Currency) -> String {
    format!("{}{}", from.code(), to.code())
}

pub struct FxResolver {
    reporting: Currency,
    live: Option<Box<dyn ExchangeRateSource>>,
    alternate: Option<Box<dyn ExchangeRateSource>>,
    cache: Box<dyn PriceCacheStore>,
    fallback: BTreeMap<Currency, Decimal>,
    retry: RetryPolicy,
    today: NaiveDate,
    memo: HashMap<(Currency, NaiveDate), ResolvedRate>,
    alternate_memo: HashMap<Currency, Option<Decimal>>,
    live_down: HashSet<Currency>,
    pending: Vec<PriceCacheEntry>,
    provenance: BTreeMap<RateSource, usize>,
}

impl FxResolver {
    pub fn new(
        reporting: Currency,
        cache: Box<dyn PriceCacheStore>,
        fallback: BTreeMap<Currency, Decimal>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            reporting,
            live: None,
            alternate: None,
            cache,
            fallback,
            retry,
            today: Local::now().date_naive(),
            memo: HashMap::new(),
            alternate_memo: HashMap::new(),
            live_down: HashSet::new(),
            pending: Vec::new(),
            provenance: BTreeMap::new(),
        }
    }

    pub fn with_live(mut self, source: Box<dyn ExchangeRateSource>) -> Self {
        self.live = Some(source);
        self
    }

    pub fn with_alternate(mut self, source: Box<dyn ExchangeRateSource>) -> Self {
        self.alternate = Some(source);
        self
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn reporting_currency(&self) -> Currency {
        self.reporting
    }

    /// Rates resolved so far, counted by source
    pub fn provenance(&self) -> &BTreeMap<RateSource, usize> {
        &self.provenance
    }

    /// Rate from `currency` to the reporting currency on `date`, or `None`
    /// when every source failed and no fallback is configured
    pub fn rate(&mut self, currency: Currency, date: NaiveDate) -> Option<ResolvedRate> {
        let resolved = self.resolve(currency, date)?;
        *self.provenance.entry(resolved.source).or_insert(0) += 1;
        Some(resolved)
    }

    fn resolve(&mut self, currency: Currency, date: NaiveDate) -> Option<ResolvedRate> {
        if currency == self.reporting {
            return Some(ResolvedRate {
                rate: Decimal::ONE,
                source: RateSource::Identity,
            });
        }
        if let Some(hit) = self.memo.get(&(currency, date)) {
            return Some(*hit);
        }

        let key = pair_key(currency, self.reporting);
        let resolved = self
            .from_live(currency, date, &key)
            .or_else(|| self.from_alternate(currency, &key))
            .or_else(|| self.from_cache(date, &key))
            .or_else(|| self.from_fallback(currency))?;

        debug!("{} on {} = {} ({})", key, date, resolved.rate, resolved.source);
        self.memo.insert((currency, date), resolved);
        Some(resolved)
    }

    fn from_live(&mut self, currency: Currency, date: NaiveDate, key: &str) -> Option<ResolvedRate> {
        if self.live_down.contains(&currency) {
            return None;
        }
        let source = self.live.as_deref()?;
        let reporting = self.reporting;
        let label = format!("{} {} rate for {}", source.id(), key, date);
        match self.retry.run(&label, || source.rate_on(currency, reporting, date)) {
            Ok(rate) => {
                self.pending.push(PriceCacheEntry::new(key, date, rate));
                Some(ResolvedRate {
                    rate,
                    source: RateSource::Live,
                })
            }
            Err(e) => {
                warn!("Live {} rate unavailable ({}), skipping live source for this run", key, e);
                self.live_down.insert(currency);
                None
            }
        }
    }

    fn from_cache(&self, date: NaiveDate, key: &str) -> Option<ResolvedRate> {
        match self.cache.lookup(key, date) {
            Ok(entry) => entry.map(|e| ResolvedRate {
                rate: e.price,
                source: RateSource::Cache,
            }),
            Err(e) => {
                warn!("Exchange-rate cache unreadable: {:#}", e);
                None
            }
        }
    }

    fn from_alternate(&mut self, currency: Currency, key: &str) -> Option<ResolvedRate> {
        if let Some(memo) = self.alternate_memo.get(&currency) {
            return memo.map(|rate| ResolvedRate {
                rate,
                source: RateSource::Alternate,
            });
        }
        let source = self.alternate.as_deref()?;
        let reporting = self.reporting;
        let today = self.today;
        let label = format!("{} {} latest rate", source.id(), key);
        let rate = match self.retry.run(&label, || source.rate_on(currency, reporting, today)) {
            Ok(rate) => {
                info!("Using current {} rate {} from {}", key, rate, source.id());
                self.pending.push(PriceCacheEntry::new(key, today, rate));
                Some(rate)
            }
            Err(e) => {
                warn!("Alternate {} rate unavailable: {}", key, e);
                None
            }
        };
        self.alternate_memo.insert(currency, rate);
        rate.map(|rate| ResolvedRate {
            rate,
            source: RateSource::Alternate,
        })
    }

    fn from_fallback(&self, currency: Currency) -> Option<ResolvedRate> {
        let rate = self.fallback.get(&currency).copied()?;
        warn!("Using configured fallback rate {} for {}", rate, currency);
        Some(ResolvedRate {
            rate,
            source: RateSource::Fallback,
        })
    }

    /// Write rates fetched during this run to the cache
    pub fn flush(&mut self) -> Result<SaveStats> {
        let pending = std::mem::take(&mut self.pending);
        self.cache.save(&pending)
    }
}
