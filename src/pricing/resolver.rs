//! Price resolver
//!
//! Walks an ordered fallback chain per instrument class:
//! live source for the class, then the persistent cache. Historical
//! resolution first consults prices recorded in year-end snapshots.
//! Every live success is written back to the cache; batch runs write the
//! cache once at the end.

use chrono::{Local, NaiveDate};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::cache::{CachedPrice, PriceCacheEntry, PriceCacheStore, SaveStats};
use super::retry::RetryPolicy;
use super::{default_display_name, PriceQuote, PriceSource, ProvenanceSummary, QuoteSource};
use crate::models::InstrumentClass;

/// Prices recorded for a past cutoff date
pub trait YearEndPrices {
    fn year_end_price(&self, instrument: &str, date: NaiveDate) -> Option<Decimal>;
}

/// No recorded prices; historical resolution goes straight to live sources
pub struct NoYearEndPrices;

impl YearEndPrices for NoYearEndPrices {
    fn year_end_price(&self, _instrument: &str, _date: NaiveDate) -> Option<Decimal> {
        None
    }
}

/// One instrument to price
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub instrument: String,
    pub class: InstrumentClass,
}

impl QuoteRequest {
    pub fn new(instrument: impl Into<String>, class: InstrumentClass) -> Self {
        Self {
            instrument: instrument.into(),
            class,
        }
    }
}

/// Outcome of a batch resolution
#[derive(Debug, Clone, Default)]
pub struct BatchResolution {
    pub quotes: Vec<PriceQuote>,
    pub provenance: ProvenanceSummary,
    pub cache_stats: SaveStats,
}

/// Cache contents up to `through`, loaded on first use
struct CacheView<'a> {
    store: &'a dyn PriceCacheStore,
    through: NaiveDate,
    loaded: Option<HashMap<String, CachedPrice>>,
}

impl<'a> CacheView<'a> {
    fn new(store: &'a dyn PriceCacheStore, through: NaiveDate) -> Self {
        Self {
            store,
            through,
            loaded: None,
        }
    }

    fn get(&mut self, instrument: &str) -> Option<&CachedPrice> {
        let store = self.store;
        let through = self.through;
        self.loaded
            .get_or_insert_with(|| {
                store.load(through).unwrap_or_else(|e| {
                    warn!("Price cache unreadable, treating as empty: {:#}", e);
                    HashMap::new()
                })
            })
            .get(instrument)
    }
}

pub struct PriceResolver {
    primary: Option<Box<dyn QuoteSource>>,
    bond_exchange: Option<Box<dyn QuoteSource>>,
    cache: Box<dyn PriceCacheStore>,
    retry: RetryPolicy,
    today: NaiveDate,
}

impl PriceResolver {
    /// Resolver with no live sources; add them with the builder methods
    pub fn new(cache: Box<dyn PriceCacheStore>, retry: RetryPolicy) -> Self {
        Self {
            primary: None,
            bond_exchange: None,
            cache,
            retry,
            today: Local::now().date_naive(),
        }
    }

    pub fn with_primary(mut self, source: Box<dyn QuoteSource>) -> Self {
        self.primary = Some(source);
        self
    }

    pub fn with_bond_exchange(mut self, source: Box<dyn QuoteSource>) -> Self {
        self.bond_exchange = Some(source);
        self
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn cache(&self) -> &dyn PriceCacheStore {
        self.cache.as_ref()
    }

    fn live_source(&self, class: InstrumentClass) -> Option<(&dyn QuoteSource, PriceSource)> {
        match class {
            InstrumentClass::Ordinary => self
                .primary
                .as_deref()
                .map(|s| (s, PriceSource::PrimaryLive)),
            InstrumentClass::FixedMaturityBond => self
                .bond_exchange
                .as_deref()
                .map(|s| (s, PriceSource::SecondaryLive)),
        }
    }

    /// Current price for one instrument
    pub fn resolve(&self, instrument: &str, class: InstrumentClass) -> PriceQuote {
        let mut view = CacheView::new(self.cache.as_ref(), self.today);
        let (quote, update) = self.resolve_current(&QuoteRequest::new(instrument, class), &mut view);
        self.persist(update.into_iter().collect());
        quote
    }

    /// Price on a past `date`
    pub fn resolve_historical(
        &self,
        instrument: &str,
        class: InstrumentClass,
        date: NaiveDate,
        year_end: &dyn YearEndPrices,
    ) -> PriceQuote {
        let (quote, update) =
            self.resolve_at(&QuoteRequest::new(instrument, class), date, year_end);
        self.persist(update.into_iter().collect());
        quote
    }

    /// Current prices for many instruments, one cache write at the end
    pub fn resolve_batch(
        &self,
        requests: &[QuoteRequest],
        mut progress: impl FnMut(&PriceQuote),
    ) -> BatchResolution {
        let mut view = CacheView::new(self.cache.as_ref(), self.today);
        let mut updates = Vec::new();
        let mut quotes = Vec::with_capacity(requests.len());

        for request in requests {
            let (quote, update) = self.resolve_current(request, &mut view);
            updates.extend(update);
            progress(&quote);
            quotes.push(quote);
        }

        self.finish_batch(quotes, updates)
    }

    /// Prices on `date` for many instruments, one cache write at the end
    pub fn resolve_batch_historical(
        &self,
        requests: &[QuoteRequest],
        date: NaiveDate,
        year_end: &dyn YearEndPrices,
        mut progress: impl FnMut(&PriceQuote),
    ) -> BatchResolution {
        let mut updates = Vec::new();
        let mut quotes = Vec::with_capacity(requests.len());

        for request in requests {
            let (quote, update) = self.resolve_at(request, date, year_end);
            updates.extend(update);
            progress(&quote);
            quotes.push(quote);
        }

        self.finish_batch(quotes, updates)
    }

    fn finish_batch(&self, quotes: Vec<PriceQuote>, updates: Vec<PriceCacheEntry>) -> BatchResolution {
        let provenance: ProvenanceSummary = quotes.iter().collect();
        info!("Price resolution: {}", provenance);
        let cache_stats = self.persist(updates);
        BatchResolution {
            quotes,
            provenance,
            cache_stats,
        }
    }

    fn resolve_current(
        &self,
        request: &QuoteRequest,
        view: &mut CacheView<'_>,
    ) -> (PriceQuote, Option<PriceCacheEntry>) {
        let instrument = request.instrument.as_str();
        let fallback_name = default_display_name(instrument, request.class.is_bond());

        if let Some((source, tag)) = self.live_source(request.class) {
            let label = format!("{} quote for {}", source.id(), instrument);
            match self.retry.run(&label, || source.fetch_quote(instrument)) {
                Ok(live) => {
                    debug!("{} priced from {}: {}", instrument, source.id(), live.price);
                    let quote = PriceQuote {
                        instrument: instrument.to_string(),
                        price: Some(live.price),
                        previous_close: Some(live.previous_close.unwrap_or(live.price)),
                        display_name: live.display_name.unwrap_or(fallback_name),
                        source: tag,
                        as_of: self.today,
                    };
                    let update = PriceCacheEntry::new(instrument, self.today, live.price);
                    return (quote, Some(update));
                }
                Err(e) if e.is_rate_limited() => {
                    warn!("{} rate limited for {}, falling back to cache", source.id(), instrument)
                }
                Err(e) => warn!("Live price for {} failed: {}", instrument, e),
            }
        }

        match view.get(instrument) {
            Some(cached) => {
                info!(
                    "Using cached price for {} from {}",
                    instrument,
                    cached
                        .latest
                        .date
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "legacy cache".to_string())
                );
                let quote = PriceQuote {
                    instrument: instrument.to_string(),
                    price: Some(cached.latest.price),
                    previous_close: Some(
                        cached
                            .previous
                            .as_ref()
                            .map(|p| p.price)
                            .unwrap_or(cached.latest.price),
                    ),
                    display_name: fallback_name,
                    source: PriceSource::Cache,
                    as_of: self.today,
                };
                (quote, None)
            }
            None => {
                warn!("No price available for {}", instrument);
                (
                    PriceQuote::unavailable(instrument, fallback_name, self.today),
                    None,
                )
            }
        }
    }

    fn resolve_at(
        &self,
        request: &QuoteRequest,
        date: NaiveDate,
        year_end: &dyn YearEndPrices,
    ) -> (PriceQuote, Option<PriceCacheEntry>) {
        let instrument = request.instrument.as_str();
        let fallback_name = default_display_name(instrument, request.class.is_bond());
        let priced = |price: Decimal, source: PriceSource, name: String| PriceQuote {
            instrument: instrument.to_string(),
            price: Some(price),
            previous_close: None,
            display_name: name,
            source,
            as_of: date,
        };

        if let Some(price) = year_end.year_end_price(instrument, date) {
            debug!("{} priced from year-end snapshot {}", instrument, date);
            return (priced(price, PriceSource::YearEnd, fallback_name), None);
        }

        if let Some((source, tag)) = self.live_source(request.class) {
            let label = format!("{} {} close for {}", source.id(), date, instrument);
            match self.retry.run(&label, || source.fetch_close_on(instrument, date)) {
                Ok(price) => {
                    let update = PriceCacheEntry::new(instrument, date, price);
                    return (priced(price, tag, fallback_name), Some(update));
                }
                Err(e) => warn!("Historical price for {} on {} failed: {}", instrument, date, e),
            }
        }

        match self.cache.lookup(instrument, date) {
            Ok(Some(entry)) => (priced(entry.price, PriceSource::Cache, fallback_name), None),
            Ok(None) => (PriceQuote::unavailable(instrument, fallback_name, date), None),
            Err(e) => {
                warn!("Price cache unreadable: {:#}", e);
                (PriceQuote::unavailable(instrument, fallback_name, date), None)
            }
        }
    }

    fn persist(&self, updates: Vec<PriceCacheEntry>) -> SaveStats {
        if updates.is_empty() {
            return SaveStats::default();
        }
        match self.cache.save(&updates) {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Failed to update price cache: {:#}", e);
                SaveStats::default()
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::error::SourceError;
    use crate::pricing::cache::MemoryPriceCache;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::rc::Rc;
    use std::sync::Arc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Cache shared between the resolver and the assertions
    #[derive(Clone, Default)]
    struct SharedCache(Arc<MemoryPriceCache>);

    impl PriceCacheStore for SharedCache {
        fn entries(&self) -> anyhow::Result<Vec<PriceCacheEntry>> {
            self.0.entries()
        }
        fn replace_all(&self, entries: &[PriceCacheEntry]) -> anyhow::Result<()> {
            self.0.replace_all(entries)
        }
    }

    fn resolver(cache: &SharedCache) -> PriceResolver {
        PriceResolver::new(Box::new(cache.clone()), RetryPolicy::once()).with_today(date(2025, 6, 2))
    }

    #[test]
    fn test_live_success_is_cached() {
        let cache = SharedCache::default();
        let primary = ScriptedSource::new("primary").quote(live(dec!(165), Some(dec!(160))));
        let resolver = resolver(&cache).with_primary(Box::new(primary));

        let quote = resolver.resolve("AAPL", InstrumentClass::Ordinary);
        assert_eq!(quote.price, Some(dec!(165)));
        assert_eq!(quote.previous_close, Some(dec!(160)));
        assert_eq!(quote.source, PriceSource::PrimaryLive);

        let cached = cache.lookup("AAPL", date(2025, 6, 2)).unwrap().unwrap();
        assert_eq!(cached.price, dec!(165));
    }

    #[test]
    fn test_rate_limit_falls_back_to_cache() {
        let cache = SharedCache::default();
        cache
            .save(&[
                PriceCacheEntry::new("AAPL", date(2025, 5, 30), dec!(158)),
                PriceCacheEntry::new("AAPL", date(2025, 5, 29), dec!(155)),
            ])
            .unwrap();
        let primary = ScriptedSource::new("primary").quote(Err(rate_limited("primary")));
        let resolver = resolver(&cache).with_primary(Box::new(primary));

        let quote = resolver.resolve("AAPL", InstrumentClass::Ordinary);
        assert_eq!(quote.source, PriceSource::Cache);
        assert_eq!(quote.price, Some(dec!(158)));
        assert_eq!(quote.previous_close, Some(dec!(155)));
    }

    #[test]
    fn test_cache_with_single_entry_uses_it_as_previous_close() {
        let cache = SharedCache::default();
        cache
            .save(&[PriceCacheEntry::new("AAPL", date(2025, 5, 30), dec!(158))])
            .unwrap();
        let quote = resolver(&cache).resolve("AAPL", InstrumentClass::Ordinary);
        assert_eq!(quote.previous_close, Some(dec!(158)));
    }

    #[test]
    fn test_cache_ignores_prices_dated_after_today() {
        let cache = SharedCache::default();
        cache
            .save(&[PriceCacheEntry::new("AAPL", date(2025, 7, 1), dec!(170))])
            .unwrap();
        let quote = resolver(&cache).resolve("AAPL", InstrumentClass::Ordinary);
        assert_eq!(quote.source, PriceSource::Unavailable);
        assert_eq!(quote.price, None);

        cache
            .save(&[PriceCacheEntry::new("AAPL", date(2025, 5, 30), dec!(158))])
            .unwrap();
        let quote = resolver(&cache).resolve("AAPL", InstrumentClass::Ordinary);
        assert_eq!(quote.source, PriceSource::Cache);
        assert_eq!(quote.price, Some(dec!(158)));
        assert_eq!(quote.previous_close, Some(dec!(158)));
    }

    #[test]
    fn test_everything_failing_is_unavailable() {
        let cache = SharedCache::default();
        let primary = ScriptedSource::new("primary").quote(Err(SourceError::NotFound {
            source_id: "primary".to_string(),
            symbol: "NOPE".to_string(),
        }));
        let resolver = resolver(&cache).with_primary(Box::new(primary));

        let quote = resolver.resolve("NOPE", InstrumentClass::Ordinary);
        assert_eq!(quote.source, PriceSource::Unavailable);
        assert_eq!(quote.price, None);
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn test_bonds_use_the_bond_exchange() {
        let cache = SharedCache::default();
        let primary = Rc::new(ScriptedSource::new("primary"));
        let bonds = Rc::new(ScriptedSource::new("bonds").quote(live(dec!(6420), None)));
        let resolver = resolver(&cache)
            .with_primary(Box::new(primary.clone()))
            .with_bond_exchange(Box::new(bonds.clone()));

        let quote = resolver.resolve("SGBJUN31", InstrumentClass::FixedMaturityBond);
        assert_eq!(quote.source, PriceSource::SecondaryLive);
        assert_eq!(quote.previous_close, Some(dec!(6420)));
        assert_eq!(quote.display_name, "SGBJUN31 (Sovereign Gold Bond)");
        assert!(primary.calls.borrow().is_empty());
        assert_eq!(bonds.calls.borrow().len(), 1);
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let cache = SharedCache::default();
        let primary = Rc::new(
            ScriptedSource::new("primary")
                .quote(Err(SourceError::Http {
                    source_id: "primary".to_string(),
                    message: "reset".to_string(),
                }))
                .quote(live(dec!(10), None)),
        );
        let resolver = PriceResolver::new(
            Box::new(cache.clone()),
            RetryPolicy::new(2, std::time::Duration::ZERO, std::time::Duration::ZERO),
        )
        .with_primary(Box::new(primary.clone()));

        let quote = resolver.resolve("X", InstrumentClass::Ordinary);
        assert_eq!(quote.source, PriceSource::PrimaryLive);
        assert_eq!(primary.calls.borrow().len(), 2);
    }

    #[test]
    fn test_batch_writes_cache_once_and_counts_provenance() {
        let cache = SharedCache::default();
        cache
            .save(&[PriceCacheEntry::new("MSFT", date(2025, 5, 30), dec!(400))])
            .unwrap();
        let primary = ScriptedSource::new("primary")
            .quote(live(dec!(165), None))
            .quote(Err(rate_limited("primary")))
            .quote(Err(rate_limited("primary")));
        let resolver = resolver(&cache).with_primary(Box::new(primary));

        let requests = vec![
            QuoteRequest::new("AAPL", InstrumentClass::Ordinary),
            QuoteRequest::new("MSFT", InstrumentClass::Ordinary),
            QuoteRequest::new("TSLA", InstrumentClass::Ordinary),
        ];
        let mut seen = Vec::new();
        let batch = resolver.resolve_batch(&requests, |q| seen.push(q.instrument.clone()));

        assert_eq!(seen, vec!["AAPL", "MSFT", "TSLA"]);
        assert_eq!(batch.provenance.count(PriceSource::PrimaryLive), 1);
        assert_eq!(batch.provenance.count(PriceSource::Cache), 1);
        assert_eq!(batch.provenance.count(PriceSource::Unavailable), 1);
        assert_eq!(batch.cache_stats, SaveStats { updated: 0, added: 1 });
    }

    struct Recorded(BTreeMap<String, Decimal>);

    impl YearEndPrices for Recorded {
        fn year_end_price(&self, instrument: &str, _date: NaiveDate) -> Option<Decimal> {
            self.0.get(instrument).copied()
        }
    }

    #[test]
    fn test_historical_prefers_year_end_record() {
        let cache = SharedCache::default();
        let primary = Rc::new(ScriptedSource::new("primary"));
        let resolver = resolver(&cache).with_primary(Box::new(primary.clone()));
        let recorded = Recorded([("AAPL".to_string(), dec!(250))].into_iter().collect());

        let quote = resolver.resolve_historical(
            "AAPL",
            InstrumentClass::Ordinary,
            date(2024, 12, 31),
            &recorded,
        );
        assert_eq!(quote.source, PriceSource::YearEnd);
        assert_eq!(quote.price, Some(dec!(250)));
        assert_eq!(quote.as_of, date(2024, 12, 31));
        assert!(primary.calls.borrow().is_empty());
    }

    #[test]
    fn test_historical_live_then_cache() {
        let cache = SharedCache::default();
        let primary = ScriptedSource::new("primary").close(Ok(dec!(245)));
        let resolver = resolver(&cache).with_primary(Box::new(primary));

        let quote = resolver.resolve_historical(
            "AAPL",
            InstrumentClass::Ordinary,
            date(2024, 12, 31),
            &NoYearEndPrices,
        );
        assert_eq!(quote.source, PriceSource::PrimaryLive);
        assert_eq!(quote.previous_close, None);

        // Second call: live is exhausted, the cached close answers
        let again = resolver.resolve_historical(
            "AAPL",
            InstrumentClass::Ordinary,
            date(2025, 1, 3),
            &NoYearEndPrices,
        );
        assert_eq!(again.source, PriceSource::Cache);
        assert_eq!(again.price, Some(dec!(245)));
    }
}
