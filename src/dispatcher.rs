//! Command dispatcher that routes parsed clap commands to their handlers.
//!
//! Handlers build the engine from configuration, run one operation and print
//! either a table or JSON.

use anyhow::{bail, Result};
use chrono::{Datelike, Local, NaiveDate};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io::IsTerminal;
use tracing::{info, warn};

use crate::cli::formatters;
use crate::cli::{parse_flexible_date, Commands, SnapshotCommands};
use tradebook::config::Config;
use tradebook::fx::{ExchangeRateApiSource, FxResolver, YahooFxSource};
use tradebook::ledger::{Consolidator, Ledger, Manifest};
use tradebook::pricing::nse::NseBondSource;
use tradebook::pricing::yahoo::YahooChartSource;
use tradebook::pricing::{CsvPriceCache, PriceQuote, PriceResolver, RetryPolicy};
use tradebook::rebuild::rebuild_all;
use tradebook::reports::{price_positions, replay_at, value_portfolio};
use tradebook::snapshots::{
    verify, write_snapshot, year_end_cutoff, DirSnapshotStore, SnapshotStore,
};

pub struct Context {
    pub config: Config,
    pub json: bool,
}

impl Context {
    fn fx_resolver(&self) -> FxResolver {
        let config = &self.config;
        let mut fx = FxResolver::new(
            config.reporting_currency,
            Box::new(CsvPriceCache::new(config.fx_cache_path())),
            config.fallback_rates(),
            RetryPolicy::from(&config.retry),
        );
        if config.offline {
            return fx;
        }
        match YahooFxSource::new() {
            Ok(source) => fx = fx.with_live(Box::new(source)),
            Err(e) => warn!("Live exchange-rate source unavailable: {}", e),
        }
        match ExchangeRateApiSource::new() {
            Ok(source) => fx = fx.with_alternate(Box::new(source)),
            Err(e) => warn!("Alternate exchange-rate source unavailable: {}", e),
        }
        fx
    }

    fn price_resolver(&self) -> PriceResolver {
        let config = &self.config;
        let mut resolver = PriceResolver::new(
            Box::new(CsvPriceCache::new(config.price_cache_path())),
            RetryPolicy::from(&config.retry),
        );
        if config.offline {
            info!("Offline mode: prices come from the cache only");
            return resolver;
        }
        match YahooChartSource::new() {
            Ok(source) => resolver = resolver.with_primary(Box::new(source)),
            Err(e) => warn!("Primary quote source unavailable: {}", e),
        }
        match NseBondSource::new() {
            Ok(source) => resolver = resolver.with_bond_exchange(Box::new(source)),
            Err(e) => warn!("Bond exchange source unavailable: {}", e),
        }
        resolver
    }

    fn consolidator(&self) -> Consolidator {
        Consolidator::new(
            self.config.ledger_path(),
            self.config.manifest_path(),
            &self.config.sources_dir,
            self.fx_resolver(),
        )
    }

    fn snapshots(&self) -> DirSnapshotStore {
        DirSnapshotStore::new(self.config.snapshots_dir())
    }

    fn ledger(&self) -> Result<Ledger> {
        Ledger::load(&self.config.ledger_path())
    }

    fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

/// Progress bar on stderr, hidden when stderr is not a terminal or output is JSON
fn progress_bar(len: usize, json: bool) -> ProgressBar {
    if json || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar
}

fn as_of(at: Option<&String>) -> Result<NaiveDate> {
    match at {
        Some(text) => parse_flexible_date(text),
        None => Ok(Local::now().date_naive()),
    }
}

/// Route a parsed command to its handler
pub fn dispatch(command: Commands, ctx: &Context) -> Result<()> {
    match command {
        Commands::Status => dispatch_status(ctx),
        Commands::Consolidate => dispatch_consolidate(ctx),
        Commands::Rebuild {
            skip_snapshots,
            with_prices,
        } => dispatch_rebuild(ctx, skip_snapshots, with_prices),
        Commands::Snapshot { action } => dispatch_snapshot(ctx, action),
        Commands::Prices { at } => dispatch_prices(ctx, as_of(at.as_ref())?),
        Commands::Summary { at } => dispatch_valuation(ctx, as_of(at.as_ref())?, false),
        Commands::Holdings { at } => dispatch_valuation(ctx, as_of(at.as_ref())?, true),
    }
}

fn dispatch_status(ctx: &Context) -> Result<()> {
    #[derive(Serialize)]
    struct Status {
        ledger_rows: usize,
        first_trade: Option<NaiveDate>,
        last_trade: Option<NaiveDate>,
        source_files: usize,
        snapshots: Vec<NaiveDate>,
    }

    let ledger = ctx.ledger()?;
    let manifest = Manifest::load(&ctx.config.manifest_path())?;
    let status = Status {
        ledger_rows: ledger.len(),
        first_trade: ledger.first_date(),
        last_trade: ledger.last_date(),
        source_files: manifest.len(),
        snapshots: ctx.snapshots().cutoffs()?,
    };

    if ctx.json {
        return ctx.print_json(&status);
    }
    print!(
        "{}",
        formatters::format_status(
            status.ledger_rows,
            status.first_trade,
            status.last_trade,
            status.source_files,
            &status.snapshots
        )
    );
    Ok(())
}

fn dispatch_consolidate(ctx: &Context) -> Result<()> {
    let report = ctx.consolidator().consolidate()?;
    if ctx.json {
        return ctx.print_json(&formatters::consolidation_json(&report));
    }
    print!("{}", formatters::format_consolidation(&report));
    Ok(())
}

fn dispatch_rebuild(ctx: &Context, skip_snapshots: bool, with_prices: bool) -> Result<()> {
    let mut consolidator = ctx.consolidator();
    if skip_snapshots {
        let report = consolidator.rebuild()?;
        if ctx.json {
            return ctx.print_json(&formatters::consolidation_json(&report));
        }
        print!("{}", formatters::format_consolidation(&report));
        return Ok(());
    }

    let store = ctx.snapshots();
    let pricer = with_prices.then(|| ctx.price_resolver());
    // Only completed years get a year-end snapshot
    let last_year = Local::now().year() - 1;
    let report = rebuild_all(
        &mut consolidator,
        &store,
        ctx.config.first_snapshot_year,
        last_year,
        pricer.as_ref(),
    )?;
    if ctx.json {
        return ctx.print_json(&formatters::rebuild_json(&report));
    }
    print!("{}", formatters::format_rebuild(&report));
    Ok(())
}

fn dispatch_snapshot(ctx: &Context, action: SnapshotCommands) -> Result<()> {
    let store = ctx.snapshots();
    match action {
        SnapshotCommands::Write { year, with_prices } => {
            let cutoff = year_end_cutoff(year)?;
            if cutoff >= Local::now().date_naive() {
                bail!("{} has not ended yet; snapshots are only written for past year ends", year);
            }
            let ledger = ctx.ledger()?;
            let pricer = with_prices.then(|| ctx.price_resolver());
            let written = write_snapshot(&store, &ledger, cutoff, pricer.as_ref())?;
            if ctx.json {
                return ctx.print_json(&written);
            }
            match written {
                Some(snapshot) => println!(
                    "Wrote snapshot {} ({} instruments, {} priced)",
                    snapshot.cutoff,
                    snapshot.positions.len(),
                    snapshot.year_end_prices.len()
                ),
                None => println!("No trades on or before {}, nothing written", cutoff),
            }
            Ok(())
        }
        SnapshotCommands::Verify { year } => {
            let cutoff = year_end_cutoff(year)?;
            let report = verify(&store, &ctx.ledger()?, cutoff)?;
            if ctx.json {
                return ctx.print_json(&serde_json::json!({
                    "cutoff": report.cutoff,
                    "consistent": report.is_consistent(),
                    "mismatches": report.mismatches,
                }));
            }
            print!("{}", formatters::format_verification(&report));
            if !report.is_consistent() {
                bail!("snapshot {} is inconsistent with the ledger", cutoff);
            }
            Ok(())
        }
        SnapshotCommands::List => {
            let mut rows = Vec::new();
            for cutoff in store.cutoffs()? {
                if let Some(snapshot) = store.load(cutoff)? {
                    rows.push((cutoff, snapshot.positions.len(), snapshot.year_end_prices.len()));
                }
            }
            if ctx.json {
                let entries: Vec<_> = rows
                    .iter()
                    .map(|(cutoff, instruments, priced)| {
                        serde_json::json!({
                            "cutoff": cutoff,
                            "instruments": instruments,
                            "priced": priced,
                        })
                    })
                    .collect();
                return ctx.print_json(&entries);
            }
            print!("{}", formatters::format_snapshot_list(&rows));
            Ok(())
        }
    }
}

fn dispatch_prices(ctx: &Context, as_of: NaiveDate) -> Result<()> {
    let ledger = ctx.ledger()?;
    let store = ctx.snapshots();
    let resolver = ctx.price_resolver();

    let (outcome, _) = replay_at(&ledger, &store, as_of);
    let bar = progress_bar(outcome.open_positions().count(), ctx.json);
    let resolution = price_positions(&outcome, &store, &resolver, as_of, |quote: &PriceQuote| {
        bar.set_message(quote.instrument.clone());
        bar.inc(1);
    });
    bar.finish_and_clear();

    if ctx.json {
        return ctx.print_json(&serde_json::json!({
            "as_of": as_of,
            "quotes": resolution.quotes,
            "provenance": resolution.provenance,
        }));
    }
    print!("{}", formatters::format_prices(&resolution));
    Ok(())
}

fn dispatch_valuation(ctx: &Context, as_of: NaiveDate, detailed: bool) -> Result<()> {
    let ledger = ctx.ledger()?;
    let store = ctx.snapshots();
    let resolver = ctx.price_resolver();

    let bar = progress_bar(ledger.instruments().len(), ctx.json);
    let report = value_portfolio(
        &ledger,
        &store,
        &resolver,
        as_of,
        ctx.config.reporting_currency,
        |quote: &PriceQuote| {
            bar.set_message(quote.instrument.clone());
            bar.inc(1);
        },
    )?;
    bar.finish_and_clear();

    match (ctx.json, detailed) {
        (true, true) => ctx.print_json(&report),
        (true, false) => ctx.print_json(&report.summary),
        (false, true) => {
            print!("{}", formatters::format_holdings(&report));
            Ok(())
        }
        (false, false) => {
            print!("{}", formatters::format_summary(&report.summary));
            Ok(())
        }
    }
}
