//! Output formatting module for CLI display
//!
//! This module handles all terminal output formatting, separating
//! the concerns of data calculation from presentation.

use chrono::NaiveDate;
use colored::Colorize;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use tradebook::ledger::ConsolidationReport;
use tradebook::models::Currency;
use tradebook::pricing::resolver::BatchResolution;
use tradebook::rebuild::RebuildReport;
use tradebook::reports::{PortfolioReport, PortfolioSummary};
use tradebook::snapshots::Verification;
use tradebook::utils::{format_money, format_money_opt, format_pct, format_quantity};

/// Green for gains, red for losses
fn signed(text: String, value: Decimal) -> String {
    if value >= Decimal::ZERO {
        text.green().to_string()
    } else {
        text.red().to_string()
    }
}

fn signed_money(value: Option<Decimal>, currency: Currency) -> String {
    match value {
        Some(v) => signed(format_money(v, currency), v),
        None => "N/A".yellow().to_string(),
    }
}

fn signed_pct(value: Option<Decimal>) -> String {
    match value {
        Some(v) => signed(format_pct(Some(v)), v),
        None => "N/A".yellow().to_string(),
    }
}

fn right_aligned(table: &mut Table, from: usize) {
    table
        .with(Style::modern())
        .with(Modify::new(Columns::new(from..)).with(Alignment::right()));
}

pub fn format_status(
    ledger_rows: usize,
    first: Option<NaiveDate>,
    last: Option<NaiveDate>,
    manifest_files: usize,
    snapshots: &[NaiveDate],
) -> String {
    let range = match (first, last) {
        (Some(a), Some(b)) => format!("{} → {}", a, b),
        _ => "empty".to_string(),
    };
    let latest = snapshots
        .last()
        .map(|d| d.to_string())
        .unwrap_or_else(|| "none".to_string());
    format!(
        "\n{} Tradebook status\n\n{:<20} {}\n{:<20} {}\n{:<20} {}\n{:<20} {} (latest {})\n",
        "📒".cyan().bold(),
        "Ledger rows:".bold(),
        ledger_rows,
        "Date range:".bold(),
        range,
        "Source files:".bold(),
        manifest_files,
        "Snapshots:".bold(),
        snapshots.len(),
        latest
    )
}

pub fn consolidation_json(report: &ConsolidationReport) -> Value {
    let fx: serde_json::Map<String, Value> = report
        .fx_provenance
        .iter()
        .map(|(source, n)| (source.to_string(), json!(n)))
        .collect();
    json!({
        "absorbed": report.absorbed.iter().map(|a| json!({
            "file": a.file,
            "rows": a.rows,
            "replaced": a.replaced,
        })).collect::<Vec<_>>(),
        "unchanged": report.unchanged,
        "rejected": report.rejected.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        "ledger_rows": report.ledger_rows,
        "ledger_written": report.ledger_written,
        "fx_provenance": fx,
    })
}

pub fn format_consolidation(report: &ConsolidationReport) -> String {
    #[derive(Tabled)]
    struct FileRow {
        #[tabled(rename = "File")]
        file: String,
        #[tabled(rename = "Outcome")]
        outcome: String,
        #[tabled(rename = "Rows")]
        rows: String,
    }

    let mut rows: Vec<FileRow> = report
        .absorbed
        .iter()
        .map(|a| FileRow {
            file: a.file.clone(),
            outcome: if a.replaced > 0 {
                format!("updated ({} replaced)", a.replaced).yellow().to_string()
            } else {
                "added".green().to_string()
            },
            rows: a.rows.to_string(),
        })
        .collect();
    rows.extend(report.unchanged.iter().map(|f| FileRow {
        file: f.clone(),
        outcome: "unchanged".bright_black().to_string(),
        rows: "-".to_string(),
    }));

    let mut output = String::new();
    if rows.is_empty() {
        output.push_str(&format!("\n{} No trade files found\n", "ℹ".blue().bold()));
    } else {
        let mut table = Table::new(&rows);
        right_aligned(&mut table, 2);
        output.push_str(&format!("\n{}\n", table));
    }

    for err in &report.rejected {
        output.push_str(&format!("{} {}\n", "✗".red().bold(), err));
    }
    if !report.fx_provenance.is_empty() {
        let parts: Vec<String> = report
            .fx_provenance
            .iter()
            .map(|(source, n)| format!("{}: {}", source, n))
            .collect();
        output.push_str(&format!("Exchange rates: {}\n", parts.join(", ")));
    }
    output.push_str(&format!(
        "\n{} Ledger has {} trades{}\n",
        "✓".green().bold(),
        report.ledger_rows,
        if report.ledger_written { "" } else { " (unchanged)" }
    ));
    output
}

pub fn rebuild_json(report: &RebuildReport) -> Value {
    json!({
        "consolidation": consolidation_json(&report.consolidation),
        "removed_snapshots": report.removed_snapshots,
        "written": report.written,
        "skipped": report.skipped,
        "refused": report.refused.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
    })
}

pub fn format_rebuild(report: &RebuildReport) -> String {
    let mut output = format_consolidation(&report.consolidation);
    if report.removed_snapshots > 0 {
        output.push_str(&format!("Removed {} old snapshots\n", report.removed_snapshots));
    }
    for cutoff in &report.written {
        output.push_str(&format!("{} Snapshot {}\n", "✓".green().bold(), cutoff));
    }
    for refusal in &report.refused {
        output.push_str(&format!("{} {}\n", "✗".red().bold(), refusal));
    }
    output
}

pub fn format_snapshot_list(snapshots: &[(NaiveDate, usize, usize)]) -> String {
    #[derive(Tabled)]
    struct SnapshotRow {
        #[tabled(rename = "Cutoff")]
        cutoff: String,
        #[tabled(rename = "Instruments")]
        instruments: usize,
        #[tabled(rename = "Priced")]
        priced: usize,
    }

    if snapshots.is_empty() {
        return format!(
            "{} No snapshots yet\nCreate one with: {} snapshot write <year>\n",
            "ℹ".blue().bold(),
            "tradebook".bold()
        );
    }
    let rows: Vec<SnapshotRow> = snapshots
        .iter()
        .map(|(cutoff, instruments, priced)| SnapshotRow {
            cutoff: cutoff.to_string(),
            instruments: *instruments,
            priced: *priced,
        })
        .collect();
    let mut table = Table::new(&rows);
    right_aligned(&mut table, 1);
    format!("{}\n", table)
}

pub fn format_verification(report: &Verification) -> String {
    if report.is_consistent() {
        return format!(
            "{} Snapshot {} matches a full replay\n",
            "✓".green().bold(),
            report.cutoff
        );
    }
    let mut output = format!(
        "{} Snapshot {} differs from a full replay:\n",
        "✗".red().bold(),
        report.cutoff
    );
    for mismatch in &report.mismatches {
        output.push_str(&format!("  - {}\n", mismatch));
    }
    output
}

pub fn format_prices(resolution: &BatchResolution) -> String {
    #[derive(Tabled)]
    struct PriceRow {
        #[tabled(rename = "Instrument")]
        instrument: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Price")]
        price: String,
        #[tabled(rename = "Prev Close")]
        previous: String,
        #[tabled(rename = "Source")]
        source: String,
    }

    let rows: Vec<PriceRow> = resolution
        .quotes
        .iter()
        .map(|q| PriceRow {
            instrument: q.instrument.clone(),
            name: q.display_name.clone(),
            price: q
                .price
                .map(|p| format!("{:.2}", p))
                .unwrap_or_else(|| "N/A".yellow().to_string()),
            previous: q
                .previous_close
                .map(|p| format!("{:.2}", p))
                .unwrap_or_else(|| "-".to_string()),
            source: q.source.to_string(),
        })
        .collect();

    let mut output = String::new();
    if rows.is_empty() {
        output.push_str(&format!("\n{} No open positions to price\n", "ℹ".blue().bold()));
        return output;
    }
    let mut table = Table::new(&rows);
    table
        .with(Style::modern())
        .with(Modify::new(Columns::new(2..4)).with(Alignment::right()));
    output.push_str(&format!("\n{}\n", table));
    output.push_str(&format!("Sources: {}\n", resolution.provenance));
    let stats = &resolution.cache_stats;
    if stats.updated + stats.added > 0 {
        output.push_str(&format!(
            "Price cache: {} updated, {} added\n",
            stats.updated, stats.added
        ));
    }
    output
}

pub fn format_summary(summary: &PortfolioSummary) -> String {
    let ccy = summary.reporting_currency;
    let mut output = format!(
        "\n{} Portfolio as of {}\n\n",
        "📊".cyan().bold(),
        summary.as_of
    );
    let line = |label: &str, value: String| format!("{:<22} {}\n", label.bold(), value);

    output.push_str(&line("Total Invested:", format_money(summary.total_invested, ccy)));
    output.push_str(&line("Current Value:", format_money(summary.current_value, ccy)));
    output.push_str(&line(
        "Unrealized P&L:",
        signed_money(Some(summary.unrealized_profit), ccy),
    ));
    output.push_str(&line(
        "Realized Profit:",
        signed_money(Some(summary.realized_profit), ccy),
    ));
    let daily = match summary.daily_change {
        Some(change) => format!(
            "{} ({})",
            signed_money(Some(change), ccy),
            signed_pct(summary.daily_change_pct)
        ),
        None => "N/A".yellow().to_string(),
    };
    output.push_str(&line("Daily Change:", daily));
    let annualized = match summary.annualized_return {
        Some(rate) => {
            let pct = Decimal::try_from(rate * 100.0).ok().map(|p| p.round_dp(2));
            signed_pct(pct)
        }
        None => format!(
            "{} ({})",
            "N/A".yellow(),
            summary.annualized_return_note.as_deref().unwrap_or("undefined")
        ),
    };
    output.push_str(&line("Annualized Return:", annualized));
    output.push_str(&line("Holdings:", summary.holdings_count.to_string()));

    if !summary.unpriced.is_empty() {
        output.push_str(&format!(
            "\n{} Invested, unpriced: {}\n",
            "⚠".yellow().bold(),
            summary.unpriced.join(", ")
        ));
    }
    for err in &summary.replay_errors {
        output.push_str(&format!("{} {}\n", "✗".red().bold(), err));
    }
    if summary.provenance.total() > 0 {
        output.push_str(&format!("\nSources: {}\n", summary.provenance));
    }
    if let Some(cutoff) = summary.resumed_from {
        output.push_str(&format!("{}\n", format!("Resumed from snapshot {}", cutoff).bright_black()));
    }
    output
}

pub fn format_holdings(report: &PortfolioReport) -> String {
    #[derive(Tabled)]
    struct HoldingTableRow {
        #[tabled(rename = "Instrument")]
        instrument: String,
        #[tabled(rename = "Qty")]
        quantity: String,
        #[tabled(rename = "Avg Cost")]
        avg_cost: String,
        #[tabled(rename = "Invested")]
        invested: String,
        #[tabled(rename = "Price")]
        price: String,
        #[tabled(rename = "Value")]
        value: String,
        #[tabled(rename = "P&L")]
        pl: String,
        #[tabled(rename = "Return %")]
        return_pct: String,
        #[tabled(rename = "Realized")]
        realized: String,
        #[tabled(rename = "Source")]
        source: String,
    }

    if report.holdings.is_empty() {
        return format!(
            "{} No trades in the ledger\nAdd trade files and run: {} consolidate\n",
            "ℹ".blue().bold(),
            "tradebook".bold()
        );
    }

    let ccy = report.summary.reporting_currency;
    let rows: Vec<HoldingTableRow> = report
        .holdings
        .iter()
        .map(|h| HoldingTableRow {
            instrument: if h.replay_error.is_some() {
                format!("{} ✗", h.instrument).red().to_string()
            } else {
                h.instrument.clone()
            },
            quantity: format_quantity(h.quantity),
            avg_cost: format_money(h.average_cost, h.currency),
            invested: format_money(h.total_invested, ccy),
            price: format_money_opt(h.price, h.currency),
            value: format_money_opt(h.current_value, ccy),
            pl: signed_money(h.unrealized_profit, ccy),
            return_pct: signed_pct(h.return_pct),
            realized: signed_money(Some(h.realized_profit), ccy),
            source: h
                .source
                .map(|s| s.to_string())
                .unwrap_or_else(|| "closed".bright_black().to_string()),
        })
        .collect();

    let mut table = Table::new(&rows);
    table
        .with(Style::modern())
        .with(Modify::new(Columns::new(1..9)).with(Alignment::right()));

    let mut output = format!("\n{}\n", table);
    output.push_str(&format_summary(&report.summary));
    output
}
