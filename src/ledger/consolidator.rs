//! Incremental consolidation of trade source files into the ledger

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::manifest::{pending, Manifest, SourceFileState};
use super::Ledger;
use crate::error::LedgerError;
use crate::fx::{FxResolver, RateSource};
use crate::importers::{detect_source_file, parse_source_file};
use crate::models::Trade;

/// One absorbed source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsorbedFile {
    pub file: String,
    pub rows: usize,
    /// Rows from an earlier version of the file that were replaced
    pub replaced: usize,
}

#[derive(Debug, Default)]
pub struct ConsolidationReport {
    pub absorbed: Vec<AbsorbedFile>,
    pub unchanged: Vec<String>,
    pub rejected: Vec<LedgerError>,
    pub ledger_rows: usize,
    pub ledger_written: bool,
    pub fx_provenance: BTreeMap<RateSource, usize>,
}

impl ConsolidationReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

pub struct Consolidator {
    ledger_path: PathBuf,
    manifest_path: PathBuf,
    sources_dir: PathBuf,
    fx: FxResolver,
}

impl Consolidator {
    pub fn new(
        ledger_path: impl Into<PathBuf>,
        manifest_path: impl Into<PathBuf>,
        sources_dir: impl Into<PathBuf>,
        fx: FxResolver,
    ) -> Self {
        Self {
            ledger_path: ledger_path.into(),
            manifest_path: manifest_path.into(),
            sources_dir: sources_dir.into(),
            fx,
        }
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Absorb new and changed source files into the existing ledger
    pub fn consolidate(&mut self) -> Result<ConsolidationReport> {
        let mut ledger = Ledger::load(&self.ledger_path)?;
        let mut manifest = Manifest::load(&self.manifest_path)?;
        let files = discover_source_files(&self.sources_dir)?;
        self.absorb(&mut ledger, &mut manifest, &files, false)
    }

    /// Discard the ledger and manifest and absorb every source file again
    pub fn rebuild(&mut self) -> Result<ConsolidationReport> {
        for path in [&self.ledger_path, &self.manifest_path] {
            if path.exists() {
                std::fs::remove_file(path)
                    .with_context(|| format!("Failed to remove {:?}", path))?;
                info!("Removed {:?}", path);
            }
        }
        let mut ledger = Ledger::default();
        let mut manifest = Manifest::default();
        let files = discover_source_files(&self.sources_dir)?;
        self.absorb(&mut ledger, &mut manifest, &files, true)
    }

    fn absorb(
        &mut self,
        ledger: &mut Ledger,
        manifest: &mut Manifest,
        files: &[SourceFileState],
        always_write: bool,
    ) -> Result<ConsolidationReport> {
        let todo = pending(manifest, files);
        let mut report = ConsolidationReport {
            unchanged: files
                .iter()
                .filter(|f| !todo.iter().any(|t| t.name == f.name))
                .map(|f| f.name.clone())
                .collect(),
            ..Default::default()
        };

        for state in todo {
            match self.enrich(state) {
                Ok(trades) => {
                    let replaced = ledger.remove_source(&state.name);
                    if replaced > 0 {
                        info!("{} changed, replacing {} earlier rows", state.name, replaced);
                    }
                    let rows = trades.len();
                    ledger.extend(trades);
                    manifest.insert(state.name.clone(), state.record(rows));
                    report.absorbed.push(AbsorbedFile {
                        file: state.name.clone(),
                        rows,
                        replaced,
                    });
                }
                Err(e) => {
                    warn!("Skipping {}: {}", state.name, e);
                    report.rejected.push(e);
                }
            }
        }

        if always_write || !report.absorbed.is_empty() {
            ledger.save(&self.ledger_path)?;
            manifest.save(&self.manifest_path)?;
            report.ledger_written = true;
        }
        if let Err(e) = self.fx.flush() {
            warn!("Failed to update exchange-rate cache: {:#}", e);
        }

        report.ledger_rows = ledger.len();
        report.fx_provenance = self.fx.provenance().clone();
        info!(
            "Consolidation: {} absorbed, {} unchanged, {} rejected, {} ledger rows",
            report.absorbed.len(),
            report.unchanged.len(),
            report.rejected.len(),
            report.ledger_rows
        );
        Ok(report)
    }

    /// Parse a file and stamp each trade with its exchange rate
    fn enrich(&mut self, state: &SourceFileState) -> Result<Vec<Trade>, LedgerError> {
        let parsed = parse_source_file(&state.path)?;
        parsed
            .into_iter()
            .map(|p| {
                let resolved = self.fx.rate(p.currency, p.date).ok_or_else(|| {
                    LedgerError::MissingExchangeRate {
                        file: state.name.clone(),
                        currency: p.currency.to_string(),
                        date: p.date,
                    }
                })?;
                Ok(p.into_trade(resolved.rate))
            })
            .collect()
    }
}

/// Source files in `dir`, sorted by name
pub fn discover_source_files(dir: &Path) -> Result<Vec<SourceFileState>> {
    if !dir.exists() {
        warn!("Sources directory {:?} does not exist", dir);
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(detect_source_file)
                .is_some()
        })
        .collect();
    paths.sort();
    paths.iter().map(|p| SourceFileState::inspect(p)).collect()
}
