//! Full rebuild: ledger from sources, then one snapshot per year end

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::error::SnapshotError;
use crate::ledger::{ConsolidationReport, Consolidator, Ledger};
use crate::pricing::PriceResolver;
use crate::snapshots::{write_snapshot, year_end_cutoff, SnapshotStore};

#[derive(Debug, Default)]
pub struct RebuildReport {
    pub consolidation: ConsolidationReport,
    pub removed_snapshots: usize,
    pub written: Vec<NaiveDate>,
    /// Year ends with no trades on or before them
    pub skipped: Vec<NaiveDate>,
    /// Year ends refused because replay failed
    pub refused: Vec<SnapshotError>,
}

/// Rebuild the ledger and regenerate year-end snapshots for
/// `first_year..=last_year`. Year-end prices are resolved historically when
/// a `pricer` is given.
pub fn rebuild_all(
    consolidator: &mut Consolidator,
    store: &dyn SnapshotStore,
    first_year: i32,
    last_year: i32,
    pricer: Option<&PriceResolver>,
) -> Result<RebuildReport> {
    let consolidation = consolidator.rebuild()?;
    let ledger = Ledger::load(consolidator.ledger_path())?;
    let removed_snapshots = store.clear()?;

    let mut report = RebuildReport {
        consolidation,
        removed_snapshots,
        ..Default::default()
    };

    for year in first_year..=last_year {
        let cutoff = year_end_cutoff(year)?;
        match write_snapshot(store, &ledger, cutoff, pricer) {
            Ok(Some(_)) => report.written.push(cutoff),
            Ok(None) => report.skipped.push(cutoff),
            Err(e) => match e.downcast::<SnapshotError>() {
                Ok(refusal @ SnapshotError::Integrity { .. }) => {
                    warn!("{}", refusal);
                    report.refused.push(refusal);
                }
                Ok(other) => return Err(other.into()),
                Err(e) => return Err(e),
            },
        }
    }

    info!(
        "Rebuild: {} ledger rows, {} snapshots written, {} refused",
        report.consolidation.ledger_rows,
        report.written.len(),
        report.refused.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fx::FxResolver;
    use crate::models::Currency;
    use crate::pricing::{MemoryPriceCache, RetryPolicy};
    use crate::snapshots::MemorySnapshotStore;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn consolidator(dir: &TempDir) -> Consolidator {
        let fx = FxResolver::new(
            Currency::Inr,
            Box::new(MemoryPriceCache::default()),
            BTreeMap::new(),
            RetryPolicy::once(),
        );
        Consolidator::new(
            dir.path().join("tradebook.csv"),
            dir.path().join("manifest.json"),
            dir.path().join("sources"),
            fx,
        )
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_rebuild_writes_year_end_snapshots() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sources")).unwrap();
        std::fs::write(
            dir.path().join("sources").join("trades.csv"),
            "Date,Ticker,Type,Qty,Price,Currency\n\
             2023-05-02,INFY,BUY,10,1400,INR\n\
             2024-02-01,INFY,SELL,4,1600,INR\n",
        )
        .unwrap();
        let store = MemorySnapshotStore::default();

        let report = rebuild_all(&mut consolidator(&dir), &store, 2022, 2024, None).unwrap();
        assert_eq!(report.consolidation.ledger_rows, 2);
        assert_eq!(report.skipped, vec![date(2022, 12, 31)]);
        assert_eq!(report.written, vec![date(2023, 12, 31), date(2024, 12, 31)]);
        assert_eq!(store.cutoffs().unwrap().len(), 2);

        // Running again replaces the old snapshots instead of colliding
        let again = rebuild_all(&mut consolidator(&dir), &store, 2022, 2024, None).unwrap();
        assert_eq!(again.removed_snapshots, 2);
        assert_eq!(again.written.len(), 2);
    }

    #[test]
    fn test_rebuild_refuses_oversold_years() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sources")).unwrap();
        std::fs::write(
            dir.path().join("sources").join("trades.csv"),
            "Date,Ticker,Type,Qty,Price,Currency\n2024-02-01,INFY,SELL,4,1600,INR\n",
        )
        .unwrap();
        let store = MemorySnapshotStore::default();

        let report = rebuild_all(&mut consolidator(&dir), &store, 2024, 2024, None).unwrap();
        assert!(report.written.is_empty());
        assert_eq!(report.refused.len(), 1);
    }
}
