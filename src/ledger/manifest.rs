//! Processed-file manifest
//!
//! Maps each absorbed source file name to its content fingerprint. A file is
//! re-absorbed only when its fingerprint changes.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileRecord {
    /// blake3 hex digest of the file bytes; empty for legacy entries
    pub fingerprint: String,
    pub rows: usize,
    /// Modification time when absorbed, `YYYY-MM-DD HH:MM:SS`
    pub modified: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    files: BTreeMap<String, SourceFileRecord>,
}

impl Manifest {
    pub fn get(&self, name: &str) -> Option<&SourceFileRecord> {
        self.files.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, record: SourceFileRecord) {
        self.files.insert(name.into(), record);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SourceFileRecord)> {
        self.files.iter()
    }

    /// Load the manifest. Legacy entries (a bare modification-time string or
    /// number) load with an empty fingerprint so the file is absorbed again
    /// once. An unparseable manifest is treated as empty: absorption replaces
    /// a file's rows, so re-reading every file cannot duplicate trades.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {:?}", path))?;

        let value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!("Manifest {:?} is not valid JSON ({}), reprocessing all files", path, e);
                return Ok(Self::default());
            }
        };

        let Value::Object(entries) = value else {
            warn!("Manifest {:?} is not a JSON object, reprocessing all files", path);
            return Ok(Self::default());
        };

        let files = entries
            .into_iter()
            .map(|(name, entry)| {
                let record = match entry {
                    Value::Object(_) => serde_json::from_value(entry.clone())
                        .unwrap_or_else(|_| legacy_record(&entry)),
                    other => legacy_record(&other),
                };
                (name, record)
            })
            .collect();

        Ok(Self { files })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.files)?;
        write_atomic(path, json.as_bytes())
    }
}

fn legacy_record(value: &Value) -> SourceFileRecord {
    let modified = match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("modified")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        other => other.to_string(),
    };
    SourceFileRecord {
        fingerprint: String::new(),
        rows: 0,
        modified,
    }
}

/// Current on-disk state of a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFileState {
    pub name: String,
    pub path: PathBuf,
    pub fingerprint: String,
    pub modified: String,
}

impl SourceFileState {
    pub fn inspect(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();

        Ok(Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            fingerprint: fingerprint(&bytes),
            modified,
        })
    }

    pub fn record(&self, rows: usize) -> SourceFileRecord {
        SourceFileRecord {
            fingerprint: self.fingerprint.clone(),
            rows,
            modified: self.modified.clone(),
        }
    }
}

pub fn fingerprint(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Files that are new or whose fingerprint differs from the manifest
pub fn pending<'a>(manifest: &Manifest, files: &'a [SourceFileState]) -> Vec<&'a SourceFileState> {
    files
        .iter()
        .filter(|f| match manifest.get(&f.name) {
            Some(record) if record.fingerprint == f.fingerprint => {
                debug!("{} unchanged", f.name);
                false
            }
            _ => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(name: &str, content: &str) -> SourceFileState {
        SourceFileState {
            name: name.to_string(),
            path: PathBuf::from(name),
            fingerprint: fingerprint(content.as_bytes()),
            modified: "2025-01-01 10:00:00".to_string(),
        }
    }

    #[test]
    fn test_pending_detects_new_and_changed_files() {
        let a = state("trades_a.csv", "a");
        let b = state("trades_b.csv", "b");
        let mut manifest = Manifest::default();
        manifest.insert("trades_a.csv", a.record(1));
        manifest.insert("trades_b.csv", state("trades_b.csv", "old").record(1));

        let c = state("trades_c.csv", "c");
        let files = vec![a, b, c];
        let names: Vec<&str> = pending(&manifest, &files).iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["trades_b.csv", "trades_c.csv"]);
    }

    #[test]
    fn test_touch_without_content_change_is_not_pending() {
        let original = state("trades.csv", "same bytes");
        let mut manifest = Manifest::default();
        manifest.insert("trades.csv", original.record(3));

        let mut touched = state("trades.csv", "same bytes");
        touched.modified = "2026-01-01 00:00:00".to_string();
        assert!(pending(&manifest, &[touched]).is_empty());
    }

    #[test]
    fn test_round_trip_is_sorted_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tradebook_processed_files.json");
        let mut manifest = Manifest::default();
        manifest.insert("trades_z.csv", state("trades_z.csv", "z").record(2));
        manifest.insert("SGBs.csv", state("SGBs.csv", "s").record(1));
        manifest.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.find("SGBs.csv").unwrap() < text.find("trades_z.csv").unwrap());
        assert_eq!(Manifest::load(&path).unwrap(), manifest);
    }

    #[test]
    fn test_legacy_entries_load_without_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{"trades.csv": "2024-05-01 09:00:00", "SGBs.csv": 1714550400.0}"#,
        )
        .unwrap();

        let manifest = Manifest::load(&path).unwrap();
        let record = manifest.get("trades.csv").unwrap();
        assert_eq!(record.fingerprint, "");
        assert_eq!(record.modified, "2024-05-01 09:00:00");
        assert!(manifest.get("SGBs.csv").is_some());

        let files = vec![state("trades.csv", "x")];
        assert_eq!(pending(&manifest, &files).len(), 1);
    }

    #[test]
    fn test_invalid_manifest_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Manifest::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_inspect_fingerprints_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trades.csv");
        std::fs::write(&path, "Date,Ticker\n").unwrap();
        let inspected = SourceFileState::inspect(&path).unwrap();
        assert_eq!(inspected.name, "trades.csv");
        assert_eq!(inspected.fingerprint, fingerprint(b"Date,Ticker\n"));
        assert_eq!(inspected.fingerprint.len(), 64);
    }
}
