//! Runtime configuration
//!
//! Loaded from `$TRADEBOOK_CONFIG` or `<config_home>/tradebook/config.toml`,
//! then overridden by environment variables. Every field has a default so a
//! missing file is not an error.

use anyhow::{Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::Currency;

const APP_DIR: &str = "tradebook";
const DEFAULT_USD_INR_FALLBACK: f64 = 90.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the ledger, manifest, caches and snapshots live
    pub data_dir: PathBuf,
    /// Directory scanned for trade source files
    pub sources_dir: PathBuf,
    pub reporting_currency: Currency,
    /// Last-resort rates keyed by currency code, in reporting units
    pub fallback_fx_rates: BTreeMap<String, f64>,
    pub retry: RetrySettings,
    pub first_snapshot_year: i32,
    /// Skip every network source and resolve from caches only
    pub offline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub rate_limit_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 500,
            rate_limit_delay_ms: 5000,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dir_spec::data_home()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(".tradebook"));
        let sources_dir = data_dir.join("sources");

        let mut fallback_fx_rates = BTreeMap::new();
        fallback_fx_rates.insert("USD".to_string(), DEFAULT_USD_INR_FALLBACK);

        Self {
            data_dir,
            sources_dir,
            reporting_currency: Currency::Inr,
            fallback_fx_rates,
            retry: RetrySettings::default(),
            first_snapshot_year: 2022,
            offline: false,
        }
    }
}

impl Config {
    /// Load the config file (if any) and apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                debug!("No config file at {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml_str(&text).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        Ok(config)
    }

    /// Apply `TRADEBOOK_*` overrides. The lookup is injected so tests do not
    /// have to mutate the process environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("TRADEBOOK_DATA_DIR").filter(|v| !v.is_empty()) {
            let data_dir = PathBuf::from(dir);
            if self.sources_dir == self.data_dir.join("sources") {
                self.sources_dir = data_dir.join("sources");
            }
            self.data_dir = data_dir;
        }
        if let Some(dir) = lookup("TRADEBOOK_SOURCES_DIR").filter(|v| !v.is_empty()) {
            self.sources_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("TRADEBOOK_OFFLINE") {
            self.offline = matches!(flag.trim(), "1" | "true" | "yes");
        }
        if let Some(rate) = lookup("FALLBACK_USD_INR_RATE") {
            match rate.trim().parse::<f64>() {
                Ok(value) if value > 0.0 => {
                    self.fallback_fx_rates.insert("USD".to_string(), value);
                }
                _ => warn!("Ignoring invalid FALLBACK_USD_INR_RATE '{}'", rate),
            }
        }
    }

    /// Configured last-resort rate for `currency`
    pub fn fallback_rate(&self, currency: Currency) -> Option<Decimal> {
        self.fallback_fx_rates
            .get(currency.code())
            .and_then(|v| Decimal::from_f64(*v))
    }

    pub fn fallback_rates(&self) -> BTreeMap<Currency, Decimal> {
        [Currency::Inr, Currency::Usd]
            .into_iter()
            .filter_map(|c| self.fallback_rate(c).map(|r| (c, r)))
            .collect()
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("tradebook.csv")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join("tradebook_processed_files.json")
    }

    pub fn price_cache_path(&self) -> PathBuf {
        self.data_dir.join("backup_prices.csv")
    }

    pub fn fx_cache_path(&self) -> PathBuf {
        self.data_dir.join("fx_rates.csv")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }
}

fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("TRADEBOOK_CONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dir_spec::config_home().map(|d| d.join(APP_DIR).join("config.toml"))
}
