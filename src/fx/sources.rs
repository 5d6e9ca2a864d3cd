use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;

use super::ExchangeRateSource;
use crate::error::SourceError;
use crate::models::Currency;
use crate::pricing::yahoo::YahooChartSource;
use crate::pricing::QuoteSource;

/// Dated rates from the Yahoo chart API (`USDINR=X`)
pub struct YahooFxSource {
    chart: YahooChartSource,
}

impl YahooFxSource {
    pub fn new() -> Result<Self, SourceError> {
        Ok(Self {
            chart: YahooChartSource::new()?,
        })
    }
}

impl ExchangeRateSource for YahooFxSource {
    fn id(&self) -> &'static str {
        "yahoo-fx"
    }

    fn rate_on(&self, from: Currency, to: Currency, date: NaiveDate) -> Result<Decimal, SourceError> {
        let symbol = format!("{}{}=X", from.code(), to.code());
        self.chart.fetch_close_on(&symbol, date)
    }
}

const ALTERNATE_ID: &str = "exchangerate-api";
const ALTERNATE_URL: &str = "https://api.exchangerate-api.com/v4/latest";

#[derive(Debug, Deserialize)]
struct LatestRates {
    rates: HashMap<String, f64>,
}

/// Undated "latest" rates from exchangerate-api.com. The requested date is
/// ignored; callers treat the result as today's rate.
pub struct ExchangeRateApiSource {
    client: Client,
}

impl ExchangeRateApiSource {
    pub fn new() -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| SourceError::from_reqwest(ALTERNATE_ID, e))?;
        Ok(Self { client })
    }
}

fn pick_rate(latest: &LatestRates, to: Currency) -> Result<Decimal, SourceError> {
    latest
        .rates
        .get(to.code())
        .copied()
        .and_then(Decimal::from_f64)
        .ok_or_else(|| SourceError::NotFound {
            source_id: ALTERNATE_ID.to_string(),
            symbol: to.code().to_string(),
        })
}

impl ExchangeRateSource for ExchangeRateApiSource {
    fn id(&self) -> &'static str {
        ALTERNATE_ID
    }

    fn rate_on(&self, from: Currency, to: Currency, _date: NaiveDate) -> Result<Decimal, SourceError> {
        info!("Fetching latest {}{} rate from exchangerate-api.com", from, to);
        let response = self
            .client
            .get(format!("{}/{}", ALTERNATE_URL, from.code()))
            .send()
            .map_err(|e| SourceError::from_reqwest(ALTERNATE_ID, e))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(SourceError::RateLimited {
                    source_id: ALTERNATE_ID.to_string(),
                })
            }
            status if !status.is_success() => {
                return Err(SourceError::Http {
                    source_id: ALTERNATE_ID.to_string(),
                    message: format!("status {}", status),
                })
            }
            _ => {}
        }

        let latest: LatestRates = response
            .json()
            .map_err(|e| SourceError::from_reqwest(ALTERNATE_ID, e))?;
        pick_rate(&latest, to)
    }
}
