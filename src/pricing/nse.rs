use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{info, warn};

use super::{LiveQuote, QuoteSource};
use crate::error::SourceError;

const SOURCE_ID: &str = "nse";
const QUOTE_URL: &str = "https://www.nseindia.com/api/quote-equity";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NseQuoteResponse {
    info: Option<NseInfo>,
    price_info: Option<NsePriceInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NseInfo {
    company_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NsePriceInfo {
    last_price: Option<f64>,
    close: Option<f64>,
    previous_close: Option<f64>,
}

/// Secondary live source for exchange-traded bonds (NSE quote API)
pub struct NseBondSource {
    client: Client,
}

impl NseBondSource {
    pub fn new() -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
            )
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| SourceError::from_reqwest(SOURCE_ID, e))?;
        Ok(Self { client })
    }
}

fn quote_from_response(symbol: &str, data: NseQuoteResponse) -> Result<LiveQuote, SourceError> {
    let price_info = data.price_info.ok_or_else(|| SourceError::NotFound {
        source_id: SOURCE_ID.to_string(),
        symbol: symbol.to_string(),
    })?;

    // lastPrice is 0 outside trading hours for illiquid series
    let price = price_info
        .last_price
        .filter(|p| *p > 0.0)
        .or(price_info.close)
        .and_then(Decimal::from_f64)
        .ok_or_else(|| SourceError::NotFound {
            source_id: SOURCE_ID.to_string(),
            symbol: symbol.to_string(),
        })?;

    Ok(LiveQuote {
        price,
        previous_close: price_info.previous_close.and_then(Decimal::from_f64),
        display_name: data.info.and_then(|i| i.company_name),
    })
}

impl QuoteSource for NseBondSource {
    fn id(&self) -> &'static str {
        SOURCE_ID
    }

    fn fetch_quote(&self, symbol: &str) -> Result<LiveQuote, SourceError> {
        info!("Fetching {} (bond) from NSE", symbol);
        let response = self
            .client
            .get(format!("{}?symbol={}", QUOTE_URL, symbol))
            .header("Accept", "application/json, text/javascript, */*; q=0.01")
            .header("Accept-Language", "en-US,en;q=0.9")
            .send()
            .map_err(|e| SourceError::from_reqwest(SOURCE_ID, e))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(SourceError::RateLimited {
                    source_id: SOURCE_ID.to_string(),
                })
            }
            status if !status.is_success() => {
                return Err(SourceError::Http {
                    source_id: SOURCE_ID.to_string(),
                    message: format!("status {}", status),
                })
            }
            _ => {}
        }

        let data: NseQuoteResponse = response
            .json()
            .map_err(|e| SourceError::from_reqwest(SOURCE_ID, e))?;
        quote_from_response(symbol, data)
    }

    /// NSE exposes no history through this endpoint; the current price
    /// stands in for any past date.
    fn fetch_close_on(&self, symbol: &str, date: NaiveDate) -> Result<Decimal, SourceError> {
        warn!(
            "NSE has no historical quotes; using current {} price for {}",
            symbol, date
        );
        self.fetch_quote(symbol).map(|q| q.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_last_price_preferred() {
        let data: NseQuoteResponse = serde_json::from_str(
            r#"{"info":{"companyName":"GOI SGB 2031"},
                "priceInfo":{"lastPrice":6420.5,"close":6400,"previousClose":6390}}"#,
        )
        .unwrap();
        let quote = quote_from_response("SGBJUN31", data).unwrap();
        assert_eq!(quote.price, dec!(6420.5));
        assert_eq!(quote.previous_close, Some(dec!(6390)));
        assert_eq!(quote.display_name.as_deref(), Some("GOI SGB 2031"));
    }

    #[test]
    fn test_close_used_when_no_trades_today() {
        let data: NseQuoteResponse =
            serde_json::from_str(r#"{"priceInfo":{"lastPrice":0,"close":6400}}"#).unwrap();
        let quote = quote_from_response("SGBJUN31", data).unwrap();
        assert_eq!(quote.price, dec!(6400));
        assert_eq!(quote.display_name, None);
    }

    #[test]
    fn test_missing_price_info_is_not_found() {
        let data: NseQuoteResponse = serde_json::from_str(r#"{"info":{}}"#).unwrap();
        let err = quote_from_response("SGBJUN31", data).unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }
}
