use chrono::{Duration, NaiveDate};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use super::{LiveQuote, QuoteSource};
use crate::error::SourceError;

const SOURCE_ID: &str = "yahoo";
const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
/// Days searched either side of a historical date
const HISTORY_WINDOW_DAYS: i64 = 7;

/// Yahoo Finance chart response
#[derive(Debug, Deserialize)]
struct YahooChartResponse {
    chart: ChartData,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    result: Option<Vec<ChartResult>>,
    error: Option<YahooError>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: Meta,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    regular_market_price: Option<f64>,
    chart_previous_close: Option<f64>,
    previous_close: Option<f64>,
    long_name: Option<String>,
    short_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    close: Option<Vec<Option<f64>>>,
}

#[derive(Debug, Deserialize)]
struct YahooError {
    code: String,
    description: String,
}

/// Primary live source: Yahoo Finance chart API
pub struct YahooChartSource {
    client: Client,
    base_url: String,
}

impl YahooChartSource {
    pub fn new() -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (compatible; TradebookBot/1.0)")
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .map_err(|e| SourceError::from_reqwest(SOURCE_ID, e))?;
        Ok(Self {
            client,
            base_url: CHART_URL.to_string(),
        })
    }

    /// Fetch one chart result; `query` is appended to the symbol URL
    fn chart(&self, symbol: &str, query: &str) -> Result<ChartResult, SourceError> {
        let url = format!("{}/{}{}", self.base_url, symbol, query);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| SourceError::from_reqwest(SOURCE_ID, e))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(SourceError::RateLimited {
                    source_id: SOURCE_ID.to_string(),
                })
            }
            StatusCode::NOT_FOUND => {
                return Err(SourceError::NotFound {
                    source_id: SOURCE_ID.to_string(),
                    symbol: symbol.to_string(),
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

        let data: YahooChartResponse = response
            .json()
            .map_err(|e| SourceError::from_reqwest(SOURCE_ID, e))?;
        parse_chart(symbol, data)
    }
}

fn parse_chart(symbol: &str, data: YahooChartResponse) -> Result<ChartResult, SourceError> {
    if let Some(error) = data.chart.error {
        return Err(SourceError::NotFound {
            source_id: SOURCE_ID.to_string(),
            symbol: format!("{} ({}: {})", symbol, error.code, error.description),
        });
    }
    data.chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| SourceError::NotFound {
            source_id: SOURCE_ID.to_string(),
            symbol: symbol.to_string(),
        })
}

fn to_decimal(value: f64) -> Result<Decimal, SourceError> {
    Decimal::from_f64(value).ok_or_else(|| SourceError::Parse {
        source_id: SOURCE_ID.to_string(),
        message: format!("invalid price {}", value),
    })
}

fn closes(result: &ChartResult) -> Vec<Option<f64>> {
    result
        .indicators
        .quote
        .first()
        .and_then(|q| q.close.clone())
        .unwrap_or_default()
}

fn quote_from_chart(symbol: &str, result: &ChartResult) -> Result<LiveQuote, SourceError> {
    let price = result
        .meta
        .regular_market_price
        .or_else(|| closes(result).into_iter().flatten().last())
        .ok_or_else(|| SourceError::NotFound {
            source_id: SOURCE_ID.to_string(),
            symbol: symbol.to_string(),
        })?;

    // Second-to-last daily close when the meta block has no previous close
    let previous_close = result
        .meta
        .chart_previous_close
        .or(result.meta.previous_close)
        .or_else(|| {
            let valid: Vec<f64> = closes(result).into_iter().flatten().collect();
            valid.len().checked_sub(2).map(|i| valid[i])
        });

    Ok(LiveQuote {
        price: to_decimal(price)?,
        previous_close: previous_close.map(to_decimal).transpose()?,
        display_name: result
            .meta
            .long_name
            .clone()
            .or_else(|| result.meta.short_name.clone()),
    })
}

/// Latest close on or before `date`; falls back to the earliest close in
/// the window when every close is after it
pub(crate) fn close_on_or_before(
    timestamps: &[i64],
    closes: &[Option<f64>],
    date: NaiveDate,
) -> Option<f64> {
    let points: Vec<(NaiveDate, f64)> = timestamps
        .iter()
        .zip(closes)
        .filter_map(|(ts, close)| {
            let day = chrono::DateTime::from_timestamp(*ts, 0)?.date_naive();
            close.map(|c| (day, c))
        })
        .collect();

    points
        .iter()
        .filter(|(day, _)| *day <= date)
        .last()
        .or_else(|| points.first())
        .map(|(_, c)| *c)
}

impl QuoteSource for YahooChartSource {
    fn id(&self) -> &'static str {
        SOURCE_ID
    }

    fn fetch_quote(&self, symbol: &str) -> Result<LiveQuote, SourceError> {
        info!("Fetching current price for {} from Yahoo Finance", symbol);
        let result = self.chart(symbol, "?range=5d&interval=1d")?;
        quote_from_chart(symbol, &result)
    }

    fn fetch_close_on(&self, symbol: &str, date: NaiveDate) -> Result<Decimal, SourceError> {
        info!("Fetching {} close for {} from Yahoo Finance", date, symbol);
        let start = date - Duration::days(HISTORY_WINDOW_DAYS);
        let end = date + Duration::days(HISTORY_WINDOW_DAYS);
        let to_ts = |d: NaiveDate| d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp());
        let (Some(period1), Some(period2)) = (to_ts(start), to_ts(end)) else {
            return Err(SourceError::Unsupported {
                source_id: SOURCE_ID.to_string(),
                what: format!("date {}", date),
            });
        };

        let result = self.chart(
            symbol,
            &format!("?period1={}&period2={}&interval=1d", period1, period2),
        )?;
        let timestamps = result.timestamp.clone().unwrap_or_default();
        let close = close_on_or_before(&timestamps, &closes(&result), date).ok_or_else(|| {
            SourceError::NotFound {
                source_id: SOURCE_ID.to_string(),
                symbol: format!("{} on {}", symbol, date),
            }
        })?;
        to_decimal(close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ts(y: i32, m: u32, d: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(14, 30, 0)
            .unwrap()
            .and_utc()
            .timestamp()
    }

    #[test]
    fn test_parse_quote_with_meta_previous_close() {
        let data: YahooChartResponse = serde_json::from_str(
            r#"{"chart":{"result":[{"meta":{"regularMarketPrice":187.5,
                "chartPreviousClose":185.25,"longName":"Apple Inc."},
                "timestamp":[1],"indicators":{"quote":[{"close":[187.5]}]}}],"error":null}}"#,
        )
        .unwrap();
        let result = parse_chart("AAPL", data).unwrap();
        let quote = quote_from_chart("AAPL", &result).unwrap();
        assert_eq!(quote.price, dec!(187.5));
        assert_eq!(quote.previous_close, Some(dec!(185.25)));
        assert_eq!(quote.display_name.as_deref(), Some("Apple Inc."));
    }

    #[test]
    fn test_previous_close_from_series() {
        let data: YahooChartResponse = serde_json::from_str(
            r#"{"chart":{"result":[{"meta":{"regularMarketPrice":12.0,"shortName":"X"},
                "timestamp":[1,2,3],"indicators":{"quote":[{"close":[10.0,null,11.0]}]}}]}}"#,
        )
        .unwrap();
        let result = parse_chart("X", data).unwrap();
        let quote = quote_from_chart("X", &result).unwrap();
        assert_eq!(quote.previous_close, Some(dec!(10)));
        assert_eq!(quote.display_name.as_deref(), Some("X"));
    }

    #[test]
    fn test_chart_error_is_not_found() {
        let data: YahooChartResponse = serde_json::from_str(
            r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found"}}}"#,
        )
        .unwrap();
        let err = parse_chart("NOPE", data).unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }

    #[test]
    fn test_close_on_or_before_target() {
        let timestamps = [ts(2024, 12, 27), ts(2024, 12, 30), ts(2024, 12, 31), ts(2025, 1, 2)];
        let closes = [Some(250.0), Some(252.0), None, Some(243.0)];
        let target = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();

        // 31st has no close, so the 30th wins
        assert_eq!(close_on_or_before(&timestamps, &closes, target), Some(252.0));

        let early = NaiveDate::from_ymd_opt(2024, 12, 20).unwrap();
        assert_eq!(close_on_or_before(&timestamps, &closes, early), Some(250.0));
        assert_eq!(close_on_or_before(&[], &[], target), None);
    }
}
