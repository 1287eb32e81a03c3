// =============================================================================
// Concrete market-data providers: Alpaca, Finnhub, Yahoo (fallback).
// =============================================================================
//
// Grounded on `original_source/src/data_providers.py`'s `AlpacaProvider`,
// `FinnhubProvider` and `YahooProvider`. The E*TRADE quote source from the
// original is not reproduced here: this agent's E*TRADE client lives in
// `crate::broker`, and quotes from an authenticated broker session are
// fetched through `BrokerGateway::get_quote` rather than duplicated as a
// fourth `MarketDataProvider`.
//
// =============================================================================

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::instrument;

use super::{DailyBar, DataSource, MarketDataProvider, Quote};

/// Real-time quotes from Alpaca's market data API. Requires a key pair.
pub struct AlpacaProvider {
    client: Client,
    api_key: Option<String>,
    secret_key: Option<String>,
}

impl AlpacaProvider {
    const BASE_URL: &'static str = "https://data.alpaca.markets/v2";

    pub fn new(api_key: Option<String>, secret_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            secret_key,
        }
    }
}

#[async_trait]
impl MarketDataProvider for AlpacaProvider {
    fn source(&self) -> DataSource {
        DataSource::Alpaca
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some() && self.secret_key.is_some()
    }

    #[instrument(skip(self), name = "alpaca::fetch_quote")]
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote> {
        let (Some(key), Some(secret)) = (&self.api_key, &self.secret_key) else {
            bail!("alpaca provider not configured");
        };

        let url = format!("{}/stocks/{symbol}/snapshot", Self::BASE_URL);
        let resp = self
            .client
            .get(&url)
            .header("APCA-API-KEY-ID", key)
            .header("APCA-API-SECRET-KEY", secret)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .context("alpaca snapshot request failed")?
            .error_for_status()
            .context("alpaca snapshot returned error status")?;

        let data: Value = resp.json().await.context("alpaca snapshot body not JSON")?;

        let daily_bar = &data["dailyBar"];
        let prev_daily_bar = &data["prevDailyBar"];
        let latest_trade = &data["latestTrade"];

        let current = latest_trade["p"].as_f64().unwrap_or(0.0);
        let today_open = daily_bar["o"].as_f64().unwrap_or(0.0);
        let prev_close = prev_daily_bar["c"].as_f64().unwrap_or(0.0);

        Ok(Quote {
            current,
            today_open,
            prev_close,
            is_realtime: true,
            source: DataSource::Alpaca,
        })
    }

    #[instrument(skip(self), name = "alpaca::fetch_historical_bars")]
    async fn fetch_historical_bars(&self, symbol: &str, days: u32) -> Result<Vec<DailyBar>> {
        let (Some(key), Some(secret)) = (&self.api_key, &self.secret_key) else {
            bail!("alpaca provider not configured");
        };

        let end = Utc::now().date_naive();
        let start = end - Duration::days(days as i64 * 2); // pad for weekends/holidays

        let url = format!("{}/stocks/{symbol}/bars", Self::BASE_URL);
        let resp = self
            .client
            .get(&url)
            .header("APCA-API-KEY-ID", key)
            .header("APCA-API-SECRET-KEY", secret)
            .query(&[
                ("timeframe", "1Day"),
                ("start", &start.format("%Y-%m-%d").to_string()),
                ("end", &end.format("%Y-%m-%d").to_string()),
                ("limit", "10000"),
                ("feed", "iex"),
            ])
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .context("alpaca bars request failed")?
            .error_for_status()
            .context("alpaca bars returned error status")?;

        let data: Value = resp.json().await.context("alpaca bars body not JSON")?;
        let bars = data["bars"].as_array().cloned().unwrap_or_default();

        let mut out: Vec<DailyBar> = bars
            .iter()
            .filter_map(|b| {
                let date = b["t"].as_str()?.get(0..10)?;
                Some(DailyBar {
                    date: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?,
                    open: b["o"].as_f64()?,
                    high: b["h"].as_f64()?,
                    low: b["l"].as_f64()?,
                    close: b["c"].as_f64()?,
                    volume: b["v"].as_f64().unwrap_or(0.0),
                })
            })
            .collect();

        out.sort_by_key(|b| b.date);
        out.truncate_to_last(days as usize);
        Ok(out)
    }
}

/// Small helper: keep only the most recent `n` entries of an already
/// oldest-first-sorted `Vec`.
trait TruncateToLast {
    fn truncate_to_last(&mut self, n: usize);
}

impl<T> TruncateToLast for Vec<T> {
    fn truncate_to_last(&mut self, n: usize) {
        if self.len() > n {
            self.drain(0..self.len() - n);
        }
    }
}

/// Real-time quotes (a few seconds' delay on the free tier) from Finnhub.
pub struct FinnhubProvider {
    client: Client,
    api_key: Option<String>,
}

impl FinnhubProvider {
    const BASE_URL: &'static str = "https://finnhub.io/api/v1";

    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl MarketDataProvider for FinnhubProvider {
    fn source(&self) -> DataSource {
        DataSource::Finnhub
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    #[instrument(skip(self), name = "finnhub::fetch_quote")]
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote> {
        let Some(key) = &self.api_key else {
            bail!("finnhub provider not configured");
        };

        let url = format!("{}/quote", Self::BASE_URL);
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("token", key.as_str())])
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .context("finnhub quote request failed")?
            .error_for_status()
            .context("finnhub quote returned error status")?;

        let data: Value = resp.json().await.context("finnhub quote body not JSON")?;
        let current = data["c"].as_f64().unwrap_or(0.0);
        if current == 0.0 {
            bail!("finnhub returned no data for {symbol}");
        }

        Ok(Quote {
            current,
            today_open: data["o"].as_f64().unwrap_or(0.0),
            prev_close: data["pc"].as_f64().unwrap_or(0.0),
            is_realtime: true,
            source: DataSource::Finnhub,
        })
    }

    /// Finnhub's free tier has no bulk daily-bar endpoint worth depending on;
    /// this provider is quote-only and defers historical bars to the next
    /// provider in the fallback chain.
    async fn fetch_historical_bars(&self, _symbol: &str, _days: u32) -> Result<Vec<DailyBar>> {
        bail!("finnhub provider does not support historical bars")
    }
}

/// Delayed (15-minute) quotes and daily bars from Yahoo Finance's public
/// chart endpoint. No authentication required, so it is always the last
/// resort in the fallback chain.
pub struct YahooProvider {
    client: Client,
}

impl YahooProvider {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }
}

impl Default for YahooProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for YahooProvider {
    fn source(&self) -> DataSource {
        DataSource::Yahoo
    }

    fn is_available(&self) -> bool {
        true
    }

    #[instrument(skip(self), name = "yahoo::fetch_quote")]
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote> {
        let url = format!("https://query1.finance.yahoo.com/v8/finance/chart/{symbol}");
        let resp = self
            .client
            .get(&url)
            .query(&[("interval", "1m"), ("range", "1d")])
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .context("yahoo chart request failed")?
            .error_for_status()
            .context("yahoo chart returned error status")?;

        let data: Value = resp.json().await.context("yahoo chart body not JSON")?;
        let result = &data["chart"]["result"][0];
        let meta = &result["meta"];

        let current = meta["regularMarketPrice"]
            .as_f64()
            .context("yahoo response missing regularMarketPrice")?;
        let today_open = meta["regularMarketOpen"].as_f64().unwrap_or(current);
        let prev_close = meta["previousClose"].as_f64().unwrap_or(current);

        Ok(Quote {
            current,
            today_open,
            prev_close,
            is_realtime: false,
            source: DataSource::Yahoo,
        })
    }

    #[instrument(skip(self), name = "yahoo::fetch_historical_bars")]
    async fn fetch_historical_bars(&self, symbol: &str, days: u32) -> Result<Vec<DailyBar>> {
        let range = format!("{}d", (days * 2).max(5));
        let url = format!("https://query1.finance.yahoo.com/v8/finance/chart/{symbol}");
        let resp = self
            .client
            .get(&url)
            .query(&[("interval", "1d"), ("range", range.as_str())])
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await
            .context("yahoo chart request failed")?
            .error_for_status()
            .context("yahoo chart returned error status")?;

        let data: Value = resp.json().await.context("yahoo chart body not JSON")?;
        let result = &data["chart"]["result"][0];
        let timestamps = result["timestamp"].as_array().cloned().unwrap_or_default();
        let quote = &result["indicators"]["quote"][0];

        let opens = quote["open"].as_array().cloned().unwrap_or_default();
        let highs = quote["high"].as_array().cloned().unwrap_or_default();
        let lows = quote["low"].as_array().cloned().unwrap_or_default();
        let closes = quote["close"].as_array().cloned().unwrap_or_default();
        let volumes = quote["volume"].as_array().cloned().unwrap_or_default();

        let mut out = Vec::with_capacity(timestamps.len());
        for i in 0..timestamps.len() {
            let (Some(ts), Some(o), Some(h), Some(l), Some(c)) = (
                timestamps.get(i).and_then(Value::as_i64),
                opens.get(i).and_then(Value::as_f64),
                highs.get(i).and_then(Value::as_f64),
                lows.get(i).and_then(Value::as_f64),
                closes.get(i).and_then(Value::as_f64),
            ) else {
                continue; // Yahoo pads gaps with null; skip incomplete bars.
            };
            let v = volumes.get(i).and_then(Value::as_f64).unwrap_or(0.0);
            let date = chrono::DateTime::from_timestamp(ts, 0)
                .context("yahoo bar timestamp out of range")?
                .date_naive();
            out.push(DailyBar { date, open: o, high: h, low: l, close: c, volume: v });
        }

        out.sort_by_key(|b| b.date);
        out.truncate_to_last(days as usize);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpaca_unavailable_without_both_keys() {
        let p = AlpacaProvider::new(Some("key".to_string()), None);
        assert!(!p.is_available());
        let p2 = AlpacaProvider::new(Some("key".to_string()), Some("secret".to_string()));
        assert!(p2.is_available());
    }

    #[test]
    fn finnhub_unavailable_without_key() {
        let p = FinnhubProvider::new(None);
        assert!(!p.is_available());
    }

    #[test]
    fn yahoo_is_always_available() {
        let p = YahooProvider::new();
        assert!(p.is_available());
    }

    #[test]
    fn truncate_to_last_keeps_most_recent() {
        let mut v = vec![1, 2, 3, 4, 5];
        v.truncate_to_last(2);
        assert_eq!(v, vec![4, 5]);
    }
}
