// =============================================================================
// Market data gateway — quote/historical-bar access with provider fallback
// (SPEC_FULL.md §4.1 "Market data", §6 "Market data provider").
// =============================================================================
//
// The signal engine and executor never talk to a specific data vendor; they
// depend on the [`MarketDataGateway`] trait. The concrete gateway used in
// production is [`MultiProviderGateway`], which holds an ordered list of
// [`MarketDataProvider`]s and falls through to the next one whenever the
// current provider is unavailable or errors, caching the last provider that
// actually answered so the common case skips straight to it next call.
//
// =============================================================================

pub mod providers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

/// Which upstream vendor a [`Quote`] or bar set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Alpaca,
    Finnhub,
    Yahoo,
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alpaca => write!(f, "alpaca"),
            Self::Finnhub => write!(f, "finnhub"),
            Self::Yahoo => write!(f, "yahoo"),
        }
    }
}

/// A real-time (or last-close, if markets are shut) quote for one symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub current: f64,
    pub today_open: f64,
    pub prev_close: f64,
    pub is_realtime: bool,
    pub source: DataSource,
}

/// One day of OHLCV history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// What the signal engine and executor actually depend on. Implemented by
/// [`MultiProviderGateway`] in production and by a fixed-quote stub in tests.
#[async_trait]
pub trait MarketDataGateway: Send + Sync {
    async fn get_quote(&self, symbol: &str) -> Result<Quote>;

    /// Most recent `days` closed daily bars, oldest-first.
    async fn get_historical_bars(&self, symbol: &str, days: u32) -> Result<Vec<DailyBar>>;
}

/// One upstream vendor. `is_available` is a cheap, synchronous check (API key
/// present, last known outage not still in its cooldown); it gates whether
/// [`MultiProviderGateway`] even attempts the network call.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn source(&self) -> DataSource;
    fn is_available(&self) -> bool;
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote>;
    async fn fetch_historical_bars(&self, symbol: &str, days: u32) -> Result<Vec<DailyBar>>;
}

/// Ordered provider list with automatic fallthrough and last-good-provider
/// caching. Grounded on `original_source/src/data_providers.py`'s
/// `MarketDataManager`, which tries providers in priority order and
/// remembers whichever one last answered successfully.
pub struct MultiProviderGateway {
    providers: Vec<Arc<dyn MarketDataProvider>>,
    last_good: AtomicUsize,
}

const NO_LAST_GOOD: usize = usize::MAX;

impl MultiProviderGateway {
    pub fn new(providers: Vec<Arc<dyn MarketDataProvider>>) -> Self {
        Self {
            providers,
            last_good: AtomicUsize::new(NO_LAST_GOOD),
        }
    }

    /// Try providers starting from the cached last-good index (if any),
    /// wrapping around the full list, skipping any that report themselves
    /// unavailable. Returns the first success, remembering its index.
    async fn try_each<T, F, Fut>(&self, op_name: &str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn MarketDataProvider>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if self.providers.is_empty() {
            return Err(anyhow!("no market data providers configured"));
        }

        let start = match self.last_good.load(Ordering::Relaxed) {
            NO_LAST_GOOD => 0,
            idx if idx < self.providers.len() => idx,
            _ => 0,
        };

        let n = self.providers.len();
        let mut last_err = None;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let provider = &self.providers[idx];
            if !provider.is_available() {
                continue;
            }
            match call(provider.clone()).await {
                Ok(value) => {
                    self.last_good.store(idx, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(e) => {
                    warn!(provider = %provider.source(), op = op_name, error = %e, "provider call failed, falling through");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("all market data providers unavailable")))
    }
}

#[async_trait]
impl MarketDataGateway for MultiProviderGateway {
    #[instrument(skip(self), name = "market_data::get_quote")]
    async fn get_quote(&self, symbol: &str) -> Result<Quote> {
        let symbol = symbol.to_string();
        self.try_each("get_quote", move |p| {
            let symbol = symbol.clone();
            async move { p.fetch_quote(&symbol).await }
        })
        .await
    }

    #[instrument(skip(self), name = "market_data::get_historical_bars")]
    async fn get_historical_bars(&self, symbol: &str, days: u32) -> Result<Vec<DailyBar>> {
        let symbol = symbol.to_string();
        self.try_each("get_historical_bars", move |p| {
            let symbol = symbol.clone();
            async move { p.fetch_historical_bars(&symbol, days).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FlakyProvider {
        source: DataSource,
        available: bool,
        calls: AtomicU32,
        fail_first_n: u32,
    }

    #[async_trait]
    impl MarketDataProvider for FlakyProvider {
        fn source(&self) -> DataSource {
            self.source
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn fetch_quote(&self, _symbol: &str) -> Result<Quote> {
            let n = self.calls.fetch_add(1, Ordering::Relaxed);
            if n < self.fail_first_n {
                return Err(anyhow!("simulated outage"));
            }
            Ok(Quote {
                current: 101.0,
                today_open: 100.0,
                prev_close: 99.0,
                is_realtime: true,
                source: self.source,
            })
        }

        async fn fetch_historical_bars(&self, _symbol: &str, _days: u32) -> Result<Vec<DailyBar>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn falls_through_to_second_provider_when_first_errors() {
        let first = Arc::new(FlakyProvider {
            source: DataSource::Alpaca,
            available: true,
            calls: AtomicU32::new(0),
            fail_first_n: u32::MAX,
        });
        let second = Arc::new(FlakyProvider {
            source: DataSource::Finnhub,
            available: true,
            calls: AtomicU32::new(0),
            fail_first_n: 0,
        });
        let gw = MultiProviderGateway::new(vec![first, second]);

        let quote = gw.get_quote("IBIT").await.unwrap();
        assert_eq!(quote.source, DataSource::Finnhub);
    }

    #[tokio::test]
    async fn unavailable_provider_is_skipped_without_a_network_call() {
        let unavailable = Arc::new(FlakyProvider {
            source: DataSource::Alpaca,
            available: false,
            calls: AtomicU32::new(0),
            fail_first_n: 0,
        });
        let healthy = Arc::new(FlakyProvider {
            source: DataSource::Yahoo,
            available: true,
            calls: AtomicU32::new(0),
            fail_first_n: 0,
        });
        let gw = MultiProviderGateway::new(vec![unavailable, healthy]);

        let quote = gw.get_quote("BITU").await.unwrap();
        assert_eq!(quote.source, DataSource::Yahoo);
    }

    #[tokio::test]
    async fn last_good_provider_is_tried_first_on_subsequent_calls() {
        let first = Arc::new(FlakyProvider {
            source: DataSource::Alpaca,
            available: true,
            calls: AtomicU32::new(0),
            fail_first_n: 1, // fails once, then succeeds
        });
        let second = Arc::new(FlakyProvider {
            source: DataSource::Finnhub,
            available: true,
            calls: AtomicU32::new(0),
            fail_first_n: 0,
        });
        let gw = MultiProviderGateway::new(vec![first, second]);

        let q1 = gw.get_quote("SBIT").await.unwrap();
        assert_eq!(q1.source, DataSource::Finnhub); // first call: alpaca fails, falls to finnhub

        // last_good now points at finnhub (index 1); a second call should not
        // need to touch alpaca at all.
        let q2 = gw.get_quote("SBIT").await.unwrap();
        assert_eq!(q2.source, DataSource::Finnhub);
    }

    #[tokio::test]
    async fn all_providers_failing_returns_error() {
        let first = Arc::new(FlakyProvider {
            source: DataSource::Alpaca,
            available: true,
            calls: AtomicU32::new(0),
            fail_first_n: u32::MAX,
        });
        let second = Arc::new(FlakyProvider {
            source: DataSource::Finnhub,
            available: true,
            calls: AtomicU32::new(0),
            fail_first_n: u32::MAX,
        });
        let gw = MultiProviderGateway::new(vec![first, second]);

        assert!(gw.get_quote("IBIT").await.is_err());
    }
}
