//! Market data subsystem: provider abstraction, KV cache, time-series store,
//! indicator math, ticker universe tracking, and the prefetch task that
//! keeps the universe warm.

pub mod cache;
pub mod indicators;
pub mod prefetch;
pub mod provider;
pub mod providers;
pub mod timeseries;
pub mod universe;

pub use cache::{FakeCache, MarketCache, RedisCache};
pub use prefetch::PrefetchTask;
pub use provider::{asset_class_for, AssetClass, Provider, ProviderQuote};
pub use timeseries::TimeseriesStore;
pub use universe::UniverseRefresher;

use std::sync::Arc;

use crate::error::DataPlaneError;
use crate::store::OltpStore;

/// Orchestrates provider selection with bounded retry, then falls back to
/// the time-series store's last cached bars if every provider is
/// exhausted. Owns no background tasks itself — `PrefetchTask` and
/// `UniverseRefresher` are spawned by the binary's data-plane role.
pub struct DataPlane {
    pub timeseries: Arc<TimeseriesStore>,
    pub cache: Arc<dyn MarketCache>,
    pub store: Arc<OltpStore>,
    providers: Vec<Arc<dyn Provider>>,
    max_attempts: u32,
}

impl DataPlane {
    pub fn new(
        timeseries: Arc<TimeseriesStore>,
        cache: Arc<dyn MarketCache>,
        store: Arc<OltpStore>,
        providers: Vec<Arc<dyn Provider>>,
    ) -> Self {
        Self {
            timeseries,
            cache,
            store,
            providers,
            max_attempts: 3,
        }
    }

    fn providers_for(&self, asset_class: AssetClass) -> Vec<&Arc<dyn Provider>> {
        self.providers.iter().filter(|p| p.covers(asset_class)).collect()
    }

    /// Cache-first quote lookup with exponential-backoff retry across every
    /// provider covering `asset_class`; returns `ProviderExhausted` only
    /// after every provider has failed `max_attempts` times each.
    pub async fn get_quote(
        &self,
        ticker: &str,
        asset_class: AssetClass,
    ) -> Result<ProviderQuote, DataPlaneError> {
        if let Some(quote) = self.cache.get_quote(ticker).await? {
            return Ok(quote);
        }
        let candidates = self.providers_for(asset_class);
        if candidates.is_empty() {
            return Err(DataPlaneError::NoProviderForAssetClass(format!(
                "{asset_class:?}"
            )));
        }
        let mut last_err = None;
        for provider in &candidates {
            for attempt in 1..=self.max_attempts {
                match provider.get_quote(ticker).await {
                    Ok(quote) => {
                        let _ = self.cache.set_quote(ticker, &quote).await;
                        return Ok(quote);
                    }
                    Err(e) => {
                        last_err = Some((provider.name().to_string(), attempt, e));
                        tokio::time::sleep(std::time::Duration::from_millis(
                            200 * 2u64.pow(attempt - 1),
                        ))
                        .await;
                    }
                }
            }
        }
        let (provider, attempts, source) = last_err.unwrap();
        Err(DataPlaneError::ProviderExhausted {
            provider,
            attempts,
            source,
        })
    }

    /// Cache/time-series-first candle lookup with the same retry discipline
    /// as `get_quote`.
    pub async fn get_candles(
        &self,
        ticker: &str,
        asset_class: AssetClass,
        timeframe: crate::domain::Timeframe,
        count: usize,
    ) -> Result<Vec<crate::domain::Candle>, DataPlaneError> {
        if let Some(cached) = self.cache.get_candles(timeframe, ticker).await? {
            if cached.len() >= count {
                return Ok(cached);
            }
        }
        if let Ok(stored) = self.timeseries.recent_candles(ticker, timeframe, count) {
            if stored.len() >= count {
                return Ok(stored);
            }
        }

        let candidates = self.providers_for(asset_class);
        if candidates.is_empty() {
            return Err(DataPlaneError::NoProviderForAssetClass(format!(
                "{asset_class:?}"
            )));
        }
        let mut last_err = None;
        for provider in &candidates {
            for attempt in 1..=self.max_attempts {
                match provider.get_candles(ticker, timeframe, count).await {
                    Ok(candles) => {
                        let _ = self.cache.set_candles(timeframe, ticker, &candles).await;
                        return Ok(candles);
                    }
                    Err(e) => {
                        last_err = Some((provider.name().to_string(), attempt, e));
                        tokio::time::sleep(std::time::Duration::from_millis(
                            200 * 2u64.pow(attempt - 1),
                        ))
                        .await;
                    }
                }
            }
        }
        let (provider, attempts, source) = last_err.unwrap();
        Err(DataPlaneError::ProviderExhausted {
            provider,
            attempts,
            source,
        })
    }
}
