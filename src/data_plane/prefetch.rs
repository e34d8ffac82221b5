//! Periodic candle prefetch. Runs once a minute, pulling up to 500 recent
//! 1-minute bars per tracked ticker into `ohlcv_1m`, then refreshing the
//! materialized timeframes. A separate daily pass backfills 400 adjusted
//! daily bars so a freshly-added ticker doesn't start with an empty daily
//! series.

use std::sync::Arc;
use tracing::{info, warn};

use crate::data_plane::cache::MarketCache;
use crate::data_plane::provider::{asset_class_for, Provider};
use crate::data_plane::timeseries::TimeseriesStore;
use crate::domain::Timeframe;

const MINUTE_BACKFILL_COUNT: usize = 500;
const DAILY_BACKFILL_COUNT: usize = 400;

pub struct PrefetchTask {
    timeseries: Arc<TimeseriesStore>,
    cache: Arc<dyn MarketCache>,
    providers: Vec<Arc<dyn Provider>>,
}

impl PrefetchTask {
    pub fn new(
        timeseries: Arc<TimeseriesStore>,
        cache: Arc<dyn MarketCache>,
        providers: Vec<Arc<dyn Provider>>,
    ) -> Self {
        Self {
            timeseries,
            cache,
            providers,
        }
    }

    fn provider_for(&self, ticker: &str) -> Option<&Arc<dyn Provider>> {
        let class = asset_class_for(ticker);
        self.providers.iter().find(|p| p.covers(class))
    }

    async fn tracked_tickers(&self) -> anyhow::Result<Vec<String>> {
        let mut tickers = self.cache.hot_tickers().await?;
        tickers.extend(self.cache.warm_tickers().await?);
        tickers.sort();
        tickers.dedup();
        Ok(tickers)
    }

    /// One minute-bar prefetch cycle across every tracked ticker.
    pub async fn run_minute_cycle(&self) -> anyhow::Result<()> {
        let tickers = self.tracked_tickers().await?;
        for ticker in &tickers {
            let Some(provider) = self.provider_for(ticker) else {
                warn!(ticker, "no provider covers this ticker's asset class");
                continue;
            };
            match provider.get_candles(ticker, Timeframe::M1, MINUTE_BACKFILL_COUNT).await {
                Ok(candles) => {
                    let inserted = self.timeseries.upsert_1m(ticker, &candles)?;
                    if inserted > 0 {
                        self.timeseries.refresh_continuous_aggregates(ticker)?;
                    }
                }
                Err(e) => warn!(ticker, error = %e, "minute candle prefetch failed"),
            }
        }
        info!(tickers = tickers.len(), "completed minute prefetch cycle");
        Ok(())
    }

    /// Daily end-of-day backfill, run once per trading day after close.
    pub async fn run_daily_backfill(&self) -> anyhow::Result<()> {
        let tickers = self.tracked_tickers().await?;
        for ticker in &tickers {
            let Some(provider) = self.provider_for(ticker) else {
                continue;
            };
            match provider
                .get_candles(ticker, Timeframe::D, DAILY_BACKFILL_COUNT)
                .await
            {
                Ok(candles) => {
                    self.timeseries.upsert_direct(ticker, Timeframe::D, &candles)?;
                }
                Err(e) => warn!(ticker, error = %e, "daily backfill failed"),
            }
        }
        Ok(())
    }
}
