//! Hot/warm ticker universe: which symbols the prefetch task keeps warm in
//! the time-series store. Hot = referenced by an active signal-mode
//! pipeline's scanner (these need low-latency candles for detectors); warm =
//! referenced by an active periodic-mode pipeline (checked once per cycle,
//! latency matters less).

use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::data_plane::cache::MarketCache;
use crate::domain::TriggerMode;
use crate::store::OltpStore;

pub struct UniverseRefresher {
    store: Arc<OltpStore>,
    cache: Arc<dyn MarketCache>,
}

impl UniverseRefresher {
    pub fn new(store: Arc<OltpStore>, cache: Arc<dyn MarketCache>) -> Self {
        Self { store, cache }
    }

    pub async fn refresh(&self) -> anyhow::Result<()> {
        let pipelines = {
            let mut all = self.store.active_signal_pipelines()?;
            all.extend(self.store.due_periodic_pipelines(chrono::Utc::now())?);
            all
        };

        let mut hot = HashSet::new();
        let mut warm = HashSet::new();
        for pipeline in pipelines {
            let Some(scanner_id) = pipeline.scanner_id else {
                continue;
            };
            let Some(scanner) = self.store.get_scanner(scanner_id)? else {
                continue;
            };
            match pipeline.trigger_mode {
                TriggerMode::Signal => hot.extend(scanner.tickers.into_iter()),
                TriggerMode::Periodic => warm.extend(scanner.tickers.into_iter()),
            }
        }
        // A ticker needed hot takes priority over being merely warm.
        warm.retain(|t| !hot.contains(t));

        let hot: Vec<String> = hot.into_iter().collect();
        let warm: Vec<String> = warm.into_iter().collect();
        info!(hot = hot.len(), warm = warm.len(), "refreshed ticker universe");
        self.cache.set_hot_tickers(&hot).await?;
        self.cache.set_warm_tickers(&warm).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_plane::cache::FakeCache;
    use crate::domain::{Pipeline, Scanner};
    use uuid::Uuid;

    #[tokio::test]
    async fn signal_pipelines_populate_hot_set() {
        let store = Arc::new(OltpStore::in_memory().unwrap());
        let scanner = Scanner {
            scanner_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "test".to_string(),
            tickers: vec!["AAPL".to_string(), "MSFT".to_string()],
        };
        store.upsert_scanner(&scanner).unwrap();

        let mut pipeline = Pipeline::default();
        pipeline.trigger_mode = TriggerMode::Signal;
        pipeline.scanner_id = Some(scanner.scanner_id);
        pipeline.is_active = true;
        store.upsert_pipeline(&pipeline).unwrap();

        let cache = Arc::new(FakeCache::new());
        let refresher = UniverseRefresher::new(store, cache.clone());
        refresher.refresh().await.unwrap();

        let hot = cache.hot_tickers().await.unwrap();
        assert_eq!(hot.len(), 2);
    }
}
