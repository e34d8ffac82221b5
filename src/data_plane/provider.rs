//! Market-data provider capability interface. Mirrors the shape of
//! `BrokerService`: one trait per capability group, concrete structs behind
//! it, no subclass hierarchy.

use async_trait::async_trait;

use crate::domain::{Candle, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetClass {
    Equity,
    Forex,
    Crypto,
}

/// Heuristic asset-class classification from symbol shape alone (no
/// per-ticker metadata store exists yet): an underscore-separated symbol
/// like `EUR_USD` is forex, everything else is treated as equity.
pub fn asset_class_for(ticker: &str) -> AssetClass {
    if ticker.contains('_') {
        AssetClass::Forex
    } else {
        AssetClass::Equity
    }
}

#[derive(Debug, Clone)]
pub struct ProviderQuote {
    pub symbol: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
}

/// One external market-data source. `covers` tells the data plane's
/// provider-selection step which asset classes a given provider can serve.
/// Errors are plain `anyhow::Error` here; the orchestrator is what turns a
/// run of failures into a typed `DataPlaneError::ProviderExhausted` after
/// its retry budget is spent.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;
    fn covers(&self, asset_class: AssetClass) -> bool;

    async fn get_quote(&self, symbol: &str) -> anyhow::Result<ProviderQuote>;

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> anyhow::Result<Vec<Candle>>;
}
