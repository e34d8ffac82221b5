//! First stage: pulls a quote and a standard set of candle timeframes from
//! the data plane and populates `PipelineState::market_data`. Every later
//! agent reads from this snapshot rather than fetching independently.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::data_plane::{AssetClass, DataPlane};
use crate::domain::pipeline_state::MarketDataSnapshot;
use crate::domain::{PipelineState, Timeframe};
use crate::error::AgentError;

use super::Agent;

const TIMEFRAMES: &[Timeframe] = &[Timeframe::M5, Timeframe::H1, Timeframe::D];
const CANDLE_LOOKBACK: usize = 200;

pub struct MarketDataAgent {
    data_plane: Arc<DataPlane>,
    asset_class: AssetClass,
}

impl MarketDataAgent {
    pub fn new(data_plane: Arc<DataPlane>, asset_class: AssetClass) -> Self {
        Self {
            data_plane,
            asset_class,
        }
    }
}

#[async_trait]
impl Agent for MarketDataAgent {
    fn agent_type(&self) -> &'static str {
        "market_data_agent"
    }

    async fn process(&self, state: &mut PipelineState) -> Result<(), AgentError> {
        let quote = self
            .data_plane
            .get_quote(&state.symbol, self.asset_class)
            .await
            .map_err(|e| AgentError::InsufficientData(e.to_string()))?;

        let mut candles = HashMap::with_capacity(TIMEFRAMES.len());
        for &timeframe in TIMEFRAMES {
            let series = self
                .data_plane
                .get_candles(&state.symbol, self.asset_class, timeframe, CANDLE_LOOKBACK)
                .await
                .map_err(|e| AgentError::InsufficientData(e.to_string()))?;
            candles.insert(timeframe, series);
        }

        state.log(format!(
            "market_data_agent: fetched quote and {} timeframes for {}",
            TIMEFRAMES.len(),
            state.symbol
        ));
        state.market_data = Some(MarketDataSnapshot {
            current_price: quote.price,
            bid: quote.bid,
            ask: quote.ask,
            candles,
        });
        Ok(())
    }
}
