//! Second stage: derives a directional bias per timeframe from a fast/slow
//! SMA spread. The agents' own reasoning is out of scope for this rewrite;
//! this deterministic stand-in keeps the same input/output contract
//! (`PipelineState::biases`) the strategy and risk stages depend on.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::data_plane::indicators;
use crate::domain::pipeline_state::BiasAssessment;
use crate::domain::{Bias, PipelineState};
use crate::error::AgentError;

use super::Agent;

const FAST_PERIOD: usize = 20;
const SLOW_PERIOD: usize = 50;
const NEUTRAL_BAND: f64 = 0.002;

#[derive(Default)]
pub struct BiasAgent;

impl BiasAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Agent for BiasAgent {
    fn agent_type(&self) -> &'static str {
        "bias_agent"
    }

    async fn process(&self, state: &mut PipelineState) -> Result<(), AgentError> {
        let market_data = state
            .market_data
            .as_ref()
            .ok_or_else(|| AgentError::InsufficientData("bias_agent requires market data".into()))?;

        let mut biases = HashMap::new();
        for (&timeframe, candles) in &market_data.candles {
            if candles.len() < SLOW_PERIOD {
                continue;
            }
            let fast = indicators::sma(candles, FAST_PERIOD);
            let slow = indicators::sma(candles, SLOW_PERIOD);
            let (Some(&last_fast), Some(&last_slow)) = (fast.last(), slow.last()) else {
                continue;
            };
            let spread = (last_fast - last_slow) / last_slow.abs().max(1e-9);
            let bias = if spread > NEUTRAL_BAND {
                Bias::Bullish
            } else if spread < -NEUTRAL_BAND {
                Bias::Bearish
            } else {
                Bias::Neutral
            };
            biases.insert(
                timeframe,
                BiasAssessment {
                    bias,
                    confidence: (spread.abs() * 1000.0).min(100.0),
                    reasoning: format!(
                        "{FAST_PERIOD}-period SMA {last_fast:.4} vs {SLOW_PERIOD}-period SMA {last_slow:.4}"
                    ),
                },
            );
        }

        if biases.is_empty() {
            return Err(AgentError::InsufficientData(
                "not enough candles on any timeframe to assess bias".into(),
            ));
        }

        state.log(format!("bias_agent: assessed {} timeframes", biases.len()));
        state.biases = biases;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pipeline_state::MarketDataSnapshot;
    use crate::domain::{Candle, Mode, Timeframe};
    use chrono::Utc;
    use uuid::Uuid;

    fn rising_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                timestamp: Utc::now(),
                open: 100.0 + i as f64,
                high: 101.0 + i as f64,
                low: 99.0 + i as f64,
                close: 100.0 + i as f64,
                volume: 1000.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn rising_prices_yield_bullish_bias() {
        let mut state = PipelineState::new("AAPL".to_string(), Uuid::new_v4(), Mode::Paper);
        let mut candles = HashMap::new();
        candles.insert(Timeframe::H1, rising_candles(60));
        state.market_data = Some(MarketDataSnapshot {
            current_price: 160.0,
            bid: 159.9,
            ask: 160.1,
            candles,
        });

        BiasAgent::new().process(&mut state).await.unwrap();
        assert_eq!(state.biases[&Timeframe::H1].bias, Bias::Bullish);
    }

    #[tokio::test]
    async fn fails_without_market_data() {
        let mut state = PipelineState::new("AAPL".to_string(), Uuid::new_v4(), Mode::Paper);
        let result = BiasAgent::new().process(&mut state).await;
        assert!(result.is_err());
    }
}
