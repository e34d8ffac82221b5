//! Third stage: turns the multi-timeframe bias map into one directional
//! call with an ATR-based entry/stop/target, or `Hold` when biases don't
//! agree across a majority of timeframes.

use async_trait::async_trait;

use crate::data_plane::indicators;
use crate::domain::pipeline_state::{StrategyAction, StrategyDecision};
use crate::domain::{Bias, PipelineState};
use crate::error::AgentError;

use super::Agent;

const MAJORITY_THRESHOLD: f64 = 0.6;
const STOP_ATR_MULT: f64 = 1.5;
const TARGET_ATR_MULT: f64 = 3.0;
const ATR_PERIOD: usize = 14;
const FALLBACK_ATR_FRACTION: f64 = 0.01;

#[derive(Default)]
pub struct StrategyAgent;

impl StrategyAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Agent for StrategyAgent {
    fn agent_type(&self) -> &'static str {
        "strategy_agent"
    }

    async fn process(&self, state: &mut PipelineState) -> Result<(), AgentError> {
        let market_data = state.market_data.as_ref().ok_or_else(|| {
            AgentError::InsufficientData("strategy_agent requires market data".into())
        })?;
        if state.biases.is_empty() {
            return Err(AgentError::InsufficientData(
                "strategy_agent requires a bias assessment".into(),
            ));
        }

        let total = state.biases.len();
        let bullish = state.biases.values().filter(|b| b.bias == Bias::Bullish).count();
        let bearish = state.biases.values().filter(|b| b.bias == Bias::Bearish).count();

        let action = if bullish as f64 / total as f64 >= MAJORITY_THRESHOLD {
            StrategyAction::Buy
        } else if bearish as f64 / total as f64 >= MAJORITY_THRESHOLD {
            StrategyAction::Sell
        } else {
            StrategyAction::Hold
        };

        let confidence = state.biases.values().map(|b| b.confidence).fold(0.0, f64::max);

        let decision = if action == StrategyAction::Hold {
            StrategyDecision {
                action,
                entry_price: None,
                stop_loss: None,
                take_profit: None,
                confidence,
                reasoning: format!(
                    "{bullish} bullish vs {bearish} bearish across {total} timeframes, no majority"
                ),
            }
        } else {
            let atr_candles = market_data
                .candles
                .values()
                .max_by_key(|c| c.len())
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let atr = indicators::atr(atr_candles, ATR_PERIOD)
                .last()
                .copied()
                .unwrap_or(market_data.current_price * FALLBACK_ATR_FRACTION);

            let entry = market_data.current_price;
            let (stop_loss, take_profit) = match action {
                StrategyAction::Buy => (entry - atr * STOP_ATR_MULT, entry + atr * TARGET_ATR_MULT),
                StrategyAction::Sell => (entry + atr * STOP_ATR_MULT, entry - atr * TARGET_ATR_MULT),
                StrategyAction::Hold | StrategyAction::Close => unreachable!("handled above"),
            };

            StrategyDecision {
                action,
                entry_price: Some(entry),
                stop_loss: Some(stop_loss),
                take_profit: Some(take_profit),
                confidence,
                reasoning: format!("{bullish}/{total} timeframes agree, ATR-based bracket"),
            }
        };

        state.log(format!("strategy_agent: action={:?}", decision.action));
        state.strategy = Some(decision);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pipeline_state::{BiasAssessment, MarketDataSnapshot};
    use crate::domain::{Candle, Mode, Timeframe};
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn state_with_bias(bias: Bias) -> PipelineState {
        let mut state = PipelineState::new("AAPL".to_string(), Uuid::new_v4(), Mode::Paper);
        state.market_data = Some(MarketDataSnapshot {
            current_price: 150.0,
            bid: 149.9,
            ask: 150.1,
            candles: {
                let mut m = HashMap::new();
                m.insert(
                    Timeframe::H1,
                    (0..30)
                        .map(|i| Candle {
                            timestamp: Utc::now(),
                            open: 150.0,
                            high: 151.0 + i as f64 * 0.01,
                            low: 149.0,
                            close: 150.0,
                            volume: 1000.0,
                        })
                        .collect(),
                );
                m
            },
        });
        state.biases.insert(
            Timeframe::H1,
            BiasAssessment {
                bias,
                confidence: 80.0,
                reasoning: "test".to_string(),
            },
        );
        state
    }

    #[tokio::test]
    async fn bullish_bias_produces_buy_with_bracket() {
        let mut state = state_with_bias(Bias::Bullish);
        StrategyAgent::new().process(&mut state).await.unwrap();
        let decision = state.strategy.unwrap();
        assert_eq!(decision.action, StrategyAction::Buy);
        assert!(decision.stop_loss.unwrap() < decision.entry_price.unwrap());
        assert!(decision.take_profit.unwrap() > decision.entry_price.unwrap());
    }

    #[tokio::test]
    async fn neutral_bias_holds() {
        let mut state = state_with_bias(Bias::Neutral);
        StrategyAgent::new().process(&mut state).await.unwrap();
        assert_eq!(state.strategy.unwrap().action, StrategyAction::Hold);
    }
}
