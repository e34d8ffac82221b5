//! Fourth stage: sizes the position against account equity and approves or
//! rejects the strategy's call. Per the executor's critical-error rule
//! (spec 4.4 step 5), any failure from this agent type aborts the
//! execution regardless of the specific error — a sizing failure must
//! never be silently skipped.

use async_trait::async_trait;
use std::sync::Arc;

use crate::broker::BrokerService;
use crate::domain::pipeline_state::{RiskAssessment, StrategyAction};
use crate::domain::PipelineState;
use crate::error::AgentError;

use super::Agent;

const DEFAULT_MAX_RISK_PCT: f64 = 0.01;
const MIN_CONFIDENCE: f64 = 55.0;
const MIN_RISK_REWARD_RATIO: f64 = 1.0;

pub struct RiskManagerAgent {
    broker: Arc<dyn BrokerService>,
    max_risk_pct: f64,
}

impl RiskManagerAgent {
    pub fn new(broker: Arc<dyn BrokerService>) -> Self {
        Self {
            broker,
            max_risk_pct: DEFAULT_MAX_RISK_PCT,
        }
    }
}

fn skip(state: &mut PipelineState, reasoning: impl Into<String>, warnings: Vec<String>) {
    state.risk_assessment = Some(RiskAssessment {
        approved: false,
        position_size: 0.0,
        risk_reward_ratio: 0.0,
        reasoning: reasoning.into(),
        warnings,
    });
}

#[async_trait]
impl Agent for RiskManagerAgent {
    fn agent_type(&self) -> &'static str {
        "risk_manager_agent"
    }

    async fn process(&self, state: &mut PipelineState) -> Result<(), AgentError> {
        let strategy = state.strategy.clone().ok_or_else(|| {
            AgentError::AgentProcessing("risk_manager_agent requires a strategy decision".into())
        })?;

        if strategy.action == StrategyAction::Hold {
            skip(state, "strategy is HOLD, nothing to size", Vec::new());
            return Ok(());
        }

        if strategy.confidence < MIN_CONFIDENCE {
            skip(
                state,
                format!(
                    "confidence {:.1} below minimum {:.1}",
                    strategy.confidence, MIN_CONFIDENCE
                ),
                vec!["low_confidence".into()],
            );
            return Ok(());
        }

        let account = self
            .broker
            .get_account_info()
            .await
            .map_err(|e| AgentError::Other(format!("failed to read account equity: {e}")))?;

        let entry = strategy.entry_price.unwrap_or(account.portfolio_value);
        let stop = strategy.stop_loss.unwrap_or(entry);
        let target = strategy.take_profit.unwrap_or(entry);
        let risk_per_share = (entry - stop).abs().max(1e-9);
        let reward_per_share = (target - entry).abs();
        let risk_reward_ratio = reward_per_share / risk_per_share;

        let risk_budget = account.portfolio_value * self.max_risk_pct;
        let position_size = risk_budget / risk_per_share;

        let mut warnings = Vec::new();
        let approved = if risk_reward_ratio < MIN_RISK_REWARD_RATIO {
            warnings.push("risk_reward_below_minimum".into());
            false
        } else {
            true
        };

        state.log("risk_manager_agent: sizing complete");
        state.risk_assessment = Some(RiskAssessment {
            approved,
            position_size,
            risk_reward_ratio,
            reasoning: format!(
                "sized to {:.1}% of ${:.2} portfolio at {:.4} risk/share, r:r {:.2}",
                self.max_risk_pct * 100.0,
                account.portfolio_value,
                risk_per_share,
                risk_reward_ratio
            ),
            warnings,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use crate::domain::pipeline_state::StrategyDecision;
    use crate::domain::Mode;
    use uuid::Uuid;

    fn state_with_decision(action: StrategyAction, confidence: f64) -> PipelineState {
        let mut state = PipelineState::new("AAPL".to_string(), Uuid::new_v4(), Mode::Paper);
        state.strategy = Some(StrategyDecision {
            action,
            entry_price: Some(100.0),
            stop_loss: Some(98.0),
            take_profit: Some(106.0),
            confidence,
            reasoning: "test".into(),
        });
        state
    }

    #[tokio::test]
    async fn approves_a_well_formed_buy() {
        let broker = Arc::new(FakeBroker::default());
        let agent = RiskManagerAgent::new(broker);
        let mut state = state_with_decision(StrategyAction::Buy, 80.0);
        agent.process(&mut state).await.unwrap();
        let assessment = state.risk_assessment.unwrap();
        assert!(assessment.approved);
        assert!(assessment.position_size > 0.0);
    }

    #[tokio::test]
    async fn rejects_low_confidence_without_touching_broker() {
        let broker = Arc::new(FakeBroker::default());
        let agent = RiskManagerAgent::new(broker);
        let mut state = state_with_decision(StrategyAction::Buy, 10.0);
        agent.process(&mut state).await.unwrap();
        assert!(!state.risk_assessment.unwrap().approved);
    }
}
