//! First-call preconditions and order placement (spec section 4.5.1).

use chrono::Utc;

use crate::broker::{OrderSide, OrderType, TimeInForce};
use crate::data_plane::asset_class_for;
use crate::domain::pipeline_state::{StrategyAction, TradeExecution};
use crate::domain::PipelineState;
use crate::error::{AgentError, BrokerError};
use crate::market_hours::MarketHoursChecker;

use super::TradeManagerAgent;

fn short_circuit(state: &mut PipelineState, status: &str, reason: &str) {
    state.trade_execution = Some(TradeExecution {
        status: Some(status.to_string()),
        ..Default::default()
    });
    state.should_complete = true;
    state.log(format!("trade_manager_agent: {reason}"));
}

impl TradeManagerAgent {
    pub(crate) async fn execute(&self, state: &mut PipelineState) -> Result<(), AgentError> {
        // Precondition 1: exactly one broker tool configured.
        if state.broker_tool_count > 1 {
            return Err(AgentError::AgentProcessing(BrokerError::MultipleBrokersConfigured.to_string()));
        }

        // Precondition 2: risk assessment present.
        let Some(risk) = state.risk_assessment.clone() else {
            short_circuit(state, "skipped", "no risk assessment, skipping");
            return Ok(());
        };

        // Precondition 3: market open for this symbol's asset class.
        let asset_class = asset_class_for(&state.symbol);
        if !MarketHoursChecker::is_open(asset_class, Utc::now()) {
            short_circuit(state, "skipped", "market closed, skipping");
            return Ok(());
        }

        let Some(strategy) = state.strategy.clone() else {
            return Err(AgentError::AgentProcessing(
                "trade_manager_agent requires a strategy decision".into(),
            ));
        };

        // Precondition 4: approved and actionable.
        if strategy.action == StrategyAction::Hold {
            short_circuit(state, "no_action", "strategy is HOLD, nothing to execute");
            return Ok(());
        }
        if !risk.approved {
            short_circuit(state, "rejected", "risk manager did not approve this trade");
            return Ok(());
        }

        // Precondition 5: broker-side duplicate check, fail-closed on error.
        let duplicate = match self.broker.has_active_symbol(&state.symbol).await {
            Ok(active) => active,
            Err(e) => {
                state.log(format!(
                    "trade_manager_agent: has_active_symbol failed ({e}), treating as duplicate"
                ));
                true
            }
        };
        if duplicate {
            short_circuit(state, "skipped", "duplicate position at broker, skipping");
            return Ok(());
        }

        let side = match strategy.action {
            StrategyAction::Buy => OrderSide::Buy,
            StrategyAction::Sell => OrderSide::Sell,
            StrategyAction::Hold | StrategyAction::Close => {
                unreachable!("HOLD handled above, CLOSE never produced by strategy_agent")
            }
        };

        let qty = risk.position_size;
        if !(qty > 0.0) {
            short_circuit(state, "skipped", "position size rounded to zero, skipping");
            return Ok(());
        }

        let has_bracket = strategy.take_profit.is_some() && strategy.stop_loss.is_some();

        // Critical ordering: flip to monitoring before the broker call so a
        // worker crash between the state write and the response leaves the
        // execution recoverable by the monitoring loop instead of orphaned.
        state.execution_phase = "monitoring".to_string();
        state.monitor_interval_minutes = 0.25;

        let mut trade_execution = TradeExecution {
            order_type: Some(if has_bracket { "limit_bracket" } else { "market" }.to_string()),
            submitted_at: Some(Utc::now()),
            ..Default::default()
        };

        let order_result = if has_bracket {
            self.broker
                .place_limit_bracket_order(
                    &state.symbol,
                    qty,
                    side,
                    strategy.entry_price.unwrap_or_default(),
                    strategy.take_profit.unwrap(),
                    strategy.stop_loss.unwrap(),
                    TimeInForce::Gtc,
                )
                .await
        } else {
            self.broker
                .place_order(&state.symbol, qty, side, OrderType::Market, None, None, TimeInForce::Day)
                .await
        };

        match order_result {
            Ok(order) => {
                trade_execution.order_id = Some(order.order_id.clone());
                if let Some(trade_id) = order.broker_data.get("trade_id").and_then(|v| v.as_str()) {
                    trade_execution.trade_id = Some(trade_id.to_string());
                }
                trade_execution.status = Some(order_status_label(order.status));
                trade_execution.filled_price = order.filled_price.or(strategy.entry_price);
                trade_execution.filled_quantity =
                    Some(if order.filled_qty > 0.0 { order.filled_qty } else { qty });
                trade_execution.broker_response = order.broker_data;
                state.log(format!("trade_manager_agent: placed {} order {}", trade_execution.order_type.as_deref().unwrap_or("?"), order.order_id));
            }
            Err(e) => {
                trade_execution.status = Some("error".to_string());
                trade_execution.last_api_error = Some(e.to_string());
                trade_execution.api_error_count = 1;
                state.log(format!(
                    "trade_manager_agent: broker call failed after phase transition, monitoring loop will reconcile: {e}"
                ));
            }
        }

        state.trade_execution = Some(trade_execution);

        if self.notify_on_trade_executed {
            self.notifier
                .notify(
                    state.user_id,
                    &format!("{} order placed for {} x{qty:.4}", state.symbol, describe_side(side)),
                )
                .await;
        }

        Ok(())
    }
}

fn describe_side(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn order_status_label(status: crate::broker::OrderStatus) -> String {
    use crate::broker::OrderStatus;
    match status {
        OrderStatus::Pending => "pending",
        OrderStatus::Accepted => "accepted",
        OrderStatus::Open => "accepted",
        OrderStatus::Filled => "filled",
        OrderStatus::PartiallyFilled => "partially_filled",
        OrderStatus::Rejected => "rejected",
        OrderStatus::Cancelled => "cancelled",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use crate::domain::pipeline_state::{RiskAssessment, StrategyDecision};
    use crate::domain::Mode;
    use crate::notify::NullNotifier;
    use std::sync::Arc;
    use uuid::Uuid;

    fn agent() -> TradeManagerAgent {
        TradeManagerAgent::new(Arc::new(FakeBroker::default()), Arc::new(NullNotifier), true)
    }

    fn approved_state(symbol: &str) -> PipelineState {
        let mut state = PipelineState::new(symbol.to_string(), Uuid::new_v4(), Mode::Paper);
        state.strategy = Some(StrategyDecision {
            action: StrategyAction::Buy,
            entry_price: Some(100.0),
            stop_loss: Some(98.0),
            take_profit: Some(106.0),
            confidence: 80.0,
            reasoning: "test".into(),
        });
        state.risk_assessment = Some(RiskAssessment {
            approved: true,
            position_size: 10.0,
            risk_reward_ratio: 3.0,
            reasoning: "test".into(),
            warnings: Vec::new(),
        });
        state
    }

    #[tokio::test]
    async fn places_limit_bracket_and_transitions_to_monitoring() {
        let mut state = approved_state("AAPL");
        agent().execute(&mut state).await.unwrap();
        assert_eq!(state.execution_phase, "monitoring");
        assert_eq!(state.monitor_interval_minutes, 0.25);
        let trade = state.trade_execution.unwrap();
        assert!(trade.order_id.is_some());
        assert_eq!(trade.order_type.as_deref(), Some("limit_bracket"));
    }

    #[tokio::test]
    async fn hold_strategy_short_circuits_without_calling_broker() {
        let mut state = approved_state("AAPL");
        state.strategy.as_mut().unwrap().action = StrategyAction::Hold;
        agent().execute(&mut state).await.unwrap();
        assert!(state.should_complete);
        assert_eq!(state.trade_execution.unwrap().status.as_deref(), Some("no_action"));
    }

    #[tokio::test]
    async fn unapproved_risk_is_rejected() {
        let mut state = approved_state("AAPL");
        state.risk_assessment.as_mut().unwrap().approved = false;
        agent().execute(&mut state).await.unwrap();
        assert_eq!(state.trade_execution.unwrap().status.as_deref(), Some("rejected"));
    }

    #[tokio::test]
    async fn more_than_one_broker_tool_configured_fails_without_calling_broker() {
        let mut state = approved_state("AAPL");
        state.broker_tool_count = 2;
        let err = agent().execute(&mut state).await.unwrap_err();
        assert!(matches!(err, AgentError::AgentProcessing(_)));
        assert!(state.trade_execution.is_none());
    }
}
