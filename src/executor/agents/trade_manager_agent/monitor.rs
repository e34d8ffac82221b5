//! Subsequent-call position monitoring (spec section 4.5.2). Every branch
//! here is driven by what `trade_execution.{order_id,trade_id}` hold, never
//! by the execution's persisted status column — the monitoring task only
//! supplies the snapshot, this agent owns the state machine.

use chrono::{Duration, Utc};

use crate::broker::{Order, OrderSide, Position, TradeState};
use crate::domain::pipeline_state::{TradeExecution, TradeOutcome, TradeOutcomeStatus};
use crate::domain::PipelineState;
use crate::error::AgentError;

use super::{TradeManagerAgent, COMMUNICATION_ERROR_HARD_CEILING, COMMUNICATION_ERROR_THRESHOLD, GRACE_PERIOD_SECS};

/// Emergency-exit threshold standing in for the original's free-form,
/// LLM-evaluated conditions (VIX level, news windows, crash proxies) —
/// those inputs are out of scope here, so a hard drawdown floor is the
/// deterministic equivalent this agent can actually evaluate.
const EMERGENCY_EXIT_PNL_PERCENT: f64 = -10.0;

impl TradeManagerAgent {
    pub(crate) async fn monitor(&self, state: &mut PipelineState) -> Result<(), AgentError> {
        let Some(mut trade) = state.trade_execution.clone() else {
            return Err(AgentError::AgentProcessing(
                "monitor called without a trade_execution".into(),
            ));
        };

        if self.within_grace_period_and_unseen(state, &trade).await {
            state.log("trade_manager_agent: within grace period, broker hasn't caught up yet");
            state
                .agent_reports
                .push(serde_json::json!({"status": "pending_sync"}));
            state.trade_execution = Some(trade);
            return Ok(());
        }

        let result = if trade.order_id.is_some() && trade.trade_id.is_none() {
            self.monitor_pending_limit(state, &mut trade).await
        } else {
            self.resolve_filled_or_closed(state, &mut trade).await
        };

        if let Err(e) = result {
            self.handle_api_error(state, &mut trade, &e.to_string());
        }

        state.trade_execution = Some(trade);
        Ok(())
    }

    async fn within_grace_period_and_unseen(&self, state: &PipelineState, trade: &TradeExecution) -> bool {
        let Some(age) = trade.order_age(Utc::now()) else {
            return false;
        };
        if age >= Duration::seconds(GRACE_PERIOD_SECS) {
            return false;
        }
        let order_seen = match &trade.order_id {
            Some(order_id) => self
                .broker
                .get_orders()
                .await
                .map(|orders| orders.iter().any(|o| &o.order_id == order_id))
                .unwrap_or(false),
            None => false,
        };
        if order_seen {
            return false;
        }
        let has_position = self
            .broker
            .get_position(&state.symbol)
            .await
            .ok()
            .flatten()
            .is_some();
        !has_position
    }

    fn trade_brackets(&self, state: &PipelineState) -> (Option<f64>, Option<f64>) {
        match &state.strategy {
            Some(decision) => (decision.stop_loss, decision.take_profit),
            None => (None, None),
        }
    }

    async fn monitor_pending_limit(
        &self,
        state: &mut PipelineState,
        trade: &mut TradeExecution,
    ) -> Result<(), AgentError> {
        let order_id = trade.order_id.clone().expect("caller checked order_id is set");
        let orders = self
            .broker
            .get_orders()
            .await
            .map_err(|e| AgentError::Other(e.to_string()))?;
        let still_open: Option<&Order> = orders.iter().find(|o| o.order_id == order_id);

        let Some(order) = still_open else {
            return self.resolve_filled_or_closed(state, trade).await;
        };

        if let Some(age) = trade.order_age(Utc::now()) {
            if age > Duration::hours(self.max_pending_hours) {
                return self
                    .cancel_with_outcome(state, trade, &order_id, "stale order timeout")
                    .await;
            }
        }

        let side = order.side;
        let (stop_loss, take_profit) = self.trade_brackets(state);
        let (Some(sl), Some(tp)) = (stop_loss, take_profit) else {
            state
                .agent_reports
                .push(serde_json::json!({"status": "monitoring limit order", "order_id": order_id}));
            return Ok(());
        };

        if let Ok(quote) = self.broker.get_quote(&state.symbol).await {
            let mid = (quote.bid + quote.ask) / 2.0;
            let invalidated = match side {
                OrderSide::Buy => mid <= sl,
                OrderSide::Sell => mid >= sl,
            };
            let missed = match side {
                OrderSide::Buy => mid >= tp,
                OrderSide::Sell => mid <= tp,
            };
            if invalidated {
                return self
                    .cancel_with_outcome(state, trade, &order_id, "setup invalidated")
                    .await;
            }
            if missed {
                return self
                    .cancel_with_outcome(state, trade, &order_id, "missed opportunity")
                    .await;
            }
        }

        if let Ok(candles) = self.broker.get_recent_candles(&state.symbol, "1min", 5).await {
            let spiked = candles.iter().any(|c| match side {
                OrderSide::Buy => c.low <= sl || c.high >= tp,
                OrderSide::Sell => c.high >= sl || c.low <= tp,
            });
            if spiked {
                return self
                    .cancel_with_outcome(state, trade, &order_id, "price spike through bracket")
                    .await;
            }
        }

        trade.status = Some("pending".to_string());
        state
            .agent_reports
            .push(serde_json::json!({"status": "monitoring limit order", "order_id": order_id}));
        Ok(())
    }

    async fn cancel_with_outcome(
        &self,
        state: &mut PipelineState,
        trade: &mut TradeExecution,
        order_id: &str,
        reason: &str,
    ) -> Result<(), AgentError> {
        let _ = self.broker.cancel_order(order_id).await;
        trade.status = Some("cancelled".to_string());
        state.trade_outcome = Some(TradeOutcome {
            status: TradeOutcomeStatus::Cancelled,
            pnl: Some(0.0),
            pnl_percent: Some(0.0),
            exit_reason: reason.to_string(),
            exit_price: None,
            entry_price: trade.filled_price,
            closed_at: Some(Utc::now()),
        });
        state.should_complete = true;
        state.log(format!("trade_manager_agent: cancelled pending order, reason={reason}"));
        Ok(())
    }

    async fn resolve_filled_or_closed(
        &self,
        state: &mut PipelineState,
        trade: &mut TradeExecution,
    ) -> Result<(), AgentError> {
        match self.broker.get_position(&state.symbol).await {
            Ok(Some(position)) => {
                self.handle_filled_position(state, trade, &position).await;
                Ok(())
            }
            Ok(None) => {
                self.handle_closed_position(state, trade).await;
                Ok(())
            }
            Err(e) => Err(AgentError::Other(e.to_string())),
        }
    }

    async fn handle_filled_position(
        &self,
        state: &mut PipelineState,
        trade: &mut TradeExecution,
        position: &Position,
    ) {
        trade.api_error_count = 0;
        trade.last_successful_check = Some(Utc::now());
        if matches!(trade.status.as_deref(), Some("accepted") | Some("pending")) {
            trade.status = Some("filled".to_string());
        }
        if trade.trade_id.is_none() {
            let extracted = extract_trade_id(self.broker.broker_type(), &state.symbol, trade, position);
            trade.trade_id = extracted.clone();
            trade.broker_trade_id = extracted;
        }

        if position.unrealized_pl_percent <= EMERGENCY_EXIT_PNL_PERCENT {
            if self.broker.close_position(&state.symbol, None).await.is_ok() {
                state.trade_outcome = Some(TradeOutcome {
                    status: TradeOutcomeStatus::Executed,
                    pnl: Some(position.unrealized_pl),
                    pnl_percent: Some(position.unrealized_pl_percent),
                    exit_reason: "emergency exit: drawdown floor breached".to_string(),
                    exit_price: Some(position.current_price),
                    entry_price: Some(position.avg_entry_price),
                    closed_at: Some(Utc::now()),
                });
                state.should_complete = true;
                state.log("trade_manager_agent: emergency exit triggered, position closed");
                return;
            }
        }

        state.agent_reports.push(serde_json::json!({
            "status": "monitoring position",
            "unrealized_pl": position.unrealized_pl,
            "unrealized_pl_percent": position.unrealized_pl_percent,
        }));
    }

    async fn handle_closed_position(&self, state: &mut PipelineState, trade: &mut TradeExecution) {
        let never_confirmed = trade.order_id.is_some()
            && trade.trade_id.is_none()
            && trade.last_successful_check.is_none()
            && trade.status.as_deref() != Some("filled")
            && trade.filled_price.is_none();

        if never_confirmed {
            trade.status = Some("cancelled".to_string());
            state.trade_outcome = Some(TradeOutcome {
                status: TradeOutcomeStatus::Cancelled,
                pnl: Some(0.0),
                pnl_percent: Some(0.0),
                exit_reason: "limit order never filled".to_string(),
                exit_price: None,
                entry_price: None,
                closed_at: Some(Utc::now()),
            });
            state.should_complete = true;
            state.log("trade_manager_agent: limit order never filled, cancelling");
            return;
        }

        if trade.was_previously_seen() {
            state
                .agent_reports
                .push(serde_json::json!({"status": "position not found, awaiting reconfirmation"}));
            return;
        }

        match self
            .broker
            .get_trade_details(trade.trade_id.as_deref(), trade.order_id.as_deref())
            .await
        {
            Ok(details) if details.found && details.state == TradeState::Closed => {
                let cost_basis = (trade.filled_price.unwrap_or(details.open_price)
                    * trade.filled_quantity.unwrap_or(1.0))
                .abs()
                .max(1e-9);
                state.trade_outcome = Some(TradeOutcome {
                    status: TradeOutcomeStatus::Executed,
                    pnl: Some(details.realized_pl),
                    pnl_percent: Some(details.realized_pl / cost_basis * 100.0),
                    exit_reason: "closed by broker".to_string(),
                    exit_price: details.close_price,
                    entry_price: Some(details.open_price),
                    closed_at: details.close_time,
                });
                state.should_complete = true;
                state.log("trade_manager_agent: broker confirmed closed position, recorded realized P&L");
            }
            _ => {
                state.trade_outcome = Some(TradeOutcome {
                    status: TradeOutcomeStatus::NeedsReconciliation,
                    pnl: None,
                    pnl_percent: None,
                    exit_reason: "broker could not confirm closed trade details".to_string(),
                    exit_price: None,
                    entry_price: trade.filled_price,
                    closed_at: None,
                });
                state.should_complete = true;
                state.log("trade_manager_agent: could not confirm close from broker, flagging for reconciliation");
            }
        }
    }

    fn handle_api_error(&self, state: &mut PipelineState, trade: &mut TradeExecution, message: &str) {
        trade.api_error_count += 1;
        trade.last_api_error = Some(message.to_string());

        if trade.api_error_count >= COMMUNICATION_ERROR_HARD_CEILING {
            state.trade_outcome = Some(TradeOutcome {
                status: TradeOutcomeStatus::NeedsReconciliation,
                pnl: None,
                pnl_percent: None,
                exit_reason: "communication error ceiling reached".to_string(),
                exit_price: None,
                entry_price: trade.filled_price,
                closed_at: None,
            });
            state.should_complete = true;
            crate::metrics::inc_trade_manager_communication_error("hard_ceiling");
            state.log("trade_manager_agent: hit the communication-error ceiling, flagging for reconciliation");
            return;
        }

        if trade.api_error_count >= COMMUNICATION_ERROR_THRESHOLD {
            state.communication_error = true;
            crate::metrics::inc_trade_manager_communication_error("declared");
            state.log(format!(
                "trade_manager_agent: {} consecutive broker errors, declaring communication error",
                trade.api_error_count
            ));
            return;
        }

        crate::metrics::inc_trade_manager_communication_error("retrying");
        state.agent_reports.push(serde_json::json!({
            "status": "retrying",
            "error": message,
            "count": trade.api_error_count,
        }));
    }
}

fn extract_trade_id(
    broker_type: &str,
    symbol: &str,
    trade: &TradeExecution,
    position: &Position,
) -> Option<String> {
    match broker_type {
        "oanda" => position
            .broker_data
            .get("long")
            .and_then(|l| l.get("tradeIDs"))
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| {
                position
                    .broker_data
                    .get("short")
                    .and_then(|s| s.get("tradeIDs"))
                    .and_then(|v| v.as_array())
                    .and_then(|a| a.first())
                    .and_then(|v| v.as_str())
                    .map(String::from)
            }),
        "tradier" => Some(format!("{symbol}_{}_{:.2}", position.qty, position.cost_basis)),
        _ => trade.order_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::{long_position, FakeBroker};
    use crate::domain::pipeline_state::StrategyDecision;
    use crate::domain::{Mode, StrategyAction};
    use crate::notify::NullNotifier;
    use std::sync::Arc;
    use uuid::Uuid;

    fn agent_with_broker(broker: Arc<FakeBroker>) -> TradeManagerAgent {
        TradeManagerAgent::new(broker, Arc::new(NullNotifier), false)
    }

    fn monitoring_state(symbol: &str, order_id: Option<&str>, trade_id: Option<&str>) -> PipelineState {
        let mut state = PipelineState::new(symbol.to_string(), Uuid::new_v4(), Mode::Paper);
        state.strategy = Some(StrategyDecision {
            action: StrategyAction::Buy,
            entry_price: Some(100.0),
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
            confidence: 80.0,
            reasoning: "test".into(),
        });
        state.trade_execution = Some(TradeExecution {
            order_id: order_id.map(String::from),
            trade_id: trade_id.map(String::from),
            status: Some("filled".to_string()),
            filled_price: Some(100.0),
            filled_quantity: Some(10.0),
            submitted_at: Some(Utc::now() - Duration::minutes(5)),
            last_successful_check: Some(Utc::now() - Duration::minutes(1)),
            ..Default::default()
        });
        state
    }

    #[tokio::test]
    async fn filled_position_reports_progress_without_completing() {
        let broker = Arc::new(FakeBroker::default());
        broker
            .state
            .lock()
            .positions
            .insert("AAPL".to_string(), long_position("AAPL", 10.0, 100.0, 103.0));

        let mut state = monitoring_state("AAPL", Some("order-1"), None);
        agent_with_broker(broker).monitor(&mut state).await.unwrap();

        assert!(!state.should_complete);
        assert!(state.trade_execution.unwrap().trade_id.is_some());
    }

    #[tokio::test]
    async fn closed_position_previously_seen_does_not_complete_on_single_miss() {
        let broker = Arc::new(FakeBroker::default());
        let mut state = monitoring_state("AAPL", Some("order-1"), Some("trade-1"));

        agent_with_broker(broker).monitor(&mut state).await.unwrap();

        assert!(!state.should_complete);
    }

    #[tokio::test]
    async fn never_filled_limit_order_is_cancelled_with_zero_pnl() {
        let broker = Arc::new(FakeBroker::default());
        let mut state = PipelineState::new("AAPL".to_string(), Uuid::new_v4(), Mode::Paper);
        state.trade_execution = Some(TradeExecution {
            order_id: Some("order-1".to_string()),
            submitted_at: Some(Utc::now() - Duration::minutes(5)),
            ..Default::default()
        });

        agent_with_broker(broker).monitor(&mut state).await.unwrap();

        assert!(state.should_complete);
        let outcome = state.trade_outcome.unwrap();
        assert_eq!(outcome.status, TradeOutcomeStatus::Cancelled);
        assert_eq!(outcome.pnl, Some(0.0));
    }

    #[tokio::test]
    async fn communication_errors_escalate_past_threshold() {
        let broker = Arc::new(FakeBroker::default());
        broker.state.lock().fail_with = Some("simulated outage".to_string());

        let mut state = monitoring_state("AAPL", Some("order-1"), Some("trade-1"));
        state.trade_execution.as_mut().unwrap().api_error_count = COMMUNICATION_ERROR_THRESHOLD - 1;

        agent_with_broker(broker).monitor(&mut state).await.unwrap();

        assert!(state.communication_error);
    }
}
