use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::candle::{Candle, Timeframe};
use super::execution::Mode;
pub use super::signal::Bias;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyAction {
    Buy,
    Sell,
    Hold,
    /// Accepted by the state machine but never produced by the sampled
    /// agents; exercised only via the trade manager's emergency-exit path.
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    pub current_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub candles: HashMap<Timeframe, Vec<Candle>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiasAssessment {
    pub bias: Bias,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub action: StrategyAction,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub approved: bool,
    pub position_size: f64,
    pub risk_reward_ratio: f64,
    pub reasoning: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeExecutionStatus {
    Skipped,
    Rejected,
    NoAction,
    Accepted,
    Pending,
    Filled,
    PartiallyFilled,
    Cancelled,
}

/// The in-flight order/position record for one execution. `order_id`/
/// `trade_id` presence (not the execution status alone) is what the monitor
/// phase's branch table keys off of.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeExecution {
    pub order_id: Option<String>,
    pub trade_id: Option<String>,
    /// Tradier has no native per-position id; the synthesized
    /// `{symbol}_{qty}_{cost_basis}` id is persisted here rather than
    /// recomputed, so it survives a quantity change between checks.
    pub broker_trade_id: Option<String>,
    pub status: Option<String>,
    pub filled_price: Option<f64>,
    pub filled_quantity: Option<f64>,
    pub order_type: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_successful_check: Option<DateTime<Utc>>,
    pub api_error_count: u32,
    pub last_api_error: Option<String>,
    pub broker_response: serde_json::Value,
}

impl TradeExecution {
    pub fn order_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.submitted_at.map(|t| now - t)
    }

    /// Whether this position was ever confirmed live by a prior successful
    /// check — used by the closed-position branch to distinguish a
    /// transient "not found" from a legitimate never-filled limit order.
    pub fn was_previously_seen(&self) -> bool {
        self.last_successful_check.is_some()
            || self.status.as_deref() == Some("filled")
            || self.filled_price.map(|p| p > 0.0).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeOutcomeStatus {
    Executed,
    Cancelled,
    NeedsReconciliation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub status: TradeOutcomeStatus,
    /// `None` only ever accompanies `NeedsReconciliation`; P&L is never
    /// fabricated when the broker hasn't confirmed a close.
    pub pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub exit_reason: String,
    pub exit_price: Option<f64>,
    pub entry_price: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// The in-memory record that flows through the fixed agent chain. Agents
/// write back into the same owned state they receive —
/// there is no cycle because exactly one caller (the executor, then the
/// monitoring task) ever holds it at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub symbol: String,
    pub user_id: Uuid,
    pub mode: Mode,
    pub signal_context: Option<serde_json::Value>,
    pub market_data: Option<MarketDataSnapshot>,
    pub biases: HashMap<Timeframe, BiasAssessment>,
    pub strategy: Option<StrategyDecision>,
    pub risk_assessment: Option<RiskAssessment>,
    pub trade_execution: Option<TradeExecution>,
    pub trade_outcome: Option<TradeOutcome>,
    pub execution_phase: String,
    pub monitor_interval_minutes: f64,
    pub should_complete: bool,
    pub communication_error: bool,
    pub agent_reports: Vec<serde_json::Value>,
    pub execution_log: Vec<String>,
    pub agent_costs: HashMap<String, f64>,
    /// Mirrors `Pipeline.broker_configs.len()`, refreshed by the executor
    /// from the pipeline's current config on every pass. The Trade
    /// Manager's Execute phase reads this to reject a >1 configuration
    /// without needing the `Pipeline` itself threaded through the agent
    /// trait.
    pub broker_tool_count: usize,
}

impl PipelineState {
    pub fn new(symbol: String, user_id: Uuid, mode: Mode) -> Self {
        Self {
            symbol,
            user_id,
            mode,
            signal_context: None,
            market_data: None,
            biases: HashMap::new(),
            strategy: None,
            risk_assessment: None,
            trade_execution: None,
            trade_outcome: None,
            execution_phase: "pending".to_string(),
            monitor_interval_minutes: 5.0,
            should_complete: false,
            communication_error: false,
            agent_reports: Vec::new(),
            execution_log: Vec::new(),
            agent_costs: HashMap::new(),
            broker_tool_count: 0,
        }
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.execution_log.push(message.into());
    }

    /// Every monitor-phase call clears these flags on entry before
    /// evaluating the current branch.
    pub fn reset_monitor_flags(&mut self) {
        self.should_complete = false;
        self.communication_error = false;
        self.trade_outcome = None;
    }
}
