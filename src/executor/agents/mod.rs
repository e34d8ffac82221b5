//! The fixed five-stage agent chain. The executor always runs these in the
//! same order regardless of what the pipeline's node graph declares; a node
//! whose `agent_type` doesn't match one of these five is skipped.

pub mod bias_agent;
pub mod market_data_agent;
pub mod risk_manager_agent;
pub mod strategy_agent;
pub mod trade_manager_agent;

pub use bias_agent::BiasAgent;
pub use market_data_agent::MarketDataAgent;
pub use risk_manager_agent::RiskManagerAgent;
pub use strategy_agent::StrategyAgent;
pub use trade_manager_agent::TradeManagerAgent;

use async_trait::async_trait;

use crate::domain::PipelineState;
use crate::error::AgentError;

/// One stage in the chain. `process` mutates the state it's handed; the
/// executor owns persisting it after each call, not the agent.
#[async_trait]
pub trait Agent: Send + Sync {
    fn agent_type(&self) -> &'static str;
    async fn process(&self, state: &mut PipelineState) -> Result<(), AgentError>;
}
