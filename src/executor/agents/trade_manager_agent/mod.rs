//! The trade manager state machine: the one agent with two distinct call
//! shapes. `process` (and therefore every caller that just drives the fixed
//! five-stage chain) dispatches on whether `trade_execution` is already
//! populated — `None` means this is the first call (execute), `Some` means
//! a later monitoring pass (monitor). The monitoring task calls the same
//! `process` entry point on every subsequent check.

pub mod execute;
pub mod monitor;

use async_trait::async_trait;
use std::sync::Arc;

use crate::broker::BrokerService;
use crate::domain::PipelineState;
use crate::error::AgentError;
use crate::notify::Notifier;

use super::Agent;

/// Order ages under this are assumed to still be propagating through the
/// broker's eventually-consistent order book.
pub(crate) const GRACE_PERIOD_SECS: i64 = 60;
pub(crate) const COMMUNICATION_ERROR_THRESHOLD: u32 = 5;
pub(crate) const COMMUNICATION_ERROR_HARD_CEILING: u32 = 60;

pub struct TradeManagerAgent {
    pub(crate) broker: Arc<dyn BrokerService>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) notify_on_trade_executed: bool,
    pub(crate) max_pending_hours: i64,
}

impl TradeManagerAgent {
    pub fn new(
        broker: Arc<dyn BrokerService>,
        notifier: Arc<dyn Notifier>,
        notify_on_trade_executed: bool,
    ) -> Self {
        Self {
            broker,
            notifier,
            notify_on_trade_executed,
            max_pending_hours: 1,
        }
    }
}

#[async_trait]
impl Agent for TradeManagerAgent {
    fn agent_type(&self) -> &'static str {
        "trade_manager_agent"
    }

    async fn process(&self, state: &mut PipelineState) -> Result<(), AgentError> {
        if state.trade_execution.is_none() {
            self.execute(state).await
        } else {
            state.reset_monitor_flags();
            self.monitor(state).await
        }
    }
}
