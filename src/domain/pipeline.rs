use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BrokerError;

use super::signal::SignalType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Signal,
    Periodic,
}

/// `{signal_type, min_confidence?}`. An empty subscription list on the
/// owning pipeline means "subscribe to all".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSubscription {
    pub signal_type: SignalType,
    pub min_confidence: Option<f64>,
}

/// One node in the pipeline's configured agent graph. The executor ignores
/// node order and re-derives the fixed five-stage sequence from
/// `agent_type`; unknown/tool nodes are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNodeConfig {
    pub node_id: String,
    pub agent_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A user-owned trading pipeline. Immutable per execution: a running
/// execution snapshots this config at the moment it starts, so edits to the
/// pipeline never affect an execution already in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub pipeline_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub nodes: Vec<AgentNodeConfig>,
    pub trigger_mode: TriggerMode,
    pub scanner_id: Option<Uuid>,
    pub subscriptions: Vec<SignalSubscription>,
    pub is_active: bool,
    /// Periodic-mode scheduling cadence, in minutes.
    pub interval_minutes: f64,
    pub requires_approval: bool,
    /// The broker tools available to this pipeline. Normal configuration
    /// has zero (no trading, just signals/analysis) or exactly one; more
    /// than one is a configuration error the Trade Manager's Execute phase
    /// rejects outright rather than guessing which to use.
    pub broker_configs: Vec<BrokerConfig>,
    pub notify_on_trade_executed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub broker_type: String,
    pub account_id: Option<String>,
    pub account_type: String,
}

impl Pipeline {
    pub fn node_of_type(&self, agent_type: &str) -> Option<&AgentNodeConfig> {
        self.nodes.iter().find(|n| n.agent_type == agent_type)
    }

    /// `Ok(None)` when no broker tool is configured, `Ok(Some(cfg))` when
    /// exactly one is, `Err` when more than one is — the precondition the
    /// Trade Manager's Execute phase checks before anything else.
    pub fn single_broker_config(&self) -> Result<Option<&BrokerConfig>, BrokerError> {
        match self.broker_configs.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(one)),
            _ => Err(BrokerError::MultipleBrokersConfigured),
        }
    }

    /// The subscription entry matching `signal_type`, if this pipeline has
    /// any subscriptions at all. `self.subscriptions.is_empty()` means
    /// "subscribe to all" and is handled by the caller, not conflated with
    /// "no match found" here.
    pub fn subscription_for(&self, signal_type: SignalType) -> Option<&SignalSubscription> {
        self.subscriptions
            .iter()
            .find(|s| s.signal_type == signal_type)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            pipeline_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: String::new(),
            nodes: Vec::new(),
            trigger_mode: TriggerMode::Signal,
            scanner_id: None,
            subscriptions: Vec::new(),
            is_active: true,
            interval_minutes: 5.0,
            requires_approval: false,
            broker_configs: Vec::new(),
            notify_on_trade_executed: false,
        }
    }
}
