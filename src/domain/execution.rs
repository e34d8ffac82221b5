use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pipeline_state::PipelineState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Live,
    Paper,
    Simulation,
    Validation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "MONITORING")]
    Monitoring,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "COMMUNICATION_ERROR")]
    CommunicationError,
    #[serde(rename = "NEEDS_RECONCILIATION")]
    NeedsReconciliation,
    #[serde(rename = "AWAITING_APPROVAL")]
    AwaitingApproval,
}

impl ExecutionStatus {
    /// Statuses counted by the per-`(pipeline_id, symbol)` and
    /// per-`(user_id, symbol)` "at most one active" invariants.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending
                | ExecutionStatus::Running
                | ExecutionStatus::Monitoring
                | ExecutionStatus::CommunicationError
        )
    }

    /// The narrower set that blocks a *new* broker position for the same
    /// user+symbol.
    pub fn holds_active_trade(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Monitoring | ExecutionStatus::CommunicationError
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Pending,
    Running,
    Monitoring,
    Completed,
    NeedsReconciliation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub agent_type: String,
    pub status: AgentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub cost: f64,
}

impl AgentState {
    pub fn pending(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            status: AgentStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            cost: 0.0,
        }
    }
}

/// Structured outputs surfaced to the UI; denormalized from `pipeline_state`
/// after every stage so callers never need to parse the full snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub bias: Option<serde_json::Value>,
    pub strategy: Option<serde_json::Value>,
    pub risk_assessment: Option<serde_json::Value>,
    pub trade_execution: Option<serde_json::Value>,
    pub trade_outcome: Option<serde_json::Value>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub agent_reports: Vec<serde_json::Value>,
}

/// The canonical record of one pipeline run for one ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub pipeline_id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub mode: Mode,
    pub status: ExecutionStatus,
    pub execution_phase: ExecutionPhase,
    pub version: i64,
    pub agent_states: Vec<AgentState>,
    pub result: ExecutionResult,
    pub pipeline_state: Option<PipelineState>,
    pub logs: Vec<String>,
    pub reports: Vec<serde_json::Value>,
    pub cost: f64,
    pub cost_breakdown: serde_json::Value,
    pub monitor_interval_minutes: f64,
    pub next_check_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    /// When this row first transitioned into MONITORING — distinct from
    /// `started_at`, which marks the run's overall start. Reconciliation's
    /// grace period is measured from here, not from job start.
    pub monitoring_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl Execution {
    pub fn new_pending(pipeline_id: Uuid, user_id: Uuid, symbol: String, mode: Mode) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            pipeline_id,
            user_id,
            symbol,
            mode,
            status: ExecutionStatus::Pending,
            execution_phase: ExecutionPhase::Pending,
            version: 0,
            agent_states: Vec::new(),
            result: ExecutionResult::default(),
            pipeline_state: None,
            logs: Vec::new(),
            reports: Vec::new(),
            cost: 0.0,
            cost_breakdown: serde_json::json!({}),
            monitor_interval_minutes: 5.0,
            next_check_at: None,
            started_at: None,
            monitoring_started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            error_message: None,
        }
    }

    /// Sum of every agent's recorded cost; called after every stage so
    /// `result.cost`/`cost_breakdown` never drift from `agent_states`.
    pub fn recompute_cost(&mut self) {
        self.cost = self.agent_states.iter().map(|a| a.cost).sum();
        let breakdown: serde_json::Map<String, serde_json::Value> = self
            .agent_states
            .iter()
            .map(|a| (a.agent_type.clone(), serde_json::json!(a.cost)))
            .collect();
        self.cost_breakdown = serde_json::Value::Object(breakdown);
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Completed;
        self.execution_phase = ExecutionPhase::Completed;
        self.completed_at = Some(now);
        self.next_check_at = None;
    }

    pub fn mark_needs_reconciliation(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::NeedsReconciliation;
        self.execution_phase = ExecutionPhase::NeedsReconciliation;
        // Deliberately NOT setting completed_at: NEEDS_RECONCILIATION is not
        // terminal until a human or the reconciliation task resolves it.
        self.next_check_at = None;
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.completed_at = Some(now);
        self.next_check_at = None;
        self.error_message = Some(error.into());
    }
}
