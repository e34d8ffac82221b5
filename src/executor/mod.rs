//! Pipeline executor: drives the fixed agent sequence for one
//! `(pipeline, symbol)` job, persisting progress after every stage so the
//! UI observes real-time status (spec section 4.4).

pub mod agents;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::warn;

use crate::broker::BrokerService;
use crate::domain::pipeline_state::StrategyAction;
use crate::domain::{
    AgentState, AgentStatus, Execution, ExecutionPhase, ExecutionStatus, Pipeline, PipelineState,
};
use crate::error::AgentError;
use crate::eventbus::{Job, JobQueue};
use crate::store::OltpStore;

use agents::Agent;

enum PreflightOutcome {
    Proceed,
    Skip(&'static str),
}

/// Upper bound on a single agent call before the executor gives up on it
/// and force-fails the execution rather than leaving a row stuck RUNNING.
const AGENT_HARD_TIMEOUT: StdDuration = StdDuration::from_secs(120);
const MARKET_DATA_FETCH_ATTEMPTS: u32 = 3;

pub struct Executor {
    store: Arc<OltpStore>,
    queue: Arc<dyn JobQueue>,
    broker: Option<Arc<dyn BrokerService>>,
    /// Built by the caller in the fixed order; a pipeline only runs the
    /// subset whose `agent_type` also appears in its own node config.
    agents: Vec<Arc<dyn Agent>>,
}

impl Executor {
    pub fn new(
        store: Arc<OltpStore>,
        queue: Arc<dyn JobQueue>,
        broker: Option<Arc<dyn BrokerService>>,
        agents: Vec<Arc<dyn Agent>>,
    ) -> Self {
        Self {
            store,
            queue,
            broker,
            agents,
        }
    }

    pub async fn run(&self, job: Job) -> anyhow::Result<()> {
        let Some(mut execution) = self.store.get_execution(job.execution_id)? else {
            warn!(execution_id = %job.execution_id, "job references a missing execution, dropping");
            return Ok(());
        };
        let Some(pipeline) = self.store.get_pipeline(job.pipeline_id)? else {
            execution.mark_failed(Utc::now(), "pipeline no longer exists");
            self.commit(&mut execution)?;
            return Ok(());
        };

        match self.preflight(&execution, &pipeline).await? {
            PreflightOutcome::Skip(reason) => {
                execution.result.warnings.push(reason.to_string());
                execution.mark_completed(Utc::now());
                self.commit(&mut execution)?;
                return Ok(());
            }
            PreflightOutcome::Proceed => {}
        }

        let symbol = self.resolve_symbol(&execution, &pipeline)?;
        let Some(symbol) = symbol else {
            execution.mark_failed(Utc::now(), "no symbol on job and no scanner fallback available");
            self.commit(&mut execution)?;
            return Ok(());
        };

        let mut state = execution
            .pipeline_state
            .take()
            .unwrap_or_else(|| PipelineState::new(symbol, pipeline.user_id, job.mode));
        state.signal_context = job.signal_context.clone();
        state.broker_tool_count = pipeline.broker_configs.len();

        execution.status = ExecutionStatus::Running;
        execution.execution_phase = ExecutionPhase::Running;
        execution.started_at.get_or_insert(Utc::now());
        self.commit(&mut execution)?;

        if let Some(outcome) = self.run_agent_chain(&mut execution, &pipeline, &mut state).await? {
            return Ok(outcome);
        }

        self.finish_pass(&mut execution, state)?;
        Ok(())
    }

    async fn preflight(
        &self,
        execution: &Execution,
        pipeline: &Pipeline,
    ) -> anyhow::Result<PreflightOutcome> {
        let active_for_pipeline = self.store.active_for_pipeline_symbol(
            pipeline.pipeline_id,
            &execution.symbol,
            &[
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Monitoring,
                ExecutionStatus::CommunicationError,
            ],
        )?;
        if active_for_pipeline
            .iter()
            .any(|e| e.execution_id != execution.execution_id)
        {
            return Ok(PreflightOutcome::Skip(
                "another execution for this pipeline+symbol is already in flight",
            ));
        }

        let active_for_user = self.store.active_for_user_symbol(
            pipeline.user_id,
            &execution.symbol,
            &[ExecutionStatus::Monitoring, ExecutionStatus::CommunicationError],
        )?;
        if active_for_user
            .iter()
            .any(|e| e.execution_id != execution.execution_id)
        {
            return Ok(PreflightOutcome::Skip(
                "user already holds an active trade on this symbol",
            ));
        }

        if !pipeline.broker_configs.is_empty() {
            if let Some(broker) = &self.broker {
                match broker.has_active_symbol(&execution.symbol).await {
                    Ok(true) => return Ok(PreflightOutcome::Skip("broker already holds this symbol")),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "has_active_symbol preflight check failed, proceeding fail-open"),
                }
            }
        }

        if self.store.budget_exceeded(pipeline.user_id)? {
            return Ok(PreflightOutcome::Skip("user budget exceeded"));
        }

        Ok(PreflightOutcome::Proceed)
    }

    /// The job always carries the dispatched ticker; the scanner fallback
    /// only exists so a pipeline can be run manually without a job.
    fn resolve_symbol(&self, execution: &Execution, pipeline: &Pipeline) -> anyhow::Result<Option<String>> {
        if !execution.symbol.is_empty() {
            return Ok(Some(execution.symbol.clone()));
        }
        let fallback = match pipeline.scanner_id {
            Some(scanner_id) => self
                .store
                .get_scanner(scanner_id)?
                .and_then(|s| s.tickers.first().cloned()),
            None => None,
        };
        if let Some(ticker) = &fallback {
            warn!(
                pipeline_id = %pipeline.pipeline_id,
                ticker,
                "execution carried no symbol, falling back to the scanner's first ticker"
            );
        }
        Ok(fallback)
    }

    /// Runs every fixed-order agent the pipeline's node config selects.
    /// Returns `Some(())` when the caller should stop immediately (approval
    /// gate hit, or the execution reached a terminal status already
    /// committed inside the loop); `None` means fall through to the normal
    /// completion/monitoring-handoff path.
    async fn run_agent_chain(
        &self,
        execution: &mut Execution,
        pipeline: &Pipeline,
        state: &mut PipelineState,
    ) -> anyhow::Result<Option<()>> {
        for (idx, agent) in self.agents.iter().enumerate() {
            let agent_type = agent.agent_type();
            if pipeline.node_of_type(agent_type).is_none() {
                continue;
            }

            execution
                .agent_states
                .push(AgentState::pending(format!("{agent_type}-1"), agent_type));
            {
                let running = execution.agent_states.last_mut().expect("just pushed");
                running.status = AgentStatus::Running;
                running.started_at = Some(Utc::now());
            }
            self.commit(execution)?;

            let outcome = self.call_agent(agent.as_ref(), agent_type, state).await;

            match outcome {
                Ok(()) => {
                    let last = execution.agent_states.last_mut().expect("just pushed");
                    last.status = AgentStatus::Completed;
                    last.completed_at = Some(Utc::now());
                    self.sync_result(execution, state);
                    self.commit(execution)?;
                }
                Err(AgentError::TriggerNotMet(reason)) => {
                    let last = execution.agent_states.last_mut().expect("just pushed");
                    last.status = AgentStatus::Skipped;
                    last.error = Some(reason);
                    last.completed_at = Some(Utc::now());
                    // Trigger-not-met short-circuits the whole chain: every
                    // remaining agent this pipeline would otherwise have
                    // run also gets an explicit Skipped row, not silence.
                    for later_agent in &self.agents[idx + 1..] {
                        let later_type = later_agent.agent_type();
                        if pipeline.node_of_type(later_type).is_none() {
                            continue;
                        }
                        let mut skipped = AgentState::pending(format!("{later_type}-1"), later_type);
                        skipped.status = AgentStatus::Skipped;
                        skipped.error = Some("trigger not met upstream".to_string());
                        skipped.completed_at = Some(Utc::now());
                        execution.agent_states.push(skipped);
                    }
                    self.sync_result(execution, state);
                    execution.mark_completed(Utc::now());
                    self.commit(execution)?;
                    return Ok(Some(()));
                }
                Err(AgentError::Timeout) => {
                    let last = execution.agent_states.last_mut().expect("just pushed");
                    last.status = AgentStatus::Failed;
                    last.completed_at = Some(Utc::now());
                    last.error = Some(format!("{agent_type} exceeded its time budget"));
                    self.sync_result(execution, state);
                    execution.mark_failed(Utc::now(), format!("{agent_type} timed out"));
                    self.commit(execution)?;
                    return Ok(Some(()));
                }
                Err(e) => {
                    let critical = e.is_always_critical() || agent_type == "risk_manager_agent";
                    {
                        let last = execution.agent_states.last_mut().expect("just pushed");
                        last.status = AgentStatus::Failed;
                        last.completed_at = Some(Utc::now());
                        last.error = Some(e.to_string());
                    }
                    crate::metrics::inc_executor_agent_failure(agent_type);
                    if critical {
                        self.sync_result(execution, state);
                        execution.mark_failed(Utc::now(), e.to_string());
                        self.commit(execution)?;
                        return Ok(Some(()));
                    }
                    execution.result.errors.push(format!("{agent_type}: {e}"));
                    self.sync_result(execution, state);
                    self.commit(execution)?;
                }
            }

            if agent_type == "risk_manager_agent" && self.should_pause_for_approval(pipeline, state) {
                execution.pipeline_state = Some(state.clone());
                execution.status = ExecutionStatus::AwaitingApproval;
                self.commit(execution)?;
                return Ok(Some(()));
            }
        }
        Ok(None)
    }

    fn should_pause_for_approval(&self, pipeline: &Pipeline, state: &PipelineState) -> bool {
        pipeline.requires_approval
            && state
                .strategy
                .as_ref()
                .is_some_and(|s| s.action != StrategyAction::Hold)
            && state.risk_assessment.as_ref().is_some_and(|r| r.approved)
    }

    async fn call_agent(
        &self,
        agent: &dyn Agent,
        agent_type: &str,
        state: &mut PipelineState,
    ) -> Result<(), AgentError> {
        let call = async {
            if agent_type != "market_data_agent" {
                return agent.process(state).await;
            }
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match agent.process(state).await {
                    Ok(()) => return Ok(()),
                    Err(e) if attempt < MARKET_DATA_FETCH_ATTEMPTS => {
                        warn!(attempt, error = %e, "market data fetch failed, retrying");
                        tokio::time::sleep(StdDuration::from_millis(500 * 2u64.pow(attempt - 1))).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(AGENT_HARD_TIMEOUT, call).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout),
        }
    }

    fn sync_result(&self, execution: &mut Execution, state: &PipelineState) {
        execution.result.bias = serde_json::to_value(&state.biases).ok();
        execution.result.strategy = state.strategy.as_ref().and_then(|s| serde_json::to_value(s).ok());
        execution.result.risk_assessment = state
            .risk_assessment
            .as_ref()
            .and_then(|r| serde_json::to_value(r).ok());
        execution.result.trade_execution = state
            .trade_execution
            .as_ref()
            .and_then(|t| serde_json::to_value(t).ok());
        execution.result.trade_outcome = state
            .trade_outcome
            .as_ref()
            .and_then(|t| serde_json::to_value(t).ok());
        execution.result.agent_reports = state.agent_reports.clone();
        execution.logs = state.execution_log.clone();
        execution.reports = state.agent_reports.clone();
    }

    fn finish_pass(&self, execution: &mut Execution, state: PipelineState) -> anyhow::Result<()> {
        if state.execution_phase == "monitoring" {
            execution.pipeline_state = Some(state.clone());
            execution.status = ExecutionStatus::Monitoring;
            execution.execution_phase = ExecutionPhase::Monitoring;
            execution.monitoring_started_at.get_or_insert(Utc::now());
            execution.monitor_interval_minutes = state.monitor_interval_minutes;
            execution.next_check_at = Some(Utc::now());
            self.commit(execution)?;
            self.queue.enqueue(Job {
                execution_id: execution.execution_id,
                pipeline_id: execution.pipeline_id,
                symbol: execution.symbol.clone(),
                mode: execution.mode,
                signal_context: None,
                deliver_at: Utc::now(),
            });
        } else {
            execution.pipeline_state = Some(state);
            execution.mark_completed(Utc::now());
            self.commit(execution)?;
        }
        Ok(())
    }

    fn commit(&self, execution: &mut Execution) -> anyhow::Result<()> {
        execution.recompute_cost();
        Ok(self.store.commit_execution(execution)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use crate::domain::{AgentNodeConfig, Mode};
    use crate::eventbus::InMemoryJobQueue;
    use crate::executor::agents::{RiskManagerAgent, TradeManagerAgent};
    use crate::notify::NullNotifier;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct AlwaysHold;

    #[async_trait]
    impl Agent for AlwaysHold {
        fn agent_type(&self) -> &'static str {
            "strategy_agent"
        }
        async fn process(&self, state: &mut PipelineState) -> Result<(), AgentError> {
            state.strategy = Some(crate::domain::StrategyDecision {
                action: StrategyAction::Hold,
                entry_price: None,
                stop_loss: None,
                take_profit: None,
                confidence: 0.0,
                reasoning: "forced hold".into(),
            });
            Ok(())
        }
    }

    fn pipeline_with(node_types: &[&str], user_id: Uuid) -> Pipeline {
        let mut p = Pipeline::default();
        p.user_id = user_id;
        p.nodes = node_types
            .iter()
            .map(|t| AgentNodeConfig {
                node_id: t.to_string(),
                agent_type: t.to_string(),
                config: serde_json::json!({}),
            })
            .collect();
        p
    }

    #[tokio::test]
    async fn skips_dispatch_when_execution_already_in_flight() {
        let store = Arc::new(OltpStore::in_memory().unwrap());
        let queue = Arc::new(InMemoryJobQueue::new());
        let broker: Arc<dyn BrokerService> = Arc::new(FakeBroker::default());

        let pipeline = pipeline_with(&["strategy_agent"], Uuid::new_v4());
        store.upsert_pipeline(&pipeline).unwrap();

        let mut existing = Execution::new_pending(
            pipeline.pipeline_id,
            pipeline.user_id,
            "AAPL".to_string(),
            Mode::Paper,
        );
        existing.status = ExecutionStatus::Running;
        store.insert_execution(&existing).unwrap();

        let mut job_execution = Execution::new_pending(
            pipeline.pipeline_id,
            pipeline.user_id,
            "AAPL".to_string(),
            Mode::Paper,
        );
        job_execution.status = ExecutionStatus::Pending;
        store.insert_execution(&job_execution).unwrap();

        let executor = Executor::new(
            store.clone(),
            queue,
            Some(broker),
            vec![Arc::new(AlwaysHold)],
        );

        let job = Job {
            execution_id: job_execution.execution_id,
            pipeline_id: pipeline.pipeline_id,
            symbol: "AAPL".to_string(),
            mode: Mode::Paper,
            signal_context: None,
            deliver_at: Utc::now(),
        };
        executor.run(job).await.unwrap();

        let refreshed = store.get_execution(job_execution.execution_id).unwrap().unwrap();
        assert_eq!(refreshed.status, ExecutionStatus::Completed);
        assert!(!refreshed.result.warnings.is_empty());
    }

    #[tokio::test]
    async fn hold_strategy_completes_without_trade_manager() {
        let store = Arc::new(OltpStore::in_memory().unwrap());
        let queue = Arc::new(InMemoryJobQueue::new());
        let broker: Arc<dyn BrokerService> = Arc::new(FakeBroker::default());

        let pipeline = pipeline_with(
            &["strategy_agent", "risk_manager_agent", "trade_manager_agent"],
            Uuid::new_v4(),
        );
        store.upsert_pipeline(&pipeline).unwrap();

        let execution = Execution::new_pending(
            pipeline.pipeline_id,
            pipeline.user_id,
            "AAPL".to_string(),
            Mode::Paper,
        );
        store.insert_execution(&execution).unwrap();

        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(AlwaysHold),
            Arc::new(RiskManagerAgent::new(broker.clone())),
            Arc::new(TradeManagerAgent::new(broker.clone(), Arc::new(NullNotifier), false)),
        ];
        let executor = Executor::new(store.clone(), queue, Some(broker), agents);

        let job = Job {
            execution_id: execution.execution_id,
            pipeline_id: pipeline.pipeline_id,
            symbol: "AAPL".to_string(),
            mode: Mode::Paper,
            signal_context: None,
            deliver_at: Utc::now(),
        };
        executor.run(job).await.unwrap();

        let refreshed = store.get_execution(execution.execution_id).unwrap().unwrap();
        assert_eq!(refreshed.status, ExecutionStatus::Completed);
    }
}
