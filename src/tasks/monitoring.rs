//! The executive harness around the Trade Manager's monitor phase (spec
//! section 4.6). One call handles exactly one check for one execution;
//! re-arming the next check is the caller's job (it enqueues a `Job` at
//! `execution.next_check_at`), matching the same queue-driven scheduling the
//! executor uses to hand off into monitoring in the first place.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tracing::{error, warn};

use crate::broker::registry::BrokerRegistry;
use crate::domain::pipeline_state::TradeOutcomeStatus;
use crate::domain::{Execution, ExecutionPhase, ExecutionStatus, PipelineState};
use crate::executor::agents::trade_manager_agent::{TradeManagerAgent, COMMUNICATION_ERROR_HARD_CEILING};
use crate::executor::agents::Agent;
use crate::notify::Notifier;
use crate::store::OltpStore;

const MAX_MONITORING_DURATION: Duration = Duration::hours(24);
const COMMUNICATION_RETRY_SECS: i64 = 60;
const RETRY_BACKOFF_MINUTES: [u64; 5] = [1, 2, 4, 8, 16];

pub struct MonitoringTask {
    store: Arc<OltpStore>,
    brokers: Arc<BrokerRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl MonitoringTask {
    pub fn new(store: Arc<OltpStore>, brokers: Arc<BrokerRegistry>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, brokers, notifier }
    }

    /// Outer retry wrapper: any unexpected error from `run_once` (store
    /// failures, a broker registry miss) is retried with backoff rather than
    /// silently dropping the check, since a dropped check leaves a row
    /// MONITORING with no one polling it until reconciliation notices.
    pub async fn run(&self, execution_id: uuid::Uuid) -> serde_json::Value {
        for (attempt, backoff_minutes) in RETRY_BACKOFF_MINUTES.iter().enumerate() {
            match self.run_once(execution_id).await {
                Ok(result) => return result,
                Err(e) => {
                    warn!(%execution_id, attempt, error = %e, "monitoring check failed, retrying with backoff");
                    if attempt + 1 == RETRY_BACKOFF_MINUTES.len() {
                        error!(%execution_id, error = %e, "monitoring check exhausted all retries");
                        return serde_json::json!({"status": "error", "error": e.to_string()});
                    }
                    tokio::time::sleep(StdDuration::from_secs(backoff_minutes * 60)).await;
                }
            }
        }
        unreachable!("loop always returns before exhausting its own bound")
    }

    async fn run_once(&self, execution_id: uuid::Uuid) -> anyhow::Result<serde_json::Value> {
        let Some(mut execution) = self.store.get_execution(execution_id)? else {
            return Ok(serde_json::json!({"status": "not_monitoring"}));
        };
        if !matches!(
            execution.status,
            ExecutionStatus::Monitoring | ExecutionStatus::CommunicationError
        ) {
            return Ok(serde_json::json!({"status": "not_monitoring"}));
        }

        let started = execution.started_at.unwrap_or(execution.created_at);
        if Utc::now() - started > MAX_MONITORING_DURATION {
            execution.mark_failed(Utc::now(), "monitoring exceeded the 24-hour maximum duration");
            self.commit(&mut execution)?;
            return Ok(serde_json::json!({"status": "failed", "reason": "max_duration_exceeded"}));
        }

        let mut state = match execution.pipeline_state.clone() {
            Some(state) => state,
            None => self.reconstruct_state(&execution)?,
        };

        let Some(pipeline) = self.store.get_pipeline(execution.pipeline_id)? else {
            execution.mark_needs_reconciliation(Utc::now());
            self.commit(&mut execution)?;
            return Ok(serde_json::json!({"status": "needs_reconciliation", "reason": "pipeline no longer exists"}));
        };
        let broker_config = match pipeline.single_broker_config() {
            Ok(Some(cfg)) => cfg,
            Ok(None) => {
                execution.mark_needs_reconciliation(Utc::now());
                self.commit(&mut execution)?;
                return Ok(serde_json::json!({"status": "needs_reconciliation", "reason": "pipeline has no broker configured"}));
            }
            Err(e) => {
                execution.mark_needs_reconciliation(Utc::now());
                self.commit(&mut execution)?;
                return Ok(serde_json::json!({"status": "needs_reconciliation", "reason": e.to_string()}));
            }
        };
        let broker = self.brokers.resolve(broker_config)?;
        let trade_manager = TradeManagerAgent::new(broker, self.notifier.clone(), pipeline.notify_on_trade_executed);

        let process_result = trade_manager.process(&mut state).await;

        execution.pipeline_state = Some(state.clone());
        sync_result(&mut execution, &state);
        if let Err(e) = &process_result {
            execution.result.errors.push(e.to_string());
        }

        if state.communication_error {
            return self.handle_communication_error(&mut execution, &state);
        }

        if state.should_complete {
            return self.handle_completion(&mut execution, &state).await;
        }

        execution.status = ExecutionStatus::Monitoring;
        execution.execution_phase = ExecutionPhase::Monitoring;
        execution.monitor_interval_minutes = state.monitor_interval_minutes;
        execution.next_check_at =
            Some(Utc::now() + Duration::milliseconds((state.monitor_interval_minutes * 60_000.0) as i64));
        self.commit(&mut execution)?;
        Ok(serde_json::json!({"status": "monitoring"}))
    }

    fn handle_communication_error(
        &self,
        execution: &mut Execution,
        state: &PipelineState,
    ) -> anyhow::Result<serde_json::Value> {
        let error_count = state
            .trade_execution
            .as_ref()
            .map(|t| t.api_error_count)
            .unwrap_or(0);
        if error_count >= COMMUNICATION_ERROR_HARD_CEILING {
            execution.mark_needs_reconciliation(Utc::now());
            self.commit(execution)?;
            return Ok(serde_json::json!({"status": "needs_reconciliation", "reason": "communication error ceiling"}));
        }
        execution.status = ExecutionStatus::CommunicationError;
        execution.execution_phase = ExecutionPhase::Monitoring;
        execution.next_check_at = Some(Utc::now() + Duration::seconds(COMMUNICATION_RETRY_SECS));
        self.commit(execution)?;
        Ok(serde_json::json!({"status": "communication_error"}))
    }

    async fn handle_completion(
        &self,
        execution: &mut Execution,
        state: &PipelineState,
    ) -> anyhow::Result<serde_json::Value> {
        let needs_reconciliation = state
            .trade_outcome
            .as_ref()
            .is_some_and(|o| o.status == TradeOutcomeStatus::NeedsReconciliation);
        if needs_reconciliation {
            execution.mark_needs_reconciliation(Utc::now());
        } else {
            execution.mark_completed(Utc::now());
        }
        self.commit(execution)?;
        self.notifier
            .notify(execution.user_id, &format!("{} position closed", execution.symbol))
            .await;
        Ok(serde_json::json!({"status": if needs_reconciliation { "needs_reconciliation" } else { "completed" }}))
    }

    fn commit(&self, execution: &mut Execution) -> anyhow::Result<()> {
        execution.recompute_cost();
        Ok(self.store.commit_execution(execution)?)
    }

    /// Lossy fallback used when the full `PipelineState` snapshot is missing
    /// or failed to deserialize. Reconstructs just enough of the state for
    /// the monitor phase to run: `trade_execution` must survive this or the
    /// agent has nothing to key its branch table on.
    fn reconstruct_state(&self, execution: &Execution) -> anyhow::Result<PipelineState> {
        let mut state = PipelineState::new(execution.symbol.clone(), execution.user_id, execution.mode);
        let Some(trade_execution) = execution
            .result
            .trade_execution
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
        else {
            anyhow::bail!("pipeline_state snapshot missing and result.trade_execution is unusable");
        };
        state.trade_execution = Some(trade_execution);
        state.strategy = execution
            .result
            .strategy
            .clone()
            .and_then(|v| serde_json::from_value(v).ok());
        state.risk_assessment = execution
            .result
            .risk_assessment
            .clone()
            .and_then(|v| serde_json::from_value(v).ok());
        warn!(execution_id = %execution.execution_id, "pipeline_state snapshot unusable, reconstructed from result");
        Ok(state)
    }
}

fn sync_result(execution: &mut Execution, state: &PipelineState) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::{long_position, FakeBroker};
    use crate::broker::{BrokerService, TradeDetails, TradeState};
    use crate::config::Config;
    use crate::domain::pipeline::BrokerConfig;
    use crate::domain::pipeline_state::TradeExecution;
    use crate::domain::{Mode, Pipeline};
    use crate::notify::NullNotifier;
    use std::time::Duration as StdDur;

    fn test_config() -> Config {
        Config {
            oltp_database_path: ":memory:".into(),
            timeseries_database_path: ":memory:".into(),
            redis_url: "redis://127.0.0.1:6379".into(),
            metrics_port: 9090,
            log_level: "info".into(),
            broker_type: Some("alpaca".into()),
            broker_api_key: Some("key".into()),
            broker_secret_key: Some("secret".into()),
            broker_account_id: Some("acct".into()),
            broker_account_type: "practice".into(),
            tiingo_api_key: None,
            finnhub_api_key: None,
            dispatcher_cache_refresh: StdDur::from_secs(30),
            dispatcher_batch_size: 20,
            dispatcher_batch_timeout: StdDur::from_millis(500),
            default_daily_budget_usd: 25.0,
            default_monthly_budget_usd: 500.0,
        }
    }

    fn pipeline_with_broker() -> Pipeline {
        let mut pipeline = Pipeline::default();
        pipeline.broker_configs = vec![BrokerConfig {
            broker_type: "alpaca".into(),
            account_id: Some("acct".into()),
            account_type: "practice".into(),
        }];
        pipeline
    }

    fn task_with_broker(pipeline: &Pipeline, broker: Arc<dyn BrokerService>) -> (MonitoringTask, Arc<OltpStore>) {
        let store = Arc::new(OltpStore::in_memory().unwrap());
        let brokers = Arc::new(BrokerRegistry::new(test_config()));
        brokers.insert_for_test(&pipeline.broker_configs[0], broker);
        (
            MonitoringTask::new(store.clone(), brokers, Arc::new(NullNotifier)),
            store,
        )
    }

    fn monitoring_execution(store: &OltpStore, pipeline: &Pipeline, trade: TradeExecution) -> Execution {
        let mut state = PipelineState::new("AAPL".to_string(), pipeline.user_id, Mode::Paper);
        state.trade_execution = Some(trade);
        let mut execution = Execution::new_pending(
            pipeline.pipeline_id,
            pipeline.user_id,
            "AAPL".to_string(),
            Mode::Paper,
        );
        execution.status = ExecutionStatus::Monitoring;
        execution.execution_phase = ExecutionPhase::Monitoring;
        execution.started_at = Some(Utc::now());
        execution.pipeline_state = Some(state);
        store.insert_execution(&execution).unwrap();
        execution
    }

    #[tokio::test]
    async fn not_monitoring_status_is_a_no_op() {
        let pipeline = pipeline_with_broker();
        let (task, store) = task_with_broker(&pipeline, Arc::new(FakeBroker::default()));
        store.upsert_pipeline(&pipeline).unwrap();
        let mut execution = Execution::new_pending(
            pipeline.pipeline_id,
            pipeline.user_id,
            "AAPL".to_string(),
            Mode::Paper,
        );
        execution.status = ExecutionStatus::Completed;
        store.insert_execution(&execution).unwrap();

        let result = task.run(execution.execution_id).await;
        assert_eq!(result["status"], "not_monitoring");
    }

    #[tokio::test]
    async fn still_open_position_reschedules_the_next_check() {
        let broker = Arc::new(FakeBroker::default());
        broker
            .state
            .lock()
            .positions
            .insert("AAPL".to_string(), long_position("AAPL", 10.0, 100.0, 101.0));

        let pipeline = pipeline_with_broker();
        let (task, store) = task_with_broker(&pipeline, broker);
        store.upsert_pipeline(&pipeline).unwrap();

        let trade = TradeExecution {
            order_id: Some("o1".into()),
            trade_id: Some("t1".into()),
            status: Some("filled".into()),
            filled_price: Some(100.0),
            last_successful_check: Some(Utc::now()),
            ..Default::default()
        };
        let execution = monitoring_execution(&store, &pipeline, trade);

        let result = task.run(execution.execution_id).await;
        assert_eq!(result["status"], "monitoring");

        let refreshed = store.get_execution(execution.execution_id).unwrap().unwrap();
        assert_eq!(refreshed.status, ExecutionStatus::Monitoring);
        assert!(refreshed.next_check_at.is_some());
    }

    #[tokio::test]
    async fn closed_position_with_broker_confirmation_completes() {
        let broker = Arc::new(FakeBroker::default());
        broker.state.lock().trade_details.insert(
            "t1".to_string(),
            TradeDetails {
                found: true,
                state: TradeState::Closed,
                realized_pl: 150.0,
                unrealized_pl: 0.0,
                close_time: Some(Utc::now()),
                instrument: "AAPL".into(),
                open_price: 100.0,
                close_price: Some(115.0),
                units: 10.0,
                broker_data: serde_json::json!({}),
            },
        );

        let pipeline = pipeline_with_broker();
        let (task, store) = task_with_broker(&pipeline, broker);
        store.upsert_pipeline(&pipeline).unwrap();

        let trade = TradeExecution {
            order_id: Some("o1".into()),
            trade_id: Some("t1".into()),
            status: Some("filled".into()),
            filled_price: Some(100.0),
            filled_quantity: Some(10.0),
            last_successful_check: Some(Utc::now()),
            ..Default::default()
        };
        let execution = monitoring_execution(&store, &pipeline, trade);

        let result = task.run(execution.execution_id).await;
        assert_eq!(result["status"], "completed");

        let refreshed = store.get_execution(execution.execution_id).unwrap().unwrap();
        assert_eq!(refreshed.status, ExecutionStatus::Completed);
        assert!(refreshed.completed_at.is_some());
    }
}
