//! Per-minute reconciliation sweep (spec section 4.7): the safety net that
//! brings a MONITORING/COMMUNICATION_ERROR row back in line with broker
//! reality, either by rescuing an orphaned monitoring chain or by
//! determining the final outcome once the broker no longer shows a
//! position. Broker is always the source of truth here — nothing is ever
//! inferred from cached reports.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, warn};

use crate::broker::registry::BrokerRegistry;
use crate::broker::{BrokerService, TradeState};
use crate::domain::pipeline_state::TradeExecution;
use crate::domain::{Execution, ExecutionStatus};
use crate::eventbus::{Job, JobQueue};
use crate::notify::Notifier;
use crate::store::OltpStore;

const GRACE_PERIOD: Duration = Duration::minutes(3);
const STALE_CHAIN_THRESHOLD: Duration = Duration::minutes(2);
const REQUEUE_DELAY_SECS: i64 = 15;

pub struct ReconciliationTask {
    store: Arc<OltpStore>,
    brokers: Arc<BrokerRegistry>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
}

impl ReconciliationTask {
    pub fn new(
        store: Arc<OltpStore>,
        brokers: Arc<BrokerRegistry>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { store, brokers, queue, notifier }
    }

    /// The master sweep: one call per minute, fanning out across every user
    /// with an active trade. A failure reconciling one user is logged and
    /// skipped rather than aborting the sweep, so one account's broker
    /// outage never blocks every other user's reconciliation.
    pub async fn run_sweep(&self) {
        let users = match self.store.distinct_users_with_status(&[
            ExecutionStatus::Monitoring,
            ExecutionStatus::CommunicationError,
        ]) {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "reconciliation sweep could not list active users");
                return;
            }
        };
        for user_id in users {
            if let Err(e) = self.reconcile_user(user_id).await {
                error!(%user_id, error = %e, "reconciliation failed for user");
            }
        }
    }

    async fn reconcile_user(&self, user_id: uuid::Uuid) -> anyhow::Result<()> {
        let executions = self.store.executions_for_user_with_status(
            user_id,
            &[ExecutionStatus::Monitoring, ExecutionStatus::CommunicationError],
        )?;
        for execution in executions {
            let execution_id = execution.execution_id;
            if let Err(e) = self.reconcile_execution(execution).await {
                warn!(%execution_id, error = %e, "reconciliation failed for execution, will retry next sweep");
            }
        }
        Ok(())
    }

    async fn reconcile_execution(&self, mut execution: Execution) -> anyhow::Result<()> {
        let entered_monitoring = execution.monitoring_started_at.unwrap_or(execution.created_at);
        if Utc::now() - entered_monitoring < GRACE_PERIOD {
            return Ok(());
        }

        let Some(pipeline) = self.store.get_pipeline(execution.pipeline_id)? else {
            execution.mark_needs_reconciliation(Utc::now());
            self.commit(&mut execution)?;
            crate::metrics::inc_reconciliation_outcome("pipeline_missing");
            return Ok(());
        };
        let broker_config = match pipeline.single_broker_config() {
            Ok(Some(cfg)) => cfg,
            Ok(None) => {
                execution.mark_needs_reconciliation(Utc::now());
                self.commit(&mut execution)?;
                crate::metrics::inc_reconciliation_outcome("no_broker_config");
                return Ok(());
            }
            Err(_) => {
                execution.mark_needs_reconciliation(Utc::now());
                self.commit(&mut execution)?;
                crate::metrics::inc_reconciliation_outcome("multiple_brokers_configured");
                return Ok(());
            }
        };
        let broker = self.brokers.resolve(broker_config)?;

        match broker.has_active_symbol(&execution.symbol).await {
            Err(e) => {
                warn!(execution_id = %execution.execution_id, error = %e, "has_active_symbol failed, skipping this row this sweep");
                crate::metrics::inc_reconciliation_outcome("skip_api_error");
                Ok(())
            }
            Ok(true) => self.rescue_if_orphaned(&mut execution),
            Ok(false) => self.reconcile_closed(&mut execution, broker.as_ref()).await,
        }
    }

    /// Broker still shows the position open — the trade is still alive, but
    /// if `next_check_at` has gone stale the worker that owned this
    /// monitoring chain likely crashed. Re-arm it rather than waiting for a
    /// check that will never come.
    fn rescue_if_orphaned(&self, execution: &mut Execution) -> anyhow::Result<()> {
        let stale = execution
            .next_check_at
            .map(|t| Utc::now() - t > STALE_CHAIN_THRESHOLD)
            .unwrap_or(true);
        if !stale {
            crate::metrics::inc_reconciliation_outcome("alive");
            return Ok(());
        }
        let deliver_at = Utc::now() + Duration::seconds(REQUEUE_DELAY_SECS);
        execution.next_check_at = Some(deliver_at);
        self.commit(execution)?;
        self.queue.enqueue(Job {
            execution_id: execution.execution_id,
            pipeline_id: execution.pipeline_id,
            symbol: execution.symbol.clone(),
            mode: execution.mode,
            signal_context: None,
            deliver_at,
        });
        warn!(execution_id = %execution.execution_id, "rescued an orphaned monitoring chain");
        crate::metrics::inc_reconciliation_outcome("rescued_orphan");
        Ok(())
    }

    /// Broker shows no active position. Determine the final outcome using
    /// the broker as sole source of truth — never the cached `trade_execution`
    /// snapshot beyond its `status` field, which only decides whether a P&L
    /// lookup is warranted at all.
    async fn reconcile_closed(&self, execution: &mut Execution, broker: &dyn BrokerService) -> anyhow::Result<()> {
        let trade: Option<TradeExecution> = execution
            .result
            .trade_execution
            .clone()
            .and_then(|v| serde_json::from_value(v).ok());

        let was_filled = matches!(
            trade.as_ref().and_then(|t| t.status.as_deref()),
            Some("filled") | Some("partially_filled")
        );

        if !was_filled {
            execution.result.trade_outcome = Some(serde_json::json!({
                "status": "cancelled",
                "pnl": 0.0,
                "pnl_percent": 0.0,
                "exit_reason": "reconciliation: broker shows no position and the order was never filled",
            }));
            execution.mark_completed(Utc::now());
            self.commit(execution)?;
            self.notify_closed(execution).await;
            crate::metrics::inc_reconciliation_outcome("cancelled");
            return Ok(());
        }

        let trade_id = trade.as_ref().and_then(|t| t.trade_id.clone());
        let order_id = trade.as_ref().and_then(|t| t.order_id.clone());
        match broker.get_trade_details(trade_id.as_deref(), order_id.as_deref()).await {
            Ok(details) if details.found && details.state == TradeState::Closed => {
                let cost_basis = (trade.as_ref().and_then(|t| t.filled_price).unwrap_or(details.open_price)
                    * trade.as_ref().and_then(|t| t.filled_quantity).unwrap_or(details.units))
                .abs()
                .max(1e-9);
                execution.result.trade_outcome = Some(serde_json::json!({
                    "status": "executed",
                    "pnl": details.realized_pl,
                    "pnl_percent": details.realized_pl / cost_basis * 100.0,
                    "exit_reason": "reconciliation: closed by broker",
                    "exit_price": details.close_price,
                    "entry_price": details.open_price,
                    "closed_at": details.close_time,
                }));
                execution.mark_completed(Utc::now());
                self.commit(execution)?;
                self.notify_closed(execution).await;
                crate::metrics::inc_reconciliation_outcome("executed");
                Ok(())
            }
            Ok(details) if details.found && details.state == TradeState::Open => {
                error!(
                    execution_id = %execution.execution_id,
                    "state inconsistency: has_active_symbol says closed but get_trade_details says open"
                );
                execution.mark_needs_reconciliation(Utc::now());
                self.commit(execution)?;
                crate::metrics::inc_reconciliation_outcome("inconsistent_open");
                Ok(())
            }
            Ok(_) | Err(_) => {
                error!(
                    execution_id = %execution.execution_id,
                    "could not confirm a filled trade's close from the broker, flagging for manual reconciliation"
                );
                execution.mark_needs_reconciliation(Utc::now());
                self.commit(execution)?;
                crate::metrics::inc_reconciliation_outcome("needs_reconciliation");
                Ok(())
            }
        }
    }

    async fn notify_closed(&self, execution: &Execution) {
        self.notifier
            .notify(execution.user_id, &format!("{} position closed", execution.symbol))
            .await;
    }

    fn commit(&self, execution: &mut Execution) -> anyhow::Result<()> {
        execution.recompute_cost();
        Ok(self.store.commit_execution(execution)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::{long_position, FakeBroker};
    use crate::config::Config;
    use crate::domain::pipeline::BrokerConfig;
    use crate::domain::{Mode, Pipeline};
    use crate::eventbus::InMemoryJobQueue;
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

    fn task_with_broker(pipeline: &Pipeline, broker: Arc<dyn BrokerService>) -> (ReconciliationTask, Arc<OltpStore>, Arc<InMemoryJobQueue>) {
        let store = Arc::new(OltpStore::in_memory().unwrap());
        let brokers = Arc::new(BrokerRegistry::new(test_config()));
        brokers.insert_for_test(&pipeline.broker_configs[0], broker);
        let queue = Arc::new(InMemoryJobQueue::new());
        (
            ReconciliationTask::new(store.clone(), brokers, queue.clone(), Arc::new(NullNotifier)),
            store,
            queue,
        )
    }

    fn monitoring_execution(store: &OltpStore, pipeline: &Pipeline, trade: TradeExecution, next_check_at: Option<chrono::DateTime<Utc>>) -> Execution {
        let mut execution = Execution::new_pending(
            pipeline.pipeline_id,
            pipeline.user_id,
            "AAPL".to_string(),
            Mode::Paper,
        );
        execution.status = ExecutionStatus::Monitoring;
        execution.monitoring_started_at = Some(Utc::now() - Duration::minutes(10));
        execution.next_check_at = next_check_at;
        execution.result.trade_execution = serde_json::to_value(&trade).ok();
        store.insert_execution(&execution).unwrap();
        execution
    }

    #[tokio::test]
    async fn still_within_grace_period_is_skipped() {
        let pipeline = pipeline_with_broker();
        let (task, store, _queue) = task_with_broker(&pipeline, Arc::new(FakeBroker::default()));
        store.upsert_pipeline(&pipeline).unwrap();

        let mut execution = Execution::new_pending(
            pipeline.pipeline_id,
            pipeline.user_id,
            "AAPL".to_string(),
            Mode::Paper,
        );
        execution.status = ExecutionStatus::Monitoring;
        execution.monitoring_started_at = Some(Utc::now());
        store.insert_execution(&execution).unwrap();

        task.reconcile_execution(execution.clone()).await.unwrap();

        let refreshed = store.get_execution(execution.execution_id).unwrap().unwrap();
        assert_eq!(refreshed.status, ExecutionStatus::Monitoring);
        assert_eq!(refreshed.version, 0);
    }

    #[tokio::test]
    async fn orphaned_chain_is_rescued() {
        let broker = Arc::new(FakeBroker::default());
        broker
            .state
            .lock()
            .positions
            .insert("AAPL".to_string(), long_position("AAPL", 10.0, 100.0, 101.0));

        let pipeline = pipeline_with_broker();
        let (task, store, queue) = task_with_broker(&pipeline, broker);
        store.upsert_pipeline(&pipeline).unwrap();

        let trade = TradeExecution {
            order_id: Some("o1".into()),
            trade_id: Some("t1".into()),
            status: Some("filled".into()),
            ..Default::default()
        };
        let execution = monitoring_execution(&store, &pipeline, trade, Some(Utc::now() - Duration::minutes(5)));

        task.reconcile_execution(execution.clone()).await.unwrap();

        let refreshed = store.get_execution(execution.execution_id).unwrap().unwrap();
        assert_eq!(refreshed.status, ExecutionStatus::Monitoring);
        assert!(refreshed.next_check_at.unwrap() > Utc::now());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn never_filled_order_reconciles_as_cancelled() {
        let pipeline = pipeline_with_broker();
        let (task, store, _queue) = task_with_broker(&pipeline, Arc::new(FakeBroker::default()));
        store.upsert_pipeline(&pipeline).unwrap();

        let trade = TradeExecution {
            order_id: Some("o1".into()),
            status: Some("accepted".into()),
            ..Default::default()
        };
        let execution = monitoring_execution(&store, &pipeline, trade, Some(Utc::now() - Duration::minutes(5)));

        task.reconcile_execution(execution.clone()).await.unwrap();

        let refreshed = store.get_execution(execution.execution_id).unwrap().unwrap();
        assert_eq!(refreshed.status, ExecutionStatus::Completed);
        assert_eq!(refreshed.result.trade_outcome.unwrap()["status"], "cancelled");
    }

    #[tokio::test]
    async fn filled_position_gone_without_confirmation_needs_reconciliation() {
        let pipeline = pipeline_with_broker();
        let (task, store, _queue) = task_with_broker(&pipeline, Arc::new(FakeBroker::default()));
        store.upsert_pipeline(&pipeline).unwrap();

        let trade = TradeExecution {
            order_id: Some("o1".into()),
            trade_id: Some("t1".into()),
            status: Some("filled".into()),
            filled_price: Some(100.0),
            filled_quantity: Some(10.0),
            ..Default::default()
        };
        let execution = monitoring_execution(&store, &pipeline, trade, Some(Utc::now() - Duration::minutes(5)));

        task.reconcile_execution(execution.clone()).await.unwrap();

        let refreshed = store.get_execution(execution.execution_id).unwrap().unwrap();
        assert_eq!(refreshed.status, ExecutionStatus::NeedsReconciliation);
    }
}
