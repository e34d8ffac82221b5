//! Periodic maintenance jobs (spec section 4.8): scheduling periodic-mode
//! pipelines, force-failing stuck rows, pruning old terminal executions,
//! and resetting daily budgets. Each runs on its own cadence from
//! `run_all_loops`; none of them share state, so a slow run of one never
//! blocks another.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{info, warn};

use crate::domain::{Execution, ExecutionStatus, Mode, Pipeline};
use crate::eventbus::{Job, JobQueue};
use crate::store::OltpStore;

const STALE_EXECUTION_MAX_AGE_MINUTES: i64 = 20;
const TERMINAL_EXECUTION_MAX_AGE_DAYS: i64 = 30;

pub struct HousekeepingTasks {
    store: Arc<OltpStore>,
    queue: Arc<dyn JobQueue>,
}

impl HousekeepingTasks {
    pub fn new(store: Arc<OltpStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    pub async fn run_all_loops(self: Arc<Self>) {
        let scheduler = self.clone();
        let stale = self.clone();
        let pruner = self.clone();
        let budgets = self.clone();
        tokio::join!(
            scheduler.run_loop(StdDuration::from_secs(60), Self::check_scheduled_pipelines),
            stale.run_loop(StdDuration::from_secs(60), Self::cleanup_stale_running_executions),
            pruner.run_loop(StdDuration::from_secs(86_400), Self::cleanup_old_executions),
            budgets.run_loop(StdDuration::from_secs(86_400), Self::reset_daily_budgets),
        );
    }

    async fn run_loop(self: Arc<Self>, period: StdDuration, task: fn(&Self) -> anyhow::Result<()>) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = task(&self) {
                warn!(error = %e, "housekeeping task failed");
            }
        }
    }

    /// Enqueues every active periodic-mode pipeline whose interval has
    /// elapsed and that has no in-flight execution. Mirrors the dispatcher's
    /// pending-row-then-enqueue sequencing so a crash between the two never
    /// loses the job silently.
    fn check_scheduled_pipelines(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        for pipeline in self.store.due_periodic_pipelines(now)? {
            if self.has_in_flight_execution(&pipeline)? {
                continue;
            }
            self.enqueue_periodic_run(&pipeline)?;
        }
        Ok(())
    }

    fn has_in_flight_execution(&self, pipeline: &Pipeline) -> anyhow::Result<bool> {
        let active = self.store.active_for_pipeline(
            pipeline.pipeline_id,
            &[
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Monitoring,
                ExecutionStatus::CommunicationError,
                ExecutionStatus::AwaitingApproval,
            ],
        )?;
        Ok(!active.is_empty())
    }

    fn enqueue_periodic_run(&self, pipeline: &Pipeline) -> anyhow::Result<()> {
        // Symbol is left blank; the executor resolves it from the
        // pipeline's scanner at dispatch time.
        let execution = Execution::new_pending(pipeline.pipeline_id, pipeline.user_id, String::new(), Mode::Paper);
        let execution_id = execution.execution_id;
        self.store.insert_execution(&execution)?;
        self.queue.enqueue(Job {
            execution_id,
            pipeline_id: pipeline.pipeline_id,
            symbol: String::new(),
            mode: Mode::Paper,
            signal_context: None,
            deliver_at: Utc::now(),
        });
        crate::metrics::inc_dispatcher_jobs_enqueued();
        Ok(())
    }

    /// Force-fails any RUNNING/PENDING row whose age exceeds the stale
    /// threshold, so one stuck worker can't block a pipeline from ever
    /// being dispatched again.
    fn cleanup_stale_running_executions(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - chrono::Duration::minutes(STALE_EXECUTION_MAX_AGE_MINUTES);
        let stale = self.store.stale_running_executions(cutoff)?;
        for mut execution in stale {
            warn!(execution_id = %execution.execution_id, "force-failing stale execution");
            execution.mark_failed(Utc::now(), "stale-auto-failed: exceeded max running age");
            self.store.commit_execution(&mut execution)?;
        }
        Ok(())
    }

    fn cleanup_old_executions(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - chrono::Duration::days(TERMINAL_EXECUTION_MAX_AGE_DAYS);
        let deleted = self.store.delete_old_terminal_executions(cutoff)?;
        if deleted > 0 {
            info!(deleted, "pruned old terminal executions");
        }
        Ok(())
    }

    fn reset_daily_budgets(&self) -> anyhow::Result<()> {
        let reset = self.store.reset_stale_daily_budgets(Utc::now())?;
        if reset > 0 {
            info!(reset, "reset stale daily budgets");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TriggerMode;
    use crate::eventbus::InMemoryJobQueue;

    fn periodic_pipeline() -> Pipeline {
        let mut pipeline = Pipeline::default();
        pipeline.trigger_mode = TriggerMode::Periodic;
        pipeline.interval_minutes = 5.0;
        pipeline
    }

    #[test]
    fn due_pipeline_with_no_in_flight_execution_gets_enqueued() {
        let store = Arc::new(OltpStore::in_memory().unwrap());
        let queue = Arc::new(InMemoryJobQueue::new());
        let pipeline = periodic_pipeline();
        store.upsert_pipeline(&pipeline).unwrap();
        let tasks = HousekeepingTasks::new(store.clone(), queue.clone());

        tasks.check_scheduled_pipelines().unwrap();

        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn due_pipeline_with_in_flight_execution_is_skipped() {
        let store = Arc::new(OltpStore::in_memory().unwrap());
        let queue = Arc::new(InMemoryJobQueue::new());
        let pipeline = periodic_pipeline();
        store.upsert_pipeline(&pipeline).unwrap();
        let mut existing = Execution::new_pending(pipeline.pipeline_id, pipeline.user_id, "AAPL".into(), Mode::Paper);
        existing.status = ExecutionStatus::Running;
        store.insert_execution(&existing).unwrap();
        let tasks = HousekeepingTasks::new(store.clone(), queue.clone());

        tasks.check_scheduled_pipelines().unwrap();

        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn stale_running_execution_is_force_failed() {
        let store = Arc::new(OltpStore::in_memory().unwrap());
        let queue = Arc::new(InMemoryJobQueue::new());
        let mut execution = Execution::new_pending(uuid::Uuid::new_v4(), uuid::Uuid::new_v4(), "AAPL".into(), Mode::Paper);
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now() - chrono::Duration::minutes(30));
        store.insert_execution(&execution).unwrap();
        let tasks = HousekeepingTasks::new(store.clone(), queue);

        tasks.cleanup_stale_running_executions().unwrap();

        let refreshed = store.get_execution(execution.execution_id).unwrap().unwrap();
        assert_eq!(refreshed.status, ExecutionStatus::Failed);
    }
}
