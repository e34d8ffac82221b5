//! Trigger dispatcher: matches published signals against the pipeline
//! cache, suppresses duplicates against already in-flight executions, and
//! enqueues one job per surviving `(pipeline_id, ticker)` pair.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{Execution, ExecutionStatus, Mode, Pipeline, Scanner, Signal, SignalType};
use crate::eventbus::{EventLog, Job, JobQueue};
use crate::store::OltpStore;

#[derive(Debug, Clone)]
struct CachedPipeline {
    pipeline: Pipeline,
    scanner: Option<Scanner>,
}

/// Refreshed on `cache_refresh` cadence; a stale cache only means a newly
/// created pipeline takes up to one refresh cycle to start receiving
/// signals, not that matching behaves incorrectly in the meantime.
#[derive(Default)]
struct PipelineCache {
    by_id: HashMap<Uuid, CachedPipeline>,
}

pub struct Dispatcher {
    store: Arc<OltpStore>,
    log: Arc<dyn EventLog>,
    queue: Arc<dyn JobQueue>,
    cache: RwLock<PipelineCache>,
    cache_refresh: Duration,
    batch_size: usize,
    batch_timeout: Duration,
}

const ALL_SIGNAL_TYPES: &[SignalType] = &[
    SignalType::GoldenCross,
    SignalType::BreakOfStructureBullish,
    SignalType::BreakOfStructureBearish,
    SignalType::LiquidityGrab,
    SignalType::FvgFormation,
];

impl Dispatcher {
    pub fn new(
        store: Arc<OltpStore>,
        log: Arc<dyn EventLog>,
        queue: Arc<dyn JobQueue>,
        cache_refresh: Duration,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            log,
            queue,
            cache: RwLock::new(PipelineCache::default()),
            cache_refresh,
            batch_size,
            batch_timeout,
        }
    }

    pub fn refresh_cache(&self) -> anyhow::Result<()> {
        let pipelines = self.store.active_signal_pipelines()?;
        let mut by_id = HashMap::with_capacity(pipelines.len());
        for pipeline in pipelines {
            let scanner = match pipeline.scanner_id {
                Some(scanner_id) => self.store.get_scanner(scanner_id)?,
                None => None,
            };
            by_id.insert(pipeline.pipeline_id, CachedPipeline { pipeline, scanner });
        }
        *self.cache.write() = PipelineCache { by_id };
        Ok(())
    }

    pub async fn run_cache_refresh_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cache_refresh);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh_cache() {
                tracing::warn!(error = %e, "pipeline cache refresh failed");
            }
        }
    }

    /// One dispatch pass: poll every signal-type partition for offset
    /// progress, batch what's new, match, suppress, enqueue. Offsets
    /// advance only after a successful flush so a mid-batch crash
    /// re-delivers rather than silently drops signals.
    pub async fn run_dispatch_loop(self: Arc<Self>, offsets: Arc<RwLock<HashMap<SignalType, usize>>>) {
        loop {
            let batch_deadline = tokio::time::Instant::now() + self.batch_timeout;
            let mut batch = Vec::new();
            let mut pending_offsets = Vec::new();

            for &signal_type in ALL_SIGNAL_TYPES {
                let offset = *offsets.read().get(&signal_type).unwrap_or(&0);
                let (signals, next_offset) = self.log.poll(signal_type, offset);
                if !signals.is_empty() {
                    pending_offsets.push((signal_type, next_offset));
                    batch.extend(signals);
                }
                if batch.len() >= self.batch_size {
                    break;
                }
            }

            if !batch.is_empty() {
                match self.process_batch(&batch).await {
                    Ok(()) => {
                        let mut offsets = offsets.write();
                        for (signal_type, next_offset) in pending_offsets {
                            offsets.insert(signal_type, next_offset);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dispatch batch processing failed, offsets held back for redelivery");
                    }
                }
            }

            tokio::time::sleep_until(batch_deadline).await;
        }
    }

    async fn process_batch(&self, signals: &[Signal]) -> anyhow::Result<()> {
        for signal in signals {
            self.dispatch_signal(signal)?;
        }
        Ok(())
    }

    fn dispatch_signal(&self, signal: &Signal) -> anyhow::Result<()> {
        let cache = self.cache.read();
        for ticker_entry in &signal.tickers {
            let candidates = self.candidates_for_ticker(&cache, signal, &ticker_entry.ticker);
            for pipeline in candidates {
                if self.has_in_flight_execution(pipeline.pipeline_id, &ticker_entry.ticker)? {
                    crate::metrics::inc_dispatcher_duplicate_suppressed();
                    continue;
                }
                self.enqueue_job(pipeline, signal, &ticker_entry.ticker);
            }
        }
        Ok(())
    }

    fn candidates_for_ticker<'a>(
        &self,
        cache: &'a PipelineCache,
        signal: &Signal,
        ticker: &str,
    ) -> Vec<&'a Pipeline> {
        if let Some(overridden_ids) = signal.routing_override_for(ticker) {
            return cache
                .by_id
                .values()
                .map(|c| &c.pipeline)
                .filter(|p| overridden_ids.contains(&p.pipeline_id))
                .collect();
        }

        let confidence = signal.max_confidence_for(&[ticker.to_string()]).unwrap_or(0.0);
        cache
            .by_id
            .values()
            .filter(|c| {
                let scanner_matches = match &c.scanner {
                    Some(s) => s.contains(ticker),
                    None => true,
                };
                scanner_matches
                    && (c.pipeline.subscriptions.is_empty()
                        || c.pipeline.subscription_for(signal.signal_type).is_some_and(|sub| {
                            confidence >= sub.min_confidence.unwrap_or(0.0)
                        }))
            })
            .map(|c| &c.pipeline)
            .collect()
    }

    fn has_in_flight_execution(&self, pipeline_id: Uuid, symbol: &str) -> anyhow::Result<bool> {
        let active = self.store.active_for_pipeline_symbol(
            pipeline_id,
            symbol,
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

    fn enqueue_job(&self, pipeline: &Pipeline, signal: &Signal, ticker: &str) {
        let execution = Execution::new_pending(pipeline.pipeline_id, pipeline.user_id, ticker.to_string(), Mode::Paper);
        let execution_id = execution.execution_id;
        if let Err(e) = self.store.insert_execution(&execution) {
            tracing::warn!(error = %e, "failed to record pending execution before enqueue");
            return;
        }
        self.queue.enqueue(Job {
            execution_id,
            pipeline_id: pipeline.pipeline_id,
            symbol: ticker.to_string(),
            mode: Mode::Paper,
            signal_context: Some(serde_json::to_value(signal).unwrap_or(serde_json::json!({}))),
            deliver_at: chrono::Utc::now(),
        });
        crate::metrics::inc_dispatcher_jobs_enqueued();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SignalTickerEntry, TriggerMode};
    use crate::eventbus::{InMemoryEventLog, InMemoryJobQueue};

    fn pipeline_subscribed_to(signal_type: SignalType, user_id: Uuid) -> Pipeline {
        let mut p = Pipeline::default();
        p.user_id = user_id;
        p.trigger_mode = TriggerMode::Signal;
        p.subscriptions = vec![crate::domain::SignalSubscription {
            signal_type,
            min_confidence: Some(50.0),
        }];
        p
    }

    #[tokio::test]
    async fn enqueues_job_for_matching_subscription() {
        let store = Arc::new(OltpStore::in_memory().unwrap());
        let log = Arc::new(InMemoryEventLog::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            log.clone(),
            queue.clone(),
            Duration::from_secs(30),
            20,
            Duration::from_millis(500),
        ));

        let pipeline = pipeline_subscribed_to(SignalType::GoldenCross, Uuid::new_v4());
        store.upsert_pipeline(&pipeline).unwrap();
        dispatcher.refresh_cache().unwrap();

        let mut signal = Signal::new(SignalType::GoldenCross, "test");
        signal.tickers.push(SignalTickerEntry {
            ticker: "AAPL".to_string(),
            signal: crate::domain::Bias::Bullish,
            confidence: 80.0,
            reasoning: "test".to_string(),
        });

        dispatcher.dispatch_signal(&signal).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn suppresses_duplicate_when_execution_already_active() {
        let store = Arc::new(OltpStore::in_memory().unwrap());
        let log = Arc::new(InMemoryEventLog::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            log.clone(),
            queue.clone(),
            Duration::from_secs(30),
            20,
            Duration::from_millis(500),
        ));

        let pipeline = pipeline_subscribed_to(SignalType::GoldenCross, Uuid::new_v4());
        store.upsert_pipeline(&pipeline).unwrap();
        dispatcher.refresh_cache().unwrap();

        let mut existing = Execution::new_pending(pipeline.pipeline_id, pipeline.user_id, "AAPL".to_string(), Mode::Paper);
        existing.status = ExecutionStatus::Running;
        store.insert_execution(&existing).unwrap();

        let mut signal = Signal::new(SignalType::GoldenCross, "test");
        signal.tickers.push(SignalTickerEntry {
            ticker: "AAPL".to_string(),
            signal: crate::domain::Bias::Bullish,
            confidence: 80.0,
            reasoning: "test".to_string(),
        });

        dispatcher.dispatch_signal(&signal).unwrap();
        assert_eq!(queue.len(), 0);
    }
}
