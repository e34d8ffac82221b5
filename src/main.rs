//! Entry point. Boots the shared persistence/cache layer, then spawns
//! whichever subsystems `--role` selects. A single process can run every
//! role for local development; each one is also small enough to deploy
//! standalone behind its own `--role` flag in production.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use axum::{routing::get, Router};
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline_trader::broker::registry::BrokerRegistry;
use pipeline_trader::config::Config;
use pipeline_trader::data_plane::providers::{FinnhubProvider, OandaProvider, TiingoProvider};
use pipeline_trader::data_plane::{AssetClass, DataPlane, MarketCache, PrefetchTask, Provider, RedisCache, TimeseriesStore, UniverseRefresher};
use pipeline_trader::dispatcher::Dispatcher;
use pipeline_trader::eventbus::{EventLog, InMemoryEventLog, InMemoryJobQueue, JobQueue};
use pipeline_trader::executor::agents::{Agent, BiasAgent, MarketDataAgent, RiskManagerAgent, StrategyAgent, TradeManagerAgent};
use pipeline_trader::executor::Executor;
use pipeline_trader::notify::{Notifier, TelegramNotifier};
use pipeline_trader::signal_generator::{SignalGenerator, SignalPublisher};
use pipeline_trader::store::OltpStore;
use pipeline_trader::tasks::housekeeping::HousekeepingTasks;
use pipeline_trader::tasks::monitoring::MonitoringTask;
use pipeline_trader::tasks::reconciliation::ReconciliationTask;

#[derive(Parser, Debug)]
#[command(name = "pipeline-trader")]
struct Cli {
    /// Which subsystem(s) this process runs. Repeat or pick `all` for a
    /// single-process deployment.
    #[arg(long, value_enum, default_value = "all")]
    role: Role,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    All,
    DataPlane,
    SignalGenerator,
    Dispatcher,
    Worker,
    Tasks,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;
    init_tracing(&config.log_level);

    info!(role = ?cli.role, "starting pipeline-trader");

    let store = Arc::new(OltpStore::open(&config.oltp_database_path).context("opening OLTP store")?);
    let timeseries = Arc::new(TimeseriesStore::open(&config.timeseries_database_path).context("opening timeseries store")?);
    let cache: Arc<dyn MarketCache> = Arc::new(RedisCache::new(&config.redis_url).context("connecting to market cache")?);
    let event_log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
    let job_queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
    let brokers = Arc::new(BrokerRegistry::new(config.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(std::env::var("TELEGRAM_BOT_TOKEN").ok()));

    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    if let Some(key) = &config.tiingo_api_key {
        providers.push(Arc::new(TiingoProvider::new(key.clone())));
    }
    if let Some(key) = &config.finnhub_api_key {
        providers.push(Arc::new(FinnhubProvider::new(key.clone())));
    }
    if let (Some(token), Some(broker_type)) = (&config.broker_api_key, &config.broker_type) {
        if broker_type == "oanda" {
            providers.push(Arc::new(OandaProvider::new(token.clone(), config.broker_account_type != "live")));
        }
    }
    if providers.is_empty() {
        warn!("no market data providers configured, quotes and candles will fail");
    }
    let data_plane = Arc::new(DataPlane::new(timeseries.clone(), cache.clone(), store.clone(), providers));

    let mut handles = Vec::new();

    if matches!(cli.role, Role::All | Role::DataPlane) {
        handles.push(tokio::spawn(run_data_plane_loops(data_plane.clone())));
    }

    if matches!(cli.role, Role::All | Role::SignalGenerator) {
        let publisher = SignalPublisher::new(event_log.clone());
        let generator = Arc::new(SignalGenerator::new(data_plane.clone(), publisher));
        for handle in generator.spawn_all() {
            handles.push(handle);
        }
    }

    if matches!(cli.role, Role::All | Role::Dispatcher) {
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            event_log.clone(),
            job_queue.clone(),
            config.dispatcher_cache_refresh,
            config.dispatcher_batch_size,
            config.dispatcher_batch_timeout,
        ));
        dispatcher.refresh_cache().context("priming pipeline cache")?;
        handles.push(tokio::spawn(dispatcher.clone().run_cache_refresh_loop()));
        handles.push(tokio::spawn(
            dispatcher.run_dispatch_loop(Arc::new(parking_lot::RwLock::new(std::collections::HashMap::new()))),
        ));
    }

    if matches!(cli.role, Role::All | Role::Worker) {
        let broker = brokers.resolve_default().context("building default broker")?;
        let mut agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(BiasAgent::new()),
            Arc::new(MarketDataAgent::new(data_plane.clone(), AssetClass::Equity)),
            Arc::new(StrategyAgent::new()),
        ];
        match &broker {
            Some(broker) => {
                agents.push(Arc::new(RiskManagerAgent::new(broker.clone())));
                // `notify_on_trade_executed` is really a per-pipeline setting
                // (see `Pipeline::notify_on_trade_executed`), but the
                // executor builds its agent chain once at startup rather
                // than per pipeline; default to the pipeline default here
                // and rely on the monitoring task's per-pipeline instance
                // for the rest of the trade's life.
                agents.push(Arc::new(TradeManagerAgent::new(broker.clone(), notifier.clone(), false)));
            }
            None => warn!("no broker configured, pipelines using risk_manager_agent/trade_manager_agent will never run those stages"),
        }
        let executor = Arc::new(Executor::new(store.clone(), job_queue.clone(), broker, agents));
        let monitoring = Arc::new(MonitoringTask::new(store.clone(), brokers.clone(), notifier.clone()));
        handles.push(tokio::spawn(run_worker_loop(job_queue.clone(), store.clone(), executor, monitoring)));
    }

    if matches!(cli.role, Role::All | Role::Tasks) {
        let reconciliation = Arc::new(ReconciliationTask::new(
            store.clone(),
            brokers.clone(),
            job_queue.clone(),
            notifier.clone(),
        ));
        handles.push(tokio::spawn(run_reconciliation_loop(reconciliation)));
        let housekeeping = Arc::new(HousekeepingTasks::new(store.clone(), job_queue.clone()));
        handles.push(tokio::spawn(housekeeping.run_all_loops()));
    }

    handles.push(tokio::spawn(run_health_server(config.metrics_port)));
    pipeline_trader::metrics::install_exporter(config.metrics_port).context("installing metrics exporter")?;

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "background task panicked");
        }
    }
    Ok(())
}

async fn run_data_plane_loops(data_plane: Arc<DataPlane>) {
    let prefetch = PrefetchTask::new(data_plane.timeseries.clone(), data_plane.cache.clone(), Vec::new());
    let universe = UniverseRefresher::new(data_plane.store.clone(), data_plane.cache.clone());
    let mut minute_ticker = tokio::time::interval(StdDuration::from_secs(60));
    loop {
        minute_ticker.tick().await;
        if let Err(e) = universe.refresh().await {
            warn!(error = %e, "universe refresh failed");
        }
        if let Err(e) = prefetch.run_minute_cycle().await {
            warn!(error = %e, "minute prefetch cycle failed");
        }
    }
}

/// Pulls every job whose `deliver_at` has arrived and routes it to whichever
/// harness owns its execution's current status: the executor for anything
/// not yet holding a broker position, the monitoring task for anything that
/// is. `holds_active_trade` is the same predicate the executor's own
/// preflight check uses, so the two can never disagree about which rows are
/// "in monitoring".
async fn run_worker_loop(
    queue: Arc<dyn JobQueue>,
    store: Arc<OltpStore>,
    executor: Arc<Executor>,
    monitoring: Arc<MonitoringTask>,
) {
    let mut ticker = tokio::time::interval(StdDuration::from_millis(500));
    loop {
        ticker.tick().await;
        for job in queue.drain_ready(chrono::Utc::now()) {
            let store = store.clone();
            let executor = executor.clone();
            let monitoring = monitoring.clone();
            tokio::spawn(async move {
                let status = match store.get_execution(job.execution_id) {
                    Ok(Some(execution)) => execution.status,
                    Ok(None) => {
                        warn!(execution_id = %job.execution_id, "job references a missing execution, dropping");
                        return;
                    }
                    Err(e) => {
                        warn!(execution_id = %job.execution_id, error = %e, "could not load execution for job");
                        return;
                    }
                };
                if status.holds_active_trade() {
                    monitoring.run(job.execution_id).await;
                } else if let Err(e) = executor.run(job).await {
                    error!(error = %e, "executor run failed");
                }
            });
        }
    }
}

async fn run_reconciliation_loop(task: Arc<ReconciliationTask>) {
    let mut ticker = tokio::time::interval(StdDuration::from_secs(60));
    loop {
        ticker.tick().await;
        task.run_sweep().await;
    }
}

async fn run_health_server(port: u16) {
    let app = Router::new().route("/health", get(|| async { "ok" }));
    let addr = format!("0.0.0.0:{}", port.wrapping_add(1));
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr, "failed to bind health server");
            return;
        }
    };
    info!(addr, "health server listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "health server exited");
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_string()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
