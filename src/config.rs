//! Environment-provided configuration. No secrets are hard-coded here; every
//! field is read from the environment with a sane fallback for local dev.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub oltp_database_path: String,
    pub timeseries_database_path: String,
    pub redis_url: String,
    pub metrics_port: u16,
    pub log_level: String,

    pub broker_type: Option<String>,
    pub broker_api_key: Option<String>,
    pub broker_secret_key: Option<String>,
    pub broker_account_id: Option<String>,
    pub broker_account_type: String,

    pub tiingo_api_key: Option<String>,
    pub finnhub_api_key: Option<String>,

    pub dispatcher_cache_refresh: Duration,
    pub dispatcher_batch_size: usize,
    pub dispatcher_batch_timeout: Duration,

    pub default_daily_budget_usd: f64,
    pub default_monthly_budget_usd: f64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let oltp_database_path = env_or("OLTP_DATABASE_PATH", "./pipeline_trader_oltp.db");
        let timeseries_database_path =
            env_or("TIMESERIES_DATABASE_PATH", "./pipeline_trader_ts.db");
        let redis_url = env_or("REDIS_URL", "redis://127.0.0.1:6379");
        let metrics_port = env_or("METRICS_PORT", "9090").parse().unwrap_or(9090);
        let log_level = env_or("RUST_LOG", "info");

        let broker_type = std::env::var("BROKER_TYPE").ok();
        let broker_api_key = std::env::var("BROKER_API_KEY").ok();
        let broker_secret_key = std::env::var("BROKER_SECRET_KEY").ok();
        let broker_account_id = std::env::var("BROKER_ACCOUNT_ID").ok();
        let broker_account_type = env_or("BROKER_ACCOUNT_TYPE", "practice");

        let tiingo_api_key = std::env::var("TIINGO_API_KEY").ok();
        let finnhub_api_key = std::env::var("FINNHUB_API_KEY").ok();

        let dispatcher_cache_refresh =
            Duration::from_secs(env_or("DISPATCHER_CACHE_REFRESH_SECS", "30").parse().unwrap_or(30));
        let dispatcher_batch_size = env_or("DISPATCHER_BATCH_SIZE", "20").parse().unwrap_or(20);
        let dispatcher_batch_timeout =
            Duration::from_millis(env_or("DISPATCHER_BATCH_TIMEOUT_MS", "500").parse().unwrap_or(500));

        let default_daily_budget_usd = env_or("DEFAULT_DAILY_BUDGET_USD", "25.0")
            .parse()
            .unwrap_or(25.0);
        let default_monthly_budget_usd = env_or("DEFAULT_MONTHLY_BUDGET_USD", "500.0")
            .parse()
            .unwrap_or(500.0);

        Ok(Self {
            oltp_database_path,
            timeseries_database_path,
            redis_url,
            metrics_port,
            log_level,
            broker_type,
            broker_api_key,
            broker_secret_key,
            broker_account_id,
            broker_account_type,
            tiingo_api_key,
            finnhub_api_key,
            dispatcher_cache_refresh,
            dispatcher_batch_size,
            dispatcher_batch_timeout,
            default_daily_budget_usd,
            default_monthly_budget_usd,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
