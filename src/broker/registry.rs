//! Caches broker client instances by account key so the reconciliation task
//! doesn't rebuild an HTTP client per execution it walks. Config today only
//! carries one set of credentials per broker type (see `Config`), so in
//! practice every pipeline sharing a `broker_type` resolves to the same
//! cached instance; the cache key still matches the full triple the
//! reconciliation sweep keys off of so a future multi-account config only
//! has to change `build`, not the caching discipline.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::domain::pipeline::BrokerConfig;
use crate::error::BrokerError;

use super::alpaca::AlpacaBroker;
use super::oanda::OandaBroker;
use super::tradier::TradierBroker;
use super::BrokerService;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BrokerKey {
    broker_type: String,
    account_id: Option<String>,
    account_type: String,
}

impl From<&BrokerConfig> for BrokerKey {
    fn from(c: &BrokerConfig) -> Self {
        Self {
            broker_type: c.broker_type.clone(),
            account_id: c.account_id.clone(),
            account_type: c.account_type.clone(),
        }
    }
}

pub struct BrokerRegistry {
    config: Config,
    cache: Mutex<HashMap<BrokerKey, Arc<dyn BrokerService>>>,
}

impl BrokerRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached broker for this key, building and caching one on
    /// first use. `account_type` values other than `"live"` are treated as
    /// practice/paper, matching every concrete broker's own `practice: bool`
    /// constructor argument.
    pub fn resolve(&self, broker_config: &BrokerConfig) -> Result<Arc<dyn BrokerService>, BrokerError> {
        let key = BrokerKey::from(broker_config);
        if let Some(existing) = self.cache.lock().get(&key) {
            return Ok(existing.clone());
        }
        let broker = self.build(&key)?;
        self.cache.lock().insert(key, broker.clone());
        Ok(broker)
    }

    /// Builds the single broker implied directly by `Config`'s own
    /// `broker_*` fields, for callers that need one broker up front (the
    /// executor's fixed agent chain) rather than resolving lazily per
    /// pipeline. `None` when no broker is configured at all. Shares the
    /// same cache as `resolve`, so a pipeline whose `broker_config` matches
    /// these fields gets the identical cached instance.
    pub fn resolve_default(&self) -> Result<Option<Arc<dyn BrokerService>>, BrokerError> {
        let Some(broker_type) = self.config.broker_type.clone() else {
            return Ok(None);
        };
        let key = BrokerKey {
            broker_type,
            account_id: self.config.broker_account_id.clone(),
            account_type: self.config.broker_account_type.clone(),
        };
        if let Some(existing) = self.cache.lock().get(&key) {
            return Ok(Some(existing.clone()));
        }
        let broker = self.build(&key)?;
        self.cache.lock().insert(key, broker.clone());
        Ok(Some(broker))
    }

    /// Seeds the cache directly, bypassing `build`, so tests can plug in a
    /// fake broker without a real account type string routing through it.
    #[cfg(test)]
    pub fn insert_for_test(&self, broker_config: &BrokerConfig, broker: Arc<dyn BrokerService>) {
        self.cache.lock().insert(BrokerKey::from(broker_config), broker);
    }

    fn build(&self, key: &BrokerKey) -> Result<Arc<dyn BrokerService>, BrokerError> {
        let practice = key.account_type != "live";
        match key.broker_type.as_str() {
            "alpaca" => {
                let api_key = self.config.broker_api_key.clone().ok_or(BrokerError::NotConfigured)?;
                let secret_key = self.config.broker_secret_key.clone().ok_or(BrokerError::NotConfigured)?;
                Ok(Arc::new(AlpacaBroker::new(api_key, secret_key, practice)))
            }
            "oanda" => {
                let api_token = self.config.broker_api_key.clone().ok_or(BrokerError::NotConfigured)?;
                let account_id = key.account_id.clone().ok_or(BrokerError::NotConfigured)?;
                Ok(Arc::new(OandaBroker::new(api_token, account_id, practice)))
            }
            "tradier" => {
                let access_token = self.config.broker_api_key.clone().ok_or(BrokerError::NotConfigured)?;
                let account_id = key.account_id.clone().ok_or(BrokerError::NotConfigured)?;
                Ok(Arc::new(TradierBroker::new(access_token, account_id, practice)))
            }
            other => Err(BrokerError::UnexpectedPayload(format!("unknown broker type: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_creds() -> Config {
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
            dispatcher_cache_refresh: std::time::Duration::from_secs(30),
            dispatcher_batch_size: 20,
            dispatcher_batch_timeout: std::time::Duration::from_millis(500),
            default_daily_budget_usd: 25.0,
            default_monthly_budget_usd: 500.0,
        }
    }

    #[test]
    fn resolves_and_caches_the_same_instance() {
        let registry = BrokerRegistry::new(config_with_creds());
        let broker_config = BrokerConfig {
            broker_type: "alpaca".into(),
            account_id: Some("acct".into()),
            account_type: "practice".into(),
        };
        let first = registry.resolve(&broker_config).unwrap();
        let second = registry.resolve(&broker_config).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unknown_broker_type_errors() {
        let registry = BrokerRegistry::new(config_with_creds());
        let broker_config = BrokerConfig {
            broker_type: "unknown".into(),
            account_id: None,
            account_type: "practice".into(),
        };
        assert!(registry.resolve(&broker_config).is_err());
    }
}
