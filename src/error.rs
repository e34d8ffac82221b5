//! Typed domain errors. Each subsystem gets its own enum; callers that need
//! to cross a subsystem boundary collapse into `anyhow::Error` rather than a
//! god enum, keeping `anyhow::{Context, Result}` at service boundaries and
//! `thiserror` enums at module boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("more than one broker tool configured")]
    MultipleBrokersConfigured,
    #[error("no broker configured")]
    NotConfigured,
    #[error("broker API error: {0}")]
    Api(String),
    #[error("broker request timed out")]
    Timeout,
    #[error("broker returned an unexpected payload: {0}")]
    UnexpectedPayload(String),
}

#[derive(Debug, Error)]
pub enum DataPlaneError {
    #[error("provider {provider} failed after {attempts} attempts: {source}")]
    ProviderExhausted {
        provider: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("no provider covers asset class {0:?}")]
    NoProviderForAssetClass(String),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("timeseries store error: {0}")]
    Timeseries(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache miss")]
    Miss,
}

/// Agent failure categories, modeled as a typed enum instead of string
/// matching. `Other` preserves the message for non-critical agent failures
/// that are logged and the pipeline continues.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("agent processing error: {0}")]
    AgentProcessing(String),
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("authentication error: {0}")]
    Authentication(String),
    #[error("trigger not met: {0}")]
    TriggerNotMet(String),
    #[error("agent exceeded its time budget")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Whether this error must abort the execution regardless of which
    /// agent raised it.
    pub fn is_always_critical(&self) -> bool {
        matches!(
            self,
            AgentError::InsufficientData(_)
                | AgentError::BudgetExceeded(_)
                | AgentError::Authentication(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("optimistic concurrency conflict on {entity} {id} (expected version {expected})")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: i64,
    },
    #[error("row not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },
}
