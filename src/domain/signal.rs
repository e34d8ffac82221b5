use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Detector output type. New detectors add a variant here and a matching
/// arm in [`crate::signal_generator::detectors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    GoldenCross,
    BreakOfStructureBullish,
    BreakOfStructureBearish,
    LiquidityGrab,
    FvgFormation,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::GoldenCross => "golden_cross",
            SignalType::BreakOfStructureBullish => "break_of_structure_bullish",
            SignalType::BreakOfStructureBearish => "break_of_structure_bearish",
            SignalType::LiquidityGrab => "liquidity_grab",
            SignalType::FvgFormation => "fvg_formation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

/// One `(ticker, bias, confidence, reasoning)` entry inside a broadcast
/// signal. `confidence` is in `[0, 100]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalTickerEntry {
    pub ticker: String,
    pub signal: Bias,
    pub confidence: f64,
    pub reasoning: String,
}

/// A broadcast event carrying detector output over one or more tickers.
/// Content-addressed by `signal_id` — duplicates in the log are benign, the
/// dispatcher's matching pass is idempotent per ticker/pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: Uuid,
    pub signal_type: SignalType,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub tickers: Vec<SignalTickerEntry>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Signal {
    pub fn new(signal_type: SignalType, source: impl Into<String>) -> Self {
        Self {
            signal_id: Uuid::new_v4(),
            signal_type,
            source: source.into(),
            timestamp: Utc::now(),
            tickers: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// The union of distinct ticker symbols carried by this signal.
    pub fn ticker_symbols(&self) -> impl Iterator<Item = &str> {
        self.tickers.iter().map(|t| t.ticker.as_str())
    }

    pub fn max_confidence_for(&self, tickers: &[String]) -> Option<f64> {
        self.tickers
            .iter()
            .filter(|entry| tickers.iter().any(|t| t == &entry.ticker))
            .map(|entry| entry.confidence)
            .fold(None, |acc, c| Some(acc.map_or(c, |a: f64| a.max(c))))
    }

    /// Routing override: `metadata.ticker_pipelines[ticker] -> [pipeline_id, ...]`.
    /// Returns `None` when no override is present for this ticker (meaning:
    /// ordinary matching applies), `Some(ids)` (possibly empty) otherwise.
    pub fn routing_override_for(&self, ticker: &str) -> Option<Vec<Uuid>> {
        let routing = self.metadata.get("ticker_pipelines")?.as_object()?;
        let entries = routing.get(ticker)?.as_array()?;
        Some(
            entries
                .iter()
                .filter_map(|v| v.get("pipeline_id").and_then(|p| p.as_str()))
                .filter_map(|s| Uuid::parse_str(s).ok())
                .collect(),
        )
    }
}
