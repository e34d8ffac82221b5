use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H4,
    D,
    W,
    M,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D => "D",
            Timeframe::W => "W",
            Timeframe::M => "M",
        }
    }

    /// Bucket width in whole minutes, used to compute the aggregate bucket a
    /// 1-minute candle rolls up into. Weekly/monthly buckets are handled
    /// separately since they are not fixed-width.
    pub fn minutes(&self) -> Option<i64> {
        match self {
            Timeframe::M1 => Some(1),
            Timeframe::M5 => Some(5),
            Timeframe::M15 => Some(15),
            Timeframe::H1 => Some(60),
            Timeframe::H4 => Some(240),
            Timeframe::D => Some(1440),
            Timeframe::W | Timeframe::M => None,
        }
    }

    /// Timeframes materialized as continuous aggregates from `ohlcv_1m`.
    pub fn materialized() -> &'static [Timeframe] {
        &[
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D,
        ]
    }
}

/// `(ticker, timeframe, timestamp, open, high, low, close, volume)`.
/// Primary key is `(ticker, timeframe, timestamp)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Fold a non-empty, chronologically ordered slice of 1-minute candles
    /// into one aggregate bar (open = first, high = max, low = min,
    /// close = last, volume = sum).
    pub fn aggregate(bucket_start: DateTime<Utc>, minute_bars: &[Candle]) -> Option<Candle> {
        let first = minute_bars.first()?;
        let last = minute_bars.last()?;
        let high = minute_bars
            .iter()
            .map(|c| c.high)
            .fold(f64::NEG_INFINITY, f64::max);
        let low = minute_bars
            .iter()
            .map(|c| c.low)
            .fold(f64::INFINITY, f64::min);
        let volume = minute_bars.iter().map(|c| c.volume).sum();
        Some(Candle {
            timestamp: bucket_start,
            open: first.open,
            high,
            low,
            close: last.close,
            volume,
        })
    }
}
