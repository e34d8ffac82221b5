//! Liquidity grab detector: a wick that pierces a prior extreme and closes
//! back inside the prior range, indicating stops were swept before a
//! reversal. Looks only at the most recent bar against the preceding
//! `lookback` bars.

use crate::domain::{Bias, Candle, SignalTickerEntry};

#[derive(Debug, Clone, Copy)]
pub struct LiquidityGrabConfig {
    pub lookback: usize,
    pub min_wick_ratio: f64,
}

impl Default for LiquidityGrabConfig {
    fn default() -> Self {
        Self {
            lookback: 20,
            min_wick_ratio: 0.5,
        }
    }
}

pub fn detect(ticker: &str, candles: &[Candle], config: LiquidityGrabConfig) -> Option<SignalTickerEntry> {
    if candles.len() < config.lookback + 1 {
        return None;
    }
    let latest = candles.last()?;
    let prior = &candles[candles.len() - 1 - config.lookback..candles.len() - 1];

    let prior_high = prior.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let prior_low = prior.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);

    let body = (latest.close - latest.open).abs().max(1e-9);
    let range = (latest.high - latest.low).max(1e-9);

    // Swept above prior high, then closed back below it.
    if latest.high > prior_high && latest.close < prior_high {
        let upper_wick = latest.high - latest.open.max(latest.close);
        if upper_wick / range >= config.min_wick_ratio && upper_wick > body {
            return Some(SignalTickerEntry {
                ticker: ticker.to_string(),
                signal: Bias::Bearish,
                confidence: 60.0,
                reasoning: format!("swept liquidity above {prior_high:.4} then rejected"),
            });
        }
    }

    // Swept below prior low, then closed back above it.
    if latest.low < prior_low && latest.close > prior_low {
        let lower_wick = latest.open.min(latest.close) - latest.low;
        if lower_wick / range >= config.min_wick_ratio && lower_wick > body {
            return Some(SignalTickerEntry {
                ticker: ticker.to_string(),
                signal: Bias::Bullish,
                confidence: 60.0,
                reasoning: format!("swept liquidity below {prior_low:.4} then rejected"),
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: Utc::now(),
            open,
            high,
            low,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn detects_bullish_liquidity_grab() {
        let config = LiquidityGrabConfig {
            lookback: 5,
            min_wick_ratio: 0.3,
        };
        let mut candles: Vec<Candle> = (0..5).map(|_| bar(100.0, 101.0, 99.0, 100.0)).collect();
        // Wicks to 95 (below prior low of 99) then closes back at 100.2.
        candles.push(bar(100.0, 100.5, 95.0, 100.2));
        let result = detect("AAPL", &candles, config);
        assert!(result.is_some());
        assert_eq!(result.unwrap().signal, Bias::Bullish);
    }

    #[test]
    fn no_signal_inside_range() {
        let config = LiquidityGrabConfig::default();
        let candles: Vec<Candle> = (0..25).map(|_| bar(100.0, 101.0, 99.0, 100.0)).collect();
        assert!(detect("AAPL", &candles, config).is_none());
    }
}
