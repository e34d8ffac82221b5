//! Golden cross / death cross detector: the fast SMA crossing the slow SMA
//! on the latest two bars.

use crate::data_plane::indicators::sma;
use crate::domain::{Bias, Candle, SignalTickerEntry};

#[derive(Debug, Clone, Copy)]
pub struct GoldenCrossConfig {
    pub fast_period: usize,
    pub slow_period: usize,
}

impl Default for GoldenCrossConfig {
    fn default() -> Self {
        Self {
            fast_period: 50,
            slow_period: 200,
        }
    }
}

pub fn detect(ticker: &str, candles: &[Candle], config: GoldenCrossConfig) -> Option<SignalTickerEntry> {
    let fast = sma(candles, config.fast_period);
    let slow = sma(candles, config.slow_period);
    if fast.len() < 2 || slow.len() < 2 {
        return None;
    }

    let (fast_prev, fast_curr) = (fast[fast.len() - 2], fast[fast.len() - 1]);
    let (slow_prev, slow_curr) = (slow[slow.len() - 2], slow[slow.len() - 1]);

    let crossed_up = fast_prev <= slow_prev && fast_curr > slow_curr;
    let crossed_down = fast_prev >= slow_prev && fast_curr < slow_curr;

    if !crossed_up && !crossed_down {
        return None;
    }

    let separation = ((fast_curr - slow_curr) / slow_curr.abs().max(1e-9)).abs();
    let confidence = (separation * 1000.0).clamp(40.0, 95.0);

    Some(SignalTickerEntry {
        ticker: ticker.to_string(),
        signal: if crossed_up { Bias::Bullish } else { Bias::Bearish },
        confidence,
        reasoning: format!(
            "{}-period SMA crossed {} the {}-period SMA",
            config.fast_period,
            if crossed_up { "above" } else { "below" },
            config.slow_period
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(close: f64) -> Candle {
        Candle {
            timestamp: Utc::now(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn detects_bullish_cross() {
        let config = GoldenCrossConfig {
            fast_period: 3,
            slow_period: 5,
        };
        // Downtrend then a sharp uptick forces the fast SMA above the slow SMA.
        let mut closes = vec![10.0, 9.0, 8.0, 7.0, 6.0, 5.0];
        closes.extend([20.0, 25.0]);
        let candles: Vec<Candle> = closes.into_iter().map(candle).collect();
        let result = detect("AAPL", &candles, config);
        assert!(result.is_some());
        assert_eq!(result.unwrap().signal, Bias::Bullish);
    }

    #[test]
    fn no_signal_without_crossover() {
        let config = GoldenCrossConfig {
            fast_period: 3,
            slow_period: 5,
        };
        let candles: Vec<Candle> = (0..10).map(|i| candle(100.0 + i as f64 * 0.01)).collect();
        assert!(detect("AAPL", &candles, config).is_none());
    }
}
