//! Break-of-structure detector: flags when the latest close breaks above the
//! most recent confirmed swing high (bullish BOS) or below the most recent
//! confirmed swing low (bearish BOS). A swing point needs `swing_strength`
//! lower/higher bars on each side to be considered confirmed.

use crate::domain::{Bias, Candle, SignalTickerEntry, SignalType};

#[derive(Debug, Clone, Copy)]
pub struct BreakOfStructureConfig {
    pub swing_strength: usize,
    pub lookback: usize,
}

impl Default for BreakOfStructureConfig {
    fn default() -> Self {
        Self {
            swing_strength: 3,
            lookback: 50,
        }
    }
}

fn find_swing_high(candles: &[Candle], strength: usize) -> Option<(usize, f64)> {
    for i in (strength..candles.len() - strength).rev() {
        let pivot = candles[i].high;
        let is_swing = candles[i - strength..i].iter().all(|c| c.high < pivot)
            && candles[i + 1..=i + strength].iter().all(|c| c.high < pivot);
        if is_swing {
            return Some((i, pivot));
        }
    }
    None
}

fn find_swing_low(candles: &[Candle], strength: usize) -> Option<(usize, f64)> {
    for i in (strength..candles.len() - strength).rev() {
        let pivot = candles[i].low;
        let is_swing = candles[i - strength..i].iter().all(|c| c.low > pivot)
            && candles[i + 1..=i + strength].iter().all(|c| c.low > pivot);
        if is_swing {
            return Some((i, pivot));
        }
    }
    None
}

pub fn detect(
    ticker: &str,
    candles: &[Candle],
    config: BreakOfStructureConfig,
) -> Option<(SignalType, SignalTickerEntry)> {
    let window_start = candles.len().saturating_sub(config.lookback);
    let window = &candles[window_start..];
    if window.len() < config.swing_strength * 2 + 2 {
        return None;
    }

    let latest = window.last()?;
    // Exclude the most recent bar from swing detection so it can be the
    // breakout candle rather than a swing point itself.
    let history = &window[..window.len() - 1];

    if let Some((_, swing_high)) = find_swing_high(history, config.swing_strength) {
        if latest.close > swing_high {
            return Some((
                SignalType::BreakOfStructureBullish,
                SignalTickerEntry {
                    ticker: ticker.to_string(),
                    signal: Bias::Bullish,
                    confidence: 65.0,
                    reasoning: format!("close broke above swing high at {swing_high:.4}"),
                },
            ));
        }
    }
    if let Some((_, swing_low)) = find_swing_low(history, config.swing_strength) {
        if latest.close < swing_low {
            return Some((
                SignalType::BreakOfStructureBearish,
                SignalTickerEntry {
                    ticker: ticker.to_string(),
                    signal: Bias::Bearish,
                    confidence: 65.0,
                    reasoning: format!("close broke below swing low at {swing_low:.4}"),
                },
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn detects_bullish_break_of_structure() {
        let config = BreakOfStructureConfig {
            swing_strength: 2,
            lookback: 50,
        };
        let mut candles = vec![
            bar(100.0, 95.0, 98.0),
            bar(102.0, 97.0, 100.0),
            bar(105.0, 99.0, 103.0), // swing high around here
            bar(101.0, 96.0, 98.0),
            bar(100.0, 95.0, 97.0),
        ];
        candles.push(bar(110.0, 104.0, 108.0)); // breaks above 105
        let result = detect("AAPL", &candles, config);
        assert!(result.is_some());
        assert_eq!(result.unwrap().0, SignalType::BreakOfStructureBullish);
    }

    #[test]
    fn no_signal_within_range() {
        let config = BreakOfStructureConfig {
            swing_strength: 2,
            lookback: 50,
        };
        let candles: Vec<Candle> = (0..10).map(|_| bar(101.0, 99.0, 100.0)).collect();
        assert!(detect("AAPL", &candles, config).is_none());
    }
}
