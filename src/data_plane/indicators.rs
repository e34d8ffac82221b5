//! Technical indicator math, run on the rayon CPU pool rather than the
//! async I/O runtime so a burst of indicator requests never stalls network
//! polling.

use rayon::prelude::*;
use serde::Serialize;

use crate::domain::Candle;

#[derive(Debug, Clone, Serialize)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BollingerValue {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StochasticValue {
    pub k: f64,
    pub d: f64,
}

fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

pub fn sma(candles: &[Candle], period: usize) -> Vec<f64> {
    let values = closes(candles);
    if values.len() < period || period == 0 {
        return Vec::new();
    }
    (period - 1..values.len())
        .into_par_iter()
        .map(|i| values[i + 1 - period..=i].iter().sum::<f64>() / period as f64)
        .collect()
}

pub fn ema(candles: &[Candle], period: usize) -> Vec<f64> {
    let values = closes(candles);
    if values.len() < period || period == 0 {
        return Vec::new();
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);
    for &value in &values[period..] {
        let prev = *out.last().unwrap();
        out.push((value - prev) * multiplier + prev);
    }
    out
}

/// Wilder's RSI. The first `period` values are the seed average gain/loss;
/// every value after is the smoothed running average.
pub fn rsi(candles: &[Candle], period: usize) -> Vec<f64> {
    let values = closes(candles);
    if values.len() <= period || period == 0 {
        return Vec::new();
    }
    let deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let mut avg_gain = deltas[..period].iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss = deltas[..period].iter().filter(|d| **d < 0.0).map(|d| -d).sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(deltas.len() - period + 1);
    out.push(rsi_from_averages(avg_gain, avg_loss));
    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out.push(rsi_from_averages(avg_gain, avg_loss));
    }
    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

pub fn macd(candles: &[Candle], fast: usize, slow: usize, signal_period: usize) -> Vec<MacdValue> {
    let fast_ema = ema(candles, fast);
    let slow_ema = ema(candles, slow);
    if fast_ema.len() < slow_ema.len() {
        return Vec::new();
    }
    let offset = fast_ema.len() - slow_ema.len();
    let macd_line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, s)| fast_ema[i + offset] - s)
        .collect();

    let signal_candles: Vec<Candle> = macd_line
        .iter()
        .map(|v| Candle {
            timestamp: chrono::Utc::now(),
            open: *v,
            high: *v,
            low: *v,
            close: *v,
            volume: 0.0,
        })
        .collect();
    let signal_line = ema(&signal_candles, signal_period);
    if signal_line.is_empty() {
        return Vec::new();
    }
    let signal_offset = macd_line.len() - signal_line.len();
    (0..signal_line.len())
        .map(|i| MacdValue {
            macd: macd_line[i + signal_offset],
            signal: signal_line[i],
            histogram: macd_line[i + signal_offset] - signal_line[i],
        })
        .collect()
}

pub fn bollinger_bands(candles: &[Candle], period: usize, std_dev_mult: f64) -> Vec<BollingerValue> {
    let values = closes(candles);
    if values.len() < period || period == 0 {
        return Vec::new();
    }
    (period - 1..values.len())
        .into_par_iter()
        .map(|i| {
            let window = &values[i + 1 - period..=i];
            let mean = window.iter().sum::<f64>() / period as f64;
            let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
            let std_dev = variance.sqrt();
            BollingerValue {
                upper: mean + std_dev_mult * std_dev,
                middle: mean,
                lower: mean - std_dev_mult * std_dev,
            }
        })
        .collect()
}

pub fn stochastic(candles: &[Candle], k_period: usize, d_period: usize) -> Vec<StochasticValue> {
    if candles.len() < k_period || k_period == 0 {
        return Vec::new();
    }
    let k_values: Vec<f64> = (k_period - 1..candles.len())
        .into_par_iter()
        .map(|i| {
            let window = &candles[i + 1 - k_period..=i];
            let highest = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
            let lowest = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
            let range = (highest - lowest).max(1e-9);
            (candles[i].close - lowest) / range * 100.0
        })
        .collect();
    if k_values.len() < d_period {
        return Vec::new();
    }
    (d_period - 1..k_values.len())
        .map(|i| StochasticValue {
            k: k_values[i],
            d: k_values[i + 1 - d_period..=i].iter().sum::<f64>() / d_period as f64,
        })
        .collect()
}

/// Average True Range (Wilder's smoothing).
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    if candles.len() <= period || period == 0 {
        return Vec::new();
    }
    let true_ranges: Vec<f64> = (1..candles.len())
        .map(|i| {
            let high_low = candles[i].high - candles[i].low;
            let high_close = (candles[i].high - candles[i - 1].close).abs();
            let low_close = (candles[i].low - candles[i - 1].close).abs();
            high_low.max(high_close).max(low_close)
        })
        .collect();

    let mut atr_value = true_ranges[..period].iter().sum::<f64>() / period as f64;
    let mut out = vec![atr_value];
    for &tr in &true_ranges[period..] {
        atr_value = (atr_value * (period as f64 - 1.0) + tr) / period as f64;
        out.push(atr_value);
    }
    out
}

/// Average Directional Index. Returns the ADX line only (not +DI/-DI), which
/// is all the strategy agents currently consume.
pub fn adx(candles: &[Candle], period: usize) -> Vec<f64> {
    if candles.len() <= period * 2 || period == 0 {
        return Vec::new();
    }
    let mut plus_dm = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm = Vec::with_capacity(candles.len() - 1);
    let mut true_ranges = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        let up_move = candles[i].high - candles[i - 1].high;
        let down_move = candles[i - 1].low - candles[i].low;
        plus_dm.push(if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 });
        minus_dm.push(if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 });
        let high_low = candles[i].high - candles[i].low;
        let high_close = (candles[i].high - candles[i - 1].close).abs();
        let low_close = (candles[i].low - candles[i - 1].close).abs();
        true_ranges.push(high_low.max(high_close).max(low_close));
    }

    let smooth = |series: &[f64]| -> Vec<f64> {
        let mut value = series[..period].iter().sum::<f64>();
        let mut out = vec![value];
        for &v in &series[period..] {
            value = value - (value / period as f64) + v;
            out.push(value);
        }
        out
    };
    let smoothed_plus = smooth(&plus_dm);
    let smoothed_minus = smooth(&minus_dm);
    let smoothed_tr = smooth(&true_ranges);

    let dx: Vec<f64> = (0..smoothed_tr.len())
        .map(|i| {
            let plus_di = 100.0 * smoothed_plus[i] / smoothed_tr[i].max(1e-9);
            let minus_di = 100.0 * smoothed_minus[i] / smoothed_tr[i].max(1e-9);
            100.0 * (plus_di - minus_di).abs() / (plus_di + minus_di).max(1e-9)
        })
        .collect();

    if dx.len() < period {
        return Vec::new();
    }
    let mut adx_value = dx[..period].iter().sum::<f64>() / period as f64;
    let mut out = vec![adx_value];
    for &value in &dx[period..] {
        adx_value = (adx_value * (period as f64 - 1.0) + value) / period as f64;
        out.push(adx_value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(close: f64) -> Candle {
        Candle {
            timestamp: Utc::now(),
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn sma_matches_hand_computed_average() {
        let candles: Vec<Candle> = [1.0, 2.0, 3.0, 4.0, 5.0].iter().map(|c| candle(*c)).collect();
        let result = sma(&candles, 3);
        assert_eq!(result, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn rsi_is_100_when_all_moves_are_gains() {
        let candles: Vec<Candle> = (1..=20).map(|i| candle(i as f64)).collect();
        let result = rsi(&candles, 14);
        assert!(result.iter().all(|v| (*v - 100.0).abs() < 1e-6));
    }

    #[test]
    fn bollinger_middle_band_equals_sma() {
        let candles: Vec<Candle> = [10.0, 12.0, 11.0, 13.0, 12.0].iter().map(|c| candle(*c)).collect();
        let bands = bollinger_bands(&candles, 3, 2.0);
        let sma_values = sma(&candles, 3);
        for (band, avg) in bands.iter().zip(sma_values.iter()) {
            assert!((band.middle - avg).abs() < 1e-9);
        }
    }
}
