//! Signal broadcast log. Detectors publish; the dispatcher consumes each
//! partition independently, tracking its own read offset so a slow consumer
//! never blocks a fast one.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

use crate::domain::{Signal, SignalType};

/// Append-only, per-`signal_type`-partitioned log of published signals.
pub trait EventLog: Send + Sync {
    fn publish(&self, signal: Signal);

    /// Every signal in `partition` at or after `offset`, plus the offset a
    /// consumer should pass next call.
    fn poll(&self, partition: SignalType, offset: usize) -> (Vec<Signal>, usize);
}

const MAX_PARTITION_LEN: usize = 10_000;

#[derive(Default)]
pub struct InMemoryEventLog {
    partitions: RwLock<HashMap<SignalType, VecDeque<Signal>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLog for InMemoryEventLog {
    fn publish(&self, signal: Signal) {
        let mut partitions = self.partitions.write();
        let queue = partitions.entry(signal.signal_type).or_default();
        queue.push_back(signal);
        while queue.len() > MAX_PARTITION_LEN {
            queue.pop_front();
        }
    }

    fn poll(&self, partition: SignalType, offset: usize) -> (Vec<Signal>, usize) {
        let partitions = self.partitions.read();
        let Some(queue) = partitions.get(&partition) else {
            return (Vec::new(), offset);
        };
        let signals: Vec<Signal> = queue.iter().skip(offset).cloned().collect();
        (signals, offset + queue.len().saturating_sub(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SignalTickerEntry;

    fn sample(signal_type: SignalType, ticker: &str) -> Signal {
        let mut s = Signal::new(signal_type, "test");
        s.tickers.push(SignalTickerEntry {
            ticker: ticker.to_string(),
            signal: crate::domain::Bias::Bullish,
            confidence: 80.0,
            reasoning: "test".to_string(),
        });
        s
    }

    #[test]
    fn partitions_stay_independent() {
        let log = InMemoryEventLog::new();
        log.publish(sample(SignalType::GoldenCross, "AAPL"));
        log.publish(sample(SignalType::LiquidityGrab, "MSFT"));

        let (gc, _) = log.poll(SignalType::GoldenCross, 0);
        assert_eq!(gc.len(), 1);
        let (lg, _) = log.poll(SignalType::LiquidityGrab, 0);
        assert_eq!(lg.len(), 1);
    }

    #[test]
    fn offset_advances_past_consumed() {
        let log = InMemoryEventLog::new();
        log.publish(sample(SignalType::GoldenCross, "AAPL"));
        let (first, next_offset) = log.poll(SignalType::GoldenCross, 0);
        assert_eq!(first.len(), 1);

        log.publish(sample(SignalType::GoldenCross, "MSFT"));
        let (second, _) = log.poll(SignalType::GoldenCross, next_offset);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].tickers[0].ticker, "MSFT");
    }
}
