//! Publishes detector output to the signal log. Level-triggered detectors
//! (golden cross, BOS, liquidity grab all re-evaluate from scratch each
//! tick) self-correct on the next run, so a publish failure is logged and
//! counted rather than retried.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::domain::Signal;
use crate::eventbus::EventLog;
use crate::metrics;

const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SignalPublisher {
    log: Arc<dyn EventLog>,
}

impl SignalPublisher {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    pub async fn publish(&self, signal: Signal) {
        let signal_type = signal.signal_type.as_str();
        let log = self.log.clone();
        let publish = tokio::task::spawn_blocking(move || log.publish(signal));
        match tokio::time::timeout(PUBLISH_ACK_TIMEOUT, publish).await {
            Ok(Ok(())) => metrics::inc_signal_emitted(signal_type),
            Ok(Err(e)) => warn!(signal_type, error = %e, "signal publish task panicked"),
            Err(_) => warn!(signal_type, "signal publish exceeded ack timeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::InMemoryEventLog;
    use crate::domain::SignalType;

    #[tokio::test]
    async fn publish_lands_in_the_log() {
        let log = Arc::new(InMemoryEventLog::new());
        let publisher = SignalPublisher::new(log.clone());
        publisher.publish(Signal::new(SignalType::GoldenCross, "test")).await;
        let (signals, _) = log.poll(SignalType::GoldenCross, 0);
        assert_eq!(signals.len(), 1);
    }
}
