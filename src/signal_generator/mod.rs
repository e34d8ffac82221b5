//! Signal generator: runs each detector on its own interval over the hot
//! ticker set, batches whatever it finds into one broadcast `Signal`, and
//! publishes it. Detectors are pure functions over candle slices; this
//! module owns only the scheduling and data-fetching around them.

pub mod detectors;
pub mod publisher;

pub use publisher::SignalPublisher;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::data_plane::{AssetClass, DataPlane};
use crate::domain::{Candle, Signal, SignalType, Timeframe};

use detectors::{
    detect_break_of_structure, detect_golden_cross, detect_liquidity_grab,
    BreakOfStructureConfig, GoldenCrossConfig, LiquidityGrabConfig,
};

const CANDLE_LOOKBACK: usize = 250;
const DEFAULT_DETECTOR_INTERVAL: Duration = Duration::from_secs(60);

pub struct SignalGenerator {
    data_plane: Arc<DataPlane>,
    publisher: SignalPublisher,
    golden_cross: GoldenCrossConfig,
    break_of_structure: BreakOfStructureConfig,
    liquidity_grab: LiquidityGrabConfig,
}

impl SignalGenerator {
    pub fn new(data_plane: Arc<DataPlane>, publisher: SignalPublisher) -> Self {
        Self {
            data_plane,
            publisher,
            golden_cross: GoldenCrossConfig::default(),
            break_of_structure: BreakOfStructureConfig::default(),
            liquidity_grab: LiquidityGrabConfig::default(),
        }
    }

    /// Spawns one periodic task per detector; returns their join handles so
    /// the caller can await shutdown.
    pub fn spawn_all(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().run_detector_loop(DetectorKind::GoldenCross)),
            tokio::spawn(self.clone().run_detector_loop(DetectorKind::BreakOfStructure)),
            tokio::spawn(self.run_detector_loop(DetectorKind::LiquidityGrab)),
        ]
    }

    async fn run_detector_loop(self: Arc<Self>, kind: DetectorKind) {
        let mut ticker = tokio::time::interval(DEFAULT_DETECTOR_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_detector_once(kind).await {
                warn!(detector = kind.label(), error = %e, "detector run failed");
            }
        }
    }

    async fn run_detector_once(&self, kind: DetectorKind) -> anyhow::Result<()> {
        let started = std::time::Instant::now();
        let tickers = self.data_plane.cache.hot_tickers().await?;

        let mut signal = Signal::new(kind.any_signal_type_placeholder(), "signal_generator");
        let mut entries_by_type: std::collections::HashMap<SignalType, Vec<_>> =
            std::collections::HashMap::new();

        for ticker in &tickers {
            let candles = match self
                .data_plane
                .get_candles(ticker, AssetClass::Equity, Timeframe::M5, CANDLE_LOOKBACK)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    debug!(ticker, error = %e, "skipping ticker, candle fetch failed");
                    continue;
                }
            };
            self.apply_detector(kind, ticker, &candles, &mut entries_by_type);
        }

        crate::metrics::record_detector_duration(kind.label(), started.elapsed().as_secs_f64());

        for (signal_type, entries) in entries_by_type {
            if entries.is_empty() {
                continue;
            }
            signal.signal_type = signal_type;
            signal.tickers = entries;
            signal.timestamp = chrono::Utc::now();
            self.publisher.publish(signal.clone()).await;
        }
        Ok(())
    }

    fn apply_detector(
        &self,
        kind: DetectorKind,
        ticker: &str,
        candles: &[Candle],
        out: &mut std::collections::HashMap<SignalType, Vec<crate::domain::SignalTickerEntry>>,
    ) {
        match kind {
            DetectorKind::GoldenCross => {
                if let Some(entry) = detect_golden_cross(ticker, candles, self.golden_cross) {
                    out.entry(SignalType::GoldenCross).or_default().push(entry);
                }
            }
            DetectorKind::BreakOfStructure => {
                if let Some((signal_type, entry)) =
                    detect_break_of_structure(ticker, candles, self.break_of_structure)
                {
                    out.entry(signal_type).or_default().push(entry);
                }
            }
            DetectorKind::LiquidityGrab => {
                if let Some(entry) = detect_liquidity_grab(ticker, candles, self.liquidity_grab) {
                    out.entry(SignalType::LiquidityGrab).or_default().push(entry);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DetectorKind {
    GoldenCross,
    BreakOfStructure,
    LiquidityGrab,
}

impl DetectorKind {
    fn label(&self) -> &'static str {
        match self {
            DetectorKind::GoldenCross => "golden_cross",
            DetectorKind::BreakOfStructure => "break_of_structure",
            DetectorKind::LiquidityGrab => "liquidity_grab",
        }
    }

    /// Placeholder signal type used only to construct the scratch `Signal`
    /// before the real per-type batches are assigned; never published as-is.
    fn any_signal_type_placeholder(&self) -> SignalType {
        match self {
            DetectorKind::GoldenCross => SignalType::GoldenCross,
            DetectorKind::BreakOfStructure => SignalType::BreakOfStructureBullish,
            DetectorKind::LiquidityGrab => SignalType::LiquidityGrab,
        }
    }
}
