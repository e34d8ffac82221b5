//! Persistence layer. `OltpStore` holds pipelines, scanners, executions, and
//! user budgets; the time-series OHLCV store lives in `data_plane::timeseries`
//! since it is owned and refreshed by the data plane, not the trade state
//! machine.

pub mod oltp;

pub use oltp::OltpStore;
