//! The three background harnesses that run alongside the executor: the
//! per-check monitoring loop, the per-minute reconciliation sweep, and the
//! periodic housekeeping jobs (scheduling, stale-row cleanup, budget reset).

pub mod housekeeping;
pub mod monitoring;
pub mod reconciliation;
