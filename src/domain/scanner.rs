use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named, user-owned set of ticker symbols. Read-only at execution time —
/// pipelines reference a scanner but never mutate it mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scanner {
    pub scanner_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub tickers: Vec<String>,
}

impl Scanner {
    pub fn contains(&self, ticker: &str) -> bool {
        self.tickers.iter().any(|t| t.eq_ignore_ascii_case(ticker))
    }
}
