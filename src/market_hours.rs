//! Market-hours policy, checked explicitly before an order is placed.
//! Fails *closed* in the sense that every asset class it's asked about maps
//! to a real session window rather than defaulting to "always open".
//!
//! Equity hours are expressed in UTC with a fixed US-Eastern offset; this
//! drifts by an hour across DST transitions without a timezone database
//! dependency in the stack, a known approximation recorded in the design
//! notes rather than silently shipped.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::data_plane::AssetClass;

pub struct MarketHoursChecker;

impl MarketHoursChecker {
    pub fn is_open(asset_class: AssetClass, now: DateTime<Utc>) -> bool {
        match asset_class {
            AssetClass::Equity => Self::equity_open(now),
            AssetClass::Forex => Self::forex_open(now),
            AssetClass::Crypto => true,
        }
    }

    fn equity_open(now: DateTime<Utc>) -> bool {
        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let minutes_since_midnight = now.hour() * 60 + now.minute();
        // 09:30-16:00 US/Eastern ~= 14:30-21:00 UTC (standard time).
        (14 * 60 + 30..21 * 60).contains(&minutes_since_midnight)
    }

    fn forex_open(now: DateTime<Utc>) -> bool {
        // Opens Sunday 22:00 UTC, closes Friday 22:00 UTC.
        match now.weekday() {
            Weekday::Sat => false,
            Weekday::Sun => now.hour() >= 22,
            Weekday::Fri => now.hour() < 22,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn equity_closed_on_weekend() {
        let saturday = Utc.with_ymd_and_hms(2024, 6, 1, 15, 0, 0).unwrap();
        assert!(!MarketHoursChecker::is_open(AssetClass::Equity, saturday));
    }

    #[test]
    fn equity_open_during_session() {
        let tuesday_mid_session = Utc.with_ymd_and_hms(2024, 6, 4, 16, 0, 0).unwrap();
        assert!(MarketHoursChecker::is_open(AssetClass::Equity, tuesday_mid_session));
    }

    #[test]
    fn equity_closed_before_open() {
        let tuesday_early = Utc.with_ymd_and_hms(2024, 6, 4, 10, 0, 0).unwrap();
        assert!(!MarketHoursChecker::is_open(AssetClass::Equity, tuesday_early));
    }

    #[test]
    fn forex_closed_saturday() {
        let saturday = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert!(!MarketHoursChecker::is_open(AssetClass::Forex, saturday));
    }

    #[test]
    fn crypto_always_open() {
        let saturday = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert!(MarketHoursChecker::is_open(AssetClass::Crypto, saturday));
    }
}
