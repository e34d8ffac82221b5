//! Time-series OHLCV store. `ohlcv_1m` is the only table written by
//! ingestion; every other timeframe is a materialized continuous aggregate
//! rebuilt by `refresh_continuous_aggregates`, following the same
//! WAL-mode/`execute_batch`-schema discipline as `store::oltp`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::domain::{Candle, Timeframe};
use crate::error::StoreError;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA mmap_size = 268435456;

CREATE TABLE IF NOT EXISTS ohlcv_1m (
    ticker TEXT NOT NULL,
    ts TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    PRIMARY KEY (ticker, ts)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS ohlcv_5m (
    ticker TEXT NOT NULL, ts TEXT NOT NULL, open REAL NOT NULL, high REAL NOT NULL,
    low REAL NOT NULL, close REAL NOT NULL, volume REAL NOT NULL,
    PRIMARY KEY (ticker, ts)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS ohlcv_15m (
    ticker TEXT NOT NULL, ts TEXT NOT NULL, open REAL NOT NULL, high REAL NOT NULL,
    low REAL NOT NULL, close REAL NOT NULL, volume REAL NOT NULL,
    PRIMARY KEY (ticker, ts)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS ohlcv_1h (
    ticker TEXT NOT NULL, ts TEXT NOT NULL, open REAL NOT NULL, high REAL NOT NULL,
    low REAL NOT NULL, close REAL NOT NULL, volume REAL NOT NULL,
    PRIMARY KEY (ticker, ts)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS ohlcv_4h (
    ticker TEXT NOT NULL, ts TEXT NOT NULL, open REAL NOT NULL, high REAL NOT NULL,
    low REAL NOT NULL, close REAL NOT NULL, volume REAL NOT NULL,
    PRIMARY KEY (ticker, ts)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS ohlcv_daily (
    ticker TEXT NOT NULL, ts TEXT NOT NULL, open REAL NOT NULL, high REAL NOT NULL,
    low REAL NOT NULL, close REAL NOT NULL, volume REAL NOT NULL,
    PRIMARY KEY (ticker, ts)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS aggregate_watermarks (
    ticker TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    last_bucket_start TEXT NOT NULL,
    PRIMARY KEY (ticker, timeframe)
) WITHOUT ROWID;
"#;

pub struct TimeseriesStore {
    conn: Arc<Mutex<Connection>>,
}

impl TimeseriesStore {
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn table_for(timeframe: Timeframe) -> Option<&'static str> {
        match timeframe {
            Timeframe::M1 => Some("ohlcv_1m"),
            Timeframe::M5 => Some("ohlcv_5m"),
            Timeframe::M15 => Some("ohlcv_15m"),
            Timeframe::H1 => Some("ohlcv_1h"),
            Timeframe::H4 => Some("ohlcv_4h"),
            Timeframe::D => Some("ohlcv_daily"),
            Timeframe::W | Timeframe::M => None,
        }
    }

    /// Upsert raw 1-minute bars. Called by the prefetch task; duplicates
    /// (same ticker+ts) are silently ignored since the source feed may
    /// redeliver overlapping windows.
    pub fn upsert_1m(&self, ticker: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO ohlcv_1m (ticker, ts, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for c in candles {
                inserted += stmt.execute(params![
                    ticker,
                    c.timestamp.to_rfc3339(),
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Upsert bars a provider already delivered at `timeframe`'s native
    /// resolution (the daily EOD backfill), bypassing 1-minute aggregation
    /// entirely. Does not touch `aggregate_watermarks`.
    pub fn upsert_direct(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<usize, StoreError> {
        let table = Self::table_for(timeframe).ok_or_else(|| StoreError::NotFound {
            entity: "timeframe_table",
            id: format!("{timeframe:?}"),
        })?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let query = format!(
                "INSERT INTO {table} (ticker, ts, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(ticker, ts) DO UPDATE SET
                    open = excluded.open, high = excluded.high, low = excluded.low,
                    close = excluded.close, volume = excluded.volume"
            );
            let mut stmt = tx.prepare_cached(&query)?;
            for c in candles {
                written += stmt.execute(params![
                    ticker,
                    c.timestamp.to_rfc3339(),
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn recent_candles(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, StoreError> {
        let table = Self::table_for(timeframe).ok_or_else(|| StoreError::NotFound {
            entity: "timeframe_table",
            id: format!("{timeframe:?}"),
        })?;
        let conn = self.conn.lock();
        let query = format!(
            "SELECT ts, open, high, low, close, volume FROM {table}
             WHERE ticker = ?1 ORDER BY ts DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare_cached(&query)?;
        let mut rows = stmt.query(params![ticker, count as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let ts: String = row.get(0)?;
            out.push(Candle {
                timestamp: ts.parse().unwrap_or_else(|_| Utc::now()),
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
            });
        }
        out.reverse();
        Ok(out)
    }

    fn bucket_start(ts: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
        let epoch_minutes = ts.timestamp() / 60;
        let bucket = (epoch_minutes / minutes) * minutes;
        DateTime::<Utc>::from_timestamp(bucket * 60, 0).unwrap_or(ts)
    }

    /// Rebuild every materialized timeframe for `ticker` from `ohlcv_1m`,
    /// starting at each timeframe's watermark. Bucket at index `len-1` of a
    /// re-scan is always recomputed even if present, since it may still be
    /// incomplete.
    pub fn refresh_continuous_aggregates(&self, ticker: &str) -> Result<(), StoreError> {
        for timeframe in Timeframe::materialized() {
            self.refresh_one(ticker, *timeframe)?;
        }
        Ok(())
    }

    fn refresh_one(&self, ticker: &str, timeframe: Timeframe) -> Result<(), StoreError> {
        let minutes = match timeframe.minutes() {
            Some(m) => m,
            None => return Ok(()),
        };
        let table = match Self::table_for(timeframe) {
            Some(t) => t,
            None => return Ok(()),
        };

        let conn = self.conn.lock();
        let watermark: Option<String> = conn
            .query_row(
                "SELECT last_bucket_start FROM aggregate_watermarks WHERE ticker = ?1 AND timeframe = ?2",
                params![ticker, table],
                |r| r.get(0),
            )
            .ok();
        let since: DateTime<Utc> = watermark
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap());

        let mut stmt = conn.prepare_cached(
            "SELECT ts, open, high, low, close, volume FROM ohlcv_1m
             WHERE ticker = ?1 AND ts >= ?2 ORDER BY ts ASC",
        )?;
        let mut rows = stmt.query(params![ticker, since.to_rfc3339()])?;

        let mut buckets: HashMap<DateTime<Utc>, Vec<Candle>> = HashMap::new();
        while let Some(row) = rows.next()? {
            let ts: String = row.get(0)?;
            let ts: DateTime<Utc> = ts.parse().unwrap_or_else(|_| Utc::now());
            let candle = Candle {
                timestamp: ts,
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
            };
            buckets
                .entry(Self::bucket_start(ts, minutes))
                .or_default()
                .push(candle);
        }
        drop(rows);
        drop(stmt);

        let mut latest_bucket = since;
        let mut upsert = conn.prepare_cached(&format!(
            "INSERT INTO {table} (ticker, ts, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(ticker, ts) DO UPDATE SET
                open = excluded.open, high = excluded.high, low = excluded.low,
                close = excluded.close, volume = excluded.volume"
        ))?;
        let mut bucket_starts: Vec<DateTime<Utc>> = buckets.keys().copied().collect();
        bucket_starts.sort();
        for bucket_start in bucket_starts {
            let bars = &buckets[&bucket_start];
            if let Some(aggregate) = Candle::aggregate(bucket_start, bars) {
                upsert.execute(params![
                    ticker,
                    aggregate.timestamp.to_rfc3339(),
                    aggregate.open,
                    aggregate.high,
                    aggregate.low,
                    aggregate.close,
                    aggregate.volume,
                ])?;
                if bucket_start > latest_bucket {
                    latest_bucket = bucket_start;
                }
            }
        }
        drop(upsert);

        conn.execute(
            "INSERT INTO aggregate_watermarks (ticker, timeframe, last_bucket_start)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(ticker, timeframe) DO UPDATE SET last_bucket_start = excluded.last_bucket_start",
            params![ticker, table, latest_bucket.to_rfc3339()],
        )?;
        debug!(ticker, table, %latest_bucket, "refreshed continuous aggregate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minute_candle(minute: i64, close: f64) -> Candle {
        Candle {
            timestamp: DateTime::<Utc>::from_timestamp(minute * 60, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn aggregates_five_one_minute_bars_into_one_five_minute_bar() {
        let store = TimeseriesStore::in_memory().unwrap();
        let bars: Vec<Candle> = (0..5).map(|i| minute_candle(i, 100.0 + i as f64)).collect();
        store.upsert_1m("AAPL", &bars).unwrap();
        store.refresh_continuous_aggregates("AAPL").unwrap();

        let five_min = store.recent_candles("AAPL", Timeframe::M5, 10).unwrap();
        assert_eq!(five_min.len(), 1);
        assert_eq!(five_min[0].open, 100.0);
        assert_eq!(five_min[0].close, 104.0);
        assert_eq!(five_min[0].high, 105.0);
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = TimeseriesStore::in_memory().unwrap();
        let bars = vec![minute_candle(0, 100.0)];
        store.upsert_1m("AAPL", &bars).unwrap();
        let second = store.upsert_1m("AAPL", &bars).unwrap();
        assert_eq!(second, 0);
    }
}
