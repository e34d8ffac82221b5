//! Redis-backed KV cache for hot market data: last quote, recent candles,
//! computed indicators, and the hot/warm ticker universe sets. A `FakeCache`
//! in-memory double backs unit tests so they don't need a live Redis.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::domain::{Candle, Timeframe};
use crate::error::CacheError;

const QUOTE_TTL_SECS: u64 = 10;
const CANDLES_TTL_SECS: u64 = 60;
const INDICATORS_TTL_SECS: u64 = 60;
const UNIVERSE_TTL_SECS: u64 = 600;

fn quote_key(ticker: &str) -> String {
    format!("quote:{ticker}")
}

fn candles_key(timeframe: Timeframe, ticker: &str) -> String {
    format!("candles:{}:{ticker}", timeframe.as_str())
}

fn indicators_key(ticker: &str, timeframe: Timeframe, names: &str, params: &str) -> String {
    format!("indicators:{ticker}:{}:{names}:{params}", timeframe.as_str())
}

#[async_trait]
pub trait MarketCache: Send + Sync {
    async fn get_quote(&self, ticker: &str) -> Result<Option<crate::data_plane::provider::ProviderQuote>, CacheError>;
    async fn set_quote(&self, ticker: &str, quote: &crate::data_plane::provider::ProviderQuote) -> Result<(), CacheError>;

    async fn get_candles(&self, timeframe: Timeframe, ticker: &str) -> Result<Option<Vec<Candle>>, CacheError>;
    async fn set_candles(&self, timeframe: Timeframe, ticker: &str, candles: &[Candle]) -> Result<(), CacheError>;

    async fn get_indicators(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        names: &str,
        params: &str,
    ) -> Result<Option<serde_json::Value>, CacheError>;
    async fn set_indicators(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        names: &str,
        params: &str,
        value: &serde_json::Value,
    ) -> Result<(), CacheError>;

    async fn set_hot_tickers(&self, tickers: &[String]) -> Result<(), CacheError>;
    async fn set_warm_tickers(&self, tickers: &[String]) -> Result<(), CacheError>;
    async fn hot_tickers(&self) -> Result<Vec<String>, CacheError>;
    async fn warm_tickers(&self) -> Result<Vec<String>, CacheError>;
}

pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn new(redis_url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        match raw {
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| CacheError::Backend(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let raw = serde_json::to_string(value).map_err(|e| CacheError::Backend(e.to_string()))?;
        conn.set_ex::<_, _, ()>(key, raw, ttl_secs)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn set_set(&self, key: &str, members: &[String], ttl_secs: u64) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .del(key)
            .ignore()
            .sadd(key, members)
            .ignore()
            .expire(key, ttl_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_set(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        conn.smembers(key)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }
}

#[async_trait]
impl MarketCache for RedisCache {
    async fn get_quote(&self, ticker: &str) -> Result<Option<crate::data_plane::provider::ProviderQuote>, CacheError> {
        self.get_json::<StoredQuote>(&quote_key(ticker))
            .await
            .map(|opt| opt.map(Into::into))
    }

    async fn set_quote(&self, ticker: &str, quote: &crate::data_plane::provider::ProviderQuote) -> Result<(), CacheError> {
        self.set_json(&quote_key(ticker), &StoredQuote::from(quote), QUOTE_TTL_SECS)
            .await
    }

    async fn get_candles(&self, timeframe: Timeframe, ticker: &str) -> Result<Option<Vec<Candle>>, CacheError> {
        self.get_json(&candles_key(timeframe, ticker)).await
    }

    async fn set_candles(&self, timeframe: Timeframe, ticker: &str, candles: &[Candle]) -> Result<(), CacheError> {
        self.set_json(&candles_key(timeframe, ticker), &candles, CANDLES_TTL_SECS)
            .await
    }

    async fn get_indicators(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        names: &str,
        params: &str,
    ) -> Result<Option<serde_json::Value>, CacheError> {
        self.get_json(&indicators_key(ticker, timeframe, names, params)).await
    }

    async fn set_indicators(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        names: &str,
        params: &str,
        value: &serde_json::Value,
    ) -> Result<(), CacheError> {
        self.set_json(
            &indicators_key(ticker, timeframe, names, params),
            value,
            INDICATORS_TTL_SECS,
        )
        .await
    }

    async fn set_hot_tickers(&self, tickers: &[String]) -> Result<(), CacheError> {
        self.set_set("tickers:hot", tickers, UNIVERSE_TTL_SECS).await
    }

    async fn set_warm_tickers(&self, tickers: &[String]) -> Result<(), CacheError> {
        self.set_set("tickers:warm", tickers, UNIVERSE_TTL_SECS).await
    }

    async fn hot_tickers(&self) -> Result<Vec<String>, CacheError> {
        self.get_set("tickers:hot").await
    }

    async fn warm_tickers(&self) -> Result<Vec<String>, CacheError> {
        self.get_set("tickers:warm").await
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredQuote {
    symbol: String,
    price: f64,
    bid: f64,
    ask: f64,
}

impl From<&crate::data_plane::provider::ProviderQuote> for StoredQuote {
    fn from(q: &crate::data_plane::provider::ProviderQuote) -> Self {
        Self {
            symbol: q.symbol.clone(),
            price: q.price,
            bid: q.bid,
            ask: q.ask,
        }
    }
}

impl From<StoredQuote> for crate::data_plane::provider::ProviderQuote {
    fn from(s: StoredQuote) -> Self {
        Self {
            symbol: s.symbol,
            price: s.price,
            bid: s.bid,
            ask: s.ask,
        }
    }
}

/// In-memory double for tests: no TTL expiry, reads always see the latest
/// write.
#[derive(Default)]
pub struct FakeCache {
    quotes: Mutex<HashMap<String, crate::data_plane::provider::ProviderQuote>>,
    candles: Mutex<HashMap<String, Vec<Candle>>>,
    indicators: Mutex<HashMap<String, serde_json::Value>>,
    hot: Mutex<Vec<String>>,
    warm: Mutex<Vec<String>>,
}

impl FakeCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MarketCache for FakeCache {
    async fn get_quote(&self, ticker: &str) -> Result<Option<crate::data_plane::provider::ProviderQuote>, CacheError> {
        Ok(self.quotes.lock().await.get(ticker).cloned())
    }

    async fn set_quote(&self, ticker: &str, quote: &crate::data_plane::provider::ProviderQuote) -> Result<(), CacheError> {
        self.quotes.lock().await.insert(ticker.to_string(), quote.clone());
        Ok(())
    }

    async fn get_candles(&self, timeframe: Timeframe, ticker: &str) -> Result<Option<Vec<Candle>>, CacheError> {
        Ok(self.candles.lock().await.get(&candles_key(timeframe, ticker)).cloned())
    }

    async fn set_candles(&self, timeframe: Timeframe, ticker: &str, candles: &[Candle]) -> Result<(), CacheError> {
        self.candles
            .lock()
            .await
            .insert(candles_key(timeframe, ticker), candles.to_vec());
        Ok(())
    }

    async fn get_indicators(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        names: &str,
        params: &str,
    ) -> Result<Option<serde_json::Value>, CacheError> {
        Ok(self
            .indicators
            .lock()
            .await
            .get(&indicators_key(ticker, timeframe, names, params))
            .cloned())
    }

    async fn set_indicators(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        names: &str,
        params: &str,
        value: &serde_json::Value,
    ) -> Result<(), CacheError> {
        self.indicators
            .lock()
            .await
            .insert(indicators_key(ticker, timeframe, names, params), value.clone());
        Ok(())
    }

    async fn set_hot_tickers(&self, tickers: &[String]) -> Result<(), CacheError> {
        *self.hot.lock().await = tickers.to_vec();
        Ok(())
    }

    async fn set_warm_tickers(&self, tickers: &[String]) -> Result<(), CacheError> {
        *self.warm.lock().await = tickers.to_vec();
        Ok(())
    }

    async fn hot_tickers(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.hot.lock().await.clone())
    }

    async fn warm_tickers(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.warm.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_cache_roundtrips_quote() {
        let cache = FakeCache::new();
        let quote = crate::data_plane::provider::ProviderQuote {
            symbol: "AAPL".to_string(),
            price: 190.0,
            bid: 189.9,
            ask: 190.1,
        };
        cache.set_quote("AAPL", &quote).await.unwrap();
        let fetched = cache.get_quote("AAPL").await.unwrap().unwrap();
        assert_eq!(fetched.price, 190.0);
    }

    #[tokio::test]
    async fn fake_cache_tracks_hot_universe() {
        let cache = FakeCache::new();
        cache
            .set_hot_tickers(&["AAPL".to_string(), "MSFT".to_string()])
            .await
            .unwrap();
        let hot = cache.hot_tickers().await.unwrap();
        assert_eq!(hot.len(), 2);
    }
}
