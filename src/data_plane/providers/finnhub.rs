//! Finnhub REST provider. Used primarily as the quote/candle fallback when
//! Tiingo's IEX feed is stale or rate-limited.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::data_plane::provider::{AssetClass, Provider, ProviderQuote};
use crate::domain::{Candle, Timeframe};

pub struct FinnhubProvider {
    client: Client,
    api_key: String,
}

impl FinnhubProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(5))
                .timeout(std::time::Duration::from_secs(20))
                .build()
                .expect("reqwest client"),
            api_key: api_key.into(),
        }
    }

    fn resolution(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "1",
            Timeframe::M5 => "5",
            Timeframe::M15 => "15",
            Timeframe::H1 => "60",
            Timeframe::H4 => "240",
            Timeframe::D => "D",
            Timeframe::W => "W",
            Timeframe::M => "M",
        }
    }
}

#[derive(Debug, Deserialize)]
struct FinnhubQuote {
    c: f64,
    #[serde(default)]
    b: Option<f64>,
    #[serde(default)]
    a: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FinnhubCandles {
    s: String,
    #[serde(default)]
    t: Vec<i64>,
    #[serde(default)]
    o: Vec<f64>,
    #[serde(default)]
    h: Vec<f64>,
    #[serde(default)]
    l: Vec<f64>,
    #[serde(default)]
    c: Vec<f64>,
    #[serde(default)]
    v: Vec<f64>,
}

#[async_trait]
impl Provider for FinnhubProvider {
    fn name(&self) -> &'static str {
        "finnhub"
    }

    fn covers(&self, asset_class: AssetClass) -> bool {
        matches!(asset_class, AssetClass::Equity | AssetClass::Crypto)
    }

    async fn get_quote(&self, symbol: &str) -> anyhow::Result<ProviderQuote> {
        let resp = self
            .client
            .get("https://finnhub.io/api/v1/quote")
            .query(&[("symbol", symbol), ("token", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?;
        let quote: FinnhubQuote = resp.json().await?;
        Ok(ProviderQuote {
            symbol: symbol.to_string(),
            price: quote.c,
            bid: quote.b.unwrap_or(quote.c),
            ask: quote.a.unwrap_or(quote.c),
        })
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> anyhow::Result<Vec<Candle>> {
        let minutes = timeframe.minutes().unwrap_or(1440);
        let to = Utc::now();
        let from = to - chrono::Duration::minutes(minutes * count as i64 * 2);
        let resp = self
            .client
            .get("https://finnhub.io/api/v1/stock/candle")
            .query(&[
                ("symbol", symbol.to_string()),
                ("resolution", Self::resolution(timeframe).to_string()),
                ("from", from.timestamp().to_string()),
                ("to", to.timestamp().to_string()),
                ("token", self.api_key.clone()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let data: FinnhubCandles = resp.json().await?;
        if data.s != "ok" {
            return Ok(Vec::new());
        }
        let mut candles: Vec<Candle> = (0..data.t.len())
            .map(|i| Candle {
                timestamp: Utc.timestamp_opt(data.t[i], 0).single().unwrap_or(to),
                open: data.o[i],
                high: data.h[i],
                low: data.l[i],
                close: data.c[i],
                volume: data.v.get(i).copied().unwrap_or(0.0),
            })
            .collect();
        if candles.len() > count {
            candles = candles.split_off(candles.len() - count);
        }
        Ok(candles)
    }
}
