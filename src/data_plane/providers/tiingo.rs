//! Tiingo REST provider: end-of-day and intraday equity bars plus IEX quotes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::data_plane::provider::{AssetClass, Provider, ProviderQuote};
use crate::domain::{Candle, Timeframe};

pub struct TiingoProvider {
    client: Client,
    api_key: String,
}

impl TiingoProvider {
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

    fn resample_freq(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "1min",
            Timeframe::M5 => "5min",
            Timeframe::M15 => "15min",
            Timeframe::H1 => "1hour",
            Timeframe::H4 => "4hour",
            Timeframe::D | Timeframe::W | Timeframe::M => "1day",
        }
    }
}

#[derive(Debug, Deserialize)]
struct IexQuote {
    last: Option<f64>,
    #[serde(rename = "tngoLast")]
    tngo_last: Option<f64>,
    bid_price: Option<f64>,
    ask_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct IntradayBar {
    date: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[async_trait]
impl Provider for TiingoProvider {
    fn name(&self) -> &'static str {
        "tiingo"
    }

    fn covers(&self, asset_class: AssetClass) -> bool {
        matches!(asset_class, AssetClass::Equity)
    }

    async fn get_quote(&self, symbol: &str) -> anyhow::Result<ProviderQuote> {
        let url = format!("https://api.tiingo.com/iex/{symbol}");
        let resp = self
            .client
            .get(&url)
            .query(&[("token", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?;
        let quotes: Vec<IexQuote> = resp.json().await?;
        let quote = quotes
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("tiingo returned no quote for {symbol}"))?;
        let price = quote.last.or(quote.tngo_last).unwrap_or(0.0);
        Ok(ProviderQuote {
            symbol: symbol.to_string(),
            price,
            bid: quote.bid_price.unwrap_or(price),
            ask: quote.ask_price.unwrap_or(price),
        })
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> anyhow::Result<Vec<Candle>> {
        let url = format!("https://api.tiingo.com/iex/{symbol}/prices");
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("token", self.api_key.as_str()),
                ("resampleFreq", Self::resample_freq(timeframe)),
                ("format", "json"),
            ])
            .send()
            .await?
            .error_for_status()?;
        let bars: Vec<IntradayBar> = resp.json().await?;
        let candles = bars
            .into_iter()
            .rev()
            .take(count)
            .rev()
            .map(|b| Candle {
                timestamp: b.date,
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.close,
                volume: b.volume,
            })
            .collect();
        Ok(candles)
    }
}
