//! OANDA REST provider for forex pairs. Distinct from `broker::oanda` —
//! this one only reads public instrument market data and carries no account
//! context, so it can run even when no OANDA account is configured as the
//! trading broker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::data_plane::provider::{AssetClass, Provider, ProviderQuote};
use crate::domain::{Candle, Timeframe};

pub struct OandaProvider {
    client: Client,
    base_url: String,
    api_token: String,
}

impl OandaProvider {
    pub fn new(api_token: impl Into<String>, practice: bool) -> Self {
        let base_url = if practice {
            "https://api-fxpractice.oanda.com"
        } else {
            "https://api-fxtrade.oanda.com"
        }
        .to_string();
        Self {
            client: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(5))
                .timeout(std::time::Duration::from_secs(20))
                .build()
                .expect("reqwest client"),
            base_url,
            api_token: api_token.into(),
        }
    }

    fn granularity(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D => "D",
            Timeframe::W => "W",
            Timeframe::M => "M",
        }
    }
}

#[derive(Debug, Deserialize)]
struct PricingResponse {
    prices: Vec<PriceEntry>,
}

#[derive(Debug, Deserialize)]
struct PriceEntry {
    instrument: String,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
}

#[derive(Debug, Deserialize)]
struct PriceLevel {
    price: String,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Vec<RawCandle>,
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    time: DateTime<Utc>,
    mid: Option<MidPrices>,
    volume: f64,
    complete: bool,
}

#[derive(Debug, Deserialize)]
struct MidPrices {
    o: String,
    h: String,
    l: String,
    c: String,
}

#[async_trait]
impl Provider for OandaProvider {
    fn name(&self) -> &'static str {
        "oanda"
    }

    fn covers(&self, asset_class: AssetClass) -> bool {
        matches!(asset_class, AssetClass::Forex)
    }

    async fn get_quote(&self, symbol: &str) -> anyhow::Result<ProviderQuote> {
        let instrument = symbol.replace('/', "_").to_uppercase();
        let url = format!("{}/v3/accounts/pricing", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .query(&[("instruments", instrument.as_str())])
            .send()
            .await?
            .error_for_status()?;
        let parsed: PricingResponse = resp.json().await?;
        let entry = parsed
            .prices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("oanda returned no price for {symbol}"))?;
        let bid: f64 = entry
            .bids
            .first()
            .map(|p| p.price.parse())
            .transpose()?
            .unwrap_or(0.0);
        let ask: f64 = entry
            .asks
            .first()
            .map(|p| p.price.parse())
            .transpose()?
            .unwrap_or(0.0);
        Ok(ProviderQuote {
            symbol: entry.instrument,
            price: (bid + ask) / 2.0,
            bid,
            ask,
        })
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> anyhow::Result<Vec<Candle>> {
        let instrument = symbol.replace('/', "_").to_uppercase();
        let url = format!("{}/v3/instruments/{instrument}/candles", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .query(&[
                ("granularity", Self::granularity(timeframe)),
                ("count", &count.to_string()),
                ("price", "M"),
            ])
            .send()
            .await?
            .error_for_status()?;
        let parsed: CandlesResponse = resp.json().await?;
        let candles = parsed
            .candles
            .into_iter()
            .filter(|c| c.complete)
            .filter_map(|c| {
                let mid = c.mid?;
                Some(Candle {
                    timestamp: c.time,
                    open: mid.o.parse().ok()?,
                    high: mid.h.parse().ok()?,
                    low: mid.l.parse().ok()?,
                    close: mid.c.parse().ok()?,
                    volume: c.volume,
                })
            })
            .collect();
        Ok(candles)
    }
}
