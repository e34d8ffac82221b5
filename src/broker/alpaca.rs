//! Alpaca broker client. Alpaca's own order UUID doubles as the trade
//! identifier for `get_trade_details` — there is no separate position id to
//! track.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::domain::Candle;
use crate::error::BrokerError;

use super::{
    AccountInfo, BrokerService, Order, OrderSide, OrderStatus, OrderType, Position, PositionSide,
    Quote, TimeInForce, TradeDetails, TradeState,
};

pub struct AlpacaBroker {
    client: Client,
    base_url: String,
    data_url: String,
    api_key: String,
    secret_key: String,
}

impl AlpacaBroker {
    pub fn new(api_key: String, secret_key: String, paper: bool) -> Self {
        let base_url = if paper {
            "https://paper-api.alpaca.markets".to_string()
        } else {
            "https://api.alpaca.markets".to_string()
        };
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url,
            data_url: "https://data.alpaca.markets".to_string(),
            api_key,
            secret_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, BrokerError> {
        let resp = req
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Api(format!("alpaca {status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))
    }
}

#[derive(Deserialize)]
struct RawPosition {
    symbol: String,
    qty: String,
    side: String,
    avg_entry_price: String,
    current_price: String,
    market_value: String,
    cost_basis: String,
    unrealized_pl: String,
    unrealized_plpc: String,
}

#[derive(Deserialize)]
struct RawOrder {
    id: String,
    symbol: String,
    qty: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    status: String,
    filled_qty: String,
    filled_avg_price: Option<String>,
    limit_price: Option<String>,
    stop_price: Option<String>,
    time_in_force: String,
}

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

fn map_order_status(s: &str) -> OrderStatus {
    match s {
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "canceled" | "cancelled" => OrderStatus::Cancelled,
        "rejected" | "expired" => OrderStatus::Rejected,
        "new" | "accepted" | "pending_new" => OrderStatus::Open,
        _ => OrderStatus::Pending,
    }
}

fn map_order(raw: RawOrder) -> Order {
    Order {
        order_id: raw.id,
        symbol: raw.symbol,
        qty: parse_f64(&raw.qty),
        side: if raw.side == "buy" {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        },
        order_type: match raw.order_type.as_str() {
            "limit" => OrderType::Limit,
            "stop" => OrderType::Stop,
            "stop_limit" => OrderType::StopLimit,
            _ => OrderType::Market,
        },
        status: map_order_status(&raw.status),
        filled_qty: parse_f64(&raw.filled_qty),
        filled_price: raw.filled_avg_price.as_deref().map(parse_f64),
        limit_price: raw.limit_price.as_deref().map(parse_f64),
        stop_price: raw.stop_price.as_deref().map(parse_f64),
        time_in_force: match raw.time_in_force.as_str() {
            "gtc" => TimeInForce::Gtc,
            "ioc" => TimeInForce::Ioc,
            "fok" => TimeInForce::Fok,
            _ => TimeInForce::Day,
        },
        submitted_at: None,
        filled_at: None,
        broker_data: serde_json::json!({}),
    }
}

#[async_trait]
impl BrokerService for AlpacaBroker {
    fn broker_type(&self) -> &'static str {
        "alpaca"
    }

    async fn test_connection(&self) -> Result<serde_json::Value, BrokerError> {
        self.get_account_info().await?;
        Ok(serde_json::json!({"status": "ok"}))
    }

    async fn get_account_info(&self) -> Result<AccountInfo, BrokerError> {
        #[derive(Deserialize)]
        struct RawAccount {
            currency: String,
            cash: String,
            buying_power: String,
            portfolio_value: String,
        }
        let raw: RawAccount = self
            .send(self.request(reqwest::Method::GET, "/v2/account"))
            .await?;
        Ok(AccountInfo {
            currency: raw.currency,
            cash: parse_f64(&raw.cash),
            buying_power: parse_f64(&raw.buying_power),
            portfolio_value: parse_f64(&raw.portfolio_value),
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let raw: Vec<RawPosition> = self
            .send(self.request(reqwest::Method::GET, "/v2/positions"))
            .await?;
        Ok(raw
            .into_iter()
            .map(|p| Position {
                symbol: p.symbol,
                qty: parse_f64(&p.qty),
                side: if p.side == "long" {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                avg_entry_price: parse_f64(&p.avg_entry_price),
                current_price: parse_f64(&p.current_price),
                market_value: parse_f64(&p.market_value),
                cost_basis: parse_f64(&p.cost_basis),
                unrealized_pl: parse_f64(&p.unrealized_pl),
                unrealized_pl_percent: parse_f64(&p.unrealized_plpc) * 100.0,
                broker_data: serde_json::json!({}),
            })
            .collect())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/v2/positions/{symbol}"))
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(BrokerError::Api(format!("alpaca {}", resp.status())));
        }
        let raw: RawPosition = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        Ok(Some(Position {
            symbol: raw.symbol,
            qty: parse_f64(&raw.qty),
            side: if raw.side == "long" {
                PositionSide::Long
            } else {
                PositionSide::Short
            },
            avg_entry_price: parse_f64(&raw.avg_entry_price),
            current_price: parse_f64(&raw.current_price),
            market_value: parse_f64(&raw.market_value),
            cost_basis: parse_f64(&raw.cost_basis),
            unrealized_pl: parse_f64(&raw.unrealized_pl),
            unrealized_pl_percent: parse_f64(&raw.unrealized_plpc) * 100.0,
            broker_data: serde_json::json!({}),
        }))
    }

    async fn place_order(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        order_type: OrderType,
        limit_price: Option<f64>,
        stop_price: Option<f64>,
        time_in_force: TimeInForce,
    ) -> Result<Order, BrokerError> {
        let body = serde_json::json!({
            "symbol": symbol,
            "qty": qty.to_string(),
            "side": match side { OrderSide::Buy => "buy", OrderSide::Sell => "sell" },
            "type": match order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
                OrderType::Stop => "stop",
                OrderType::StopLimit => "stop_limit",
            },
            "limit_price": limit_price,
            "stop_price": stop_price,
            "time_in_force": match time_in_force {
                TimeInForce::Day => "day",
                TimeInForce::Gtc => "gtc",
                TimeInForce::Ioc => "ioc",
                TimeInForce::Fok => "fok",
            },
        });
        let raw: RawOrder = self
            .send(
                self.request(reqwest::Method::POST, "/v2/orders")
                    .json(&body),
            )
            .await?;
        Ok(map_order(raw))
    }

    async fn place_bracket_order(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        take_profit_price: f64,
        stop_loss_price: f64,
        time_in_force: TimeInForce,
    ) -> Result<Order, BrokerError> {
        let body = serde_json::json!({
            "symbol": symbol,
            "qty": qty.to_string(),
            "side": match side { OrderSide::Buy => "buy", OrderSide::Sell => "sell" },
            "type": "market",
            "order_class": "bracket",
            "take_profit": {"limit_price": take_profit_price},
            "stop_loss": {"stop_price": stop_loss_price},
            "time_in_force": match time_in_force {
                TimeInForce::Day => "day",
                TimeInForce::Gtc => "gtc",
                TimeInForce::Ioc => "ioc",
                TimeInForce::Fok => "fok",
            },
        });
        let raw: RawOrder = self
            .send(
                self.request(reqwest::Method::POST, "/v2/orders")
                    .json(&body),
            )
            .await?;
        Ok(map_order(raw))
    }

    async fn place_limit_bracket_order(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        limit_price: f64,
        take_profit_price: f64,
        stop_loss_price: f64,
        time_in_force: TimeInForce,
    ) -> Result<Order, BrokerError> {
        let body = serde_json::json!({
            "symbol": symbol,
            "qty": qty.to_string(),
            "side": match side { OrderSide::Buy => "buy", OrderSide::Sell => "sell" },
            "type": "limit",
            "limit_price": limit_price,
            "order_class": "bracket",
            "take_profit": {"limit_price": take_profit_price},
            "stop_loss": {"stop_price": stop_loss_price},
            "time_in_force": match time_in_force {
                TimeInForce::Day => "day",
                TimeInForce::Gtc => "gtc",
                TimeInForce::Ioc => "ioc",
                TimeInForce::Fok => "fok",
            },
        });
        let raw: RawOrder = self
            .send(
                self.request(reqwest::Method::POST, "/v2/orders")
                    .json(&body),
            )
            .await?;
        Ok(map_order(raw))
    }

    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        let raw: Vec<RawOrder> = self
            .send(
                self.request(reqwest::Method::GET, "/v2/orders")
                    .query(&[("status", "open")]),
            )
            .await?;
        Ok(raw.into_iter().map(map_order).collect())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/v2/orders/{order_id}"))
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(BrokerError::Api(format!("alpaca {}", resp.status())));
        }
        Ok(())
    }

    async fn close_position(
        &self,
        symbol: &str,
        qty: Option<f64>,
    ) -> Result<serde_json::Value, BrokerError> {
        let mut req = self.request(reqwest::Method::DELETE, &format!("/v2/positions/{symbol}"));
        if let Some(qty) = qty {
            req = req.query(&[("qty", qty.to_string())]);
        }
        self.send(req).await
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            quote: RawQuote,
        }
        #[derive(Deserialize)]
        struct RawQuote {
            #[serde(rename = "bp")]
            bid: f64,
            #[serde(rename = "ap")]
            ask: f64,
        }
        let resp = self
            .client
            .get(format!("{}/v2/stocks/{}/quotes/latest", self.data_url, symbol))
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        let mid = (wrapper.quote.bid + wrapper.quote.ask) / 2.0;
        Ok(Quote {
            symbol: symbol.to_string(),
            bid: wrapper.quote.bid,
            ask: wrapper.quote.ask,
            last: mid,
        })
    }

    async fn get_recent_candles(
        &self,
        _symbol: &str,
        _granularity: &str,
        _count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        // Stock candle history is served by the data plane, not inline here.
        Ok(Vec::new())
    }

    async fn get_trade_details(
        &self,
        _trade_id: Option<&str>,
        order_id: Option<&str>,
    ) -> Result<TradeDetails, BrokerError> {
        let order_id = order_id.ok_or_else(|| {
            BrokerError::Api("alpaca get_trade_details requires an order_id".to_string())
        })?;
        let resp = self
            .request(reqwest::Method::GET, &format!("/v2/orders/{order_id}"))
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(TradeDetails {
                found: false,
                state: TradeState::Open,
                realized_pl: 0.0,
                unrealized_pl: 0.0,
                close_time: None,
                instrument: String::new(),
                open_price: 0.0,
                close_price: None,
                units: 0.0,
                broker_data: serde_json::json!({}),
            });
        }
        let raw: RawOrder = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        let status = map_order_status(&raw.status);
        let closed = matches!(status, OrderStatus::Filled);
        Ok(TradeDetails {
            found: true,
            state: if closed { TradeState::Closed } else { TradeState::Open },
            realized_pl: 0.0,
            unrealized_pl: 0.0,
            close_time: None,
            instrument: raw.symbol,
            open_price: raw.filled_avg_price.as_deref().map(parse_f64).unwrap_or(0.0),
            close_price: raw.filled_avg_price.as_deref().map(parse_f64),
            units: parse_f64(&raw.filled_qty),
            broker_data: serde_json::json!({}),
        })
    }
}
