//! OANDA broker client. OANDA natively supports limit-bracket orders and
//! keys `get_trade_details` off `trade_id` (its own "trade specifier"),
//! extracted from `long.tradeIDs[0]`/`short.tradeIDs[0]` on the position
//! payload when an execution record is created.

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

pub struct OandaBroker {
    client: Client,
    base_url: String,
    account_id: String,
    api_token: String,
}

impl OandaBroker {
    pub fn new(api_token: String, account_id: String, practice: bool) -> Self {
        let base_url = if practice {
            "https://api-fxpractice.oanda.com".to_string()
        } else {
            "https://api-fxtrade.oanda.com".to_string()
        };
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url,
            account_id,
            api_token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
    }
}

fn tif_to_oanda(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Day => "GTD",
        TimeInForce::Gtc => "GTC",
        TimeInForce::Ioc => "IOC",
        TimeInForce::Fok => "FOK",
    }
}

#[async_trait]
impl BrokerService for OandaBroker {
    fn broker_type(&self) -> &'static str {
        "oanda"
    }

    async fn test_connection(&self) -> Result<serde_json::Value, BrokerError> {
        self.get_account_info().await?;
        Ok(serde_json::json!({"status": "ok"}))
    }

    async fn get_account_info(&self) -> Result<AccountInfo, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            account: RawAccount,
        }
        #[derive(Deserialize)]
        struct RawAccount {
            currency: String,
            balance: String,
            margin_available: String,
            #[serde(rename = "NAV")]
            nav: String,
        }
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v3/accounts/{}", self.account_id),
            )
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        Ok(AccountInfo {
            currency: wrapper.account.currency,
            cash: wrapper.account.balance.parse().unwrap_or(0.0),
            buying_power: wrapper.account.margin_available.parse().unwrap_or(0.0),
            portfolio_value: wrapper.account.nav.parse().unwrap_or(0.0),
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            positions: Vec<RawPosition>,
        }
        #[derive(Deserialize)]
        struct Side {
            units: String,
            #[serde(rename = "averagePrice")]
            average_price: Option<String>,
            #[serde(rename = "unrealizedPL")]
            unrealized_pl: String,
            #[serde(rename = "tradeIDs", default)]
            trade_ids: Vec<String>,
        }
        #[derive(Deserialize)]
        struct RawPosition {
            instrument: String,
            long: Side,
            short: Side,
        }
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v3/accounts/{}/openPositions", self.account_id),
            )
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        Ok(wrapper
            .positions
            .into_iter()
            .map(|p| {
                let long_units: f64 = p.long.units.parse().unwrap_or(0.0);
                let is_long = long_units != 0.0;
                let side_data = if is_long { &p.long } else { &p.short };
                let qty = side_data.units.parse::<f64>().unwrap_or(0.0).abs();
                let entry = side_data
                    .average_price
                    .as_deref()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0);
                let unrealized = side_data.unrealized_pl.parse().unwrap_or(0.0);
                let trade_id = side_data.trade_ids.first().cloned();
                Position {
                    symbol: p.instrument,
                    qty,
                    side: if is_long {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    },
                    avg_entry_price: entry,
                    current_price: entry,
                    market_value: qty * entry,
                    cost_basis: qty * entry,
                    unrealized_pl: unrealized,
                    unrealized_pl_percent: 0.0,
                    broker_data: serde_json::json!({"trade_id": trade_id}),
                }
            })
            .collect())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        Ok(self
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol)))
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
        let units = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let body = serde_json::json!({
            "order": {
                "instrument": symbol,
                "units": units.to_string(),
                "type": match order_type {
                    OrderType::Market => "MARKET",
                    OrderType::Limit => "LIMIT",
                    OrderType::Stop => "STOP",
                    OrderType::StopLimit => "LIMIT",
                },
                "price": limit_price.or(stop_price).map(|p| p.to_string()),
                "timeInForce": tif_to_oanda(time_in_force),
            }
        });
        self.submit_order(body).await
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
        let units = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let body = serde_json::json!({
            "order": {
                "instrument": symbol,
                "units": units.to_string(),
                "type": "MARKET",
                "timeInForce": tif_to_oanda(time_in_force),
                "takeProfitOnFill": {"price": take_profit_price.to_string()},
                "stopLossOnFill": {"price": stop_loss_price.to_string()},
            }
        });
        self.submit_order(body).await
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
        let units = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let body = serde_json::json!({
            "order": {
                "instrument": symbol,
                "units": units.to_string(),
                "type": "LIMIT",
                "price": limit_price.to_string(),
                "timeInForce": tif_to_oanda(time_in_force),
                "takeProfitOnFill": {"price": take_profit_price.to_string()},
                "stopLossOnFill": {"price": stop_loss_price.to_string()},
            }
        });
        self.submit_order(body).await
    }

    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            orders: Vec<RawOrder>,
        }
        #[derive(Deserialize)]
        struct RawOrder {
            id: String,
            instrument: String,
            units: String,
            #[serde(rename = "type")]
            order_type: String,
            state: String,
            price: Option<String>,
        }
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v3/accounts/{}/pendingOrders", self.account_id),
            )
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        Ok(wrapper
            .orders
            .into_iter()
            .map(|o| {
                let units: f64 = o.units.parse().unwrap_or(0.0);
                Order {
                    order_id: o.id,
                    symbol: o.instrument,
                    qty: units.abs(),
                    side: if units >= 0.0 {
                        OrderSide::Buy
                    } else {
                        OrderSide::Sell
                    },
                    order_type: if o.order_type == "LIMIT" {
                        OrderType::Limit
                    } else {
                        OrderType::Market
                    },
                    status: if o.state == "PENDING" {
                        OrderStatus::Open
                    } else {
                        OrderStatus::Accepted
                    },
                    filled_qty: 0.0,
                    filled_price: None,
                    limit_price: o.price.as_deref().and_then(|p| p.parse().ok()),
                    stop_price: None,
                    time_in_force: TimeInForce::Gtc,
                    submitted_at: None,
                    filled_at: None,
                    broker_data: serde_json::json!({}),
                }
            })
            .collect())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let resp = self
            .request(
                reqwest::Method::PUT,
                &format!("/v3/accounts/{}/orders/{}/cancel", self.account_id, order_id),
            )
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BrokerError::Api(format!("oanda {}", resp.status())));
        }
        Ok(())
    }

    async fn close_position(
        &self,
        symbol: &str,
        _qty: Option<f64>,
    ) -> Result<serde_json::Value, BrokerError> {
        let resp = self
            .request(
                reqwest::Method::PUT,
                &format!(
                    "/v3/accounts/{}/positions/{}/close",
                    self.account_id, symbol
                ),
            )
            .json(&serde_json::json!({"longUnits": "ALL", "shortUnits": "ALL"}))
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            prices: Vec<RawPrice>,
        }
        #[derive(Deserialize)]
        struct PriceLevel {
            price: String,
        }
        #[derive(Deserialize)]
        struct RawPrice {
            bids: Vec<PriceLevel>,
            asks: Vec<PriceLevel>,
        }
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v3/accounts/{}/pricing", self.account_id),
            )
            .query(&[("instruments", symbol)])
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        let price = wrapper
            .prices
            .first()
            .ok_or_else(|| BrokerError::Api(format!("no price for {symbol}")))?;
        let bid: f64 = price
            .bids
            .first()
            .map(|b| b.price.parse().unwrap_or(0.0))
            .unwrap_or(0.0);
        let ask: f64 = price
            .asks
            .first()
            .map(|a| a.price.parse().unwrap_or(0.0))
            .unwrap_or(0.0);
        Ok(Quote {
            symbol: symbol.to_string(),
            bid,
            ask,
            last: (bid + ask) / 2.0,
        })
    }

    async fn get_recent_candles(
        &self,
        symbol: &str,
        granularity: &str,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            candles: Vec<RawCandle>,
        }
        #[derive(Deserialize)]
        struct Ohlc {
            o: String,
            h: String,
            l: String,
            c: String,
        }
        #[derive(Deserialize)]
        struct RawCandle {
            time: String,
            mid: Ohlc,
            volume: f64,
        }
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v3/instruments/{symbol}/candles"),
            )
            .query(&[
                ("granularity", granularity),
                ("count", &count.to_string()),
                ("price", "M"),
            ])
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        Ok(wrapper
            .candles
            .into_iter()
            .filter_map(|c| {
                let timestamp = chrono::DateTime::parse_from_rfc3339(&c.time)
                    .ok()?
                    .with_timezone(&chrono::Utc);
                Some(Candle {
                    timestamp,
                    open: c.mid.o.parse().ok()?,
                    high: c.mid.h.parse().ok()?,
                    low: c.mid.l.parse().ok()?,
                    close: c.mid.c.parse().ok()?,
                    volume: c.volume,
                })
            })
            .collect())
    }

    async fn get_trade_details(
        &self,
        trade_id: Option<&str>,
        _order_id: Option<&str>,
    ) -> Result<TradeDetails, BrokerError> {
        let trade_id = trade_id.ok_or_else(|| {
            BrokerError::Api("oanda get_trade_details requires a trade_id".to_string())
        })?;
        #[derive(Deserialize)]
        struct Wrapper {
            trade: RawTrade,
        }
        #[derive(Deserialize)]
        struct RawTrade {
            instrument: String,
            price: String,
            #[serde(rename = "currentUnits")]
            current_units: String,
            #[serde(rename = "initialUnits")]
            initial_units: String,
            state: String,
            #[serde(rename = "realizedPL")]
            realized_pl: String,
            #[serde(rename = "unrealizedPL", default)]
            unrealized_pl: String,
            #[serde(rename = "closeTime")]
            close_time: Option<String>,
            #[serde(rename = "averageClosePrice")]
            average_close_price: Option<String>,
        }
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v3/accounts/{}/trades/{}", self.account_id, trade_id),
            )
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
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        let t = wrapper.trade;
        let closed = t.state == "CLOSED";
        Ok(TradeDetails {
            found: true,
            state: if closed { TradeState::Closed } else { TradeState::Open },
            realized_pl: t.realized_pl.parse().unwrap_or(0.0),
            unrealized_pl: t.unrealized_pl.parse().unwrap_or(0.0),
            close_time: t
                .close_time
                .as_deref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&chrono::Utc)),
            instrument: t.instrument,
            open_price: t.price.parse().unwrap_or(0.0),
            close_price: t.average_close_price.as_deref().and_then(|p| p.parse().ok()),
            units: t.initial_units.parse::<f64>().unwrap_or(0.0).abs()
                - t.current_units.parse::<f64>().unwrap_or(0.0).abs(),
            broker_data: serde_json::json!({}),
        })
    }
}

impl OandaBroker {
    async fn submit_order(&self, body: serde_json::Value) -> Result<Order, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(rename = "orderFillTransaction")]
            fill: Option<FillTransaction>,
            #[serde(rename = "orderCreateTransaction")]
            create: Option<CreateTransaction>,
        }
        #[derive(Deserialize)]
        struct FillTransaction {
            id: String,
            #[serde(rename = "tradeOpened")]
            trade_opened: Option<TradeOpened>,
            price: Option<String>,
            units: Option<String>,
        }
        #[derive(Deserialize)]
        struct TradeOpened {
            #[serde(rename = "tradeID")]
            trade_id: String,
        }
        #[derive(Deserialize)]
        struct CreateTransaction {
            id: String,
            instrument: String,
            units: String,
        }
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/v3/accounts/{}/orders", self.account_id),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Api(format!("oanda {status}: {text}")));
        }
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;

        if let Some(fill) = wrapper.fill {
            let units: f64 = fill.units.as_deref().unwrap_or("0").parse().unwrap_or(0.0);
            return Ok(Order {
                order_id: fill.id,
                symbol: String::new(),
                qty: units.abs(),
                side: if units >= 0.0 { OrderSide::Buy } else { OrderSide::Sell },
                order_type: OrderType::Market,
                status: OrderStatus::Filled,
                filled_qty: units.abs(),
                filled_price: fill.price.as_deref().and_then(|p| p.parse().ok()),
                limit_price: None,
                stop_price: None,
                time_in_force: TimeInForce::Gtc,
                submitted_at: Some(chrono::Utc::now()),
                filled_at: Some(chrono::Utc::now()),
                broker_data: serde_json::json!({
                    "trade_id": fill.trade_opened.map(|t| t.trade_id),
                }),
            });
        }
        let create = wrapper
            .create
            .ok_or_else(|| BrokerError::UnexpectedPayload("oanda order response had neither fill nor create transaction".to_string()))?;
        let units: f64 = create.units.parse().unwrap_or(0.0);
        Ok(Order {
            order_id: create.id,
            symbol: create.instrument,
            qty: units.abs(),
            side: if units >= 0.0 { OrderSide::Buy } else { OrderSide::Sell },
            order_type: OrderType::Limit,
            status: OrderStatus::Open,
            filled_qty: 0.0,
            filled_price: None,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            submitted_at: Some(chrono::Utc::now()),
            filled_at: None,
            broker_data: serde_json::json!({}),
        })
    }
}
