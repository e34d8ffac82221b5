//! Tradier broker client. Tradier has no native position identifier, so a
//! synthetic id `{symbol}_{qty}_{cost_basis:.2}` is generated and persisted
//! onto the execution record the first time a position is observed, rather
//! than recomputed on every check (a recomputed id drifts the moment the
//! quantity changes from a partial close). `get_trade_details` is keyed on
//! `order_id` end to end; Tradier exposes no bracket/OCO order class, so
//! `place_bracket_order` is synthesized as a plain market entry plus two
//! follow-up orders are left to the caller.

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

pub struct TradierBroker {
    client: Client,
    base_url: String,
    account_id: String,
    access_token: String,
}

impl TradierBroker {
    pub fn new(access_token: String, account_id: String, sandbox: bool) -> Self {
        let base_url = if sandbox {
            "https://sandbox.tradier.com".to_string()
        } else {
            "https://api.tradier.com".to_string()
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
            access_token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .header("Accept", "application/json")
    }

    /// The synthesized position identifier. Tradier has nothing equivalent
    /// to an OANDA trade id or an Alpaca position id.
    pub fn synthesize_position_id(symbol: &str, qty: f64, cost_basis: f64) -> String {
        format!("{symbol}_{qty}_{cost_basis:.2}")
    }
}

fn tif_to_tradier(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Day => "day",
        TimeInForce::Gtc => "gtc",
        TimeInForce::Ioc => "ioc",
        TimeInForce::Fok => "fok",
    }
}

fn map_order_status(status: &str) -> OrderStatus {
    match status {
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "canceled" | "cancelled" => OrderStatus::Cancelled,
        "rejected" | "error" => OrderStatus::Rejected,
        "open" | "pending" => OrderStatus::Open,
        _ => OrderStatus::Accepted,
    }
}

#[async_trait]
impl BrokerService for TradierBroker {
    fn broker_type(&self) -> &'static str {
        "tradier"
    }

    async fn test_connection(&self) -> Result<serde_json::Value, BrokerError> {
        self.get_account_info().await?;
        Ok(serde_json::json!({"status": "ok"}))
    }

    async fn get_account_info(&self) -> Result<AccountInfo, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            balances: RawBalances,
        }
        #[derive(Deserialize)]
        struct RawBalances {
            total_equity: f64,
            total_cash: f64,
            #[serde(default)]
            option_buying_power: Option<f64>,
            #[serde(default)]
            stock_buying_power: Option<f64>,
        }
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/accounts/{}/balances", self.account_id),
            )
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        Ok(AccountInfo {
            currency: "USD".to_string(),
            cash: wrapper.balances.total_cash,
            buying_power: wrapper
                .balances
                .stock_buying_power
                .or(wrapper.balances.option_buying_power)
                .unwrap_or(wrapper.balances.total_cash),
            portfolio_value: wrapper.balances.total_equity,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            positions: TradierPositions,
        }
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum TradierPositions {
            None(String),
            One { position: RawPosition },
            Many { position: Vec<RawPosition> },
        }
        #[derive(Deserialize)]
        struct RawPosition {
            symbol: String,
            quantity: f64,
            cost_basis: f64,
        }
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/accounts/{}/positions", self.account_id),
            )
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        let raw = match wrapper.positions {
            TradierPositions::None(_) => Vec::new(),
            TradierPositions::One { position } => vec![position],
            TradierPositions::Many { position } => position,
        };
        Ok(raw
            .into_iter()
            .map(|p| {
                let avg_entry = if p.quantity != 0.0 {
                    p.cost_basis / p.quantity
                } else {
                    0.0
                };
                Position {
                    symbol: p.symbol.clone(),
                    qty: p.quantity.abs(),
                    side: if p.quantity >= 0.0 {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    },
                    avg_entry_price: avg_entry.abs(),
                    current_price: avg_entry.abs(),
                    market_value: p.cost_basis,
                    cost_basis: p.cost_basis,
                    unrealized_pl: 0.0,
                    unrealized_pl_percent: 0.0,
                    broker_data: serde_json::json!({
                        "synthetic_position_id": Self::synthesize_position_id(
                            &p.symbol, p.quantity, p.cost_basis
                        ),
                    }),
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
        #[derive(Deserialize)]
        struct Wrapper {
            order: RawOrderResponse,
        }
        #[derive(Deserialize)]
        struct RawOrderResponse {
            id: u64,
            status: Option<String>,
        }
        let mut form = vec![
            ("class", "equity".to_string()),
            ("symbol", symbol.to_string()),
            (
                "side",
                match side {
                    OrderSide::Buy => "buy".to_string(),
                    OrderSide::Sell => "sell".to_string(),
                },
            ),
            ("quantity", qty.to_string()),
            (
                "type",
                match order_type {
                    OrderType::Market => "market".to_string(),
                    OrderType::Limit => "limit".to_string(),
                    OrderType::Stop => "stop".to_string(),
                    OrderType::StopLimit => "stop_limit".to_string(),
                },
            ),
            ("duration", tif_to_tradier(time_in_force).to_string()),
        ];
        if let Some(p) = limit_price {
            form.push(("price", p.to_string()));
        }
        if let Some(p) = stop_price {
            form.push(("stop", p.to_string()));
        }
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/v1/accounts/{}/orders", self.account_id),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Api(format!("tradier {status}: {text}")));
        }
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        Ok(Order {
            order_id: wrapper.order.id.to_string(),
            symbol: symbol.to_string(),
            qty,
            side,
            order_type,
            status: wrapper
                .order
                .status
                .as_deref()
                .map(map_order_status)
                .unwrap_or(OrderStatus::Accepted),
            filled_qty: 0.0,
            filled_price: None,
            limit_price,
            stop_price,
            time_in_force,
            submitted_at: Some(chrono::Utc::now()),
            filled_at: None,
            broker_data: serde_json::json!({}),
        })
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
        let mut entry = self
            .place_order(
                symbol,
                qty,
                side,
                OrderType::Market,
                None,
                None,
                time_in_force,
            )
            .await?;
        entry.broker_data = serde_json::json!({
            "take_profit": take_profit_price,
            "stop_loss": stop_loss_price,
            "bracket_native": false,
        });
        Ok(entry)
    }

    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            orders: TradierOrders,
        }
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum TradierOrders {
            None(String),
            One { order: RawOrder },
            Many { order: Vec<RawOrder> },
        }
        #[derive(Deserialize)]
        struct RawOrder {
            id: u64,
            symbol: String,
            quantity: f64,
            side: String,
            #[serde(rename = "type")]
            order_type: String,
            status: String,
            price: Option<f64>,
            stop_price: Option<f64>,
            exec_quantity: Option<f64>,
            avg_fill_price: Option<f64>,
        }
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/accounts/{}/orders", self.account_id),
            )
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        let raw = match wrapper.orders {
            TradierOrders::None(_) => Vec::new(),
            TradierOrders::One { order } => vec![order],
            TradierOrders::Many { order } => order,
        };
        Ok(raw
            .into_iter()
            .map(|o| Order {
                order_id: o.id.to_string(),
                symbol: o.symbol,
                qty: o.quantity,
                side: if o.side.contains("buy") {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
                order_type: match o.order_type.as_str() {
                    "limit" => OrderType::Limit,
                    "stop" => OrderType::Stop,
                    "stop_limit" => OrderType::StopLimit,
                    _ => OrderType::Market,
                },
                status: map_order_status(&o.status),
                filled_qty: o.exec_quantity.unwrap_or(0.0),
                filled_price: o.avg_fill_price,
                limit_price: o.price,
                stop_price: o.stop_price,
                time_in_force: TimeInForce::Day,
                submitted_at: None,
                filled_at: None,
                broker_data: serde_json::json!({}),
            })
            .collect())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!("/v1/accounts/{}/orders/{}", self.account_id, order_id),
            )
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BrokerError::Api(format!("tradier {}", resp.status())));
        }
        Ok(())
    }

    async fn close_position(
        &self,
        symbol: &str,
        qty: Option<f64>,
    ) -> Result<serde_json::Value, BrokerError> {
        let position = self
            .get_position(symbol)
            .await?
            .ok_or_else(|| BrokerError::Api(format!("no open position in {symbol}")))?;
        let close_qty = qty.unwrap_or(position.qty);
        let side = match position.side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };
        let order = self
            .place_order(
                symbol,
                close_qty,
                side,
                OrderType::Market,
                None,
                None,
                TimeInForce::Day,
            )
            .await?;
        Ok(serde_json::to_value(order).unwrap_or_default())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            quotes: QuotesWrapper,
        }
        #[derive(Deserialize)]
        struct QuotesWrapper {
            quote: RawQuote,
        }
        #[derive(Deserialize)]
        struct RawQuote {
            bid: f64,
            ask: f64,
            last: f64,
        }
        let resp = self
            .request(reqwest::Method::GET, "/v1/markets/quotes")
            .query(&[("symbols", symbol), ("greeks", "false")])
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        Ok(Quote {
            symbol: symbol.to_string(),
            bid: wrapper.quotes.quote.bid,
            ask: wrapper.quotes.quote.ask,
            last: wrapper.quotes.quote.last,
        })
    }

    async fn get_recent_candles(
        &self,
        symbol: &str,
        _granularity: &str,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        #[derive(Deserialize)]
        struct Wrapper {
            history: Option<HistoryWrapper>,
        }
        #[derive(Deserialize)]
        struct HistoryWrapper {
            day: DaySeries,
        }
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum DaySeries {
            One(RawDay),
            Many(Vec<RawDay>),
        }
        #[derive(Deserialize)]
        struct RawDay {
            date: String,
            open: f64,
            high: f64,
            low: f64,
            close: f64,
            volume: f64,
        }
        let resp = self
            .request(reqwest::Method::GET, "/v1/markets/history")
            .query(&[("symbol", symbol), ("interval", "daily")])
            .send()
            .await
            .map_err(|e| BrokerError::Api(e.to_string()))?;
        let wrapper: Wrapper = resp
            .json()
            .await
            .map_err(|e| BrokerError::UnexpectedPayload(e.to_string()))?;
        let days = match wrapper.history.map(|h| h.day) {
            Some(DaySeries::One(d)) => vec![d],
            Some(DaySeries::Many(d)) => d,
            None => Vec::new(),
        };
        Ok(days
            .into_iter()
            .rev()
            .take(count)
            .rev()
            .filter_map(|d| {
                let timestamp = chrono::NaiveDate::parse_from_str(&d.date, "%Y-%m-%d")
                    .ok()?
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                Some(Candle {
                    timestamp,
                    open: d.open,
                    high: d.high,
                    low: d.low,
                    close: d.close,
                    volume: d.volume,
                })
            })
            .collect())
    }

    async fn get_trade_details(
        &self,
        _trade_id: Option<&str>,
        order_id: Option<&str>,
    ) -> Result<TradeDetails, BrokerError> {
        let order_id = order_id.ok_or_else(|| {
            BrokerError::Api("tradier get_trade_details requires an order_id".to_string())
        })?;
        #[derive(Deserialize)]
        struct Wrapper {
            order: RawOrder,
        }
        #[derive(Deserialize)]
        struct RawOrder {
            symbol: String,
            status: String,
            quantity: f64,
            exec_quantity: Option<f64>,
            avg_fill_price: Option<f64>,
            price: Option<f64>,
            transaction_date: Option<String>,
        }
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/accounts/{}/orders/{}", self.account_id, order_id),
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
        let o = wrapper.order;
        let filled = matches!(o.status.as_str(), "filled" | "canceled" | "cancelled" | "expired" | "rejected");
        Ok(TradeDetails {
            found: true,
            state: if filled { TradeState::Closed } else { TradeState::Open },
            // Tradier reports no realized P&L directly on an order; callers
            // reconstruct it from fill price vs. entry price on the stored
            // execution, never from this field.
            realized_pl: 0.0,
            unrealized_pl: 0.0,
            close_time: o
                .transaction_date
                .as_deref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&chrono::Utc)),
            instrument: o.symbol,
            open_price: o.avg_fill_price.or(o.price).unwrap_or(0.0),
            close_price: None,
            units: o.exec_quantity.unwrap_or(o.quantity),
            broker_data: serde_json::json!({}),
        })
    }
}
