//! Broker capability interface. `BrokerService` is one trait covering
//! every capability group a broker integration needs; a per-broker subclass
//! hierarchy beyond implementing the trait is deliberately avoided.

pub mod alpaca;
pub mod fake;
pub mod oanda;
pub mod registry;
pub mod tradier;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Candle;
use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Accepted,
    Open,
    Filled,
    PartiallyFilled,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub side: PositionSide,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub cost_basis: f64,
    pub unrealized_pl: f64,
    pub unrealized_pl_percent: f64,
    pub broker_data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub qty: f64,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub filled_price: Option<f64>,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub broker_data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDetails {
    pub found: bool,
    pub state: TradeState,
    pub realized_pl: f64,
    pub unrealized_pl: f64,
    pub close_time: Option<DateTime<Utc>>,
    pub instrument: String,
    pub open_price: f64,
    pub close_price: Option<f64>,
    pub units: f64,
    pub broker_data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub currency: String,
    pub cash: f64,
    pub buying_power: f64,
    pub portfolio_value: f64,
}

/// Every broker implementation exposes this full surface.
/// `has_active_symbol` must propagate API errors rather than swallow them —
/// callers (preflight, reconciliation) depend on distinguishing "no
/// position" from "could not tell".
#[async_trait]
pub trait BrokerService: Send + Sync {
    fn broker_type(&self) -> &'static str;

    async fn test_connection(&self) -> Result<serde_json::Value, BrokerError>;
    async fn get_account_info(&self) -> Result<AccountInfo, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError>;
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, BrokerError>;

    async fn place_order(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        order_type: OrderType,
        limit_price: Option<f64>,
        stop_price: Option<f64>,
        time_in_force: TimeInForce,
    ) -> Result<Order, BrokerError>;

    async fn place_bracket_order(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        take_profit_price: f64,
        stop_loss_price: f64,
        time_in_force: TimeInForce,
    ) -> Result<Order, BrokerError>;

    /// Default implementation: a plain limit order. Brokers with native
    /// limit-bracket support (OANDA) override this.
    async fn place_limit_bracket_order(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        limit_price: f64,
        _take_profit_price: f64,
        _stop_loss_price: f64,
        time_in_force: TimeInForce,
    ) -> Result<Order, BrokerError> {
        self.place_order(
            symbol,
            qty,
            side,
            OrderType::Limit,
            Some(limit_price),
            None,
            time_in_force,
        )
        .await
    }

    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError>;
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;
    async fn close_position(
        &self,
        symbol: &str,
        qty: Option<f64>,
    ) -> Result<serde_json::Value, BrokerError>;

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError>;

    /// Used by the monitoring loop's candle-based invalidation check.
    /// Default: unsupported, empty.
    async fn get_recent_candles(
        &self,
        _symbol: &str,
        _granularity: &str,
        _count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        Ok(Vec::new())
    }

    /// Each broker decides which identifier is meaningful: OANDA keys off
    /// `trade_id`, Tradier and Alpaca key off `order_id`.
    async fn get_trade_details(
        &self,
        trade_id: Option<&str>,
        order_id: Option<&str>,
    ) -> Result<TradeDetails, BrokerError>;

    /// Default composed from `get_position` + `get_orders`; brokers may
    /// override for a cheaper native check.
    async fn has_active_symbol(&self, symbol: &str) -> Result<bool, BrokerError> {
        if let Some(position) = self.get_position(symbol).await? {
            if position.qty != 0.0 {
                return Ok(true);
            }
        }
        let orders = self.get_orders().await?;
        let normalized = symbol.to_uppercase();
        Ok(orders.iter().any(|o| o.symbol.to_uppercase() == normalized))
    }
}
