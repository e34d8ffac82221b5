//! Deterministic in-memory broker used by the trade-manager and executor
//! unit tests. Not compiled into the production binary's broker registry.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::domain::Candle;
use crate::error::BrokerError;

use super::{
    AccountInfo, BrokerService, Order, OrderSide, OrderStatus, OrderType, Position, PositionSide,
    Quote, TimeInForce, TradeDetails, TradeState,
};

#[derive(Debug, Clone, Default)]
pub struct FakeBrokerState {
    pub positions: HashMap<String, Position>,
    pub orders: HashMap<String, Order>,
    pub trade_details: HashMap<String, TradeDetails>,
    pub quotes: HashMap<String, Quote>,
    pub candles: HashMap<String, Vec<Candle>>,
    pub cancelled_orders: Vec<String>,
    pub closed_positions: Vec<String>,
    /// When `Some`, every call fails with this message instead of touching
    /// state — used to simulate the communication-error escalation path.
    pub fail_with: Option<String>,
    pub next_order_id: u64,
}

pub struct FakeBroker {
    pub state: Mutex<FakeBrokerState>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeBrokerState {
                next_order_id: 1,
                ..Default::default()
            }),
        }
    }

    fn maybe_fail(&self) -> Result<(), BrokerError> {
        let state = self.state.lock();
        if let Some(msg) = &state.fail_with {
            return Err(BrokerError::Api(msg.clone()));
        }
        Ok(())
    }

    fn next_id(&self) -> String {
        let mut state = self.state.lock();
        let id = state.next_order_id;
        state.next_order_id += 1;
        format!("fake-order-{id}")
    }
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerService for FakeBroker {
    fn broker_type(&self) -> &'static str {
        "fake"
    }

    async fn test_connection(&self) -> Result<serde_json::Value, BrokerError> {
        self.maybe_fail()?;
        Ok(serde_json::json!({"status": "ok"}))
    }

    async fn get_account_info(&self) -> Result<AccountInfo, BrokerError> {
        self.maybe_fail()?;
        Ok(AccountInfo {
            currency: "USD".to_string(),
            cash: 100_000.0,
            buying_power: 200_000.0,
            portfolio_value: 100_000.0,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.maybe_fail()?;
        Ok(self.state.lock().positions.values().cloned().collect())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        self.maybe_fail()?;
        Ok(self.state.lock().positions.get(symbol).cloned())
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
        self.maybe_fail()?;
        let order_id = self.next_id();
        let order = Order {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            qty,
            side,
            order_type,
            status: OrderStatus::Accepted,
            filled_qty: 0.0,
            filled_price: None,
            limit_price,
            stop_price,
            time_in_force,
            submitted_at: Some(chrono::Utc::now()),
            filled_at: None,
            broker_data: serde_json::json!({}),
        };
        self.state.lock().orders.insert(order_id, order.clone());
        Ok(order)
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
        self.maybe_fail()?;
        let mut order = self
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
        order.broker_data = serde_json::json!({
            "take_profit": take_profit_price,
            "stop_loss": stop_loss_price,
        });
        Ok(order)
    }

    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        self.maybe_fail()?;
        Ok(self.state.lock().orders.values().cloned().collect())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.maybe_fail()?;
        let mut state = self.state.lock();
        state.orders.remove(order_id);
        state.cancelled_orders.push(order_id.to_string());
        Ok(())
    }

    async fn close_position(
        &self,
        symbol: &str,
        _qty: Option<f64>,
    ) -> Result<serde_json::Value, BrokerError> {
        self.maybe_fail()?;
        let mut state = self.state.lock();
        state.positions.remove(symbol);
        state.closed_positions.push(symbol.to_string());
        Ok(serde_json::json!({"success": true}))
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.maybe_fail()?;
        self.state
            .lock()
            .quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::Api(format!("no quote for {symbol}")))
    }

    async fn get_recent_candles(
        &self,
        symbol: &str,
        _granularity: &str,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        self.maybe_fail()?;
        let state = self.state.lock();
        let candles = state.candles.get(symbol).cloned().unwrap_or_default();
        Ok(candles.into_iter().rev().take(count).rev().collect())
    }

    async fn get_trade_details(
        &self,
        trade_id: Option<&str>,
        order_id: Option<&str>,
    ) -> Result<TradeDetails, BrokerError> {
        self.maybe_fail()?;
        let key = trade_id.or(order_id).unwrap_or_default();
        Ok(self
            .state
            .lock()
            .trade_details
            .get(key)
            .cloned()
            .unwrap_or(TradeDetails {
                found: false,
                state: TradeState::Open,
                realized_pl: 0.0,
                unrealized_pl: 0.0,
                close_time: None,
                instrument: key.to_string(),
                open_price: 0.0,
                close_price: None,
                units: 0.0,
                broker_data: serde_json::json!({}),
            }))
    }

    async fn has_active_symbol(&self, symbol: &str) -> Result<bool, BrokerError> {
        self.maybe_fail()?;
        let state = self.state.lock();
        if let Some(position) = state.positions.get(symbol) {
            if position.qty != 0.0 {
                return Ok(true);
            }
        }
        Ok(state
            .orders
            .values()
            .any(|o| o.symbol.eq_ignore_ascii_case(symbol)))
    }
}

pub fn long_position(symbol: &str, qty: f64, entry: f64, current: f64) -> Position {
    let market_value = qty * current;
    let cost_basis = qty * entry;
    Position {
        symbol: symbol.to_string(),
        qty,
        side: PositionSide::Long,
        avg_entry_price: entry,
        current_price: current,
        market_value,
        cost_basis,
        unrealized_pl: market_value - cost_basis,
        unrealized_pl_percent: (market_value - cost_basis) / cost_basis.max(1e-9) * 100.0,
        broker_data: serde_json::json!({}),
    }
}
