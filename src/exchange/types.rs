use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// One outbound order. Constructors cover the shapes the pipeline
/// actually sends; everything else stays None.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    /// TAKE_PROFIT_MARKET with closePosition=true flattens whatever
    /// remains, regardless of quantity drift.
    pub close_position: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity: Some(quantity),
            price: None,
            stop_price: None,
            reduce_only: false,
            close_position: false,
        }
    }

    pub fn limit(symbol: &str, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity: Some(quantity),
            price: Some(price),
            stop_price: None,
            reduce_only: false,
            close_position: false,
        }
    }

    /// Resting partial take-profit for a fixed quantity.
    pub fn take_profit_partial(symbol: &str, side: OrderSide, stop_price: f64, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::TakeProfitMarket,
            quantity: Some(quantity),
            price: None,
            stop_price: Some(stop_price),
            reduce_only: false,
            close_position: false,
        }
    }

    /// Resting take-profit that closes the whole remaining position.
    pub fn take_profit_all(symbol: &str, side: OrderSide, stop_price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::TakeProfitMarket,
            quantity: None,
            price: None,
            stop_price: Some(stop_price),
            reduce_only: false,
            close_position: true,
        }
    }

    pub fn market_close(symbol: &str, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity: Some(quantity),
            price: None,
            stop_price: None,
            reduce_only: true,
            close_position: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// Remote position snapshot from the batched query. Quantity is always
/// reported as an absolute value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePosition {
    pub symbol: String,
    pub qty: f64,
    pub mark_price: f64,
}

/// LOT_SIZE / PRICE_FILTER precision for one instrument.
#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub step_size: Decimal,
    pub tick_size: Decimal,
}

impl SymbolFilters {
    pub fn round_qty(&self, qty: f64) -> f64 {
        round_to_scale(qty, self.step_size)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_to_scale(price, self.tick_size)
    }
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            step_size: Decimal::new(1, 3), // 0.001
            tick_size: Decimal::new(1, 2), // 0.01
        }
    }
}

fn round_to_scale(value: f64, step: Decimal) -> f64 {
    let Some(dec) = Decimal::from_f64(value) else {
        return value;
    };
    let scale = step.normalize().scale();
    dec.round_dp(scale).to_f64().unwrap_or(value)
}
