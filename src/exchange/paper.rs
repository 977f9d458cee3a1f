//! In-memory venue for paper trading and tests. Market orders fill
//! instantly at the posted price; resting take-profits sit in a book that
//! tests can trigger by hand via `fill_resting` or by moving the price.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::exchange::api::ExchangeInterface;
use crate::exchange::types::{
    OrderAck, OrderRequest, OrderSide, OrderType, RemotePosition, SymbolFilters,
};

#[derive(Default)]
struct Book {
    balance: f64,
    prices: HashMap<String, f64>,
    /// Signed quantity per symbol: positive long, negative short.
    positions: HashMap<String, f64>,
    resting: Vec<OrderRequest>,
}

pub struct PaperExchange {
    book: Mutex<Book>,
}

impl PaperExchange {
    pub fn new(initial_balance: f64) -> Self {
        info!("🧾 Paper exchange initialized (balance={initial_balance})");
        Self {
            book: Mutex::new(Book { balance: initial_balance, ..Book::default() }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Book>> {
        self.book.lock().map_err(|_| anyhow!("paper book mutex poisoned"))
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        if let Ok(mut book) = self.book.lock() {
            book.prices.insert(symbol.to_string(), price);
        }
    }

    /// Simulates the venue filling one resting take-profit: reduces the
    /// position by the order's quantity (or flattens it for
    /// closePosition orders) and removes the order from the book.
    pub fn fill_resting(&self, symbol: &str, index: usize) -> Result<()> {
        let mut book = self.lock()?;
        let candidates: Vec<usize> = book
            .resting
            .iter()
            .enumerate()
            .filter(|(_, o)| o.symbol == symbol)
            .map(|(i, _)| i)
            .collect();
        let slot = *candidates
            .get(index)
            .ok_or_else(|| anyhow!("no resting order #{index} for {symbol}"))?;
        let order = book.resting.remove(slot);

        let held = book.positions.get(symbol).copied().unwrap_or(0.0);
        let new_qty = if order.close_position {
            0.0
        } else {
            let fill = order.quantity.unwrap_or(0.0).min(held.abs());
            held - held.signum() * fill
        };
        book.positions.insert(symbol.to_string(), new_qty);
        Ok(())
    }

    pub fn position_qty(&self, symbol: &str) -> f64 {
        self.book
            .lock()
            .map(|b| b.positions.get(symbol).copied().unwrap_or(0.0))
            .unwrap_or(0.0)
    }

    pub fn resting_count(&self, symbol: &str) -> usize {
        self.book
            .lock()
            .map(|b| b.resting.iter().filter(|o| o.symbol == symbol).count())
            .unwrap_or(0)
    }

    /// Zeroes the position without touching local records, as if the
    /// venue closed it behind our back.
    pub fn force_close(&self, symbol: &str) {
        if let Ok(mut book) = self.book.lock() {
            book.positions.insert(symbol.to_string(), 0.0);
        }
    }

    /// Scales the position down, as a partial take-profit fill would.
    pub fn scale_position(&self, symbol: &str, factor: f64) {
        if let Ok(mut book) = self.book.lock() {
            if let Some(qty) = book.positions.get_mut(symbol) {
                *qty *= factor;
            }
        }
    }
}

#[async_trait]
impl ExchangeInterface for PaperExchange {
    async fn balance(&self) -> Result<f64> {
        Ok(self.lock()?.balance)
    }

    async fn price(&self, symbol: &str) -> Result<f64> {
        self.lock()?
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no paper price for {symbol}"))
    }

    async fn positions(&self) -> Result<Vec<RemotePosition>> {
        let book = self.lock()?;
        Ok(book
            .positions
            .iter()
            .map(|(symbol, qty)| RemotePosition {
                symbol: symbol.clone(),
                qty: qty.abs(),
                mark_price: book.prices.get(symbol).copied().unwrap_or(0.0),
            })
            .collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let mut book = self.lock()?;
        match order.order_type {
            OrderType::Market => {
                let qty = order.quantity.unwrap_or(0.0);
                if qty <= 0.0 {
                    return Err(anyhow!("market order without quantity"));
                }
                let held = book.positions.entry(order.symbol.clone()).or_insert(0.0);
                let signed = match order.side {
                    OrderSide::Buy => qty,
                    OrderSide::Sell => -qty,
                };
                if order.reduce_only {
                    // never flip through zero
                    let reduced = *held + signed;
                    *held = if held.signum() == reduced.signum() { reduced } else { 0.0 };
                } else {
                    *held += signed;
                }
            }
            OrderType::Limit | OrderType::TakeProfitMarket => {
                book.resting.push(order.clone());
            }
        }
        Ok(OrderAck { order_id: Uuid::new_v4().to_string() })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        self.lock()?.resting.retain(|o| o.symbol != symbol);
        Ok(())
    }

    async fn symbol_filters(&self, _symbol: &str) -> Result<SymbolFilters> {
        Ok(SymbolFilters::default())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<()> {
        Ok(())
    }
}
