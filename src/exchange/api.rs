use anyhow::Result;
use async_trait::async_trait;

use crate::exchange::types::{OrderAck, OrderRequest, RemotePosition, SymbolFilters};

/// The subset of a futures venue the pipeline needs. Implemented by the
/// live Binance client and the in-memory paper venue.
#[async_trait]
pub trait ExchangeInterface: Send + Sync {
    /// Total wallet balance in the quote currency.
    async fn balance(&self) -> Result<f64>;

    /// Last traded price for the symbol.
    async fn price(&self, symbol: &str) -> Result<f64>;

    /// All open positions in one batched call.
    async fn positions(&self) -> Result<Vec<RemotePosition>>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    /// Cancels every resting order for the symbol.
    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;
}
