pub mod api;
pub mod binance;
pub mod paper;
pub mod types;

pub use api::ExchangeInterface;
pub use binance::BinanceFutures;
pub use paper::PaperExchange;
pub use types::{OrderAck, OrderRequest, OrderSide, OrderType, RemotePosition, SymbolFilters};
