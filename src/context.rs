//! Market context collaborators. The pipeline treats everything here as
//! opaque: context blobs go straight into the oracle prompt, and the
//! regime read only nudges analyst weights.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::exchange::ExchangeInterface;
use crate::signals::MarketRegime;

#[async_trait]
pub trait MarketContextProvider: Send + Sync {
    /// Per-symbol context blob for the oracle prompt.
    async fn context(&self, symbols: &[String]) -> Value;

    /// Current regime read, if the provider has one.
    async fn regime(&self) -> Option<MarketRegime>;
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Pre-formatted upcoming-events text.
    async fn upcoming_events(&self) -> String;
}

/// Minimal context provider backed by venue ticker prices. No regime
/// detection; richer providers plug in behind the same trait.
pub struct TickerContext {
    exchange: Arc<dyn ExchangeInterface>,
}

impl TickerContext {
    pub fn new(exchange: Arc<dyn ExchangeInterface>) -> Self {
        Self { exchange }
    }
}

#[async_trait]
impl MarketContextProvider for TickerContext {
    async fn context(&self, symbols: &[String]) -> Value {
        let mut out = serde_json::Map::new();
        for symbol in symbols {
            match self.exchange.price(symbol).await {
                Ok(price) => {
                    out.insert(symbol.clone(), json!({ "price": price }));
                }
                Err(e) => warn!("📈 Price lookup failed for {}: {}", symbol, e),
            }
        }
        Value::Object(out)
    }

    async fn regime(&self) -> Option<MarketRegime> {
        None
    }
}

/// Calendar stub used when no events feed is configured.
pub struct NoCalendar;

#[async_trait]
impl CalendarProvider for NoCalendar {
    async fn upcoming_events(&self) -> String {
        String::new()
    }
}
