//! Order lifecycle: entry, protective orders, adjustment and closure.
//!
//! The stop-loss is deliberately never placed as a resting exchange order;
//! transient wicks would trigger it. It lives in the trade record and is
//! enforced by the position monitor with multi-poll confirmation.
//! Take-profit levels are resting orders, since an early partial fill has
//! no downside.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::FeesConfig;
use crate::decision::types::{Direction, EntryStrategy, TradeProposal};
use crate::exchange::{ExchangeInterface, OrderRequest, OrderSide};
use crate::store::{Outcome, RecordStore, Trade, TradeStatus};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("trade #{0} not found")]
    TradeNotFound(u64),
    #[error("trade #{0} already closed")]
    AlreadyClosed(u64),
    #[error("computed order quantity is not positive")]
    InvalidQuantity,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Round-trip cost as a percentage of margin. Entry and exit legs default
/// to the taker rate; a limit entry pays maker instead.
pub fn round_trip_fee_pct(fees: &FeesConfig, leverage: u32, maker_entry: bool) -> f64 {
    let entry_rate = if maker_entry { fees.maker_rate } else { fees.taker_rate };
    (entry_rate + fees.taker_rate + fees.slippage_rate * 2.0) * leverage as f64 * 100.0
}

/// Entry + exit + slippage, unleveraged. Used for the breakeven stop.
pub fn round_trip_fee_rate(fees: &FeesConfig) -> f64 {
    fees.taker_rate + fees.taker_rate + fees.slippage_rate * 2.0
}

/// Fee-aware leveraged PnL as a percentage of margin. The single formula
/// used for realized and unrealized numbers alike. Both legs are charged
/// at the taker rate, even for limit entries.
pub fn realized_profit_pct(
    fees: &FeesConfig,
    direction: Direction,
    entry: f64,
    exit: f64,
    leverage: u32,
) -> f64 {
    let raw_pct = direction.sign() * (exit - entry) / entry * 100.0;
    raw_pct * leverage as f64 - round_trip_fee_pct(fees, leverage, false)
}

#[derive(Debug, Clone)]
pub struct ExecutionReceipt {
    pub trade: Trade,
    pub quantity: f64,
}

#[derive(Debug, Clone)]
pub struct CloseReceipt {
    pub trade_id: u64,
    pub exit_price: f64,
    pub profit_pct: f64,
    pub profit_usd: f64,
    pub fee_pct: f64,
    pub outcome: Outcome,
    pub hold_duration_secs: i64,
}

pub struct TradeExecutor {
    exchange: Arc<dyn ExchangeInterface>,
    store: Arc<dyn RecordStore>,
    fees: FeesConfig,
    /// Trades with a close in flight; guards against concurrent
    /// double-close double-counting PnL.
    closing: Mutex<HashSet<u64>>,
}

impl TradeExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeInterface>,
        store: Arc<dyn RecordStore>,
        fees: FeesConfig,
    ) -> Self {
        Self { exchange, store, fees, closing: Mutex::new(HashSet::new()) }
    }

    pub fn fees(&self) -> &FeesConfig {
        &self.fees
    }

    pub async fn execute(
        &self,
        proposal: &TradeProposal,
    ) -> Result<ExecutionReceipt, LifecycleError> {
        let symbol = &proposal.symbol;

        // Leverage failures are not fatal; the venue keeps its last value.
        if let Err(e) = self.exchange.set_leverage(symbol, proposal.leverage).await {
            warn!("⚠️ Failed to set leverage for {}: {}", symbol, e);
        }

        let entry_price = match proposal.entry_price {
            Some(p) if p > 0.0 => p,
            _ => self.exchange.price(symbol).await?,
        };

        let balance = self.exchange.balance().await?;
        let filters = self.exchange.symbol_filters(symbol).await?;

        let notional = balance * (proposal.position_size_pct / 100.0) * proposal.leverage as f64;
        let quantity = filters.round_qty(notional / entry_price);
        if quantity <= 0.0 {
            return Err(LifecycleError::InvalidQuantity);
        }

        let side = match proposal.direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        };
        let order = match proposal.entry_strategy {
            EntryStrategy::Market => OrderRequest::market(symbol, side, quantity),
            EntryStrategy::Limit => {
                OrderRequest::limit(symbol, side, quantity, filters.round_price(entry_price))
            }
        };
        let ack = self.exchange.place_order(&order).await?;

        let trade = self.store.create_trade(Trade {
            id: 0,
            timestamp: Utc::now(),
            symbol: symbol.clone(),
            direction: proposal.direction,
            analyst_opinions: serde_json::json!(proposal.analyst_sources),
            ai_reasoning: proposal.reasoning.clone(),
            confidence: proposal.confidence,
            entry_price,
            exit_price: None,
            stop_loss: proposal.stop_loss,
            take_profit: proposal.take_profit.clone(),
            position_size: proposal.position_size_pct,
            leverage: proposal.leverage,
            entry_order_id: Some(ack.order_id),
            exit_order_id: None,
            profit_pct: None,
            profit_usd: None,
            hold_duration_secs: None,
            outcome: None,
            review: None,
            status: TradeStatus::Open,
            closed_at: None,
        })?;

        self.place_take_profits(&trade, quantity, side.flip()).await;
        info!(
            "🚀 Trade executed: #{} {} {} @ {} qty={}",
            trade.id, proposal.direction, symbol, entry_price, quantity
        );
        Ok(ExecutionReceipt { trade, quantity })
    }

    /// Places resting TP orders. Two targets: half the position at TP1,
    /// the remainder at TP2. One target: flatten everything there. The
    /// stop-loss stays local. Failures here degrade to warnings; a
    /// position without resting TPs is still monitored.
    async fn place_take_profits(&self, trade: &Trade, quantity: f64, close_side: OrderSide) {
        info!("🛑 Stop loss at {} (local monitor, no exchange order)", trade.stop_loss);

        let targets = &trade.take_profit;
        if targets.is_empty() {
            return;
        }

        if targets.len() >= 2 {
            let filters = match self.exchange.symbol_filters(&trade.symbol).await {
                Ok(f) => f,
                Err(e) => {
                    warn!("⚠️ Failed to fetch filters for {}: {}", trade.symbol, e);
                    Default::default()
                }
            };
            let half = filters.round_qty(quantity * 0.5);
            let tp1 = OrderRequest::take_profit_partial(&trade.symbol, close_side, targets[0], half);
            match self.exchange.place_order(&tp1).await {
                Ok(_) => info!("🎯 Take profit 1 set at {} (qty={})", targets[0], half),
                Err(e) => warn!("⚠️ Failed to set TP1: {}", e),
            }
            let tp2 = OrderRequest::take_profit_all(&trade.symbol, close_side, targets[1]);
            match self.exchange.place_order(&tp2).await {
                Ok(_) => info!("🎯 Take profit 2 set at {} (close all)", targets[1]),
                Err(e) => warn!("⚠️ Failed to set TP2: {}", e),
            }
        } else {
            let tp = OrderRequest::take_profit_all(&trade.symbol, close_side, targets[0]);
            match self.exchange.place_order(&tp).await {
                Ok(_) => info!("🎯 Take profit set at {} (close all)", targets[0]),
                Err(e) => warn!("⚠️ Failed to set TP: {}", e),
            }
        }
    }

    /// Re-points protective levels on an open position. Not a new-risk
    /// event, so it never passes through the risk gate.
    pub async fn adjust(
        &self,
        trade_id: u64,
        new_stop_loss: Option<f64>,
        new_take_profit: Option<Vec<f64>>,
    ) -> Result<Trade, LifecycleError> {
        let mut trade = self
            .store
            .get_trade(trade_id)?
            .ok_or(LifecycleError::TradeNotFound(trade_id))?;
        if trade.status == TradeStatus::Closed {
            return Err(LifecycleError::AlreadyClosed(trade_id));
        }

        if let Err(e) = self.exchange.cancel_all_orders(&trade.symbol).await {
            warn!("⚠️ Failed to cancel existing orders for {}: {}", trade.symbol, e);
        }

        let mut changes = Vec::new();
        if let Some(sl) = new_stop_loss {
            changes.push(format!("SL: {} -> {}", trade.stop_loss, sl));
            trade.stop_loss = sl;
        }
        if let Some(tp) = new_take_profit {
            changes.push(format!("TP: {:?} -> {:?}", trade.take_profit, tp));
            trade.take_profit = tp;
        }

        info!("🛑 Stop loss at {} (local monitor)", trade.stop_loss);
        if let Some(first_tp) = trade.take_profit.first() {
            let close_side = match trade.direction {
                Direction::Long => OrderSide::Sell,
                Direction::Short => OrderSide::Buy,
            };
            let tp = OrderRequest::take_profit_all(&trade.symbol, close_side, *first_tp);
            match self.exchange.place_order(&tp).await {
                Ok(_) => info!("🎯 New take profit set at {}", first_tp),
                Err(e) => warn!("⚠️ Failed to set new TP: {}", e),
            }
        }

        self.store.update_trade(&trade)?;
        info!("🔧 Trade #{} adjusted: {}", trade_id, changes.join(", "));
        Ok(trade)
    }

    /// Rebuilds the resting protective orders after a partial fill
    /// changed the remaining quantity. Cancels everything and re-places a
    /// close-all TP at the last target; the stop-loss stays local.
    pub async fn resync_protective_orders(&self, trade_id: u64) -> Result<(), LifecycleError> {
        let trade = self
            .store
            .get_trade(trade_id)?
            .ok_or(LifecycleError::TradeNotFound(trade_id))?;
        if trade.status == TradeStatus::Closed {
            return Err(LifecycleError::AlreadyClosed(trade_id));
        }

        if let Err(e) = self.exchange.cancel_all_orders(&trade.symbol).await {
            warn!("⚠️ Failed to cancel stale orders for {}: {}", trade.symbol, e);
        }

        let Some(last_tp) = trade.take_profit.last() else {
            return Ok(());
        };
        let close_side = match trade.direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        };
        let tp = OrderRequest::take_profit_all(&trade.symbol, close_side, *last_tp);
        match self.exchange.place_order(&tp).await {
            Ok(_) => info!("🎯 Remaining position rides to {} (close all)", last_tp),
            Err(e) => warn!("⚠️ Failed to re-place TP: {}", e),
        }
        Ok(())
    }

    /// Flattens the remaining quantity and settles the record. Uses the
    /// venue-reported quantity, not the locally assumed one, to tolerate
    /// drift. Refuses to re-close.
    pub async fn close(
        &self,
        trade_id: u64,
        exit_price: Option<f64>,
    ) -> Result<CloseReceipt, LifecycleError> {
        {
            let mut closing = self
                .closing
                .lock()
                .map_err(|_| anyhow!("closing-guard mutex poisoned"))?;
            if !closing.insert(trade_id) {
                return Err(LifecycleError::AlreadyClosed(trade_id));
            }
        }
        let result = self.close_inner(trade_id, exit_price).await;
        if result.is_err() {
            if let Ok(mut closing) = self.closing.lock() {
                closing.remove(&trade_id);
            }
        }
        result
    }

    async fn close_inner(
        &self,
        trade_id: u64,
        exit_price: Option<f64>,
    ) -> Result<CloseReceipt, LifecycleError> {
        let mut trade = self
            .store
            .get_trade(trade_id)?
            .ok_or(LifecycleError::TradeNotFound(trade_id))?;
        if trade.status == TradeStatus::Closed {
            return Err(LifecycleError::AlreadyClosed(trade_id));
        }

        if let Err(e) = self.exchange.cancel_all_orders(&trade.symbol).await {
            warn!("⚠️ Failed to cancel open orders for {}: {}", trade.symbol, e);
        }

        // Market-close whatever the venue says is left.
        match self.exchange.positions().await {
            Ok(positions) => {
                let remote_qty = positions
                    .iter()
                    .find(|p| p.symbol == trade.symbol)
                    .map(|p| p.qty)
                    .unwrap_or(0.0);
                if remote_qty > 0.0 {
                    let close_side = match trade.direction {
                        Direction::Long => OrderSide::Sell,
                        Direction::Short => OrderSide::Buy,
                    };
                    let order = OrderRequest::market_close(&trade.symbol, close_side, remote_qty);
                    match self.exchange.place_order(&order).await {
                        Ok(_) => info!(
                            "📕 Closed position: {} {} qty={}",
                            close_side.as_str(),
                            trade.symbol,
                            remote_qty
                        ),
                        Err(e) => warn!("⚠️ Market close failed: {} (settling record anyway)", e),
                    }
                } else {
                    info!("📕 No remote position left for {}, settling record only", trade.symbol);
                }
            }
            Err(e) => warn!("⚠️ Position query failed during close: {}", e),
        }

        let exit_price = match exit_price {
            Some(p) => p,
            None => self
                .exchange
                .price(&trade.symbol)
                .await
                .context("failed to fetch exit price")?,
        };

        let profit_pct = realized_profit_pct(
            &self.fees,
            trade.direction,
            trade.entry_price,
            exit_price,
            trade.leverage,
        );
        let fee_pct = round_trip_fee_pct(&self.fees, trade.leverage, false);
        let outcome = if profit_pct > 0.0 {
            Outcome::Win
        } else if profit_pct < 0.0 {
            Outcome::Loss
        } else {
            Outcome::Breakeven
        };

        let margin = match self.exchange.balance().await {
            Ok(balance) => balance * trade.position_size / 100.0,
            Err(e) => {
                warn!("⚠️ Balance query failed, recording zero margin: {}", e);
                0.0
            }
        };
        let profit_usd = margin * profit_pct / 100.0;

        let now = Utc::now();
        let hold_duration_secs = (now - trade.timestamp).num_seconds();

        trade.exit_price = Some(exit_price);
        trade.profit_pct = Some((profit_pct * 1e4).round() / 1e4);
        trade.profit_usd = Some((profit_usd * 1e4).round() / 1e4);
        trade.hold_duration_secs = Some(hold_duration_secs);
        trade.outcome = Some(outcome);
        trade.status = TradeStatus::Closed;
        trade.closed_at = Some(now);
        self.store.update_trade(&trade)?;

        info!(
            "📕 Trade #{} closed: {:?} {:+.2}% (fee: {:.2}%) @ {}",
            trade_id, outcome, profit_pct, fee_pct, exit_price
        );
        Ok(CloseReceipt {
            trade_id,
            exit_price,
            profit_pct,
            profit_usd,
            fee_pct,
            outcome,
            hold_duration_secs,
        })
    }
}

impl OrderSide {
    fn flip(self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::store::MemoryStore;

    fn fees() -> FeesConfig {
        FeesConfig { taker_rate: 0.0004, maker_rate: 0.0002, slippage_rate: 0.0001 }
    }

    fn proposal(symbol: &str, direction: Direction) -> TradeProposal {
        TradeProposal {
            symbol: symbol.to_string(),
            direction,
            confidence: 82.0,
            entry_price: None,
            entry_strategy: EntryStrategy::Market,
            stop_loss: 98.0,
            take_profit: vec![104.0, 108.0],
            position_size_pct: 2.0,
            leverage: 50,
            reasoning: serde_json::json!({"technical": "test"}),
            analyst_sources: vec!["alice".to_string()],
        }
    }

    fn setup() -> (Arc<PaperExchange>, Arc<MemoryStore>, TradeExecutor) {
        let venue = Arc::new(PaperExchange::new(10_000.0));
        let store = Arc::new(MemoryStore::new());
        let executor = TradeExecutor::new(venue.clone(), store.clone(), fees());
        (venue, store, executor)
    }

    #[test]
    fn fee_and_pnl_formulas() {
        let fees = fees();
        // (0.0004 + 0.0004 + 2*0.0001) * 50 * 100 = 5.0
        assert!((round_trip_fee_pct(&fees, 50, false) - 5.0).abs() < 1e-9);
        // entry 100 -> 101 long at 50x: 1% * 50 - 5 = 45
        let pnl = realized_profit_pct(&fees, Direction::Long, 100.0, 101.0, 50);
        assert!((pnl - 45.0).abs() < 1e-9);
        // same move against a short
        let pnl = realized_profit_pct(&fees, Direction::Short, 100.0, 101.0, 50);
        assert!((pnl + 55.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn execute_opens_position_and_rests_take_profits() {
        let (venue, store, executor) = setup();
        venue.set_price("BTCUSDT", 100.0);

        let receipt = executor.execute(&proposal("BTCUSDT", Direction::Long)).await.unwrap();
        // 10000 * 2% * 50x / 100 = 100 units
        assert!((receipt.quantity - 100.0).abs() < 1e-9);
        assert!((venue.position_qty("BTCUSDT") - 100.0).abs() < 1e-9);
        // two resting TPs, no resting stop
        assert_eq!(venue.resting_count("BTCUSDT"), 2);

        let trade = store.get_trade(receipt.trade.id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.entry_price, 100.0);
    }

    #[tokio::test]
    async fn close_settles_fee_aware_pnl() {
        let (venue, store, executor) = setup();
        venue.set_price("BTCUSDT", 100.0);
        let receipt = executor.execute(&proposal("BTCUSDT", Direction::Long)).await.unwrap();

        venue.set_price("BTCUSDT", 101.0);
        let close = executor.close(receipt.trade.id, None).await.unwrap();
        assert!((close.profit_pct - 45.0).abs() < 1e-9);
        assert_eq!(close.outcome, Outcome::Win);
        // margin = 10000 * 2% = 200; 45% of that
        assert!((close.profit_usd - 90.0).abs() < 1e-9);

        let trade = store.get_trade(receipt.trade.id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(venue.position_qty("BTCUSDT"), 0.0);
        assert_eq!(venue.resting_count("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn double_close_is_rejected() {
        let (venue, _store, executor) = setup();
        venue.set_price("ETHUSDT", 2600.0);
        let receipt = executor.execute(&proposal("ETHUSDT", Direction::Short)).await.unwrap();

        executor.close(receipt.trade.id, Some(2590.0)).await.unwrap();
        let err = executor.close(receipt.trade.id, Some(2500.0)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyClosed(_)));
    }

    #[tokio::test]
    async fn concurrent_close_settles_exactly_once() {
        let (venue, store, executor) = setup();
        venue.set_price("BTCUSDT", 100.0);
        let receipt = executor.execute(&proposal("BTCUSDT", Direction::Long)).await.unwrap();
        venue.set_price("BTCUSDT", 101.0);

        let executor = Arc::new(executor);
        let id = receipt.trade.id;
        let first = executor.clone();
        let second = executor.clone();
        let (a, b) = tokio::join!(
            first.close(id, Some(101.0)),
            second.close(id, Some(101.0)),
        );
        assert!(a.is_ok() != b.is_ok(), "exactly one close must win");

        let trade = store.get_trade(id).unwrap().unwrap();
        assert!((trade.profit_pct.unwrap() - 45.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn resync_replaces_resting_orders_with_final_target() {
        let (venue, _store, executor) = setup();
        venue.set_price("BTCUSDT", 100.0);
        let receipt = executor.execute(&proposal("BTCUSDT", Direction::Long)).await.unwrap();
        assert_eq!(venue.resting_count("BTCUSDT"), 2);

        executor.resync_protective_orders(receipt.trade.id).await.unwrap();
        // one close-all TP at the last target, nothing else
        assert_eq!(venue.resting_count("BTCUSDT"), 1);

        executor.close(receipt.trade.id, Some(100.0)).await.unwrap();
        let err = executor.resync_protective_orders(receipt.trade.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyClosed(_)));
    }

    #[tokio::test]
    async fn adjust_rewrites_levels_and_rejects_closed_trades() {
        let (venue, store, executor) = setup();
        venue.set_price("BTCUSDT", 100.0);
        let receipt = executor.execute(&proposal("BTCUSDT", Direction::Long)).await.unwrap();

        let trade = executor
            .adjust(receipt.trade.id, Some(99.5), Some(vec![105.0]))
            .await
            .unwrap();
        assert_eq!(trade.stop_loss, 99.5);
        assert_eq!(trade.take_profit, vec![105.0]);
        let stored = store.get_trade(receipt.trade.id).unwrap().unwrap();
        assert_eq!(stored.stop_loss, 99.5);

        executor.close(receipt.trade.id, Some(100.0)).await.unwrap();
        let err = executor.adjust(receipt.trade.id, Some(99.0), None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyClosed(_)));

        let err = executor.adjust(999, Some(1.0), None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::TradeNotFound(999)));
    }
}
