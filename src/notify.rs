//! Outbound notification seam. Interactive surfaces (Telegram, web UI)
//! implement `Notifier`; the default just logs, so the pipeline never
//! depends on one being attached.

use async_trait::async_trait;
use tracing::{error, info};

use crate::execution::CloseReceipt;
use crate::store::{AiDecision, Trade};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn decision(&self, decision: &AiDecision);
    async fn trade_opened(&self, trade: &Trade);
    async fn trade_closed(&self, trade: &Trade, receipt: &CloseReceipt);
    async fn learning(&self, summary: &str);
    async fn error(&self, context: &str, message: &str);
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn decision(&self, decision: &AiDecision) {
        info!(
            "📣 Decision: {} {} -> {}",
            decision.action, decision.symbol, decision.outcome
        );
    }

    async fn trade_opened(&self, trade: &Trade) {
        info!(
            "📣 Opened #{}: {} {} @ {} (SL {}, TP {:?})",
            trade.id, trade.direction, trade.symbol, trade.entry_price, trade.stop_loss,
            trade.take_profit
        );
    }

    async fn trade_closed(&self, trade: &Trade, receipt: &CloseReceipt) {
        info!(
            "📣 Closed #{}: {} {} {:+.2}% (${:+.2})",
            trade.id, trade.direction, trade.symbol, receipt.profit_pct, receipt.profit_usd
        );
    }

    async fn learning(&self, summary: &str) {
        info!("📣 Learning: {}", summary);
    }

    async fn error(&self, context: &str, message: &str) {
        error!("📣 {}: {}", context, message);
    }
}
