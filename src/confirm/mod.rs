//! Human confirmation seam. The pipeline proposes, the channel gets a
//! bounded countdown to object; silence means execute. An interactive
//! implementation may also solicit a cancel reason on its own sub-timeout.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::decision::types::TradeProposal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Executed,
    Cancelled { reason: String },
}

#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    /// Presents the proposal and waits at most `countdown` for a verdict.
    /// Timing out is an affirmative, not a cancel.
    async fn send(&self, proposal: &TradeProposal, countdown: Duration) -> Result<Confirmation>;
}

/// Headless channel used when no interactive surface is attached: waits
/// out the countdown, then proceeds.
pub struct AutoConfirm;

#[async_trait]
impl ConfirmationChannel for AutoConfirm {
    async fn send(&self, proposal: &TradeProposal, countdown: Duration) -> Result<Confirmation> {
        info!(
            "⏳ {} {} pending, auto-executing in {}s",
            proposal.symbol,
            proposal.direction,
            countdown.as_secs()
        );
        tokio::time::sleep(countdown).await;
        Ok(Confirmation::Executed)
    }
}
