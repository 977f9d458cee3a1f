//! Pipeline head: weighs a signal batch, asks the oracle, walks the
//! verdict through the risk gate and the confirmation countdown, and
//! executes. Every evaluated batch lands exactly one audit row, whichever
//! branch it takes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::analytics;
use crate::config::TradingConfig;
use crate::confirm::{Confirmation, ConfirmationChannel};
use crate::context::{CalendarProvider, MarketContextProvider};
use crate::decision::risk::RiskGate;
use crate::decision::types::{
    DecisionAction, DecisionOutcome, Direction, EntryStrategy, TradeProposal,
};
use crate::exchange::ExchangeInterface;
use crate::execution::TradeExecutor;
use crate::notify::Notifier;
use crate::oracle::{AdjustPlan, AnalysisRequest, EntryPlan, Oracle, OracleDecision};
use crate::signals::{signal_bias, RawSignal, SignalAggregator, WeightedSignal};
use crate::store::{AiDecision, AnalystCall, RecordStore, Trade};

pub struct DecisionOrchestrator {
    aggregator: SignalAggregator,
    oracle: Arc<dyn Oracle>,
    risk_gate: Arc<Mutex<RiskGate>>,
    confirm: Arc<dyn ConfirmationChannel>,
    executor: Arc<TradeExecutor>,
    exchange: Arc<dyn ExchangeInterface>,
    store: Arc<dyn RecordStore>,
    context: Arc<dyn MarketContextProvider>,
    calendar: Arc<dyn CalendarProvider>,
    notifier: Arc<dyn Notifier>,
    trading: TradingConfig,
}

impl DecisionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        aggregator: SignalAggregator,
        oracle: Arc<dyn Oracle>,
        risk_gate: Arc<Mutex<RiskGate>>,
        confirm: Arc<dyn ConfirmationChannel>,
        executor: Arc<TradeExecutor>,
        exchange: Arc<dyn ExchangeInterface>,
        store: Arc<dyn RecordStore>,
        context: Arc<dyn MarketContextProvider>,
        calendar: Arc<dyn CalendarProvider>,
        notifier: Arc<dyn Notifier>,
        trading: TradingConfig,
    ) -> Self {
        Self {
            aggregator,
            oracle,
            risk_gate,
            confirm,
            executor,
            exchange,
            store,
            context,
            calendar,
            notifier,
            trading,
        }
    }

    /// Evaluates one signal batch end to end and returns how it resolved.
    pub async fn evaluate(&self, batch: &[RawSignal]) -> Result<DecisionOutcome> {
        if batch.is_empty() {
            return Ok(DecisionOutcome::Skip);
        }

        let regime = self.context.regime().await;
        let weighted = self.aggregator.weigh(batch, regime)?;
        let consensus = SignalAggregator::consensus(&weighted);
        let symbols = SignalAggregator::detect_symbols(batch, &self.trading.allowed_symbols);
        info!(
            "🧭 Evaluating batch: {} signal(s), consensus {} ({:.0}%), symbols {:?}",
            batch.len(),
            consensus.dominant,
            consensus.strength,
            symbols
        );

        let request = AnalysisRequest {
            signals: weighted.clone(),
            consensus,
            market_context: self.context.context(&symbols).await,
            open_positions: self.open_positions_context()?,
            performance: serde_json::to_value(analytics::performance_stats(&self.store, 100)?)?,
            known_patterns: self.pattern_context()?,
            lessons: self.recent_lessons()?,
            calendar: self.calendar.upcoming_events().await,
        };

        // An unreachable oracle is a skip, never a pipeline error.
        let decision = match self.oracle.analyze(&request).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("🧭 Oracle unavailable: {}", e);
                OracleDecision::degraded(&format!("oracle unavailable: {e}"))
            }
        };

        let row = match decision {
            OracleDecision::Skip(plan) => {
                let symbol = plan
                    .symbol
                    .unwrap_or_else(|| symbols.first().cloned().unwrap_or_default());
                decision_row(
                    DecisionAction::Skip,
                    DecisionOutcome::Skip,
                    symbol,
                    plan.confidence,
                    plan.reasoning,
                    &weighted,
                )
                .with_cancel_reason(plan.error.unwrap_or_default())
            }
            OracleDecision::Adjust(plan) => self.handle_adjust(plan, &weighted).await?,
            OracleDecision::Long(plan) => {
                self.handle_entry(Direction::Long, plan, &weighted).await?
            }
            OracleDecision::Short(plan) => {
                self.handle_entry(Direction::Short, plan, &weighted).await?
            }
        };

        let outcome = row.outcome;
        self.notifier.decision(&row).await;
        self.store.save_decision(row)?;
        Ok(outcome)
    }

    async fn handle_adjust(&self, plan: AdjustPlan, weighted: &[WeightedSignal]) -> Result<AiDecision> {
        let target = self.resolve_adjust_target(&plan)?;
        let symbol = plan.symbol.clone().unwrap_or_default();
        let base = decision_row(
            DecisionAction::Adjust,
            DecisionOutcome::Rejected,
            symbol,
            plan.confidence,
            plan.reasoning.clone(),
            weighted,
        );

        let Some(trade) = target else {
            warn!("🧭 ADJUST with no matching open trade (id {:?})", plan.trade_id);
            return Ok(base.with_cancel_reason("no matching open trade".to_string()));
        };

        match self
            .executor
            .adjust(trade.id, plan.new_stop_loss, plan.new_take_profit.clone())
            .await
        {
            Ok(updated) => {
                let mut row = base;
                row.symbol = updated.symbol.clone();
                row.outcome = DecisionOutcome::Executed;
                row.trade_id = Some(updated.id);
                Ok(row)
            }
            Err(e) => {
                warn!("🧭 Adjustment failed for trade #{}: {}", trade.id, e);
                Ok(base.with_cancel_reason(e.to_string()))
            }
        }
    }

    fn resolve_adjust_target(&self, plan: &AdjustPlan) -> Result<Option<Trade>> {
        if let Some(id) = plan.trade_id {
            if let Some(trade) = self.store.get_trade(id)? {
                return Ok(Some(trade));
            }
        }
        if let Some(symbol) = &plan.symbol {
            let open = self.store.open_trades()?;
            return Ok(open.into_iter().find(|t| &t.symbol == symbol));
        }
        Ok(None)
    }

    async fn handle_entry(
        &self,
        direction: Direction,
        plan: EntryPlan,
        weighted: &[WeightedSignal],
    ) -> Result<AiDecision> {
        let action = match direction {
            Direction::Long => DecisionAction::Long,
            Direction::Short => DecisionAction::Short,
        };
        let proposal = self.build_proposal(direction, &plan, weighted);
        let base = decision_row(
            action,
            DecisionOutcome::Rejected,
            proposal.symbol.clone(),
            proposal.confidence,
            proposal.reasoning.clone(),
            weighted,
        );

        let reference = match proposal.entry_price {
            Some(p) => p,
            None => self.exchange.price(&proposal.symbol).await.unwrap_or(0.0),
        };
        let risk_reward = if plan.risk_reward > 0.0 {
            plan.risk_reward
        } else {
            proposal.risk_reward(reference)
        };

        let report = {
            let gate = self
                .risk_gate
                .lock()
                .map_err(|_| anyhow::anyhow!("risk gate mutex poisoned"))?;
            gate.check(&proposal, risk_reward)?
        };
        if !report.passed {
            return Ok(base
                .with_outcome(DecisionOutcome::Rejected)
                .with_risk_summary(report.summary()));
        }

        if !self.trading.enabled {
            info!("🧭 Trading disabled, not executing {} {}", proposal.symbol, direction);
            return Ok(base
                .with_outcome(DecisionOutcome::Cancelled)
                .with_risk_summary(report.summary())
                .with_cancel_reason("trading disabled".to_string()));
        }

        let countdown = Duration::from_secs(self.trading.confirmation_delay_secs);
        match self.confirm.send(&proposal, countdown).await {
            Ok(Confirmation::Executed) => {}
            Ok(Confirmation::Cancelled { reason }) => {
                info!("🧭 Proposal cancelled: {}", reason);
                return Ok(base
                    .with_outcome(DecisionOutcome::Cancelled)
                    .with_risk_summary(report.summary())
                    .with_cancel_reason(reason));
            }
            Err(e) => {
                warn!("🧭 Confirmation channel failed: {}", e);
                return Ok(base
                    .with_outcome(DecisionOutcome::Cancelled)
                    .with_risk_summary(report.summary())
                    .with_cancel_reason(format!("confirmation failed: {e}")));
            }
        }

        match self.executor.execute(&proposal).await {
            Ok(receipt) => {
                self.record_calls(receipt.trade.id, weighted);
                self.notifier.trade_opened(&receipt.trade).await;
                Ok(base
                    .with_outcome(DecisionOutcome::Executed)
                    .with_risk_summary(report.summary())
                    .with_trade(receipt.trade.id))
            }
            Err(e) => {
                warn!("🧭 Execution failed for {} {}: {}", proposal.symbol, direction, e);
                Ok(base
                    .with_outcome(DecisionOutcome::Rejected)
                    .with_risk_summary(report.summary())
                    .with_cancel_reason(e.to_string()))
            }
        }
    }

    fn build_proposal(
        &self,
        direction: Direction,
        plan: &EntryPlan,
        weighted: &[WeightedSignal],
    ) -> TradeProposal {
        let max_size = {
            self.risk_gate
                .lock()
                .map(|gate| gate.effective_max_position())
                .unwrap_or(self.trading.max_position_size)
        };
        let mut sources: Vec<String> = weighted.iter().map(|s| s.analyst.clone()).collect();
        sources.sort();
        sources.dedup();

        TradeProposal {
            symbol: plan.symbol.clone(),
            direction,
            confidence: plan.confidence,
            entry_price: plan.entry.as_ref().and_then(|e| e.price),
            entry_strategy: plan
                .entry
                .as_ref()
                .map(|e| e.strategy)
                .unwrap_or(EntryStrategy::Market),
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit.clone(),
            position_size_pct: plan.position_size.min(max_size),
            leverage: self.trading.default_leverage,
            reasoning: plan.reasoning.clone(),
            analyst_sources: sources,
        }
    }

    /// Attaches each signal to the new trade so the post-close review can
    /// grade individual analysts.
    fn record_calls(&self, trade_id: u64, weighted: &[WeightedSignal]) {
        for signal in weighted {
            let call = AnalystCall {
                trade_id,
                analyst_name: signal.analyst.clone(),
                direction: signal_bias(&signal.content),
                message_content: signal.content.clone(),
                timestamp: signal.timestamp,
                was_correct: None,
            };
            if let Err(e) = self.store.record_analyst_call(call) {
                warn!("🧭 Failed to record call for {}: {}", signal.analyst, e);
            }
        }
    }

    fn open_positions_context(&self) -> Result<Value> {
        let open = self.store.open_trades()?;
        Ok(json!(open
            .iter()
            .map(|t| {
                json!({
                    "trade_id": t.id,
                    "symbol": t.symbol,
                    "direction": t.direction,
                    "entry_price": t.entry_price,
                    "stop_loss": t.stop_loss,
                    "take_profit": t.take_profit,
                    "status": t.status,
                })
            })
            .collect::<Vec<_>>()))
    }

    fn pattern_context(&self) -> Result<Value> {
        let patterns = self.store.high_winrate_patterns(3, 0.5)?;
        Ok(json!(patterns
            .iter()
            .map(|p| {
                json!({
                    "pattern": p.pattern_name,
                    "win_rate": p.win_rate,
                    "occurrences": p.occurrences,
                    "avg_profit": p.avg_profit,
                })
            })
            .collect::<Vec<_>>()))
    }

    fn recent_lessons(&self) -> Result<Value> {
        let mut lessons: Vec<String> = Vec::new();
        for trade in self.store.closed_trades(5)? {
            if let Some(review) = &trade.review {
                if let Some(items) = review.get("lessons_learned").and_then(|v| v.as_array()) {
                    lessons.extend(items.iter().filter_map(|l| l.as_str().map(String::from)));
                }
            }
        }
        Ok(json!(lessons))
    }
}

fn decision_row(
    action: DecisionAction,
    outcome: DecisionOutcome,
    symbol: String,
    confidence: f64,
    reasoning: Value,
    weighted: &[WeightedSignal],
) -> AiDecision {
    let mut sources: Vec<String> = weighted.iter().map(|s| s.analyst.clone()).collect();
    sources.sort();
    sources.dedup();
    AiDecision {
        timestamp: Utc::now(),
        symbol,
        action,
        confidence,
        reasoning,
        outcome,
        risk_summary: String::new(),
        cancel_reason: String::new(),
        analyst_sources: sources,
        trade_id: None,
    }
}

trait RowExt {
    fn with_outcome(self, outcome: DecisionOutcome) -> Self;
    fn with_risk_summary(self, summary: String) -> Self;
    fn with_cancel_reason(self, reason: String) -> Self;
    fn with_trade(self, trade_id: u64) -> Self;
}

impl RowExt for AiDecision {
    fn with_outcome(mut self, outcome: DecisionOutcome) -> Self {
        self.outcome = outcome;
        self
    }
    fn with_risk_summary(mut self, summary: String) -> Self {
        self.risk_summary = summary;
        self
    }
    fn with_cancel_reason(mut self, reason: String) -> Self {
        self.cancel_reason = reason;
        self
    }
    fn with_trade(mut self, trade_id: u64) -> Self {
        self.trade_id = Some(trade_id);
        self
    }
}
