//! Feedback controller: turns closed trades into analyst weight updates,
//! mined signal patterns, and re-tuned risk thresholds.
//!
//! Weight updates blend lifetime accuracy with a trailing-7-day window so
//! an analyst who went cold decays faster than their lifetime stats alone
//! would suggest. All weights live in [0.5, 2.0].

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{info, warn};

use crate::config::LearningConfig;
use crate::decision::risk::RiskGate;
use crate::decision::types::Direction;
use crate::oracle::{AnalystJudgment, Oracle, TradeReview};
use crate::store::{Outcome, RecordStore, SignalPattern, Trade, TradeStatus};

pub const MIN_WEIGHT: f64 = 0.5;
pub const MAX_WEIGHT: f64 = 2.0;

/// Occurrence floor for a mined pattern to be surfaced.
const PATTERN_MIN_OCCURRENCES: u32 = 3;
const PATTERN_MIN_WINRATE: f64 = 0.5;
/// Minimum bucket population for threshold re-tuning.
const MIN_BUCKET_SAMPLES: usize = 5;
const RR_THRESHOLDS: [f64; 5] = [1.0, 1.5, 2.0, 2.5, 3.0];
const OPTIMIZER_LOOKBACK: usize = 200;

/// What one feedback pass produced. Notes are short human-readable lines
/// for the notification surface.
#[derive(Debug, Default)]
pub struct LearningReport {
    pub review: Option<TradeReview>,
    pub notes: Vec<String>,
}

pub struct FeedbackController {
    store: Arc<dyn RecordStore>,
    oracle: Arc<dyn Oracle>,
    risk_gate: Arc<Mutex<RiskGate>>,
    cfg: LearningConfig,
}

impl FeedbackController {
    pub fn new(
        store: Arc<dyn RecordStore>,
        oracle: Arc<dyn Oracle>,
        risk_gate: Arc<Mutex<RiskGate>>,
        cfg: LearningConfig,
    ) -> Self {
        Self { store, oracle, risk_gate, cfg }
    }

    /// Full feedback pass for one closed trade: oracle review, analyst
    /// grading, pattern recording, and any scheduled batch analysis.
    pub async fn on_trade_closed(&self, trade_id: u64) -> Result<LearningReport> {
        let mut report = LearningReport::default();
        if !self.cfg.enabled {
            return Ok(report);
        }
        let Some(trade) = self.store.get_trade(trade_id)? else {
            warn!("🎓 Feedback requested for unknown trade #{}", trade_id);
            return Ok(report);
        };
        if trade.status != TradeStatus::Closed {
            return Ok(report);
        }

        match self.oracle.review(&trade).await {
            Ok(review) => {
                self.apply_review(&trade, &review)?;
                report.notes.push(format!(
                    "trade #{}: {} analyst judgment(s) applied",
                    trade.id,
                    review.analyst_performance.len()
                ));
                report.review = Some(review);
            }
            // A dead oracle never blocks the bookkeeping below.
            Err(e) => {
                warn!("🎓 Review failed for trade #{}, skipping: {}", trade.id, e);
                report
                    .notes
                    .push(format!("trade #{}: review unavailable ({})", trade.id, e));
            }
        }

        self.record_pattern(&trade)?;

        let closed = self.store.closed_trade_count()? as usize;
        if closed >= self.cfg.min_trades_before_learning {
            if closed % self.cfg.pattern_analysis_frequency == 0 {
                let surfaced = self.mine_patterns()?;
                if !surfaced.is_empty() {
                    report.notes.push(format!(
                        "{} recurring setup(s) above the win-rate floor",
                        surfaced.len()
                    ));
                }
            }
            if closed % self.cfg.parameter_optimization_frequency == 0 {
                if let Some(summary) = self.retune_thresholds()? {
                    report.notes.push(summary);
                }
            }
        }
        Ok(report)
    }

    fn apply_review(&self, trade: &Trade, review: &TradeReview) -> Result<()> {
        for judgment in &review.analyst_performance {
            if let Err(e) = self.apply_judgment(trade.id, judgment) {
                warn!("🎓 Weight update failed for {}: {}", judgment.name, e);
            }
        }

        let mut updated = trade.clone();
        updated.review = Some(serde_json::to_value(review)?);
        self.store.update_trade(&updated)?;
        info!(
            "🎓 Review stored for trade #{} ({} analyst judgment(s), score {:?})",
            trade.id,
            review.analyst_performance.len(),
            review.overall_score
        );
        Ok(())
    }

    fn apply_judgment(&self, trade_id: u64, judgment: &AnalystJudgment) -> Result<()> {
        self.store
            .mark_call_result(trade_id, &judgment.name, judgment.was_correct)?;

        let mut analyst = self.store.get_or_create_analyst(&judgment.name)?;
        analyst.total_calls += 1;
        if judgment.was_correct {
            analyst.correct_calls += 1;
        }
        analyst.accuracy = analyst.correct_calls as f64 / analyst.total_calls as f64;

        // Ungraded history reads as coin-flip, not as zero.
        let recent_7d = self
            .store
            .recent_call_accuracy(&judgment.name, 7)?
            .unwrap_or(0.5);
        let recent_30d = self
            .store
            .recent_call_accuracy(&judgment.name, 30)?
            .unwrap_or(0.5);
        analyst.recent_7d_accuracy = recent_7d;
        analyst.recent_30d_accuracy = recent_30d;

        let blended =
            analyst.accuracy * self.cfg.performance_weight + recent_7d * self.cfg.recency_weight;
        let base = (blended * 2.0).clamp(MIN_WEIGHT, MAX_WEIGHT);
        let nudge = judgment.weight_adjustment.clamp(-0.1, 0.1);
        let old_weight = analyst.weight;
        analyst.weight = (base + nudge).clamp(MIN_WEIGHT, MAX_WEIGHT);

        info!(
            "🎓 {} weight {:.2} -> {:.2} (accuracy {:.0}%, 7d {:.0}%)",
            analyst.name,
            old_weight,
            analyst.weight,
            analyst.accuracy * 100.0,
            recent_7d * 100.0
        );
        self.store.update_analyst(&analyst)
    }

    /// Records the signal combination that produced this trade under a
    /// stable key: sorted analysts plus a coarse technical tag.
    fn record_pattern(&self, trade: &Trade) -> Result<()> {
        let mut analysts: Vec<String> = self
            .store
            .calls_for_trade(trade.id)?
            .into_iter()
            .map(|c| c.analyst_name)
            .collect();
        analysts.sort();
        analysts.dedup();
        if analysts.is_empty() {
            return Ok(());
        }

        let tag = technical_tag(&trade.ai_reasoning);
        let key = format!("{}|{}", analysts.join("+"), tag);
        let conditions = serde_json::json!({
            "analysts": analysts,
            "technical": tag,
            "direction": trade.direction,
        });
        self.store.upsert_pattern(
            &key,
            conditions,
            trade.outcome == Some(Outcome::Win),
            trade.profit_pct.unwrap_or(0.0),
        )
    }

    /// Surfaces recurring combinations that keep winning. The result also
    /// feeds the oracle's context on the next decision.
    pub fn mine_patterns(&self) -> Result<Vec<SignalPattern>> {
        let patterns = self
            .store
            .high_winrate_patterns(PATTERN_MIN_OCCURRENCES, PATTERN_MIN_WINRATE)?;
        if patterns.is_empty() {
            info!("🎓 Pattern analysis: nothing above the occurrence/win-rate floor yet");
            return Ok(patterns);
        }
        for p in &patterns {
            info!(
                "🎓 Pattern {}: {:.0}% win rate over {} occurrence(s), avg {:+.2}%",
                p.pattern_name,
                p.win_rate * 100.0,
                p.occurrences,
                p.avg_profit
            );
        }
        Ok(patterns)
    }

    /// Re-tunes the soft confidence and risk/reward thresholds from
    /// realized outcomes, then pushes them into the live risk gate.
    pub fn retune_thresholds(&self) -> Result<Option<String>> {
        let closed = self.store.closed_trades(OPTIMIZER_LOOKBACK)?;
        let best_confidence = best_confidence_bucket(&closed);
        let best_rr = best_rr_threshold(&closed);

        if best_confidence.is_none() && best_rr.is_none() {
            info!("🎓 Threshold re-tune: not enough samples per bucket yet");
            return Ok(None);
        }

        let mut gate = self
            .risk_gate
            .lock()
            .map_err(|_| anyhow::anyhow!("risk gate mutex poisoned"))?;
        gate.update_soft_limits(best_confidence, best_rr);

        let mut parts = Vec::new();
        if let Some(c) = best_confidence {
            parts.push(format!("confidence floor {c:.0}"));
        }
        if let Some(rr) = best_rr {
            parts.push(format!("risk/reward floor {rr:.1}"));
        }
        Ok(Some(format!("soft limits re-tuned: {}", parts.join(", "))))
    }
}

/// Coarse technical read from the decision reasoning blob.
fn technical_tag(reasoning: &serde_json::Value) -> &'static str {
    let text = reasoning.to_string().to_lowercase();
    let bullish = text.contains("bullish");
    let bearish = text.contains("bearish");
    match (bullish, bearish) {
        (true, false) => "bullish_tech",
        (false, true) => "bearish_tech",
        _ => "mixed",
    }
}

/// Risk/reward actually taken at entry, derived from the stored levels.
fn derived_risk_reward(trade: &Trade) -> Option<f64> {
    let tp1 = trade.take_profit.first().copied()?;
    let risk = match trade.direction {
        Direction::Long => trade.entry_price - trade.stop_loss,
        Direction::Short => trade.stop_loss - trade.entry_price,
    };
    let reward = match trade.direction {
        Direction::Long => tp1 - trade.entry_price,
        Direction::Short => trade.entry_price - tp1,
    };
    if risk <= 0.0 {
        return None;
    }
    Some(reward / risk)
}

fn edge(trades: &[&Trade]) -> f64 {
    let wins = trades
        .iter()
        .filter(|t| t.outcome == Some(Outcome::Win))
        .count();
    let win_rate = wins as f64 / trades.len() as f64;
    let avg_profit = trades
        .iter()
        .map(|t| t.profit_pct.unwrap_or(0.0))
        .sum::<f64>()
        / trades.len() as f64;
    win_rate * avg_profit
}

/// Decade confidence bucket with the best realized edge, given enough
/// samples. Edge is win rate times average profit.
fn best_confidence_bucket(closed: &[Trade]) -> Option<f64> {
    let mut best: Option<(f64, f64)> = None;
    let mut bucket = 0.0;
    while bucket < 100.0 {
        let members: Vec<&Trade> = closed
            .iter()
            .filter(|t| t.confidence >= bucket && t.confidence < bucket + 10.0)
            .collect();
        if members.len() >= MIN_BUCKET_SAMPLES {
            let e = edge(&members);
            if best.map(|(_, be)| e > be).unwrap_or(true) {
                best = Some((bucket, e));
            }
        }
        bucket += 10.0;
    }
    best.map(|(threshold, _)| threshold)
}

/// Risk/reward floor with the best realized edge among trades at or above
/// it.
fn best_rr_threshold(closed: &[Trade]) -> Option<f64> {
    let mut best: Option<(f64, f64)> = None;
    for threshold in RR_THRESHOLDS {
        let members: Vec<&Trade> = closed
            .iter()
            .filter(|t| derived_risk_reward(t).map(|rr| rr >= threshold).unwrap_or(false))
            .collect();
        if members.len() >= MIN_BUCKET_SAMPLES {
            let e = edge(&members);
            if best.map(|(_, be)| e > be).unwrap_or(true) {
                best = Some((threshold, e));
            }
        }
    }
    best.map(|(threshold, _)| threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HardLimitsConfig, TradingConfig};
    use crate::oracle::{AnalysisRequest, OracleDecision};
    use crate::store::{sample_trade, AnalystCall, MemoryStore};
    use crate::signals::Bias;
    use async_trait::async_trait;
    use chrono::Utc;

    struct ScriptedOracle {
        review: std::result::Result<TradeReview, String>,
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        async fn analyze(&self, _request: &AnalysisRequest) -> Result<OracleDecision> {
            Ok(OracleDecision::degraded("not under test"))
        }
        async fn review(&self, _trade: &Trade) -> Result<TradeReview> {
            self.review
                .clone()
                .map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn trading_cfg() -> TradingConfig {
        TradingConfig {
            enabled: true,
            auto_execute: true,
            confirmation_delay_secs: 30,
            default_leverage: 25,
            allowed_symbols: vec!["BTCUSDT".to_string()],
            min_confidence: 75.0,
            min_risk_reward: 2.0,
            max_position_size: 5.0,
            max_positions: 2,
            max_daily_trades: 5,
            max_daily_loss: 15.0,
            max_consecutive_losses: 3,
        }
    }

    fn learning_cfg() -> LearningConfig {
        LearningConfig {
            enabled: true,
            trial_period_calls: 10,
            trial_period_discount: 0.5,
            performance_weight: 0.7,
            recency_weight: 0.3,
            min_trades_before_learning: 1,
            pattern_analysis_frequency: 20,
            parameter_optimization_frequency: 50,
        }
    }

    fn controller(
        store: Arc<MemoryStore>,
        review: std::result::Result<TradeReview, String>,
    ) -> (FeedbackController, Arc<Mutex<RiskGate>>) {
        let gate = Arc::new(Mutex::new(RiskGate::new(
            &trading_cfg(),
            &HardLimitsConfig { absolute_max_position: 5.0 },
            store.clone(),
        )));
        let ctl = FeedbackController::new(
            store,
            Arc::new(ScriptedOracle { review }),
            gate.clone(),
            learning_cfg(),
        );
        (ctl, gate)
    }

    fn closed_trade(store: &MemoryStore, outcome: Outcome, profit: f64) -> Trade {
        let mut t = store.create_trade(sample_trade("BTCUSDT", Direction::Long)).unwrap();
        t.status = TradeStatus::Closed;
        t.outcome = Some(outcome);
        t.profit_pct = Some(profit);
        t.exit_price = Some(101.0);
        store.update_trade(&t).unwrap();
        t
    }

    fn record_call(store: &MemoryStore, trade_id: u64, analyst: &str) {
        store
            .record_analyst_call(AnalystCall {
                trade_id,
                analyst_name: analyst.to_string(),
                direction: Bias::Bullish,
                message_content: "long".to_string(),
                timestamp: Utc::now(),
                was_correct: None,
            })
            .unwrap();
    }

    fn judgment(name: &str, correct: bool, nudge: f64) -> AnalystJudgment {
        AnalystJudgment {
            name: name.to_string(),
            direction: "LONG".to_string(),
            was_correct: correct,
            weight_adjustment: nudge,
            comment: String::new(),
        }
    }

    #[tokio::test]
    async fn correct_call_maps_blended_accuracy_into_weight() {
        let store = Arc::new(MemoryStore::new());
        let trade = closed_trade(&store, Outcome::Win, 45.0);
        record_call(&store, trade.id, "alice");

        let review = TradeReview {
            analyst_performance: vec![judgment("alice", true, 0.0)],
            ..Default::default()
        };
        let (ctl, _) = controller(store.clone(), Ok(review));
        ctl.on_trade_closed(trade.id).await.unwrap();

        let alice = store.get_or_create_analyst("alice").unwrap();
        assert_eq!(alice.total_calls, 1);
        assert_eq!(alice.correct_calls, 1);
        // accuracy 1.0, 7d 1.0 -> blended 1.0 -> weight capped at 2.0
        assert!((alice.weight - 2.0).abs() < 1e-9);

        // review lands on the trade record
        let stored = store.get_trade(trade.id).unwrap().unwrap();
        assert!(stored.review.is_some());
    }

    #[tokio::test]
    async fn wrong_call_with_no_graded_history_floors_the_weight() {
        let store = Arc::new(MemoryStore::new());
        let trade = closed_trade(&store, Outcome::Loss, -30.0);
        // no recorded call: 7d accuracy falls back to 0.5
        let review = TradeReview {
            analyst_performance: vec![judgment("bob", false, -0.1)],
            ..Default::default()
        };
        let (ctl, _) = controller(store.clone(), Ok(review));
        ctl.on_trade_closed(trade.id).await.unwrap();

        let bob = store.get_or_create_analyst("bob").unwrap();
        // accuracy 0.0, 7d 0.5 -> blended 0.15 -> 0.3 clamps to 0.5,
        // nudge -0.1 re-clamps back to 0.5
        assert!((bob.weight - MIN_WEIGHT).abs() < 1e-9);
    }

    #[tokio::test]
    async fn review_failure_still_records_the_pattern() {
        let store = Arc::new(MemoryStore::new());
        let trade = closed_trade(&store, Outcome::Win, 12.0);
        record_call(&store, trade.id, "bob");
        record_call(&store, trade.id, "alice");

        let (ctl, _) = controller(store.clone(), Err("oracle down".to_string()));
        ctl.on_trade_closed(trade.id).await.unwrap();

        let patterns = store.high_winrate_patterns(1, 0.0).unwrap();
        assert_eq!(patterns.len(), 1);
        // sorted, stable key
        assert!(patterns[0].pattern_name.starts_with("alice+bob|"));
        assert!(store.get_trade(trade.id).unwrap().unwrap().review.is_none());
    }

    #[tokio::test]
    async fn open_trade_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let trade = store.create_trade(sample_trade("BTCUSDT", Direction::Long)).unwrap();
        record_call(&store, trade.id, "alice");

        let review = TradeReview {
            analyst_performance: vec![judgment("alice", true, 0.0)],
            ..Default::default()
        };
        let (ctl, _) = controller(store.clone(), Ok(review));
        ctl.on_trade_closed(trade.id).await.unwrap();

        let alice = store.get_or_create_analyst("alice").unwrap();
        assert_eq!(alice.total_calls, 0);
    }

    #[test]
    fn technical_tag_reads_the_reasoning_blob() {
        assert_eq!(technical_tag(&serde_json::json!({"t": "bullish breakout"})), "bullish_tech");
        assert_eq!(technical_tag(&serde_json::json!({"t": "bearish divergence"})), "bearish_tech");
        assert_eq!(
            technical_tag(&serde_json::json!({"t": "bullish macro, bearish momentum"})),
            "mixed"
        );
        assert_eq!(technical_tag(&serde_json::json!({})), "mixed");
    }

    #[test]
    fn derived_rr_uses_first_target() {
        let mut t = sample_trade("BTCUSDT", Direction::Long);
        t.entry_price = 100.0;
        t.stop_loss = 98.0;
        t.take_profit = vec![104.0, 108.0];
        assert!((derived_risk_reward(&t).unwrap() - 2.0).abs() < 1e-9);

        t.direction = Direction::Short;
        t.stop_loss = 102.0;
        t.take_profit = vec![97.0];
        assert!((derived_risk_reward(&t).unwrap() - 1.5).abs() < 1e-9);

        // inverted stop yields no RR
        t.stop_loss = 99.0;
        assert!(derived_risk_reward(&t).is_none());
    }

    #[test]
    fn threshold_retune_picks_the_best_buckets_and_updates_the_gate() {
        let store = Arc::new(MemoryStore::new());
        // five winners in the 80s bucket with RR 2.0
        for _ in 0..5 {
            let mut t = store.create_trade(sample_trade("BTCUSDT", Direction::Long)).unwrap();
            t.status = TradeStatus::Closed;
            t.confidence = 85.0;
            t.outcome = Some(Outcome::Win);
            t.profit_pct = Some(20.0);
            store.update_trade(&t).unwrap();
        }
        // five losers in the 70s bucket with weak RR
        for _ in 0..5 {
            let mut t = store.create_trade(sample_trade("BTCUSDT", Direction::Long)).unwrap();
            t.status = TradeStatus::Closed;
            t.confidence = 72.0;
            t.take_profit = vec![103.0];
            t.outcome = Some(Outcome::Loss);
            t.profit_pct = Some(-15.0);
            store.update_trade(&t).unwrap();
        }

        let (ctl, gate) = controller(store, Err("unused".to_string()));
        ctl.retune_thresholds().unwrap();

        let gate = gate.lock().unwrap();
        assert_eq!(gate.min_confidence, 80.0);
        assert_eq!(gate.min_risk_reward, 2.0);
    }

    #[test]
    fn retune_without_samples_leaves_the_gate_alone() {
        let store = Arc::new(MemoryStore::new());
        let (ctl, gate) = controller(store, Err("unused".to_string()));
        ctl.retune_thresholds().unwrap();
        let gate = gate.lock().unwrap();
        assert_eq!(gate.min_confidence, 75.0);
        assert_eq!(gate.min_risk_reward, 2.0);
    }
}
