use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;

use signal_futures_agent::config::{
    FeesConfig, HardLimitsConfig, LearningConfig, MonitorConfig, TradingConfig,
};
use signal_futures_agent::confirm::{Confirmation, ConfirmationChannel};
use signal_futures_agent::context::{NoCalendar, TickerContext};
use signal_futures_agent::decision::{
    DecisionOrchestrator, DecisionOutcome, Direction, RiskGate, TradeProposal,
};
use signal_futures_agent::exchange::PaperExchange;
use signal_futures_agent::execution::{
    realized_profit_pct, MonitorEvent, PositionMonitor, TradeExecutor,
};
use signal_futures_agent::learning::FeedbackController;
use signal_futures_agent::notify::LogNotifier;
use signal_futures_agent::oracle::{
    AnalysisRequest, AnalystJudgment, EntryPlan, EntrySpec, Oracle, OracleDecision, TradeReview,
};
use signal_futures_agent::signals::{RawSignal, SignalAggregator};
use signal_futures_agent::store::{MemoryStore, RecordStore, Trade, TradeStatus};

struct ScriptedOracle {
    decision: OracleDecision,
    review: TradeReview,
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<OracleDecision> {
        Ok(self.decision.clone())
    }
    async fn review(&self, _trade: &Trade) -> Result<TradeReview> {
        Ok(self.review.clone())
    }
}

struct Approve;

#[async_trait]
impl ConfirmationChannel for Approve {
    async fn send(&self, _proposal: &TradeProposal, _countdown: Duration) -> Result<Confirmation> {
        Ok(Confirmation::Executed)
    }
}

fn trading_cfg() -> TradingConfig {
    TradingConfig {
        enabled: true,
        auto_execute: true,
        confirmation_delay_secs: 0,
        default_leverage: 50,
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
        min_trades_before_learning: 10,
        pattern_analysis_frequency: 20,
        parameter_optimization_frequency: 50,
    }
}

fn fees() -> FeesConfig {
    FeesConfig { taker_rate: 0.0004, maker_rate: 0.0002, slippage_rate: 0.0001 }
}

fn monitor_cfg() -> MonitorConfig {
    MonitorConfig {
        interval_secs: 30,
        sl_confirm_polls: 4,
        tp1_qty_ratio: 0.7,
        close_tolerance_pct: 0.5,
        liquidation_margin_pct: 1.0,
    }
}

fn batch() -> Vec<RawSignal> {
    vec![
        RawSignal {
            analyst: "alice".to_string(),
            content: "BTC breakout confirmed, going long here".to_string(),
            channel: "alpha".to_string(),
            timestamp: Utc::now(),
        },
        RawSignal {
            analyst: "bob".to_string(),
            content: "BTC bullish structure on the 4h".to_string(),
            channel: "alpha".to_string(),
            timestamp: Utc::now(),
        },
    ]
}

fn long_plan() -> EntryPlan {
    EntryPlan {
        symbol: "BTCUSDT".to_string(),
        confidence: 85.0,
        reasoning: json!({"technical": "bullish breakout"}),
        entry: Some(EntrySpec {
            price: None,
            strategy: Default::default(),
            reason: "momentum".to_string(),
        }),
        stop_loss: 98.0,
        take_profit: vec![104.0, 108.0],
        position_size: 3.0,
        risk_reward: 2.0,
        risk_assessment: json!({}),
    }
}

/// Full pipeline: signal batch -> oracle -> risk -> confirm -> execute,
/// then the monitor confirms a stop-loss over four polls and the feedback
/// pass grades the analysts.
#[tokio::test]
async fn signal_to_settlement_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let venue = Arc::new(PaperExchange::new(10_000.0));
    venue.set_price("BTCUSDT", 100.0);

    let oracle = Arc::new(ScriptedOracle {
        decision: OracleDecision::Long(long_plan()),
        review: TradeReview {
            analyst_performance: vec![
                AnalystJudgment {
                    name: "alice".to_string(),
                    direction: "LONG".to_string(),
                    was_correct: false,
                    weight_adjustment: -0.05,
                    comment: "stopped out".to_string(),
                },
                AnalystJudgment {
                    name: "bob".to_string(),
                    direction: "LONG".to_string(),
                    was_correct: false,
                    weight_adjustment: 0.0,
                    comment: String::new(),
                },
            ],
            lessons_learned: vec!["entry was late".to_string()],
            ..Default::default()
        },
    });

    let executor = Arc::new(TradeExecutor::new(venue.clone(), store.clone(), fees()));
    let risk_gate = Arc::new(Mutex::new(RiskGate::new(
        &trading_cfg(),
        &HardLimitsConfig { absolute_max_position: 5.0 },
        store.clone(),
    )));
    let orchestrator = DecisionOrchestrator::new(
        SignalAggregator::new(store.clone(), learning_cfg()),
        oracle.clone(),
        risk_gate.clone(),
        Arc::new(Approve),
        executor.clone(),
        venue.clone(),
        store.clone(),
        Arc::new(TickerContext::new(venue.clone())),
        Arc::new(NoCalendar),
        Arc::new(LogNotifier),
        trading_cfg(),
    );

    // one batch, one decision row, one open position
    let outcome = orchestrator.evaluate(&batch()).await.unwrap();
    assert_eq!(outcome, DecisionOutcome::Executed);
    let decisions = store.recent_decisions(1).unwrap();
    assert_eq!(decisions.len(), 1);
    let trade_id = decisions[0].trade_id.unwrap();
    assert!(venue.position_qty("BTCUSDT") > 0.0);

    // monitor: breach must hold for four consecutive polls
    let (tx, mut rx) = mpsc::channel(64);
    let mut monitor = PositionMonitor::new(
        venue.clone(),
        store.clone(),
        executor,
        monitor_cfg(),
        fees(),
        tx,
    );
    venue.set_price("BTCUSDT", 97.0);
    for _ in 0..3 {
        monitor.poll().await.unwrap();
    }
    assert_eq!(store.get_trade(trade_id).unwrap().unwrap().status, TradeStatus::Open);
    monitor.poll().await.unwrap();

    let trade = store.get_trade(trade_id).unwrap().unwrap();
    assert_eq!(trade.status, TradeStatus::Closed);
    assert!(trade.profit_pct.unwrap() < 0.0);

    let mut saw_stop = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, MonitorEvent::StopLoss { .. }) {
            saw_stop = true;
        }
    }
    assert!(saw_stop);

    // feedback: losing calls drag both analysts to the weight floor
    let learning = FeedbackController::new(
        store.clone(),
        oracle,
        risk_gate,
        learning_cfg(),
    );
    learning.on_trade_closed(trade_id).await.unwrap();

    let alice = store.get_or_create_analyst("alice").unwrap();
    assert_eq!(alice.total_calls, 1);
    assert_eq!(alice.correct_calls, 0);
    assert_eq!(alice.weight, 0.5);

    let calls = store.calls_for_trade(trade_id).unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.was_correct == Some(false)));

    // review lands on the trade and its lessons feed the next prompt
    let stored = store.get_trade(trade_id).unwrap().unwrap();
    let review = stored.review.unwrap();
    assert_eq!(review["lessons_learned"][0], "entry was late");
}

/// Duplicate same-direction exposure is refused while the first position
/// is still open, and the refusal is audited.
#[tokio::test]
async fn second_long_on_the_same_symbol_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let venue = Arc::new(PaperExchange::new(10_000.0));
    venue.set_price("BTCUSDT", 100.0);

    let oracle = Arc::new(ScriptedOracle {
        decision: OracleDecision::Long(long_plan()),
        review: TradeReview::default(),
    });
    let executor = Arc::new(TradeExecutor::new(venue.clone(), store.clone(), fees()));
    let risk_gate = Arc::new(Mutex::new(RiskGate::new(
        &trading_cfg(),
        &HardLimitsConfig { absolute_max_position: 5.0 },
        store.clone(),
    )));
    let orchestrator = DecisionOrchestrator::new(
        SignalAggregator::new(store.clone(), learning_cfg()),
        oracle,
        risk_gate,
        Arc::new(Approve),
        executor,
        venue.clone(),
        store.clone(),
        Arc::new(TickerContext::new(venue.clone())),
        Arc::new(NoCalendar),
        Arc::new(LogNotifier),
        trading_cfg(),
    );

    assert_eq!(
        orchestrator.evaluate(&batch()).await.unwrap(),
        DecisionOutcome::Executed
    );
    assert_eq!(
        orchestrator.evaluate(&batch()).await.unwrap(),
        DecisionOutcome::Rejected
    );

    let decisions = store.recent_decisions(1).unwrap();
    assert_eq!(decisions.len(), 2);
    // newest first
    assert!(decisions[0].risk_summary.contains("[FAIL] duplicate position"));
    assert_eq!(store.open_trades().unwrap().len(), 1);
}

#[test]
fn leveraged_pnl_is_fee_aware() {
    let fees = fees();
    // 1% move at 50x minus 5% round-trip fees
    let pnl = realized_profit_pct(&fees, Direction::Long, 100.0, 101.0, 50);
    assert!((pnl - 45.0).abs() < 1e-9);
    // the same move against a short
    let pnl = realized_profit_pct(&fees, Direction::Short, 100.0, 101.0, 50);
    assert!((pnl + 55.0).abs() < 1e-9);
}
