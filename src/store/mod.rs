//! Persistence seam for trades, analysts, decisions and mined patterns.
//!
//! The trait is synchronous with interior locking so callers never hold a
//! guard across an await point. `MemoryStore` is the bundled backend; a
//! SQL-backed one only has to implement `RecordStore`.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::decision::types::{DecisionAction, DecisionOutcome, Direction};
use crate::signals::Bias;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Open,
    PartialClose,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Win,
    Loss,
    Breakeven,
}

/// One position through its whole lifecycle, from decision to review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub direction: Direction,

    pub analyst_opinions: serde_json::Value,
    pub ai_reasoning: serde_json::Value,
    pub confidence: f64,

    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub stop_loss: f64,
    pub take_profit: Vec<f64>,
    /// Percent of account balance committed as margin.
    pub position_size: f64,
    pub leverage: u32,

    pub entry_order_id: Option<String>,
    pub exit_order_id: Option<String>,

    pub profit_pct: Option<f64>,
    pub profit_usd: Option<f64>,
    pub hold_duration_secs: Option<i64>,
    pub outcome: Option<Outcome>,

    pub review: Option<serde_json::Value>,
    pub status: TradeStatus,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analyst {
    pub name: String,
    pub total_calls: u32,
    pub correct_calls: u32,
    /// Lifetime hit rate in [0, 1].
    pub accuracy: f64,
    pub weight: f64,
    pub trend_accuracy: f64,
    pub range_accuracy: f64,
    pub recent_7d_accuracy: f64,
    pub recent_30d_accuracy: f64,
    pub last_updated: DateTime<Utc>,
}

impl Analyst {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            total_calls: 0,
            correct_calls: 0,
            accuracy: 0.0,
            weight: 1.0,
            trend_accuracy: 0.0,
            range_accuracy: 0.0,
            recent_7d_accuracy: 0.0,
            recent_30d_accuracy: 0.0,
            last_updated: Utc::now(),
        }
    }
}

/// One analyst's directional call attached to a trade, graded after close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystCall {
    pub trade_id: u64,
    pub analyst_name: String,
    pub direction: Bias,
    pub message_content: String,
    pub timestamp: DateTime<Utc>,
    /// None until the trade closes and the call is graded.
    pub was_correct: Option<bool>,
}

/// Audit row for one evaluated batch, whatever branch it took.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiDecision {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub action: DecisionAction,
    pub confidence: f64,
    pub reasoning: serde_json::Value,
    pub outcome: DecisionOutcome,
    pub risk_summary: String,
    pub cancel_reason: String,
    pub analyst_sources: Vec<String>,
    pub trade_id: Option<u64>,
}

/// A recurring signal combination with its running outcome stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPattern {
    pub pattern_name: String,
    pub conditions: serde_json::Value,
    pub occurrences: u32,
    pub wins: u32,
    pub win_rate: f64,
    pub avg_profit: f64,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub trait RecordStore: Send + Sync {
    /// Persists the trade, ignoring `trade.id`, and returns it with its
    /// assigned id.
    fn create_trade(&self, trade: Trade) -> Result<Trade>;
    fn update_trade(&self, trade: &Trade) -> Result<()>;
    fn get_trade(&self, id: u64) -> Result<Option<Trade>>;
    /// OPEN and PARTIAL_CLOSE trades.
    fn open_trades(&self) -> Result<Vec<Trade>>;
    /// CLOSED trades, newest first.
    fn closed_trades(&self, limit: usize) -> Result<Vec<Trade>>;
    fn closed_trade_count(&self) -> Result<u64>;
    fn today_trades(&self) -> Result<Vec<Trade>>;
    /// Sum of realized profit_pct over today's closed trades.
    fn today_pnl(&self) -> Result<f64>;
    /// Losses counted backwards from today's most recent close, stopping
    /// at the first non-loss.
    fn today_consecutive_losses(&self) -> Result<u32>;

    fn get_or_create_analyst(&self, name: &str) -> Result<Analyst>;
    fn update_analyst(&self, analyst: &Analyst) -> Result<()>;
    fn analyst_weight(&self, name: &str) -> Result<f64>;

    fn record_analyst_call(&self, call: AnalystCall) -> Result<()>;
    fn calls_for_trade(&self, trade_id: u64) -> Result<Vec<AnalystCall>>;
    fn mark_call_result(&self, trade_id: u64, analyst_name: &str, was_correct: bool)
        -> Result<()>;
    /// Hit rate over the analyst's graded calls in the trailing window, or
    /// None when there are no graded calls.
    fn recent_call_accuracy(&self, analyst_name: &str, days: i64) -> Result<Option<f64>>;

    fn save_decision(&self, decision: AiDecision) -> Result<()>;
    fn recent_decisions(&self, hours: i64) -> Result<Vec<AiDecision>>;

    fn upsert_pattern(
        &self,
        pattern_name: &str,
        conditions: serde_json::Value,
        win: bool,
        profit: f64,
    ) -> Result<()>;
    fn high_winrate_patterns(
        &self,
        min_occurrences: u32,
        min_winrate: f64,
    ) -> Result<Vec<SignalPattern>>;
}

#[derive(Default)]
struct Inner {
    trades: Vec<Trade>,
    next_trade_id: u64,
    analysts: HashMap<String, Analyst>,
    calls: Vec<AnalystCall>,
    decisions: Vec<AiDecision>,
    patterns: HashMap<String, SignalPattern>,
}

/// In-memory backend. All state lives behind a single mutex; every method
/// takes the lock for a short, await-free critical section.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_trade_id: 1,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("record store mutex poisoned"))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn today_start() -> DateTime<Utc> {
    let now = Utc::now();
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

impl RecordStore for MemoryStore {
    fn create_trade(&self, mut trade: Trade) -> Result<Trade> {
        let mut inner = self.lock()?;
        trade.id = inner.next_trade_id;
        inner.next_trade_id += 1;
        inner.trades.push(trade.clone());
        info!("💾 Trade created: #{} {} {}", trade.id, trade.symbol, trade.direction);
        Ok(trade)
    }

    fn update_trade(&self, trade: &Trade) -> Result<()> {
        let mut inner = self.lock()?;
        let slot = inner
            .trades
            .iter_mut()
            .find(|t| t.id == trade.id)
            .ok_or_else(|| anyhow!("trade #{} not found", trade.id))?;
        *slot = trade.clone();
        Ok(())
    }

    fn get_trade(&self, id: u64) -> Result<Option<Trade>> {
        Ok(self.lock()?.trades.iter().find(|t| t.id == id).cloned())
    }

    fn open_trades(&self) -> Result<Vec<Trade>> {
        Ok(self
            .lock()?
            .trades
            .iter()
            .filter(|t| matches!(t.status, TradeStatus::Open | TradeStatus::PartialClose))
            .cloned()
            .collect())
    }

    fn closed_trades(&self, limit: usize) -> Result<Vec<Trade>> {
        let inner = self.lock()?;
        let mut closed: Vec<Trade> = inner
            .trades
            .iter()
            .filter(|t| t.status == TradeStatus::Closed)
            .cloned()
            .collect();
        closed.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        closed.truncate(limit);
        Ok(closed)
    }

    fn closed_trade_count(&self) -> Result<u64> {
        Ok(self
            .lock()?
            .trades
            .iter()
            .filter(|t| t.status == TradeStatus::Closed)
            .count() as u64)
    }

    fn today_trades(&self) -> Result<Vec<Trade>> {
        let start = today_start();
        Ok(self
            .lock()?
            .trades
            .iter()
            .filter(|t| t.timestamp >= start)
            .cloned()
            .collect())
    }

    fn today_pnl(&self) -> Result<f64> {
        let start = today_start();
        Ok(self
            .lock()?
            .trades
            .iter()
            .filter(|t| t.timestamp >= start && t.status == TradeStatus::Closed)
            .map(|t| t.profit_pct.unwrap_or(0.0))
            .sum())
    }

    fn today_consecutive_losses(&self) -> Result<u32> {
        let start = today_start();
        let inner = self.lock()?;
        let mut todays: Vec<&Trade> = inner
            .trades
            .iter()
            .filter(|t| t.timestamp >= start && t.status == TradeStatus::Closed)
            .collect();
        todays.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut consecutive = 0;
        for trade in todays {
            if trade.outcome == Some(Outcome::Loss) {
                consecutive += 1;
            } else {
                break;
            }
        }
        Ok(consecutive)
    }

    fn get_or_create_analyst(&self, name: &str) -> Result<Analyst> {
        let mut inner = self.lock()?;
        Ok(inner
            .analysts
            .entry(name.to_string())
            .or_insert_with(|| Analyst::new(name))
            .clone())
    }

    fn update_analyst(&self, analyst: &Analyst) -> Result<()> {
        let mut inner = self.lock()?;
        let mut updated = analyst.clone();
        updated.last_updated = Utc::now();
        inner.analysts.insert(analyst.name.clone(), updated);
        Ok(())
    }

    fn analyst_weight(&self, name: &str) -> Result<f64> {
        Ok(self
            .lock()?
            .analysts
            .get(name)
            .map(|a| a.weight)
            .unwrap_or(1.0))
    }

    fn record_analyst_call(&self, call: AnalystCall) -> Result<()> {
        self.lock()?.calls.push(call);
        Ok(())
    }

    fn calls_for_trade(&self, trade_id: u64) -> Result<Vec<AnalystCall>> {
        Ok(self
            .lock()?
            .calls
            .iter()
            .filter(|c| c.trade_id == trade_id)
            .cloned()
            .collect())
    }

    fn mark_call_result(
        &self,
        trade_id: u64,
        analyst_name: &str,
        was_correct: bool,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        for call in inner
            .calls
            .iter_mut()
            .filter(|c| c.trade_id == trade_id && c.analyst_name == analyst_name)
        {
            call.was_correct = Some(was_correct);
        }
        Ok(())
    }

    fn recent_call_accuracy(&self, analyst_name: &str, days: i64) -> Result<Option<f64>> {
        let cutoff = Utc::now() - Duration::days(days);
        let inner = self.lock()?;
        let graded: Vec<bool> = inner
            .calls
            .iter()
            .filter(|c| c.analyst_name == analyst_name && c.timestamp >= cutoff)
            .filter_map(|c| c.was_correct)
            .collect();
        if graded.is_empty() {
            return Ok(None);
        }
        let correct = graded.iter().filter(|&&ok| ok).count();
        Ok(Some(correct as f64 / graded.len() as f64))
    }

    fn save_decision(&self, decision: AiDecision) -> Result<()> {
        info!(
            "💾 Decision saved: {} {} → {}",
            decision.action, decision.symbol, decision.outcome
        );
        self.lock()?.decisions.push(decision);
        Ok(())
    }

    fn recent_decisions(&self, hours: i64) -> Result<Vec<AiDecision>> {
        let cutoff = Utc::now() - Duration::hours(hours);
        let mut recent: Vec<AiDecision> = self
            .lock()?
            .decisions
            .iter()
            .filter(|d| d.timestamp >= cutoff)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(recent)
    }

    fn upsert_pattern(
        &self,
        pattern_name: &str,
        conditions: serde_json::Value,
        win: bool,
        profit: f64,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        match inner.patterns.get_mut(pattern_name) {
            Some(pat) => {
                pat.occurrences += 1;
                if win {
                    pat.wins += 1;
                }
                pat.win_rate = pat.wins as f64 / pat.occurrences as f64;
                pat.avg_profit = (pat.avg_profit * (pat.occurrences - 1) as f64 + profit)
                    / pat.occurrences as f64;
                pat.last_seen = now;
            }
            None => {
                inner.patterns.insert(
                    pattern_name.to_string(),
                    SignalPattern {
                        pattern_name: pattern_name.to_string(),
                        conditions,
                        occurrences: 1,
                        wins: if win { 1 } else { 0 },
                        win_rate: if win { 1.0 } else { 0.0 },
                        avg_profit: profit,
                        last_seen: now,
                        created_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    fn high_winrate_patterns(
        &self,
        min_occurrences: u32,
        min_winrate: f64,
    ) -> Result<Vec<SignalPattern>> {
        let inner = self.lock()?;
        let mut out: Vec<SignalPattern> = inner
            .patterns
            .values()
            .filter(|p| p.occurrences >= min_occurrences && p.win_rate >= min_winrate)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.win_rate
                .partial_cmp(&a.win_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(out)
    }
}

#[cfg(test)]
pub fn sample_trade(symbol: &str, direction: Direction) -> Trade {
    Trade {
        id: 0,
        timestamp: Utc::now(),
        symbol: symbol.to_string(),
        direction,
        analyst_opinions: serde_json::json!([]),
        ai_reasoning: serde_json::json!({}),
        confidence: 80.0,
        entry_price: 100.0,
        exit_price: None,
        stop_loss: 98.0,
        take_profit: vec![104.0, 108.0],
        position_size: 3.0,
        leverage: 25,
        entry_order_id: None,
        exit_order_id: None,
        profit_pct: None,
        profit_usd: None,
        hold_duration_secs: None,
        outcome: None,
        review: None,
        status: TradeStatus::Open,
        closed_at: None,
    }
}
