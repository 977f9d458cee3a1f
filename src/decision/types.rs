use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for longs, -1 for shorts. Used to sign raw price moves.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStrategy {
    #[default]
    Market,
    Limit,
}

/// What the oracle asked for, as recorded in the decision audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    Long,
    Short,
    Adjust,
    Skip,
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionAction::Long => "LONG",
            DecisionAction::Short => "SHORT",
            DecisionAction::Adjust => "ADJUST",
            DecisionAction::Skip => "SKIP",
        };
        f.write_str(s)
    }
}

/// How a decision ended up. Every evaluated batch lands in exactly one of
/// these, including oracle skips and risk rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionOutcome {
    Executed,
    Skip,
    Rejected,
    Cancelled,
}

impl std::fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionOutcome::Executed => "EXECUTED",
            DecisionOutcome::Skip => "SKIP",
            DecisionOutcome::Rejected => "REJECTED",
            DecisionOutcome::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// A fully-parameterized entry proposal, ready for the risk gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub symbol: String,
    pub direction: Direction,
    pub confidence: f64,
    /// Proposed entry; None means enter at market.
    pub entry_price: Option<f64>,
    pub entry_strategy: EntryStrategy,
    pub stop_loss: f64,
    pub take_profit: Vec<f64>,
    /// Percent of account balance to commit as margin.
    pub position_size_pct: f64,
    pub leverage: u32,
    pub reasoning: serde_json::Value,
    pub analyst_sources: Vec<String>,
}

impl TradeProposal {
    /// Reward-to-risk against the first take-profit target, measured from
    /// the given reference price.
    pub fn risk_reward(&self, entry: f64) -> f64 {
        let risk = (entry - self.stop_loss).abs();
        if risk <= f64::EPSILON {
            return 0.0;
        }
        match self.take_profit.first() {
            Some(tp) => (tp - entry).abs() / risk,
            None => 0.0,
        }
    }
}

/// A request to move the protective parameters of an open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adjustment {
    pub symbol: String,
    pub new_stop_loss: Option<f64>,
    pub new_take_profit: Option<Vec<f64>>,
    pub reason: String,
}
