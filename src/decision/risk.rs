use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::{HardLimitsConfig, TradingConfig};
use crate::decision::types::TradeProposal;
use crate::store::RecordStore;

#[derive(Debug, Clone)]
pub struct RiskCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Full evaluation result. Every check is recorded whether or not an
/// earlier one already failed, so the audit log always shows the whole
/// picture.
#[derive(Debug, Clone)]
pub struct RiskReport {
    pub passed: bool,
    pub checks: Vec<RiskCheck>,
}

impl RiskReport {
    fn new() -> Self {
        Self { passed: true, checks: Vec::new() }
    }

    fn add(&mut self, name: &'static str, passed: bool, detail: String) {
        if !passed {
            self.passed = false;
        }
        self.checks.push(RiskCheck { name, passed, detail });
    }

    pub fn summary(&self) -> String {
        self.checks
            .iter()
            .map(|c| {
                let icon = if c.passed { "pass" } else { "FAIL" };
                format!("[{}] {}: {}", icon, c.name, c.detail)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn failed_names(&self) -> Vec<&'static str> {
        self.checks.iter().filter(|c| !c.passed).map(|c| c.name).collect()
    }
}

/// Gates new entries. Hard checks block; informational checks always pass
/// and exist so the learning engine accumulates tuning signal even when
/// they are not enforced.
pub struct RiskGate {
    // Soft limits, re-tuned at runtime by the learning engine.
    pub min_confidence: f64,
    pub min_risk_reward: f64,
    pub max_position_size: f64,
    pub max_positions: usize,
    pub max_daily_trades: usize,
    pub max_daily_loss: f64,
    pub max_consecutive_losses: u32,
    allowed_symbols: Vec<String>,

    // Hard ceiling, never auto-adjusted.
    absolute_max_position: f64,

    store: Arc<dyn RecordStore>,
}

impl RiskGate {
    pub fn new(
        trading: &TradingConfig,
        limits: &HardLimitsConfig,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            min_confidence: trading.min_confidence,
            min_risk_reward: trading.min_risk_reward,
            max_position_size: trading.max_position_size,
            max_positions: trading.max_positions,
            max_daily_trades: trading.max_daily_trades,
            max_daily_loss: trading.max_daily_loss,
            max_consecutive_losses: trading.max_consecutive_losses,
            allowed_symbols: trading.allowed_symbols.clone(),
            absolute_max_position: limits.absolute_max_position,
            store,
        }
    }

    pub fn effective_max_position(&self) -> f64 {
        self.max_position_size.min(self.absolute_max_position)
    }

    pub fn check(&self, proposal: &TradeProposal, risk_reward: f64) -> Result<RiskReport> {
        let open_trades = self.store.open_trades()?;
        let today_trades = self.store.today_trades()?;
        let today_pnl = self.store.today_pnl()?;
        let consecutive_losses = self.store.today_consecutive_losses()?;

        let mut report = RiskReport::new();

        // Hard checks.
        report.add(
            "confidence",
            proposal.confidence >= self.min_confidence,
            format!("{:.0}% (min {:.0}%)", proposal.confidence, self.min_confidence),
        );

        if !self.allowed_symbols.is_empty() {
            let allowed = self.allowed_symbols.iter().any(|s| s == &proposal.symbol);
            report.add(
                "symbol allow-list",
                allowed,
                if allowed {
                    proposal.symbol.clone()
                } else {
                    format!("{} not in allow-list", proposal.symbol)
                },
            );
        }

        // Same symbol + same direction is a duplicate; the opposite
        // direction is allowed and only shows up in the counters below.
        let duplicate = open_trades
            .iter()
            .any(|t| t.symbol == proposal.symbol && t.direction == proposal.direction);
        report.add(
            "duplicate position",
            !duplicate,
            if duplicate {
                format!("already holding {} {}", proposal.symbol, proposal.direction)
            } else {
                "OK".to_string()
            },
        );

        // Informational checks, recorded but never blocking.
        report.add(
            "risk/reward",
            true,
            format!("{:.2} (target {:.2})", risk_reward, self.min_risk_reward),
        );
        report.add(
            "position size",
            true,
            format!(
                "{:.1}% (cap {:.1}%)",
                proposal.position_size_pct,
                self.effective_max_position()
            ),
        );
        report.add(
            "open positions",
            true,
            format!("{}/{}", open_trades.len(), self.max_positions),
        );
        report.add(
            "daily trades",
            true,
            format!("{}/{}", today_trades.len(), self.max_daily_trades),
        );
        report.add("daily pnl", true, format!("{:+.2}%", today_pnl));
        report.add(
            "loss streak",
            true,
            format!("{} consecutive (cap {})", consecutive_losses, self.max_consecutive_losses),
        );

        if report.passed {
            info!("🛡️ Risk check PASSED for {} {}", proposal.symbol, proposal.direction);
        } else {
            warn!("🛡️ Risk check FAILED: {}", report.failed_names().join(", "));
        }
        Ok(report)
    }

    /// Applies re-tuned soft thresholds. The absolute position ceiling is
    /// immutable and still caps whatever the learning engine asks for.
    pub fn update_soft_limits(
        &mut self,
        min_confidence: Option<f64>,
        min_risk_reward: Option<f64>,
    ) {
        if let Some(v) = min_confidence {
            info!("⚙️ Risk param updated: min_confidence {} -> {}", self.min_confidence, v);
            self.min_confidence = v;
        }
        if let Some(v) = min_risk_reward {
            info!("⚙️ Risk param updated: min_risk_reward {} -> {}", self.min_risk_reward, v);
            self.min_risk_reward = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::types::Direction;
    use crate::store::{sample_trade, MemoryStore};

    fn trading_cfg() -> TradingConfig {
        TradingConfig {
            enabled: true,
            auto_execute: true,
            confirmation_delay_secs: 30,
            default_leverage: 25,
            allowed_symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            min_confidence: 75.0,
            min_risk_reward: 2.0,
            max_position_size: 5.0,
            max_positions: 2,
            max_daily_trades: 5,
            max_daily_loss: 15.0,
            max_consecutive_losses: 3,
        }
    }

    fn limits_cfg() -> HardLimitsConfig {
        HardLimitsConfig { absolute_max_position: 5.0 }
    }

    fn proposal(symbol: &str, direction: Direction, confidence: f64) -> TradeProposal {
        TradeProposal {
            symbol: symbol.to_string(),
            direction,
            confidence,
            entry_price: None,
            entry_strategy: Default::default(),
            stop_loss: 98.0,
            take_profit: vec![104.0],
            position_size_pct: 3.0,
            leverage: 25,
            reasoning: serde_json::json!({}),
            analyst_sources: vec!["alice".to_string()],
        }
    }

    #[test]
    fn low_confidence_blocks_regardless_of_everything_else() {
        let store = Arc::new(MemoryStore::new());
        let gate = RiskGate::new(&trading_cfg(), &limits_cfg(), store);
        let report = gate
            .check(&proposal("BTCUSDT", Direction::Long, 60.0), 3.0)
            .unwrap();
        assert!(!report.passed);
        assert_eq!(report.failed_names(), vec!["confidence"]);
        // no short-circuit: all nine checks recorded
        assert_eq!(report.checks.len(), 9);
    }

    #[test]
    fn duplicate_direction_blocks_even_at_high_confidence() {
        let store = Arc::new(MemoryStore::new());
        store.create_trade(sample_trade("BTCUSDT", Direction::Long)).unwrap();
        let gate = RiskGate::new(&trading_cfg(), &limits_cfg(), store);

        let report = gate
            .check(&proposal("BTCUSDT", Direction::Long, 95.0), 3.0)
            .unwrap();
        assert!(!report.passed);
        assert_eq!(report.failed_names(), vec!["duplicate position"]);
    }

    #[test]
    fn opposite_direction_on_same_symbol_is_allowed() {
        let store = Arc::new(MemoryStore::new());
        store.create_trade(sample_trade("BTCUSDT", Direction::Long)).unwrap();
        let gate = RiskGate::new(&trading_cfg(), &limits_cfg(), store);

        let report = gate
            .check(&proposal("BTCUSDT", Direction::Short, 85.0), 3.0)
            .unwrap();
        assert!(report.passed);
    }

    #[test]
    fn symbol_outside_allow_list_blocks() {
        let store = Arc::new(MemoryStore::new());
        let gate = RiskGate::new(&trading_cfg(), &limits_cfg(), store);
        let report = gate
            .check(&proposal("DOGEUSDT", Direction::Long, 90.0), 3.0)
            .unwrap();
        assert!(!report.passed);
        assert_eq!(report.failed_names(), vec!["symbol allow-list"]);
    }

    #[test]
    fn informational_checks_never_block() {
        let store = Arc::new(MemoryStore::new());
        let gate = RiskGate::new(&trading_cfg(), &limits_cfg(), store);
        // terrible risk/reward and oversized position, still passes
        let mut p = proposal("ETHUSDT", Direction::Long, 80.0);
        p.position_size_pct = 50.0;
        let report = gate.check(&p, 0.2).unwrap();
        assert!(report.passed);
    }

    #[test]
    fn soft_limit_updates_take_effect() {
        let store = Arc::new(MemoryStore::new());
        let mut gate = RiskGate::new(&trading_cfg(), &limits_cfg(), store);
        gate.update_soft_limits(Some(80.0), Some(2.5));
        assert_eq!(gate.min_confidence, 80.0);
        assert_eq!(gate.min_risk_reward, 2.5);

        let report = gate
            .check(&proposal("BTCUSDT", Direction::Long, 78.0), 3.0)
            .unwrap();
        assert!(!report.passed);
    }
}
