//! Aggregate performance stats over closed trades, fed to the oracle as
//! decision context and logged for operators.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::store::{Outcome, RecordStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// In [0, 1]. Breakevens count against it.
    pub win_rate: f64,
    pub total_profit_pct: f64,
    pub total_profit_usd: f64,
    pub avg_profit_pct: f64,
    /// Deepest peak-to-trough fall of the cumulative profit_pct curve,
    /// reported as a positive number.
    pub max_drawdown_pct: f64,
}

pub fn performance_stats(store: &Arc<dyn RecordStore>, limit: usize) -> Result<PerformanceStats> {
    let mut closed = store.closed_trades(limit)?;
    if closed.is_empty() {
        return Ok(PerformanceStats::default());
    }
    // oldest first for the equity walk
    closed.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let mut stats = PerformanceStats {
        total_trades: closed.len(),
        ..Default::default()
    };

    let mut cumulative = 0.0;
    let mut peak = 0.0f64;
    for trade in &closed {
        let pct = trade.profit_pct.unwrap_or(0.0);
        match trade.outcome {
            Some(Outcome::Win) => stats.wins += 1,
            Some(Outcome::Loss) => stats.losses += 1,
            _ => {}
        }
        stats.total_profit_pct += pct;
        stats.total_profit_usd += trade.profit_usd.unwrap_or(0.0);

        cumulative += pct;
        peak = peak.max(cumulative);
        stats.max_drawdown_pct = stats.max_drawdown_pct.max(peak - cumulative);
    }

    stats.win_rate = stats.wins as f64 / stats.total_trades as f64;
    stats.avg_profit_pct = stats.total_profit_pct / stats.total_trades as f64;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::types::Direction;
    use crate::store::{sample_trade, MemoryStore, TradeStatus};
    use chrono::{Duration, Utc};

    fn seed(store: &MemoryStore, results: &[(Outcome, f64, f64)]) {
        for (i, (outcome, pct, usd)) in results.iter().enumerate() {
            let mut t = store.create_trade(sample_trade("BTCUSDT", Direction::Long)).unwrap();
            t.status = TradeStatus::Closed;
            t.outcome = Some(*outcome);
            t.profit_pct = Some(*pct);
            t.profit_usd = Some(*usd);
            t.timestamp = Utc::now() - Duration::minutes((results.len() - i) as i64);
            store.update_trade(&t).unwrap();
        }
    }

    #[test]
    fn empty_store_yields_zeroed_stats() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let stats = performance_stats(&store, 100).unwrap();
        assert_eq!(stats.total_trades, 0);
        assert_eq!(stats.win_rate, 0.0);
    }

    #[test]
    fn drawdown_tracks_the_worst_fall_from_a_peak() {
        let store = MemoryStore::new();
        // equity walk: 10, 30, -10, -25, 5 -> peak 40 at trade 2, trough 5
        seed(
            &store,
            &[
                (Outcome::Win, 10.0, 10.0),
                (Outcome::Win, 30.0, 30.0),
                (Outcome::Loss, -40.0, -40.0),
                (Outcome::Loss, -15.0, -15.0),
                (Outcome::Win, 30.0, 30.0),
            ],
        );
        let store: Arc<dyn RecordStore> = Arc::new(store);
        let stats = performance_stats(&store, 100).unwrap();

        assert_eq!(stats.total_trades, 5);
        assert_eq!(stats.wins, 3);
        assert_eq!(stats.losses, 2);
        assert!((stats.win_rate - 0.6).abs() < 1e-9);
        assert!((stats.total_profit_pct - 15.0).abs() < 1e-9);
        assert!((stats.avg_profit_pct - 3.0).abs() < 1e-9);
        // cumulative peaks at 40, falls to -15
        assert!((stats.max_drawdown_pct - 55.0).abs() < 1e-9);
    }
}
