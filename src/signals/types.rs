use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single analyst message as delivered by the ingestion transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSignal {
    pub analyst: String,
    pub content: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
}

/// A signal annotated with its effective weight after decay, trial-period
/// discount and regime specialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedSignal {
    pub analyst: String,
    pub content: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub weight: f64,
    pub time_decay: f64,
    pub trial_period: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bias::Bullish => write!(f, "BULLISH"),
            Bias::Bearish => write!(f, "BEARISH"),
            Bias::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Weighted directional consensus over one signal batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consensus {
    pub bullish_pct: f64,
    pub bearish_pct: f64,
    pub neutral_pct: f64,
    pub dominant: Bias,
    /// |bullish - bearish| / total, as a percentage.
    pub strength: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketRegime {
    Trending,
    Ranging,
}
