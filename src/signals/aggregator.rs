use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::config::LearningConfig;
use crate::signals::types::{Bias, Consensus, MarketRegime, RawSignal, WeightedSignal};
use crate::store::RecordStore;

const BULLISH_KEYWORDS: &[&str] = &[
    "多", "long", "買", "buy", "看漲", "bullish", "做多", "上漲", "反彈", "突破", "支撐",
];

const BEARISH_KEYWORDS: &[&str] = &[
    "空", "short", "賣", "sell", "看跌", "bearish", "做空", "下跌", "回調", "跌破", "壓力",
];

/// Symbol aliases recognized in analyst text, mapped to perpetual pairs.
const KNOWN_SYMBOLS: &[(&str, &str)] = &[
    ("BTC", "BTCUSDT"),
    ("比特幣", "BTCUSDT"),
    ("比特币", "BTCUSDT"),
    ("大餅", "BTCUSDT"),
    ("大饼", "BTCUSDT"),
    ("ETH", "ETHUSDT"),
    ("乙太", "ETHUSDT"),
    ("以太", "ETHUSDT"),
    ("以太坊", "ETHUSDT"),
    ("姨太", "ETHUSDT"),
    ("SOL", "SOLUSDT"),
    ("BNB", "BNBUSDT"),
    ("XRP", "XRPUSDT"),
    ("DOGE", "DOGEUSDT"),
    ("ADA", "ADAUSDT"),
    ("AVAX", "AVAXUSDT"),
    ("DOT", "DOTUSDT"),
    ("MATIC", "MATICUSDT"),
    ("LINK", "LINKUSDT"),
];

/// Step-function freshness factor. Messages inside 30 minutes carry full
/// weight; anything older than a day is nearly muted.
pub fn decay_factor(age: Duration) -> f64 {
    if age < Duration::minutes(30) {
        1.0
    } else if age < Duration::hours(2) {
        0.8
    } else if age < Duration::hours(6) {
        0.5
    } else if age < Duration::hours(24) {
        0.2
    } else {
        0.1
    }
}

/// Turns a raw signal batch into weighted signals and a directional
/// consensus. Weights start from each analyst's learned weight, then get
/// multiplied by time decay, the trial-period discount for analysts with a
/// short track record, and a regime-specialization adjustment.
pub struct SignalAggregator {
    store: Arc<dyn RecordStore>,
    cfg: LearningConfig,
}

impl SignalAggregator {
    pub fn new(store: Arc<dyn RecordStore>, cfg: LearningConfig) -> Self {
        Self { store, cfg }
    }

    pub fn weigh(
        &self,
        batch: &[RawSignal],
        regime: Option<MarketRegime>,
    ) -> Result<Vec<WeightedSignal>> {
        let now = Utc::now();
        let mut out = Vec::with_capacity(batch.len());
        let mut decayed = 0usize;

        for raw in batch {
            let analyst = self.store.get_or_create_analyst(&raw.analyst)?;
            let mut weight = analyst.weight;

            // Negative ages (clock skew on the ingestion side) count as fresh.
            let age = now.signed_duration_since(raw.timestamp).max(Duration::zero());
            let time_decay = decay_factor(age);
            weight *= time_decay;
            if time_decay < 1.0 {
                decayed += 1;
            }

            let trial_period = analyst.total_calls < self.cfg.trial_period_calls;
            if trial_period {
                weight *= self.cfg.trial_period_discount;
                debug!(
                    "🧪 Trial period discount for {} (calls={})",
                    raw.analyst, analyst.total_calls
                );
            }

            // Regime specialization only once an analyst has enough history.
            if let Some(regime) = regime {
                if analyst.total_calls >= 10 {
                    let mut overall = analyst.accuracy;
                    if overall == 0.0 {
                        overall = 0.5;
                    }
                    let spec = match regime {
                        MarketRegime::Trending => analyst.trend_accuracy,
                        MarketRegime::Ranging => analyst.range_accuracy,
                    };
                    let spec = if spec == 0.0 { overall } else { spec };
                    let adj = (0.3 * (spec - overall) / overall).clamp(-0.3, 0.3);
                    weight *= 1.0 + adj;
                    if adj.abs() > 0.05 {
                        debug!(
                            "🎯 Specialization: {} weight adj {:+.0}% ({:?} market)",
                            raw.analyst,
                            adj * 100.0,
                            regime
                        );
                    }
                }
            }

            out.push(WeightedSignal {
                analyst: raw.analyst.clone(),
                content: raw.content.clone(),
                channel: raw.channel.clone(),
                timestamp: raw.timestamp,
                weight,
                time_decay,
                trial_period,
            });
        }

        if decayed > 0 {
            info!("⏳ Time decay applied: {}/{} messages decayed", decayed, batch.len());
        }
        Ok(out)
    }

    /// Keyword-polarity consensus. A message matching both bullish and
    /// bearish vocabulary is counted as neutral rather than guessed at.
    pub fn consensus(signals: &[WeightedSignal]) -> Consensus {
        let mut bullish = 0.0;
        let mut bearish = 0.0;
        let mut neutral = 0.0;

        for sig in signals {
            match signal_bias(&sig.content) {
                Bias::Bullish => bullish += sig.weight,
                Bias::Bearish => bearish += sig.weight,
                Bias::Neutral => neutral += sig.weight,
            }
        }

        let total = bullish + bearish + neutral;
        if total == 0.0 {
            return Consensus {
                bullish_pct: 0.0,
                bearish_pct: 0.0,
                neutral_pct: 100.0,
                dominant: Bias::Neutral,
                strength: 0.0,
            };
        }

        let dominant = if bullish == bearish {
            Bias::Neutral
        } else if bullish > bearish {
            Bias::Bullish
        } else {
            Bias::Bearish
        };

        Consensus {
            bullish_pct: round1(bullish / total * 100.0),
            bearish_pct: round1(bearish / total * 100.0),
            neutral_pct: round1(neutral / total * 100.0),
            dominant,
            strength: round1((bullish - bearish).abs() / total * 100.0),
        }
    }

    /// Scans the batch for known symbol aliases; falls back to the
    /// configured allow-list when nothing is mentioned.
    pub fn detect_symbols(batch: &[RawSignal], fallback: &[String]) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        for raw in batch {
            let text = raw.content.to_uppercase();
            for (alias, symbol) in KNOWN_SYMBOLS {
                if text.contains(&alias.to_uppercase()) && !found.iter().any(|s| s == symbol) {
                    found.push((*symbol).to_string());
                }
            }
        }
        if found.is_empty() {
            fallback.to_vec()
        } else {
            found
        }
    }
}

/// Keyword polarity of a single message. Matching both vocabularies is a
/// neutral, not a guess.
pub fn signal_bias(content: &str) -> Bias {
    let text = content.to_lowercase();
    let is_bull = BULLISH_KEYWORDS.iter().any(|k| text.contains(k));
    let is_bear = BEARISH_KEYWORDS.iter().any(|k| text.contains(k));
    match (is_bull, is_bear) {
        (true, false) => Bias::Bullish,
        (false, true) => Bias::Bearish,
        _ => Bias::Neutral,
    }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
