//! The AI oracle boundary. Everything crossing it is strict JSON; anything
//! that fails validation degrades to a SKIP decision instead of an error,
//! so a flaky model can never wedge the pipeline.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::OracleConfig;
use crate::decision::types::EntryStrategy;
use crate::signals::{Consensus, WeightedSignal};
use crate::store::Trade;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySpec {
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub strategy: EntryStrategy,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPlan {
    pub symbol: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Value,
    #[serde(default)]
    pub entry: Option<EntrySpec>,
    pub stop_loss: f64,
    pub take_profit: Vec<f64>,
    pub position_size: f64,
    #[serde(default)]
    pub risk_reward: f64,
    #[serde(default)]
    pub risk_assessment: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustPlan {
    #[serde(default)]
    pub trade_id: Option<u64>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Value,
    #[serde(default)]
    pub new_stop_loss: Option<f64>,
    #[serde(default)]
    pub new_take_profit: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkipPlan {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// The oracle's answer for one signal batch, validated at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum OracleDecision {
    #[serde(rename = "LONG")]
    Long(EntryPlan),
    #[serde(rename = "SHORT")]
    Short(EntryPlan),
    #[serde(rename = "ADJUST")]
    Adjust(AdjustPlan),
    #[serde(rename = "SKIP")]
    Skip(SkipPlan),
}

impl OracleDecision {
    /// Parses a raw model response. Markdown code fences are tolerated;
    /// anything else unparseable becomes a SKIP carrying the error.
    pub fn from_json(raw: &str) -> OracleDecision {
        let text = strip_markdown_fences(raw);
        if text.is_empty() {
            return Self::degraded("empty oracle response");
        }
        match serde_json::from_str::<OracleDecision>(text) {
            Ok(decision) => decision,
            Err(e) => {
                warn!("🔮 Unparseable oracle response, degrading to SKIP: {}", e);
                Self::degraded(&format!("JSON parse error: {e}"))
            }
        }
    }

    pub fn degraded(error: &str) -> OracleDecision {
        OracleDecision::Skip(SkipPlan {
            symbol: None,
            confidence: 0.0,
            reasoning: Value::Null,
            error: Some(error.to_string()),
        })
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            OracleDecision::Long(_) => "LONG",
            OracleDecision::Short(_) => "SHORT",
            OracleDecision::Adjust(_) => "ADJUST",
            OracleDecision::Skip(_) => "SKIP",
        }
    }
}

fn strip_markdown_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if text.starts_with("```") {
        // drop the opening ```json line
        text = match text.find('\n') {
            Some(idx) => &text[idx + 1..],
            None => "",
        };
        text = text.trim_end();
        while let Some(stripped) = text.strip_suffix("```") {
            text = stripped.trim_end();
        }
    }
    text.trim()
}

/// Everything the oracle sees when asked for a decision. Context fields
/// are pre-serialized blobs; the oracle boundary does not interpret them.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub signals: Vec<WeightedSignal>,
    pub consensus: Consensus,
    pub market_context: Value,
    pub open_positions: Value,
    pub performance: Value,
    pub known_patterns: Value,
    pub lessons: Value,
    /// Pre-formatted upcoming-events text, empty when no calendar is
    /// attached.
    pub calendar: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalystJudgment {
    pub name: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub was_correct: bool,
    /// Small signed nudge in [-0.1, 0.1], applied after the blended
    /// accuracy mapping and re-clamped.
    #[serde(default)]
    pub weight_adjustment: f64,
    #[serde(default)]
    pub comment: String,
}

/// Post-close review produced by the oracle, consumed by the learning
/// engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TradeReview {
    #[serde(default)]
    pub analyst_performance: Vec<AnalystJudgment>,
    #[serde(default)]
    pub lessons_learned: Vec<String>,
    #[serde(default)]
    pub strategy_suggestions: Vec<String>,
    #[serde(default)]
    pub pattern_notes: String,
    #[serde(default)]
    pub overall_score: Option<f64>,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<OracleDecision>;
    async fn review(&self, trade: &Trade) -> Result<TradeReview>;
}

const DECISION_INSTRUCTIONS: &str = r#"Respond with strict JSON only, no prose. One of:
{"action":"LONG"|"SHORT","symbol":"...","confidence":0-100,"reasoning":{...},"entry":{"price":123.4,"strategy":"MARKET"|"LIMIT","reason":"..."},"stop_loss":123.4,"take_profit":[t1,t2],"position_size":0.5-5.0,"risk_reward":2.5,"risk_assessment":{...}}
{"action":"ADJUST","trade_id":1,"symbol":"...","confidence":0-100,"reasoning":{...},"new_stop_loss":123.4,"new_take_profit":[t1,t2]}
{"action":"SKIP","symbol":"...","confidence":0,"reasoning":{"skip_reason":"..."}}"#;

const REVIEW_INSTRUCTIONS: &str = r#"Review this closed trade. Respond with strict JSON only:
{"analyst_performance":[{"name":"...","direction":"LONG"|"SHORT"|"NEUTRAL","was_correct":true,"weight_adjustment":-0.1 to 0.1,"comment":"..."}],"lessons_learned":["..."],"strategy_suggestions":["..."],"pattern_notes":"...","overall_score":1-10}"#;

/// Production oracle backed by an Anthropic-compatible messages endpoint.
pub struct LlmOracle {
    http: reqwest::Client,
    cfg: OracleConfig,
}

impl LlmOracle {
    pub fn new(cfg: OracleConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("failed to build oracle http client")?;
        info!("🔮 Oracle initialized (model={})", cfg.model);
        Ok(Self { http, cfg })
    }

    async fn complete(&self, prompt: String) -> Result<String> {
        let body = serde_json::json!({
            "model": self.cfg.model,
            "max_tokens": self.cfg.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.cfg.api_url))
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("oracle request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("oracle returned {}: {}", status, text));
        }

        let payload: Value = resp.json().await.context("oracle response not JSON")?;
        payload["content"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("oracle response missing text content"))
    }

    fn decision_prompt(request: &AnalysisRequest) -> String {
        let mut signals = request.signals.clone();
        signals.sort_by(|a, b| {
            b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut signal_text = String::new();
        for s in &signals {
            let decay_tag = if s.time_decay < 1.0 {
                format!(" [decay:{:.1}]", s.time_decay)
            } else {
                String::new()
            };
            let trial_tag = if s.trial_period { " [trial]" } else { "" };
            signal_text.push_str(&format!(
                "- **{}** (weight {:.2}{}{}):\n  {}\n\n",
                s.analyst, s.weight, decay_tag, trial_tag, s.content
            ));
        }

        format!(
            "## Analyst signals\n{signal_text}\n\
             Consensus: {} (strength {:.0}%, bull {:.0}% / bear {:.0}% / neutral {:.0}%)\n\n\
             ## Market context\n{}\n\n\
             ## Open positions\n{}\n\n\
             ## Performance\n{}\n\n\
             ## Known high win-rate patterns\n{}\n\n\
             ## Lessons from recent reviews\n{}\n\n\
             ## Upcoming events\n{}\n\n{}",
            request.consensus.dominant,
            request.consensus.strength,
            request.consensus.bullish_pct,
            request.consensus.bearish_pct,
            request.consensus.neutral_pct,
            request.market_context,
            request.open_positions,
            request.performance,
            request.known_patterns,
            request.lessons,
            if request.calendar.is_empty() { "none" } else { &request.calendar },
            DECISION_INSTRUCTIONS,
        )
    }

    fn review_prompt(trade: &Trade) -> String {
        format!(
            "## Closed trade\n\
             - pair: {}\n- direction: {}\n- entry: {}\n- exit: {:?}\n\
             - stop_loss: {}\n- take_profit: {:?}\n- size: {}%\n- confidence: {}%\n\
             - outcome: {:?} ({:+.2}%)\n\n\
             ## Analyst opinions at entry\n{}\n\n\
             ## Decision reasoning at entry\n{}\n\n{}",
            trade.symbol,
            trade.direction,
            trade.entry_price,
            trade.exit_price,
            trade.stop_loss,
            trade.take_profit,
            trade.position_size,
            trade.confidence,
            trade.outcome,
            trade.profit_pct.unwrap_or(0.0),
            trade.analyst_opinions,
            trade.ai_reasoning,
            REVIEW_INSTRUCTIONS,
        )
    }
}

#[async_trait]
impl Oracle for LlmOracle {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<OracleDecision> {
        let text = self.complete(Self::decision_prompt(request)).await?;
        let decision = OracleDecision::from_json(&text);
        info!("🔮 Oracle decision: {}", decision.action_name());
        Ok(decision)
    }

    async fn review(&self, trade: &Trade) -> Result<TradeReview> {
        let text = self.complete(Self::review_prompt(trade)).await?;
        let cleaned = strip_markdown_fences(&text);
        serde_json::from_str(cleaned).context("review response failed validation")
    }
}
