use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub binance: BinanceConfig,
    pub oracle: OracleConfig,
    pub trading: TradingConfig,
    pub fees: FeesConfig,
    pub learning: LearningConfig,
    pub monitor: MonitorConfig,
    pub limits: HardLimitsConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BinanceConfig {
    pub api_key: String,
    pub api_secret: String,
    pub futures_url: String,
    pub market_data_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OracleConfig {
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradingConfig {
    pub enabled: bool,
    pub auto_execute: bool,
    pub confirmation_delay_secs: u64,
    pub default_leverage: u32,
    pub allowed_symbols: Vec<String>,
    // Soft limits (seed values; the learning engine re-tunes these at runtime)
    pub min_confidence: f64,
    pub min_risk_reward: f64,
    pub max_position_size: f64,
    pub max_positions: usize,
    pub max_daily_trades: usize,
    pub max_daily_loss: f64,
    pub max_consecutive_losses: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeesConfig {
    pub taker_rate: f64,
    pub maker_rate: f64,
    pub slippage_rate: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LearningConfig {
    pub enabled: bool,
    pub trial_period_calls: u32,
    pub trial_period_discount: f64,
    pub performance_weight: f64,
    pub recency_weight: f64,
    pub min_trades_before_learning: usize,
    pub pattern_analysis_frequency: usize,
    pub parameter_optimization_frequency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub sl_confirm_polls: u32,
    pub tp1_qty_ratio: f64,
    pub close_tolerance_pct: f64,
    pub liquidation_margin_pct: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HardLimitsConfig {
    pub absolute_max_position: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub paper_trading: bool,
    pub initial_paper_balance: f64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let binance = BinanceConfig {
            api_key: env::var("BINANCE_API_KEY").unwrap_or_default(),
            api_secret: env::var("BINANCE_API_SECRET").unwrap_or_default(),
            futures_url: env::var("BINANCE_FUTURES_URL")
                .unwrap_or_else(|_| "https://testnet.binancefuture.com".to_string()),
            market_data_url: env::var("BINANCE_MARKET_DATA_URL")
                .unwrap_or_else(|_| "https://data-api.binance.vision".to_string()),
        };

        let oracle = OracleConfig {
            api_key: env::var("ORACLE_API_KEY").unwrap_or_default(),
            api_url: env::var("ORACLE_API_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            model: env::var("ORACLE_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            max_tokens: env::var("ORACLE_MAX_TOKENS")
                .unwrap_or_else(|_| "4096".to_string())
                .parse()
                .unwrap_or(4096),
            timeout_secs: env::var("ORACLE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .unwrap_or(120),
        };

        let trading = TradingConfig {
            enabled: env::var("TRADING_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            auto_execute: env::var("AUTO_EXECUTE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            confirmation_delay_secs: env::var("CONFIRMATION_DELAY_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            default_leverage: env::var("DEFAULT_LEVERAGE")
                .unwrap_or_else(|_| "25".to_string())
                .parse()
                .unwrap_or(25),
            allowed_symbols: env::var("ALLOWED_SYMBOLS")
                .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            min_confidence: env::var("MIN_CONFIDENCE")
                .unwrap_or_else(|_| "75.0".to_string())
                .parse()
                .unwrap_or(75.0),
            min_risk_reward: env::var("MIN_RISK_REWARD")
                .unwrap_or_else(|_| "2.0".to_string())
                .parse()
                .unwrap_or(2.0),
            max_position_size: env::var("MAX_POSITION_SIZE_PCT")
                .unwrap_or_else(|_| "5.0".to_string())
                .parse()
                .unwrap_or(5.0),
            max_positions: env::var("MAX_POSITIONS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .unwrap_or(2),
            max_daily_trades: env::var("MAX_DAILY_TRADES")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            max_daily_loss: env::var("MAX_DAILY_LOSS_PCT")
                .unwrap_or_else(|_| "15.0".to_string())
                .parse()
                .unwrap_or(15.0),
            max_consecutive_losses: env::var("MAX_CONSECUTIVE_LOSSES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
        };

        let fees = FeesConfig {
            taker_rate: env::var("FEE_TAKER_RATE")
                .unwrap_or_else(|_| "0.0004".to_string())
                .parse()
                .unwrap_or(0.0004),
            maker_rate: env::var("FEE_MAKER_RATE")
                .unwrap_or_else(|_| "0.0002".to_string())
                .parse()
                .unwrap_or(0.0002),
            slippage_rate: env::var("FEE_SLIPPAGE_RATE")
                .unwrap_or_else(|_| "0.0001".to_string())
                .parse()
                .unwrap_or(0.0001),
        };

        let learning = LearningConfig {
            enabled: env::var("LEARNING_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            trial_period_calls: env::var("TRIAL_PERIOD_CALLS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            trial_period_discount: env::var("TRIAL_PERIOD_DISCOUNT")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()
                .unwrap_or(0.5),
            performance_weight: env::var("PERFORMANCE_WEIGHT")
                .unwrap_or_else(|_| "0.7".to_string())
                .parse()
                .unwrap_or(0.7),
            recency_weight: env::var("RECENCY_WEIGHT")
                .unwrap_or_else(|_| "0.3".to_string())
                .parse()
                .unwrap_or(0.3),
            min_trades_before_learning: env::var("MIN_TRADES_BEFORE_LEARNING")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            pattern_analysis_frequency: env::var("PATTERN_ANALYSIS_FREQUENCY")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            parameter_optimization_frequency: env::var("PARAM_OPTIMIZATION_FREQUENCY")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .unwrap_or(50),
        };

        let monitor = MonitorConfig {
            interval_secs: env::var("MONITOR_INTERVAL_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            sl_confirm_polls: env::var("SL_CONFIRM_POLLS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .unwrap_or(4),
            tp1_qty_ratio: env::var("TP1_QTY_RATIO")
                .unwrap_or_else(|_| "0.7".to_string())
                .parse()
                .unwrap_or(0.7),
            close_tolerance_pct: env::var("CLOSE_TOLERANCE_PCT")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()
                .unwrap_or(0.5),
            liquidation_margin_pct: env::var("LIQUIDATION_MARGIN_PCT")
                .unwrap_or_else(|_| "1.0".to_string())
                .parse()
                .unwrap_or(1.0),
        };

        let limits = HardLimitsConfig {
            absolute_max_position: env::var("ABSOLUTE_MAX_POSITION_PCT")
                .unwrap_or_else(|_| "5.0".to_string())
                .parse()
                .unwrap_or(5.0),
        };

        let agent = AgentConfig {
            paper_trading: env::var("PAPER_TRADING")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            initial_paper_balance: env::var("INITIAL_PAPER_BALANCE")
                .unwrap_or_else(|_| "10000.0".to_string())
                .parse()
                .unwrap_or(10000.0),
        };

        Ok(Config {
            binance,
            oracle,
            trading,
            fees,
            learning,
            monitor,
            limits,
            agent,
        })
    }
}
