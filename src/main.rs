use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use signal_futures_agent::agent::Agent;
use signal_futures_agent::config::Config;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_futures_agent=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    print_banner(&config);

    let (agent, signal_tx) = Agent::new(config)?;

    // Ingestion adapters (Telegram bridge, webhook, etc.) clone this
    // sender and push signal batches into the pipeline.
    info!("📡 Signal channel ready (capacity {})", signal_tx.max_capacity());

    agent.run().await
}

fn print_banner(config: &Config) {
    println!("\n╔═══════════════════════════════════════════════════════════╗");
    println!("║             AI Futures Signal Trading Agent               ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!(
        "📊 Mode: {}",
        if config.agent.paper_trading {
            "PAPER TRADING (Safe Mode)"
        } else {
            "⚠️  LIVE TRADING ⚠️"
        }
    );
    println!("🔮 Oracle: {}", config.oracle.model);
    println!("📈 Symbols: {}", config.trading.allowed_symbols.join(", "));
    println!("📊 Risk Settings:");
    println!("   • Min Confidence: {:.0}%", config.trading.min_confidence);
    println!("   • Max Position: {:.1}% of balance", config.trading.max_position_size);
    println!("   • Leverage: {}x", config.trading.default_leverage);
    println!("   • Max Open Positions: {}", config.trading.max_positions);
    println!(
        "⏱️  Monitor Interval: {} seconds ({} polls to confirm SL)",
        config.monitor.interval_secs, config.monitor.sl_confirm_polls
    );
    println!();
    println!("Press Ctrl+C to stop");
    println!("═══════════════════════════════════════════════════════════");
    println!();
}
