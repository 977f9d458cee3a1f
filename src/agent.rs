//! Top-level wiring: builds the pipeline from config and runs the event
//! loop. Signal batches come in over a channel, monitor events come back
//! from the reconciliation loop, and closed trades are handed to the
//! feedback controller.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::confirm::AutoConfirm;
use crate::context::{NoCalendar, TickerContext};
use crate::decision::{DecisionOrchestrator, RiskGate};
use crate::exchange::{BinanceFutures, ExchangeInterface, PaperExchange};
use crate::execution::{MonitorEvent, PositionMonitor, TradeExecutor};
use crate::learning::FeedbackController;
use crate::notify::{LogNotifier, Notifier};
use crate::oracle::LlmOracle;
use crate::signals::{RawSignal, SignalAggregator, SignalQualityFilter, Unfiltered};
use crate::store::{MemoryStore, RecordStore};

pub struct Agent {
    config: Config,
    orchestrator: DecisionOrchestrator,
    learning: Arc<FeedbackController>,
    monitor: Option<PositionMonitor>,
    filter: Arc<dyn SignalQualityFilter>,
    notifier: Arc<dyn Notifier>,
    signal_rx: mpsc::Receiver<Vec<RawSignal>>,
    monitor_rx: mpsc::Receiver<MonitorEvent>,
}

impl Agent {
    /// Builds the whole pipeline. Returns the agent plus the sender that
    /// signal ingestion pushes batches into.
    pub fn new(config: Config) -> Result<(Self, mpsc::Sender<Vec<RawSignal>>)> {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());

        let exchange: Arc<dyn ExchangeInterface> = if config.agent.paper_trading {
            info!("📊 Paper trading mode (${:.0} virtual balance)", config.agent.initial_paper_balance);
            Arc::new(PaperExchange::new(config.agent.initial_paper_balance))
        } else {
            warn!("⚠️ LIVE trading against {}", config.binance.futures_url);
            Arc::new(BinanceFutures::new(&config.binance)?)
        };

        let oracle = Arc::new(LlmOracle::new(config.oracle.clone())?);
        let executor = Arc::new(TradeExecutor::new(
            exchange.clone(),
            store.clone(),
            config.fees.clone(),
        ));
        let risk_gate = Arc::new(Mutex::new(RiskGate::new(
            &config.trading,
            &config.limits,
            store.clone(),
        )));

        let (monitor_tx, monitor_rx) = mpsc::channel(256);
        let mut monitor = PositionMonitor::new(
            exchange.clone(),
            store.clone(),
            executor.clone(),
            config.monitor.clone(),
            config.fees.clone(),
            monitor_tx,
        );
        monitor.recover()?;

        let learning = Arc::new(FeedbackController::new(
            store.clone(),
            oracle.clone(),
            risk_gate.clone(),
            config.learning.clone(),
        ));

        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let orchestrator = DecisionOrchestrator::new(
            SignalAggregator::new(store.clone(), config.learning.clone()),
            oracle,
            risk_gate,
            Arc::new(AutoConfirm),
            executor,
            exchange.clone(),
            store,
            Arc::new(TickerContext::new(exchange)),
            Arc::new(NoCalendar),
            notifier.clone(),
            config.trading.clone(),
        );

        let (signal_tx, signal_rx) = mpsc::channel(64);
        let agent = Self {
            config,
            orchestrator,
            learning,
            monitor: Some(monitor),
            filter: Arc::new(Unfiltered),
            notifier,
            signal_rx,
            monitor_rx,
        };
        Ok((agent, signal_tx))
    }

    /// Main loop. Blocks until Ctrl+C or the signal channel closes.
    pub async fn run(mut self) -> Result<()> {
        if let Some(monitor) = self.monitor.take() {
            tokio::spawn(monitor.run());
        }
        info!(
            "🤖 Agent running ({} symbol(s), leverage {}x)",
            self.config.trading.allowed_symbols.len(),
            self.config.trading.default_leverage
        );

        loop {
            tokio::select! {
                batch = self.signal_rx.recv() => {
                    let Some(batch) = batch else {
                        info!("🤖 Signal channel closed, shutting down");
                        break;
                    };
                    let batch = self.filter.filter(batch);
                    if batch.is_empty() {
                        info!("🧭 Batch filtered to nothing, skipping");
                        continue;
                    }
                    match self.orchestrator.evaluate(&batch).await {
                        Ok(outcome) => info!("🧭 Batch resolved: {}", outcome),
                        Err(e) => {
                            error!("🧭 Batch evaluation failed: {}", e);
                            self.notifier.error("batch evaluation", &e.to_string()).await;
                        }
                    }
                }
                Some(event) = self.monitor_rx.recv() => {
                    self.handle_monitor_event(event).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("🤖 Ctrl+C received, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_monitor_event(&self, event: MonitorEvent) {
        let closed_trade_id = match &event {
            MonitorEvent::StopLoss { trade, receipt } => {
                self.notifier.trade_closed(trade, receipt).await;
                Some(receipt.trade_id)
            }
            MonitorEvent::ExternalClose { trade, receipt, .. } => {
                self.notifier.trade_closed(trade, receipt).await;
                Some(receipt.trade_id)
            }
            MonitorEvent::Tp1Hit { trade, breakeven_sl, .. } => {
                info!(
                    "🎯 TP1 hit on trade #{}, stop moved to breakeven {:.2}",
                    trade.id, breakeven_sl
                );
                None
            }
            MonitorEvent::Update { .. } => None,
        };

        if let Some(trade_id) = closed_trade_id {
            match self.learning.on_trade_closed(trade_id).await {
                Ok(report) => {
                    for note in &report.notes {
                        self.notifier.learning(note).await;
                    }
                }
                Err(e) => {
                    error!("🎓 Feedback pass failed for trade #{}: {}", trade_id, e);
                    self.notifier
                        .error("feedback pass", &e.to_string())
                        .await;
                }
            }
        }
    }
}
