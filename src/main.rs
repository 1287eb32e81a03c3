// =============================================================================
// ETF signal agent — Main Entry Point
// =============================================================================
//
// Single binary, no subcommands: load `.env`, init tracing, load
// `RuntimeConfig` with a logged fallback to defaults, construct the
// gateways and the executor, spawn the scheduler, spawn the approval-channel
// listener, spawn the REST control-surface server, then block on
// `tokio::signal::ctrl_c()` and drive a cooperative shutdown.
// =============================================================================

mod api;
mod approval;
mod broker;
mod config;
mod executor;
mod hedge;
mod market_data;
mod persistence;
mod scheduler;
mod signal_engine;
mod types;

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::approval::telegram::TelegramApproval;
use crate::approval::{ApprovalChannel, CommandSurface};
use crate::broker::live::LiveBroker;
use crate::broker::paper::PaperBroker;
use crate::broker::BrokerGateway;
use crate::config::RuntimeConfig;
use crate::executor::Executor;
use crate::market_data::providers::{AlpacaProvider, FinnhubProvider, YahooProvider};
use crate::market_data::{MarketDataGateway, MarketDataProvider, MultiProviderGateway};
use crate::persistence::Persistence;
use crate::scheduler::Scheduler;
use crate::signal_engine::SignalEngine;
use crate::types::TradingMode;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("etf-signal-agent starting");

    let config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });
    info!(mode = %config.bot.mode, "runtime config loaded");
    let config = Arc::new(RwLock::new(config));

    let persistence = Arc::new(Persistence::open("data")?);

    let market_data: Arc<dyn MarketDataGateway> = Arc::new(MultiProviderGateway::new(build_providers()));

    let mode = config.read().bot.mode;
    let broker: Arc<dyn BrokerGateway> = match mode {
        TradingMode::Live => {
            let base_url = std::env::var("BROKER_BASE_URL")
                .unwrap_or_else(|_| "https://api.etrade.com".to_string());
            let account_id_key = config.read().bot.account_handle.clone();
            let access_token = std::env::var("BROKER_ACCESS_TOKEN").ok();
            Arc::new(LiveBroker::new(base_url, account_id_key, access_token))
        }
        TradingMode::Paper => {
            let starting_capital = config.read().bot.paper_starting_capital;
            let slippage_pct = config.read().strategy.slippage_pct;
            Arc::new(PaperBroker::new(market_data.clone(), starting_capital, slippage_pct))
        }
    };

    let signal_engine = Arc::new(SignalEngine::new());

    // The Telegram approval channel needs an Arc<dyn CommandSurface> before
    // the executor exists and an Arc<dyn ApprovalChannel> after it does; the
    // executor implements neither trait directly (SPEC_FULL.md §6 treats the
    // command surface as a thin wrapper the process composes, not core
    // logic), so a small local adapter closes the cycle.
    struct CommandAdapter {
        executor: Arc<Executor>,
        scheduler: Arc<RwLock<Option<Arc<Scheduler>>>>,
        config: Arc<RwLock<RuntimeConfig>>,
        persistence: Arc<Persistence>,
    }

    #[async_trait::async_trait]
    impl CommandSurface for CommandAdapter {
        async fn pause(&self) -> String {
            if let Some(s) = self.scheduler.read().clone() {
                s.pause();
                "Scheduler paused.".to_string()
            } else {
                "Scheduler not ready yet.".to_string()
            }
        }

        async fn resume(&self) -> String {
            if let Some(s) = self.scheduler.read().clone() {
                s.resume();
                "Scheduler resumed.".to_string()
            } else {
                "Scheduler not ready yet.".to_string()
            }
        }

        async fn set_mode(&self, mode: &str) -> String {
            let parsed = match mode.trim().to_lowercase().as_str() {
                "live" => TradingMode::Live,
                "paper" => TradingMode::Paper,
                _ => return format!("Unknown mode '{mode}'. Use 'live' or 'paper'."),
            };
            self.config.write().bot.mode = parsed;
            if let Err(e) = self.config.read().save(CONFIG_PATH) {
                error!(error = %e, "failed to persist mode switch");
            }
            if let Err(e) = self.persistence.set_trading_mode(&parsed.to_string()) {
                error!(error = %e, "failed to persist trading mode to kv store");
            }
            format!("Mode switched to {parsed}.")
        }

        async fn balance(&self) -> String {
            match self.executor.get_portfolio_value().await {
                Ok(snapshot) => format!(
                    "Cash: ${:.2}\nPositions: {}",
                    snapshot.cash,
                    snapshot.positions.len()
                ),
                Err(e) => format!("Failed to fetch balance: {e}"),
            }
        }

        async fn positions(&self) -> String {
            match self.executor.get_portfolio_value().await {
                Ok(snapshot) if snapshot.positions.is_empty() => "No open positions.".to_string(),
                Ok(snapshot) => snapshot
                    .positions
                    .iter()
                    .map(|p| {
                        format!(
                            "{}: {:.2} shares @ ${:.2} (now ${:.2}, P&L ${:+.2})",
                            p.instrument, p.shares, p.entry_price, p.current_price, p.unrealized_pnl
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => format!("Failed to fetch positions: {e}"),
            }
        }

        async fn signal(&self) -> String {
            let signal = self.executor.compute_signal().await;
            format!("{}: {}", signal.kind, signal.reason)
        }

        async fn logs(&self, limit: usize) -> String {
            let events = self.persistence.get_events(limit, None);
            if events.is_empty() {
                return "No events logged.".to_string();
            }
            events
                .iter()
                .map(|e| format!("[{}] {:?} {}", e.timestamp, e.level, e.event_type))
                .collect::<Vec<_>>()
                .join("\n")
        }
    }

    let scheduler_slot: Arc<RwLock<Option<Arc<Scheduler>>>> = Arc::new(RwLock::new(None));

    let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
    let telegram_chat_id: i64 = std::env::var("TELEGRAM_CHAT_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(0);
    let approval_timeout = std::time::Duration::from_secs(config.read().bot.approval_timeout_minutes * 60);

    struct LazyCommandAdapter {
        inner: Arc<RwLock<Option<Arc<dyn CommandSurface>>>>,
    }

    #[async_trait::async_trait]
    impl CommandSurface for LazyCommandAdapter {
        async fn pause(&self) -> String {
            let inner = self.inner.read().clone();
            match inner {
                Some(c) => c.pause().await,
                None => "Not ready yet.".to_string(),
            }
        }
        async fn resume(&self) -> String {
            let inner = self.inner.read().clone();
            match inner {
                Some(c) => c.resume().await,
                None => "Not ready yet.".to_string(),
            }
        }
        async fn set_mode(&self, mode: &str) -> String {
            let inner = self.inner.read().clone();
            match inner {
                Some(c) => c.set_mode(mode).await,
                None => "Not ready yet.".to_string(),
            }
        }
        async fn balance(&self) -> String {
            let inner = self.inner.read().clone();
            match inner {
                Some(c) => c.balance().await,
                None => "Not ready yet.".to_string(),
            }
        }
        async fn positions(&self) -> String {
            let inner = self.inner.read().clone();
            match inner {
                Some(c) => c.positions().await,
                None => "Not ready yet.".to_string(),
            }
        }
        async fn signal(&self) -> String {
            let inner = self.inner.read().clone();
            match inner {
                Some(c) => c.signal().await,
                None => "Not ready yet.".to_string(),
            }
        }
        async fn logs(&self, limit: usize) -> String {
            let inner = self.inner.read().clone();
            match inner {
                Some(c) => c.logs(limit).await,
                None => "Not ready yet.".to_string(),
            }
        }
    }

    let lazy_commands: Arc<RwLock<Option<Arc<dyn CommandSurface>>>> = Arc::new(RwLock::new(None));
    let commands_for_telegram = Arc::new(LazyCommandAdapter { inner: lazy_commands.clone() });

    let telegram = Arc::new(TelegramApproval::new(
        telegram_token,
        telegram_chat_id,
        approval_timeout,
        commands_for_telegram.clone(),
    ));
    let approval: Arc<dyn ApprovalChannel> = telegram.clone();

    let executor = Arc::new(Executor::new(
        config.clone(),
        broker,
        market_data,
        approval,
        persistence.clone(),
        signal_engine,
    ));

    let command_adapter = Arc::new(CommandAdapter {
        executor: executor.clone(),
        scheduler: scheduler_slot.clone(),
        config: config.clone(),
        persistence: persistence.clone(),
    });
    *lazy_commands.write() = Some(command_adapter.clone() as Arc<dyn CommandSurface>);

    let scheduler = Arc::new(Scheduler::new(executor.clone(), config.clone(), persistence.clone()));
    *scheduler_slot.write() = Some(scheduler.clone());

    let shutdown = CancellationToken::new();

    let telegram_shutdown = shutdown.clone();
    tokio::spawn(async move {
        telegram.listen(telegram_shutdown).await;
    });

    let sched_shutdown = shutdown.clone();
    let sched_handle = scheduler.clone();
    tokio::spawn(async move {
        sched_handle.run(sched_shutdown).await;
    });

    let bind_addr = std::env::var("API_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    let rest_executor = executor.clone();
    let rest_scheduler = scheduler.clone();
    let rest_persistence = persistence.clone();
    tokio::spawn(async move {
        let app = api::rest::router(rest_executor, rest_scheduler, rest_persistence);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, addr = %bind_addr, "failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "REST control surface listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");
    shutdown.cancel();

    if let Err(e) = config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    info!("etf-signal-agent shut down complete");
    Ok(())
}

fn build_providers() -> Vec<Arc<dyn MarketDataProvider>> {
    let alpaca_key = std::env::var("ALPACA_API_KEY").ok();
    let alpaca_secret = std::env::var("ALPACA_SECRET_KEY").ok();
    let finnhub_key = std::env::var("FINNHUB_API_KEY").ok();

    vec![
        Arc::new(AlpacaProvider::new(alpaca_key, alpaca_secret)),
        Arc::new(FinnhubProvider::new(finnhub_key)),
        Arc::new(YahooProvider::new()),
    ]
}
