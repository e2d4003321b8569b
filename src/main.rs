use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use badger_sentinel::config::Config;
use badger_sentinel::core::TradingMode;
use badger_sentinel::database::{BatchRecorder, RetentionManager, TimeSeriesDb};
use badger_sentinel::execution::monitor::MonitorServices;
use badger_sentinel::execution::{OrderMonitor, OrderStore};
use badger_sentinel::paper::{PaperExecutor, PaperExecutorSettings, PriceCache, VirtualLedger};
use badger_sentinel::transport::{OrderEvent, OrderEventBus};

const DEFAULT_CONFIG_PATH: &str = "config/sentinel.toml";

fn init_tracing() -> Result<()> {
    // Create logs directory if it doesn't exist
    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "sentinel.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .json()
        .with_current_span(false)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Leak the guard to prevent the file appender from being dropped
    std::mem::forget(guard);

    Ok(())
}

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::load_from_file(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load_from_file(DEFAULT_CONFIG_PATH),
        None => {
            warn!("No config file found at {}, using defaults", DEFAULT_CONFIG_PATH);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("🦡 Badger Sentinel - Conditional Order Monitor");
    info!("=============================================");

    let config = load_config()?;
    if config.session.mode == TradingMode::Live {
        anyhow::bail!("live mode needs an external trade executor; this binary only wires paper sessions");
    }
    info!(
        "Session {} ({}), exits settle in {}",
        config.session.trader_id,
        config.session.mode.as_str(),
        config.session.quote_instrument
    );

    let db = TimeSeriesDb::connect(&config.database).await?;

    let recorder = BatchRecorder::new(Arc::new(db.clone()), config.recorder.clone());
    let recorder_task = recorder.spawn();

    let retention = RetentionManager::new(db.clone(), config.retention.clone());
    let retention_stop = retention.stop_flag();
    let retention_task = retention.spawn();

    let prices = Arc::new(PriceCache::new());
    let ledger = Arc::new(VirtualLedger::new());
    let executor = Arc::new(PaperExecutor::new(
        prices.clone(),
        ledger.clone(),
        PaperExecutorSettings::default(),
    ));

    let event_bus = Arc::new(OrderEventBus::default());
    let mut event_rx = event_bus.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event {
                OrderEvent::OrderExecuted { order_id, instrument, tx_ref, .. } => {
                    info!(order_id = %order_id, instrument = %instrument, tx_ref = %tx_ref, "📣 Order executed");
                }
                OrderEvent::OrderFailed { order_id, instrument, error, .. } => {
                    warn!(order_id = %order_id, instrument = %instrument, "📣 Order failed: {}", error);
                }
            }
        }
    });

    let monitor = OrderMonitor::new(
        Arc::new(OrderStore::new()),
        MonitorServices {
            prices,
            ledger,
            executor,
            events: event_bus,
        },
        recorder.clone(),
        config.monitor.clone(),
        config.session.clone(),
    );
    let monitor_task = monitor.spawn();

    info!("✅ All services started");

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("🛑 Shutdown signal received");
        }
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    monitor.stop();
    if let Err(e) = monitor_task.await {
        error!("Order monitor task failed: {}", e);
    }

    recorder.shutdown().await;
    if let Err(e) = recorder_task.await {
        error!("Batch recorder task failed: {}", e);
    }

    retention_stop.store(false, std::sync::atomic::Ordering::Release);
    retention_task.abort();
    event_task.abort();

    let dead_letters = recorder.dead_letters().len();
    if dead_letters > 0 {
        warn!("{} dead-lettered batches were not written", dead_letters);
    }

    db.close().await;
    info!("👋 Sentinel shutdown complete");
    Ok(())
}
