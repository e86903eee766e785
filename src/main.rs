use anyhow::Result;
use clap::Parser;
use gridbnb::config::exchange::load_exchange_config;
use gridbnb::config::grid::{print_config_help, GridConfig};
use gridbnb::config::load_config;
use gridbnb::config::notify::load_notify_config;
use gridbnb::constants::{
    BOOTSTRAP_ATTEMPTS, EVENT_QUEUE_CAPACITY, NOTIFICATION_CHANNEL_CAPACITY, PRICE_POLL_INTERVAL,
    SHUTDOWN_FLUSH_TIMEOUT,
};
use gridbnb::engine::{EngineEvent, ReconciliationEngine};
use gridbnb::exchange::hyperliquid::HyperliquidExchange;
use gridbnb::exchange::paper::PaperExchange;
use gridbnb::exchange::Exchange;
use gridbnb::feed::{OrderEventListener, PriceFeed, PriceNormalizer};
use gridbnb::grid::{layout, GridModel};
use gridbnb::logging::order_audit::OrderAuditLogger;
use gridbnb::notify::dispatcher::NotificationDispatcher;
use gridbnb::notify::EventBroadcaster;
use gridbnb::persistence::{JsonFileStore, SnapshotWriter};
use gridbnb::ui::console::ConsoleRenderer;
use log::{error, info, warn};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Grid trading reconciliation engine", long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,

    /// Interactively create a grid config file
    #[arg(long)]
    create: bool,

    /// Describe the config file format
    #[arg(long)]
    help_config: bool,

    /// Print the grid and the initial order plan, then exit
    #[arg(long)]
    dry_run: bool,

    /// Trade against an in-memory exchange starting at this price
    #[arg(long, value_name = "PRICE")]
    paper: Option<Decimal>,

    /// Largest paper price move per feed interval (0.002 = 0.2%)
    #[arg(long, default_value = "0.002")]
    paper_volatility: Decimal,

    /// Where the engine snapshot is kept
    #[arg(long, default_value = "state/grid_state.json")]
    state_file: String,
}

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("logs", "application.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("gridbnb=debug".parse()?),
        );

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_target(false)
        .with_filter(tracing_subscriber::EnvFilter::new("info,gridbnb=debug"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    let args = Args::parse();

    if args.help_config {
        print_config_help();
        return Ok(());
    }

    if args.create {
        if let Err(e) = gridbnb::config::creator::create_config() {
            error!("Error creating config: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let config_path = args.config.clone().ok_or_else(|| {
        anyhow::anyhow!("Config file is required unless --help-config or --create is used")
    })?;

    info!("Loading config from: {}", config_path);
    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let exchange = match connect_exchange(&args, &config).await {
        Ok(e) => e,
        Err(e) => {
            error!("Failed to connect exchange: {}", e);
            std::process::exit(1);
        }
    };

    if args.dry_run {
        info!("[DRY RUN] Previewing grid for {}...", config.symbol);
        return run_dry(&config, exchange.as_ref()).await;
    }

    if let Err(e) = run_live(config, exchange, &args.state_file).await {
        error!("Engine error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn connect_exchange(args: &Args, config: &GridConfig) -> Result<Arc<dyn Exchange>> {
    if let Some(price) = args.paper {
        info!("Paper trading {} from price {}", config.symbol, price);
        let paper = Arc::new(PaperExchange::new(&config.symbol, price));
        if !args.dry_run {
            tokio::spawn(paper.clone().random_walk(
                args.paper_volatility,
                config.price_decimals,
                PRICE_POLL_INTERVAL,
            ));
        }
        let exchange: Arc<dyn Exchange> = paper;
        return Ok(exchange);
    }

    let exchange_config = load_exchange_config()?;
    info!(
        "Exchange config loaded for network: {}",
        exchange_config.network
    );
    let exchange = HyperliquidExchange::connect(&exchange_config, &config.symbol).await?;
    Ok(Arc::new(exchange))
}

/// Prints the grid and the orders a fresh start would place.
async fn run_dry(config: &GridConfig, exchange: &dyn Exchange) -> Result<()> {
    let quote = exchange.get_ticker(&config.symbol).await?;
    let tick = PriceNormalizer::default()
        .normalize(&quote)
        .ok_or_else(|| anyhow::anyhow!("No usable price for {}", config.symbol))?;

    let grid = GridModel::new(config)?;
    let offset = match grid.bounds(0) {
        Some((lo, hi)) if tick.price >= lo && tick.price < hi => 0,
        _ => grid.recentre_offset(tick.price).unwrap_or(0),
    };
    let levels = grid.levels(offset);
    let plan = layout(&levels, tick.price, config.max_open_levels);

    ConsoleRenderer::render(config, &levels, &plan, tick.price, offset);
    Ok(())
}

async fn run_live(config: GridConfig, exchange: Arc<dyn Exchange>, state_file: &str) -> Result<()> {
    info!(
        "Starting {} grid for {} on {}",
        config.type_name(),
        config.symbol,
        exchange.name()
    );

    let audit_logger = match OrderAuditLogger::new("logs") {
        Ok(l) => Some(l),
        Err(e) => {
            error!("Failed to initialize Order Audit Logger: {}", e);
            None
        }
    };

    let broadcaster = EventBroadcaster::new(NOTIFICATION_CHANNEL_CAPACITY);
    let mut dispatcher_handle = None;
    match load_notify_config() {
        Ok(notify_config) if notify_config.is_enabled() => {
            match NotificationDispatcher::new(&notify_config, broadcaster.subscribe()) {
                Ok(dispatcher) => dispatcher_handle = Some(tokio::spawn(dispatcher.run())),
                Err(e) => error!("Failed to initialize notification dispatcher: {}", e),
            }
        }
        Ok(_) => {}
        Err(e) => error!("Failed to load notification config: {}", e),
    }

    let (writer, writer_handle) =
        SnapshotWriter::spawn(JsonFileStore::new(state_file), config.persistence_timeout());

    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    let feed = PriceFeed::new(exchange.clone(), &config.symbol, tx.clone())
        .with_timeout(config.exchange_timeout());
    let feed_handle = tokio::spawn(feed.run());
    let listener = OrderEventListener::new(exchange.clone(), &config.symbol, tx.clone());
    let listener_handle = tokio::spawn(listener.run());
    let signal_handle = tokio::spawn(forward_signals(tx));

    let policy = config.retry_policy();
    let mut engine = ReconciliationEngine::new(config, exchange, broadcaster, writer)?
        .with_audit_logger(audit_logger);

    let mut attempt = 0;
    let booted = loop {
        attempt += 1;
        match engine.bootstrap().await {
            Ok(()) => break Ok(()),
            Err(e) if !e.is_fatal() && attempt < BOOTSTRAP_ATTEMPTS => {
                let delay = policy.calculate_delay(attempt);
                warn!(
                    "Bootstrap attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt, BOOTSTRAP_ATTEMPTS, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => break Err(e),
        }
    };

    let result = match booted {
        Ok(()) => engine.run(rx).await,
        Err(e) => Err(e),
    };

    // The engine holds the last writer and broadcaster handles.
    drop(engine);
    feed_handle.abort();
    listener_handle.abort();
    signal_handle.abort();

    if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, writer_handle)
        .await
        .is_err()
    {
        warn!("Snapshot writer did not finish in time");
    }
    if let Some(handle) = dispatcher_handle {
        info!("Waiting for notification dispatcher to shut down...");
        let _ = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, handle).await;
    }

    result.map_err(Into::into)
}

/// Ctrl-C stops the engine, SIGHUP asks it to rebuild from the exchange.
async fn forward_signals(tx: mpsc::Sender<EngineEvent>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("SIGHUP handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                let _ = tx.send(EngineEvent::Shutdown).await;
                return;
            }
        };
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    let _ = tx.send(EngineEvent::Shutdown).await;
                    return;
                }
                _ = hangup.recv() => {
                    info!("Reset requested");
                    if tx.send(EngineEvent::Reset).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
        let _ = tx.send(EngineEvent::Shutdown).await;
    }
}
