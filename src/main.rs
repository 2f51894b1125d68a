//! pumpwatch daemon
//!
//! Wires the feed client, the event consumers, the analysis scheduler, the
//! oracle reply listener and the urgent gateway, then runs until Ctrl-C.

use anyhow::{Context, Result};
use pumpwatch::analysis::{AnalysisScheduler, OracleSession, UrgentGateway, WsOracleTransport};
use pumpwatch::config::{AppConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use pumpwatch::feed::MarketFeedClient;
use pumpwatch::queues::EventQueues;
use pumpwatch::services::{
    run_creation_consumer, PriceSource, SolPriceService, SqliteTokenStore, TokenStore, TradeIngest,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load_or_default(config_path())?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting pumpwatch");

    let store: Arc<dyn TokenStore> = Arc::new(
        SqliteTokenStore::connect(&config.database.url, config.database.max_connections).await?,
    );
    let prices: Arc<dyn PriceSource> = Arc::new(SolPriceService::new(config.price.clone())?);

    let (transport, replies) = WsOracleTransport::connect(
        &config.oracle.bridge_url,
        config.oracle.reconnect_delay(),
    )
    .await
    .context("Oracle session is required to run")?;
    let session = Arc::new(OracleSession::new(
        Arc::new(transport),
        store.clone(),
        config.oracle.clone(),
    ));

    let scheduler = Arc::new(AnalysisScheduler::new(
        config.scheduler.clone(),
        store.clone(),
        prices,
        session.clone(),
    ));
    let gateway = UrgentGateway::bind(&config.gateway, scheduler.clone())?;

    let queues = EventQueues::new();
    let feed = MarketFeedClient::new(config.feed.clone(), queues.publisher());
    let trades = TradeIngest::new(store.clone(), scheduler.clone());

    let cancel = CancellationToken::new();
    let tasks = vec![
        tokio::spawn(session.run_reply_listener(replies, cancel.clone())),
        tokio::spawn(scheduler.run(cancel.clone())),
        tokio::spawn(gateway.run(cancel.clone())),
        tokio::spawn(run_creation_consumer(
            queues.creations.reader(),
            store,
            cancel.clone(),
        )),
        tokio::spawn(trades.run(queues.trades.reader(), cancel.clone())),
        tokio::spawn(feed.run(cancel.clone())),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();
    queues.close();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Task failed during shutdown: {}", e);
        }
    }

    info!("pumpwatch stopped");
    Ok(())
}
