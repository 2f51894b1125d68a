//! Event queue consumers: persist new tokens and feed trades into admission.

use crate::analysis::scheduler::{Admission, AnalysisScheduler};
use crate::queues::EventReader;
use crate::services::store::TokenStore;
use crate::types::{MarketEvent, Token};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::{strategy::FixedInterval, Retry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

const MARKET_CAP_RETRIES: usize = 2;
const MARKET_CAP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Save every creation event as a new token.
pub async fn run_creation_consumer(
    reader: EventReader,
    store: Arc<dyn TokenStore>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = reader.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if let Err(e) = handle_creation(store.as_ref(), &event).await {
            error!("Failed to store new token {}: {:#}", event.mint, e);
        }
    }
    info!("Creation consumer stopped");
}

pub async fn handle_creation(store: &dyn TokenStore, event: &MarketEvent) -> Result<()> {
    let token = Token::from_creation(event)
        .ok_or_else(|| anyhow!("{} is not a creation event", event.signature))?;
    store.save(&token).await?;
    debug!("Stored new token {} ({})", token.symbol, token.address);
    Ok(())
}

/// Applies coalesced trades to stored tokens and offers them for analysis.
pub struct TradeIngest {
    store: Arc<dyn TokenStore>,
    scheduler: Arc<AnalysisScheduler>,
    retry_interval: Duration,
    retries: usize,
}

impl TradeIngest {
    pub fn new(store: Arc<dyn TokenStore>, scheduler: Arc<AnalysisScheduler>) -> Self {
        Self {
            store,
            scheduler,
            retry_interval: MARKET_CAP_RETRY_INTERVAL,
            retries: MARKET_CAP_RETRIES,
        }
    }

    /// Override how long to wait for a lagging creation to be stored.
    pub fn with_retry(mut self, interval: Duration, retries: usize) -> Self {
        self.retry_interval = interval;
        self.retries = retries;
        self
    }

    /// Update the market cap of the traded token, then try to admit it.
    #[instrument(skip(self, event), fields(mint = %event.mint))]
    pub async fn handle_trade(&self, event: &MarketEvent) -> Result<Admission> {
        let strategy = FixedInterval::new(self.retry_interval).take(self.retries);
        // Creation persistence may lag behind the first trades
        let token = Retry::spawn(strategy, || async {
            match self
                .store
                .update_market_cap(&event.mint, event.market_cap_sol)
                .await
            {
                Ok(Some(token)) => Ok(token),
                Ok(None) => Err(anyhow!("token {} not stored yet", event.mint)),
                Err(e) => Err(e),
            }
        })
        .await?;

        self.scheduler.enqueue_token_for_analysis(&token).await
    }

    pub async fn run(self, reader: EventReader, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = reader.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match self.handle_trade(&event).await {
                Ok(Admission::Admitted { usd, threshold }) => {
                    debug!("{} admitted at ${:.2} > ${:.2}", event.mint, usd, threshold)
                }
                Ok(_) => {}
                Err(e) => error!("Failed to process trade for {}: {:#}", event.mint, e),
            }
        }
        info!("Trade consumer stopped");
    }
}
