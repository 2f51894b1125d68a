//! SOL to USD conversion.

use crate::config::PriceSettings;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio_retry::{strategy::ExponentialBackoff, Retry};
use tracing::{debug, instrument, warn};

const SOL_PRICE_KEY: &str = "SOL";
const FETCH_ATTEMPTS: usize = 3;

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Convert an amount of SOL to USD.
    async fn to_usd(&self, sol_amount: f64) -> Result<f64>;
}

/// Constant SOL price, for tests and offline runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedPrice(pub f64);

#[async_trait]
impl PriceSource for FixedPrice {
    async fn to_usd(&self, sol_amount: f64) -> Result<f64> {
        Ok(sol_amount * self.0)
    }
}

#[derive(Debug, Deserialize)]
struct SimplePriceResponse {
    solana: UsdQuote,
}

#[derive(Debug, Deserialize)]
struct UsdQuote {
    usd: f64,
}

/// SOL price from CoinGecko, cached for a fixed TTL.
///
/// When a fetch fails the last known price is used, and before any
/// successful fetch the configured fallback price.
pub struct SolPriceService {
    http_client: Client,
    settings: PriceSettings,
    cache: Cache<&'static str, f64>,
    last_known: Mutex<Option<f64>>,
}

impl SolPriceService {
    pub fn new(settings: PriceSettings) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let cache = Cache::builder()
            .max_capacity(1)
            .time_to_live(Duration::from_secs(settings.cache_ttl_secs))
            .build();

        Ok(Self {
            http_client,
            settings,
            cache,
            last_known: Mutex::new(None),
        })
    }

    /// Current SOL price in USD. Never fails.
    pub async fn sol_price(&self) -> f64 {
        if let Some(price) = self.cache.get(SOL_PRICE_KEY).await {
            return price;
        }

        match self.fetch_with_retries().await {
            Ok(price) => {
                self.cache.insert(SOL_PRICE_KEY, price).await;
                *self.last_known.lock() = Some(price);
                debug!("SOL price refreshed: ${:.2}", price);
                price
            }
            Err(e) => {
                let fallback = self.last_known.lock().unwrap_or(self.settings.fallback_usd);
                warn!("Failed to fetch SOL price: {}. Using ${:.2}", e, fallback);
                fallback
            }
        }
    }

    async fn fetch_with_retries(&self) -> Result<f64> {
        let retry_strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .take(FETCH_ATTEMPTS - 1);

        Retry::spawn(retry_strategy, || self.fetch_price()).await
    }

    #[instrument(skip(self), fields(endpoint = %self.settings.endpoint))]
    async fn fetch_price(&self) -> Result<f64> {
        let response = self
            .http_client
            .get(&self.settings.endpoint)
            .send()
            .await
            .context("Failed to request SOL price")?;

        if !response.status().is_success() {
            return Err(anyhow!("Price endpoint returned {}", response.status()));
        }

        let body: SimplePriceResponse = response
            .json()
            .await
            .context("Failed to parse SOL price")?;

        if !body.solana.usd.is_finite() || body.solana.usd <= 0.0 {
            return Err(anyhow!("Implausible SOL price {}", body.solana.usd));
        }
        Ok(body.solana.usd)
    }
}

#[async_trait]
impl PriceSource for SolPriceService {
    async fn to_usd(&self, sol_amount: f64) -> Result<f64> {
        Ok(sol_amount * self.sol_price().await)
    }
}
