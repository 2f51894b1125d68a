//! AnalysisScheduler - admission control and the dispatch loop.
//!
//! Tokens are admitted into the priority queue only above a USD market cap
//! threshold that rises with the backlog. The dispatch loop drains urgent
//! submissions first, then the highest market cap, one oracle request at a
//! time.

use crate::analysis::oracle::{AnalysisOutcome, OracleSession};
use crate::analysis::priority_queue::PriorityTokenQueue;
use crate::config::SchedulerSettings;
use crate::error::AnalysisError;
use crate::services::price::PriceSource;
use crate::services::store::TokenStore;
use crate::types::{Pubkey, Token};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Decision taken by `enqueue_token_for_analysis`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    AlreadyAnalyzed,
    BelowThreshold { usd: f64, threshold: f64 },
    Admitted { usd: f64, threshold: f64 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// USD market cap a token must exceed to be queued, given the backlog.
///
/// Flat at the minimum up to `queue_threshold` entries, then rising linearly
/// to the maximum at twice that length.
pub fn admission_threshold(queue_len: usize, settings: &SchedulerSettings) -> f64 {
    let knee = settings.queue_threshold.max(1) as f64;
    let factor = ((queue_len as f64 - knee) / knee).clamp(0.0, 1.0);
    settings.min_usd_market_cap + (settings.max_usd_market_cap - settings.min_usd_market_cap) * factor
}

/// An address taken for dispatch, tagged with the queue it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Urgent(Pubkey),
    Ranked(Pubkey),
}

impl Candidate {
    pub fn address(&self) -> &str {
        match self {
            Self::Urgent(address) | Self::Ranked(address) => address,
        }
    }
}

pub struct AnalysisScheduler {
    settings: SchedulerSettings,
    queue: PriorityTokenQueue,
    urgent: Mutex<VecDeque<Pubkey>>,
    store: Arc<dyn TokenStore>,
    prices: Arc<dyn PriceSource>,
    session: Arc<OracleSession>,
}

impl AnalysisScheduler {
    pub fn new(
        settings: SchedulerSettings,
        store: Arc<dyn TokenStore>,
        prices: Arc<dyn PriceSource>,
        session: Arc<OracleSession>,
    ) -> Self {
        Self {
            settings,
            queue: PriorityTokenQueue::new(),
            urgent: Mutex::new(VecDeque::new()),
            store,
            prices,
            session,
        }
    }

    /// Queue `token` for analysis if its USD market cap clears the current
    /// threshold. Ranked by SOL market cap.
    #[instrument(skip(self, token), fields(address = %token.address))]
    pub async fn enqueue_token_for_analysis(&self, token: &Token) -> Result<Admission> {
        if token.analysis_completed {
            return Ok(Admission::AlreadyAnalyzed);
        }

        let usd = self
            .prices
            .to_usd(token.market_cap_sol)
            .await
            .context("Failed to convert market cap to USD")?;
        let threshold = admission_threshold(self.queue.len(), &self.settings);

        if usd > threshold {
            self.queue.upsert(&token.address, token.market_cap_sol);
            debug!(
                "Queued {} at ${:.2} (threshold ${:.2}, {} queued)",
                token.symbol,
                usd,
                threshold,
                self.queue.len()
            );
            Ok(Admission::Admitted { usd, threshold })
        } else {
            Ok(Admission::BelowThreshold { usd, threshold })
        }
    }

    /// Force analysis of `address` ahead of every ranked token.
    pub fn submit_urgent_analysis(&self, address: &str) {
        self.urgent.lock().push_back(address.to_string());
        info!(
            "Urgent analysis requested for {} ({} urgent pending)",
            address,
            self.urgent_queued()
        );
    }

    /// Next address to dispatch: urgent FIFO first, then highest market cap.
    pub fn next_candidate(&self) -> Option<Candidate> {
        if let Some(address) = self.urgent.lock().pop_front() {
            return Some(Candidate::Urgent(address));
        }
        self.queue.try_take_highest().map(Candidate::Ranked)
    }

    /// Put back a candidate that never reached the oracle. Urgent ones go
    /// back to the head of their queue; ranked ones are re-ranked by their
    /// stored market cap.
    pub async fn requeue(&self, candidate: Candidate) {
        match candidate {
            Candidate::Urgent(address) => self.urgent.lock().push_front(address),
            Candidate::Ranked(address) => match self.store.get(&address).await {
                Ok(Some(token)) if !token.analysis_completed => {
                    self.queue.upsert(&address, token.market_cap_sol);
                }
                Ok(_) => debug!("Not requeueing {}", address),
                Err(e) => error!("Failed to requeue {}: {:#}", address, e),
            },
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn urgent_queued(&self) -> usize {
        self.urgent.lock().len()
    }

    pub fn session(&self) -> &Arc<OracleSession> {
        &self.session
    }

    /// Run one analysis for `address`.
    ///
    /// `Ok(None)` when the token is unknown or already analyzed.
    pub async fn analyze(&self, address: &str) -> Result<Option<AnalysisOutcome>, AnalysisError> {
        let token = self
            .store
            .get(address)
            .await
            .map_err(AnalysisError::Persistence)?;

        match token {
            None => {
                warn!("Token {} not found in store, skipping", address);
                return Ok(None);
            }
            Some(token) if token.analysis_completed => {
                debug!("Token {} already analyzed, skipping", address);
                return Ok(None);
            }
            Some(_) => {}
        }

        let ticket = self.session.submit(address).await?;
        self.session.await_outcome(ticket).await.map(Some)
    }

    /// Dispatch loop. Runs until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Analysis scheduler started");

        while !cancel.is_cancelled() {
            let Some(candidate) = self.next_candidate() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(self.settings.idle_backoff()) => {}
                }
                continue;
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.analyze(candidate.address()) => result,
            };
            let address = candidate.address();

            match result {
                Ok(Some(outcome)) => {
                    info!("Analysis stored for {}", outcome.address);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.settings.cooldown()) => {}
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_rejection() => warn!("Analysis of {} rejected: {}", address, e),
                Err(AnalysisError::Transport(e)) => {
                    error!(
                        "Oracle unreachable while analyzing {}: {:#}. Backing off for {:?}",
                        address,
                        e,
                        self.settings.cooldown()
                    );
                    self.requeue(candidate).await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.settings.cooldown()) => {}
                    }
                }
                Err(e) => error!("Analysis of {} failed: {}", address, e),
            }
        }

        info!("Analysis scheduler stopped");
    }
}
