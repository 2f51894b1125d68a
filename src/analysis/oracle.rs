//! Oracle session: one in-flight analysis request and reply correlation.
//!
//! The oracle answers in free text, so replies are classified by fixed
//! phrase markers and matched against the single pending request. Wording
//! changes on the oracle side turn terminal replies into "unrelated" ones;
//! the staleness timeout bounds how long such a request can hold the slot.

use crate::config::OracleSettings;
use crate::error::AnalysisError;
use crate::services::store::TokenStore;
use crate::types::Pubkey;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const PROGRESS_FOUND: &str = "Token found!";
const PROGRESS_SCANNING: &str = "Scanning the token";
const RATE_LIMITED: &str = "You're scanning too fast";
const FAILED_GENERIC: &str = "Something went wrong";
const FAILED_NOT_LISTED: &str = "is not listed on";
const COMPLETED: &str = "Analysis complete!";

/// Outbound side of the oracle connection.
#[async_trait]
pub trait OracleTransport: Send + Sync {
    /// Ask the oracle to analyze `address`. Replies arrive on the reply channel.
    async fn send(&self, address: &str) -> Result<()>;
}

/// One inbound oracle message.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleReply {
    pub text: String,
    /// Rendered variant of `text`, when the bridge provides one
    pub formatted: Option<String>,
}

impl OracleReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            formatted: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Progress,
    RateLimited,
    Failed,
    Completed,
    Unrelated,
}

/// Classify a reply relative to the address currently being analyzed.
pub fn classify_reply(text: &str, address: &str) -> ReplyKind {
    if text.contains(PROGRESS_FOUND) && text.contains(PROGRESS_SCANNING) {
        ReplyKind::Progress
    } else if text.contains(RATE_LIMITED) {
        ReplyKind::RateLimited
    } else if text.contains(FAILED_GENERIC) || text.contains(FAILED_NOT_LISTED) {
        ReplyKind::Failed
    } else if text.contains(COMPLETED) && text.contains(address) {
        ReplyKind::Completed
    } else {
        ReplyKind::Unrelated
    }
}

/// Result of a successful analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub address: Pubkey,
    /// The persisted analysis text
    pub analysis: String,
    pub completed_at: DateTime<Utc>,
}

pub type AnalysisResult = Result<AnalysisOutcome, AnalysisError>;

/// The request the oracle is currently working on.
#[derive(Debug)]
pub struct PendingAnalysisRequest {
    /// Stable for the lifetime of the request, across resubmissions
    pub request_id: u64,
    /// Changes on every resubmission
    pub correlation_id: u64,
    pub address: Pubkey,
    pub submitted_at: Instant,
    retry_scheduled: bool,
    completion: oneshot::Sender<AnalysisResult>,
}

impl PendingAnalysisRequest {
    fn is_stale(&self, stale_after: std::time::Duration) -> bool {
        self.submitted_at.elapsed() >= stale_after
    }

    fn resolve(self, result: AnalysisResult) {
        if self.completion.send(result).is_err() {
            debug!("Nobody awaiting analysis of {}", self.address);
        }
    }
}

/// Handle returned by a successful submission.
#[derive(Debug)]
pub struct AnalysisTicket {
    pub request_id: u64,
    pub address: Pubkey,
    receiver: oneshot::Receiver<AnalysisResult>,
}

enum WatchdogAction {
    Expired,
    WaitUntil(Instant),
    Resolving,
}

/// Owns the oracle transport and the single pending request slot.
pub struct OracleSession {
    transport: Arc<dyn OracleTransport>,
    store: Arc<dyn TokenStore>,
    settings: OracleSettings,
    pending: Mutex<Option<PendingAnalysisRequest>>,
    send_limiter: Option<DefaultDirectRateLimiter>,
}

impl OracleSession {
    pub fn new(
        transport: Arc<dyn OracleTransport>,
        store: Arc<dyn TokenStore>,
        settings: OracleSettings,
    ) -> Self {
        // A zero interval disables send pacing.
        let send_limiter = Quota::with_period(settings.min_send_interval()).map(RateLimiter::direct);

        Self {
            transport,
            store,
            settings,
            pending: Mutex::new(None),
            send_limiter,
        }
    }

    /// Send `address` to the oracle, taking the pending slot.
    ///
    /// Rejected with `AlreadyRunning` when the slot lock is not acquired
    /// within the lock timeout, and with `InFlight` while a younger request
    /// holds the slot. A stale request is resolved with `Stale` and replaced.
    #[instrument(skip(self))]
    pub async fn submit(&self, address: &str) -> Result<AnalysisTicket, AnalysisError> {
        let mut pending = timeout(self.settings.lock_timeout(), self.pending.lock())
            .await
            .map_err(|_| AnalysisError::AlreadyRunning)?;

        if let Some(current) = pending.as_ref() {
            if !current.is_stale(self.settings.stale_after()) {
                return Err(AnalysisError::InFlight(current.address.clone()));
            }
        }
        if let Some(stale) = pending.take() {
            warn!("Discarding stale analysis request for {}", stale.address);
            let address = stale.address.clone();
            stale.resolve(Err(AnalysisError::Stale(address)));
        }

        self.pace_send().await;
        self.transport
            .send(address)
            .await
            .map_err(AnalysisError::Transport)?;

        let (completion, receiver) = oneshot::channel();
        let request_id = rand::random::<u64>();
        let correlation_id = rand::random::<u64>();
        *pending = Some(PendingAnalysisRequest {
            request_id,
            correlation_id,
            address: address.to_string(),
            submitted_at: Instant::now(),
            retry_scheduled: false,
            completion,
        });

        info!(
            "Submitted {} for analysis (correlation {:016x})",
            address, correlation_id
        );
        Ok(AnalysisTicket {
            request_id,
            address: address.to_string(),
            receiver,
        })
    }

    /// Wait for the outcome of a submitted request.
    ///
    /// If no terminal reply arrives within the staleness timeout (measured
    /// from the latest resubmission) the slot is cleared and `Stale` returned.
    pub async fn await_outcome(&self, ticket: AnalysisTicket) -> AnalysisResult {
        let AnalysisTicket {
            request_id,
            address,
            mut receiver,
        } = ticket;
        let stale_after = self.settings.stale_after();
        let mut deadline = Instant::now() + stale_after;

        loop {
            tokio::select! {
                result = &mut receiver => {
                    return result.unwrap_or_else(|_| Err(AnalysisError::Stale(address)));
                }
                _ = sleep_until(deadline) => {}
            }

            let action = {
                let mut pending = self.pending.lock().await;
                match pending.as_ref() {
                    Some(current) if current.request_id == request_id => {
                        let expires = current.submitted_at + stale_after;
                        if expires <= Instant::now() {
                            pending.take();
                            WatchdogAction::Expired
                        } else {
                            WatchdogAction::WaitUntil(expires)
                        }
                    }
                    _ => WatchdogAction::Resolving,
                }
            };

            match action {
                WatchdogAction::Expired => {
                    warn!("No oracle reply for {} within {:?}", address, stale_after);
                    return Err(AnalysisError::Stale(address));
                }
                WatchdogAction::WaitUntil(expires) => deadline = expires,
                // Taken by the reply handler; its result is on the way.
                WatchdogAction::Resolving => {
                    return receiver
                        .await
                        .unwrap_or_else(|_| Err(AnalysisError::Stale(address)));
                }
            }
        }
    }

    /// Address of the pending request, if any.
    pub async fn pending_address(&self) -> Option<Pubkey> {
        self.pending.lock().await.as_ref().map(|p| p.address.clone())
    }

    /// Correlate one oracle reply with the pending request.
    pub async fn handle_reply(self: &Arc<Self>, reply: OracleReply) {
        let mut pending = self.pending.lock().await;
        let Some(current) = pending.as_mut() else {
            debug!("Oracle reply with no pending request: {}", reply.text);
            return;
        };

        match classify_reply(&reply.text, &current.address) {
            ReplyKind::Progress => debug!("Oracle is scanning {}", current.address),
            ReplyKind::Unrelated => debug!("Ignoring unrelated oracle reply"),
            ReplyKind::RateLimited => {
                if current.retry_scheduled {
                    return;
                }
                current.retry_scheduled = true;
                info!(
                    "Oracle rate limited {}, resubmitting in {:?}",
                    current.address,
                    self.settings.retry_delay()
                );
                tokio::spawn(self.clone().resubmit(current.request_id));
            }
            ReplyKind::Failed => {
                if let Some(request) = pending.take() {
                    warn!("Oracle failed to analyze {}: {}", request.address, reply.text);
                    let address = request.address.clone();
                    request.resolve(Err(AnalysisError::OracleFailed {
                        address,
                        reply: reply.text,
                    }));
                }
            }
            ReplyKind::Completed => {
                let Some(request) = pending.take() else {
                    return;
                };
                drop(pending);
                self.complete(request, reply).await;
            }
        }
    }

    async fn complete(&self, request: PendingAnalysisRequest, reply: OracleReply) {
        let analysis = reply.formatted.unwrap_or(reply.text);
        let address = request.address.clone();

        match self.store.update_analysis(&address, &analysis).await {
            Ok(()) => {
                info!("Analysis complete for {}", address);
                request.resolve(Ok(AnalysisOutcome {
                    address,
                    analysis,
                    completed_at: Utc::now(),
                }));
            }
            Err(e) => {
                error!("Failed to persist analysis for {}: {:#}", address, e);
                request.resolve(Err(AnalysisError::Persistence(e)));
            }
        }
    }

    /// Send the pending request again after the retry delay, unless it was
    /// resolved or replaced in the meantime.
    async fn resubmit(self: Arc<Self>, request_id: u64) {
        sleep(self.settings.retry_delay()).await;

        let mut pending = self.pending.lock().await;
        let Some(current) = pending.as_mut().filter(|p| p.request_id == request_id) else {
            debug!("Rate-limited request resolved before resubmission");
            return;
        };

        self.pace_send().await;
        match self.transport.send(&current.address).await {
            Ok(()) => {
                current.correlation_id = rand::random::<u64>();
                current.submitted_at = Instant::now();
                current.retry_scheduled = false;
                info!(
                    "Resubmitted {} for analysis (correlation {:016x})",
                    current.address, current.correlation_id
                );
            }
            Err(e) => {
                if let Some(request) = pending.take() {
                    error!("Failed to resubmit {}: {:#}", request.address, e);
                    request.resolve(Err(AnalysisError::Transport(e)));
                }
            }
        }
    }

    async fn pace_send(&self) {
        if let Some(limiter) = &self.send_limiter {
            limiter.until_ready().await;
        }
    }

    /// Feed replies from the transport into `handle_reply` until cancelled
    /// or the channel closes.
    pub async fn run_reply_listener(
        self: Arc<Self>,
        mut replies: mpsc::UnboundedReceiver<OracleReply>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                reply = replies.recv() => match reply {
                    Some(reply) => self.handle_reply(reply).await,
                    None => {
                        warn!("Oracle reply channel closed");
                        break;
                    }
                },
            }
        }
        info!("Oracle reply listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::MemoryTokenStore;
    use crate::types::Token;
    use std::time::Duration;

    const ADDRESS: &str = "So11111111111111111111111111111111111111112";

    #[derive(Default)]
    struct RecordingTransport {
        sent: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OracleTransport for RecordingTransport {
        async fn send(&self, address: &str) -> Result<()> {
            self.sent.lock().push(address.to_string());
            Ok(())
        }
    }

    fn settings() -> OracleSettings {
        OracleSettings {
            lock_timeout_ms: 100,
            stale_after_secs: 1,
            retry_delay_ms: 50,
            min_send_interval_ms: 0,
            ..OracleSettings::default()
        }
    }

    async fn session() -> (Arc<OracleSession>, Arc<RecordingTransport>, Arc<MemoryTokenStore>) {
        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(MemoryTokenStore::new());
        store
            .save(&Token {
                address: ADDRESS.to_string(),
                symbol: "WSOL".to_string(),
                name: "Wrapped SOL".to_string(),
                initial_buy: 0.0,
                v_tokens: 0.0,
                v_sol: 0.0,
                market_cap_sol: 100.0,
                created_at: Utc::now(),
                analysis: None,
                analysis_completed: false,
                analysis_timestamp: None,
            })
            .await
            .unwrap();

        let session = Arc::new(OracleSession::new(transport.clone(), store.clone(), settings()));
        (session, transport, store)
    }

    #[test]
    fn test_classify_reply() {
        assert_eq!(
            classify_reply("Token found! Scanning the token now", ADDRESS),
            ReplyKind::Progress
        );
        assert_eq!(
            classify_reply("You're scanning too fast, slow down", ADDRESS),
            ReplyKind::RateLimited
        );
        assert_eq!(classify_reply("Something went wrong", ADDRESS), ReplyKind::Failed);
        assert_eq!(
            classify_reply("XYZ is not listed on any DEX", ADDRESS),
            ReplyKind::Failed
        );
        assert_eq!(
            classify_reply(&format!("Analysis complete! {}", ADDRESS), ADDRESS),
            ReplyKind::Completed
        );
        assert_eq!(
            classify_reply("Analysis complete! OtherMint", ADDRESS),
            ReplyKind::Unrelated
        );
        assert_eq!(classify_reply("gm", ADDRESS), ReplyKind::Unrelated);
    }

    #[tokio::test]
    async fn test_completion_persists_formatted_text() {
        let (session, transport, store) = session().await;

        let ticket = session.submit(ADDRESS).await.unwrap();
        assert_eq!(transport.sent.lock().as_slice(), [ADDRESS.to_string()]);

        session
            .handle_reply(OracleReply::text("Token found! Scanning the token..."))
            .await;
        session
            .handle_reply(OracleReply {
                text: format!("Analysis complete! {}", ADDRESS),
                formatted: Some("<b>report</b>".to_string()),
            })
            .await;

        let outcome = session.await_outcome(ticket).await.unwrap();
        assert_eq!(outcome.analysis, "<b>report</b>");

        let token = store.get(ADDRESS).await.unwrap().unwrap();
        assert!(token.analysis_completed);
        assert_eq!(token.analysis.as_deref(), Some("<b>report</b>"));
        assert!(session.pending_address().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_reply_resolves_with_error() {
        let (session, _, _) = session().await;
        let ticket = session.submit(ADDRESS).await.unwrap();

        session
            .handle_reply(OracleReply::text("Something went wrong, try later"))
            .await;

        let result = session.await_outcome(ticket).await;
        assert!(matches!(result, Err(AnalysisError::OracleFailed { .. })));
        assert!(session.pending_address().await.is_none());
    }

    #[tokio::test]
    async fn test_second_submission_rejected_while_in_flight() {
        let (session, _, _) = session().await;
        let _ticket = session.submit(ADDRESS).await.unwrap();

        let result = session.submit("Other1111").await;
        assert!(matches!(result, Err(AnalysisError::InFlight(addr)) if addr == ADDRESS));
    }

    /// Holds every send until released.
    #[derive(Default)]
    struct BlockingTransport {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl OracleTransport for BlockingTransport {
        async fn send(&self, _address: &str) -> Result<()> {
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submission_rejected_while_lock_held() {
        let transport = Arc::new(BlockingTransport::default());
        let session = Arc::new(OracleSession::new(
            transport.clone(),
            Arc::new(MemoryTokenStore::new()),
            settings(),
        ));

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.submit(ADDRESS).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = tokio::time::Instant::now();
        let second = session.submit("Other1111").await;
        assert!(matches!(second, Err(AnalysisError::AlreadyRunning)));
        assert!(started.elapsed() < Duration::from_millis(500));

        transport.release.notify_one();
        let ticket = first.await.unwrap().unwrap();
        assert_eq!(ticket.address, ADDRESS);
    }

    #[tokio::test]
    async fn test_rate_limited_request_resubmitted() {
        let (session, transport, _) = session().await;
        let ticket = session.submit(ADDRESS).await.unwrap();

        session
            .handle_reply(OracleReply::text("You're scanning too fast"))
            .await;
        // A duplicate rate-limit reply must not schedule a second resend
        session
            .handle_reply(OracleReply::text("You're scanning too fast"))
            .await;
        sleep(Duration::from_millis(200)).await;

        assert_eq!(transport.sent.lock().len(), 2);
        assert_eq!(session.pending_address().await.as_deref(), Some(ADDRESS));

        session
            .handle_reply(OracleReply::text(format!("Analysis complete! {}", ADDRESS)))
            .await;
        assert!(session.await_outcome(ticket).await.is_ok());
    }

    #[tokio::test]
    async fn test_reply_without_pending_request_ignored() {
        let (session, _, store) = session().await;
        session
            .handle_reply(OracleReply::text(format!("Analysis complete! {}", ADDRESS)))
            .await;

        assert!(!store.get(ADDRESS).await.unwrap().unwrap().analysis_completed);
    }

    #[tokio::test]
    async fn test_waiter_frees_stale_slot() {
        let (session, _, _) = session().await;
        let ticket = session.submit(ADDRESS).await.unwrap();

        let result = session.await_outcome(ticket).await;
        assert!(matches!(result, Err(AnalysisError::Stale(_))));
        assert!(session.pending_address().await.is_none());
        assert!(session.submit("Other1111").await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_request_replaced_on_submit() {
        let (session, _, _) = session().await;
        let ticket = session.submit(ADDRESS).await.unwrap();
        sleep(Duration::from_millis(1_100)).await;

        let replacement = session.submit("Other1111").await;
        assert!(replacement.is_ok());
        assert!(matches!(
            session.await_outcome(ticket).await,
            Err(AnalysisError::Stale(_))
        ));
    }
}
