//! Typed errors for the places where callers branch on the failure kind.
//!
//! Everything else (stores, price lookups, startup) uses `anyhow`.

use crate::types::Pubkey;
use thiserror::Error;

/// Failures of the market feed connection.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed feed frame: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("feed closed by server")]
    Closed,

    #[error("event queue closed")]
    QueueClosed,
}

/// Failures of a single analysis attempt.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The dispatch lock could not be acquired in time.
    #[error("analysis already running")]
    AlreadyRunning,

    #[error("previous analysis for {0} still in progress")]
    InFlight(Pubkey),

    #[error("oracle reported failure for {address}: {reply}")]
    OracleFailed { address: Pubkey, reply: String },

    #[error("no reply for {0} before the staleness timeout")]
    Stale(Pubkey),

    #[error("oracle transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("failed to persist analysis: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl AnalysisError {
    /// Whether the call was rejected without reaching the oracle.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::AlreadyRunning | Self::InFlight(_))
    }
}
