//! pumpwatch - pump.fun token feed ingestion and oracle analysis scheduling
//!
//! Streams token creations and trades from PumpPortal, keeps token records
//! up to date, and sends the most valuable candidates to an analysis oracle
//! one at a time.

pub mod analysis;
pub mod config;
pub mod error;
pub mod feed;
pub mod queues;
pub mod services;
pub mod types;

// Re-export main types for convenience
pub use config::AppConfig;
pub use error::{AnalysisError, FeedError};
pub use types::{EventKind, MarketEvent, Pubkey, Token};
