//! Market feed ingestion: wire protocol, dedup window and the streaming client.

pub mod client;
pub mod protocol;
pub mod recent;

pub use client::{flush_latest_trades, FrameOutcome, MarketFeedClient};
pub use protocol::{decode_frame, Frame};
pub use recent::RecentTokenSet;
