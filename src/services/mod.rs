//! Collaborators around the core pipeline: persistence, pricing and the
//! event queue consumers.

pub mod ingest;
pub mod price;
pub mod store;

pub use ingest::{handle_creation, run_creation_consumer, TradeIngest};
pub use price::{FixedPrice, PriceSource, SolPriceService};
pub use store::{MemoryTokenStore, SqliteTokenStore, TokenStore};
