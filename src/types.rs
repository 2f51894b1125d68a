//! Core types and data structures shared by the feed, the scheduler and the stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A token or wallet address in its base58 string form.
pub type Pubkey = String;

/// Kind-specific part of a market event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// A new token was launched on the bonding curve
    Creation(CreationDetails),
    Buy,
    Sell,
}

/// Fields only present on token creation events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreationDetails {
    pub name: String,
    pub symbol: String,
    /// Metadata URI (usually IPFS)
    pub uri: Option<String>,
    /// Native amount the creator bought at launch
    pub initial_buy: Option<f64>,
}

/// A decoded creation or trade event from the market feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    /// Transaction signature, unique per trade
    pub signature: String,
    /// The token mint address
    pub mint: Pubkey,
    /// Wallet that created or traded the token
    pub trader_public_key: Pubkey,
    pub bonding_curve_key: Pubkey,
    pub token_amount: Option<f64>,
    pub new_token_balance: Option<f64>,
    /// Virtual token reserve of the bonding curve
    pub v_tokens_in_bonding_curve: f64,
    /// Virtual native-asset (SOL) reserve of the bonding curve
    pub v_sol_in_bonding_curve: f64,
    /// Market cap denominated in the native asset
    pub market_cap_sol: f64,
    pub kind: EventKind,
}

impl MarketEvent {
    pub fn is_creation(&self) -> bool {
        matches!(self.kind, EventKind::Creation(_))
    }

    pub fn is_trade(&self) -> bool {
        matches!(self.kind, EventKind::Buy | EventKind::Sell)
    }

    /// Symbol for log lines; trade events don't carry one.
    pub fn symbol(&self) -> &str {
        match &self.kind {
            EventKind::Creation(details) => &details.symbol,
            _ => "",
        }
    }
}

/// A tracked token as held by the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// The mint address (primary key)
    pub address: Pubkey,
    pub symbol: String,
    pub name: String,
    pub initial_buy: f64,
    pub v_tokens: f64,
    pub v_sol: f64,
    /// Market cap in SOL, refreshed by trade events
    pub market_cap_sol: f64,
    pub created_at: DateTime<Utc>,
    /// Oracle analysis text (formatted when available)
    pub analysis: Option<String>,
    pub analysis_completed: bool,
    pub analysis_timestamp: Option<DateTime<Utc>>,
}

impl Token {
    /// Build the initial token record from a creation event.
    ///
    /// Returns `None` for trade events.
    pub fn from_creation(event: &MarketEvent) -> Option<Self> {
        let EventKind::Creation(details) = &event.kind else {
            return None;
        };

        Some(Self {
            address: event.mint.clone(),
            symbol: details.symbol.clone(),
            name: details.name.clone(),
            initial_buy: details.initial_buy.unwrap_or(0.0),
            v_tokens: event.v_tokens_in_bonding_curve,
            v_sol: event.v_sol_in_bonding_curve,
            market_cap_sol: event.market_cap_sol,
            created_at: Utc::now(),
            analysis: None,
            analysis_completed: false,
            analysis_timestamp: None,
        })
    }
}
