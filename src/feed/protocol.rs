//! Wire format of the market feed.
//!
//! Control frames are `{"method": ..., "keys": [...]}`. Data frames are
//! camelCase JSON objects; anything carrying a `message` field is a
//! subscription acknowledgement.

use crate::error::FeedError;
use crate::types::{CreationDetails, EventKind, MarketEvent, Pubkey};
use serde::de::Error as _;
use serde::{Deserialize, Serialize};

pub const SUBSCRIBE_NEW_TOKEN: &str = "subscribeNewToken";
pub const SUBSCRIBE_TOKEN_TRADE: &str = "subscribeTokenTrade";

#[derive(Debug, Serialize)]
struct ControlFrame<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    keys: Option<&'a [Pubkey]>,
}

/// Control frame asking for new-token notifications.
pub fn subscribe_new_token() -> String {
    encode_control(SUBSCRIBE_NEW_TOKEN, None)
}

/// Control frame asking for trades of the given mints.
pub fn subscribe_token_trade(mints: &[Pubkey]) -> String {
    encode_control(SUBSCRIBE_TOKEN_TRADE, Some(mints))
}

fn encode_control(method: &str, keys: Option<&[Pubkey]>) -> String {
    // A struct of a &str and a string slice always serializes.
    serde_json::to_string(&ControlFrame { method, keys }).unwrap_or_default()
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Subscription acknowledgement with the server's message
    Ack(String),
    Event(MarketEvent),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    signature: String,
    mint: Pubkey,
    trader_public_key: Pubkey,
    tx_type: String,
    #[serde(default)]
    bonding_curve_key: Pubkey,
    token_amount: Option<f64>,
    new_token_balance: Option<f64>,
    initial_buy: Option<f64>,
    #[serde(default)]
    v_tokens_in_bonding_curve: f64,
    #[serde(default)]
    v_sol_in_bonding_curve: f64,
    #[serde(default)]
    market_cap_sol: f64,
    name: Option<String>,
    symbol: Option<String>,
    uri: Option<String>,
}

/// Decode one text frame.
pub fn decode_frame(text: &str) -> Result<Frame, FeedError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    if let Some(message) = value.get("message") {
        let message = message
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| message.to_string());
        return Ok(Frame::Ack(message));
    }

    let wire: WireEvent = serde_json::from_value(value)?;
    Ok(Frame::Event(wire.into_event()?))
}

impl WireEvent {
    fn into_event(self) -> Result<MarketEvent, FeedError> {
        let kind = match self.tx_type.to_ascii_lowercase().as_str() {
            "create" => EventKind::Creation(CreationDetails {
                name: self.name.unwrap_or_default(),
                symbol: self.symbol.unwrap_or_default(),
                uri: self.uri,
                initial_buy: self.initial_buy,
            }),
            "buy" => EventKind::Buy,
            "sell" => EventKind::Sell,
            other => {
                return Err(FeedError::Parse(serde_json::Error::custom(format!(
                    "unknown txType '{}'",
                    other
                ))))
            }
        };

        Ok(MarketEvent {
            signature: self.signature,
            mint: self.mint,
            trader_public_key: self.trader_public_key,
            bonding_curve_key: self.bonding_curve_key,
            token_amount: self.token_amount,
            new_token_balance: self.new_token_balance,
            v_tokens_in_bonding_curve: self.v_tokens_in_bonding_curve,
            v_sol_in_bonding_curve: self.v_sol_in_bonding_curve,
            market_cap_sol: self.market_cap_sol,
            kind,
        })
    }
}
