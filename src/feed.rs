// Price feed boundary
//
// The upstream feed adapter (exchange websocket, redis relay, replay file) is
// out of process. What arrives here is the normalized trade message; this module
// validates it into a PriceTick and fans it out on a broadcast channel. A tick
// whose price does not parse to a finite positive decimal is dropped without
// touching any state.

use crate::types::{Price, Side, Symbol, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Trade message as published by the feed adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeMessage {
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<u64>,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q", default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    /// Trade time, epoch milliseconds.
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Buyer was the maker, so the aggressor sold.
    #[serde(rename = "m", default)]
    pub is_buyer_maker: bool,
}

/// A single validated price observation for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: Symbol,
    pub price: Price,
    pub timestamp: Timestamp,
    pub aggressor: Side,
}

impl PriceTick {
    pub fn new(symbol: Symbol, price: Price, timestamp: Timestamp) -> Self {
        Self {
            symbol,
            price,
            timestamp,
            aggressor: Side::Buy,
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Malformed trade message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid price '{0}'")]
    InvalidPrice(String),

    #[error("Empty symbol")]
    EmptySymbol,

    #[error("Invalid trade time {0}")]
    InvalidTimestamp(i64),
}

impl TradeMessage {
    pub fn into_tick(self) -> Result<PriceTick, FeedError> {
        let symbol = Symbol::new(&self.symbol);
        if symbol.is_empty() {
            return Err(FeedError::EmptySymbol);
        }
        let price = Price::parse(&self.price).ok_or(FeedError::InvalidPrice(self.price))?;
        if self.trade_time < 0 {
            return Err(FeedError::InvalidTimestamp(self.trade_time));
        }
        let aggressor = if self.is_buyer_maker { Side::Sell } else { Side::Buy };
        Ok(PriceTick {
            symbol,
            price,
            timestamp: Timestamp::from_millis(self.trade_time),
            aggressor,
        })
    }
}

pub fn parse_trade(raw: &str) -> Result<PriceTick, FeedError> {
    let message: TradeMessage = serde_json::from_str(raw)?;
    message.into_tick()
}

/// Broadcast side of the tick stream.
#[derive(Debug, Clone)]
pub struct TickPublisher {
    sender: broadcast::Sender<PriceTick>,
}

impl TickPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PriceTick> {
        self.sender.subscribe()
    }

    /// Returns the number of subscribers that received the tick.
    pub fn publish(&self, tick: PriceTick) -> usize {
        self.sender.send(tick).unwrap_or(0)
    }

    /// Parses a raw feed message and publishes it. Invalid messages are logged
    /// and dropped.
    pub fn publish_raw(&self, raw: &str) -> Option<usize> {
        match parse_trade(raw) {
            Ok(tick) => {
                debug!(symbol = %tick.symbol, price = %tick.price, "tick received");
                Some(self.publish(tick))
            }
            Err(e) => {
                warn!("dropping feed message: {}", e);
                None
            }
        }
    }
}
