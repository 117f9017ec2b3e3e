//! Position (order) records and their pnl math.
//!
//! A position is opened once with a fixed quantity, transitions exactly once
//! from `Active` to a terminal status and is never deleted, so the table doubles
//! as the order history.

use crate::types::{Leverage, OrderId, Price, Quote, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Decimal arithmetic left the representable range. Prices off the wire are
/// only checked for being finite and positive, so sizing and pnl are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0} overflowed")]
pub struct ArithmeticOverflow(pub &'static str);

/// Why a position left the `Active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    Liquidated,
    Expired,
    ManuallyClosed,
}

impl CloseReason {
    pub const ALL: [CloseReason; 5] = [
        CloseReason::TakeProfit,
        CloseReason::StopLoss,
        CloseReason::Liquidated,
        CloseReason::Expired,
        CloseReason::ManuallyClosed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::Liquidated => "liquidated",
            CloseReason::Expired => "expired",
            CloseReason::ManuallyClosed => "manually_closed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Active,
    TakeProfit,
    StopLoss,
    Liquidated,
    Expired,
    ManuallyClosed,
}

impl PositionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, PositionStatus::Active)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            PositionStatus::Active => None,
            PositionStatus::TakeProfit => Some(CloseReason::TakeProfit),
            PositionStatus::StopLoss => Some(CloseReason::StopLoss),
            PositionStatus::Liquidated => Some(CloseReason::Liquidated),
            PositionStatus::Expired => Some(CloseReason::Expired),
            PositionStatus::ManuallyClosed => Some(CloseReason::ManuallyClosed),
        }
    }

    /// Storage representation, shared with the order-history API.
    pub fn as_str(&self) -> &'static str {
        match self.close_reason() {
            None => "active",
            Some(reason) => reason.as_str(),
        }
    }
}

impl From<CloseReason> for PositionStatus {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::TakeProfit => PositionStatus::TakeProfit,
            CloseReason::StopLoss => PositionStatus::StopLoss,
            CloseReason::Liquidated => PositionStatus::Liquidated,
            CloseReason::Expired => PositionStatus::Expired,
            CloseReason::ManuallyClosed => PositionStatus::ManuallyClosed,
        }
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "active" {
            return Ok(PositionStatus::Active);
        }
        CloseReason::ALL
            .iter()
            .find(|reason| reason.as_str() == s)
            .map(|reason| PositionStatus::from(*reason))
            .ok_or_else(|| format!("unknown position status '{s}'"))
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: OrderId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Price,
    /// `(margin * leverage) / entry_price`, fixed at creation.
    pub quantity: Decimal,
    pub margin: Quote,
    pub leverage: Leverage,
    pub take_profit_price: Option<Price>,
    pub stop_loss_price: Option<Price>,
    pub expiry: Option<Timestamp>,
    pub status: PositionStatus,
    pub exit_price: Option<Price>,
    pub pnl: Option<Quote>,
    pub created_at: Timestamp,
}

impl Position {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn unrealized_pnl(&self, price: Price) -> Result<Quote, ArithmeticOverflow> {
        calculate_pnl(self.side, self.entry_price, self.quantity, price)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    /// Moves an `Active` position to its terminal state. Returns `false` and
    /// leaves the record untouched when it is already closed.
    pub fn apply_close(&mut self, reason: CloseReason, exit_price: Price, pnl: Quote) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = reason.into();
        self.exit_price = Some(exit_price);
        self.pnl = Some(pnl);
        true
    }
}

/// Everything the store needs to open a position. Quantity is derived, never supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPosition {
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Price,
    pub margin: Quote,
    pub leverage: Leverage,
    pub take_profit_price: Option<Price>,
    pub stop_loss_price: Option<Price>,
    pub expiry: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl NewPosition {
    pub fn quantity(&self) -> Result<Decimal, ArithmeticOverflow> {
        calculate_quantity(self.margin, self.leverage, self.entry_price)
    }

    pub fn into_position(self, id: OrderId) -> Result<Position, ArithmeticOverflow> {
        let quantity = self.quantity()?;
        Ok(Position {
            id,
            user_id: self.user_id,
            symbol: self.symbol,
            side: self.side,
            entry_price: self.entry_price,
            quantity,
            margin: self.margin,
            leverage: self.leverage,
            take_profit_price: self.take_profit_price,
            stop_loss_price: self.stop_loss_price,
            expiry: self.expiry,
            status: PositionStatus::Active,
            exit_price: None,
            pnl: None,
            created_at: self.created_at,
        })
    }
}

pub fn calculate_quantity(margin: Quote, leverage: Leverage, entry_price: Price) -> Result<Decimal, ArithmeticOverflow> {
    margin
        .value()
        .checked_mul(leverage.value())
        .and_then(|notional| notional.checked_div(entry_price.value()))
        .ok_or(ArithmeticOverflow("quantity"))
}

// Buy: (price - entry) * qty. Sell: (entry - price) * qty.
pub fn calculate_pnl(side: Side, entry_price: Price, quantity: Decimal, price: Price) -> Result<Quote, ArithmeticOverflow> {
    let diff = match side {
        Side::Buy => price.value().checked_sub(entry_price.value()),
        Side::Sell => entry_price.value().checked_sub(price.value()),
    };
    diff.and_then(|d| d.checked_mul(quantity))
        .map(Quote::new)
        .ok_or(ArithmeticOverflow("pnl"))
}
