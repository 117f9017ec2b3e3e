//! Position store: the durable record of users, balances and orders.
//!
//! The risk engine relies on two atomic contracts from any backend:
//! - `create_position` checks the balance, debits the margin and inserts the
//!   position as one unit, or changes nothing.
//! - `conditional_close` moves a position out of `Active` only if it is still
//!   `Active`, and reports whether this call performed the transition. That
//!   return value is the sole authorization to credit the balance.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{create_pool_and_migrate, PgPositionStore};

use crate::position::{ArithmeticOverflow, CloseReason, NewPosition, Position};
use crate::types::{OrderId, Price, Quote, Symbol, Timestamp, UserId};
use async_trait::async_trait;
use thiserror::Error;

/// Which of a user's positions to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionQuery {
    /// Open positions, newest first.
    Active,
    /// Closed positions, newest first, at most `limit`.
    History { limit: usize },
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn create_user(&self, initial_balance: Quote) -> Result<UserId, StoreError>;

    async fn balance(&self, user_id: UserId) -> Result<Quote, StoreError>;

    /// Check balance, debit margin and insert, atomically.
    async fn create_position(&self, new: NewPosition) -> Result<Position, StoreError>;

    async fn position(&self, id: OrderId) -> Result<Option<Position>, StoreError>;

    /// Snapshot of every `Active` position on `symbol`.
    async fn active_positions(&self, symbol: &Symbol) -> Result<Vec<Position>, StoreError>;

    /// `Active` positions with `expiry <= now`, optionally limited to one symbol.
    async fn expired_positions(
        &self,
        symbol: Option<&Symbol>,
        now: Timestamp,
    ) -> Result<Vec<Position>, StoreError>;

    /// `UPDATE .. SET status, exit_price, pnl WHERE id = .. AND status = 'active'`.
    /// `Ok(true)` iff exactly this call moved the row.
    async fn conditional_close(
        &self,
        id: OrderId,
        reason: CloseReason,
        exit_price: Price,
        pnl: Quote,
    ) -> Result<bool, StoreError>;

    /// Not idempotent. Callers retry until it succeeds.
    async fn credit_balance(&self, user_id: UserId, amount: Quote) -> Result<(), StoreError>;

    async fn user_positions(
        &self,
        user_id: UserId,
        query: PositionQuery,
    ) -> Result<Vec<Position>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Quote, available: Quote },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Overflow(#[from] ArithmeticOverflow),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
