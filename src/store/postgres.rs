//! Postgres-backed store. The conditional close is a single guarded `UPDATE`,
//! and position creation runs the debit and insert in one transaction.

use super::{PositionQuery, PositionStore, StoreError};
use crate::config::StoreConfig;
use crate::position::{CloseReason, NewPosition, Position, PositionStatus};
use crate::types::{Leverage, OrderId, Price, Quote, Side, Symbol, Timestamp, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

const POSITION_COLUMNS: &str = "id, user_id, symbol, side, entry_price, quantity, margin, leverage, \
     take_profit_price, stop_loss_price, expiry, status, exit_price, pnl, created_at";

/// Create a pool and run embedded migrations.
pub async fn create_pool_and_migrate(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

#[derive(Debug, FromRow)]
struct PositionRow {
    id: i64,
    user_id: i64,
    symbol: String,
    side: String,
    entry_price: Decimal,
    quantity: Decimal,
    margin: Decimal,
    leverage: Decimal,
    take_profit_price: Option<Decimal>,
    stop_loss_price: Option<Decimal>,
    expiry: Option<DateTime<Utc>>,
    status: String,
    exit_price: Option<Decimal>,
    pnl: Option<Decimal>,
    created_at: DateTime<Utc>,
}

fn price_column(value: Decimal, column: &str, id: i64) -> Result<Price, StoreError> {
    Price::new(value).ok_or_else(|| StoreError::Corrupt(format!("order {id}: non-positive {column}")))
}

fn to_db_id(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("id {value} out of range")))
}

// LIMIT takes a BIGINT; anything past it means no limit
fn to_db_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn to_datetime(ts: Timestamp) -> Result<DateTime<Utc>, StoreError> {
    ts.to_datetime()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} out of range", ts.as_millis())))
}

impl TryFrom<PositionRow> for Position {
    type Error = StoreError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let side: Side = row.side.parse().map_err(StoreError::Corrupt)?;
        let status: PositionStatus = row.status.parse().map_err(StoreError::Corrupt)?;
        let leverage = Leverage::new(row.leverage)
            .ok_or_else(|| StoreError::Corrupt(format!("order {id}: non-positive leverage")))?;
        Ok(Position {
            id: OrderId(id as u64),
            user_id: UserId(row.user_id as u64),
            symbol: Symbol::new(&row.symbol),
            side,
            entry_price: price_column(row.entry_price, "entry_price", id)?,
            quantity: row.quantity,
            margin: Quote::new(row.margin),
            leverage,
            take_profit_price: row
                .take_profit_price
                .map(|v| price_column(v, "take_profit_price", id))
                .transpose()?,
            stop_loss_price: row
                .stop_loss_price
                .map(|v| price_column(v, "stop_loss_price", id))
                .transpose()?,
            expiry: row.expiry.map(|dt| Timestamp::from_millis(dt.timestamp_millis())),
            status,
            exit_price: row
                .exit_price
                .map(|v| price_column(v, "exit_price", id))
                .transpose()?,
            pnl: row.pnl.map(Quote::new),
            created_at: Timestamp::from_millis(row.created_at.timestamp_millis()),
        })
    }
}

fn rows_to_positions(rows: Vec<PositionRow>) -> Result<Vec<Position>, StoreError> {
    rows.into_iter().map(Position::try_from).collect()
}

#[derive(Debug, Clone)]
pub struct PgPositionStore {
    pool: PgPool,
}

impl PgPositionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the `[store]` section and bring the schema up to date.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Unavailable("store.database_url is not set".to_string()))?;
        let pool = create_pool_and_migrate(url, config.max_connections).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn create_user(&self, initial_balance: Quote) -> Result<UserId, StoreError> {
        let (id,): (i64,) = sqlx::query_as("INSERT INTO users (balance) VALUES ($1) RETURNING id")
            .bind(initial_balance.value())
            .fetch_one(&self.pool)
            .await?;
        Ok(UserId(id as u64))
    }

    async fn balance(&self, user_id: UserId) -> Result<Quote, StoreError> {
        let row: Option<(Decimal,)> = sqlx::query_as("SELECT balance FROM users WHERE id = $1")
            .bind(to_db_id(user_id.0)?)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(balance,)| Quote::new(balance))
            .ok_or(StoreError::UserNotFound(user_id))
    }

    async fn create_position(&self, new: NewPosition) -> Result<Position, StoreError> {
        let user_db_id = to_db_id(new.user_id.0)?;
        let quantity = new.quantity()?;
        let mut tx = self.pool.begin().await?;

        let debited = sqlx::query("UPDATE users SET balance = balance - $1 WHERE id = $2 AND balance >= $1")
            .bind(new.margin.value())
            .bind(user_db_id)
            .execute(&mut *tx)
            .await?;

        if debited.rows_affected() != 1 {
            let current: Option<(Decimal,)> = sqlx::query_as("SELECT balance FROM users WHERE id = $1")
                .bind(user_db_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Err(match current {
                None => StoreError::UserNotFound(new.user_id),
                Some((available,)) => StoreError::InsufficientBalance {
                    requested: new.margin,
                    available: Quote::new(available),
                },
            });
        }

        let sql = format!(
            "INSERT INTO positions (user_id, symbol, side, entry_price, quantity, margin, leverage, \
             take_profit_price, stop_loss_price, expiry, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'active', $11) RETURNING {POSITION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(user_db_id)
            .bind(new.symbol.as_str())
            .bind(new.side.as_str())
            .bind(new.entry_price.value())
            .bind(quantity)
            .bind(new.margin.value())
            .bind(new.leverage.value())
            .bind(new.take_profit_price.map(|p| p.value()))
            .bind(new.stop_loss_price.map(|p| p.value()))
            .bind(new.expiry.map(to_datetime).transpose()?)
            .bind(to_datetime(new.created_at)?)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Position::try_from(row)
    }

    async fn position(&self, id: OrderId) -> Result<Option<Position>, StoreError> {
        let sql = format!("SELECT {POSITION_COLUMNS} FROM positions WHERE id = $1");
        let row = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(to_db_id(id.0)?)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Position::try_from).transpose()
    }

    async fn active_positions(&self, symbol: &Symbol) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE symbol = $1 AND status = 'active' ORDER BY id"
        );
        let rows = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(symbol.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows_to_positions(rows)
    }

    async fn expired_positions(
        &self,
        symbol: Option<&Symbol>,
        now: Timestamp,
    ) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions \
             WHERE status = 'active' AND expiry IS NOT NULL AND expiry <= $1 \
             AND ($2::TEXT IS NULL OR symbol = $2) ORDER BY id"
        );
        let rows = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(to_datetime(now)?)
            .bind(symbol.map(|s| s.as_str().to_string()))
            .fetch_all(&self.pool)
            .await?;
        rows_to_positions(rows)
    }

    async fn conditional_close(
        &self,
        id: OrderId,
        reason: CloseReason,
        exit_price: Price,
        pnl: Quote,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE positions SET status = $1, exit_price = $2, pnl = $3 \
             WHERE id = $4 AND status = 'active'",
        )
        .bind(reason.as_str())
        .bind(exit_price.value())
        .bind(pnl.value())
        .bind(to_db_id(id.0)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn credit_balance(&self, user_id: UserId, amount: Quote) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET balance = balance + $1 WHERE id = $2")
            .bind(amount.value())
            .bind(to_db_id(user_id.0)?)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound(user_id));
        }
        Ok(())
    }

    async fn user_positions(
        &self,
        user_id: UserId,
        query: PositionQuery,
    ) -> Result<Vec<Position>, StoreError> {
        let user_db_id = to_db_id(user_id.0)?;
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
            .bind(user_db_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(StoreError::UserNotFound(user_id));
        }
        let rows = match query {
            PositionQuery::Active => {
                let sql = format!(
                    "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = $1 AND status = 'active' \
                     ORDER BY created_at DESC, id DESC"
                );
                sqlx::query_as::<_, PositionRow>(&sql)
                    .bind(user_db_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            PositionQuery::History { limit } => {
                let sql = format!(
                    "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = $1 AND status <> 'active' \
                     ORDER BY created_at DESC, id DESC LIMIT $2"
                );
                sqlx::query_as::<_, PositionRow>(&sql)
                    .bind(user_db_id)
                    .bind(to_db_limit(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows_to_positions(rows)
    }
}
