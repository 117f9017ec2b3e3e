//! Order gateway: the client-facing surface in front of the store.
//!
//! Places and manually closes orders, lists a user's active orders and history,
//! reports balances and signs users up. It reads the latest-price cache but
//! never writes it. Manual closes go through the same conditional close and
//! settlement path as tick-driven closes.

use crate::clock::Clock;
use crate::events::{EventBus, EventPayload, PositionOpenedEvent};
use crate::position::{ArithmeticOverflow, CloseReason, NewPosition, Position};
use crate::price_cache::PriceReader;
use crate::risk::{protective_levels, validate_protective_levels, CloseDecision};
use crate::settlement::{CloseOutcome, SettlementUpdater};
use crate::store::{PositionQuery, PositionStore, StoreError};
use crate::types::{Bps, Leverage, OrderId, Price, Quote, Side, Symbol, UserId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Entry price skew against the trader: buys fill above the reference, sells below.
    pub spread_bps: i32,
    pub initial_balance: Decimal,
    pub max_leverage: Decimal,
    pub history_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            spread_bps: 5,
            initial_balance: dec!(10000),
            max_leverage: dec!(100),
            history_limit: 50,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Quote, available: Quote },

    #[error("No market price for {0}")]
    NoMarketPrice(Symbol),

    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Order {0} not found")]
    OrderNotFound(OrderId),

    #[error("Order {0} is already closed")]
    AlreadyClosed(OrderId),

    #[error("Cannot price order: {0}")]
    Overflow(#[from] ArithmeticOverflow),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InsufficientBalance { requested, available } => {
                GatewayError::InsufficientBalance { requested, available }
            }
            StoreError::UserNotFound(id) => GatewayError::UserNotFound(id),
            StoreError::Overflow(e) => GatewayError::Overflow(e),
            other => GatewayError::Store(other),
        }
    }
}

/// Order placement request as received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub margin: Decimal,
    pub leverage: Decimal,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    /// Derive TP/SL this fraction away from entry when explicit prices are absent.
    #[serde(default)]
    pub protection_pct: Option<Decimal>,
    #[serde(default)]
    pub hold_secs: Option<u64>,
}

impl PlaceOrderRequest {
    pub fn new(symbol: &str, side: Side, margin: Decimal, leverage: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            margin,
            leverage,
            take_profit: None,
            stop_loss: None,
            protection_pct: None,
            hold_secs: None,
        }
    }

    pub fn with_take_profit(mut self, price: Decimal) -> Self {
        self.take_profit = Some(price);
        self
    }

    pub fn with_stop_loss(mut self, price: Decimal) -> Self {
        self.stop_loss = Some(price);
        self
    }

    pub fn with_protection_pct(mut self, pct: Decimal) -> Self {
        self.protection_pct = Some(pct);
        self
    }

    pub fn with_hold_secs(mut self, secs: u64) -> Self {
        self.hold_secs = Some(secs);
        self
    }
}

/// A request that passed field validation. Prices are not known yet.
#[derive(Debug, Clone)]
struct ValidatedOrder {
    symbol: Symbol,
    side: Side,
    margin: Quote,
    leverage: Leverage,
    take_profit: Option<Price>,
    stop_loss: Option<Price>,
    protection_pct: Option<Decimal>,
    hold_secs: Option<u64>,
}

fn invalid(msg: impl Into<String>) -> GatewayError {
    GatewayError::InvalidInput(msg.into())
}

fn optional_price(value: Option<Decimal>, field: &str) -> Result<Option<Price>, GatewayError> {
    value
        .map(|v| Price::new(v).ok_or_else(|| invalid(format!("{field} must be positive"))))
        .transpose()
}

impl PlaceOrderRequest {
    fn validate(&self, config: &GatewayConfig) -> Result<ValidatedOrder, GatewayError> {
        let symbol = Symbol::new(&self.symbol);
        if symbol.is_empty() {
            return Err(invalid("symbol is required"));
        }
        if self.margin <= Decimal::ZERO {
            return Err(invalid("margin must be positive"));
        }
        let leverage = Leverage::new(self.leverage).ok_or_else(|| invalid("leverage must be positive"))?;
        if leverage.value() > config.max_leverage {
            return Err(invalid(format!(
                "leverage {} exceeds maximum {}",
                leverage.value(),
                config.max_leverage
            )));
        }
        if let Some(pct) = self.protection_pct {
            if pct <= Decimal::ZERO || pct >= Decimal::ONE {
                return Err(invalid("protection_pct must be between 0 and 1"));
            }
        }
        if self.hold_secs == Some(0) {
            return Err(invalid("hold_secs must be positive"));
        }
        Ok(ValidatedOrder {
            symbol,
            side: self.side,
            margin: Quote::new(self.margin),
            leverage,
            take_profit: optional_price(self.take_profit, "take_profit")?,
            stop_loss: optional_price(self.stop_loss, "stop_loss")?,
            protection_pct: self.protection_pct,
            hold_secs: self.hold_secs,
        })
    }
}

/// Reference price skewed against the trader by `spread`.
pub fn entry_price(side: Side, reference: Price, spread: Bps) -> Result<Price, ArithmeticOverflow> {
    let skew = spread.as_fraction();
    let factor = match side {
        Side::Buy => Decimal::ONE.checked_add(skew),
        Side::Sell => Decimal::ONE.checked_sub(skew),
    };
    let value = factor
        .and_then(|f| reference.value().checked_mul(f))
        .ok_or(ArithmeticOverflow("entry price"))?;
    Ok(Price::new(value).unwrap_or(reference))
}

#[derive(Clone)]
pub struct OrderGateway {
    store: Arc<dyn PositionStore>,
    prices: PriceReader,
    settlement: SettlementUpdater,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: GatewayConfig,
}

impl OrderGateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn PositionStore>,
        prices: PriceReader,
        settlement: SettlementUpdater,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            prices,
            settlement,
            clock,
            events,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn signup(&self) -> Result<UserId, GatewayError> {
        let user_id = self.store.create_user(Quote::new(self.config.initial_balance)).await?;
        info!(user_id = %user_id, balance = %self.config.initial_balance, "user signed up");
        Ok(user_id)
    }

    pub async fn balance(&self, user_id: UserId) -> Result<Quote, GatewayError> {
        Ok(self.store.balance(user_id).await?)
    }

    pub async fn place_order(
        &self,
        user_id: UserId,
        request: PlaceOrderRequest,
    ) -> Result<Position, GatewayError> {
        let order = request.validate(&self.config)?;

        let reference = self
            .prices
            .price(&order.symbol)
            .ok_or_else(|| GatewayError::NoMarketPrice(order.symbol.clone()))?;
        let entry = entry_price(order.side, reference, Bps::new(self.config.spread_bps))?;

        let (derived_tp, derived_sl) = match order.protection_pct {
            Some(pct) => protective_levels(order.side, entry, pct),
            None => (None, None),
        };
        let take_profit = order.take_profit.or(derived_tp);
        let stop_loss = order.stop_loss.or(derived_sl);
        validate_protective_levels(order.side, entry, take_profit, stop_loss).map_err(GatewayError::InvalidInput)?;

        let now = self.clock.now();
        let new = NewPosition {
            user_id,
            symbol: order.symbol,
            side: order.side,
            entry_price: entry,
            margin: order.margin,
            leverage: order.leverage,
            take_profit_price: take_profit,
            stop_loss_price: stop_loss,
            expiry: order.hold_secs.map(|secs| now.plus_secs(secs)),
            created_at: now,
        };

        let position = self.store.create_position(new).await?;

        info!(
            order_id = %position.id,
            user_id = %user_id,
            symbol = %position.symbol,
            side = position.side.as_str(),
            entry = %position.entry_price,
            margin = %position.margin,
            leverage = %position.leverage,
            "order placed"
        );
        self.events.emit(
            now,
            EventPayload::PositionOpened(PositionOpenedEvent {
                order_id: position.id,
                user_id,
                symbol: position.symbol.clone(),
                side: position.side,
                entry_price: position.entry_price,
                quantity: position.quantity,
                margin: position.margin,
                leverage: position.leverage,
            }),
        );
        Ok(position)
    }

    /// Close an open order at the latest price. Only the owner may close it;
    /// someone else's order reports as not found.
    pub async fn close_order(&self, user_id: UserId, order_id: OrderId) -> Result<CloseOutcome, GatewayError> {
        let position = self
            .store
            .position(order_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or(GatewayError::OrderNotFound(order_id))?;
        if !position.is_active() {
            return Err(GatewayError::AlreadyClosed(order_id));
        }

        let price = self
            .prices
            .price(&position.symbol)
            .ok_or_else(|| GatewayError::NoMarketPrice(position.symbol.clone()))?;
        let decision = CloseDecision::at(&position, CloseReason::ManuallyClosed, price)?;

        match self.settlement.close_and_settle(&position, decision).await? {
            CloseOutcome::RaceLost { .. } => Err(GatewayError::AlreadyClosed(order_id)),
            outcome => Ok(outcome),
        }
    }

    /// Open orders, newest first.
    pub async fn active_orders(&self, user_id: UserId) -> Result<Vec<Position>, GatewayError> {
        Ok(self.store.user_positions(user_id, PositionQuery::Active).await?)
    }

    /// Closed orders, newest first, capped at `history_limit`.
    pub async fn order_history(&self, user_id: UserId) -> Result<Vec<Position>, GatewayError> {
        let query = PositionQuery::History {
            limit: self.config.history_limit,
        };
        Ok(self.store.user_positions(user_id, query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::price_cache::LatestPrices;
    use crate::settlement::SettlementConfig;
    use crate::store::InMemoryStore;
    use crate::types::Timestamp;

    struct Harness {
        prices: LatestPrices,
        gateway: OrderGateway,
    }

    fn harness(spread_bps: i32) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(10_000)));
        let events = EventBus::new(100);
        let (settlement, _worker) =
            SettlementUpdater::spawn(store.clone(), clock.clone(), events.clone(), SettlementConfig::default());
        let prices = LatestPrices::new();
        let config = GatewayConfig {
            spread_bps,
            ..GatewayConfig::default()
        };
        let gateway = OrderGateway::new(config, store, prices.reader(), settlement, clock, events);
        Harness { prices, gateway }
    }

    fn set_price(h: &Harness, symbol: &str, price: Decimal) {
        h.prices
            .record(&Symbol::new(symbol), Price::new_unchecked(price), Timestamp::from_millis(0));
    }

    #[test]
    fn entry_price_skews_against_trader() {
        let reference = Price::new_unchecked(dec!(100));
        assert_eq!(entry_price(Side::Buy, reference, Bps::new(5)).unwrap().value(), dec!(100.05));
        assert_eq!(entry_price(Side::Sell, reference, Bps::new(5)).unwrap().value(), dec!(99.95));
        assert_eq!(entry_price(Side::Buy, reference, Bps::new(0)).unwrap().value(), dec!(100));
    }

    #[tokio::test]
    async fn signup_grants_initial_balance() {
        let h = harness(5);
        let user = h.gateway.signup().await.unwrap();
        assert_eq!(h.gateway.balance(user).await.unwrap().value(), dec!(10000));
    }

    #[tokio::test]
    async fn rejects_without_market_price() {
        let h = harness(5);
        let user = h.gateway.signup().await.unwrap();
        let result = h
            .gateway
            .place_order(user, PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(5)))
            .await;
        assert!(matches!(result, Err(GatewayError::NoMarketPrice(_))));
        assert_eq!(h.gateway.balance(user).await.unwrap().value(), dec!(10000));
    }

    #[tokio::test]
    async fn rejects_invalid_input() {
        let h = harness(5);
        set_price(&h, "BTCUSDT", dec!(100));
        let user = h.gateway.signup().await.unwrap();

        let bad = [
            PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(0), dec!(5)),
            PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(-5), dec!(5)),
            PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(0)),
            PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(500)),
            PlaceOrderRequest::new("", Side::Buy, dec!(100), dec!(5)),
            PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(5)).with_take_profit(dec!(90)),
            PlaceOrderRequest::new("BTCUSDT", Side::Sell, dec!(100), dec!(5)).with_stop_loss(dec!(90)),
            PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(5)).with_hold_secs(0),
        ];
        for request in bad {
            let result = h.gateway.place_order(user, request.clone()).await;
            assert!(matches!(result, Err(GatewayError::InvalidInput(_))), "{request:?}");
        }
        assert_eq!(h.gateway.balance(user).await.unwrap().value(), dec!(10000));
    }

    #[tokio::test]
    async fn insufficient_balance() {
        let h = harness(0);
        set_price(&h, "BTCUSDT", dec!(100));
        let user = h.gateway.signup().await.unwrap();
        let result = h
            .gateway
            .place_order(user, PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(10001), dec!(1)))
            .await;
        assert!(matches!(result, Err(GatewayError::InsufficientBalance { .. })));
    }

    #[tokio::test]
    async fn protection_pct_and_hold_time() {
        let h = harness(0);
        set_price(&h, "ETHUSDT", dec!(200));
        let user = h.gateway.signup().await.unwrap();

        let pos = h
            .gateway
            .place_order(
                user,
                PlaceOrderRequest::new("ethusdt", Side::Sell, dec!(100), dec!(2))
                    .with_protection_pct(dec!(0.1))
                    .with_hold_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(pos.take_profit_price.unwrap().value(), dec!(180));
        assert_eq!(pos.stop_loss_price.unwrap().value(), dec!(220));
        assert_eq!(pos.expiry.unwrap().as_millis(), 70_000);
        assert_eq!(pos.quantity, dec!(1));
        assert_eq!(h.gateway.balance(user).await.unwrap().value(), dec!(9900));
    }

    #[tokio::test]
    async fn explicit_levels_override_pct() {
        let h = harness(0);
        set_price(&h, "BTCUSDT", dec!(100));
        let user = h.gateway.signup().await.unwrap();
        let pos = h
            .gateway
            .place_order(
                user,
                PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(5))
                    .with_protection_pct(dec!(0.02))
                    .with_take_profit(dec!(110)),
            )
            .await
            .unwrap();
        assert_eq!(pos.take_profit_price.unwrap().value(), dec!(110));
        assert_eq!(pos.stop_loss_price.unwrap().value(), dec!(98));
    }

    #[tokio::test]
    async fn manual_close_settles_once() {
        let h = harness(0);
        set_price(&h, "BTCUSDT", dec!(100));
        let user = h.gateway.signup().await.unwrap();
        let pos = h
            .gateway
            .place_order(user, PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(5)))
            .await
            .unwrap();

        set_price(&h, "BTCUSDT", dec!(104));
        let outcome = h.gateway.close_order(user, pos.id).await.unwrap();
        let decision = outcome.decision().unwrap();
        assert_eq!(decision.reason, CloseReason::ManuallyClosed);
        assert_eq!(decision.pnl.value(), dec!(20));
        assert_eq!(h.gateway.balance(user).await.unwrap().value(), dec!(10020));

        assert!(matches!(
            h.gateway.close_order(user, pos.id).await,
            Err(GatewayError::AlreadyClosed(_))
        ));
        let history = h.gateway.order_history(user).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(h.gateway.active_orders(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cannot_close_someone_elses_order() {
        let h = harness(0);
        set_price(&h, "BTCUSDT", dec!(100));
        let owner = h.gateway.signup().await.unwrap();
        let other = h.gateway.signup().await.unwrap();
        let pos = h
            .gateway
            .place_order(owner, PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(5)))
            .await
            .unwrap();

        assert!(matches!(
            h.gateway.close_order(other, pos.id).await,
            Err(GatewayError::OrderNotFound(_))
        ));
        assert_eq!(h.gateway.active_orders(owner).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn extreme_cached_price_is_rejected_cleanly() {
        let h = harness(5);
        set_price(&h, "BTCUSDT", dec!(100));
        let user = h.gateway.signup().await.unwrap();
        let pos = h
            .gateway
            .place_order(user, PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(5)))
            .await
            .unwrap();

        set_price(&h, "BTCUSDT", Decimal::MAX);
        let placed = h
            .gateway
            .place_order(user, PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(5)))
            .await;
        assert!(matches!(placed, Err(GatewayError::Overflow(_))));
        assert!(matches!(
            h.gateway.close_order(user, pos.id).await,
            Err(GatewayError::Overflow(_))
        ));

        assert_eq!(h.gateway.balance(user).await.unwrap().value(), dec!(9900));
        assert_eq!(h.gateway.active_orders(user).await.unwrap().len(), 1);
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let raw = r#"{"symbol":"BTCUSDT","side":"buy","margin":"100","leverage":"5"}"#;
        let request: PlaceOrderRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.margin, dec!(100));
        assert!(request.take_profit.is_none());
        assert!(request.hold_secs.is_none());
    }
}
