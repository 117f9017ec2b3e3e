//! Concurrency tests.
//!
//! Duplicate and competing closes, per-symbol ordering through the dispatcher,
//! and credits that fail after the status transition.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use venue_core::*;

fn new_position(user_id: UserId, symbol: &str, side: Side, margin: Decimal, leverage: Decimal) -> NewPosition {
    NewPosition {
        user_id,
        symbol: Symbol::new(symbol),
        side,
        entry_price: Price::new_unchecked(dec!(100)),
        margin: Quote::new(margin),
        leverage: Leverage::new(leverage).unwrap(),
        take_profit_price: None,
        stop_loss_price: None,
        expiry: None,
        created_at: Timestamp::from_millis(0),
    }
}

fn tick(symbol: &str, price: Decimal, ts: i64) -> PriceTick {
    PriceTick::new(Symbol::new(symbol), Price::new_unchecked(price), Timestamp::from_millis(ts))
}

fn fast_settlement() -> SettlementConfig {
    SettlementConfig {
        inline_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    }
}

fn engine_over(store: Arc<dyn PositionStore>, clock: Arc<ManualClock>, events: EventBus) -> Arc<RiskEngine> {
    let (settlement, _worker) = SettlementUpdater::spawn(store.clone(), clock.clone(), events.clone(), fast_settlement());
    Arc::new(RiskEngine::new(EngineConfig::default(), store, clock, settlement, events))
}

/// Store wrapper whose next `failures` credits fail. Credits to `stuck_user`
/// fail until it is cleared, without using up `failures`.
struct FlakyStore {
    inner: InMemoryStore,
    failures: AtomicUsize,
    stuck_user: AtomicU64,
    credit_calls: AtomicUsize,
}

impl FlakyStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            failures: AtomicUsize::new(failures),
            stuck_user: AtomicU64::new(0),
            credit_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PositionStore for FlakyStore {
    async fn create_user(&self, initial_balance: Quote) -> Result<UserId, StoreError> {
        self.inner.create_user(initial_balance).await
    }

    async fn balance(&self, user_id: UserId) -> Result<Quote, StoreError> {
        self.inner.balance(user_id).await
    }

    async fn create_position(&self, new: NewPosition) -> Result<Position, StoreError> {
        self.inner.create_position(new).await
    }

    async fn position(&self, id: OrderId) -> Result<Option<Position>, StoreError> {
        self.inner.position(id).await
    }

    async fn active_positions(&self, symbol: &Symbol) -> Result<Vec<Position>, StoreError> {
        self.inner.active_positions(symbol).await
    }

    async fn expired_positions(
        &self,
        symbol: Option<&Symbol>,
        now: Timestamp,
    ) -> Result<Vec<Position>, StoreError> {
        self.inner.expired_positions(symbol, now).await
    }

    async fn conditional_close(
        &self,
        id: OrderId,
        reason: CloseReason,
        exit_price: Price,
        pnl: Quote,
    ) -> Result<bool, StoreError> {
        self.inner.conditional_close(id, reason, exit_price, pnl).await
    }

    async fn credit_balance(&self, user_id: UserId, amount: Quote) -> Result<(), StoreError> {
        self.credit_calls.fetch_add(1, Ordering::SeqCst);
        if self.stuck_user.load(Ordering::SeqCst) == user_id.0 {
            return Err(StoreError::Unavailable("shard offline".to_string()));
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.credit_balance(user_id, amount).await
    }

    async fn user_positions(
        &self,
        user_id: UserId,
        query: PositionQuery,
    ) -> Result<Vec<Position>, StoreError> {
        self.inner.user_positions(user_id, query).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_closing_tick_credits_once() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let events = EventBus::new(1_000);
    let engine = engine_over(store.clone(), clock, events.clone());

    let user = store.create_user(Quote::new(dec!(1000))).await.unwrap();
    let mut new = new_position(user, "BTCUSDT", Side::Buy, dec!(100), dec!(5));
    new.take_profit_price = Some(Price::new_unchecked(dec!(105)));
    let pos = store.create_position(new).await.unwrap();

    // deliberately bypass the dispatcher so both copies race
    let closing = tick("BTCUSDT", dec!(106), 1);
    let (a, b) = tokio::join!(engine.on_tick(&closing), engine.on_tick(&closing));

    assert_eq!(a.closed_count() + b.closed_count(), 1);
    assert_eq!(store.balance(user).await.unwrap().value(), dec!(1030));
    assert_eq!(events.settlements().len(), 1);
    assert_eq!(store.position(pos.id).await.unwrap().unwrap().pnl.unwrap().value(), dec!(30));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_closers_one_credit_each() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let events = EventBus::new(10_000);
    let engine = engine_over(store.clone(), clock, events.clone());

    let user = store.create_user(Quote::new(dec!(10000))).await.unwrap();
    for _ in 0..50 {
        let mut new = new_position(user, "BTCUSDT", Side::Sell, dec!(10), dec!(20));
        new.stop_loss_price = Some(Price::new_unchecked(dec!(110)));
        store.create_position(new).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move { engine.on_tick(&tick("BTCUSDT", dec!(110), 1)).await }));
    }
    let mut closed = 0;
    let mut lost = 0;
    for handle in handles {
        let report = handle.await.unwrap();
        closed += report.closed_count();
        lost += report.races_lost();
    }

    assert_eq!(closed, 50);
    // liquidated at -20 pnl on 10 margin, so every credit floors at 0
    assert_eq!(store.balance(user).await.unwrap().value(), dec!(9500));
    assert_eq!(events.settlements().len(), 50);
    assert!(events.settlements().iter().all(|s| s.close_reason == CloseReason::Liquidated));
    assert!(lost <= 7 * 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_close_races_threshold_close() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let events = EventBus::new(1_000);
    let engine = engine_over(store.clone(), clock.clone(), events.clone());
    let gateway = OrderGateway::new(
        GatewayConfig {
            spread_bps: 0,
            ..GatewayConfig::default()
        },
        store.clone(),
        engine.price_reader(),
        engine.settlement().clone(),
        clock,
        events.clone(),
    );

    let user = gateway.signup().await.unwrap();
    engine.on_tick(&tick("BTCUSDT", dec!(100), 0)).await;
    let pos = gateway
        .place_order(
            user,
            PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(5)).with_take_profit(dec!(105)),
        )
        .await
        .unwrap();

    let closing = tick("BTCUSDT", dec!(106), 1);
    let (report, manual) = tokio::join!(engine.on_tick(&closing), gateway.close_order(user, pos.id));

    let manual_won = manual.is_ok();
    assert_eq!(report.closed_count() + usize::from(manual_won), 1);
    if !manual_won {
        assert!(matches!(manual, Err(GatewayError::AlreadyClosed(_))));
    }
    assert_eq!(events.settlements().len(), 1);

    let closed = store.position(pos.id).await.unwrap().unwrap();
    let credited = events.settlements()[0].credited_amount;
    assert_eq!(credited, closed.margin.add(closed.pnl.unwrap()));
    assert_eq!(store.balance(user).await.unwrap().value(), dec!(9900) + credited.value());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expiry_sweep_and_tick_path_settle_once() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let events = EventBus::new(1_000);
    let engine = engine_over(store.clone(), clock.clone(), events.clone());

    let user = store.create_user(Quote::new(dec!(1000))).await.unwrap();
    let mut new = new_position(user, "BTCUSDT", Side::Buy, dec!(100), dec!(1));
    new.expiry = Some(Timestamp::from_millis(500));
    store.create_position(new).await.unwrap();

    engine.on_tick(&tick("BTCUSDT", dec!(100), 0)).await;
    clock.set(Timestamp::from_millis(1_000));

    let t1 = tick("BTCUSDT", dec!(100), 1);
    let (report, sweep) = tokio::join!(engine.on_tick(&t1), engine.sweep_expired());

    assert_eq!(report.closed_count() + sweep.closed_count(), 1);
    assert_eq!(events.settlements().len(), 1);
    assert_eq!(store.balance(user).await.unwrap().value(), dec!(1000));
}

#[tokio::test]
async fn dispatcher_keeps_per_symbol_order() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let events = EventBus::new(1_000);
    let engine = engine_over(store.clone(), clock, events);

    let (sink, mut reports) = mpsc::unbounded_channel();
    let mut dispatcher = TickDispatcher::new(Arc::clone(&engine)).with_report_sink(sink);

    for i in 1..=50i64 {
        dispatcher.dispatch(tick("BTCUSDT", Decimal::from(1_000 + i), i)).await.unwrap();
        dispatcher.dispatch(tick("ETHUSDT", Decimal::from(2_000 + i), i)).await.unwrap();
    }
    assert_eq!(dispatcher.worker_count(), 2);
    dispatcher.shutdown().await;

    let mut btc = Vec::new();
    let mut eth = Vec::new();
    while let Ok(report) = reports.try_recv() {
        match report.symbol.as_str() {
            "BTCUSDT" => btc.push(report.price.value()),
            _ => eth.push(report.price.value()),
        }
    }
    let expected_btc: Vec<Decimal> = (1..=50).map(|i| Decimal::from(1_000 + i)).collect();
    let expected_eth: Vec<Decimal> = (1..=50).map(|i| Decimal::from(2_000 + i)).collect();
    assert_eq!(btc, expected_btc);
    assert_eq!(eth, expected_eth);

    let reader = engine.price_reader();
    assert_eq!(reader.price(&Symbol::new("BTCUSDT")).unwrap().value(), dec!(1050));
    assert_eq!(reader.price(&Symbol::new("ETHUSDT")).unwrap().value(), dec!(2050));
}

#[tokio::test]
async fn dispatcher_settles_before_next_tick() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let events = EventBus::new(1_000);
    let engine = engine_over(store.clone(), clock, events.clone());

    let user = store.create_user(Quote::new(dec!(1000))).await.unwrap();
    let mut new = new_position(user, "BTCUSDT", Side::Buy, dec!(100), dec!(5));
    new.take_profit_price = Some(Price::new_unchecked(dec!(105)));
    new.stop_loss_price = Some(Price::new_unchecked(dec!(95)));
    store.create_position(new).await.unwrap();

    // TP fires on the first tick; the SL tick behind it must find nothing to close
    let (sink, mut reports) = mpsc::unbounded_channel();
    let mut dispatcher = TickDispatcher::new(Arc::clone(&engine)).with_report_sink(sink);
    dispatcher.dispatch(tick("BTCUSDT", dec!(106), 1)).await.unwrap();
    dispatcher.dispatch(tick("BTCUSDT", dec!(90), 2)).await.unwrap();
    dispatcher.shutdown().await;

    let first = reports.try_recv().unwrap();
    let second = reports.try_recv().unwrap();
    assert_eq!(first.closed_count(), 1);
    assert_eq!(second.evaluated, 0);
    assert!(second.closes.is_empty());
    assert_eq!(events.settlements()[0].close_reason, CloseReason::TakeProfit);
}

#[tokio::test]
async fn venue_streams_raw_feed_to_settlement() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let mut config = VenueConfig::simulation();
    config.engine.expiry_sweep_interval_ms = 0;
    let venue = Venue::start(config, store.clone(), clock);

    let user = venue.gateway.signup().await.unwrap();
    venue.engine.on_tick(&tick("BTCUSDT", dec!(100), 0)).await;
    let pos = venue
        .gateway
        .place_order(
            user,
            PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(5)).with_take_profit(dec!(105)),
        )
        .await
        .unwrap();

    venue.publisher.publish_raw(r#"{"s":"btcusdt","p":"NaN","T":1}"#);
    venue.publisher.publish_raw(r#"{"s":"btcusdt","p":"104","T":2}"#);
    venue.publisher.publish_raw(r#"{"s":"btcusdt","p":"106","T":3}"#);
    venue.shutdown().await.unwrap();

    let closed = store.position(pos.id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::TakeProfit);
    assert_eq!(closed.exit_price.unwrap().value(), dec!(106));
    assert_eq!(store.balance(user).await.unwrap().value(), dec!(10030));
}

#[tokio::test]
async fn failed_credit_is_deferred_and_retried() {
    let store = Arc::new(FlakyStore::new(4));
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let events = EventBus::new(1_000);
    let engine = engine_over(store.clone(), clock, events.clone());

    let user = store.create_user(Quote::new(dec!(1000))).await.unwrap();
    let mut new = new_position(user, "BTCUSDT", Side::Buy, dec!(100), dec!(5));
    new.take_profit_price = Some(Price::new_unchecked(dec!(105)));
    let pos = store.create_position(new).await.unwrap();

    let report = engine.on_tick(&tick("BTCUSDT", dec!(106), 1)).await;

    // two inline attempts fail, the position is closed regardless
    assert!(matches!(report.closes[0], CloseOutcome::Deferred { .. }));
    assert_eq!(engine.settlement().pending_retries(), 1);
    let closed = store.position(pos.id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::TakeProfit);
    assert_eq!(store.balance(user).await.unwrap().value(), dec!(900));

    assert!(engine.settlement().wait_for_pending(Duration::from_secs(5)).await);
    assert_eq!(store.balance(user).await.unwrap().value(), dec!(1030));
    assert_eq!(store.credit_calls.load(Ordering::SeqCst), 5);

    let payloads: Vec<_> = events.events().into_iter().map(|e| e.payload).collect();
    assert!(payloads.iter().any(|p| matches!(p, EventPayload::SettlementDeferred(_))));
    assert!(payloads.iter().any(|p| matches!(p, EventPayload::SettlementRecovered(r) if r.attempts == 5)));
    assert_eq!(events.settlements().len(), 1);

    // replay after recovery changes nothing
    engine.on_tick(&tick("BTCUSDT", dec!(106), 2)).await;
    assert_eq!(store.balance(user).await.unwrap().value(), dec!(1030));
}

#[tokio::test]
async fn failing_credits_do_not_abort_the_tick() {
    let store = Arc::new(FlakyStore::new(usize::MAX));
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let events = EventBus::new(1_000);
    let engine = engine_over(store.clone(), clock, events);

    let user = store.create_user(Quote::new(dec!(1000))).await.unwrap();
    let mut a = new_position(user, "BTCUSDT", Side::Buy, dec!(100), dec!(5));
    a.take_profit_price = Some(Price::new_unchecked(dec!(105)));
    let mut b = a.clone();
    b.take_profit_price = Some(Price::new_unchecked(dec!(101)));
    let a = store.create_position(a).await.unwrap();
    let b = store.create_position(b).await.unwrap();

    let report = engine.on_tick(&tick("BTCUSDT", dec!(106), 1)).await;

    // both close even though every credit fails; nothing aborts the batch
    assert_eq!(report.evaluated, 2);
    assert_eq!(report.closed_count(), 2);
    assert!(store.position(a.id).await.unwrap().unwrap().status.is_terminal());
    assert!(store.position(b.id).await.unwrap().unwrap().status.is_terminal());
    assert_eq!(engine.settlement().pending_retries(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stuck_credit_does_not_hold_up_other_deferred_credits() {
    // two inline failures for the second user, then it goes through
    let store = Arc::new(FlakyStore::new(2));
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let events = EventBus::new(1_000);
    let engine = engine_over(store.clone(), clock, events.clone());

    let stuck = store.create_user(Quote::new(dec!(1000))).await.unwrap();
    let healthy = store.create_user(Quote::new(dec!(1000))).await.unwrap();
    store.stuck_user.store(stuck.0, Ordering::SeqCst);
    for user in [stuck, healthy] {
        let mut new = new_position(user, "BTCUSDT", Side::Buy, dec!(100), dec!(5));
        new.take_profit_price = Some(Price::new_unchecked(dec!(105)));
        store.create_position(new).await.unwrap();
    }

    let report = engine.on_tick(&tick("BTCUSDT", dec!(106), 1)).await;
    assert!(report.closes.iter().all(|o| matches!(o, CloseOutcome::Deferred { .. })));
    assert_eq!(engine.settlement().pending_retries(), 2);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.settlement().pending_retries() > 1 {
        assert!(tokio::time::Instant::now() < deadline, "healthy credit never applied");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(store.balance(healthy).await.unwrap().value(), dec!(1030));
    assert_eq!(store.balance(stuck).await.unwrap().value(), dec!(900));
    assert_eq!(events.settlements().len(), 1);

    store.stuck_user.store(0, Ordering::SeqCst);
    assert!(engine.settlement().wait_for_pending(Duration::from_secs(5)).await);
    assert_eq!(store.balance(stuck).await.unwrap().value(), dec!(1030));
    assert_eq!(events.settlements().len(), 2);
}
