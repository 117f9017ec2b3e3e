//! Venue risk engine simulation.
//!
//! Runs the order lifecycle end to end on the in-memory store: placement against
//! the latest price, take profit, stop loss, liquidation, expiry, manual close and
//! a streamed feed through the per-symbol dispatcher.
//!
//! Usage: `venue-sim [config.toml]`. Log level via `RUST_LOG`.

use anyhow::Context;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use venue_core::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,venue_core=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let config = match std::env::args().nth(1) {
        Some(path) => VenueConfig::load(Path::new(&path)).with_context(|| format!("loading {path}"))?,
        None => Environment::Simulation.config(),
    };

    println!("Venue Risk Engine Simulation");
    println!("Environment: {:?}\n", config.environment);

    scenario_1_take_profit(&config).await?;
    scenario_2_short_stop_loss(&config).await?;
    scenario_3_liquidation_first(&config).await?;
    scenario_4_expiry_and_manual_close(&config).await?;
    scenario_5_streamed_feed(&config).await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

struct Sim {
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
    venue: Venue,
}

fn start(config: &VenueConfig) -> Sim {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000)));
    let mut config = config.clone();
    // scenarios drive expiry by hand
    config.engine.expiry_sweep_interval_ms = 0;
    let venue = Venue::start(config, store.clone(), clock.clone());
    Sim { store, clock, venue }
}

impl Sim {
    async fn tick(&self, symbol: &str, price: Decimal) -> TickReport {
        let tick = PriceTick::new(Symbol::new(symbol), Price::new_unchecked(price), self.clock.now());
        self.venue.engine.on_tick(&tick).await
    }

    async fn balance(&self, user: UserId) -> anyhow::Result<Quote> {
        Ok(self.venue.gateway.balance(user).await?)
    }
}

fn print_closes(report: &TickReport) {
    for outcome in report.closed() {
        if let Some(d) = outcome.decision() {
            println!(
                "    order {} closed: {} at {}, pnl {}, credited {}",
                d.order_id, d.reason, d.exit_price, d.pnl, d.credited
            );
        }
    }
}

/// Buy 100 margin at 5x, TP at 105. 102 holds, 106 takes profit.
async fn scenario_1_take_profit(config: &VenueConfig) -> anyhow::Result<()> {
    println!("Scenario 1: Take Profit\n");
    let sim = start(config);
    let alice = sim.venue.gateway.signup().await?;

    sim.tick("BTCUSDT", dec!(100)).await;
    let order = sim
        .venue
        .gateway
        .place_order(
            alice,
            PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(5)).with_take_profit(dec!(105)),
        )
        .await?;
    println!(
        "  Alice buys: entry {}, quantity {}, TP {:?}",
        order.entry_price,
        order.quantity,
        order.take_profit_price.map(|p| p.value())
    );

    let report = sim.tick("BTCUSDT", dec!(102)).await;
    println!("  Tick 102: {} evaluated, {} closed", report.evaluated, report.closed_count());

    let report = sim.tick("BTCUSDT", dec!(106)).await;
    println!("  Tick 106:");
    print_closes(&report);
    println!("  Alice balance: {}\n", sim.balance(alice).await?);

    sim.venue.shutdown().await?;
    Ok(())
}

/// Sell 50 margin at 2x, SL at 55. 56 stops out.
async fn scenario_2_short_stop_loss(config: &VenueConfig) -> anyhow::Result<()> {
    println!("Scenario 2: Short Stop Loss\n");
    let sim = start(config);
    let bob = sim.venue.gateway.signup().await?;

    sim.tick("ETHUSDT", dec!(50)).await;
    let order = sim
        .venue
        .gateway
        .place_order(
            bob,
            PlaceOrderRequest::new("ETHUSDT", Side::Sell, dec!(50), dec!(2)).with_stop_loss(dec!(55)),
        )
        .await?;
    println!("  Bob sells: entry {}, quantity {}", order.entry_price, order.quantity);

    let report = sim.tick("ETHUSDT", dec!(56)).await;
    println!("  Tick 56:");
    print_closes(&report);
    println!("  Bob balance: {}\n", sim.balance(bob).await?);

    sim.venue.shutdown().await?;
    Ok(())
}

/// 10x long; the loss limit at -90 is hit before a stop loss further out.
async fn scenario_3_liquidation_first(config: &VenueConfig) -> anyhow::Result<()> {
    println!("Scenario 3: Liquidation Before Stop Loss\n");
    let sim = start(config);
    let carol = sim.venue.gateway.signup().await?;

    sim.tick("SOLUSDT", dec!(100)).await;
    let order = sim
        .venue
        .gateway
        .place_order(
            carol,
            PlaceOrderRequest::new("SOLUSDT", Side::Buy, dec!(100), dec!(10)).with_stop_loss(dec!(85)),
        )
        .await?;
    if let Some(level) = liquidation_price(&order, sim.venue.engine.params()) {
        println!("  Carol buys at {}, liquidation at {}, SL 85", order.entry_price, level);
    }

    let report = sim.tick("SOLUSDT", dec!(91)).await;
    println!("  Tick 91:");
    print_closes(&report);
    println!("  Carol balance: {}\n", sim.balance(carol).await?);

    sim.venue.shutdown().await?;
    Ok(())
}

/// A 60 second hold expires on the sweep; a second order is closed by hand.
async fn scenario_4_expiry_and_manual_close(config: &VenueConfig) -> anyhow::Result<()> {
    println!("Scenario 4: Expiry and Manual Close\n");
    let sim = start(config);
    let dave = sim.venue.gateway.signup().await?;

    sim.tick("BTCUSDT", dec!(200)).await;
    let held = sim
        .venue
        .gateway
        .place_order(
            dave,
            PlaceOrderRequest::new("BTCUSDT", Side::Buy, dec!(100), dec!(2)).with_hold_secs(60),
        )
        .await?;
    let manual = sim
        .venue
        .gateway
        .place_order(
            dave,
            PlaceOrderRequest::new("BTCUSDT", Side::Sell, dec!(100), dec!(2)).with_protection_pct(dec!(0.05)),
        )
        .await?;
    println!("  Dave holds order {} for 60s, order {} open until closed", held.id, manual.id);

    sim.tick("BTCUSDT", dec!(204)).await;
    sim.clock.advance_secs(61);
    let sweep = sim.venue.engine.sweep_expired().await;
    println!("  Sweep after 61s: {} expired, {} closed", sweep.expired_found, sweep.closed_count());

    let outcome = sim.venue.gateway.close_order(dave, manual.id).await?;
    if let Some(d) = outcome.decision() {
        println!("  Manual close of {}: exit {}, pnl {}", d.order_id, d.exit_price, d.pnl);
    }
    match sim.venue.gateway.close_order(dave, manual.id).await {
        Err(e) => println!("  Closing again: {}", e),
        Ok(_) => println!("  Closing again unexpectedly succeeded"),
    }

    for order in sim.venue.gateway.order_history(dave).await? {
        println!("    history: order {} {} pnl {:?}", order.id, order.status, order.pnl.map(|p| p.value()));
    }
    println!("  Dave balance: {}\n", sim.balance(dave).await?);

    sim.venue.shutdown().await?;
    Ok(())
}

/// Raw trade messages through the publisher and per-symbol workers.
async fn scenario_5_streamed_feed(config: &VenueConfig) -> anyhow::Result<()> {
    println!("Scenario 5: Streamed Feed\n");
    let sim = start(config);

    let mut traders = Vec::new();
    for _ in 0..20 {
        traders.push(sim.venue.gateway.signup().await?);
    }
    let start_total = sim.store.total_balances();

    for symbol in ["BTCUSDT", "ETHUSDT"] {
        sim.tick(symbol, dec!(1000)).await;
    }
    for (i, trader) in traders.iter().enumerate() {
        let symbol = if i % 2 == 0 { "BTCUSDT" } else { "ETHUSDT" };
        let side = if i % 3 == 0 { Side::Sell } else { Side::Buy };
        let request = PlaceOrderRequest::new(symbol, side, dec!(500), Decimal::from(1 + i % 10))
            .with_protection_pct(dec!(0.03));
        sim.venue.gateway.place_order(*trader, request).await?;
    }

    let path = [1000, 1012, 995, 1031, 968, 1044, 1001];
    let mut published = 0;
    for (step, price) in path.iter().enumerate() {
        for symbol in ["btcusdt", "ethusdt"] {
            let raw = format!(r#"{{"e":"trade","s":"{symbol}","p":"{price}","T":{step},"m":false}}"#);
            if sim.venue.publisher.publish_raw(&raw).is_some() {
                published += 1;
            }
        }
    }
    let dropped = sim.venue.publisher.publish_raw(r#"{"s":"BTCUSDT","p":"NaN","T":9}"#).is_none();
    println!("  Published {} ticks, NaN tick dropped: {}", published, dropped);

    let events = sim.venue.events.clone();
    sim.venue.shutdown().await?;

    let positions = sim.store.all_positions();
    let open = positions.iter().filter(|p| p.is_active()).count();
    println!("  Positions: {} total, {} still open, {} settled", positions.len(), open, events.settlements().len());

    let open_margin: Quote = positions.iter().filter(|p| p.is_active()).map(|p| p.margin).sum();
    let realized: Quote = positions.iter().filter_map(|p| p.pnl).sum();
    println!(
        "  Balances {} + open margin {} vs start {} + realized {}",
        sim.store.total_balances(),
        open_margin,
        start_total,
        realized
    );
    Ok(())
}
