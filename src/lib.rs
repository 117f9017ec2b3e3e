// venue-core: risk engine for a leveraged trading venue.
// positions fill against an external reference price; every tick re-checks the
// open positions on its symbol for liquidation, take profit and stop loss, and each
// close is recorded once and paid once.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: UserId, OrderId, Symbol, Side, Price, Quote, Leverage
//   1.7  clock.rs: wall clock and manual clock
//   2.x  position.rs: order row, status, close reasons, pnl math
//   3.x  risk.rs: liquidation > take profit > stop loss, close decisions
//   4.x  price_cache.rs: latest price per symbol, writer and reader handles
//   4.1  feed.rs: trade message parsing, tick broadcast
//   5.x  settlement.rs: conditional close then credit, deferred credit retries
//   6.x  events.rs: open and settlement events for audit
//   7.x  config.rs: venue settings, toml loading, env presets
//   8.x  engine/: risk engine: ticks, expiry sweeps, per-symbol dispatch
//   9.x  store/: position store trait, in-memory and postgres backends
//   10.x gateway.rs: place/close orders, balances, history
//   11.x venue.rs: wiring for a running venue

// core modules
pub mod clock;
pub mod position;
pub mod risk;
pub mod types;

// tick path
pub mod engine;
pub mod feed;
pub mod price_cache;
pub mod settlement;

// integration modules
pub mod config;
pub mod events;
pub mod gateway;
pub mod store;
pub mod venue;

// re exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, Environment, VenueConfig};
pub use engine::{EngineConfig, EngineError, RiskEngine, SweepReport, TickDispatcher, TickReport};
pub use events::{Event, EventBus, EventPayload, SettlementEvent};
pub use feed::{parse_trade, FeedError, PriceTick, TickPublisher, TradeMessage};
pub use gateway::{GatewayConfig, GatewayError, OrderGateway, PlaceOrderRequest};
pub use position::*;
pub use price_cache::{CachedPrice, LatestPrices, PriceReader};
pub use risk::*;
pub use settlement::{CloseOutcome, SettlementConfig, SettlementUpdater};
pub use store::{InMemoryStore, PositionQuery, PositionStore, StoreError};
pub use types::*;
pub use venue::Venue;
