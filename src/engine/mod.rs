// 8.0: risk engine. consumes price ticks, keeps the latest-price cache, decides which
// open positions close and hands each close to the settlement updater.
// one sequential worker per symbol; symbols run in parallel.

mod config;
mod core;
mod dispatcher;
mod expiry;
mod results;
mod ticks;

pub use config::EngineConfig;
pub use core::RiskEngine;
pub use dispatcher::TickDispatcher;
pub use results::{EngineError, PositionFailure, SweepReport, TickReport};
