//! Engine configuration options.

use crate::risk::RiskParams;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Loss, as a fraction of margin, that forces a liquidation.
    pub liquidation_loss_fraction: Decimal,
    /// Period of the all-symbol expiry sweep. 0 disables the timer.
    pub expiry_sweep_interval_ms: u64,
    /// Ticks buffered per symbol worker before the dispatcher waits.
    pub worker_queue_capacity: usize,
    /// Maximum number of events to retain in memory.
    pub max_events: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            liquidation_loss_fraction: dec!(0.9),
            expiry_sweep_interval_ms: 1_000,
            worker_queue_capacity: 1_024,
            max_events: 100_000,
        }
    }
}

impl EngineConfig {
    pub fn risk_params(&self) -> RiskParams {
        RiskParams {
            liquidation_loss_fraction: self.liquidation_loss_fraction,
        }
    }
}
