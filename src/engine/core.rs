// 8.0 engine/core.rs: the risk engine. owns the writable price cache; everything it
// persists goes through the store and the settlement updater.

use super::config::EngineConfig;
use super::results::{EngineError, PositionFailure};
use crate::clock::Clock;
use crate::events::EventBus;
use crate::position::{ArithmeticOverflow, Position};
use crate::price_cache::{LatestPrices, PriceReader};
use crate::risk::{CloseDecision, RiskParams};
use crate::settlement::{CloseOutcome, SettlementUpdater};
use crate::store::PositionStore;
use std::sync::Arc;
use tracing::warn;

/** 8.1: engine handle. shared behind an Arc by the dispatcher workers and the expiry timer */
pub struct RiskEngine {
    pub(super) config: EngineConfig,
    pub(super) params: RiskParams,
    pub(super) store: Arc<dyn PositionStore>,
    pub(super) prices: LatestPrices,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settlement: SettlementUpdater,
    pub(super) events: EventBus,
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("config", &self.config)
            .field("settlement", &self.settlement)
            .finish_non_exhaustive()
    }
}

impl RiskEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PositionStore>,
        clock: Arc<dyn Clock>,
        settlement: SettlementUpdater,
        events: EventBus,
    ) -> Self {
        let params = config.risk_params();
        Self {
            config,
            params,
            store,
            prices: LatestPrices::new(),
            clock,
            settlement,
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn params(&self) -> &RiskParams {
        &self.params
    }

    /// Read-only view of the latest-price cache, for the order gateway.
    pub fn price_reader(&self) -> PriceReader {
        self.prices.reader()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settlement(&self) -> &SettlementUpdater {
        &self.settlement
    }

    pub fn store(&self) -> &Arc<dyn PositionStore> {
        &self.store
    }

    pub(super) fn unpriceable(&self, position: &Position, e: ArithmeticOverflow) -> PositionFailure {
        warn!(order_id = %position.id, symbol = %position.symbol, "cannot price position: {}", e);
        PositionFailure {
            order_id: Some(position.id),
            error: EngineError::Overflow(e),
        }
    }

    /// Close `position` per `decision`. Store errors are returned as a
    /// per-position failure so the caller can keep going.
    pub(super) async fn settle(
        &self,
        position: &Position,
        decision: CloseDecision,
    ) -> Result<CloseOutcome, PositionFailure> {
        self.settlement
            .close_and_settle(position, decision)
            .await
            .map_err(|e| {
                warn!(order_id = %position.id, symbol = %position.symbol, "close failed: {}", e);
                PositionFailure {
                    order_id: Some(position.id),
                    error: EngineError::Store(e),
                }
            })
    }
}
