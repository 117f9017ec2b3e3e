//! Per-tick evaluation.
//!
//! For one `PriceTick`: snapshot the symbol's expired and active positions,
//! record the price, close the expired ones, then check every other snapshotted
//! position against its liquidation, take-profit and stop-loss thresholds at the
//! tick price. Positions that do not trigger cost one read and no write.

use super::core::RiskEngine;
use super::results::{EngineError, PositionFailure, TickReport};
use crate::feed::PriceTick;
use crate::position::{CloseReason, Position};
use crate::risk::{evaluate_close, CloseDecision};
use crate::store::StoreError;
use crate::types::{Symbol, Timestamp};
use tracing::{debug, warn};

impl RiskEngine {
    /// Process one tick. Must be called sequentially per symbol.
    pub async fn on_tick(&self, tick: &PriceTick) -> TickReport {
        let mut report = TickReport::new(tick.symbol.clone(), tick.price);
        let now = self.clock.now();

        // snapshots come before the cache moves: an order priced off this tick
        // is first evaluated by the next one
        let expired = self.store.expired_positions(Some(&tick.symbol), now).await;
        let active = self.store.active_positions(&tick.symbol).await;
        let expired = scan_or_fail(expired, &tick.symbol, "expiry", &mut report);
        let active = scan_or_fail(active, &tick.symbol, "active position", &mut report);

        self.prices.record(&tick.symbol, tick.price, tick.timestamp);

        self.close_expired_on_tick(tick, expired, &mut report).await;
        self.evaluate_thresholds(tick, active, now, &mut report).await;

        if !report.closes.is_empty() || !report.failures.is_empty() {
            debug!(
                symbol = %tick.symbol,
                price = %tick.price,
                evaluated = report.evaluated,
                closed = report.closed_count(),
                races_lost = report.races_lost(),
                failures = report.failures.len(),
                "tick processed"
            );
        }
        report
    }

    async fn close_expired_on_tick(&self, tick: &PriceTick, expired: Vec<Position>, report: &mut TickReport) {
        let exit_price = self.prices.get(&tick.symbol).map(|c| c.price).unwrap_or(tick.price);
        for position in expired {
            let decision = match CloseDecision::at(&position, CloseReason::Expired, exit_price) {
                Ok(decision) => decision,
                Err(e) => {
                    report.failures.push(self.unpriceable(&position, e));
                    continue;
                }
            };
            match self.settle(&position, decision).await {
                Ok(outcome) => report.closes.push(outcome),
                Err(failure) => report.failures.push(failure),
            }
        }
    }

    async fn evaluate_thresholds(
        &self,
        tick: &PriceTick,
        active: Vec<Position>,
        now: Timestamp,
        report: &mut TickReport,
    ) {
        // expired positions belong to the expiry pass
        for position in active.into_iter().filter(|p| !p.is_expired(now)) {
            report.evaluated += 1;
            let decision = match evaluate_close(&position, tick.price, &self.params) {
                Ok(Some(decision)) => decision,
                Ok(None) => continue,
                Err(e) => {
                    report.failures.push(self.unpriceable(&position, e));
                    continue;
                }
            };
            match self.settle(&position, decision).await {
                Ok(outcome) => report.closes.push(outcome),
                Err(failure) => report.failures.push(failure),
            }
        }
    }
}

fn scan_or_fail(
    scan: Result<Vec<Position>, StoreError>,
    symbol: &Symbol,
    what: &str,
    report: &mut TickReport,
) -> Vec<Position> {
    scan.unwrap_or_else(|e| {
        warn!(symbol = %symbol, "{} scan failed: {}", what, e);
        report.failures.push(PositionFailure {
            order_id: None,
            error: EngineError::Store(e),
        });
        Vec::new()
    })
}
