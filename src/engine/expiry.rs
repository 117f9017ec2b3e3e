//! All-symbol expiry sweep.
//!
//! The tick path only expires positions on the symbol that ticked. This sweep
//! runs on a timer and covers every symbol, pricing each expired position at its
//! symbol's cached price. Symbols that have never ticked are skipped until they
//! do. A position closed by both paths is settled once; the conditional close
//! decides which one wins.

use super::core::RiskEngine;
use super::results::{EngineError, PositionFailure, SweepReport};
use crate::position::{CloseReason, Position};
use crate::risk::CloseDecision;
use crate::types::Symbol;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

impl RiskEngine {
    pub async fn sweep_expired(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.clock.now();

        let expired = match self.store.expired_positions(None, now).await {
            Ok(expired) => expired,
            Err(e) => {
                warn!("expiry sweep scan failed: {}", e);
                report.failures.push(PositionFailure {
                    order_id: None,
                    error: EngineError::Store(e),
                });
                return report;
            }
        };
        report.expired_found = expired.len();

        let mut by_symbol: BTreeMap<Symbol, Vec<Position>> = BTreeMap::new();
        for position in expired {
            by_symbol.entry(position.symbol.clone()).or_default().push(position);
        }

        for (symbol, positions) in by_symbol {
            let Some(cached) = self.prices.get(&symbol) else {
                debug!(symbol = %symbol, count = positions.len(), "no price yet, expiry deferred");
                report.skipped_symbols.push(symbol);
                continue;
            };
            for position in positions {
                let decision = match CloseDecision::at(&position, CloseReason::Expired, cached.price) {
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

        if report.expired_found > 0 {
            info!(
                found = report.expired_found,
                closed = report.closed_count(),
                skipped_symbols = report.skipped_symbols.len(),
                "expiry sweep"
            );
        }
        report
    }

    /// Starts the periodic sweep. `None` when the interval is configured as 0.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval_ms = self.config.expiry_sweep_interval_ms;
        if interval_ms == 0 {
            return None;
        }
        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                engine.sweep_expired().await;
            }
        }))
    }
}
