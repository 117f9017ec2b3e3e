// 5.0 settlement.rs: turns a close decision into a recorded close and a paid balance.
//
// order of writes is fixed: conditional status transition first, credit second. only
// the call that wins the transition credits. a credit that keeps failing after the
// transition is a settlement inconsistency: it is logged at error, handed to a
// background queue and retried with capped exponential backoff until it lands.
// each deferred credit retries on its own task, so one credit that never lands
// does not hold up the others.

use crate::clock::Clock;
use crate::events::{
    CloseRaceLostEvent, EventBus, EventPayload, SettlementDeferredEvent, SettlementEvent,
    SettlementRecoveredEvent,
};
use crate::position::{CloseReason, Position};
use crate::risk::CloseDecision;
use crate::store::{PositionStore, StoreError};
use crate::types::{OrderId, Quote, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Credit attempts made on the tick path before deferring.
    pub inline_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            inline_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 30_000,
        }
    }
}

impl SettlementConfig {
    /// Delay before retry number `attempt` (1-based), doubling and capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// What happened to one close attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// Transition recorded and balance credited.
    Settled {
        decision: CloseDecision,
        user_id: UserId,
        attempts: u32,
    },
    /// Transition recorded, credit handed to the retry queue.
    Deferred {
        decision: CloseDecision,
        user_id: UserId,
    },
    /// Another path closed the position first. Nothing was written.
    RaceLost {
        order_id: OrderId,
        attempted: CloseReason,
    },
}

impl CloseOutcome {
    pub fn order_id(&self) -> OrderId {
        match self {
            CloseOutcome::Settled { decision, .. } | CloseOutcome::Deferred { decision, .. } => {
                decision.order_id
            }
            CloseOutcome::RaceLost { order_id, .. } => *order_id,
        }
    }

    /// True when this call performed the status transition.
    pub fn is_closed(&self) -> bool {
        !matches!(self, CloseOutcome::RaceLost { .. })
    }

    pub fn decision(&self) -> Option<&CloseDecision> {
        match self {
            CloseOutcome::Settled { decision, .. } | CloseOutcome::Deferred { decision, .. } => {
                Some(decision)
            }
            CloseOutcome::RaceLost { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingCredit {
    decision: CloseDecision,
    user_id: UserId,
    attempts: u32,
}

#[derive(Clone)]
pub struct SettlementUpdater {
    store: Arc<dyn PositionStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: SettlementConfig,
    retry_tx: mpsc::UnboundedSender<PendingCredit>,
    pending: Arc<AtomicUsize>,
}

impl std::fmt::Debug for SettlementUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementUpdater")
            .field("config", &self.config)
            .field("pending", &self.pending_retries())
            .finish()
    }
}

impl SettlementUpdater {
    /// Builds the updater and starts its retry worker on the current runtime.
    /// The worker stops once every clone of the updater is dropped and the queue
    /// is empty.
    pub fn spawn(
        store: Arc<dyn PositionStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: SettlementConfig,
    ) -> (Self, JoinHandle<()>) {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let retries = RetryQueue {
            store: Arc::clone(&store),
            clock: Arc::clone(&clock),
            events: events.clone(),
            config: config.clone(),
            pending: Arc::clone(&pending),
        };
        let worker = tokio::spawn(retries.run(retry_rx));
        let updater = Self {
            store,
            clock,
            events,
            config,
            retry_tx,
            pending,
        };
        (updater, worker)
    }

    /// Credits queued for background retry and not yet applied.
    pub fn pending_retries(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Polls until the retry queue is empty or `timeout` passes.
    pub async fn wait_for_pending(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending_retries() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Conditional close followed, only on success, by the credit. The same
    /// `decision` values are written to the position and paid out.
    pub async fn close_and_settle(
        &self,
        position: &Position,
        decision: CloseDecision,
    ) -> Result<CloseOutcome, StoreError> {
        let moved = self
            .store
            .conditional_close(decision.order_id, decision.reason, decision.exit_price, decision.pnl)
            .await?;

        if !moved {
            info!(order_id = %decision.order_id, reason = %decision.reason, "close race lost");
            self.events.emit(
                self.clock.now(),
                EventPayload::CloseRaceLost(CloseRaceLostEvent {
                    order_id: decision.order_id,
                    attempted: decision.reason,
                }),
            );
            return Ok(CloseOutcome::RaceLost {
                order_id: decision.order_id,
                attempted: decision.reason,
            });
        }

        Ok(self.credit(position.user_id, decision).await)
    }

    async fn credit(&self, user_id: UserId, decision: CloseDecision) -> CloseOutcome {
        let attempts_allowed = self.config.inline_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts_allowed {
            match self.store.credit_balance(user_id, decision.credited).await {
                Ok(()) => {
                    info!(
                        order_id = %decision.order_id,
                        user_id = %user_id,
                        reason = %decision.reason,
                        exit_price = %decision.exit_price,
                        pnl = %decision.pnl,
                        credited = %decision.credited,
                        "position settled"
                    );
                    emit_settled(&self.events, self.clock.now(), user_id, &decision);
                    return CloseOutcome::Settled {
                        decision,
                        user_id,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    warn!(order_id = %decision.order_id, attempt, "credit failed: {}", e);
                    last_error = Some(e);
                    if attempt < attempts_allowed {
                        tokio::time::sleep(self.config.backoff(attempt)).await;
                    }
                }
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        error!(
            order_id = %decision.order_id,
            user_id = %user_id,
            amount = %decision.credited,
            attempts = attempts_allowed,
            "settlement inconsistency: position closed but credit failed: {}",
            reason
        );
        self.events.emit(
            self.clock.now(),
            EventPayload::SettlementDeferred(SettlementDeferredEvent {
                order_id: decision.order_id,
                user_id,
                amount: decision.credited,
                attempts: attempts_allowed,
                error: reason,
            }),
        );

        self.pending.fetch_add(1, Ordering::SeqCst);
        let pending = PendingCredit {
            decision: decision.clone(),
            user_id,
            attempts: attempts_allowed,
        };
        if self.retry_tx.send(pending).is_err() {
            // worker gone (runtime shutting down); the counter stays raised so the
            // unpaid credit is still visible
            error!(order_id = %decision.order_id, "settlement retry queue closed");
        }
        CloseOutcome::Deferred { decision, user_id }
    }
}

fn emit_settled(events: &EventBus, now: Timestamp, user_id: UserId, decision: &CloseDecision) {
    events.emit(
        now,
        EventPayload::PositionSettled(SettlementEvent {
            order_id: decision.order_id,
            user_id,
            close_reason: decision.reason,
            exit_price: decision.exit_price,
            pnl: decision.pnl,
            credited_amount: decision.credited,
        }),
    );
}

/// Background side of the updater: owns one retry task per deferred credit.
#[derive(Clone)]
struct RetryQueue {
    store: Arc<dyn PositionStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: SettlementConfig,
    pending: Arc<AtomicUsize>,
}

impl RetryQueue {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PendingCredit>) {
        // dropping the set (worker aborted) aborts every retry still running
        let mut retries = JoinSet::new();
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(credit) => {
                        retries.spawn(self.clone().retry_until_applied(credit));
                    }
                    None => break,
                },
                Some(_) = retries.join_next(), if !retries.is_empty() => {}
            }
        }
        while retries.join_next().await.is_some() {}
    }

    async fn retry_until_applied(self, mut credit: PendingCredit) {
        loop {
            tokio::time::sleep(self.config.backoff(credit.attempts)).await;
            credit.attempts += 1;
            match self.store.credit_balance(credit.user_id, credit.decision.credited).await {
                Ok(()) => {
                    info!(
                        order_id = %credit.decision.order_id,
                        attempts = credit.attempts,
                        "deferred credit applied"
                    );
                    self.events.emit(
                        self.clock.now(),
                        EventPayload::SettlementRecovered(SettlementRecoveredEvent {
                            order_id: credit.decision.order_id,
                            user_id: credit.user_id,
                            amount: credit.decision.credited,
                            attempts: credit.attempts,
                        }),
                    );
                    emit_settled(&self.events, self.clock.now(), credit.user_id, &credit.decision);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    error!(
                        order_id = %credit.decision.order_id,
                        attempts = credit.attempts,
                        "settlement inconsistency persists: {}",
                        e
                    );
                }
            }
        }
    }
}

/// Sum of credits that have not been applied yet, for operator reporting.
pub fn outstanding(outcomes: &[CloseOutcome]) -> Quote {
    outcomes
        .iter()
        .filter_map(|o| match o {
            CloseOutcome::Deferred { decision, .. } => Some(decision.credited),
            _ => None,
        })
        .sum()
}
