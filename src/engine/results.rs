// 8.0.2: result types and errors for engine operations.

use crate::position::ArithmeticOverflow;
use crate::settlement::CloseOutcome;
use crate::store::StoreError;
use crate::types::{OrderId, Price, Symbol};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cannot price position: {0}")]
    Overflow(#[from] ArithmeticOverflow),

    #[error("Worker for {0} is no longer running")]
    WorkerStopped(Symbol),

    #[error("Dispatcher has shut down")]
    DispatcherClosed,
}

/// A failure isolated to one position (or one store read). The rest of the
/// tick carries on.
#[derive(Debug)]
pub struct PositionFailure {
    pub order_id: Option<OrderId>,
    pub error: EngineError,
}

/// Everything one tick did.
#[derive(Debug)]
pub struct TickReport {
    pub symbol: Symbol,
    pub price: Price,
    /// Active positions checked against thresholds.
    pub evaluated: usize,
    pub closes: Vec<CloseOutcome>,
    pub failures: Vec<PositionFailure>,
}

impl TickReport {
    pub fn new(symbol: Symbol, price: Price) -> Self {
        Self {
            symbol,
            price,
            evaluated: 0,
            closes: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Closes this tick performed (race losses excluded).
    pub fn closed(&self) -> impl Iterator<Item = &CloseOutcome> {
        self.closes.iter().filter(|o| o.is_closed())
    }

    pub fn closed_count(&self) -> usize {
        self.closed().count()
    }

    pub fn races_lost(&self) -> usize {
        self.closes.len() - self.closed_count()
    }
}

/// Result of an all-symbol expiry sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired_found: usize,
    pub closes: Vec<CloseOutcome>,
    /// Symbols with expired positions but no cached price yet.
    pub skipped_symbols: Vec<Symbol>,
    pub failures: Vec<PositionFailure>,
}

impl SweepReport {
    pub fn closed_count(&self) -> usize {
        self.closes.iter().filter(|o| o.is_closed()).count()
    }
}
