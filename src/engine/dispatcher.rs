//! Tick dispatch.
//!
//! One sequential worker task per symbol, created on first sight of the symbol.
//! Ticks for a symbol are queued to its worker in arrival order and processed
//! one at a time, so a tick's settlement writes are issued before the next tick
//! for that symbol is evaluated. Different symbols run in parallel.

use super::core::RiskEngine;
use super::results::{EngineError, TickReport};
use crate::feed::PriceTick;
use crate::types::Symbol;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Worker {
    sender: mpsc::Sender<PriceTick>,
    handle: JoinHandle<()>,
}

pub struct TickDispatcher {
    engine: Arc<RiskEngine>,
    workers: HashMap<Symbol, Worker>,
    queue_capacity: usize,
    reports: Option<mpsc::UnboundedSender<TickReport>>,
}

impl TickDispatcher {
    pub fn new(engine: Arc<RiskEngine>) -> Self {
        let queue_capacity = engine.config().worker_queue_capacity.max(1);
        Self {
            engine,
            workers: HashMap::new(),
            queue_capacity,
            reports: None,
        }
    }

    /// Every finished `TickReport` is also sent to `sink`.
    pub fn with_report_sink(mut self, sink: mpsc::UnboundedSender<TickReport>) -> Self {
        self.reports = Some(sink);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue `tick` on its symbol's worker, waiting if the queue is full.
    /// A worker found dead at send time is restarted and the tick resent once.
    pub async fn dispatch(&mut self, tick: PriceTick) -> Result<(), EngineError> {
        let symbol = tick.symbol.clone();
        let sender = self.worker_for(&symbol);
        let Err(mpsc::error::SendError(tick)) = sender.send(tick).await else {
            return Ok(());
        };

        error!(symbol = %symbol, "symbol worker died before taking a tick");
        let sender = self.worker_for(&symbol);
        sender
            .send(tick)
            .await
            .map_err(|_| EngineError::WorkerStopped(symbol))
    }

    fn worker_for(&mut self, symbol: &Symbol) -> mpsc::Sender<PriceTick> {
        if let Some(worker) = self.workers.get(symbol) {
            if !worker.sender.is_closed() {
                return worker.sender.clone();
            }
            error!(symbol = %symbol, "symbol worker stopped, restarting");
        }

        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let handle = tokio::spawn(run_worker(
            symbol.clone(),
            Arc::clone(&self.engine),
            receiver,
            self.reports.clone(),
        ));
        debug!(symbol = %symbol, "symbol worker started");
        self.workers.insert(
            symbol.clone(),
            Worker {
                sender: sender.clone(),
                handle,
            },
        );
        sender
    }

    /// Consume a broadcast tick stream until it closes, then drain the workers.
    /// A symbol whose worker cannot be kept alive loses that tick only.
    pub async fn run(mut self, mut ticks: broadcast::Receiver<PriceTick>) -> Result<(), EngineError> {
        loop {
            match ticks.recv().await {
                Ok(tick) => {
                    if let Err(e) = self.dispatch(tick).await {
                        error!("tick dropped: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "tick stream lagged, ticks dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Close every worker queue and wait for queued ticks to finish.
    pub async fn shutdown(self) {
        let count = self.workers.len();
        let handles: Vec<_> = self
            .workers
            .into_values()
            .map(|worker| {
                drop(worker.sender);
                worker.handle
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("symbol worker ended abnormally: {}", e);
            }
        }
        info!(workers = count, "tick dispatcher stopped");
    }
}

async fn run_worker(
    symbol: Symbol,
    engine: Arc<RiskEngine>,
    mut receiver: mpsc::Receiver<PriceTick>,
    reports: Option<mpsc::UnboundedSender<TickReport>>,
) {
    while let Some(tick) = receiver.recv().await {
        let report = engine.on_tick(&tick).await;
        if let Some(sink) = &reports {
            let _ = sink.send(report);
        }
    }
    debug!(symbol = %symbol, "symbol worker drained");
}
