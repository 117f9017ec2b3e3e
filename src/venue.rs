//! Wiring for a running venue: tick publisher, dispatcher, risk engine,
//! settlement worker, expiry timer and order gateway over one store.

use crate::clock::Clock;
use crate::config::VenueConfig;
use crate::engine::{EngineError, RiskEngine, TickDispatcher};
use crate::events::EventBus;
use crate::feed::TickPublisher;
use crate::gateway::OrderGateway;
use crate::price_cache::PriceReader;
use crate::settlement::SettlementUpdater;
use crate::store::PositionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Venue {
    pub engine: Arc<RiskEngine>,
    pub gateway: OrderGateway,
    pub publisher: TickPublisher,
    pub events: EventBus,
    pub settlement: SettlementUpdater,
    dispatcher: JoinHandle<Result<(), EngineError>>,
    expiry_sweeper: Option<JoinHandle<()>>,
    settlement_worker: JoinHandle<()>,
}

impl Venue {
    /// Start every task on the current runtime. Ticks published on
    /// `publisher` flow to the engine from here on.
    pub fn start(config: VenueConfig, store: Arc<dyn PositionStore>, clock: Arc<dyn Clock>) -> Self {
        let events = EventBus::new(config.engine.max_events);
        let (settlement, settlement_worker) = SettlementUpdater::spawn(
            Arc::clone(&store),
            Arc::clone(&clock),
            events.clone(),
            config.settlement.clone(),
        );

        let engine = Arc::new(RiskEngine::new(
            config.engine.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
            settlement.clone(),
            events.clone(),
        ));
        let gateway = OrderGateway::new(
            config.gateway.clone(),
            store,
            engine.price_reader(),
            settlement.clone(),
            clock,
            events.clone(),
        );

        let publisher = TickPublisher::new(config.feed.channel_capacity);
        let dispatcher = tokio::spawn(TickDispatcher::new(Arc::clone(&engine)).run(publisher.subscribe()));
        let expiry_sweeper = engine.spawn_expiry_sweeper();

        info!(
            environment = ?config.environment,
            sweep_ms = config.engine.expiry_sweep_interval_ms,
            "venue started"
        );

        Self {
            engine,
            gateway,
            publisher,
            events,
            settlement,
            dispatcher,
            expiry_sweeper,
            settlement_worker,
        }
    }

    pub fn prices(&self) -> PriceReader {
        self.engine.price_reader()
    }

    /// Stop the expiry timer, let queued ticks finish and wait for deferred
    /// credits to land.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        if let Some(sweeper) = self.expiry_sweeper {
            sweeper.abort();
        }

        // closing the broadcast channel ends the dispatcher loop
        drop(self.publisher);
        let dispatched = self
            .dispatcher
            .await
            .map_err(|_| EngineError::DispatcherClosed)?;

        let pending = self.settlement.pending_retries();
        if pending > 0 {
            warn!(pending, "waiting for deferred credits before stopping");
            while !self.settlement.wait_for_pending(Duration::from_secs(5)).await {
                warn!(pending = self.settlement.pending_retries(), "deferred credits still outstanding");
            }
        }
        self.settlement_worker.abort();

        info!("venue stopped");
        dispatched
    }
}
