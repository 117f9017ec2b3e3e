// 6.0: every open and every settlement produces an event. used for the audit trail
// and for anything outside the venue that wants to watch closes happen (metrics,
// notifications). the log is bounded; subscribers get a live broadcast copy.

use crate::position::CloseReason;
use crate::types::{Leverage, OrderId, Price, Quote, Side, Symbol, Timestamp, UserId};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    PositionOpened(PositionOpenedEvent),

    // Settlement events
    PositionSettled(SettlementEvent),
    CloseRaceLost(CloseRaceLostEvent),
    SettlementDeferred(SettlementDeferredEvent),
    SettlementRecovered(SettlementRecoveredEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionOpenedEvent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Price,
    pub quantity: Decimal,
    pub margin: Quote,
    pub leverage: Leverage,
}

/// Emitted once a close has been both recorded and paid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementEvent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub close_reason: CloseReason,
    pub exit_price: Price,
    pub pnl: Quote,
    pub credited_amount: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRaceLostEvent {
    pub order_id: OrderId,
    pub attempted: CloseReason,
}

/// The position is closed but the credit has not landed yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementDeferredEvent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: Quote,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecoveredEvent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: Quote,
    pub attempts: u32,
}

#[derive(Debug)]
struct EventLog {
    events: VecDeque<Event>,
    next_id: u64,
    max_events: usize,
}

/// Shared, bounded event log with a broadcast tap. Cloning shares the log.
#[derive(Debug, Clone)]
pub struct EventBus {
    log: Arc<Mutex<EventLog>>,
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(max_events.clamp(1, 4096));
        Self {
            log: Arc::new(Mutex::new(EventLog {
                events: VecDeque::new(),
                next_id: 1,
                max_events: max_events.max(1),
            })),
            sender,
        }
    }

    pub fn emit(&self, timestamp: Timestamp, payload: EventPayload) -> EventId {
        let event = {
            let mut log = self.log.lock();
            let event = Event::new(EventId(log.next_id), timestamp, payload);
            log.next_id += 1;
            log.events.push_back(event.clone());
            while log.events.len() > log.max_events {
                log.events.pop_front();
            }
            event
        };
        let id = event.id;
        // no subscribers is fine
        let _ = self.sender.send(event);
        id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn recent(&self, count: usize) -> Vec<Event> {
        let log = self.log.lock();
        let start = log.events.len().saturating_sub(count);
        log.events.iter().skip(start).cloned().collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().events.iter().cloned().collect()
    }

    pub fn settlements(&self) -> Vec<SettlementEvent> {
        self.log
            .lock()
            .events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::PositionSettled(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
