//! In-process store. One mutex guards users and positions together, which is
//! the atomicity boundary for debit+insert and for the conditional close.

use super::{PositionQuery, PositionStore, StoreError};
use crate::position::{ArithmeticOverflow, CloseReason, NewPosition, Position};
use crate::types::{OrderId, Price, Quote, Symbol, Timestamp, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default)]
struct State {
    balances: HashMap<UserId, Quote>,
    positions: BTreeMap<OrderId, Position>,
    active_by_symbol: HashMap<Symbol, BTreeSet<OrderId>>,
    next_user_id: u64,
    next_order_id: u64,
}

impl State {
    fn positions_for<'a>(&'a self, ids: impl Iterator<Item = &'a OrderId>) -> Vec<Position> {
        ids.filter_map(|id| self.positions.get(id)).cloned().collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every position ever opened, in id order.
    pub fn all_positions(&self) -> Vec<Position> {
        self.state.lock().positions.values().cloned().collect()
    }

    pub fn total_balances(&self) -> Quote {
        self.state.lock().balances.values().sum()
    }
}

#[async_trait]
impl PositionStore for InMemoryStore {
    async fn create_user(&self, initial_balance: Quote) -> Result<UserId, StoreError> {
        let mut state = self.state.lock();
        state.next_user_id += 1;
        let id = UserId(state.next_user_id);
        state.balances.insert(id, initial_balance);
        Ok(id)
    }

    async fn balance(&self, user_id: UserId) -> Result<Quote, StoreError> {
        self.state
            .lock()
            .balances
            .get(&user_id)
            .copied()
            .ok_or(StoreError::UserNotFound(user_id))
    }

    async fn create_position(&self, new: NewPosition) -> Result<Position, StoreError> {
        let mut state = self.state.lock();

        let available = *state
            .balances
            .get(&new.user_id)
            .ok_or(StoreError::UserNotFound(new.user_id))?;
        if new.margin > available {
            return Err(StoreError::InsufficientBalance {
                requested: new.margin,
                available,
            });
        }

        let user_id = new.user_id;
        let id = OrderId(state.next_order_id + 1);
        let position = new.into_position(id)?;
        state.next_order_id = id.0;
        state.balances.insert(user_id, available.sub(position.margin));

        state
            .active_by_symbol
            .entry(position.symbol.clone())
            .or_default()
            .insert(id);
        state.positions.insert(id, position.clone());
        Ok(position)
    }

    async fn position(&self, id: OrderId) -> Result<Option<Position>, StoreError> {
        Ok(self.state.lock().positions.get(&id).cloned())
    }

    async fn active_positions(&self, symbol: &Symbol) -> Result<Vec<Position>, StoreError> {
        let state = self.state.lock();
        Ok(match state.active_by_symbol.get(symbol) {
            Some(ids) => state.positions_for(ids.iter()),
            None => Vec::new(),
        })
    }

    async fn expired_positions(
        &self,
        symbol: Option<&Symbol>,
        now: Timestamp,
    ) -> Result<Vec<Position>, StoreError> {
        let state = self.state.lock();
        let mut expired: Vec<Position> = match symbol {
            Some(symbol) => match state.active_by_symbol.get(symbol) {
                Some(ids) => state.positions_for(ids.iter()),
                None => Vec::new(),
            },
            None => state
                .active_by_symbol
                .values()
                .flat_map(|ids| ids.iter())
                .filter_map(|id| state.positions.get(id))
                .cloned()
                .collect(),
        };
        expired.retain(|p| p.is_expired(now));
        Ok(expired)
    }

    async fn conditional_close(
        &self,
        id: OrderId,
        reason: CloseReason,
        exit_price: Price,
        pnl: Quote,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let Some(position) = state.positions.get_mut(&id) else {
            return Ok(false);
        };
        if !position.apply_close(reason, exit_price, pnl) {
            return Ok(false);
        }
        let symbol = position.symbol.clone();
        if let Some(ids) = state.active_by_symbol.get_mut(&symbol) {
            ids.remove(&id);
            if ids.is_empty() {
                state.active_by_symbol.remove(&symbol);
            }
        }
        Ok(true)
    }

    async fn credit_balance(&self, user_id: UserId, amount: Quote) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let balance = state
            .balances
            .get_mut(&user_id)
            .ok_or(StoreError::UserNotFound(user_id))?;
        *balance = balance.checked_add(amount).ok_or(ArithmeticOverflow("balance"))?;
        Ok(())
    }

    async fn user_positions(
        &self,
        user_id: UserId,
        query: PositionQuery,
    ) -> Result<Vec<Position>, StoreError> {
        let state = self.state.lock();
        if !state.balances.contains_key(&user_id) {
            return Err(StoreError::UserNotFound(user_id));
        }
        // ids are allocated in creation order, so reverse id order is newest first
        let owned = state.positions.values().rev().filter(|p| p.user_id == user_id);
        Ok(match query {
            PositionQuery::Active => owned.filter(|p| p.is_active()).cloned().collect(),
            PositionQuery::History { limit } => owned
                .filter(|p| p.status.is_terminal())
                .take(limit)
                .cloned()
                .collect(),
        })
    }
}
