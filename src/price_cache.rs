//! Latest-price cache.
//!
//! Process-wide map of symbol to last observed price. Only the tick path holds a
//! [`LatestPrices`] and may write; the order gateway gets a [`PriceReader`] that
//! can only take snapshots.

use crate::types::{Price, Symbol, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPrice {
    pub price: Price,
    /// Exchange timestamp of the tick that produced this price.
    pub observed_at: Timestamp,
}

type PriceMap = Arc<RwLock<HashMap<Symbol, CachedPrice>>>;

/// Writer handle. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct LatestPrices {
    inner: PriceMap,
}

impl LatestPrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, symbol: &Symbol, price: Price, observed_at: Timestamp) {
        self.inner
            .write()
            .insert(symbol.clone(), CachedPrice { price, observed_at });
    }

    pub fn get(&self, symbol: &Symbol) -> Option<CachedPrice> {
        self.inner.read().get(symbol).copied()
    }

    pub fn reader(&self) -> PriceReader {
        PriceReader {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Read-only view of the cache.
#[derive(Debug, Clone)]
pub struct PriceReader {
    inner: PriceMap,
}

impl PriceReader {
    pub fn get(&self, symbol: &Symbol) -> Option<CachedPrice> {
        self.inner.read().get(symbol).copied()
    }

    pub fn price(&self, symbol: &Symbol) -> Option<Price> {
        self.get(symbol).map(|cached| cached.price)
    }

    pub fn snapshot(&self) -> HashMap<Symbol, CachedPrice> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
