// 7.0 config.rs: all settings in one place. engine, gateway, settlement, feed, store.
// 7.1 loaded from a toml file; every section and field falls back to its default.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::engine::EngineConfig;
use crate::gateway::GatewayConfig;
use crate::settlement::SettlementConfig;

// Tick stream settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    // Broadcast buffer; slow subscribers past this lag and drop ticks
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4_096,
        }
    }
}

// Persistence settings. database_url is only read with the postgres feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
        }
    }
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Simulation,
    Production,
}

impl Environment {
    pub fn config(&self) -> VenueConfig {
        match self {
            Environment::Development => VenueConfig::default(),
            Environment::Simulation => VenueConfig::simulation(),
            Environment::Production => VenueConfig::production(),
        }
    }
}

// The complete venue configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VenueConfig {
    pub environment: Environment,
    pub engine: EngineConfig,
    pub gateway: GatewayConfig,
    pub settlement: SettlementConfig,
    pub feed: FeedConfig,
    pub store: StoreConfig,
}

impl VenueConfig {
    // Fast timers and no spread so replayed prices map straight to entries
    pub fn simulation() -> Self {
        let mut config = Self {
            environment: Environment::Simulation,
            ..Self::default()
        };
        config.engine.expiry_sweep_interval_ms = 100;
        config.gateway.spread_bps = 0;
        config.settlement.initial_backoff_ms = 5;
        config.settlement.max_backoff_ms = 1_000;
        config
    }

    // Lower leverage cap and more patient inline settlement
    pub fn production() -> Self {
        let mut config = Self {
            environment: Environment::Production,
            ..Self::default()
        };
        config.gateway.max_leverage = dec!(20);
        config.settlement.inline_attempts = 5;
        config.store.max_connections = 20;
        config
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: VenueConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction = self.engine.liquidation_loss_fraction;
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(ConfigError::invalid(
                "engine.liquidation_loss_fraction",
                "must be in (0, 1]",
            ));
        }
        if self.engine.worker_queue_capacity == 0 {
            return Err(ConfigError::invalid("engine.worker_queue_capacity", "must be positive"));
        }
        if self.engine.max_events == 0 {
            return Err(ConfigError::invalid("engine.max_events", "must be positive"));
        }

        // spread at or above 100% would price sells at zero
        if self.gateway.spread_bps < 0 || self.gateway.spread_bps >= 10_000 {
            return Err(ConfigError::invalid("gateway.spread_bps", "must be in [0, 10000)"));
        }
        if self.gateway.initial_balance < Decimal::ZERO {
            return Err(ConfigError::invalid("gateway.initial_balance", "must not be negative"));
        }
        if self.gateway.max_leverage <= Decimal::ZERO {
            return Err(ConfigError::invalid("gateway.max_leverage", "must be positive"));
        }
        if self.gateway.history_limit == 0 {
            return Err(ConfigError::invalid("gateway.history_limit", "must be positive"));
        }

        if self.settlement.inline_attempts == 0 {
            return Err(ConfigError::invalid("settlement.inline_attempts", "must be at least 1"));
        }
        if self.settlement.initial_backoff_ms > self.settlement.max_backoff_ms {
            return Err(ConfigError::invalid(
                "settlement.initial_backoff_ms",
                "must not exceed max_backoff_ms",
            ));
        }

        if self.feed.channel_capacity == 0 {
            return Err(ConfigError::invalid("feed.channel_capacity", "must be positive"));
        }
        if self.store.max_connections == 0 {
            return Err(ConfigError::invalid("store.max_connections", "must be positive"));
        }

        Ok(())
    }
}

// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: &str) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}
