use std::time::Duration;

use crate::net::protocol::WireFormat;
use crate::presence::types::Direction;
use crate::util::vec2::Vec2;

/// Errors from [`PresenceConfig::validate`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("movement_threshold must be positive and finite, got {0}")]
    InvalidThreshold(f32),
    #[error("proximity_radius must be positive and finite, got {0}")]
    InvalidRadius(f32),
    #[error("durable_interval must be at least one millisecond")]
    ZeroDurableInterval,
    #[error("tick_interval must be at least one millisecond")]
    ZeroTickInterval,
    #[error("{0} cannot be empty")]
    EmptyName(&'static str),
    #[error("max_name_len must be at least 1")]
    ZeroNameLength,
    #[error("event_capacity must be at least 1")]
    ZeroEventCapacity,
}

/// Presence synchronization configuration
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Per-axis movement (floor-plan units) that makes a sample significant
    pub movement_threshold: f32,
    /// Minimum spacing between throttled durable writes
    pub durable_interval: Duration,
    /// Minimum spacing between movement ticks admitted by the host
    pub tick_interval: Duration,
    /// Radius (world units) for nearest-product detection
    pub proximity_radius: f32,
    /// Ephemeral broadcast channel name
    pub presence_channel: String,
    /// Durable presence table name
    pub presence_table: String,
    /// Payload encoding on the broadcast channel
    pub wire_format: WireFormat,
    /// Floor-plan position announced when a session starts
    pub spawn_position: Vec2,
    /// Facing announced when a session starts
    pub spawn_direction: Direction,
    /// Longest display name accepted from peers
    pub max_name_len: usize,
    /// Capacity of the per-session [`SyncEvent`](crate::presence::events::SyncEvent) channel
    pub event_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            movement_threshold: 2.0,
            durable_interval: Duration::from_millis(5000),
            tick_interval: Duration::from_millis(100),
            proximity_radius: 2.5,
            presence_channel: "store-presence".to_string(),
            presence_table: "user_presence".to_string(),
            wire_format: WireFormat::Binary,
            spawn_position: Vec2::new(400.0, 300.0),
            spawn_direction: Direction::Down,
            max_name_len: 32,
            event_capacity: 256,
        }
    }
}

impl PresenceConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(threshold) = std::env::var("PRESENCE_MOVE_THRESHOLD") {
            match threshold.parse::<f32>() {
                Ok(parsed) if parsed > 0.0 && parsed.is_finite() => {
                    config.movement_threshold = parsed;
                }
                _ => tracing::warn!(
                    "Invalid PRESENCE_MOVE_THRESHOLD '{}', using default",
                    threshold
                ),
            }
        }

        if let Ok(interval) = std::env::var("PRESENCE_DB_INTERVAL_MS") {
            match interval.parse::<u64>() {
                Ok(parsed) if parsed > 0 => {
                    config.durable_interval = Duration::from_millis(parsed);
                }
                _ => tracing::warn!(
                    "Invalid PRESENCE_DB_INTERVAL_MS '{}', using default",
                    interval
                ),
            }
        }

        if let Ok(tick) = std::env::var("PRESENCE_TICK_MS") {
            match tick.parse::<u64>() {
                Ok(parsed) if parsed > 0 => {
                    config.tick_interval = Duration::from_millis(parsed);
                }
                _ => tracing::warn!("Invalid PRESENCE_TICK_MS '{}', using default", tick),
            }
        }

        if let Ok(radius) = std::env::var("PRESENCE_PROXIMITY_RADIUS") {
            match radius.parse::<f32>() {
                Ok(parsed) if parsed > 0.0 && parsed.is_finite() => {
                    config.proximity_radius = parsed;
                }
                _ => tracing::warn!(
                    "Invalid PRESENCE_PROXIMITY_RADIUS '{}', using default",
                    radius
                ),
            }
        }

        if let Ok(channel) = std::env::var("PRESENCE_CHANNEL") {
            if !channel.is_empty() {
                config.presence_channel = channel;
            } else {
                tracing::warn!("PRESENCE_CHANNEL is empty, using default");
            }
        }

        if let Ok(table) = std::env::var("PRESENCE_TABLE") {
            if !table.is_empty() {
                config.presence_table = table;
            } else {
                tracing::warn!("PRESENCE_TABLE is empty, using default");
            }
        }

        if let Ok(format) = std::env::var("PRESENCE_WIRE_FORMAT") {
            match format.parse::<WireFormat>() {
                Ok(parsed) => config.wire_format = parsed,
                Err(_) => tracing::warn!(
                    "Invalid PRESENCE_WIRE_FORMAT '{}', using default",
                    format
                ),
            }
        }

        if let Ok(max_len) = std::env::var("PRESENCE_MAX_NAME_LEN") {
            match max_len.parse::<usize>() {
                Ok(parsed) if parsed > 0 && parsed <= 256 => config.max_name_len = parsed,
                _ => tracing::warn!("PRESENCE_MAX_NAME_LEN must be 1-256, using default"),
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.movement_threshold > 0.0 && self.movement_threshold.is_finite()) {
            return Err(ConfigError::InvalidThreshold(self.movement_threshold));
        }
        if !(self.proximity_radius > 0.0 && self.proximity_radius.is_finite()) {
            return Err(ConfigError::InvalidRadius(self.proximity_radius));
        }
        if self.durable_interval.as_millis() == 0 {
            return Err(ConfigError::ZeroDurableInterval);
        }
        if self.tick_interval.as_millis() == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.presence_channel.is_empty() {
            return Err(ConfigError::EmptyName("presence_channel"));
        }
        if self.presence_table.is_empty() {
            return Err(ConfigError::EmptyName("presence_table"));
        }
        if self.max_name_len == 0 {
            return Err(ConfigError::ZeroNameLength);
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroEventCapacity);
        }
        Ok(())
    }

    /// Durable write interval in milliseconds
    pub fn durable_interval_ms(&self) -> u64 {
        self.durable_interval.as_millis() as u64
    }
}
