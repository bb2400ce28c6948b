//! # Flow Controller Configuration
//!
//! Capacity and thresholds are fixed when the controller starts; there is no
//! runtime reconfiguration. The defaults match a PCM stream persisted to an
//! SD card:
//!
//! ```text
//!  0 ─────────────────────────── 30KB ────────── 42KB
//!  │       prefetch cushion       │    headroom   │
//!  └──────────────────────────────┴───────────────┘
//!                          high watermark      capacity
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::DEFAULT_CAPACITY;

/// Occupancy at which prefetching ends and draining starts (30KB)
pub const DEFAULT_HIGH_WATERMARK: usize = 30 * 1024;

/// Largest chunk handed to the sink in one call.
///
/// The sink's natural transfer unit is 240 bytes; six of them per write is a
/// trade-off between call overhead and how long a single write holds the
/// consumer.
pub const DEFAULT_DRAIN_CHUNK_CAP: usize = 240 * 6;

/// How long the consumer waits for data before declaring the buffer dry
pub const DEFAULT_DRAIN_TIMEOUT_MS: u32 = 20;

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("capacity must be non-zero")]
    ZeroCapacity,
    #[error("high watermark {high_watermark} exceeds capacity {capacity}")]
    WatermarkAboveCapacity {
        high_watermark: usize,
        capacity: usize,
    },
    #[error("drain chunk cap must be non-zero")]
    ZeroChunk,
    #[error("drain timeout must be non-zero")]
    ZeroTimeout,
}

/// Configuration for the flow controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Total ring buffer size in bytes
    pub capacity: usize,
    /// Prefetching ends once occupancy reaches this; Dropping ends once
    /// occupancy falls back to it
    pub high_watermark: usize,
    /// Maximum bytes forwarded to the sink per call
    pub drain_chunk_cap: usize,
    /// Bound on each consumer read, in milliseconds
    pub drain_timeout_ms: u32,
}

impl FlowConfig {
    /// Check the values against each other
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.high_watermark > self.capacity {
            return Err(ConfigError::WatermarkAboveCapacity {
                high_watermark: self.high_watermark,
                capacity: self.capacity,
            });
        }
        if self.drain_chunk_cap == 0 {
            return Err(ConfigError::ZeroChunk);
        }
        if self.drain_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    #[inline]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.drain_timeout_ms))
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            drain_chunk_cap: DEFAULT_DRAIN_CHUNK_CAP,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
        }
    }
}
