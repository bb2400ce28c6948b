//! # PCM Flow Control Library
//!
//! This crate provides the core of the PCM spool: a bridge between a bursty
//! producer that must never block and a slow sink that blocks a lot.
//!
//! - **Ring Buffer**: Fixed-capacity SPSC byte queue with zero-copy reads
//! - **Flow Controller**: Processing / Prefetching / Dropping watermark modes
//! - **Sink Trait**: Abstraction for wherever drained bytes end up
//!
//! ## Architecture
//!
//! ```text
//! receive callback ──submit()──► RingBuffer ──Chunk──► consumer task ──► Sink
//!                      │              ▲                     ▲
//!                 drop on overflow    │                     │
//!                                occupancy ──────────► wake signal
//!                                (watermarks)          (single slot)
//! ```
//!
//! ## Overload Strategy
//!
//! The producer is never slowed down. When the buffer saturates, incoming
//! packets are discarded until the consumer has brought occupancy back down
//! to the high watermark. When the buffer runs dry, the consumer idles until
//! a fresh cushion has been prefetched.

pub mod buffer;
pub mod config;
pub mod controller;
pub mod mode;
pub mod sink;

// Re-export main types for convenience
pub use buffer::{BufferError, Chunk, RingBuffer, DEFAULT_CAPACITY};
pub use config::{ConfigError, FlowConfig};
pub use controller::{DrainStep, FlowController, FlowCore, FlowError, FlowStats};
pub use mode::Mode;
pub use sink::{MemorySink, Sink, SinkError, SinkResult};

/// Library version, logged by hosts at start-up
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
