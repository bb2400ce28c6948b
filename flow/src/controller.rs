//! # Watermark Flow Controller
//!
//! Layers a three-mode state machine over the [`RingBuffer`] so that a bursty
//! producer never blocks and a slow sink only starts draining once a cushion
//! of data has been buffered.
//!
//! ## State Machine
//!
//! ```text
//!                  occupancy >= high (wake consumer)
//!   ┌─────────────┐ ─────────────────────────────► ┌────────────┐
//!   │ PREFETCHING │                                │ PROCESSING │
//!   └─────────────┘ ◄───────────────────────────── └────────────┘
//!          ▲            consumer read timed out          │   ▲
//!          │                                  write failed│   │occupancy <= high
//!          │         consumer read timed out             ▼   │
//!          └─────────────────────────────────────── ┌──────────┐
//!                                                   │ DROPPING │
//!                                                   └──────────┘
//! ```
//!
//! The gap between "drained to empty" (re-arm) and "filled to the high
//! watermark" (resume) keeps the consumer from chattering at the boundary,
//! and Dropping is only left once occupancy has receded to the same high
//! watermark.
//!
//! ## Execution Contexts
//!
//! - **Producer**: calls [`FlowController::submit`] from any thread. The call
//!   is synchronous, bounded and never parks.
//! - **Consumer**: a single tokio task that sleeps on a single-slot wake
//!   signal, then drains chunks into the [`Sink`] until the buffer runs dry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::buffer::{BufferError, RingBuffer};
use crate::config::{ConfigError, FlowConfig};
use crate::mode::{AtomicMode, Mode};
use crate::sink::Sink;

/// Errors that prevent the controller from starting
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid flow configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("ring buffer setup failed: {0}")]
    Buffer(#[from] BufferError),
    #[error("no tokio runtime available to host the consumer task")]
    NoRuntime,
}

/// Outcome of a single consumer iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DrainStep {
    /// A chunk of this many bytes was offered to the sink and released
    Forwarded(usize),
    /// The buffer ran dry; the controller is back in Prefetching
    Rearmed,
    /// The buffer ran dry but refilled past the high watermark before the
    /// consumer went to sleep, so draining continues
    Resumed,
}

/// Statistics about the flow controller
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlowStats {
    /// Bytes accepted into the buffer
    pub admitted_bytes: u64,
    /// Bytes discarded at admission
    pub dropped_bytes: u64,
    /// Packets discarded at admission
    pub dropped_packets: u64,
    /// Number of times the controller entered Dropping
    pub overflows: u64,
    /// Number of times the consumer found the buffer dry
    pub underflows: u64,
    /// Bytes the sink reported as persisted
    pub forwarded_bytes: u64,
    /// Sink writes that returned an error
    pub sink_errors: u64,
    /// Bytes released from the buffer that the sink did not persist
    pub lost_bytes: u64,
    /// Current buffer usage (bytes)
    pub buffer_used: usize,
}

#[derive(Debug, Default)]
struct Counters {
    admitted_bytes: AtomicU64,
    dropped_bytes: AtomicU64,
    dropped_packets: AtomicU64,
    overflows: AtomicU64,
    underflows: AtomicU64,
    forwarded_bytes: AtomicU64,
    sink_errors: AtomicU64,
    lost_bytes: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, value: usize) {
        counter.fetch_add(value as u64, Ordering::Relaxed);
    }
}

/// Buffer, mode and wake signal of one flow-controlled stream
///
/// [`FlowController`] drives this with a spawned consumer task. It can also be
/// driven by hand, one [`FlowCore::drain_step`] at a time, which is how the
/// state machine is tested deterministically.
#[derive(Debug)]
pub struct FlowCore {
    config: FlowConfig,
    buffer: RingBuffer,
    mode: AtomicMode,
    wake: Notify,
    counters: Counters,
}

impl FlowCore {
    /// Validate `config` and allocate the buffer, starting in Prefetching
    pub fn new(config: FlowConfig) -> Result<Self, FlowError> {
        config.validate()?;
        let buffer = RingBuffer::new(config.capacity)?;

        info!(
            "ring buffer of {} bytes ready (high watermark {}), mode: {}",
            config.capacity,
            config.high_watermark,
            Mode::Prefetching
        );

        Ok(Self {
            config,
            buffer,
            mode: AtomicMode::new(Mode::Prefetching),
            wake: Notify::new(),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }

    pub fn mode(&self) -> Mode {
        self.mode.load()
    }

    pub fn occupancy(&self) -> usize {
        self.buffer.occupancy()
    }

    /// Offer a packet from the producer
    ///
    /// Returns `data.len()` if the whole packet was buffered and 0 if it was
    /// dropped. Never blocks.
    ///
    /// An overflow while Prefetching wakes the consumer even though occupancy
    /// may still be below the high watermark: a packet larger than the free
    /// space saturates the buffer without ever crossing the threshold, and
    /// draining is the only way out of Dropping.
    pub fn submit(&self, data: &[u8]) -> usize {
        if self.mode.load() == Mode::Dropping {
            warn!("ring buffer is full, drop this packet ({} bytes)", data.len());
            self.count_drop(data.len());
            self.leave_dropping();
            return 0;
        }

        match self.buffer.try_write(data) {
            Ok(()) => {
                Counters::add(&self.counters.admitted_bytes, data.len());
                self.end_prefetch();
                data.len()
            }
            Err(BufferError::Overflow) => {
                self.count_drop(data.len());
                let previous = self.mode.swap(Mode::Dropping);
                if previous != Mode::Dropping {
                    Counters::add(&self.counters.overflows, 1);
                    warn!(
                        "ring buffer overflowed at {} bytes, mode changed: {}",
                        self.buffer.occupancy(),
                        Mode::Dropping
                    );
                }
                // Drains below the high watermark; see above.
                if previous == Mode::Prefetching {
                    self.wake.notify_one();
                }
                0
            }
            Err(err) => {
                warn!("packet of {} bytes not buffered: {}", data.len(), err);
                self.count_drop(data.len());
                0
            }
        }
    }

    fn count_drop(&self, len: usize) {
        Counters::add(&self.counters.dropped_bytes, len);
        Counters::add(&self.counters.dropped_packets, 1);
    }

    fn end_prefetch(&self) {
        if self.mode.load() != Mode::Prefetching {
            return;
        }
        let occupancy = self.buffer.occupancy();
        if occupancy >= self.config.high_watermark
            && self.mode.transition(Mode::Prefetching, Mode::Processing)
        {
            info!(
                "ring buffer data increased to {} bytes, mode changed: {}",
                occupancy,
                Mode::Processing
            );
            self.wake.notify_one();
        }
    }

    fn leave_dropping(&self) -> bool {
        let occupancy = self.buffer.occupancy();
        if occupancy <= self.config.high_watermark
            && self.mode.transition(Mode::Dropping, Mode::Processing)
        {
            info!(
                "ring buffer data decreased to {} bytes, mode changed: {}",
                occupancy,
                Mode::Processing
            );
            return true;
        }
        false
    }

    /// Run one consumer iteration: read, forward, release
    pub async fn drain_step<S: Sink>(&self, sink: &mut S) -> DrainStep {
        let chunk = self
            .buffer
            .read_upto(self.config.drain_chunk_cap, self.config.drain_timeout())
            .await;

        let Some(chunk) = chunk else {
            return self.rearm_prefetch();
        };

        let len = chunk.len();
        self.forward(sink, chunk.as_bytes()).await;
        chunk.release();

        self.leave_dropping();
        DrainStep::Forwarded(len)
    }

    /// Drain until the buffer runs dry and Prefetching is re-armed
    pub async fn drain<S: Sink>(&self, sink: &mut S) {
        while self.drain_step(sink).await != DrainStep::Rearmed {}
    }

    async fn forward<S: Sink>(&self, sink: &mut S, data: &[u8]) {
        let len = data.len();
        match sink.write_bytes(data).await {
            Ok(written) => {
                let written = written.min(len);
                Counters::add(&self.counters.forwarded_bytes, written);
                if written < len {
                    Counters::add(&self.counters.lost_bytes, len - written);
                    warn!("sink persisted {} of {} bytes, rest dropped", written, len);
                } else {
                    debug!("forwarded {} bytes", len);
                }
            }
            Err(err) => {
                Counters::add(&self.counters.sink_errors, 1);
                Counters::add(&self.counters.lost_bytes, len);
                warn!("sink write of {} bytes failed, data dropped: {}", len, err);
            }
        }
    }

    fn rearm_prefetch(&self) -> DrainStep {
        let previous = self.mode.swap(Mode::Prefetching);
        Counters::add(&self.counters.underflows, 1);
        if previous != Mode::Prefetching {
            info!("ring buffer underflowed! mode changed: {}", Mode::Prefetching);
        }

        // The producer may have refilled the buffer between the timed-out read
        // and the swap; it saw Processing then and sent no wake.
        if self.buffer.occupancy() >= self.config.high_watermark
            && self.mode.transition(Mode::Prefetching, Mode::Processing)
        {
            info!("ring buffer refilled during underflow, mode changed: {}", Mode::Processing);
            return DrainStep::Resumed;
        }
        DrainStep::Rearmed
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> FlowStats {
        let c = &self.counters;
        FlowStats {
            admitted_bytes: c.admitted_bytes.load(Ordering::Relaxed),
            dropped_bytes: c.dropped_bytes.load(Ordering::Relaxed),
            dropped_packets: c.dropped_packets.load(Ordering::Relaxed),
            overflows: c.overflows.load(Ordering::Relaxed),
            underflows: c.underflows.load(Ordering::Relaxed),
            forwarded_bytes: c.forwarded_bytes.load(Ordering::Relaxed),
            sink_errors: c.sink_errors.load(Ordering::Relaxed),
            lost_bytes: c.lost_bytes.load(Ordering::Relaxed),
            buffer_used: self.buffer.occupancy(),
        }
    }
}

async fn run_consumer<S: Sink>(core: Arc<FlowCore>, mut sink: S) {
    debug!("consumer task started");
    loop {
        core.wake.notified().await;
        debug!("consumer woken at {} bytes", core.occupancy());
        core.drain(&mut sink).await;
    }
}

/// A running flow-controlled stream: the core plus its consumer task
///
/// # Example
///
/// ```rust
/// use pcm_flow::{FlowConfig, FlowController, MemorySink, Mode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let controller = FlowController::start_up(FlowConfig::default(), MemorySink::default()).unwrap();
///
/// assert_eq!(controller.mode(), Mode::Prefetching);
/// assert_eq!(controller.submit(&[0u8; 512]), 512);
///
/// controller.shut_down();
/// # }
/// ```
#[derive(Debug)]
pub struct FlowController {
    core: Arc<FlowCore>,
    consumer: JoinHandle<()>,
}

impl FlowController {
    /// Allocate the buffer and spawn the consumer on the current tokio runtime
    pub fn start_up<S: Sink>(config: FlowConfig, sink: S) -> Result<Self, FlowError> {
        let handle = Handle::try_current().map_err(|_| {
            error!("flow controller start-up failed: {}", FlowError::NoRuntime);
            FlowError::NoRuntime
        })?;
        Self::start_up_on(&handle, config, sink)
    }

    /// Like [`FlowController::start_up`], spawning on an explicit runtime
    pub fn start_up_on<S: Sink>(
        handle: &Handle,
        config: FlowConfig,
        sink: S,
    ) -> Result<Self, FlowError> {
        let core = FlowCore::new(config).map_err(|e| {
            error!("flow controller start-up failed: {}", e);
            e
        })?;
        let core = Arc::new(core);
        let consumer = handle.spawn(run_consumer(Arc::clone(&core), sink));

        info!("flow controller started");
        Ok(Self { core, consumer })
    }

    /// Offer a packet; see [`FlowCore::submit`]
    #[inline]
    pub fn submit(&self, data: &[u8]) -> usize {
        self.core.submit(data)
    }

    pub fn mode(&self) -> Mode {
        self.core.mode()
    }

    pub fn occupancy(&self) -> usize {
        self.core.occupancy()
    }

    pub fn stats(&self) -> FlowStats {
        self.core.stats()
    }

    pub fn config(&self) -> &FlowConfig {
        self.core.config()
    }

    /// Stop the consumer task and release the buffer
    ///
    /// Nothing still buffered is drained.
    pub fn shut_down(self) {}
}

impl Drop for FlowController {
    fn drop(&mut self) {
        self.consumer.abort();
        info!(
            "flow controller shut down with {} bytes undrained",
            self.core.occupancy()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, SinkError, SinkResult};
    use std::sync::Mutex;
    use std::time::Duration;

    fn small_config(capacity: usize, high_watermark: usize, drain_chunk_cap: usize) -> FlowConfig {
        FlowConfig {
            capacity,
            high_watermark,
            drain_chunk_cap,
            drain_timeout_ms: 5,
        }
    }

    struct FailingSink;

    impl Sink for FailingSink {
        async fn write_bytes(&mut self, _data: &[u8]) -> SinkResult<usize> {
            Err(SinkError::Closed)
        }
    }

    struct HalfSink;

    impl Sink for HalfSink {
        async fn write_bytes(&mut self, data: &[u8]) -> SinkResult<usize> {
            Ok(data.len() / 2)
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Sink for SharedSink {
        async fn write_bytes(&mut self, data: &[u8]) -> SinkResult<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
    }

    async fn woken(core: &FlowCore) -> bool {
        tokio::time::timeout(Duration::from_millis(10), core.wake.notified())
            .await
            .is_ok()
    }

    #[test]
    fn test_starts_in_prefetching() {
        let core = FlowCore::new(FlowConfig::default()).unwrap();
        assert_eq!(core.mode(), Mode::Prefetching);
        assert_eq!(core.occupancy(), 0);
        assert_eq!(core.stats(), FlowStats::default());
    }

    #[tokio::test]
    async fn test_watermark_scenario() {
        let core = FlowCore::new(small_config(10, 6, 6)).unwrap();
        let mut sink = MemorySink::default();

        assert_eq!(core.submit(&[1; 4]), 4);
        assert_eq!(core.mode(), Mode::Prefetching);
        assert_eq!(core.submit(&[2; 4]), 4);
        assert_eq!(core.mode(), Mode::Processing);
        assert!(woken(&core).await);

        // Needs 5, only 2 free
        assert_eq!(core.submit(&[3; 5]), 0);
        assert_eq!(core.mode(), Mode::Dropping);

        assert_eq!(core.drain_step(&mut sink).await, DrainStep::Forwarded(6));
        assert_eq!(core.occupancy(), 2);
        assert_eq!(core.mode(), Mode::Processing);

        assert_eq!(core.submit(&[4; 3]), 3);
        assert_eq!(core.occupancy(), 5);
        assert_eq!(sink.data, [1, 1, 1, 1, 2, 2]);
    }

    #[test]
    fn test_no_partial_admission() {
        let core = FlowCore::new(small_config(10, 10, 10)).unwrap();
        assert_eq!(core.submit(&[1; 8]), 8);
        assert_eq!(core.submit(&[9; 5]), 0);
        assert_eq!(core.occupancy(), 8);

        let chunk = core.buffer().try_read_upto(10).unwrap();
        assert_eq!(chunk.as_bytes(), &[1; 8]);
    }

    #[tokio::test]
    async fn test_dropping_holds_until_high_watermark() {
        let core = FlowCore::new(small_config(10, 6, 1)).unwrap();
        let mut sink = MemorySink::default();

        core.submit(&[1; 8]);
        assert_eq!(core.submit(&[1; 3]), 0);
        assert_eq!(core.mode(), Mode::Dropping);

        // Would fit, but Dropping discards until occupancy recedes
        assert_eq!(core.submit(&[2; 1]), 0);
        assert_eq!(core.mode(), Mode::Dropping);

        assert_eq!(core.drain_step(&mut sink).await, DrainStep::Forwarded(1));
        assert_eq!(core.mode(), Mode::Dropping);
        assert_eq!(core.drain_step(&mut sink).await, DrainStep::Forwarded(1));
        assert_eq!(core.occupancy(), 6);
        assert_eq!(core.mode(), Mode::Processing);

        let stats = core.stats();
        assert_eq!(stats.overflows, 1);
        assert_eq!(stats.dropped_packets, 2);
        assert_eq!(stats.dropped_bytes, 4);
    }

    #[test]
    fn test_dropping_exit_on_admission_path() {
        let core = FlowCore::new(small_config(10, 6, 6)).unwrap();
        core.submit(&[1; 8]);
        core.submit(&[1; 8]);
        assert_eq!(core.mode(), Mode::Dropping);

        // Drained behind the controller's back
        core.buffer().try_read_upto(6).unwrap().release();
        assert_eq!(core.mode(), Mode::Dropping);

        // The discarded packet triggers the re-check
        assert_eq!(core.submit(&[2; 2]), 0);
        assert_eq!(core.mode(), Mode::Processing);
        assert_eq!(core.submit(&[2; 2]), 2);
    }

    #[tokio::test]
    async fn test_drain_to_empty_rearms_prefetch() {
        let core = FlowCore::new(small_config(10, 6, 6)).unwrap();
        let mut sink = MemorySink::default();

        core.submit(&[5; 6]);
        assert_eq!(core.mode(), Mode::Processing);
        assert!(woken(&core).await);

        assert_eq!(core.drain_step(&mut sink).await, DrainStep::Forwarded(6));
        assert_eq!(core.drain_step(&mut sink).await, DrainStep::Rearmed);
        assert_eq!(core.mode(), Mode::Prefetching);
        assert_eq!(core.stats().underflows, 1);

        // Below the watermark: no wake, no forwarding
        assert_eq!(core.submit(&[6; 3]), 3);
        assert_eq!(core.mode(), Mode::Prefetching);
        assert!(!woken(&core).await);

        assert_eq!(core.submit(&[7; 3]), 3);
        assert_eq!(core.mode(), Mode::Processing);
        assert!(woken(&core).await);
        assert_eq!(sink.writes, 1);
    }

    #[tokio::test]
    async fn test_drain_stops_after_rearm() {
        let core = FlowCore::new(small_config(64, 16, 8)).unwrap();
        let mut sink = MemorySink::default();

        core.submit(&[3; 20]);
        core.drain(&mut sink).await;

        assert_eq!(sink.data.len(), 20);
        assert_eq!(sink.writes, 3);
        assert_eq!(core.mode(), Mode::Prefetching);
        assert_eq!(core.stats().forwarded_bytes, 20);
    }

    #[tokio::test]
    async fn test_fresh_buffer_never_reaches_sink() {
        let core = FlowCore::new(small_config(10, 6, 6)).unwrap();
        let mut sink = MemorySink::default();

        for _ in 0..3 {
            assert_eq!(core.drain_step(&mut sink).await, DrainStep::Rearmed);
            assert_eq!(core.mode(), Mode::Prefetching);
        }
        assert_eq!(sink.writes, 0);
    }

    #[tokio::test]
    async fn test_overflow_while_prefetching_wakes_consumer() {
        let core = FlowCore::new(small_config(10, 10, 10)).unwrap();
        assert_eq!(core.submit(&[1; 6]), 6);
        assert!(!woken(&core).await);

        assert_eq!(core.submit(&[1; 6]), 0);
        assert_eq!(core.mode(), Mode::Dropping);
        assert!(woken(&core).await);
    }

    #[tokio::test]
    async fn test_sink_failure_releases_chunk() {
        let core = FlowCore::new(small_config(16, 4, 16)).unwrap();
        let mut sink = FailingSink;

        core.submit(&[1; 6]);
        assert_eq!(core.drain_step(&mut sink).await, DrainStep::Forwarded(6));
        assert_eq!(core.occupancy(), 0);

        let stats = core.stats();
        assert_eq!(stats.sink_errors, 1);
        assert_eq!(stats.lost_bytes, 6);
        assert_eq!(stats.forwarded_bytes, 0);
    }

    #[tokio::test]
    async fn test_short_sink_write_counts_loss() {
        let core = FlowCore::new(small_config(16, 4, 16)).unwrap();
        let mut sink = HalfSink;

        core.submit(&[1; 10]);
        core.drain_step(&mut sink).await;

        let stats = core.stats();
        assert_eq!(stats.forwarded_bytes, 5);
        assert_eq!(stats.lost_bytes, 5);
        assert_eq!(stats.sink_errors, 0);
    }

    #[tokio::test]
    async fn test_capacity_invariant_under_mixed_load() {
        let core = FlowCore::new(small_config(97, 60, 13)).unwrap();
        let mut sink = MemorySink::default();
        let mut seed: u32 = 0x2545_f491;

        for _ in 0..400 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let len = (seed >> 16) as usize % 40;
            let packet = vec![0xA5; len];

            let admitted = core.submit(&packet);
            assert!(admitted == 0 || admitted == len);
            assert!(core.occupancy() <= 97);

            if seed & 0x3 == 0 && core.occupancy() > 0 {
                core.drain_step(&mut sink).await;
            }
        }

        let stats = core.stats();
        assert_eq!(
            stats.admitted_bytes,
            sink.data.len() as u64 + core.occupancy() as u64
        );
    }

    #[test]
    fn test_start_up_without_runtime() {
        let result = FlowController::start_up(FlowConfig::default(), MemorySink::default());
        assert!(matches!(result, Err(FlowError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_start_up_rejects_invalid_config() {
        let config = small_config(8, 9, 4);
        let result = FlowController::start_up(config, MemorySink::default());
        assert!(matches!(
            result,
            Err(FlowError::Config(ConfigError::WatermarkAboveCapacity { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_controller_forwards_after_prefetch() {
        let sink = SharedSink::default();
        let persisted = Arc::clone(&sink.0);
        let controller = FlowController::start_up(small_config(64, 32, 8), sink).unwrap();

        let packet: Vec<u8> = (0u8..16).collect();
        assert_eq!(controller.submit(&packet), 16);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(persisted.lock().unwrap().is_empty());

        assert_eq!(controller.submit(&packet), 16);

        let mut waited = 0;
        while persisted.lock().unwrap().len() < 32 && waited < 200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += 1;
        }

        let data = persisted.lock().unwrap().clone();
        assert_eq!(data.len(), 32);
        assert_eq!(&data[..16], &packet[..]);
        assert_eq!(&data[16..], &packet[..]);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(controller.mode(), Mode::Prefetching);
        assert_eq!(controller.stats().forwarded_bytes, 32);

        controller.shut_down();
    }

    #[tokio::test]
    async fn test_idle_controller_never_calls_sink() {
        let sink = SharedSink::default();
        let persisted = Arc::clone(&sink.0);
        let controller = FlowController::start_up(small_config(64, 32, 8), sink).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.mode(), Mode::Prefetching);
        assert!(persisted.lock().unwrap().is_empty());
        controller.shut_down();
    }
}
