//! Synthetic bursty PCM producer.
//!
//! Stands in for a radio receive callback: packets arrive on a fixed tick,
//! but now and then several land back to back. Samples are a 16-bit
//! little-endian sawtooth so gaps from dropped packets are easy to spot in a
//! hex dump of the recording.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info};
use pcm_flow::FlowController;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant, MissedTickBehavior};

/// Shape of the generated traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Bytes per packet
    pub packet_bytes: usize,
    /// Time between ticks in milliseconds
    pub interval_ms: u64,
    /// Chance that a tick carries a burst instead of a single packet
    pub burst_probability: f64,
    /// Largest number of packets in one burst
    pub max_burst: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            packet_bytes: 4096,
            interval_ms: 20,
            burst_probability: 0.1,
            max_burst: 6,
        }
    }
}

/// What happened to the packets a source produced
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceReport {
    pub packets: u64,
    pub admitted_packets: u64,
    pub dropped_packets: u64,
    pub admitted_bytes: u64,
}

/// Packet generator driving a [`FlowController`]
#[derive(Debug)]
pub struct BurstSource {
    config: SourceConfig,
    rng: StdRng,
    sample: u16,
}

impl BurstSource {
    pub fn new(config: SourceConfig) -> Self {
        Self::from_rng(config, StdRng::from_entropy())
    }

    /// Reproducible traffic for a given seed
    pub fn with_seed(config: SourceConfig, seed: u64) -> Self {
        Self::from_rng(config, StdRng::seed_from_u64(seed))
    }

    fn from_rng(config: SourceConfig, rng: StdRng) -> Self {
        Self {
            config,
            rng,
            sample: 0,
        }
    }

    /// Next packet of sawtooth samples, continuing where the last one ended
    pub fn next_packet(&mut self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(self.config.packet_bytes);
        while packet.len() + 2 <= self.config.packet_bytes {
            packet.extend_from_slice(&self.sample.to_le_bytes());
            self.sample = self.sample.wrapping_add(1);
        }
        // Odd sizes get a trailing pad byte
        packet.resize(self.config.packet_bytes, 0);
        packet
    }

    /// Number of packets to emit on the next tick
    pub fn packets_this_tick(&mut self) -> u32 {
        let probability = self.config.burst_probability.clamp(0.0, 1.0);
        if self.config.max_burst < 2 || !self.rng.gen_bool(probability) {
            return 1;
        }
        self.rng.gen_range(2..=self.config.max_burst)
    }

    /// Feed `controller` until `duration` elapses or `stop` is raised
    pub async fn run(
        &mut self,
        controller: &FlowController,
        stop: &AtomicBool,
        duration: Duration,
    ) -> SourceReport {
        let deadline = Instant::now() + duration;
        let mut ticker = time::interval(Duration::from_millis(self.config.interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let mut report = SourceReport::default();
        info!(
            "source started: {} byte packets every {} ms",
            self.config.packet_bytes, self.config.interval_ms
        );

        loop {
            ticker.tick().await;
            if Instant::now() >= deadline || stop.load(Ordering::Acquire) {
                break;
            }

            let burst = self.packets_this_tick();
            if burst > 1 {
                debug!("burst of {} packets", burst);
            }
            for _ in 0..burst {
                let packet = self.next_packet();
                report.packets += 1;
                match controller.submit(&packet) {
                    0 if !packet.is_empty() => report.dropped_packets += 1,
                    admitted => {
                        report.admitted_packets += 1;
                        report.admitted_bytes += admitted as u64;
                    }
                }
            }
        }

        info!(
            "source stopped: {} packets, {} dropped",
            report.packets, report.dropped_packets
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcm_flow::{FlowConfig, MemorySink};

    fn config(packet_bytes: usize) -> SourceConfig {
        SourceConfig {
            packet_bytes,
            interval_ms: 2,
            burst_probability: 0.5,
            max_burst: 4,
        }
    }

    #[test]
    fn test_packets_continue_sawtooth() {
        let mut source = BurstSource::with_seed(config(4), 7);
        assert_eq!(source.next_packet(), [0, 0, 1, 0]);
        assert_eq!(source.next_packet(), [2, 0, 3, 0]);
    }

    #[test]
    fn test_odd_packet_is_padded() {
        let mut source = BurstSource::with_seed(config(5), 7);
        assert_eq!(source.next_packet(), [0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_burst_bounds() {
        let mut source = BurstSource::with_seed(config(8), 42);
        for _ in 0..200 {
            let n = source.packets_this_tick();
            assert!((1..=4).contains(&n));
        }

        let mut steady = BurstSource::with_seed(
            SourceConfig {
                burst_probability: 1.0,
                max_burst: 1,
                ..config(8)
            },
            42,
        );
        assert_eq!(steady.packets_this_tick(), 1);
    }

    #[tokio::test]
    async fn test_run_accounts_every_packet() {
        let flow = FlowConfig {
            capacity: 256,
            high_watermark: 128,
            drain_chunk_cap: 32,
            drain_timeout_ms: 5,
        };
        let controller = FlowController::start_up(flow, MemorySink::default()).unwrap();
        let mut source = BurstSource::with_seed(config(64), 1);
        let stop = AtomicBool::new(false);

        let report = source.run(&controller, &stop, Duration::from_millis(60)).await;

        assert!(report.packets > 0);
        assert_eq!(report.packets, report.admitted_packets + report.dropped_packets);
        assert_eq!(report.admitted_bytes, controller.stats().admitted_bytes);
        controller.shut_down();
    }

    #[tokio::test]
    async fn test_run_honours_stop_flag() {
        let controller =
            FlowController::start_up(FlowConfig::default(), MemorySink::default()).unwrap();
        let mut source = BurstSource::with_seed(config(64), 1);
        let stop = AtomicBool::new(true);

        let report = source.run(&controller, &stop, Duration::from_secs(10)).await;
        assert_eq!(report, SourceReport::default());
    }
}
