//! One recording session: storage, controller, source, teardown.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use pcm_flow::{FlowController, FlowStats, Mode};
use tokio::fs;

use crate::config::RecorderConfig;
use crate::source::{BurstSource, SourceReport};
use crate::storage::{self, PcmFileSink};
use crate::RecorderError;

/// Longest wait for the consumer to go idle before shutting down
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a recording
#[derive(Debug, Clone)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub source: SourceReport,
    pub flow: FlowStats,
    /// Size of the recording on disk
    pub file_bytes: u64,
}

/// Record for `duration`, or until the file cap or Ctrl-C stops it
pub async fn record(
    config: &RecorderConfig,
    duration: Duration,
    seed: Option<u64>,
) -> Result<RecordingSummary, RecorderError> {
    storage::prepare_dir(config.storage.dir()).await?;

    let sink = PcmFileSink::create(&config.storage.path, config.storage.max_file_bytes).await?;
    let stop = sink.closed_flag();
    let controller = FlowController::start_up(config.flow.clone(), sink)?;

    let interrupt = {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, stopping source");
                stop.store(true, Ordering::Release);
            }
        })
    };

    let mut source = match seed {
        Some(seed) => BurstSource::with_seed(config.source.clone(), seed),
        None => BurstSource::new(config.source.clone()),
    };
    let report = source.run(&controller, &stop, duration).await;
    interrupt.abort();

    settle(&controller).await;
    let flow = controller.stats();
    controller.shut_down();

    let file_bytes = fs::metadata(&config.storage.path)
        .await
        .map(|m| m.len())
        .map_err(RecorderError::storage(&config.storage.path))?;

    Ok(RecordingSummary {
        path: config.storage.path.clone(),
        source: report,
        flow,
        file_bytes,
    })
}

// Let a draining consumer run dry so the tail of the recording lands on disk.
async fn settle(controller: &FlowController) {
    let poll = controller.config().drain_timeout();
    let mut waited = Duration::ZERO;
    while controller.mode() != Mode::Prefetching {
        if waited >= SETTLE_TIMEOUT {
            warn!("consumer still busy after {:?}, shutting down anyway", waited);
            return;
        }
        tokio::time::sleep(poll).await;
        waited += poll;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::source::SourceConfig;
    use pcm_flow::FlowConfig;
    use tempfile::tempdir;

    fn test_config(path: PathBuf, max_file_bytes: u64) -> RecorderConfig {
        RecorderConfig {
            flow: FlowConfig {
                capacity: 4096,
                high_watermark: 1024,
                drain_chunk_cap: 256,
                drain_timeout_ms: 5,
            },
            storage: StorageConfig {
                path,
                max_file_bytes,
            },
            source: SourceConfig {
                packet_bytes: 128,
                interval_ms: 2,
                burst_probability: 0.2,
                max_burst: 4,
            },
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_record_session() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sdcard").join("audio.pcm");
        let config = test_config(path.clone(), 1 << 20);

        let summary = record(&config, Duration::from_millis(200), Some(3))
            .await
            .unwrap();

        assert!(path.exists());
        assert!(summary.source.packets > 0);
        assert_eq!(summary.flow.admitted_bytes, summary.source.admitted_bytes);
        assert!(summary.file_bytes <= summary.flow.admitted_bytes);
        assert_eq!(summary.file_bytes, summary.flow.forwarded_bytes);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_record_stops_at_file_cap() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("audio.pcm");
        let config = test_config(path, 2048);

        let summary = record(&config, Duration::from_secs(10), Some(5))
            .await
            .unwrap();

        assert_eq!(summary.file_bytes, 2048);
    }
}
