//! # PCM Recorder
//!
//! Host application around the flow core. It provides the collaborators the
//! controller is deliberately ignorant of:
//!
//! - Storage directory preparation and listing
//! - A capped PCM file used as the drain sink
//! - A synthetic bursty producer standing in for the receive callback
//! - Configuration loading and the command line
//!
//! ## Session Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         pcm-recorder                             │
//! │                                                                  │
//! │  ┌─────────────┐  submit()  ┌────────────────┐  write_bytes()    │
//! │  │ BurstSource │──────────► │ FlowController │──────────────┐    │
//! │  └─────────────┘            │   (pcm-flow)   │              ▼    │
//! │         ▲                   └────────────────┘      ┌─────────────┐
//! │         │ stop flag (file cap / Ctrl-C)             │ PcmFileSink │
//! │         └───────────────────────────────────────────└─────────────┘
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};

use pcm_flow::FlowError;
use thiserror::Error;

pub mod config;
pub mod session;
pub mod source;
pub mod storage;

pub use config::{Cli, Command, PreviewArgs, RecordArgs, RecorderConfig, StorageConfig};
pub use session::{record, RecordingSummary};
pub use source::{BurstSource, SourceConfig, SourceReport};
pub use storage::PcmFileSink;

/// Errors that can occur in the recorder
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("flow controller error: {0}")]
    Flow(#[from] FlowError),
}

impl RecorderError {
    /// Adapter for `map_err` that tags an I/O error with its path
    pub(crate) fn storage(path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Storage { path, source }
    }
}
