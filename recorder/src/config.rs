//! # Recorder Configuration
//!
//! Settings come from three layers, later ones winning:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file (`--config recorder.toml`)
//! 3. Command line overrides
//!
//! ```toml
//! [flow]
//! capacity = 43008
//! high_watermark = 30720
//!
//! [storage]
//! path = "sdcard/audio.pcm"
//!
//! [source]
//! packet_bytes = 4096
//! interval_ms = 20
//! ```

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use pcm_flow::FlowConfig;
use serde::{Deserialize, Serialize};

use crate::source::SourceConfig;
use crate::storage::{DEFAULT_MAX_FILE_BYTES, DEFAULT_PREVIEW_BYTES};
use crate::RecorderError;

/// Recording length when none is given
pub const DEFAULT_DURATION_SECS: u64 = 10;

/// Where and how much to record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Recording file; its parent directory is created if missing
    pub path: PathBuf,
    /// File is closed once it reaches this many bytes
    pub max_file_bytes: u64,
}

impl StorageConfig {
    /// Directory holding the recording
    pub fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sdcard/audio.pcm"),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

/// Complete recorder configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub flow: FlowConfig,
    pub storage: StorageConfig,
    pub source: SourceConfig,
}

impl RecorderConfig {
    /// Load from a TOML file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self, RecorderError> {
        let text = std::fs::read_to_string(path).map_err(RecorderError::storage(path))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, RecorderError> {
        let config: Self =
            toml::from_str(text).map_err(|e| RecorderError::Config(e.to_string()))?;
        config
            .flow
            .validate()
            .map_err(|e| RecorderError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Apply command line overrides
    pub fn apply(&mut self, args: &RecordArgs) {
        if let Some(output) = &args.output {
            self.storage.path = output.clone();
        }
        if let Some(max_file_bytes) = args.max_file_bytes {
            self.storage.max_file_bytes = max_file_bytes;
        }
        if let Some(capacity) = args.capacity {
            self.flow.capacity = capacity;
        }
        if let Some(high_watermark) = args.high_watermark {
            self.flow.high_watermark = high_watermark;
        }
        if let Some(drain_chunk_cap) = args.drain_chunk_cap {
            self.flow.drain_chunk_cap = drain_chunk_cap;
        }
        if let Some(drain_timeout_ms) = args.drain_timeout_ms {
            self.flow.drain_timeout_ms = drain_timeout_ms;
        }
        if let Some(packet_bytes) = args.packet_bytes {
            self.source.packet_bytes = packet_bytes;
        }
        if let Some(interval_ms) = args.interval_ms {
            self.source.interval_ms = interval_ms;
        }
    }
}

/// Record bursty PCM through the flow controller into a file
#[derive(Debug, Parser)]
#[command(name = "pcm-recorder", version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a recording session (default)
    Record(RecordArgs),
    /// Print the first bytes of a recording as hex
    Preview(PreviewArgs),
}

#[derive(Debug, Default, Clone, Args)]
pub struct RecordArgs {
    /// Recording file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Recording length in seconds
    #[arg(short, long)]
    pub duration_secs: Option<u64>,
    /// Seed for reproducible traffic
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub max_file_bytes: Option<u64>,
    #[arg(long)]
    pub capacity: Option<usize>,
    #[arg(long)]
    pub high_watermark: Option<usize>,
    #[arg(long)]
    pub drain_chunk_cap: Option<usize>,
    #[arg(long)]
    pub drain_timeout_ms: Option<u32>,
    #[arg(long)]
    pub packet_bytes: Option<usize>,
    #[arg(long)]
    pub interval_ms: Option<u64>,
}

impl RecordArgs {
    pub fn duration_secs(&self) -> u64 {
        self.duration_secs.unwrap_or(DEFAULT_DURATION_SECS)
    }
}

#[derive(Debug, Clone, Args)]
pub struct PreviewArgs {
    /// File to inspect (defaults to the configured recording)
    pub path: Option<PathBuf>,
    /// Number of bytes to show
    #[arg(short = 'n', long, default_value_t = DEFAULT_PREVIEW_BYTES)]
    pub bytes: usize,
}
