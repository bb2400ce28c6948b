//! # PCM File Storage
//!
//! The storage side of the recorder: a capped PCM file that the flow
//! controller drains into, plus the directory listing and read-back helpers
//! used around a recording.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use pcm_flow::{Sink, SinkError, SinkResult};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::RecorderError;

/// Size at which a recording file is closed (1220KB)
pub const DEFAULT_MAX_FILE_BYTES: u64 = 1220 * 1024;

/// Number of bytes shown by a preview
pub const DEFAULT_PREVIEW_BYTES: usize = 16;

/// Make sure the storage directory exists and log what is already in it
///
/// Returns the entry names, sorted.
pub async fn prepare_dir(dir: &Path) -> Result<Vec<String>, RecorderError> {
    fs::create_dir_all(dir)
        .await
        .map_err(RecorderError::storage(dir))?;

    let mut entries = fs::read_dir(dir).await.map_err(RecorderError::storage(dir))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(RecorderError::storage(dir))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    info!("storage directory {} ({} entries)", dir.display(), names.len());
    for name in &names {
        info!("  {}", name);
    }
    Ok(names)
}

/// Sink that appends drained PCM to a file until a size cap is reached
///
/// Once the cap is hit the file is flushed and closed; every later write
/// fails with [`SinkError::Closed`] and the shared closed flag is raised.
#[derive(Debug)]
pub struct PcmFileSink {
    path: PathBuf,
    file: Option<File>,
    written: u64,
    max_bytes: u64,
    closed: Arc<AtomicBool>,
}

impl PcmFileSink {
    /// Create a fresh recording file, replacing any previous one
    pub async fn create(path: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, RecorderError> {
        let path = path.into();

        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path)
                .await
                .map_err(RecorderError::storage(&path))?;
            warn!("existing file {} deleted", path.display());
        }

        let file = File::create(&path)
            .await
            .map_err(RecorderError::storage(&path))?;
        info!("recording to {} (cap {} bytes)", path.display(), max_bytes);

        Ok(Self {
            path,
            file: Some(file),
            written: 0,
            max_bytes,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bytes written to the file so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Flag raised once the file has been closed
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    /// Flush and close the file, returning its size on disk
    pub async fn finish(&mut self) -> std::io::Result<u64> {
        let Some(mut file) = self.file.take() else {
            return Ok(self.written);
        };
        self.closed.store(true, Ordering::Release);

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let size = fs::metadata(&self.path).await?.len();
        info!("file {} closed, size: {} bytes", self.path.display(), size);
        Ok(size)
    }
}

impl Sink for PcmFileSink {
    async fn write_bytes(&mut self, data: &[u8]) -> SinkResult<usize> {
        let Some(file) = self.file.as_mut() else {
            return Err(SinkError::Closed);
        };

        let room = self.max_bytes.saturating_sub(self.written);
        let len = data.len().min(usize::try_from(room).unwrap_or(usize::MAX));

        file.write_all(&data[..len]).await?;
        file.flush().await?;
        self.written += len as u64;
        debug!("wrote {} bytes ({} total)", len, self.written);

        if self.written >= self.max_bytes {
            info!("file size cap of {} bytes reached", self.max_bytes);
            self.finish().await?;
        }
        Ok(len)
    }
}

/// Read up to `max_len` bytes from the start of a file
pub async fn preview(path: &Path, max_len: usize) -> Result<Vec<u8>, RecorderError> {
    let mut file = File::open(path).await.map_err(RecorderError::storage(path))?;

    let mut buf = vec![0u8; max_len];
    let mut filled = 0;
    while filled < max_len {
        let n = file
            .read(&mut buf[filled..])
            .await
            .map_err(RecorderError::storage(path))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Format bytes as space separated upper-case hex, e.g. `01 AB FF`
pub fn hex_preview(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
