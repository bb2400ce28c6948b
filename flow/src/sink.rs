//! # Sink Capability
//!
//! The drain side of the flow controller forwards buffered bytes to a
//! [`Sink`]. The sink may be slow and may stall for a long time (file system
//! flushes, card wear levelling); absorbing those stalls is exactly what the
//! ring buffer is for.
//!
//! ## Delivery Policy
//!
//! Each chunk is offered to the sink once. A short write or an error is
//! logged and counted as lost data; the chunk is released either way, since a
//! released chunk cannot be put back into the buffer.

use std::future::Future;

use thiserror::Error;

/// Errors a sink can report for a single write
#[derive(Debug, Error)]
pub enum SinkError {
    /// The underlying storage failed
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The sink no longer accepts data (file finished, device removed)
    #[error("sink is closed")]
    Closed,
    /// The sink refused the data for another reason
    #[error("sink rejected data: {0}")]
    Rejected(String),
}

/// Result type alias for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Destination for drained bytes
///
/// # Example
///
/// ```rust
/// use pcm_flow::sink::{Sink, SinkResult};
///
/// struct Discard;
///
/// impl Sink for Discard {
///     async fn write_bytes(&mut self, data: &[u8]) -> SinkResult<usize> {
///         Ok(data.len())
///     }
/// }
/// ```
pub trait Sink: Send + 'static {
    /// Persist `data`, returning how many bytes were actually accepted
    ///
    /// May take arbitrarily long. Only the consumer task calls this.
    fn write_bytes(&mut self, data: &[u8]) -> impl Future<Output = SinkResult<usize>> + Send;
}

/// In-memory sink, mostly useful for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    /// Everything written so far
    pub data: Vec<u8>,
    /// Number of `write_bytes` calls
    pub writes: usize,
}

impl Sink for MemorySink {
    async fn write_bytes(&mut self, data: &[u8]) -> SinkResult<usize> {
        self.data.extend_from_slice(data);
        self.writes += 1;
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_appends() {
        let mut sink = MemorySink::default();
        assert_eq!(sink.write_bytes(b"abc").await.unwrap(), 3);
        assert_eq!(sink.write_bytes(b"de").await.unwrap(), 2);
        assert_eq!(sink.data, b"abcde");
        assert_eq!(sink.writes, 2);
    }

    #[test]
    fn test_io_error_converts() {
        let err: SinkError = std::io::Error::new(std::io::ErrorKind::Other, "card removed").into();
        assert!(matches!(err, SinkError::Io(_)));
        assert_eq!(err.to_string(), "sink I/O error: card removed");
    }
}
