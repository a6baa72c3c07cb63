use std::fmt;

/// Errors surfaced by the streaming pipeline.
///
/// Start errors (`Connect`, `Negotiation`, `DecoderInit`, `GpuContext`)
/// propagate to the caller of `add_camera`; runtime errors are reflected
/// through the per-camera state and statistics instead of unwinding across
/// worker threads.
#[derive(Debug)]
pub enum StreamError {
    /// Transport-level connection failure (socket, DNS, auth rejection).
    Connect(String),
    /// RTSP/SDP negotiation failed or no usable video substream was found.
    Negotiation(String),
    /// Decoder construction or initialization failed.
    DecoderInit(String),
    /// GPU device or context initialization failed.
    GpuContext(String),
    /// Unrecoverable receive failure on an established session.
    Receive(String),
    /// Decode failure that leaves the decoder unusable.
    Decode(String),
    /// GPU or system memory exhaustion.
    OutOfMemory(String),
    /// Submission to a pool that has been shut down.
    PoolShutdown(String),
    /// Use of a component before initialization.
    NotInitialized(String),
    /// Caller passed an argument the pipeline cannot act on.
    InvalidArgument(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamError::Connect(msg) => write!(f, "Connection error: {}", msg),
            StreamError::Negotiation(msg) => write!(f, "Negotiation error: {}", msg),
            StreamError::DecoderInit(msg) => write!(f, "Decoder init error: {}", msg),
            StreamError::GpuContext(msg) => write!(f, "GPU context error: {}", msg),
            StreamError::Receive(msg) => write!(f, "Receive error: {}", msg),
            StreamError::Decode(msg) => write!(f, "Decode error: {}", msg),
            StreamError::OutOfMemory(msg) => write!(f, "Out of memory: {}", msg),
            StreamError::PoolShutdown(msg) => write!(f, "Pool shut down: {}", msg),
            StreamError::NotInitialized(msg) => write!(f, "Not initialized: {}", msg),
            StreamError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for StreamError {}

/// Convenience alias used throughout the crate.
pub type StreamResult<T> = Result<T, StreamError>;
