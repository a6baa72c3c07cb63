//! gridstream: multi-camera RTSP ingest and decode pipeline
//!
//! This crate ingests many concurrent RTSP streams from IP cameras, parses
//! their H.264/H.265 bitstreams into NAL units, decodes them on the GPU
//! (NVDEC) with a software fallback (openh264), and hands decoded frames to
//! a callback as zero-copy references.
//!
//! # Features
//! - Per-camera RTSP sessions over libavformat with automatic reconnection
//! - Lock-free bounded packet queues with drop-oldest backpressure
//! - Shared network and decode worker pools (42+ cameras per host)
//! - Hardware decoding through runtime-loaded CUDA/CUVID, no compile-time
//!   CUDA dependency
//! - Centralized GPU memory accounting with utilisation warnings
//!
//! # Usage
//! ```rust,no_run
//! use gridstream::{CameraConfig, PipelineConfig, PipelineCoordinator, StreamQuality};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut pipeline = PipelineCoordinator::new(PipelineConfig::default());
//!     pipeline.initialize()?;
//!     pipeline.set_frame_callback(|camera_id, frame| {
//!         println!("{}: {}x{} pts={}", camera_id, frame.width, frame.height, frame.pts);
//!     });
//!     pipeline.add_camera(
//!         CameraConfig::new("lobby", "rtsp://192.168.1.10:554/stream1")
//!             .with_quality(StreamQuality::GridView),
//!     )?;
//!     Ok(())
//! }
//! ```

pub mod bitstream;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod errors;
pub mod gpu;
pub mod pool;
pub mod queue;
pub mod rtsp;
pub mod session;
pub mod types;

// Re-exports for convenience
pub use config::{CameraConfig, PipelineConfig};
pub use coordinator::{FrameCallback, GlobalStats, PipelineCoordinator};
pub use decode::{Decoder, DecoderCapabilities, DecoderFactory};
pub use errors::{StreamError, StreamResult};
pub use queue::BoundedQueue;
pub use session::{CameraSession, SessionStats};
pub use types::{
    Codec, DecodeStatus, DecodedFrame, DecoderConfig, MemoryStats, Packet, PixelFormat,
    StreamQuality, StreamState,
};

/// Initialize logging for the pipeline.
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "gridstream=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        let info = get_info();
        assert_eq!(info.name, "gridstream");
        assert!(!info.version.is_empty());
        assert!(!info.description.is_empty());
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }
}
