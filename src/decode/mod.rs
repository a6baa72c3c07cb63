//! Video decoders: the common contract, the NVDEC-style hardware variant,
//! the openh264 software fallback, and the factory that picks between them.

pub mod factory;
pub mod hardware;
pub mod software;

pub use factory::{DecoderCapabilities, DecoderFactory, DecoderKind};
pub use hardware::HardwareDecoder;
pub use software::SoftwareDecoder;

use crate::errors::StreamResult;
use crate::types::{DecodeStatus, DecodedFrame, DecoderConfig, MemoryStats, StreamQuality};

/// Common decoder contract: open, feed bytes, poll a frame, change quality,
/// flush, reset, drop.
///
/// `get_frame` lends out a reference into decoder-owned storage; it is valid
/// only until the next call on the same decoder. Consumers that must keep a
/// frame copy it before returning.
pub trait Decoder: Send {
    /// Prepare the decoder. A decoder that fails to initialize is unusable.
    fn initialize(&mut self, config: &DecoderConfig) -> StreamResult<()>;

    /// Feed one Annex-B chunk with its presentation timestamp in
    /// microseconds.
    fn decode(&mut self, data: &[u8], pts: i64) -> DecodeStatus;

    /// Retrieve the oldest decoded frame, if any.
    fn get_frame(&mut self) -> Option<&DecodedFrame>;

    /// Resize decoder-side resources for a new quality level. The caller
    /// guarantees no decode is in progress on this decoder.
    fn set_quality(&mut self, quality: StreamQuality);

    /// Current GPU/system memory footprint.
    fn memory_usage(&self) -> MemoryStats;

    /// Submit end-of-stream and drain internal state.
    fn flush(&mut self);

    /// Flush, discard queued frames, zero per-session counters. The decoder
    /// remains usable.
    fn reset(&mut self);

    fn config(&self) -> &DecoderConfig;

    /// Constant for the lifetime of the instance.
    fn is_hardware_accelerated(&self) -> bool;
}
