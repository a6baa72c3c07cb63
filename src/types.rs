//! Core types shared across the pipeline: codecs, quality levels, pixel
//! formats, decode status codes, camera states, and the decoded frame
//! descriptor handed to frame callbacks.

use serde::{Deserialize, Serialize};

/// Video codec carried by a camera stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    H264,
    H265,
    Unknown,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H264 => "H.264",
            Codec::H265 => "H.265",
            Codec::Unknown => "Unknown",
        }
    }
}

/// Adaptive quality level for a camera tile.
///
/// Each level maps deterministically to a target frame rate and a decoder
/// surface-pool size; the mapping is pure and total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StreamQuality {
    /// Keyframes only.
    Paused = 0,
    /// Sub-stream, small preview.
    Thumbnail = 1,
    /// Sub-stream, default grid tile.
    GridView = 2,
    /// Main stream, single-camera focus.
    Focused = 3,
    /// Main stream, fullscreen playback.
    Fullscreen = 4,
}

impl StreamQuality {
    /// Target frames per second for this quality level.
    pub fn target_fps(self) -> u32 {
        match self {
            StreamQuality::Paused => 1,
            StreamQuality::Thumbnail => 5,
            StreamQuality::GridView => 10,
            StreamQuality::Focused => 15,
            StreamQuality::Fullscreen => 30,
        }
    }

    /// Number of decoder output surfaces to pre-allocate.
    pub fn surface_pool_size(self) -> usize {
        match self {
            StreamQuality::Paused => 2,
            StreamQuality::Thumbnail => 4,
            StreamQuality::GridView => 4,
            StreamQuality::Focused => 8,
            StreamQuality::Fullscreen => 12,
        }
    }

    /// Whether this level selects the camera's low-resolution sub-stream.
    pub fn is_sub_stream(self) -> bool {
        matches!(self, StreamQuality::Thumbnail | StreamQuality::GridView)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamQuality::Paused => "paused",
            StreamQuality::Thumbnail => "thumbnail",
            StreamQuality::GridView => "grid-view",
            StreamQuality::Focused => "focused",
            StreamQuality::Fullscreen => "fullscreen",
        }
    }

    /// Inverse of the `repr(u8)` discriminant, for atomic storage.
    pub fn from_u8(value: u8) -> StreamQuality {
        match value {
            0 => StreamQuality::Paused,
            1 => StreamQuality::Thumbnail,
            3 => StreamQuality::Focused,
            4 => StreamQuality::Fullscreen,
            _ => StreamQuality::GridView,
        }
    }
}

/// Pixel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Luma plane followed by an interleaved chroma plane (hardware path).
    Nv12,
    /// Planar Y, U, V at 4:2:0 (software path).
    Yuv420p,
    /// 32-bit RGBA; not produced by this pipeline.
    Rgba,
    Unknown,
}

/// Outcome of a single `Decoder::decode` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// At least one frame may be retrievable via `get_frame`.
    Success,
    /// Non-fatal; expected between keyframes.
    NeedMoreData,
    /// The packet was malformed; the decoder remains usable.
    InvalidData,
    /// The decoder is no longer usable for this session.
    DecoderFailure,
    /// Surface or frame allocation failed.
    OutOfMemory,
}

impl DecodeStatus {
    /// Fatal statuses tear the camera down; the rest keep the loop going.
    pub fn is_fatal(self) -> bool {
        matches!(self, DecodeStatus::DecoderFailure | DecodeStatus::OutOfMemory)
    }
}

/// Lifecycle state of a camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StreamState {
    Stopped = 0,
    Connecting = 1,
    Running = 2,
    Error = 3,
    Reconnecting = 4,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Stopped => "stopped",
            StreamState::Connecting => "connecting",
            StreamState::Running => "running",
            StreamState::Error => "error",
            StreamState::Reconnecting => "reconnecting",
        }
    }

    /// Inverse of the `repr(u8)` discriminant, for atomic storage.
    pub fn from_u8(value: u8) -> StreamState {
        match value {
            1 => StreamState::Connecting,
            2 => StreamState::Running,
            3 => StreamState::Error,
            4 => StreamState::Reconnecting,
            _ => StreamState::Stopped,
        }
    }
}

/// Decoder configuration chosen at camera start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub codec: Codec,
    pub quality: StreamQuality,
    /// Maximum coded width the decoder must accommodate.
    pub max_width: u32,
    /// Maximum coded height the decoder must accommodate.
    pub max_height: u32,
    /// Auto-select the hardware decoder when available.
    pub prefer_hardware: bool,
    /// True when decoding the camera's low-resolution sub-stream.
    pub is_sub_stream: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            quality: StreamQuality::GridView,
            max_width: 1920,
            max_height: 1080,
            prefer_hardware: true,
            is_sub_stream: false,
        }
    }
}

/// Memory usage snapshot for one decoder.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    /// VRAM held by the decoder's surface pool, in bytes.
    pub gpu_bytes: u64,
    /// System RAM held by decode buffers, in bytes.
    pub system_bytes: u64,
    /// Surfaces currently allocated.
    pub surfaces_used: usize,
    /// Surfaces the current quality level calls for.
    pub surfaces_capacity: usize,
}

/// One plane of a decoded frame.
///
/// On the software path `ptr` is a host pointer into the decoder's output
/// buffer. On the hardware path it is a CUDA device address rebased from the
/// surface pointer; it must not be dereferenced on the CPU.
#[derive(Debug, Clone, Copy)]
pub struct Plane {
    pub ptr: *const u8,
    pub stride: usize,
}

impl Plane {
    pub const fn empty() -> Plane {
        Plane {
            ptr: std::ptr::null(),
            stride: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_null()
    }
}

/// GPU surface backing a hardware-decoded frame.
#[derive(Debug, Clone, Copy)]
pub struct GpuSurfaceRef {
    /// CUDA device pointer to the NV12 luma plane.
    pub device_ptr: u64,
    /// Row pitch in bytes; the chroma plane sits at
    /// `device_ptr + height * pitch` with the same pitch.
    pub pitch: u32,
}

/// A decoded frame descriptor borrowed from a decoder.
///
/// The reference returned by `Decoder::get_frame` is valid only until the
/// next call on the same decoder; consumers that need to keep the pixels
/// must copy them before returning from the frame callback.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in microseconds.
    pub pts: i64,
    /// Decode timestamp in microseconds.
    pub dts: i64,
    pub keyframe: bool,
    pub format: PixelFormat,
    /// Y/U/V (or Y/UV for NV12) plane pointers and strides. Unused entries
    /// are empty.
    pub planes: [Plane; 3],
    /// Present on the hardware path only.
    pub surface: Option<GpuSurfaceRef>,
}

impl DecodedFrame {
    pub(crate) fn blank() -> DecodedFrame {
        DecodedFrame {
            width: 0,
            height: 0,
            pts: 0,
            dts: 0,
            keyframe: false,
            format: PixelFormat::Unknown,
            planes: [Plane::empty(); 3],
            surface: None,
        }
    }
}

/// One entry in a camera's bounded packet queue.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    /// Annex-B bitstream bytes, start code included.
    pub data: Vec<u8>,
    /// Presentation timestamp in microseconds.
    pub pts: i64,
    pub keyframe: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_mapping_matches_table() {
        let table = [
            (StreamQuality::Paused, 1, 2),
            (StreamQuality::Thumbnail, 5, 4),
            (StreamQuality::GridView, 10, 4),
            (StreamQuality::Focused, 15, 8),
            (StreamQuality::Fullscreen, 30, 12),
        ];
        for (quality, fps, surfaces) in table {
            assert_eq!(quality.target_fps(), fps);
            assert_eq!(quality.surface_pool_size(), surfaces);
        }
    }

    #[test]
    fn sub_stream_selection() {
        assert!(StreamQuality::Thumbnail.is_sub_stream());
        assert!(StreamQuality::GridView.is_sub_stream());
        assert!(!StreamQuality::Paused.is_sub_stream());
        assert!(!StreamQuality::Focused.is_sub_stream());
        assert!(!StreamQuality::Fullscreen.is_sub_stream());
    }

    #[test]
    fn quality_u8_round_trip() {
        for quality in [
            StreamQuality::Paused,
            StreamQuality::Thumbnail,
            StreamQuality::GridView,
            StreamQuality::Focused,
            StreamQuality::Fullscreen,
        ] {
            assert_eq!(StreamQuality::from_u8(quality as u8), quality);
        }
    }

    #[test]
    fn state_u8_round_trip() {
        for state in [
            StreamState::Stopped,
            StreamState::Connecting,
            StreamState::Running,
            StreamState::Error,
            StreamState::Reconnecting,
        ] {
            assert_eq!(StreamState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn fatal_statuses() {
        assert!(DecodeStatus::DecoderFailure.is_fatal());
        assert!(DecodeStatus::OutOfMemory.is_fatal());
        assert!(!DecodeStatus::Success.is_fatal());
        assert!(!DecodeStatus::NeedMoreData.is_fatal());
        assert!(!DecodeStatus::InvalidData.is_fatal());
    }
}
