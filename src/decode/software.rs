//! Software decoder fallback built on openh264.
//!
//! Holds a single owned output picture: each successful decode overwrites
//! the previous one, so a frame reference obtained from `get_frame` is
//! invalidated by the next call into the decoder. Output is always planar
//! YUV 4:2:0 with compacted strides.

use super::Decoder;
use crate::errors::{StreamError, StreamResult};
use crate::types::{
    Codec, DecodeStatus, DecodedFrame, DecoderConfig, MemoryStats, Plane, PixelFormat,
    StreamQuality,
};
use openh264::decoder::Decoder as H264Codec;
use openh264::formats::YUVSource;

pub struct SoftwareDecoder {
    config: DecoderConfig,
    codec: Option<H264Codec>,
    /// Y, U, V planes packed back to back with compacted strides.
    frame_buf: Vec<u8>,
    current: DecodedFrame,
    frame_ready: bool,
    frames_decoded: u64,
    initialized: bool,
}

// The raw plane pointers inside `current` always reference `frame_buf`,
// which moves with the decoder.
unsafe impl Send for SoftwareDecoder {}

impl SoftwareDecoder {
    pub fn new() -> Self {
        Self {
            config: DecoderConfig::default(),
            codec: None,
            frame_buf: Vec::new(),
            current: DecodedFrame::blank(),
            frame_ready: false,
            frames_decoded: 0,
            initialized: false,
        }
    }
}

/// Copy the decoded picture into the owned buffer with compact strides and
/// refresh the frame descriptor. Free-standing so the caller can hold a
/// borrow of the codec (which owns `yuv`) at the same time.
fn store_picture<S: YUVSource>(
    frame_buf: &mut Vec<u8>,
    current: &mut DecodedFrame,
    yuv: &S,
    pts: i64,
    keyframe: bool,
) {
    let (width, height) = yuv.dimensions();
    let (y_stride, u_stride, v_stride) = yuv.strides();
    let chroma_width = width / 2;
    let chroma_height = height / 2;

    let y_size = width * height;
    let chroma_size = chroma_width * chroma_height;
    frame_buf.resize(y_size + 2 * chroma_size, 0);

    let (y_dst, rest) = frame_buf.split_at_mut(y_size);
    let (u_dst, v_dst) = rest.split_at_mut(chroma_size);

    copy_plane(yuv.y(), y_stride, y_dst, width, height);
    copy_plane(yuv.u(), u_stride, u_dst, chroma_width, chroma_height);
    copy_plane(yuv.v(), v_stride, v_dst, chroma_width, chroma_height);

    *current = DecodedFrame {
        width: width as u32,
        height: height as u32,
        pts,
        dts: pts,
        keyframe,
        format: PixelFormat::Yuv420p,
        planes: [Plane::empty(); 3],
        surface: None,
    };
}

fn copy_plane(src: &[u8], src_stride: usize, dst: &mut [u8], width: usize, height: usize) {
    for row in 0..height {
        let src_start = row * src_stride;
        let dst_start = row * width;
        if src_start + width > src.len() {
            break;
        }
        dst[dst_start..dst_start + width].copy_from_slice(&src[src_start..src_start + width]);
    }
}

/// True when the buffer contains an IDR slice (H.264 type 5).
fn contains_idr(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            let header = if data[i + 2] == 1 {
                data.get(i + 3)
            } else if data[i + 2] == 0 && data[i + 3] == 1 {
                data.get(i + 4)
            } else {
                None
            };
            if let Some(&header) = header {
                if header & 0x1F == 5 {
                    return true;
                }
            }
        }
        i += 1;
    }
    false
}

impl Decoder for SoftwareDecoder {
    fn initialize(&mut self, config: &DecoderConfig) -> StreamResult<()> {
        if self.initialized {
            self.reset();
        }

        if config.codec == Codec::H265 {
            return Err(StreamError::DecoderInit(
                "software decoder supports H.264 only (openh264 is AVC-only)".into(),
            ));
        }

        let codec = H264Codec::new()
            .map_err(|e| StreamError::DecoderInit(format!("openh264: {}", e)))?;

        self.config = config.clone();
        self.codec = Some(codec);
        self.initialized = true;
        log::info!(
            "SoftwareDecoder: initialized {} decoder (software fallback, max {}x{})",
            config.codec.as_str(),
            config.max_width,
            config.max_height
        );
        Ok(())
    }

    fn decode(&mut self, data: &[u8], pts: i64) -> DecodeStatus {
        if !self.initialized {
            return DecodeStatus::DecoderFailure;
        }
        let Some(codec) = self.codec.as_mut() else {
            return DecodeStatus::DecoderFailure;
        };

        let keyframe = contains_idr(data);
        match codec.decode(data) {
            Ok(Some(yuv)) => {
                // Copy out before the next decode reuses codec storage.
                store_picture(&mut self.frame_buf, &mut self.current, &yuv, pts, keyframe);
                self.frame_ready = true;
                self.frames_decoded += 1;
                DecodeStatus::Success
            }
            Ok(None) => DecodeStatus::NeedMoreData,
            Err(e) => {
                // Bad packets are not fatal; the codec resynchronizes at the
                // next keyframe.
                log::debug!("SoftwareDecoder: invalid data: {}", e);
                DecodeStatus::InvalidData
            }
        }
    }

    fn get_frame(&mut self) -> Option<&DecodedFrame> {
        if !self.frame_ready {
            return None;
        }
        self.frame_ready = false;

        let width = self.current.width as usize;
        let height = self.current.height as usize;
        let chroma_width = width / 2;
        let y_size = width * height;
        let chroma_size = chroma_width * (height / 2);

        let base = self.frame_buf.as_ptr();
        self.current.planes = [
            Plane {
                ptr: base,
                stride: width,
            },
            Plane {
                ptr: unsafe { base.add(y_size) },
                stride: chroma_width,
            },
            Plane {
                ptr: unsafe { base.add(y_size + chroma_size) },
                stride: chroma_width,
            },
        ];
        Some(&self.current)
    }

    fn set_quality(&mut self, quality: StreamQuality) {
        // No surface pool on the software path; only the config changes.
        self.config.quality = quality;
    }

    fn memory_usage(&self) -> MemoryStats {
        // Static estimate: one YUV 4:2:0 picture at the maximum resolution.
        let estimate =
            u64::from(self.config.max_width) * u64::from(self.config.max_height) * 3 / 2;
        MemoryStats {
            gpu_bytes: 0,
            system_bytes: estimate,
            surfaces_used: 1,
            surfaces_capacity: 1,
        }
    }

    fn flush(&mut self) {
        self.frame_ready = false;
    }

    fn reset(&mut self) {
        self.flush();
        self.frames_decoded = 0;
    }

    fn config(&self) -> &DecoderConfig {
        &self.config
    }

    fn is_hardware_accelerated(&self) -> bool {
        false
    }
}

impl Default for SoftwareDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_h265() {
        let mut decoder = SoftwareDecoder::new();
        let config = DecoderConfig {
            codec: Codec::H265,
            ..DecoderConfig::default()
        };
        assert!(decoder.initialize(&config).is_err());
    }

    #[test]
    fn uninitialized_decode_fails_fast() {
        let mut decoder = SoftwareDecoder::new();
        assert_eq!(decoder.decode(&[0, 0, 0, 1, 0x65], 0), DecodeStatus::DecoderFailure);
        assert!(decoder.get_frame().is_none());
    }

    #[test]
    fn memory_estimate_uses_max_resolution() {
        let mut decoder = SoftwareDecoder::new();
        decoder.initialize(&DecoderConfig::default()).unwrap();
        let stats = decoder.memory_usage();
        assert_eq!(stats.gpu_bytes, 0);
        assert_eq!(stats.system_bytes, 1920 * 1080 * 3 / 2);
        assert_eq!(stats.surfaces_capacity, 1);
    }

    #[test]
    fn idr_detection() {
        assert!(contains_idr(&[0x00, 0x00, 0x00, 0x01, 0x65, 0x88]));
        assert!(contains_idr(&[0x00, 0x00, 0x01, 0x65, 0x88]));
        assert!(!contains_idr(&[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A]));
        assert!(!contains_idr(&[0x65, 0x88]));
    }

    #[test]
    fn not_hardware_accelerated() {
        let decoder = SoftwareDecoder::new();
        assert!(!decoder.is_hardware_accelerated());
    }
}
