//! NAL unit header classification and SPS/PPS parsing.
//!
//! The bit reader never panics on malformed input: reads past the end of the
//! payload yield zeros and set an overrun flag the parsers check before
//! trusting their output. SPS/PPS payloads are unescaped (emulation
//! prevention bytes stripped) before bit-reading.

use crate::types::Codec;
use serde::{Deserialize, Serialize};

/// NAL unit types for H.264, plus the H.265 parameter/IDR types this
/// pipeline classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NalUnitType {
    Unspecified,
    /// Non-IDR coded slice.
    Slice,
    DataPartitionA,
    DataPartitionB,
    DataPartitionC,
    /// IDR coded slice (keyframe).
    Idr,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfStream,
    Filler,
    /// RTP fragmentation unit A.
    FuA,
    /// RTP fragmentation unit B.
    FuB,
    HevcVps,
    HevcSps,
    HevcPps,
    HevcIdrWRadl,
    HevcIdrNLp,
    /// H.265 slice that is neither IDR nor a parameter set.
    HevcOther,
}

impl NalUnitType {
    /// Classify the first byte after the start code.
    ///
    /// H.264 uses the low five bits; H.265 uses the six bits of
    /// `header >> 1`.
    pub fn classify(header: u8, codec: Codec) -> NalUnitType {
        match codec {
            Codec::H265 => match (header >> 1) & 0x3F {
                19 => NalUnitType::HevcIdrWRadl,
                20 => NalUnitType::HevcIdrNLp,
                32 => NalUnitType::HevcVps,
                33 => NalUnitType::HevcSps,
                34 => NalUnitType::HevcPps,
                _ => NalUnitType::HevcOther,
            },
            _ => NalUnitType::from_h264_bits(header & 0x1F),
        }
    }

    /// Map the five-bit H.264 `nal_unit_type` field.
    pub fn from_h264_bits(bits: u8) -> NalUnitType {
        match bits {
            1 => NalUnitType::Slice,
            2 => NalUnitType::DataPartitionA,
            3 => NalUnitType::DataPartitionB,
            4 => NalUnitType::DataPartitionC,
            5 => NalUnitType::Idr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::AccessUnitDelimiter,
            10 => NalUnitType::EndOfSequence,
            11 => NalUnitType::EndOfStream,
            12 => NalUnitType::Filler,
            28 => NalUnitType::FuA,
            29 => NalUnitType::FuB,
            _ => NalUnitType::Unspecified,
        }
    }

    /// IDR slices and parameter sets are treated as keyframes: they are the
    /// units a decoder needs to (re)start from scratch.
    pub fn is_keyframe(self) -> bool {
        matches!(
            self,
            NalUnitType::Idr
                | NalUnitType::Sps
                | NalUnitType::Pps
                | NalUnitType::HevcVps
                | NalUnitType::HevcSps
                | NalUnitType::HevcPps
                | NalUnitType::HevcIdrWRadl
                | NalUnitType::HevcIdrNLp
        )
    }
}

/// Information extracted from a sequence parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpsInfo {
    pub width: u32,
    pub height: u32,
    /// Frames per second from VUI timing info; 25 when absent.
    pub framerate: u32,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub interlaced: bool,
}

/// Minimal picture parameter set fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PpsInfo {
    pub pps_id: u32,
    pub sps_id: u32,
    /// CABAC when true, CAVLC otherwise.
    pub entropy_coding_cabac: bool,
}

/// MSB-first bit reader with Exp-Golomb support.
///
/// Reads past the end of the buffer yield zero bits and latch the overrun
/// flag; callers inspect [`BitReader::overran`] instead of handling errors
/// per read.
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
    overran: bool,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
            overran: false,
        }
    }

    /// Read up to 32 bits, MSB first.
    pub fn read_bits(&mut self, num_bits: u32) -> u32 {
        let mut result = 0u32;
        for _ in 0..num_bits.min(32) {
            result = (result << 1) | u32::from(self.read_bit());
        }
        result
    }

    fn read_bit(&mut self) -> u8 {
        if self.byte_pos >= self.data.len() {
            self.overran = true;
            return 0;
        }
        let bit = (self.data[self.byte_pos] >> (7 - self.bit_pos)) & 1;
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
        bit
    }

    /// Read an unsigned Exp-Golomb code.
    pub fn read_ue(&mut self) -> u32 {
        let mut leading_zeros = 0u32;
        while self.read_bit() == 0 {
            if self.overran || leading_zeros > 32 {
                self.overran = true;
                return 0;
            }
            leading_zeros += 1;
        }
        if leading_zeros == 0 {
            return 0;
        }
        let suffix = self.read_bits(leading_zeros);
        ((1u64 << leading_zeros) - 1 + u64::from(suffix)) as u32
    }

    /// Read a signed Exp-Golomb code.
    pub fn read_se(&mut self) -> i32 {
        let code = self.read_ue();
        if code % 2 == 0 {
            -((code / 2) as i32)
        } else {
            ((code + 1) / 2) as i32
        }
    }

    /// True once any read has run past the end of the payload.
    pub fn overran(&self) -> bool {
        self.overran
    }

    pub fn has_more_data(&self) -> bool {
        self.byte_pos < self.data.len()
    }
}

/// True when the buffer begins with a 3- or 4-byte Annex-B start code.
pub fn has_start_code(data: &[u8]) -> bool {
    (data.len() >= 3 && data[0] == 0 && data[1] == 0 && data[2] == 1)
        || (data.len() >= 4 && data[0] == 0 && data[1] == 0 && data[2] == 0 && data[3] == 1)
}

/// Strip a leading start code, returning the NAL header and payload.
pub fn skip_start_code(data: &[u8]) -> Option<&[u8]> {
    if data.len() >= 4 && data[0] == 0 && data[1] == 0 && data[2] == 0 && data[3] == 1 {
        Some(&data[4..])
    } else if data.len() >= 3 && data[0] == 0 && data[1] == 0 && data[2] == 1 {
        Some(&data[3..])
    } else {
        None
    }
}

/// Remove emulation prevention bytes (00 00 03 -> 00 00) from a NAL payload.
pub fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zero_run = 0usize;
    for &byte in data {
        if zero_run >= 2 && byte == 0x03 {
            zero_run = 0;
            continue;
        }
        if byte == 0 {
            zero_run += 1;
        } else {
            zero_run = 0;
        }
        out.push(byte);
    }
    out
}

/// Parse an H.264 sequence parameter set.
///
/// Accepts the NAL unit with or without its start code. Returns `None` on
/// anything that does not parse cleanly through the dimension fields;
/// framerate defaults to 25 when VUI timing info is absent.
pub fn parse_sps(data: &[u8]) -> Option<SpsInfo> {
    let nal = skip_start_code(data).unwrap_or(data);
    if nal.len() < 4 {
        return None;
    }
    if NalUnitType::from_h264_bits(nal[0] & 0x1F) != NalUnitType::Sps {
        return None;
    }

    let rbsp = unescape_rbsp(&nal[1..]);
    let mut reader = BitReader::new(&rbsp);

    let profile_idc = reader.read_bits(8) as u8;
    reader.read_bits(8); // constraint flags + reserved
    let level_idc = reader.read_bits(8) as u8;
    reader.read_ue(); // seq_parameter_set_id

    if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128) {
        let chroma_format_idc = reader.read_ue();
        if chroma_format_idc == 3 {
            reader.read_bits(1); // separate_colour_plane_flag
        }
        reader.read_ue(); // bit_depth_luma_minus8
        reader.read_ue(); // bit_depth_chroma_minus8
        reader.read_bits(1); // qpprime_y_zero_transform_bypass_flag
        if reader.read_bits(1) == 1 {
            // seq_scaling_matrix_present_flag: skip the scaling lists
            for i in 0..8 {
                if reader.read_bits(1) == 1 {
                    let size = if i < 6 { 16 } else { 64 };
                    let mut last_scale = 8i32;
                    let mut next_scale = 8i32;
                    for _ in 0..size {
                        if next_scale != 0 {
                            let delta = reader.read_se();
                            next_scale = (last_scale + delta + 256) % 256;
                        }
                        if next_scale != 0 {
                            last_scale = next_scale;
                        }
                    }
                }
            }
        }
    }

    reader.read_ue(); // log2_max_frame_num_minus4

    let pic_order_cnt_type = reader.read_ue();
    if pic_order_cnt_type == 0 {
        reader.read_ue(); // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        reader.read_bits(1); // delta_pic_order_always_zero_flag
        reader.read_se(); // offset_for_non_ref_pic
        reader.read_se(); // offset_for_top_to_bottom_field
        let cycle_len = reader.read_ue().min(256);
        for _ in 0..cycle_len {
            reader.read_se(); // offset_for_ref_frame
        }
    }

    reader.read_ue(); // max_num_ref_frames
    reader.read_bits(1); // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs_minus1 = reader.read_ue();
    let pic_height_in_map_units_minus1 = reader.read_ue();

    if reader.overran() {
        return None;
    }

    let mut width = (pic_width_in_mbs_minus1 + 1).saturating_mul(16);
    let mut height = (pic_height_in_map_units_minus1 + 1).saturating_mul(16);

    let frame_mbs_only_flag = reader.read_bits(1);
    let interlaced = frame_mbs_only_flag == 0;
    if frame_mbs_only_flag == 0 {
        height = height.saturating_mul(2);
        reader.read_bits(1); // mb_adaptive_frame_field_flag
    }

    reader.read_bits(1); // direct_8x8_inference_flag

    if reader.read_bits(1) == 1 {
        // frame_cropping_flag: offsets are in chroma sample units for 4:2:0
        let left = reader.read_ue();
        let right = reader.read_ue();
        let top = reader.read_ue();
        let bottom = reader.read_ue();
        width = width.saturating_sub((left + right).saturating_mul(2));
        height = height.saturating_sub((top + bottom).saturating_mul(2));
    }

    let mut framerate = 0u32;
    if reader.read_bits(1) == 1 {
        // vui_parameters_present_flag
        if reader.read_bits(1) == 1 {
            // aspect_ratio_info_present_flag
            let aspect_ratio_idc = reader.read_bits(8);
            if aspect_ratio_idc == 255 {
                reader.read_bits(16); // sar_width
                reader.read_bits(16); // sar_height
            }
        }
        if reader.read_bits(1) == 1 {
            reader.read_bits(1); // overscan_appropriate_flag
        }
        if reader.read_bits(1) == 1 {
            // video_signal_type_present_flag
            reader.read_bits(3); // video_format
            reader.read_bits(1); // video_full_range_flag
            if reader.read_bits(1) == 1 {
                reader.read_bits(8); // colour_primaries
                reader.read_bits(8); // transfer_characteristics
                reader.read_bits(8); // matrix_coefficients
            }
        }
        if reader.read_bits(1) == 1 {
            // chroma_loc_info_present_flag
            reader.read_ue();
            reader.read_ue();
        }
        if reader.read_bits(1) == 1 {
            // timing_info_present_flag
            let num_units_in_tick = reader.read_bits(32);
            let time_scale = reader.read_bits(32);
            if num_units_in_tick > 0 && !reader.overran() {
                framerate = time_scale / (2 * num_units_in_tick);
            }
        }
    }

    if framerate == 0 {
        framerate = 25;
    }

    if width == 0 || height == 0 {
        return None;
    }

    Some(SpsInfo {
        width,
        height,
        framerate,
        profile_idc,
        level_idc,
        interlaced,
    })
}

/// Parse the leading fields of an H.264 picture parameter set.
pub fn parse_pps(data: &[u8]) -> Option<PpsInfo> {
    let nal = skip_start_code(data).unwrap_or(data);
    if nal.len() < 2 {
        return None;
    }
    if NalUnitType::from_h264_bits(nal[0] & 0x1F) != NalUnitType::Pps {
        return None;
    }

    let rbsp = unescape_rbsp(&nal[1..]);
    let mut reader = BitReader::new(&rbsp);
    let pps_id = reader.read_ue();
    let sps_id = reader.read_ue();
    let entropy_coding_cabac = reader.read_bits(1) == 1;

    if reader.overran() {
        return None;
    }

    Some(PpsInfo {
        pps_id,
        sps_id,
        entropy_coding_cabac,
    })
}
