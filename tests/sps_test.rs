//! SPS/PPS parser tests against synthetically assembled parameter sets.
//!
//! The bit writer below assembles SPS payloads field by field, so each test
//! controls exactly which branches of the parser run.

use gridstream::bitstream::{parse_pps, parse_sps};

/// MSB-first bit writer mirroring the parser's reader.
struct BitWriter {
    bytes: Vec<u8>,
    bit_pos: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bit_pos: 0,
        }
    }

    fn write_bit(&mut self, bit: u32) {
        if self.bit_pos == 0 {
            self.bytes.push(0);
        }
        if bit != 0 {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 1 << (7 - self.bit_pos);
        }
        self.bit_pos = (self.bit_pos + 1) % 8;
    }

    fn write_bits(&mut self, value: u32, num_bits: u32) {
        for i in (0..num_bits).rev() {
            self.write_bit((value >> i) & 1);
        }
    }

    fn write_ue(&mut self, value: u32) {
        let code = value + 1;
        let bits = 32 - code.leading_zeros();
        for _ in 0..bits - 1 {
            self.write_bit(0);
        }
        self.write_bits(code, bits);
    }

    fn finish(mut self) -> Vec<u8> {
        // rbsp_stop_one_bit and alignment.
        self.write_bit(1);
        while self.bit_pos != 0 {
            self.write_bit(0);
        }
        self.bytes
    }
}

struct SpsParams {
    profile_idc: u32,
    level_idc: u32,
    width_mbs_minus1: u32,
    height_map_units_minus1: u32,
    frame_mbs_only: bool,
    crop: Option<(u32, u32, u32, u32)>,
    timing: Option<(u32, u32)>,
}

impl Default for SpsParams {
    fn default() -> Self {
        Self {
            profile_idc: 66,
            level_idc: 30,
            width_mbs_minus1: 119,      // 1920
            height_map_units_minus1: 67, // 1088
            frame_mbs_only: true,
            crop: Some((0, 0, 0, 4)), // 1088 -> 1080
            timing: Some((1, 60)),    // 30 fps
        }
    }
}

/// Assemble a full SPS NAL unit (header byte included, no start code).
fn build_sps(params: &SpsParams) -> Vec<u8> {
    let mut writer = BitWriter::new();
    writer.write_bits(params.profile_idc, 8);
    writer.write_bits(0, 8); // constraint flags + reserved
    writer.write_bits(params.level_idc, 8);
    writer.write_ue(0); // seq_parameter_set_id

    if matches!(params.profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128) {
        writer.write_ue(1); // chroma_format_idc = 4:2:0
        writer.write_ue(0); // bit_depth_luma_minus8
        writer.write_ue(0); // bit_depth_chroma_minus8
        writer.write_bits(0, 1); // qpprime_y_zero_transform_bypass_flag
        writer.write_bits(0, 1); // seq_scaling_matrix_present_flag
    }

    writer.write_ue(0); // log2_max_frame_num_minus4
    writer.write_ue(0); // pic_order_cnt_type = 0
    writer.write_ue(0); // log2_max_pic_order_cnt_lsb_minus4
    writer.write_ue(1); // max_num_ref_frames
    writer.write_bits(0, 1); // gaps_in_frame_num_value_allowed_flag
    writer.write_ue(params.width_mbs_minus1);
    writer.write_ue(params.height_map_units_minus1);
    writer.write_bits(u32::from(params.frame_mbs_only), 1);
    if !params.frame_mbs_only {
        writer.write_bits(0, 1); // mb_adaptive_frame_field_flag
    }
    writer.write_bits(0, 1); // direct_8x8_inference_flag

    match params.crop {
        Some((left, right, top, bottom)) => {
            writer.write_bits(1, 1);
            writer.write_ue(left);
            writer.write_ue(right);
            writer.write_ue(top);
            writer.write_ue(bottom);
        }
        None => writer.write_bits(0, 1),
    }

    match params.timing {
        Some((num_units_in_tick, time_scale)) => {
            writer.write_bits(1, 1); // vui_parameters_present_flag
            writer.write_bits(0, 1); // aspect_ratio_info_present_flag
            writer.write_bits(0, 1); // overscan_info_present_flag
            writer.write_bits(0, 1); // video_signal_type_present_flag
            writer.write_bits(0, 1); // chroma_loc_info_present_flag
            writer.write_bits(1, 1); // timing_info_present_flag
            writer.write_bits(num_units_in_tick, 32);
            writer.write_bits(time_scale, 32);
        }
        None => writer.write_bits(0, 1),
    }

    let mut nal = vec![0x67];
    nal.extend(writer.finish());
    nal
}

/// Insert emulation prevention bytes the way an encoder would.
fn escape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zero_run = 0;
    for &byte in data {
        if zero_run >= 2 && byte <= 0x03 {
            out.push(0x03);
            zero_run = 0;
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

mod sps_tests {
    use super::*;

    #[test]
    fn test_1080p_dimensions_and_framerate() {
        let sps = build_sps(&SpsParams::default());
        let info = parse_sps(&sps).expect("SPS must parse");
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.framerate, 30);
        assert_eq!(info.profile_idc, 66);
        assert_eq!(info.level_idc, 30);
        assert!(!info.interlaced);
    }

    #[test]
    fn test_with_start_code_prefix() {
        let mut data = vec![0x00, 0x00, 0x00, 0x01];
        data.extend(build_sps(&SpsParams::default()));
        let info = parse_sps(&data).expect("SPS with start code must parse");
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
    }

    #[test]
    fn test_emulation_prevention_bytes_are_stripped() {
        // num_units_in_tick = 1 written as 32 bits produces 00 00 00 01 in
        // the payload, which an encoder escapes. Parsing the escaped and
        // unescaped payloads must agree.
        let nal = build_sps(&SpsParams::default());
        let mut escaped = vec![nal[0]];
        escaped.extend(escape_rbsp(&nal[1..]));
        assert_ne!(nal, escaped, "escaping must have inserted 0x03 bytes");

        let plain = parse_sps(&nal).expect("plain payload");
        let unescaped = parse_sps(&escaped).expect("escaped payload");
        assert_eq!(plain, unescaped);
    }

    #[test]
    fn test_cropping_reduces_dimensions() {
        let cropped = parse_sps(&build_sps(&SpsParams {
            crop: Some((2, 2, 0, 4)),
            ..SpsParams::default()
        }))
        .unwrap();
        let uncropped = parse_sps(&build_sps(&SpsParams {
            crop: None,
            ..SpsParams::default()
        }))
        .unwrap();

        assert_eq!(uncropped.width, 1920);
        assert_eq!(uncropped.height, 1088);
        assert_eq!(cropped.width, 1920 - 8);
        assert_eq!(cropped.height, 1080);
        assert!(cropped.width < uncropped.width);
        assert!(cropped.height < uncropped.height);
    }

    #[test]
    fn test_default_framerate_without_vui() {
        let info = parse_sps(&build_sps(&SpsParams {
            timing: None,
            ..SpsParams::default()
        }))
        .unwrap();
        assert_eq!(info.framerate, 25);
    }

    #[test]
    fn test_interlaced_doubles_height() {
        let info = parse_sps(&build_sps(&SpsParams {
            frame_mbs_only: false,
            height_map_units_minus1: 33, // 34 map units -> 544, doubled 1088
            crop: Some((0, 0, 0, 4)),
            ..SpsParams::default()
        }))
        .unwrap();
        assert!(info.interlaced);
        assert_eq!(info.height, 1080);
    }

    #[test]
    fn test_high_profile_chroma_branch() {
        let info = parse_sps(&build_sps(&SpsParams {
            profile_idc: 100,
            ..SpsParams::default()
        }))
        .unwrap();
        assert_eq!(info.profile_idc, 100);
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.framerate, 30);
    }

    #[test]
    fn test_sub_stream_resolution() {
        let info = parse_sps(&build_sps(&SpsParams {
            width_mbs_minus1: 39,        // 640
            height_map_units_minus1: 22, // 368
            crop: Some((0, 0, 0, 4)),    // -> 360
            timing: Some((1, 30)),       // 15 fps
            ..SpsParams::default()
        }))
        .unwrap();
        assert_eq!(info.width, 640);
        assert_eq!(info.height, 360);
        assert_eq!(info.framerate, 15);
    }

    #[test]
    fn test_dimensions_always_positive() {
        let info = parse_sps(&build_sps(&SpsParams::default())).unwrap();
        assert!(info.width > 0);
        assert!(info.height > 0);
        assert!(info.framerate > 0);
    }

    #[test]
    fn test_truncated_payload_returns_none() {
        let sps = build_sps(&SpsParams::default());
        // Cut before the dimension fields.
        assert_eq!(parse_sps(&sps[..4]), None);
    }

    #[test]
    fn test_wrong_nal_type_returns_none() {
        let mut sps = build_sps(&SpsParams::default());
        sps[0] = 0x65; // IDR header instead of SPS
        assert_eq!(parse_sps(&sps), None);
    }
}

mod pps_tests {
    use super::*;

    fn build_pps(pps_id: u32, sps_id: u32, cabac: bool) -> Vec<u8> {
        let mut writer = BitWriter::new();
        writer.write_ue(pps_id);
        writer.write_ue(sps_id);
        writer.write_bits(u32::from(cabac), 1);
        let mut nal = vec![0x68];
        nal.extend(writer.finish());
        nal
    }

    #[test]
    fn test_pps_fields() {
        let info = parse_pps(&build_pps(3, 1, true)).expect("PPS must parse");
        assert_eq!(info.pps_id, 3);
        assert_eq!(info.sps_id, 1);
        assert!(info.entropy_coding_cabac);

        let info = parse_pps(&build_pps(0, 0, false)).unwrap();
        assert_eq!(info.pps_id, 0);
        assert!(!info.entropy_coding_cabac);
    }

    #[test]
    fn test_pps_with_start_code() {
        let mut data = vec![0x00, 0x00, 0x01];
        data.extend(build_pps(1, 0, true));
        assert!(parse_pps(&data).is_some());
    }

    #[test]
    fn test_pps_rejects_wrong_type() {
        let mut pps = build_pps(0, 0, false);
        pps[0] = 0x67;
        assert_eq!(parse_pps(&pps), None);
    }
}
