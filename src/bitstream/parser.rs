//! Annex-B bitstream splitting.
//!
//! The RTSP layer hands over elementary-stream buffers that may contain any
//! number of concatenated NAL units. Splitting is stateless: every call
//! stands alone, and input without a start code yields nothing.

use super::h264::{self, NalUnitType, SpsInfo};
use crate::types::Codec;

/// A NAL unit cut out of an Annex-B buffer.
///
/// `data` always begins with the 3- or 4-byte start code it was found with.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub data: Vec<u8>,
    pub nal_type: NalUnitType,
    pub keyframe: bool,
    /// Presentation timestamp in microseconds.
    pub pts: i64,
    /// Decode timestamp in microseconds.
    pub dts: i64,
    /// Populated for SPS units that parse cleanly.
    pub sps: Option<SpsInfo>,
}

impl NalUnit {
    /// Build a unit from raw bytes that start with an Annex-B start code;
    /// classifies, flags keyframes, and parses SPS payloads.
    pub fn from_annex_b(data: Vec<u8>, pts: i64, codec: Codec) -> Option<NalUnit> {
        let payload = h264::skip_start_code(&data)?;
        let header = *payload.first()?;
        let nal_type = NalUnitType::classify(header, codec);
        let sps = if nal_type == NalUnitType::Sps {
            h264::parse_sps(&data)
        } else {
            None
        };

        Some(NalUnit {
            keyframe: nal_type.is_keyframe(),
            nal_type,
            pts,
            dts: pts,
            sps,
            data,
        })
    }
}

/// Split an Annex-B buffer into NAL units, keeping each unit's start code.
///
/// Returns an empty vector when the buffer contains no start code.
pub fn parse_annex_b(data: &[u8], pts: i64, codec: Codec) -> Vec<NalUnit> {
    let boundaries = find_start_codes(data);
    let mut units = Vec::with_capacity(boundaries.len());

    for (index, &start) in boundaries.iter().enumerate() {
        let end = boundaries
            .get(index + 1)
            .copied()
            .unwrap_or(data.len());
        if end > start {
            if let Some(unit) = NalUnit::from_annex_b(data[start..end].to_vec(), pts, codec) {
                units.push(unit);
            }
        }
    }

    units
}

/// Positions of every 3-byte and 4-byte start code in the buffer.
fn find_start_codes(data: &[u8]) -> Vec<usize> {
    let mut positions = Vec::new();
    if data.len() < 3 {
        return positions;
    }

    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            positions.push(i);
            i += 3;
        } else if i + 3 < data.len()
            && data[i] == 0
            && data[i + 1] == 0
            && data[i + 2] == 0
            && data[i + 3] == 1
        {
            positions.push(i);
            i += 4;
        } else {
            i += 1;
        }
    }

    positions
}

/// Convert codec extradata into Annex-B NAL units.
///
/// Accepts an AVCDecoderConfigurationRecord (first byte 0x01 with
/// length-prefixed SPS and PPS lists, per ISO/IEC 14496-15) or a raw Annex-B
/// buffer; emits Annex-B units with 4-byte start codes in both cases.
pub fn extradata_to_nal_units(data: &[u8], codec: Codec) -> Vec<NalUnit> {
    if data.len() < 7 || data[0] != 1 {
        // Raw Annex-B, or too small to be a configuration record.
        return parse_annex_b(data, 0, codec);
    }

    let mut units = Vec::new();
    // Skip configurationVersion, profile, compatibility, level,
    // lengthSizeMinusOne.
    let mut offset = 5;

    let num_sps = (data[offset] & 0x1F) as usize;
    offset += 1;
    for _ in 0..num_sps {
        match read_prefixed(data, &mut offset) {
            Some(payload) => {
                if let Some(unit) = NalUnit::from_annex_b(with_start_code(payload), 0, codec) {
                    units.push(unit);
                }
            }
            None => return units,
        }
    }

    if offset >= data.len() {
        return units;
    }
    let num_pps = data[offset] as usize;
    offset += 1;
    for _ in 0..num_pps {
        match read_prefixed(data, &mut offset) {
            Some(payload) => {
                if let Some(unit) = NalUnit::from_annex_b(with_start_code(payload), 0, codec) {
                    units.push(unit);
                }
            }
            None => return units,
        }
    }

    units
}

/// Read one 16-bit-length-prefixed blob, advancing the offset.
fn read_prefixed<'a>(data: &'a [u8], offset: &mut usize) -> Option<&'a [u8]> {
    if *offset + 2 > data.len() {
        return None;
    }
    let len = ((data[*offset] as usize) << 8) | data[*offset + 1] as usize;
    *offset += 2;
    if *offset + len > data.len() {
        return None;
    }
    let payload = &data[*offset..*offset + len];
    *offset += len;
    Some(payload)
}

fn with_start_code(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_start_code_yields_nothing() {
        assert!(parse_annex_b(&[0x65, 0x88, 0x84], 0, Codec::H264).is_empty());
        assert!(parse_annex_b(&[], 0, Codec::H264).is_empty());
        assert!(parse_annex_b(&[0x00, 0x00], 0, Codec::H264).is_empty());
    }

    #[test]
    fn splits_mixed_start_code_lengths() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x65, 0xAA]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x41, 0xBB]);
        let units = parse_annex_b(&data, 1_000, Codec::H264);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].nal_type, NalUnitType::Idr);
        assert_eq!(units[0].data, vec![0x00, 0x00, 0x01, 0x65, 0xAA]);
        assert_eq!(units[1].nal_type, NalUnitType::Slice);
        assert_eq!(units[1].pts, 1_000);
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let input: Vec<u8> = [
            &[0x00u8, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x0A][..],
            &[0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x01, 0x0F][..],
            &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84][..],
        ]
        .concat();
        let units = parse_annex_b(&input, 0, Codec::H264);
        let rejoined: Vec<u8> = units.iter().flat_map(|u| u.data.clone()).collect();
        assert_eq!(rejoined, input);
    }

    #[test]
    fn avcc_extradata_converts_to_annex_b() {
        // configurationVersion=1, then one SPS and one PPS, length-prefixed.
        let sps_payload = [0x67, 0x42, 0x00, 0x0A, 0x8C, 0x8D, 0x40];
        let pps_payload = [0x68, 0xCE, 0x01, 0x0F];
        let mut record = vec![0x01, 0x42, 0x00, 0x0A, 0xFF, 0xE1];
        record.extend_from_slice(&(sps_payload.len() as u16).to_be_bytes());
        record.extend_from_slice(&sps_payload);
        record.push(0x01);
        record.extend_from_slice(&(pps_payload.len() as u16).to_be_bytes());
        record.extend_from_slice(&pps_payload);

        let units = extradata_to_nal_units(&record, Codec::H264);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].nal_type, NalUnitType::Sps);
        assert!(units[0].data.starts_with(&[0x00, 0x00, 0x00, 0x01]));
        assert_eq!(units[1].nal_type, NalUnitType::Pps);
        assert!(units[1].keyframe);
    }

    #[test]
    fn annex_b_extradata_passes_through() {
        let data = [0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x01, 0x0F];
        let units = extradata_to_nal_units(&data, Codec::H264);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].nal_type, NalUnitType::Pps);
    }

    #[test]
    fn truncated_avcc_record_is_not_a_panic() {
        let record = vec![0x01, 0x42, 0x00, 0x0A, 0xFF, 0xE1, 0x00, 0xFF];
        let units = extradata_to_nal_units(&record, Codec::H264);
        assert!(units.is_empty());
    }
}
