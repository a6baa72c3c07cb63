//! RTP depacketization for H.264.
//!
//! Deployments that receive raw RTP (UDP multicast, custom relays) bypass
//! libavformat's depacketizer; this module reassembles NAL units from RTP
//! payloads instead: single NAL packets pass through, FU-A fragments are
//! reassembled, and sequence gaps abandon in-flight fragments so a lost
//! middle fragment cannot splice two pictures together.

use crate::bitstream::NalUnit;
use crate::types::Codec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One RTP packet payload plus the header fields the depacketizer needs.
#[derive(Debug, Clone, Default)]
pub struct RtpPacket {
    pub sequence_number: u16,
    /// Presentation timestamp in microseconds.
    pub timestamp: i64,
    pub marker: bool,
    /// RTP payload with the 12-byte RTP header already stripped.
    pub payload: Vec<u8>,
}

/// Depacketizer counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DepacketizerStats {
    pub packets_processed: u64,
    pub nal_units_extracted: u64,
    pub fragmented_nal_units: u64,
    pub packets_lost: u64,
    pub packets_out_of_order: u64,
}

/// Reassembles Annex-B NAL units from RTP payloads.
///
/// Owned and driven by a single network task; not internally synchronized.
pub struct RtpDepacketizer {
    units: VecDeque<NalUnit>,
    fragment: Vec<u8>,
    fragment_in_progress: bool,
    fragment_pts: i64,
    last_sequence: u16,
    first_packet: bool,
    stats: DepacketizerStats,
}

impl RtpDepacketizer {
    pub fn new() -> Self {
        Self {
            units: VecDeque::new(),
            fragment: Vec::with_capacity(256 * 1024),
            fragment_in_progress: false,
            fragment_pts: 0,
            last_sequence: 0,
            first_packet: true,
            stats: DepacketizerStats::default(),
        }
    }

    /// Feed one RTP packet. Returns false when the packet was dropped
    /// (empty, out of order, or an unsupported payload type).
    pub fn add_packet(&mut self, packet: &RtpPacket) -> bool {
        if packet.payload.is_empty() {
            return false;
        }

        if !self.first_packet {
            let expected = self.last_sequence.wrapping_add(1);
            if packet.sequence_number != expected {
                let gap = packet.sequence_number.wrapping_sub(expected);
                if gap < u16::MAX / 2 {
                    // Forward gap: packets were lost on the wire. Any
                    // fragment in flight is missing data and must go.
                    self.stats.packets_lost += u64::from(gap);
                    if self.fragment_in_progress {
                        self.abandon_fragment();
                    }
                } else {
                    self.stats.packets_out_of_order += 1;
                    return false;
                }
            }
        }
        self.last_sequence = packet.sequence_number;
        self.first_packet = false;
        self.stats.packets_processed += 1;

        let nal_type = packet.payload[0] & 0x1F;
        match nal_type {
            1..=23 => self.process_single(packet),
            28 => self.process_fu_a(packet),
            other => {
                log::debug!("RtpDepacketizer: unsupported payload NAL type {}", other);
                false
            }
        }
    }

    fn process_single(&mut self, packet: &RtpPacket) -> bool {
        if self.fragment_in_progress {
            // A single NAL arriving mid-fragment means the end fragment was
            // lost without a sequence gap we could see.
            self.abandon_fragment();
        }

        let mut data = Vec::with_capacity(packet.payload.len() + 4);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        data.extend_from_slice(&packet.payload);
        self.finish_unit(data, packet.timestamp)
    }

    fn process_fu_a(&mut self, packet: &RtpPacket) -> bool {
        if packet.payload.len() < 2 {
            return false;
        }

        let fu_indicator = packet.payload[0];
        let fu_header = packet.payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;

        if start {
            if self.fragment_in_progress {
                log::warn!("RtpDepacketizer: new fragment before previous completed");
                self.abandon_fragment();
            }
            self.fragment_in_progress = true;
            self.fragment_pts = packet.timestamp;

            // Rebuild the NAL header from the FU indicator's ref bits and
            // the FU header's type bits.
            let nal_header = (fu_indicator & 0xE0) | (fu_header & 0x1F);
            self.fragment.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, nal_header]);
        } else if !self.fragment_in_progress {
            // Middle or end fragment with no start seen; drop it.
            return false;
        }

        self.fragment.extend_from_slice(&packet.payload[2..]);

        if end {
            let data = std::mem::take(&mut self.fragment);
            self.fragment_in_progress = false;
            self.stats.fragmented_nal_units += 1;
            let pts = self.fragment_pts;
            return self.finish_unit(data, pts);
        }

        true
    }

    fn finish_unit(&mut self, data: Vec<u8>, pts: i64) -> bool {
        match NalUnit::from_annex_b(data, pts, Codec::H264) {
            Some(unit) => {
                self.units.push_back(unit);
                self.stats.nal_units_extracted += 1;
                true
            }
            None => false,
        }
    }

    fn abandon_fragment(&mut self) {
        self.fragment.clear();
        self.fragment_in_progress = false;
    }

    /// Next complete NAL unit, oldest first.
    pub fn next_nal_unit(&mut self) -> Option<NalUnit> {
        self.units.pop_front()
    }

    pub fn has_nal_units(&self) -> bool {
        !self.units.is_empty()
    }

    pub fn nal_unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn stats(&self) -> DepacketizerStats {
        self.stats
    }

    /// Drop queued units and any fragment in flight; counters are kept.
    pub fn reset(&mut self) {
        self.units.clear();
        self.abandon_fragment();
        self.first_packet = true;
    }
}

impl Default for RtpDepacketizer {
    fn default() -> Self {
        Self::new()
    }
}
