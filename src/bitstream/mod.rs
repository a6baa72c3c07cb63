//! H.264/H.265 bitstream handling: Annex-B NAL unit splitting and
//! parameter-set parsing.

pub mod h264;
pub mod parser;

pub use h264::{parse_pps, parse_sps, BitReader, NalUnitType, PpsInfo, SpsInfo};
pub use parser::{extradata_to_nal_units, parse_annex_b, NalUnit};
