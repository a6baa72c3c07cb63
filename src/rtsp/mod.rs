//! RTSP ingest: session negotiation, elementary-stream reception, and raw
//! RTP depacketization.

pub mod client;
pub mod depacketizer;

pub use client::{ConnectionState, NetworkStats, RtspClient, RtspConfig, StreamInfo, Transport};
pub use depacketizer::{DepacketizerStats, RtpDepacketizer, RtpPacket};
