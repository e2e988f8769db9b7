//! RTCP packet model.
//!
//! Each packet type knows its own header and serialized length in words,
//! and parses from the packet body (the demultiplexing of compound
//! packets by type/fmt happens at the transport). Sender reports and SDES
//! chunks are what the send side produces; receiver reports, NACK, PLI,
//! FIR, REMB and transport-wide feedback are consumed from the remote.

use crate::rtp::Ssrc;

mod fir;
mod nack;
mod pli;
mod remb;
mod rr;
mod sdes;
mod sr;
mod twcc;

pub use fir::{Fir, FirEntry};
pub use nack::{Nack, NackEntry};
pub use pli::Pli;
pub use remb::Remb;
pub use rr::{ReceiverReport, ReceptionReport};
pub use sdes::{Sdes, SdesPacket};
pub use sr::SenderReport;
pub use twcc::{PacketStatus, TransportFeedback};

/// Which keyframe request feedback arrived, PLI or FIR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFrameRequestKind {
    Pli,
    Fir,
}

/// RTCP packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpType {
    SenderReport = 200,
    ReceiverReport = 201,
    SourceDescription = 202,
    Goodbye = 203,
    ApplicationDefined = 204,
    TransportLayerFeedback = 205,
    PayloadSpecificFeedback = 206,
    ExtendedReport = 207,
}

/// Feedback format (FMT) values used in the count field of feedback
/// packets.
pub(crate) mod fmt {
    /// Transport layer: NACK.
    pub const NACK: u8 = 1;
    /// Transport layer: transport-wide congestion control.
    pub const TWCC: u8 = 15;
    /// Payload specific: picture loss indication.
    pub const PLI: u8 = 1;
    /// Payload specific: full intra request.
    pub const FIR: u8 = 4;
    /// Payload specific: application layer feedback (REMB).
    pub const AFB: u8 = 15;
}

/// The common 4 byte RTCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub rtcp_type: RtcpType,
    /// Report count or feedback FMT, depending on type.
    pub count: u8,
    /// Packet length in 32 bit words, minus one.
    pub words_less_one: u16,
}

impl RtcpHeader {
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = 0b10_000000 | (self.count & 0b0001_1111);
        buf[1] = self.rtcp_type as u8;
        buf[2..4].copy_from_slice(&self.words_less_one.to_be_bytes());
    }
}

/// Common behavior of all serializable RTCP packet types.
pub trait RtcpPacket {
    /// The header this packet starts with.
    fn header(&self) -> RtcpHeader;

    /// Total length in 32 bit words, including the header.
    fn length_words(&self) -> usize;

    /// Write the full packet. `buf` must hold `length_words() * 4` bytes.
    /// Returns bytes written.
    fn write_to(&self, buf: &mut [u8]) -> usize;
}

/// A compound RTCP packet under construction: sender reports first, then
/// one SDES packet carrying the chunks.
#[derive(Debug, Default)]
pub struct CompoundPacket {
    sender_reports: Vec<SenderReport>,
    sdes_chunks: Vec<Sdes>,
}

impl CompoundPacket {
    pub fn new() -> CompoundPacket {
        CompoundPacket::default()
    }

    pub fn add_sender_report(&mut self, report: SenderReport) {
        self.sender_reports.push(report);
    }

    pub fn add_sdes_chunk(&mut self, chunk: Sdes) {
        self.sdes_chunks.push(chunk);
    }

    pub fn sender_report_count(&self) -> usize {
        self.sender_reports.len()
    }

    pub fn sender_reports(&self) -> &[SenderReport] {
        &self.sender_reports
    }

    pub fn sdes_chunk_count(&self) -> usize {
        self.sdes_chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender_reports.is_empty() && self.sdes_chunks.is_empty()
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        let mut words = 0;
        for sr in &self.sender_reports {
            words += sr.length_words();
        }
        if !self.sdes_chunks.is_empty() {
            words += SdesPacket::length_words_for(&self.sdes_chunks);
        }
        words * 4
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size()];
        let mut pos = 0;

        for sr in &self.sender_reports {
            pos += sr.write_to(&mut out[pos..]);
        }

        if !self.sdes_chunks.is_empty() {
            let sdes = SdesPacket {
                chunks: self.sdes_chunks.clone(),
            };
            pos += sdes.write_to(&mut out[pos..]);
        }

        debug_assert_eq!(pos, out.len());
        out
    }
}

pub(crate) fn read_ssrc(buf: &[u8]) -> Ssrc {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into()
}
