use serde_json::{json, Value};
use thiserror::Error;

use super::header::RtpHeader;
use super::{Pt, Ssrc};

/// RTP parse/serialize errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtpError {
    #[error("rtp packet too short")]
    TooShort,

    #[error("bad rtp version: {0}")]
    BadVersion(u8),
}

/// An owned RTP packet: raw bytes plus the parsed header.
///
/// Mutators write through to the underlying bytes so a packet can be
/// rewritten in place for forwarding and restored afterwards. Packets are
/// shared across consumers of the same producer, so any rewrite must be
/// undone before the packet is handed to the next consumer.
///
/// Whether the packet starts a decodable frame (`keyframe`) and its
/// temporal layer are facts the payload-aware ingress side stamps on the
/// packet; the forwarding core only reads them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    data: Vec<u8>,
    header: RtpHeader,
    keyframe: bool,
    temporal_layer: Option<u8>,
}

impl RtpPacket {
    pub fn parse(data: Vec<u8>) -> Result<RtpPacket, RtpError> {
        let header = RtpHeader::parse(&data)?;

        Ok(RtpPacket {
            data,
            header,
            keyframe: false,
            temporal_layer: None,
        })
    }

    /// Build a packet from parts. Mostly useful for tests and padding
    /// generation; real traffic enters via [`RtpPacket::parse`].
    pub fn build(ssrc: Ssrc, pt: Pt, seq: u16, timestamp: u32, payload: &[u8]) -> RtpPacket {
        let mut data = vec![0u8; 12 + payload.len()];
        data[0] = 0x80;
        data[1] = *pt & 0x7F;
        data[2..4].copy_from_slice(&seq.to_be_bytes());
        data[4..8].copy_from_slice(&timestamp.to_be_bytes());
        data[8..12].copy_from_slice(&ssrc.to_be_bytes());
        data[12..].copy_from_slice(payload);

        RtpPacket::parse(data).expect("well formed packet")
    }

    /// Build a padding-only packet: no payload, `pad_len` padding bytes
    /// with the length in the last byte per RFC 3550.
    pub fn padding(ssrc: Ssrc, pt: Pt, seq: u16, pad_len: u8) -> RtpPacket {
        assert!(pad_len > 0);

        let mut data = vec![0u8; 12 + pad_len as usize];
        data[0] = 0x80 | 0b0010_0000;
        data[1] = *pt & 0x7F;
        data[2..4].copy_from_slice(&seq.to_be_bytes());
        data[8..12].copy_from_slice(&ssrc.to_be_bytes());
        let last = data.len() - 1;
        data[last] = pad_len;

        RtpPacket::parse(data).expect("well formed padding packet")
    }

    pub fn ssrc(&self) -> Ssrc {
        self.header.ssrc
    }

    pub fn payload_type(&self) -> Pt {
        self.header.payload_type
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn marker(&self) -> bool {
        self.header.marker
    }

    pub fn is_keyframe(&self) -> bool {
        self.keyframe
    }

    pub fn temporal_layer(&self) -> Option<u8> {
        self.temporal_layer
    }

    pub fn header(&self) -> &RtpHeader {
        &self.header
    }

    /// Total size on the wire.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn padding_len(&self) -> usize {
        if self.header.has_padding {
            *self.data.last().unwrap_or(&0) as usize
        } else {
            0
        }
    }

    /// The payload without header and padding.
    pub fn payload(&self) -> &[u8] {
        let start = self.header.header_len;
        let end = self.data.len().saturating_sub(self.padding_len()).max(start);
        &self.data[start..end]
    }

    pub fn set_ssrc(&mut self, ssrc: Ssrc) {
        self.header.ssrc = ssrc;
        self.data[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }

    pub fn set_sequence_number(&mut self, seq: u16) {
        self.header.sequence_number = seq;
        self.data[2..4].copy_from_slice(&seq.to_be_bytes());
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.header.timestamp = timestamp;
        self.data[4..8].copy_from_slice(&timestamp.to_be_bytes());
    }

    pub fn set_payload_type(&mut self, pt: Pt) {
        self.header.payload_type = pt;
        self.data[1] = (self.data[1] & 0x80) | (*pt & 0x7F);
    }

    pub fn set_keyframe(&mut self, keyframe: bool) {
        self.keyframe = keyframe;
    }

    pub fn set_temporal_layer(&mut self, layer: Option<u8>) {
        self.temporal_layer = layer;
    }

    /// Rewrite the transport-wide CC extension value (two byte sequence
    /// number). Returns false when the packet does not carry the
    /// extension.
    pub fn update_transport_wide_cc01(&mut self, id: u8, seq: u16) -> bool {
        let Some((off, len)) = self.header.find_extension(&self.data, id) else {
            return false;
        };

        if len < 2 {
            return false;
        }

        self.data[off..off + 2].copy_from_slice(&seq.to_be_bytes());
        true
    }

    /// Read an extension element's raw data by id.
    pub fn extension(&self, id: u8) -> Option<&[u8]> {
        let (off, len) = self.header.find_extension(&self.data, id)?;
        Some(&self.data[off..off + len])
    }

    /// Produce the RTX form of this packet per RFC 4588: RTX SSRC/PT, its
    /// own sequence number, and the original sequence number (OSN)
    /// prefixed to the payload.
    pub fn rtx_encode(&self, pt: Pt, ssrc: Ssrc, seq: u16) -> RtpPacket {
        let osn = self.header.sequence_number;

        let mut data = Vec::with_capacity(self.data.len() + 2);
        data.extend_from_slice(&self.data[..self.header.header_len]);
        data.extend_from_slice(&osn.to_be_bytes());
        data.extend_from_slice(&self.data[self.header.header_len..]);

        let mut packet = RtpPacket::parse(data).expect("rtx packet from well formed original");
        packet.set_ssrc(ssrc);
        packet.set_payload_type(pt);
        packet.set_sequence_number(seq);
        packet.keyframe = self.keyframe;
        packet.temporal_layer = self.temporal_layer;

        packet
    }

    /// JSON snapshot of the header for packet event notifications.
    pub fn header_json(&self) -> Value {
        json!({
            "ssrc": *self.header.ssrc,
            "payloadType": *self.header.payload_type,
            "sequenceNumber": self.header.sequence_number,
            "timestamp": self.header.timestamp,
            "marker": self.header.marker,
            "isKeyFrame": self.keyframe,
            "size": self.size(),
            "payloadSize": self.payload().len(),
        })
    }
}
