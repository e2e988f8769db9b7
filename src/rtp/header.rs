use serde::{Deserialize, Serialize};

use super::packet::RtpError;
use super::{Pt, Ssrc};

/// Parsed fixed header of an RTP packet.
///
/// `header_len` covers the 12 fixed bytes plus CSRCs plus the extension
/// block, i.e. the offset where the payload starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Always 2.
    pub version: u8,
    /// Whether the payload ends with padding bytes.
    pub has_padding: bool,
    /// Whether an extension block follows the CSRCs.
    pub has_extension: bool,
    /// Number of contributing sources (0-15).
    pub csrc_count: u8,
    /// For video, marks the last packet of a frame. For audio, the start
    /// of a talkspurt.
    pub marker: bool,
    /// Payload type carried.
    pub payload_type: Pt,
    /// Wire sequence number.
    pub sequence_number: u16,
    /// Media time in the codec's clock rate.
    pub timestamp: u32,
    /// Sending source identifier.
    pub ssrc: Ssrc,
    /// Length of the full header (payload offset).
    pub header_len: usize,
}

impl RtpHeader {
    pub fn parse(buf: &[u8]) -> Result<RtpHeader, RtpError> {
        if buf.len() < 12 {
            return Err(RtpError::TooShort);
        }

        let version = buf[0] >> 6;
        if version != 2 {
            return Err(RtpError::BadVersion(version));
        }

        let has_padding = buf[0] & 0b0010_0000 != 0;
        let has_extension = buf[0] & 0b0001_0000 != 0;
        let csrc_count = buf[0] & 0b0000_1111;

        let marker = buf[1] & 0b1000_0000 != 0;
        let payload_type = Pt::from(buf[1] & 0b0111_1111);

        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]).into();

        let mut header_len = 12 + csrc_count as usize * 4;

        if buf.len() < header_len {
            return Err(RtpError::TooShort);
        }

        if has_extension {
            if buf.len() < header_len + 4 {
                return Err(RtpError::TooShort);
            }

            let words = u16::from_be_bytes([buf[header_len + 2], buf[header_len + 3]]) as usize;
            header_len += 4 + words * 4;

            if buf.len() < header_len {
                return Err(RtpError::TooShort);
            }
        }

        Ok(RtpHeader {
            version,
            has_padding,
            has_extension,
            csrc_count,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            header_len,
        })
    }

    /// Locate an extension element by id. Returns (offset, len) of the
    /// element data within `buf`. Handles the one-byte (0xBEDE) and
    /// two-byte (0x100x) forms.
    pub(crate) fn find_extension(&self, buf: &[u8], id: u8) -> Option<(usize, usize)> {
        if !self.has_extension || id == 0 {
            return None;
        }

        let ext_start = 12 + self.csrc_count as usize * 4;
        let profile = u16::from_be_bytes([buf[ext_start], buf[ext_start + 1]]);
        let words = u16::from_be_bytes([buf[ext_start + 2], buf[ext_start + 3]]) as usize;

        let mut pos = ext_start + 4;
        let end = pos + words * 4;

        if profile == 0xBEDE {
            // One-byte form: id in high nibble, len-1 in low nibble.
            while pos < end {
                let byte = buf[pos];
                if byte == 0 {
                    // Padding between elements.
                    pos += 1;
                    continue;
                }
                let elem_id = byte >> 4;
                let len = (byte & 0x0F) as usize + 1;
                if elem_id == 15 {
                    break;
                }
                if pos + 1 + len > end {
                    break;
                }
                if elem_id == id {
                    return Some((pos + 1, len));
                }
                pos += 1 + len;
            }
        } else if profile & 0xFFF0 == 0x1000 {
            // Two-byte form: one byte id, one byte length.
            while pos + 2 <= end {
                let elem_id = buf[pos];
                if elem_id == 0 {
                    pos += 1;
                    continue;
                }
                let len = buf[pos + 1] as usize;
                if pos + 2 + len > end {
                    break;
                }
                if elem_id == id {
                    return Some((pos + 2, len));
                }
                pos += 2 + len;
            }
        }

        None
    }
}

/// RTP header extension URIs the core recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtpHeaderExtensionUri {
    #[serde(rename = "urn:ietf:params:rtp-hdrext:ssrc-audio-level")]
    SsrcAudioLevel,
    #[serde(rename = "urn:3gpp:video-orientation")]
    VideoOrientation,
    #[serde(rename = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time")]
    AbsSendTime,
    #[serde(
        rename = "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01"
    )]
    TransportWideCc01,
    #[serde(rename = "urn:ietf:params:rtp-hdrext:sdes:mid")]
    Mid,
    #[serde(rename = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id")]
    Rid,
    #[serde(rename = "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id")]
    RepairedRid,
    #[serde(other)]
    Unknown,
}

/// Recognised extension ids for a consumer, resolved from the negotiated
/// header extensions. 0 means unassigned. The first non-zero id seen for
/// a given URI wins.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeaderExtensionIds {
    pub ssrc_audio_level: u8,
    pub video_orientation: u8,
    pub abs_send_time: u8,
    pub transport_wide_cc01: u8,
    pub mid: u8,
    pub rid: u8,
    pub rrid: u8,
}

impl HeaderExtensionIds {
    pub(crate) fn assign(&mut self, uri: RtpHeaderExtensionUri, id: u8) {
        let slot = match uri {
            RtpHeaderExtensionUri::SsrcAudioLevel => &mut self.ssrc_audio_level,
            RtpHeaderExtensionUri::VideoOrientation => &mut self.video_orientation,
            RtpHeaderExtensionUri::AbsSendTime => &mut self.abs_send_time,
            RtpHeaderExtensionUri::TransportWideCc01 => &mut self.transport_wide_cc01,
            RtpHeaderExtensionUri::Mid => &mut self.mid,
            RtpHeaderExtensionUri::Rid => &mut self.rid,
            RtpHeaderExtensionUri::RepairedRid => &mut self.rrid,
            RtpHeaderExtensionUri::Unknown => return,
        };

        if *slot == 0 {
            *slot = id;
        }
    }
}
