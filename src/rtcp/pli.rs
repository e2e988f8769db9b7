use crate::rtp::Ssrc;

use super::{fmt, read_ssrc, RtcpHeader, RtcpPacket, RtcpType};

/// Picture loss indication: the receiver lost decodable video and wants a
/// keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
}

impl RtcpPacket for Pli {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::PayloadSpecificFeedback,
            count: fmt::PLI,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header + sender SSRC + media SSRC
        1 + 2
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.media_ssrc.to_be_bytes());

        self.length_words() * 4
    }
}

impl<'a> TryFrom<&'a [u8]> for Pli {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 8 {
            return Err("Pli less than 8 bytes");
        }

        Ok(Pli {
            sender_ssrc: read_ssrc(buf),
            media_ssrc: read_ssrc(&buf[4..]),
        })
    }
}
