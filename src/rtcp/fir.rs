use crate::rtp::Ssrc;

use super::{fmt, read_ssrc, RtcpHeader, RtcpPacket, RtcpType};

/// Full intra request (RFC 5104): a keyframe request with a command
/// sequence number, more forceful than PLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fir {
    pub sender_ssrc: Ssrc,
    pub entries: Vec<FirEntry>,
}

/// One FIR command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirEntry {
    pub ssrc: Ssrc,
    pub seq_nr: u8,
}

impl RtcpPacket for Fir {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::PayloadSpecificFeedback,
            count: fmt::FIR,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header + sender SSRC + unused media SSRC + 2 words per entry
        1 + 2 + 2 * self.entries.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        // Media SSRC is unused for FIR.
        buf[8..12].fill(0);

        let mut pos = 12;
        for e in &self.entries {
            buf[pos..pos + 4].copy_from_slice(&e.ssrc.to_be_bytes());
            buf[pos + 4] = e.seq_nr;
            buf[pos + 5..pos + 8].fill(0);
            pos += 8;
        }

        self.length_words() * 4
    }
}

impl<'a> TryFrom<&'a [u8]> for Fir {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 8 {
            return Err("Fir less than 8 bytes");
        }

        let sender_ssrc = read_ssrc(buf);

        let mut entries = Vec::new();
        let mut buf = &buf[8..];

        while buf.len() >= 8 {
            entries.push(FirEntry {
                ssrc: read_ssrc(buf),
                seq_nr: buf[4],
            });
            buf = &buf[8..];
        }

        Ok(Fir {
            sender_ssrc,
            entries,
        })
    }
}
