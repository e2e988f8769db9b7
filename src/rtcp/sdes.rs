use crate::rtp::Ssrc;

use super::{read_ssrc, RtcpHeader, RtcpPacket, RtcpType};

const SDES_CNAME: u8 = 1;
const SDES_END: u8 = 0;

/// One SDES chunk carrying the stream's CNAME.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdes {
    pub ssrc: Ssrc,
    pub cname: String,
}

impl Sdes {
    /// Chunk size in words: SSRC + items + END, padded to a word
    /// boundary.
    fn word_size(&self) -> usize {
        let bytes = 4 + 2 + self.cname.len() + 1;
        (bytes + 3) / 4
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let total = self.word_size() * 4;

        buf[0..4].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[4] = SDES_CNAME;
        buf[5] = self.cname.len() as u8;
        buf[6..6 + self.cname.len()].copy_from_slice(self.cname.as_bytes());

        // END item and zero padding to the word boundary.
        for b in &mut buf[6 + self.cname.len()..total] {
            *b = SDES_END;
        }

        total
    }
}

/// A source description packet holding one or more chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesPacket {
    pub chunks: Vec<Sdes>,
}

impl SdesPacket {
    pub(crate) fn length_words_for(chunks: &[Sdes]) -> usize {
        1 + chunks.iter().map(|c| c.word_size()).sum::<usize>()
    }
}

impl RtcpPacket for SdesPacket {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::SourceDescription,
            count: self.chunks.len() as u8,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        Self::length_words_for(&self.chunks)
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);

        let mut pos = 4;
        for chunk in &self.chunks {
            pos += chunk.write_to(&mut buf[pos..]);
        }

        pos
    }
}

impl<'a> TryFrom<&'a [u8]> for Sdes {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 6 {
            return Err("Less than 6 bytes for Sdes chunk");
        }

        let ssrc = read_ssrc(buf);

        if buf[4] != SDES_CNAME {
            return Err("First Sdes item is not a CNAME");
        }

        let len = buf[5] as usize;
        if buf.len() < 6 + len {
            return Err("Sdes CNAME length out of bounds");
        }

        let cname = std::str::from_utf8(&buf[6..6 + len])
            .map_err(|_| "Sdes CNAME not utf-8")?
            .to_string();

        Ok(Sdes { ssrc, cname })
    }
}
