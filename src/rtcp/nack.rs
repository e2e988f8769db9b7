use crate::rtp::Ssrc;

use super::{fmt, read_ssrc, RtcpHeader, RtcpPacket, RtcpType};

/// Generic NACK feedback (RFC 4585), requesting retransmission of lost
/// sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub sender_ssrc: Ssrc,
    /// The stream the missing packets belong to.
    pub media_ssrc: Ssrc,
    pub entries: Vec<NackEntry>,
}

/// A packet id plus a bitmask of up to 16 following lost packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NackEntry {
    pub pid: u16,
    pub blp: u16,
}

impl NackEntry {
    /// The sequence numbers this entry requests.
    pub fn into_iter(self) -> impl Iterator<Item = u16> {
        let pid = self.pid;
        let blp = self.blp;

        std::iter::once(pid).chain((0..16u16).filter_map(move |bit| {
            if blp & (1 << bit) != 0 {
                Some(pid.wrapping_add(bit + 1))
            } else {
                None
            }
        }))
    }
}

impl Nack {
    /// Pack a list of ascending sequence numbers into pid/blp entries.
    pub fn new(media_ssrc: Ssrc, seqs: &[u16]) -> Nack {
        let mut entries: Vec<NackEntry> = Vec::new();

        for &seq in seqs {
            if let Some(last) = entries.last_mut() {
                let dist = seq.wrapping_sub(last.pid);
                if dist != 0 && dist <= 16 {
                    last.blp |= 1 << (dist - 1);
                    continue;
                }
            }
            entries.push(NackEntry { pid: seq, blp: 0 });
        }

        Nack {
            sender_ssrc: 0.into(),
            media_ssrc,
            entries,
        }
    }

    /// All requested sequence numbers across entries.
    pub fn seqs(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.iter().flat_map(|e| e.into_iter())
    }
}

impl RtcpPacket for Nack {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::TransportLayerFeedback,
            count: fmt::NACK,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header + sender SSRC + media SSRC + 1 word per entry
        1 + 2 + self.entries.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.media_ssrc.to_be_bytes());

        let mut pos = 12;
        for e in &self.entries {
            buf[pos..pos + 2].copy_from_slice(&e.pid.to_be_bytes());
            buf[pos + 2..pos + 4].copy_from_slice(&e.blp.to_be_bytes());
            pos += 4;
        }

        self.length_words() * 4
    }
}

impl<'a> TryFrom<&'a [u8]> for Nack {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 8 {
            return Err("Nack less than 8 bytes");
        }

        let sender_ssrc = read_ssrc(buf);
        let media_ssrc = read_ssrc(&buf[4..]);

        let mut entries = Vec::new();
        let mut buf = &buf[8..];

        while buf.len() >= 4 {
            let pid = u16::from_be_bytes([buf[0], buf[1]]);
            let blp = u16::from_be_bytes([buf[2], buf[3]]);
            entries.push(NackEntry { pid, blp });
            buf = &buf[4..];
        }

        Ok(Nack {
            sender_ssrc,
            media_ssrc,
            entries,
        })
    }
}
