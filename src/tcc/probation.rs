use crate::rtp::{Pt, RtpPacket, Ssrc};

/// Reserved SSRC for probation traffic. Receivers do not subscribe to
/// it; the packets exist only to exercise the path.
pub const PROBATION_SSRC: Ssrc = Ssrc::new(1234);

/// Payload type stamped on probation packets.
pub const PROBATION_PAYLOAD_TYPE: Pt = Pt::new_with_value(127);

/// Largest padding payload a single packet can carry (the RFC 3550 pad
/// length is one byte).
const MAX_PROBATION_PADDING: usize = 255;

/// Produces RTP padding packets on demand when the arbiter wants to
/// probe for more bandwidth than current media uses.
#[derive(Debug)]
pub struct ProbationGenerator {
    next_seq: u16,
}

impl ProbationGenerator {
    pub fn new() -> ProbationGenerator {
        ProbationGenerator {
            // Random initial value per RFC 3550.
            next_seq: rand::random::<u16>() % 32768,
        }
    }

    /// A padding packet approximating `size` bytes on the wire, with the
    /// next probation sequence number.
    pub fn get_next_packet(&mut self, size: usize) -> RtpPacket {
        let pad_len = size.saturating_sub(12).clamp(1, MAX_PROBATION_PADDING) as u8;

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        RtpPacket::padding(PROBATION_SSRC, PROBATION_PAYLOAD_TYPE, seq, pad_len)
    }
}

impl Default for ProbationGenerator {
    fn default() -> Self {
        Self::new()
    }
}
