use crate::rtp::Ssrc;

use super::{read_ssrc, RtcpHeader, RtcpPacket, RtcpType};

/// A report of packets sent, per RFC 3550 6.4.1.
///
/// The NTP/RTP timestamp pair lets the receiver line the stream up
/// against the wallclock; the counters feed its loss accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    /// The SSRC of the originating (outgoing) stream.
    pub ssrc: Ssrc,
    /// 64 bit NTP timestamp at generation.
    pub ntp_time: u64,
    /// RTP timestamp corresponding to the same instant.
    pub rtp_time: u32,
    /// Total packets sent when generated.
    pub packet_count: u32,
    /// Total payload octets sent when generated.
    pub octet_count: u32,
}

impl RtcpPacket for SenderReport {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::SenderReport,
            count: 0,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // * header: 1
        // * sender info: 6
        1 + 6
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);

        buf[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[8..16].copy_from_slice(&self.ntp_time.to_be_bytes());
        buf[16..20].copy_from_slice(&self.rtp_time.to_be_bytes());
        buf[20..24].copy_from_slice(&self.packet_count.to_be_bytes());
        buf[24..28].copy_from_slice(&self.octet_count.to_be_bytes());

        self.length_words() * 4
    }
}

impl<'a> TryFrom<&'a [u8]> for SenderReport {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 24 {
            return Err("Less than 24 bytes for SenderReport");
        }

        let ssrc = read_ssrc(buf);
        let ntp_time = u64::from_be_bytes([
            buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
        ]);
        let rtp_time = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let packet_count = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let octet_count = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);

        Ok(SenderReport {
            ssrc,
            ntp_time,
            rtp_time,
            packet_count,
            octet_count,
        })
    }
}
