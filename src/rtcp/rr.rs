use crate::rtp::Ssrc;

use super::{read_ssrc, RtcpHeader, RtcpPacket, RtcpType};

/// A receiver report, per RFC 3550 6.4.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    /// Sender of this feedback. Mostly irrelevant, but part of the wire
    /// format.
    pub sender_ssrc: Ssrc,
    /// Individual per-source reception reports.
    pub reports: Vec<ReceptionReport>,
}

/// One reception report block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptionReport {
    /// The reported (outgoing) stream.
    pub ssrc: Ssrc,
    /// Fraction of packets lost since the previous report, in 1/256.
    pub fraction_lost: u8,
    /// Cumulative packets lost, 24 bits on the wire.
    pub packets_lost: u32,
    /// Extended highest sequence number received.
    pub max_seq: u32,
    /// Interarrival jitter.
    pub jitter: u32,
    /// Middle 32 bits of the last SR's NTP timestamp (LSR).
    pub last_sr_time: u32,
    /// Delay since that SR in 1/65536 seconds (DLSR).
    pub last_sr_delay: u32,
}

impl RtcpPacket for ReceiverReport {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::ReceiverReport,
            count: self.reports.len() as u8,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // * header: 1
        // * sender SSRC: 1
        // * reports: x 6
        1 + 1 + 6 * self.reports.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);

        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());

        for (i, r) in self.reports.iter().enumerate() {
            r.write_to(&mut buf[8 + i * 24..]);
        }

        self.length_words() * 4
    }
}

impl ReceptionReport {
    pub(crate) fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[4..8].copy_from_slice(&self.packets_lost.min(0x00FF_FFFF).to_be_bytes());
        buf[4] = self.fraction_lost;
        buf[8..12].copy_from_slice(&self.max_seq.to_be_bytes());
        buf[12..16].copy_from_slice(&self.jitter.to_be_bytes());
        buf[16..20].copy_from_slice(&self.last_sr_time.to_be_bytes());
        buf[20..24].copy_from_slice(&self.last_sr_delay.to_be_bytes());
    }
}

impl<'a> TryFrom<&'a [u8]> for ReceiverReport {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 4 {
            return Err("Less than 4 bytes for ReceiverReport");
        }

        let sender_ssrc = read_ssrc(buf);

        let mut reports = Vec::new();
        let mut buf = &buf[4..];

        let count = (buf.len() / 24).min(31);

        for _ in 0..count {
            let report = buf.try_into()?;
            reports.push(report);
            buf = &buf[24..];
        }

        Ok(ReceiverReport {
            sender_ssrc,
            reports,
        })
    }
}

impl<'a> TryFrom<&'a [u8]> for ReceptionReport {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 24 {
            return Err("Less than 24 bytes for ReceptionReport");
        }

        let ssrc = read_ssrc(buf);
        let fraction_lost = buf[4];
        let packets_lost = u32::from_be_bytes([0, buf[5], buf[6], buf[7]]);
        let max_seq = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let jitter = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let last_sr_time = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let last_sr_delay = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);

        Ok(ReceptionReport {
            ssrc,
            fraction_lost,
            packets_lost,
            max_seq,
            jitter,
            last_sr_time,
            last_sr_delay,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let rr = ReceiverReport {
            sender_ssrc: 99.into(),
            reports: vec![ReceptionReport {
                ssrc: 1111.into(),
                fraction_lost: 26,
                packets_lost: 130,
                max_seq: 70_000,
                jitter: 4,
                last_sr_time: 0x11223344,
                last_sr_delay: 65536,
            }],
        };

        let mut buf = vec![0u8; rr.length_words() * 4];
        rr.write_to(&mut buf);

        let parsed = ReceiverReport::try_from(&buf[4..]).unwrap();
        assert_eq!(parsed, rr);
    }

    #[test]
    fn packets_lost_saturates_to_24_bits() {
        let report = ReceptionReport {
            ssrc: 1.into(),
            fraction_lost: 0,
            packets_lost: u32::MAX,
            max_seq: 0,
            jitter: 0,
            last_sr_time: 0,
            last_sr_delay: 0,
        };

        let mut buf = [0u8; 24];
        report.write_to(&mut buf);

        let parsed = ReceptionReport::try_from(&buf[..]).unwrap();
        assert_eq!(parsed.packets_lost, 0x00FF_FFFF);
    }
}
