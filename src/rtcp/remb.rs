use crate::rtp::Ssrc;

use super::{fmt, read_ssrc, RtcpHeader, RtcpPacket, RtcpType};

/// Receiver estimated maximum bitrate, the legacy bandwidth estimation
/// signal (draft-alvestrand-rmcat-remb).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remb {
    pub sender_ssrc: Ssrc,
    /// Estimated bitrate in bits per second.
    pub bitrate: u64,
    /// The streams the estimate applies to.
    pub ssrcs: Vec<Ssrc>,
}

impl RtcpPacket for Remb {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::PayloadSpecificFeedback,
            count: fmt::AFB,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header + sender SSRC + unused media SSRC + "REMB" + num/exp/mantissa
        // + 1 word per SSRC
        1 + 2 + 1 + 1 + self.ssrcs.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].fill(0);
        buf[12..16].copy_from_slice(b"REMB");

        // Bitrate as 6 bit exponent + 18 bit mantissa.
        let mut exp = 0u32;
        let mut mantissa = self.bitrate;
        while mantissa > 0x3FFFF {
            mantissa >>= 1;
            exp += 1;
        }

        buf[16] = self.ssrcs.len() as u8;
        let packed = (exp << 18) | mantissa as u32;
        buf[17] = (packed >> 16) as u8;
        buf[18] = (packed >> 8) as u8;
        buf[19] = packed as u8;

        let mut pos = 20;
        for ssrc in &self.ssrcs {
            buf[pos..pos + 4].copy_from_slice(&ssrc.to_be_bytes());
            pos += 4;
        }

        self.length_words() * 4
    }
}

impl<'a> TryFrom<&'a [u8]> for Remb {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 16 {
            return Err("Remb less than 16 bytes");
        }

        let sender_ssrc = read_ssrc(buf);

        if &buf[8..12] != b"REMB" {
            return Err("Missing REMB identifier");
        }

        let num_ssrc = buf[12] as usize;
        let exp = (buf[13] >> 2) as u32;
        let mantissa =
            (((buf[13] & 0x03) as u32) << 16) | ((buf[14] as u32) << 8) | buf[15] as u32;
        let bitrate = (mantissa as u64) << exp;

        let mut ssrcs = Vec::with_capacity(num_ssrc);
        let mut rest = &buf[16..];
        for _ in 0..num_ssrc {
            if rest.len() < 4 {
                return Err("Remb ssrc list truncated");
            }
            ssrcs.push(read_ssrc(rest));
            rest = &rest[4..];
        }

        Ok(Remb {
            sender_ssrc,
            bitrate,
            ssrcs,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_exact() {
        let remb = Remb {
            sender_ssrc: 9.into(),
            bitrate: 250_000,
            ssrcs: vec![1111.into(), 2222.into()],
        };

        let mut buf = vec![0u8; remb.length_words() * 4];
        remb.write_to(&mut buf);

        let parsed = Remb::try_from(&buf[4..]).unwrap();
        assert_eq!(parsed.bitrate, 250_000);
        assert_eq!(parsed.ssrcs, remb.ssrcs);
    }

    #[test]
    fn large_bitrate_loses_only_precision() {
        let remb = Remb {
            sender_ssrc: 9.into(),
            bitrate: 123_456_789,
            ssrcs: vec![],
        };

        let mut buf = vec![0u8; remb.length_words() * 4];
        remb.write_to(&mut buf);

        let parsed = Remb::try_from(&buf[4..]).unwrap();
        let error = parsed.bitrate.abs_diff(remb.bitrate) as f64 / remb.bitrate as f64;
        assert!(error < 0.001);
    }
}
