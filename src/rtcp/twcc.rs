use crate::rtp::Ssrc;

use super::{fmt, read_ssrc, RtcpHeader, RtcpPacket, RtcpType};

/// Transport-wide congestion control feedback
/// (draft-holmer-rmcat-transport-wide-cc-extensions-01).
///
/// Reports per-packet arrival times at the remote, keyed by the transport
/// sequence number stamped on outgoing packets. This is the input that
/// drives send-side bandwidth estimation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFeedback {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
    /// Transport sequence number of the first reported packet.
    pub base_seq: u16,
    /// Reference time in 64 ms units (24 bit signed on the wire).
    pub reference_time: i32,
    /// Feedback packet counter for loss detection of the feedback itself.
    pub fb_count: u8,
    pub packets: Vec<PacketStatus>,
}

/// Status of one reported packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketStatus {
    pub seq: u16,
    /// Receive time delta in 250 us units, None when the packet was not
    /// received.
    pub delta: Option<i32>,
}

const SYMBOL_NOT_RECEIVED: u8 = 0;
const SYMBOL_SMALL_DELTA: u8 = 1;
const SYMBOL_LARGE_DELTA: u8 = 2;

fn symbol_of(p: &PacketStatus) -> u8 {
    match p.delta {
        None => SYMBOL_NOT_RECEIVED,
        Some(d) if (0..=255).contains(&d) => SYMBOL_SMALL_DELTA,
        Some(_) => SYMBOL_LARGE_DELTA,
    }
}

impl TransportFeedback {
    /// Arrival offsets in microseconds relative to the feedback's
    /// reference time, in report order.
    pub fn iter_arrivals(&self) -> impl Iterator<Item = (u16, Option<i64>)> + '_ {
        let mut acc: i64 = 0;

        self.packets.iter().map(move |p| {
            let arrival = p.delta.map(|d| {
                acc += d as i64 * 250;
                acc
            });
            (p.seq, arrival)
        })
    }

    /// Number of packets reported as received.
    pub fn received_count(&self) -> usize {
        self.packets.iter().filter(|p| p.delta.is_some()).count()
    }

    /// Run-length encode statuses, then the delta blob.
    fn encode(&self) -> (Vec<u16>, Vec<u8>) {
        let mut chunks = Vec::new();
        let mut deltas = Vec::new();

        let symbols: Vec<u8> = self.packets.iter().map(symbol_of).collect();

        let mut i = 0;
        while i < symbols.len() {
            let symbol = symbols[i];
            let mut run = 1usize;
            while i + run < symbols.len() && symbols[i + run] == symbol && run < 0x1FFF {
                run += 1;
            }
            chunks.push(((symbol as u16) << 13) | run as u16);
            i += run;
        }

        for p in &self.packets {
            match (symbol_of(p), p.delta) {
                (SYMBOL_SMALL_DELTA, Some(d)) => deltas.push(d as u8),
                (SYMBOL_LARGE_DELTA, Some(d)) => {
                    let clamped = d.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                    deltas.extend_from_slice(&clamped.to_be_bytes());
                }
                _ => {}
            }
        }

        (chunks, deltas)
    }
}

impl RtcpPacket for TransportFeedback {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::TransportLayerFeedback,
            count: fmt::TWCC,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        let (chunks, deltas) = self.encode();
        let payload_bytes = chunks.len() * 2 + deltas.len();

        // header + ssrcs + base/count + reftime/fbcount + payload padded
        1 + 2 + 1 + 1 + (payload_bytes + 3) / 4
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let total = self.length_words() * 4;

        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.media_ssrc.to_be_bytes());
        buf[12..14].copy_from_slice(&self.base_seq.to_be_bytes());
        buf[14..16].copy_from_slice(&(self.packets.len() as u16).to_be_bytes());

        let ref_time = self.reference_time & 0x00FF_FFFF;
        buf[16] = (ref_time >> 16) as u8;
        buf[17] = (ref_time >> 8) as u8;
        buf[18] = ref_time as u8;
        buf[19] = self.fb_count;

        let (chunks, deltas) = self.encode();

        let mut pos = 20;
        for chunk in chunks {
            buf[pos..pos + 2].copy_from_slice(&chunk.to_be_bytes());
            pos += 2;
        }
        buf[pos..pos + deltas.len()].copy_from_slice(&deltas);
        pos += deltas.len();

        // Zero pad to the word boundary.
        buf[pos..total].fill(0);

        total
    }
}

impl<'a> TryFrom<&'a [u8]> for TransportFeedback {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 16 {
            return Err("TransportFeedback less than 16 bytes");
        }

        let sender_ssrc = read_ssrc(buf);
        let media_ssrc = read_ssrc(&buf[4..]);
        let base_seq = u16::from_be_bytes([buf[8], buf[9]]);
        let status_count = u16::from_be_bytes([buf[10], buf[11]]) as usize;

        let mut reference_time =
            ((buf[12] as i32) << 16) | ((buf[13] as i32) << 8) | buf[14] as i32;
        // Sign extend 24 -> 32 bits.
        if reference_time & 0x0080_0000 != 0 {
            reference_time |= !0x00FF_FFFF;
        }
        let fb_count = buf[15];

        // Collect status symbols from chunks.
        let mut symbols: Vec<u8> = Vec::with_capacity(status_count);
        let mut pos = 16;

        while symbols.len() < status_count {
            if pos + 2 > buf.len() {
                return Err("TransportFeedback chunks truncated");
            }
            let chunk = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            pos += 2;

            if chunk & 0x8000 == 0 {
                // Run length chunk.
                let symbol = ((chunk >> 13) & 0x03) as u8;
                let run = (chunk & 0x1FFF) as usize;
                for _ in 0..run {
                    if symbols.len() == status_count {
                        break;
                    }
                    symbols.push(symbol);
                }
            } else if chunk & 0x4000 == 0 {
                // Status vector, one bit symbols: received small delta or
                // not received.
                for bit in (0..14).rev() {
                    if symbols.len() == status_count {
                        break;
                    }
                    let received = chunk >> bit & 1 == 1;
                    symbols.push(if received {
                        SYMBOL_SMALL_DELTA
                    } else {
                        SYMBOL_NOT_RECEIVED
                    });
                }
            } else {
                // Status vector, two bit symbols.
                for slot in (0..7).rev() {
                    if symbols.len() == status_count {
                        break;
                    }
                    symbols.push((chunk >> (slot * 2) & 0x03) as u8);
                }
            }
        }

        // Read deltas in symbol order.
        let mut packets = Vec::with_capacity(status_count);
        for (i, symbol) in symbols.iter().enumerate() {
            let seq = base_seq.wrapping_add(i as u16);
            let delta = match *symbol {
                SYMBOL_SMALL_DELTA => {
                    if pos >= buf.len() {
                        return Err("TransportFeedback deltas truncated");
                    }
                    let d = buf[pos] as i32;
                    pos += 1;
                    Some(d)
                }
                SYMBOL_LARGE_DELTA => {
                    if pos + 2 > buf.len() {
                        return Err("TransportFeedback deltas truncated");
                    }
                    let d = i16::from_be_bytes([buf[pos], buf[pos + 1]]) as i32;
                    pos += 2;
                    Some(d)
                }
                _ => None,
            };
            packets.push(PacketStatus { seq, delta });
        }

        Ok(TransportFeedback {
            sender_ssrc,
            media_ssrc,
            base_seq,
            reference_time,
            fb_count,
            packets,
        })
    }
}
