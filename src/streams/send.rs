use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::rtcp::{KeyFrameRequestKind, Nack, ReceptionReport, Sdes, SenderReport};
use crate::rtp::{Pt, RtpPacket, Ssrc};
use crate::util::{unix_ms, InstantExt, RateCounter};

use super::RtpStreamParams;

/// Packets older than this are never retransmitted; the receiver has
/// given up on them long ago.
const MAX_RETRANSMISSION_DELAY: Duration = Duration::from_millis(2000);

/// RTT assumed before the first receiver report arrives, used to space
/// repeated resends of the same packet.
const DEFAULT_RTT: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct RtxStream {
    payload_type: Pt,
    ssrc: Ssrc,
    next_seq: u16,
}

#[derive(Debug)]
struct StoredPacket {
    packet: RtpPacket,
    stored_at: Instant,
    resent_at: Option<Instant>,
}

/// Circular retransmission store indexed by sequence number modulo
/// capacity. Newer packets overwrite whatever occupied their slot.
#[derive(Debug)]
struct RetransmissionBuffer {
    slots: Vec<Option<StoredPacket>>,
}

impl RetransmissionBuffer {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        RetransmissionBuffer { slots }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Store a packet. Returns false for a duplicate of what the slot
    /// already holds.
    fn insert(&mut self, packet: RtpPacket, now: Instant) -> bool {
        if self.slots.is_empty() {
            return true;
        }

        let seq = packet.sequence_number();
        let idx = seq as usize % self.slots.len();

        if let Some(stored) = &self.slots[idx] {
            if stored.packet.sequence_number() == seq {
                return false;
            }
        }

        self.slots[idx] = Some(StoredPacket {
            packet,
            stored_at: now,
            resent_at: None,
        });

        true
    }

    fn get_mut(&mut self, seq: u16) -> Option<&mut StoredPacket> {
        if self.slots.is_empty() {
            return None;
        }

        let idx = seq as usize % self.slots.len();
        let stored = self.slots[idx].as_mut()?;

        if stored.packet.sequence_number() != seq {
            return None;
        }

        Some(stored)
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

/// The outgoing leg of a consumer: retransmission history, NACK
/// answering, per-stream statistics and sender report synthesis.
///
/// The stream is the exclusive writer of the consumer's outgoing stats.
/// It never talks upward directly; retransmissions are handed to an
/// injected callback so the owner decides how they leave the process.
#[derive(Debug)]
pub struct RtpStreamSend {
    params: RtpStreamParams,
    buffer: RetransmissionBuffer,
    rtx: Option<RtxStream>,
    paused: bool,

    transmission: RateCounter,
    packets_sent: u64,
    octets_sent: u64,
    packets_retransmitted: u64,
    octets_retransmitted: u64,
    nack_count: u64,
    nack_packet_count: u64,
    pli_count: u64,
    fir_count: u64,

    /// Media timestamp of the most recent packet and when it was sent,
    /// for extrapolating the RTP time in sender reports.
    last_packet_ts: u32,
    last_packet_at: Option<Instant>,

    fraction_lost: u8,
    packets_lost: u32,
    rtt: f32,
    score: u8,

    /// Counters at the previous receiver report, for score deltas.
    sent_at_prior_report: u64,
    lost_at_prior_report: u32,
}

impl RtpStreamSend {
    pub fn new(params: RtpStreamParams, buffer_size: usize) -> Self {
        debug!("new RtpStreamSend [ssrc:{}]", params.ssrc);

        RtpStreamSend {
            params,
            buffer: RetransmissionBuffer::new(buffer_size),
            rtx: None,
            paused: false,
            transmission: RateCounter::default(),
            packets_sent: 0,
            octets_sent: 0,
            packets_retransmitted: 0,
            octets_retransmitted: 0,
            nack_count: 0,
            nack_packet_count: 0,
            pli_count: 0,
            fir_count: 0,
            last_packet_ts: 0,
            last_packet_at: None,
            fraction_lost: 0,
            packets_lost: 0,
            rtt: 0.0,
            score: 0,
            sent_at_prior_report: 0,
            lost_at_prior_report: 0,
        }
    }

    pub fn ssrc(&self) -> Ssrc {
        self.params.ssrc
    }

    pub fn params(&self) -> &RtpStreamParams {
        &self.params
    }

    /// Enable the RTX retransmission channel.
    pub fn set_rtx(&mut self, payload_type: Pt, ssrc: Ssrc) {
        // Random initial value per RFC 3550.
        let next_seq = rand::random::<u16>() % 32768;

        self.rtx = Some(RtxStream {
            payload_type,
            ssrc,
            next_seq,
        });
    }

    pub fn has_rtx(&self) -> bool {
        self.rtx.is_some()
    }

    pub fn rtx_ssrc(&self) -> Option<Ssrc> {
        self.rtx.as_ref().map(|r| r.ssrc)
    }

    /// Record a packet about to be transmitted. Returns false when the
    /// packet is rejected (duplicate already stored); the caller should
    /// not transmit in that case.
    pub fn receive_packet(&mut self, packet: &RtpPacket, now: Instant) -> bool {
        if self.buffer.capacity() > 0 && !self.buffer.insert(packet.clone(), now) {
            warn!(
                "duplicate packet rejected [ssrc:{}, seq:{}]",
                packet.ssrc(),
                packet.sequence_number()
            );
            return false;
        }

        self.packets_sent += 1;
        self.octets_sent += packet.payload().len() as u64;
        self.transmission.push(now, packet.size() as u64);

        self.last_packet_ts = packet.timestamp();
        self.last_packet_at = Some(now);

        true
    }

    /// Answer a NACK from the retransmission buffer. Every packet still
    /// available is handed to `retransmit`, already RTX-rewritten when
    /// RTX is configured.
    pub fn receive_nack(
        &mut self,
        nack: &Nack,
        now: Instant,
        retransmit: &mut dyn FnMut(&mut RtpPacket),
    ) {
        self.nack_count += 1;

        if self.buffer.capacity() == 0 {
            debug!("NACK received but no retransmission buffer [ssrc:{}]", self.params.ssrc);
            return;
        }

        let rtt = Duration::from_millis(self.rtt.max(1.0) as u64).max(DEFAULT_RTT);

        for seq in nack.seqs() {
            let Some(stored) = self.buffer.get_mut(seq) else {
                debug!(
                    "NACKed packet not in buffer [ssrc:{}, seq:{}]",
                    self.params.ssrc, seq
                );
                continue;
            };

            if now.duration_since(stored.stored_at) > MAX_RETRANSMISSION_DELAY {
                debug!(
                    "NACKed packet too old to retransmit [ssrc:{}, seq:{}]",
                    self.params.ssrc, seq
                );
                continue;
            }

            // Space repeated resends of the same packet by roughly one
            // round trip.
            if let Some(resent_at) = stored.resent_at {
                if now.duration_since(resent_at) < rtt {
                    continue;
                }
            }

            stored.resent_at = Some(now);

            let mut out = if let Some(rtx) = &mut self.rtx {
                let seq_out = rtx.next_seq;
                rtx.next_seq = rtx.next_seq.wrapping_add(1);
                stored.packet.rtx_encode(rtx.payload_type, rtx.ssrc, seq_out)
            } else {
                stored.packet.clone()
            };

            self.nack_packet_count += 1;
            self.packets_retransmitted += 1;
            self.octets_retransmitted += out.payload().len() as u64;
            self.transmission.push(now, out.size() as u64);

            retransmit(&mut out);
        }
    }

    /// Record an incoming keyframe request; propagation upward is the
    /// owner's business.
    pub fn receive_key_frame_request(&mut self, kind: KeyFrameRequestKind) {
        match kind {
            KeyFrameRequestKind::Pli => self.pli_count += 1,
            KeyFrameRequestKind::Fir => self.fir_count += 1,
        }
    }

    /// Ingest a reception report for this stream: RTT, loss and the
    /// derived quality score. Returns `(score, previous)` when the score
    /// changed.
    pub fn receive_rtcp_receiver_report(
        &mut self,
        report: &ReceptionReport,
        now: Instant,
    ) -> Option<(u8, u8)> {
        self.fraction_lost = report.fraction_lost;
        self.packets_lost = report.packets_lost;

        // RTT from the LSR/DLSR echo, in 1/65536 second units.
        if report.last_sr_time != 0 {
            let compact_now = now.as_compact_ntp();
            let rtt_units = compact_now
                .wrapping_sub(report.last_sr_delay)
                .wrapping_sub(report.last_sr_time);

            // A wrapped (negative) difference means clocks disagreed;
            // fall through to the floor.
            let rtt_ms = if rtt_units & 0x8000_0000 == 0 {
                rtt_units as f32 * 1000.0 / 65536.0
            } else {
                0.0
            };

            self.rtt = rtt_ms.max(1.0);
        }

        self.update_score()
    }

    fn update_score(&mut self) -> Option<(u8, u8)> {
        let sent = self.packets_sent - self.sent_at_prior_report;
        let lost = self.packets_lost.saturating_sub(self.lost_at_prior_report) as u64;

        self.sent_at_prior_report = self.packets_sent;
        self.lost_at_prior_report = self.packets_lost;

        if sent == 0 {
            return None;
        }

        let delivered = sent.saturating_sub(lost.min(sent));
        let score = ((delivered as f64 / sent as f64) * 10.0).round() as u8;

        if score == self.score {
            return None;
        }

        let previous = self.score;
        self.score = score;

        Some((score, previous))
    }

    /// Build a sender report for `now`, or None when nothing has been
    /// sent since startup.
    pub fn get_rtcp_sender_report(&mut self, now: Instant) -> Option<SenderReport> {
        let last_packet_at = self.last_packet_at?;

        // Extrapolate the media timestamp to "now".
        let elapsed_ms = now.duration_since(last_packet_at).as_millis() as u64;
        let rtp_time = self
            .last_packet_ts
            .wrapping_add((elapsed_ms * self.params.clock_rate as u64 / 1000) as u32);

        Some(SenderReport {
            ssrc: self.params.ssrc,
            ntp_time: now.as_ntp_64(),
            rtp_time,
            packet_count: self.packets_sent as u32,
            octet_count: self.octets_sent as u32,
        })
    }

    pub fn get_rtcp_sdes_chunk(&self) -> Sdes {
        Sdes {
            ssrc: self.params.ssrc,
            cname: self.params.cname.clone(),
        }
    }

    /// Transmission rate over the trailing window, bits per second.
    pub fn get_bitrate(&mut self, now: Instant) -> u32 {
        self.transmission.rate(now)
    }

    pub fn get_fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    pub fn get_score(&self) -> u8 {
        self.score
    }

    pub fn get_rtt(&self) -> f32 {
        self.rtt
    }

    /// Suspend the stream: drop retransmission history and freeze the
    /// rate window.
    pub fn pause(&mut self) {
        self.paused = true;
        self.buffer.clear();
        self.transmission.clear();
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Static stream description for DUMP.
    pub fn dump_json(&self) -> Value {
        json!({
            "params": {
                "ssrc": *self.params.ssrc,
                "payloadType": *self.params.payload_type,
                "mimeType": self.params.mime_type.to_string(),
                "clockRate": self.params.clock_rate,
                "cname": self.params.cname,
                "useNack": self.params.use_nack,
                "usePli": self.params.use_pli,
                "useFir": self.params.use_fir,
                "useInBandFec": self.params.use_in_band_fec,
                "useDtx": self.params.use_dtx,
                "rtxSsrc": self.rtx.as_ref().map(|r| *r.ssrc),
                "rtxPayloadType": self.rtx.as_ref().map(|r| *r.payload_type),
            },
            "score": self.score,
        })
    }

    /// Live statistics for GET_STATS.
    pub fn stats_json(&mut self, now: Instant) -> Value {
        let bitrate = self.get_bitrate(now);

        json!({
            "type": "outbound-rtp",
            "timestamp": unix_ms(now),
            "ssrc": *self.params.ssrc,
            "kind": self.params.mime_type.kind.to_string(),
            "mimeType": self.params.mime_type.to_string(),
            "packetCount": self.packets_sent,
            "byteCount": self.octets_sent,
            "bitrate": bitrate,
            "score": self.score,
            "fractionLost": self.fraction_lost,
            "rttMs": self.rtt,
            "nackCount": self.nack_count,
            "nackPacketCount": self.nack_packet_count,
            "pliCount": self.pli_count,
            "firCount": self.fir_count,
            "packetsRetransmitted": self.packets_retransmitted,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::{MediaKind, MimeType};

    fn params() -> RtpStreamParams {
        RtpStreamParams {
            ssrc: 1111.into(),
            payload_type: 101.into(),
            mime_type: MimeType::new(MediaKind::Video, "VP8"),
            clock_rate: 90_000,
            cname: "cname-x".into(),
            use_nack: true,
            use_pli: true,
            use_fir: false,
            use_in_band_fec: false,
            use_dtx: false,
        }
    }

    fn stream() -> RtpStreamSend {
        RtpStreamSend::new(params(), super::super::RETRANSMISSION_BUFFER_SIZE)
    }

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket::build(1111.into(), 101.into(), seq, 90_000, &[0; 100])
    }

    #[test]
    fn receive_packet_updates_counters() {
        let now = Instant::now();
        let mut s = stream();

        assert!(s.receive_packet(&packet(1), now));
        assert!(s.receive_packet(&packet(2), now));

        assert_eq!(s.packets_sent, 2);
        assert_eq!(s.octets_sent, 200);
    }

    #[test]
    fn duplicate_packet_rejected() {
        let now = Instant::now();
        let mut s = stream();

        assert!(s.receive_packet(&packet(1), now));
        assert!(!s.receive_packet(&packet(1), now));

        // Counters unchanged by the rejected packet.
        assert_eq!(s.packets_sent, 1);
    }

    #[test]
    fn nack_produces_rtx_retransmission() {
        let now = Instant::now();
        let mut s = stream();
        s.set_rtx(102.into(), 1112.into());

        s.receive_packet(&packet(10), now);
        s.receive_packet(&packet(11), now);

        let nack = Nack::new(1111.into(), &[10, 11]);
        let mut resent = Vec::new();
        s.receive_nack(&nack, now, &mut |p| resent.push(p.clone()));

        assert_eq!(resent.len(), 2);
        for (i, p) in resent.iter().enumerate() {
            assert_eq!(*p.ssrc(), 1112);
            assert_eq!(*p.payload_type(), 102);
            // OSN prefix carries the original seq.
            let osn = u16::from_be_bytes([p.payload()[0], p.payload()[1]]);
            assert_eq!(osn, 10 + i as u16);
        }
        // RTX sequence numbers increase by one.
        assert_eq!(
            resent[1].sequence_number(),
            resent[0].sequence_number().wrapping_add(1)
        );
        assert_eq!(s.nack_count, 1);
        assert_eq!(s.nack_packet_count, 2);
    }

    #[test]
    fn nack_without_rtx_resends_original() {
        let now = Instant::now();
        let mut s = stream();

        s.receive_packet(&packet(10), now);

        let nack = Nack::new(1111.into(), &[10]);
        let mut resent = Vec::new();
        s.receive_nack(&nack, now, &mut |p| resent.push(p.clone()));

        assert_eq!(resent.len(), 1);
        assert_eq!(*resent[0].ssrc(), 1111);
        assert_eq!(resent[0].sequence_number(), 10);
    }

    #[test]
    fn nack_for_unknown_seq_is_ignored() {
        let now = Instant::now();
        let mut s = stream();

        s.receive_packet(&packet(10), now);

        let nack = Nack::new(1111.into(), &[500]);
        let mut count = 0;
        s.receive_nack(&nack, now, &mut |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn repeat_nack_within_rtt_suppressed() {
        let now = Instant::now();
        let mut s = stream();

        s.receive_packet(&packet(10), now);

        let nack = Nack::new(1111.into(), &[10]);
        let mut count = 0;
        s.receive_nack(&nack, now, &mut |_| count += 1);
        s.receive_nack(&nack, now + Duration::from_millis(10), &mut |_| count += 1);
        assert_eq!(count, 1);

        // After an RTT the resend is allowed again.
        s.receive_nack(&nack, now + Duration::from_millis(200), &mut |_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn old_packet_not_retransmitted() {
        let now = Instant::now();
        let mut s = stream();

        s.receive_packet(&packet(10), now);

        let nack = Nack::new(1111.into(), &[10]);
        let mut count = 0;
        let later = now + MAX_RETRANSMISSION_DELAY + Duration::from_millis(1);
        s.receive_nack(&nack, later, &mut |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn sender_report_null_before_first_packet() {
        let now = Instant::now();
        let mut s = stream();
        assert!(s.get_rtcp_sender_report(now).is_none());
    }

    #[test]
    fn sender_report_extrapolates_rtp_time() {
        let now = Instant::now();
        let mut s = stream();

        s.receive_packet(&packet(1), now);

        let later = now + Duration::from_millis(1000);
        let sr = s.get_rtcp_sender_report(later).unwrap();

        assert_eq!(*sr.ssrc, 1111);
        assert_eq!(sr.packet_count, 1);
        assert_eq!(sr.octet_count, 100);
        // One second at 90kHz.
        assert_eq!(sr.rtp_time, 90_000 + 90_000);
    }

    #[test]
    fn receiver_report_sets_rtt_with_floor() {
        let now = Instant::now();
        let mut s = stream();
        s.receive_packet(&packet(1), now);

        // DLSR+LSR equal to now's compact NTP means zero RTT; floored to
        // 1ms.
        let compact = now.as_compact_ntp();
        let report = ReceptionReport {
            ssrc: 1111.into(),
            fraction_lost: 0,
            packets_lost: 0,
            max_seq: 1,
            jitter: 0,
            last_sr_time: compact,
            last_sr_delay: 0,
        };

        s.receive_rtcp_receiver_report(&report, now);
        assert!(s.get_rtt() >= 1.0);
    }

    #[test]
    fn score_tracks_delivered_ratio() {
        let now = Instant::now();
        let mut s = stream();

        for seq in 0..10u16 {
            s.receive_packet(&packet(seq), now);
        }

        let report = ReceptionReport {
            ssrc: 1111.into(),
            fraction_lost: 0,
            packets_lost: 2,
            max_seq: 9,
            jitter: 0,
            last_sr_time: 0,
            last_sr_delay: 0,
        };

        let changed = s.receive_rtcp_receiver_report(&report, now);
        assert_eq!(changed, Some((8, 0)));
        assert_eq!(s.get_score(), 8);
    }

    #[test]
    fn pause_clears_buffer() {
        let now = Instant::now();
        let mut s = stream();

        s.receive_packet(&packet(10), now);
        s.pause();

        let nack = Nack::new(1111.into(), &[10]);
        let mut count = 0;
        s.receive_nack(&nack, now, &mut |_| count += 1);
        assert_eq!(count, 0);
        assert!(s.is_paused());
    }

    #[test]
    fn zero_buffer_keeps_no_history() {
        let now = Instant::now();
        let mut s = RtpStreamSend::new(params(), 0);

        assert!(s.receive_packet(&packet(1), now));
        // Accepting the same seq again is fine without history.
        assert!(s.receive_packet(&packet(1), now));

        let nack = Nack::new(1111.into(), &[1]);
        let mut count = 0;
        s.receive_nack(&nack, now, &mut |_| count += 1);
        assert_eq!(count, 0);
    }
}
