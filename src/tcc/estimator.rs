use std::fmt;
use std::time::{Duration, Instant};

use crate::rtp::Bitrate;
use crate::util::{already_happened, RateCounter};

/// One acknowledged (or lost) packet extracted from transport-wide
/// feedback, matched against our send records.
#[derive(Debug, Clone, Copy)]
pub struct AckedPacket {
    pub size: usize,
    pub send_time: Instant,
    /// Arrival offset at the remote, relative to the feedback's
    /// reference time. None when the packet was reported lost.
    pub recv_offset_us: Option<i64>,
}

/// The bandwidth estimation seam.
///
/// The arbiter drives whichever estimator sits behind this trait; the
/// default is a loss/ack driven AIMD controller. Any equivalent
/// estimator (a full delay-based GoogCC port included) can substitute
/// without the arbiter noticing.
pub trait NetworkEstimator: fmt::Debug {
    fn on_network_availability(&mut self, available: bool);

    /// Bounds from the arbiter: floor, initial and ceiling (the desired
    /// bitrate demand).
    fn set_bounds(&mut self, min: Bitrate, start: Bitrate, max: Bitrate);

    fn on_packet_sent(&mut self, size: usize, is_probation: bool, now: Instant);

    /// Transport-wide feedback arrived. Returns the new target when it
    /// changed.
    fn on_transport_feedback(&mut self, acked: &[AckedPacket], now: Instant) -> Option<Bitrate>;

    /// Loss/RTT signal from a receiver report (the REMB-mode input).
    fn on_receiver_report(&mut self, fraction_lost: u8, rtt_ms: f32, now: Instant)
        -> Option<Bitrate>;

    /// REMB from the remote.
    fn on_remb(&mut self, bitrate: Bitrate, now: Instant) -> Option<Bitrate>;

    /// Periodic processing. Returns the new target when it changed.
    fn handle_timeout(&mut self, now: Instant) -> Option<Bitrate>;

    fn target(&self) -> Bitrate;

    /// The extra rate worth probing at, when the estimator wants to grow
    /// beyond the current target.
    fn probation_rate(&self, now: Instant) -> Option<Bitrate>;
}

// AIMD tuning, in the shape of the congestion control drafts: additive
// growth below 2% loss, hold to 10%, multiplicative decrease above.
const LOSS_LOW: f64 = 0.02;
const LOSS_HIGH: f64 = 0.10;
const INCREASE_FACTOR: f64 = 1.08;
const ACKED_RATE_HEADROOM: f64 = 1.5;
const INCREASE_INTERVAL: Duration = Duration::from_millis(500);
const PROBE_COOLDOWN: Duration = Duration::from_secs(5);

/// Loss-driven AIMD estimator with an acked-bitrate cap.
///
/// The target grows 8% per interval while loss stays under 2%, holds in
/// the 2-10% band and backs off proportionally above 10%. The acked
/// bitrate (what the remote demonstrably received) caps growth so the
/// estimate cannot run away from reality on an idle link.
#[derive(Debug)]
pub struct AimdEstimator {
    target: Bitrate,
    min: Bitrate,
    max: Bitrate,
    acked: RateCounter,
    available: bool,
    last_increase_at: Instant,
    last_decrease_at: Instant,
}

impl AimdEstimator {
    pub fn new(initial: Bitrate) -> AimdEstimator {
        AimdEstimator {
            target: initial,
            min: Bitrate::kbps(30),
            max: Bitrate::mbps(100),
            acked: RateCounter::new(Duration::from_millis(500)),
            available: false,
            last_increase_at: already_happened(),
            last_decrease_at: already_happened(),
        }
    }

    fn apply_loss(&mut self, loss: f64, now: Instant) -> Option<Bitrate> {
        let previous = self.target;

        if loss < LOSS_LOW {
            if now.duration_since(self.last_increase_at) >= INCREASE_INTERVAL {
                let mut next = self.target * INCREASE_FACTOR;

                // Cap growth at a headroom above what the remote has
                // demonstrably received.
                let acked_rate = Bitrate::from(self.acked.sum() * 8 * 2);
                if acked_rate > Bitrate::ZERO {
                    next = next.min(acked_rate * ACKED_RATE_HEADROOM).max(self.target);
                }

                self.target = next.clamp(self.min, self.max);
                self.last_increase_at = now;
            }
        } else if loss > LOSS_HIGH {
            self.target = (self.target * (1.0 - 0.5 * loss)).clamp(self.min, self.max);
            self.last_decrease_at = now;
        }

        (self.target != previous).then_some(self.target)
    }
}

impl NetworkEstimator for AimdEstimator {
    fn on_network_availability(&mut self, available: bool) {
        self.available = available;

        if !available {
            self.acked.clear();
        }
    }

    fn set_bounds(&mut self, min: Bitrate, start: Bitrate, max: Bitrate) {
        self.min = min;
        self.max = max;

        if self.target < self.min {
            self.target = start.clamp(self.min, self.max);
        }
        self.target = self.target.clamp(self.min, self.max);
    }

    fn on_packet_sent(&mut self, _size: usize, _is_probation: bool, _now: Instant) {
        // Send pacing is not part of this estimator's model.
    }

    fn on_transport_feedback(&mut self, acked: &[AckedPacket], now: Instant) -> Option<Bitrate> {
        if acked.is_empty() {
            return None;
        }

        let mut lost = 0usize;
        for p in acked {
            match p.recv_offset_us {
                Some(_) => self.acked.push(now, p.size as u64),
                None => lost += 1,
            }
        }
        self.acked.purge_old(now);

        let loss = lost as f64 / acked.len() as f64;

        self.apply_loss(loss, now)
    }

    fn on_receiver_report(
        &mut self,
        fraction_lost: u8,
        _rtt_ms: f32,
        now: Instant,
    ) -> Option<Bitrate> {
        self.apply_loss(fraction_lost as f64 / 256.0, now)
    }

    fn on_remb(&mut self, bitrate: Bitrate, _now: Instant) -> Option<Bitrate> {
        let previous = self.target;
        self.target = bitrate.clamp(self.min, self.max);

        (self.target != previous).then_some(self.target)
    }

    fn handle_timeout(&mut self, now: Instant) -> Option<Bitrate> {
        if !self.available {
            return None;
        }

        self.acked.purge_old(now);

        // No feedback at all counts as a clean interval.
        self.apply_loss(0.0, now)
    }

    fn target(&self) -> Bitrate {
        self.target
    }

    fn probation_rate(&self, now: Instant) -> Option<Bitrate> {
        if !self.available {
            return None;
        }

        // Probing right after a loss-driven decrease would re-excite the
        // congestion we just backed away from.
        if now.duration_since(self.last_decrease_at) < PROBE_COOLDOWN {
            return None;
        }

        let headroom = self.max.as_f64() - self.target.as_f64();
        if headroom <= self.target.as_f64() * 0.1 {
            return None;
        }

        // Probe at half the remaining headroom, capped at the current
        // target.
        Some(Bitrate::from(headroom / 2.0).min(self.target))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn after(now: Instant, millis: u64) -> Instant {
        now + Duration::from_millis(millis)
    }

    fn estimator(_now: Instant) -> AimdEstimator {
        let mut e = AimdEstimator::new(Bitrate::kbps(300));
        e.set_bounds(Bitrate::kbps(30), Bitrate::kbps(300), Bitrate::mbps(10));
        e.on_network_availability(true);
        e
    }

    fn acked(n: usize, size: usize) -> Vec<AckedPacket> {
        (0..n)
            .map(|i| AckedPacket {
                size,
                send_time: Instant::now(),
                recv_offset_us: Some(i as i64 * 250),
            })
            .collect()
    }

    #[test]
    fn grows_without_loss() {
        let now = Instant::now();
        let mut e = estimator(now);

        let before = e.target().as_u64();
        // Plenty of acked traffic so the cap does not bind.
        let result = e.on_transport_feedback(&acked(100, 1200), after(now, 600));

        assert!(result.is_some());
        assert!(e.target().as_u64() > before);
    }

    #[test]
    fn backs_off_on_heavy_loss() {
        let now = Instant::now();
        let mut e = estimator(now);

        let mut packets = acked(80, 1200);
        packets.extend((0..20).map(|_| AckedPacket {
            size: 1200,
            send_time: now,
            recv_offset_us: None,
        }));

        let before = e.target().as_u64();
        let result = e.on_transport_feedback(&packets, after(now, 600));

        assert!(result.is_some());
        // target * (1 - 0.5 * 0.2) = 0.9 of the previous value.
        let expect = before as f64 * 0.9;
        assert!((e.target().as_f64() - expect).abs() < 1.0);
    }

    #[test]
    fn moderate_loss_holds() {
        let now = Instant::now();
        let mut e = estimator(now);

        let mut packets = acked(95, 1200);
        packets.extend((0..5).map(|_| AckedPacket {
            size: 1200,
            send_time: now,
            recv_offset_us: None,
        }));

        let result = e.on_transport_feedback(&packets, after(now, 600));
        assert!(result.is_none());
    }

    #[test]
    fn acked_rate_caps_growth() {
        let now = Instant::now();
        let mut e = estimator(now);

        // Tiny acked volume: 10 packets x 100 bytes in the window.
        let mut target_before = e.target().as_u64();
        for round in 1..10u64 {
            e.on_transport_feedback(&acked(10, 100), after(now, round * 600));
        }

        // Growth stalled at the acked-rate cap rather than compounding
        // 8% forever.
        assert!(e.target().as_u64() <= target_before * 2);
        target_before = e.target().as_u64();
        e.on_transport_feedback(&acked(10, 100), after(now, 7000));
        assert_eq!(e.target().as_u64(), target_before);
    }

    #[test]
    fn remb_overrides_target() {
        let now = Instant::now();
        let mut e = estimator(now);

        let result = e.on_remb(Bitrate::kbps(120), now);
        assert_eq!(result.unwrap().as_u64(), 120_000);
    }

    #[test]
    fn no_probing_after_decrease() {
        let now = Instant::now();
        let mut e = estimator(now);

        assert!(e.probation_rate(now).is_some());

        let mut packets = acked(50, 1200);
        packets.extend((0..50).map(|_| AckedPacket {
            size: 1200,
            send_time: now,
            recv_offset_us: None,
        }));
        e.on_transport_feedback(&packets, now);

        assert!(e.probation_rate(after(now, 1000)).is_none());
        assert!(e.probation_rate(after(now, 6000)).is_some());
    }
}
