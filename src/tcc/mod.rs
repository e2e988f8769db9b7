//! The per-transport bandwidth arbiter (transport congestion control
//! client).
//!
//! Consumers report what they would like to send; the arbiter runs an
//! estimator over send/feedback records and publishes an "available
//! bitrate" the transport splits between consumers. When the estimator
//! wants to grow beyond current traffic, the arbiter emits probation
//! padding through the listener.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::rtcp::{ReceptionReport, TransportFeedback};
use crate::rtp::{Bitrate, RtpPacket, Ssrc};
use crate::util::already_happened;

mod estimator;
mod probation;
mod trend;

pub use estimator::{AckedPacket, AimdEstimator, NetworkEstimator};
pub use probation::{ProbationGenerator, PROBATION_PAYLOAD_TYPE, PROBATION_SSRC};
pub use trend::TrendCalculator;

/// Process timer cadence while the transport is connected.
const PROCESS_INTERVAL: Duration = Duration::from_millis(250);

/// Minimum silence between available-bitrate events; after this long an
/// update is surfaced regardless of its size.
const MIN_EVENT_INTERVAL: Duration = Duration::from_millis(1000);

/// Relative change (percent) that surfaces an event before the minimum
/// interval elapses.
const EMIT_THRESHOLD_PERCENT: u64 = 8;

/// While the estimate warms up the reported available bitrate never
/// drops below the configured initial value.
const STARTUP_WINDOW: Duration = Duration::from_secs(10);

/// Send records kept for matching transport feedback.
const SEND_RECORD_LIMIT: usize = 2048;

/// Hard cap on probation bytes emitted per process tick.
const MAX_PROBATION_BYTES_PER_TICK: usize = 16_000;

/// Wire size of one probation packet (full padding block).
const PROBATION_PACKET_SIZE: usize = 12 + 255;

/// Floor handed to the estimator.
const MIN_BITRATE: Bitrate = Bitrate::kbps(30);

/// Marker for packets not part of a probe cluster.
pub const NOT_A_PROBE: i32 = -1;

/// Which estimation mode the arbiter runs in, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BweType {
    /// Transport-wide feedback driven (preferred).
    TransportCc,
    /// REMB driven (legacy).
    Remb,
}

/// Pacing tag stamped on outgoing packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingInfo {
    pub probe_cluster_id: i32,
}

impl Default for PacingInfo {
    fn default() -> Self {
        PacingInfo {
            probe_cluster_id: NOT_A_PROBE,
        }
    }
}

/// Everything the arbiter needs to know about a packet being sent.
#[derive(Debug, Clone, Copy)]
pub struct PacketSendInfo {
    pub ssrc: Ssrc,
    pub transport_seq: u16,
    pub size: usize,
    pub is_probation: bool,
    pub pacing: PacingInfo,
}

/// Upcalls to the owning transport. Synchronous; the transport outlives
/// its arbiter.
pub trait TccListener {
    fn on_tcc_available_bitrate(&mut self, available_bitrate: u32, previous_bitrate: u32);

    /// The arbiter produced a probation packet to transmit.
    fn on_tcc_send_rtp_packet(&mut self, packet: &mut RtpPacket, pacing: PacingInfo);
}

#[derive(Debug, Clone, Copy)]
struct SendRecord {
    size: usize,
    sent_at: Instant,
}

/// The transport congestion control client.
pub struct TransportCcClient {
    bwe_type: BweType,
    estimator: Box<dyn NetworkEstimator>,
    probation: ProbationGenerator,
    desired_bitrate_trend: TrendCalculator,

    initial_available_bitrate: u32,
    available_bitrate: u32,
    available_bitrate_event_called: bool,
    last_emitted_bitrate: u32,
    last_available_bitrate_event_at: Instant,

    transport_connected: bool,
    connected_at: Option<Instant>,
    next_process_at: Option<Instant>,

    send_records: BTreeMap<u64, SendRecord>,
    last_transport_seq: Option<u64>,
    pending_bytes: usize,

    next_probe_cluster_id: i32,
}

impl TransportCcClient {
    pub fn new(bwe_type: BweType, initial_available_bitrate: u32) -> TransportCcClient {
        let estimator = Box::new(AimdEstimator::new(Bitrate::from(initial_available_bitrate)));

        Self::with_estimator(bwe_type, initial_available_bitrate, estimator)
    }

    /// Construct with a specific estimator behind the strategy seam.
    pub fn with_estimator(
        bwe_type: BweType,
        initial_available_bitrate: u32,
        estimator: Box<dyn NetworkEstimator>,
    ) -> TransportCcClient {
        TransportCcClient {
            bwe_type,
            estimator,
            probation: ProbationGenerator::new(),
            desired_bitrate_trend: TrendCalculator::new(),
            initial_available_bitrate,
            available_bitrate: initial_available_bitrate,
            available_bitrate_event_called: false,
            last_emitted_bitrate: 0,
            last_available_bitrate_event_at: already_happened(),
            transport_connected: false,
            connected_at: None,
            next_process_at: None,
            send_records: BTreeMap::new(),
            last_transport_seq: None,
            pending_bytes: 0,
            next_probe_cluster_id: 0,
        }
    }

    pub fn bwe_type(&self) -> BweType {
        self.bwe_type
    }

    pub fn get_available_bitrate(&self) -> u32 {
        self.available_bitrate
    }

    /// Arm the process timer and wake the estimator.
    pub fn transport_connected(&mut self, now: Instant, listener: &mut dyn TccListener) {
        self.transport_connected = true;
        self.connected_at = Some(now);
        self.next_process_at = Some(now + PROCESS_INTERVAL);

        self.estimator.on_network_availability(true);

        let previous = self.available_bitrate;
        self.available_bitrate = self
            .estimator
            .target()
            .as_u32()
            .max(self.initial_available_bitrate);

        self.may_emit_available_bitrate_event(previous, now, listener);
    }

    /// Disarm the timer; estimates are stale once the path is gone.
    pub fn transport_disconnected(&mut self) {
        self.transport_connected = false;
        self.next_process_at = None;

        self.estimator.on_network_availability(false);
    }

    /// Register intent to send a packet. The arbiter may pace it; the
    /// pacing tag to stamp comes from [`get_pacing_info`].
    ///
    /// [`get_pacing_info`]: TransportCcClient::get_pacing_info
    pub fn insert_packet(&mut self, info: &PacketSendInfo) {
        self.pending_bytes = self.pending_bytes.saturating_add(info.size);
    }

    pub fn get_pacing_info(&self) -> PacingInfo {
        PacingInfo::default()
    }

    /// Record the actual send so later feedback can be matched.
    pub fn packet_sent(&mut self, info: &PacketSendInfo, now: Instant) {
        self.pending_bytes = self.pending_bytes.saturating_sub(info.size);

        let seq = self.extend_transport_seq(info.transport_seq);
        self.send_records.insert(
            seq,
            SendRecord {
                size: info.size,
                sent_at: now,
            },
        );

        while self.send_records.len() > SEND_RECORD_LIMIT {
            self.send_records.pop_first();
        }

        self.estimator.on_packet_sent(info.size, info.is_probation, now);
    }

    /// REMB style estimate from the remote.
    pub fn receive_estimated_bitrate(
        &mut self,
        bitrate: u32,
        now: Instant,
        listener: &mut dyn TccListener,
    ) {
        if let Some(target) = self.estimator.on_remb(Bitrate::from(bitrate), now) {
            self.update_available_bitrate(target, now, listener);
        }
    }

    /// Loss/RTT signal from a receiver report.
    pub fn receive_rtcp_receiver_report(
        &mut self,
        report: &ReceptionReport,
        rtt: f32,
        now: Instant,
        listener: &mut dyn TccListener,
    ) {
        if let Some(target) = self
            .estimator
            .on_receiver_report(report.fraction_lost, rtt, now)
        {
            self.update_available_bitrate(target, now, listener);
        }
    }

    /// Per-packet arrival times from the remote.
    pub fn receive_rtcp_transport_feedback(
        &mut self,
        feedback: &TransportFeedback,
        now: Instant,
        listener: &mut dyn TccListener,
    ) {
        let mut acked = Vec::with_capacity(feedback.packets.len());

        for (seq, arrival) in feedback.iter_arrivals() {
            let ext = self.peek_extended_seq(seq);

            let Some(record) = self.send_records.get(&ext) else {
                trace!("transport feedback for unknown packet [seq:{seq}]");
                continue;
            };

            acked.push(AckedPacket {
                size: record.size,
                send_time: record.sent_at,
                recv_offset_us: arrival,
            });
        }

        if let Some(target) = self.estimator.on_transport_feedback(&acked, now) {
            self.update_available_bitrate(target, now, listener);
        }
    }

    /// Update the demand ceiling. The smoothed trend keeps a momentary
    /// dip in desire from yanking the estimator's bounds down; `force`
    /// bypasses that gate.
    pub fn set_desired_bitrate(&mut self, desired_bitrate: u32, force: bool, now: Instant) {
        if force {
            self.desired_bitrate_trend.force_update(desired_bitrate, now);
        } else {
            self.desired_bitrate_trend.update(desired_bitrate, now);
        }

        let effective = self
            .desired_bitrate_trend
            .value()
            .max(self.initial_available_bitrate);

        self.estimator.set_bounds(
            MIN_BITRATE,
            Bitrate::from(self.initial_available_bitrate),
            Bitrate::from(effective),
        );
    }

    /// Suppress the next time-based available-bitrate event.
    pub fn reschedule_next_available_bitrate_event(&mut self, now: Instant) {
        self.last_available_bitrate_event_at = now;
    }

    /// When the process timer should next fire.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.next_process_at
    }

    /// Periodic processing: advance the estimator and emit probation
    /// padding when it wants to probe.
    pub fn handle_timeout(&mut self, now: Instant, listener: &mut dyn TccListener) {
        if !self.transport_connected {
            return;
        }

        // Reschedule preserving the cadence rather than recreating the
        // timer from "now".
        if let Some(mut at) = self.next_process_at {
            while at <= now {
                at += PROCESS_INTERVAL;
            }
            self.next_process_at = Some(at);
        }

        if let Some(target) = self.estimator.handle_timeout(now) {
            self.update_available_bitrate(target, now, listener);
        }

        if let Some(rate) = self.estimator.probation_rate(now) {
            self.send_probation(rate, listener);
        }
    }

    fn send_probation(&mut self, rate: Bitrate, listener: &mut dyn TccListener) {
        let mut quota = ((rate.as_f64() * PROCESS_INTERVAL.as_secs_f64()) / 8.0) as usize;
        quota = quota.min(MAX_PROBATION_BYTES_PER_TICK);

        if quota < PROBATION_PACKET_SIZE {
            return;
        }

        let cluster = self.next_probe_cluster_id;
        self.next_probe_cluster_id += 1;

        let pacing = PacingInfo {
            probe_cluster_id: cluster,
        };

        trace!("probing at {rate} ({quota} bytes) [cluster:{cluster}]");

        while quota >= PROBATION_PACKET_SIZE {
            let mut packet = self.probation.get_next_packet(PROBATION_PACKET_SIZE);
            quota -= packet.size();

            listener.on_tcc_send_rtp_packet(&mut packet, pacing);
        }
    }

    fn update_available_bitrate(
        &mut self,
        target: Bitrate,
        now: Instant,
        listener: &mut dyn TccListener,
    ) {
        let previous = self.available_bitrate;

        let mut new = target.as_u32();

        // Keep the startup floor while the estimate warms up.
        let in_startup = self
            .connected_at
            .map(|t| now.duration_since(t) <= STARTUP_WINDOW)
            .unwrap_or(false);
        if in_startup {
            new = new.max(self.initial_available_bitrate);
        }

        self.available_bitrate = new;

        self.may_emit_available_bitrate_event(previous, now, listener);
    }

    fn may_emit_available_bitrate_event(
        &mut self,
        previous_bitrate: u32,
        now: Instant,
        listener: &mut dyn TccListener,
    ) {
        let mut notify = false;

        if !self.available_bitrate_event_called {
            // Ensure the first transport sees an event no matter what.
            self.available_bitrate_event_called = true;
            notify = true;
        } else {
            let last = self.last_emitted_bitrate;
            let delta = self.available_bitrate.abs_diff(last) as u64;

            let significant = if last == 0 {
                self.available_bitrate != 0
            } else {
                delta * 100 / last as u64 >= EMIT_THRESHOLD_PERCENT
            };

            if significant {
                notify = true;
            } else if now.duration_since(self.last_available_bitrate_event_at)
                >= MIN_EVENT_INTERVAL
            {
                notify = true;
            } else if self.desired_bitrate_trend.is_unstable() {
                notify = true;
            }
        }

        if !notify {
            return;
        }

        debug!(
            "available bitrate event [available:{}, previous:{previous_bitrate}]",
            self.available_bitrate
        );

        self.last_emitted_bitrate = self.available_bitrate;
        self.last_available_bitrate_event_at = now;

        listener.on_tcc_available_bitrate(self.available_bitrate, previous_bitrate);
    }

    /// Extend a wire transport sequence number, advancing the rollover
    /// tracking (send path).
    fn extend_transport_seq(&mut self, seq: u16) -> u64 {
        let ext = self.peek_extended_seq(seq);

        match self.last_transport_seq {
            Some(last) if ext <= last => {}
            _ => self.last_transport_seq = Some(ext),
        }

        ext
    }

    /// Extend without advancing (feedback lookups may reference older
    /// packets).
    fn peek_extended_seq(&self, seq: u16) -> u64 {
        let Some(last) = self.last_transport_seq else {
            return seq as u64;
        };

        let last16 = last as u16;
        let forward = seq.wrapping_sub(last16);

        if forward < 0x8000 {
            last.wrapping_add(forward as u64)
        } else {
            last.wrapping_sub(last16.wrapping_sub(seq) as u64)
        }
    }
}

impl std::fmt::Debug for TransportCcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCcClient")
            .field("bwe_type", &self.bwe_type)
            .field("available_bitrate", &self.available_bitrate)
            .field("transport_connected", &self.transport_connected)
            .finish()
    }
}
