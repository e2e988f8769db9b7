use std::time::Instant;

use serde_json::{json, Value};

use crate::channel::{Notifier, RequestError};
use crate::rtcp::{CompoundPacket, KeyFrameRequestKind, Nack, ReceptionReport};
use crate::rtp::{RtpPacket, SeqManager, Ssrc};
use crate::streams::RtpStreamSend;

use super::{
    create_rtp_stream, Consumer, ConsumerListener, ConsumerShared, ConsumerType, ProducerStream,
};

/// A producer stream score below this is not worth switching to.
const MIN_HEALTHY_SCORE: u8 = 7;

/// Assumed layer bitrates when the consumable encodings carry no
/// `maxBitrate`, low to high spatial layer.
const DEFAULT_LAYER_BITRATES: [u32; 4] = [150_000, 500_000, 1_200_000, 2_500_000];

/// Media timestamp gap inserted between the last packet of the old layer
/// and the first of the new, as a fraction of the clock rate (one frame
/// at ~30fps).
const SWITCH_TS_GAP_DIVISOR: u32 = 30;

/// The layered consumer: one producer stream per spatial layer, all
/// rewritten onto a single outgoing stream. The bandwidth arbiter decides
/// which layer flows via the `use_available_bitrate` / `increase_layer` /
/// `apply_layers` handshake; actual switching waits for a keyframe on the
/// target layer.
pub struct SimulcastConsumer {
    shared: ConsumerShared,
    rtp_stream: RtpStreamSend,
    seq_manager: SeqManager,
    sync_required: bool,
    /// One slot per consumable encoding, low to high spatial layer.
    producer_streams: Vec<Option<ProducerStream>>,
    preferred_spatial: i16,
    preferred_temporal: i16,
    current_spatial: i16,
    target_spatial: i16,
    current_temporal: i16,
    target_temporal: i16,
    /// Subtracted from input timestamps to keep the output timeline
    /// continuous across layer switches.
    ts_offset: u32,
    last_output_ts: u32,
    /// Last bitrate the arbiter granted, reused when scores change.
    last_available_bitrate: u32,
}

impl SimulcastConsumer {
    pub fn new(
        id: &str,
        data: &Value,
        notifier: Notifier,
    ) -> Result<SimulcastConsumer, RequestError> {
        let shared = ConsumerShared::new(id, data, ConsumerType::Simulcast, notifier)?;

        if shared.consumable_rtp_encodings.len() < 2 {
            return Err(RequestError::type_error(
                "invalid consumableRtpEncodings with size < 2",
            ));
        }

        if shared.rtp_parameters.encodings.len() != 1 {
            return Err(RequestError::type_error(
                "invalid rtpParameters.encodings with size != 1",
            ));
        }

        let encoding = &shared.rtp_parameters.encodings[0];
        let media_codec = shared
            .rtp_parameters
            .codec_for_encoding(encoding)
            .ok_or_else(|| RequestError::type_error("no media codec for encoding"))?;

        if !media_codec.mime_type.can_be_keyframe() {
            return Err(RequestError::type_error(
                "media codec is not keyframe capable",
            ));
        }

        let layers = shared.consumable_rtp_encodings.len();
        let preferred = shared.preferred_layers;
        let preferred_spatial = preferred.spatial_layer.clamp(0, layers as i16 - 1);
        let preferred_temporal = preferred.temporal_layer.max(0);

        let rtp_stream = create_rtp_stream(&shared)?;

        Ok(SimulcastConsumer {
            shared,
            rtp_stream,
            seq_manager: SeqManager::new(),
            sync_required: false,
            producer_streams: vec![None; layers],
            preferred_spatial,
            preferred_temporal,
            current_spatial: -1,
            target_spatial: -1,
            current_temporal: -1,
            target_temporal: -1,
            ts_offset: 0,
            last_output_ts: 0,
            last_available_bitrate: 0,
        })
    }

    pub fn current_layers(&self) -> (i16, i16) {
        (self.current_spatial, self.current_temporal)
    }

    pub fn target_layers(&self) -> (i16, i16) {
        (self.target_spatial, self.target_temporal)
    }

    fn layer_for_ssrc(&self, ssrc: Ssrc) -> Option<i16> {
        self.shared
            .consumable_rtp_encodings
            .iter()
            .position(|e| e.ssrc == ssrc)
            .map(|i| i as i16)
    }

    fn layer_bitrate(&self, layer: i16) -> u32 {
        let idx = layer as usize;

        self.shared.consumable_rtp_encodings[idx]
            .max_bitrate
            .unwrap_or_else(|| {
                DEFAULT_LAYER_BITRATES[idx.min(DEFAULT_LAYER_BITRATES.len() - 1)]
            })
    }

    fn layer_healthy(&self, layer: i16) -> bool {
        self.producer_streams[layer as usize]
            .map(|s| s.score >= MIN_HEALTHY_SCORE)
            .unwrap_or(false)
    }

    /// Healthy layers not above the preferred spatial layer, ascending.
    fn candidate_layers(&self) -> impl Iterator<Item = i16> + '_ {
        (0..=self.preferred_spatial).filter(|l| self.layer_healthy(*l))
    }

    fn set_producer_stream(&mut self, stream: ProducerStream, mapped_ssrc: Ssrc) {
        let Some(layer) = self.layer_for_ssrc(mapped_ssrc) else {
            warn!("no consumable encoding for mapped ssrc {mapped_ssrc}");
            return;
        };

        self.producer_streams[layer as usize] = Some(stream);

        self.emit_score();
    }

    fn emit_layers_change(&self) {
        self.shared.notifier.emit(
            &self.shared.id,
            "layerschange",
            Some(json!({
                "spatialLayer": self.current_spatial,
                "temporalLayer": self.current_temporal,
            })),
        );
    }

    fn request_key_frame_for_layer(&self, layer: i16, listener: &mut dyn ConsumerListener) {
        if layer < 0 {
            return;
        }

        let mapped_ssrc = self.shared.consumable_rtp_encodings[layer as usize].ssrc;

        listener.on_consumer_key_frame_requested(&self.shared.id, mapped_ssrc);
    }
}

impl Consumer for SimulcastConsumer {
    fn shared(&self) -> &ConsumerShared {
        &self.shared
    }

    fn shared_mut(&mut self) -> &mut ConsumerShared {
        &mut self.shared
    }

    fn has_producer_stream(&self) -> bool {
        self.producer_streams.iter().any(|s| s.is_some())
    }

    fn dump(&self) -> Value {
        let mut dump = self.shared.dump_json();
        dump["rtpStream"] = self.rtp_stream.dump_json();
        dump["preferredSpatialLayer"] = json!(self.preferred_spatial);
        dump["preferredTemporalLayer"] = json!(self.preferred_temporal);
        dump["currentSpatialLayer"] = json!(self.current_spatial);
        dump["targetSpatialLayer"] = json!(self.target_spatial);
        dump
    }

    fn stats(&mut self, now: Instant) -> Value {
        let mut stats = vec![self.rtp_stream.stats_json(now)];

        if self.current_spatial >= 0 {
            if let Some(producer) = &self.producer_streams[self.current_spatial as usize] {
                stats.push(json!({
                    "type": "inbound-rtp",
                    "ssrc": *producer.ssrc,
                    "score": producer.score,
                }));
            }
        }

        Value::Array(stats)
    }

    fn score_json(&self) -> Value {
        let producer_score = if self.current_spatial >= 0 {
            self.producer_streams[self.current_spatial as usize]
                .map(|s| s.score)
                .unwrap_or(0)
        } else {
            0
        };

        let producer_scores: Vec<u8> = self
            .producer_streams
            .iter()
            .map(|s| s.map(|s| s.score).unwrap_or(0))
            .collect();

        json!({
            "score": self.rtp_stream.get_score(),
            "producerScore": producer_score,
            "producerScores": producer_scores,
        })
    }

    fn producer_rtp_stream(&mut self, stream: ProducerStream, mapped_ssrc: Ssrc) {
        self.set_producer_stream(stream, mapped_ssrc);
    }

    fn producer_new_rtp_stream(&mut self, stream: ProducerStream, mapped_ssrc: Ssrc) {
        self.set_producer_stream(stream, mapped_ssrc);
    }

    fn producer_rtp_stream_score(
        &mut self,
        mapped_ssrc: Ssrc,
        score: u8,
        _previous_score: u8,
        listener: &mut dyn ConsumerListener,
    ) {
        if let Some(layer) = self.layer_for_ssrc(mapped_ssrc) {
            if let Some(stream) = &mut self.producer_streams[layer as usize] {
                stream.score = score;
            }
        }

        self.emit_score();

        // Layer health changed; either the transport redistributes, or we
        // re-run selection with the last grant ourselves.
        if self.shared.externally_managed_bitrate {
            listener.on_consumer_need_bitrate_change(&self.shared.id);
        } else {
            let bitrate = self.last_available_bitrate;
            self.use_available_bitrate(bitrate, false);
            self.apply_layers(listener);
        }
    }

    fn producer_rtcp_sender_report(&mut self, _mapped_ssrc: Ssrc, _first: bool) {
        // Timestamp alignment across layers would use this; the switch
        // offset below works from packet timestamps alone.
    }

    fn get_bitrate_priority(&self) -> u16 {
        if !self.is_active() {
            return 0;
        }

        if self.candidate_layers().next().is_none() {
            return 0;
        }

        // The further below the preferred layer we run, the louder we
        // ask.
        let current = self.current_spatial.max(-1);
        (self.preferred_spatial - current).max(1) as u16
    }

    fn use_available_bitrate(&mut self, bitrate: u32, _consider_loss: bool) -> u32 {
        self.last_available_bitrate = bitrate;

        let mut new_target = -1;

        for layer in self.candidate_layers() {
            if self.layer_bitrate(layer) <= bitrate {
                new_target = layer;
            } else if new_target == -1 {
                // Even over budget, the lowest healthy layer is better
                // than sending nothing.
                new_target = layer;
                break;
            }
        }

        self.target_spatial = new_target;
        self.target_temporal = if new_target >= 0 {
            self.preferred_temporal
        } else {
            -1
        };

        if new_target >= 0 {
            self.layer_bitrate(new_target)
        } else {
            0
        }
    }

    fn increase_layer(&mut self, bitrate: u32, _consider_loss: bool) -> u32 {
        let next = self
            .candidate_layers()
            .find(|l| *l > self.target_spatial);

        let Some(next) = next else {
            return 0;
        };

        let current_rate = if self.target_spatial >= 0 {
            self.layer_bitrate(self.target_spatial)
        } else {
            0
        };
        let delta = self.layer_bitrate(next).saturating_sub(current_rate);

        if delta > bitrate {
            return 0;
        }

        self.target_spatial = next;
        self.target_temporal = self.preferred_temporal;

        delta
    }

    fn apply_layers(&mut self, listener: &mut dyn ConsumerListener) {
        if self.target_spatial == self.current_spatial {
            return;
        }

        if self.target_spatial < 0 {
            // Nothing affordable; stop emitting until re-granted.
            self.current_spatial = -1;
            self.current_temporal = -1;
            self.emit_layers_change();
            return;
        }

        debug!(
            "targeting spatial layer {} (current {}) [consumerId:{}]",
            self.target_spatial, self.current_spatial, self.shared.id
        );

        // The switch completes when a keyframe arrives on the target
        // layer; ask for one now.
        if self.is_active() {
            self.request_key_frame_for_layer(self.target_spatial, listener);
        }
    }

    fn get_desired_bitrate(&self) -> u32 {
        self.candidate_layers()
            .last()
            .map(|l| self.layer_bitrate(l))
            .unwrap_or(0)
    }

    fn send_rtp_packet(
        &mut self,
        packet: &mut RtpPacket,
        now: Instant,
        listener: &mut dyn ConsumerListener,
    ) {
        if !self.is_active() {
            return;
        }

        let payload_type = packet.payload_type();

        if !self.shared.supported_codec_payload_types.contains(&payload_type) {
            debug!("payload type not supported [payloadType:{payload_type}]");

            return;
        }

        let Some(layer) = self.layer_for_ssrc(packet.ssrc()) else {
            return;
        };

        // Complete a pending layer switch on a keyframe of the target.
        if layer == self.target_spatial
            && self.target_spatial != self.current_spatial
            && packet.is_keyframe()
        {
            if self.current_spatial >= 0 {
                // Continue the output timeline one nominal frame after
                // the last emitted timestamp.
                let gap = self.rtp_stream.params().clock_rate / SWITCH_TS_GAP_DIVISOR;
                let next_ts = self.last_output_ts.wrapping_add(gap);
                self.ts_offset = packet.timestamp().wrapping_sub(next_ts);
            } else {
                self.ts_offset = 0;
            }

            self.seq_manager.sync(packet.sequence_number().wrapping_sub(1));
            self.sync_required = false;

            self.current_spatial = self.target_spatial;
            self.current_temporal = self.target_temporal;

            debug!(
                "switched to spatial layer {} [consumerId:{}]",
                self.current_spatial, self.shared.id
            );

            self.emit_layers_change();
        }

        if layer != self.current_spatial {
            return;
        }

        // Temporal filtering.
        if let Some(tl) = packet.temporal_layer() {
            if self.current_temporal >= 0 && tl as i16 > self.current_temporal {
                return;
            }
        }

        // A resync (transport reconnect, resume) waits for a keyframe on
        // the current layer.
        if self.sync_required {
            if !packet.is_keyframe() {
                return;
            }

            self.seq_manager.sync(packet.sequence_number().wrapping_sub(1));
            self.sync_required = false;
        }

        let seq = self.seq_manager.input(packet.sequence_number());
        let ts = packet.timestamp().wrapping_sub(self.ts_offset);

        let orig_ssrc = packet.ssrc();
        let orig_seq = packet.sequence_number();
        let orig_ts = packet.timestamp();

        packet.set_ssrc(self.shared.rtp_parameters.encodings[0].ssrc);
        packet.set_sequence_number(seq);
        packet.set_timestamp(ts);

        if self.rtp_stream.receive_packet(packet, now) {
            self.last_output_ts = ts;

            listener.on_consumer_send_rtp_packet(&self.shared.id, packet);

            self.shared.emit_packet_event_rtp(packet, false, now);
        } else {
            warn!(
                "failed to send packet [ssrc:{}, seq:{}] from original [seq:{orig_seq}]",
                packet.ssrc(),
                packet.sequence_number(),
            );
        }

        packet.set_ssrc(orig_ssrc);
        packet.set_sequence_number(orig_seq);
        packet.set_timestamp(orig_ts);
    }

    fn get_rtcp(&mut self, packet: &mut CompoundPacket, ssrc: Ssrc, now: Instant) {
        assert_eq!(ssrc, self.rtp_stream.ssrc(), "RTP stream does not match");

        if !self.shared.rtcp_due(now) {
            return;
        }

        let Some(report) = self.rtp_stream.get_rtcp_sender_report(now) else {
            return;
        };

        packet.add_sender_report(report);
        packet.add_sdes_chunk(self.rtp_stream.get_rtcp_sdes_chunk());

        self.shared.last_rtcp_sent_time = now;
    }

    fn need_worst_remote_fraction_lost(&self, _mapped_ssrc: Ssrc, worst: &mut u8) {
        if !self.is_active() {
            return;
        }

        let fraction_lost = self.rtp_stream.get_fraction_lost();

        if fraction_lost > *worst {
            *worst = fraction_lost;
        }
    }

    fn receive_nack(&mut self, nack: &Nack, now: Instant, listener: &mut dyn ConsumerListener) {
        if !self.is_active() {
            return;
        }

        self.shared.emit_packet_event_nack(now);

        let has_rtx = self.rtp_stream.has_rtx();
        let shared = &self.shared;

        self.rtp_stream.receive_nack(nack, now, &mut |p| {
            listener.on_consumer_retransmit_rtp_packet(&shared.id, p);

            shared.emit_packet_event_rtp(p, has_rtx, now);
        });
    }

    fn receive_key_frame_request(
        &mut self,
        kind: KeyFrameRequestKind,
        ssrc: Ssrc,
        now: Instant,
        listener: &mut dyn ConsumerListener,
    ) {
        match kind {
            KeyFrameRequestKind::Pli => self.shared.emit_packet_event_pli(ssrc, now),
            KeyFrameRequestKind::Fir => self.shared.emit_packet_event_fir(ssrc, now),
        }

        self.rtp_stream.receive_key_frame_request(kind);

        if self.is_active() {
            self.request_key_frame(listener);
        }
    }

    fn receive_rtcp_receiver_report(&mut self, report: &ReceptionReport, now: Instant) {
        if let Some((_score, _previous)) = self.rtp_stream.receive_rtcp_receiver_report(report, now)
        {
            self.emit_score();
        }
    }

    fn get_transmission_rate(&mut self, now: Instant) -> u32 {
        if !self.is_active() {
            return 0;
        }

        self.rtp_stream.get_bitrate(now)
    }

    fn get_rtt(&self) -> f32 {
        self.rtp_stream.get_rtt()
    }

    fn request_key_frame(&mut self, listener: &mut dyn ConsumerListener) {
        // Simulcast is video by construction.
        let layer = if self.target_spatial >= 0 {
            self.target_spatial
        } else if self.current_spatial >= 0 {
            self.current_spatial
        } else {
            0
        };

        self.request_key_frame_for_layer(layer, listener);
    }

    fn user_on_transport_connected(&mut self, listener: &mut dyn ConsumerListener) {
        self.sync_required = true;
        self.rtp_stream.resume();

        if self.is_active() {
            self.request_key_frame(listener);
        }
    }

    fn user_on_transport_disconnected(&mut self) {
        self.rtp_stream.pause();
    }

    fn user_on_paused(&mut self) {
        self.rtp_stream.pause();
    }

    fn user_on_resumed(&mut self, listener: &mut dyn ConsumerListener) {
        self.sync_required = true;
        self.rtp_stream.resume();

        if self.is_active() {
            self.request_key_frame(listener);
        }
    }
}
