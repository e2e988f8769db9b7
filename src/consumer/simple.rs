use std::time::Instant;

use serde_json::{json, Value};

use crate::channel::{Notifier, RequestError};
use crate::params::MediaKind;
use crate::rtcp::{CompoundPacket, KeyFrameRequestKind, Nack, ReceptionReport};
use crate::rtp::{RtpPacket, SeqManager, Ssrc};
use crate::streams::RtpStreamSend;

use super::{
    create_rtp_stream, Consumer, ConsumerListener, ConsumerShared, ConsumerType, ProducerStream,
};

/// The single-encoding consumer: forwards exactly one producer stream
/// onto one outgoing stream, rewriting SSRC and sequence numbers.
///
/// This variant does not play the bandwidth arbiter game; its priority
/// and desired bitrate are zero.
#[derive(Debug)]
pub struct SimpleConsumer {
    shared: ConsumerShared,
    rtp_stream: RtpStreamSend,
    seq_manager: SeqManager,
    /// Forces the next forwarded packet to be a resync point.
    sync_required: bool,
    keyframe_supported: bool,
    producer_stream: Option<ProducerStream>,
}

impl SimpleConsumer {
    pub fn new(id: &str, data: &Value, notifier: Notifier) -> Result<SimpleConsumer, RequestError> {
        let shared = ConsumerShared::new(id, data, ConsumerType::Simple, notifier)?;

        // Ensure there is a single encoding.
        if shared.consumable_rtp_encodings.len() != 1 {
            return Err(RequestError::type_error(
                "invalid consumableRtpEncodings with size != 1",
            ));
        }

        let encoding = &shared.rtp_parameters.encodings[0];
        let media_codec = shared
            .rtp_parameters
            .codec_for_encoding(encoding)
            .ok_or_else(|| RequestError::type_error("no media codec for encoding"))?;

        let keyframe_supported = media_codec.mime_type.can_be_keyframe();

        let rtp_stream = create_rtp_stream(&shared)?;

        Ok(SimpleConsumer {
            shared,
            rtp_stream,
            seq_manager: SeqManager::new(),
            sync_required: false,
            keyframe_supported,
            producer_stream: None,
        })
    }

    pub fn rtp_stream(&self) -> &RtpStreamSend {
        &self.rtp_stream
    }
}

impl Consumer for SimpleConsumer {
    fn shared(&self) -> &ConsumerShared {
        &self.shared
    }

    fn shared_mut(&mut self) -> &mut ConsumerShared {
        &mut self.shared
    }

    fn has_producer_stream(&self) -> bool {
        self.producer_stream.is_some()
    }

    fn dump(&self) -> Value {
        let mut dump = self.shared.dump_json();
        dump["rtpStream"] = self.rtp_stream.dump_json();
        dump
    }

    fn stats(&mut self, now: Instant) -> Value {
        let mut stats = vec![self.rtp_stream.stats_json(now)];

        if let Some(producer) = &self.producer_stream {
            stats.push(json!({
                "type": "inbound-rtp",
                "ssrc": *producer.ssrc,
                "score": producer.score,
            }));
        }

        Value::Array(stats)
    }

    fn score_json(&self) -> Value {
        json!({
            "score": self.rtp_stream.get_score(),
            "producerScore": self.producer_stream.map(|s| s.score).unwrap_or(0),
        })
    }

    fn producer_rtp_stream(&mut self, stream: ProducerStream, _mapped_ssrc: Ssrc) {
        self.producer_stream = Some(stream);

        self.emit_score();
    }

    fn producer_new_rtp_stream(&mut self, stream: ProducerStream, _mapped_ssrc: Ssrc) {
        self.producer_stream = Some(stream);

        self.emit_score();
    }

    fn producer_rtp_stream_score(
        &mut self,
        _mapped_ssrc: Ssrc,
        score: u8,
        _previous_score: u8,
        _listener: &mut dyn ConsumerListener,
    ) {
        if let Some(producer) = &mut self.producer_stream {
            producer.score = score;
        }

        self.emit_score();
    }

    fn producer_rtcp_sender_report(&mut self, _mapped_ssrc: Ssrc, _first: bool) {
        // Nothing to align for a single stream.
    }

    fn get_bitrate_priority(&self) -> u16 {
        // SimpleConsumer does not play the BWE game.
        0
    }

    fn use_available_bitrate(&mut self, _bitrate: u32, _consider_loss: bool) -> u32 {
        // SimpleConsumer does not play the BWE game.
        0
    }

    fn increase_layer(&mut self, _bitrate: u32, _consider_loss: bool) -> u32 {
        // SimpleConsumer does not play the BWE game.
        0
    }

    fn apply_layers(&mut self, _listener: &mut dyn ConsumerListener) {
        // SimpleConsumer does not play the BWE game.
    }

    fn get_desired_bitrate(&self) -> u32 {
        // SimpleConsumer does not play the BWE game.
        0
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

        // This happens when the consumer supports just a subset of the
        // producer's codecs.
        if !self.shared.supported_codec_payload_types.contains(&payload_type) {
            debug!("payload type not supported [payloadType:{payload_type}]");

            return;
        }

        // If we need to sync, support keyframes and this is not one,
        // ignore the packet.
        if self.sync_required && self.keyframe_supported && !packet.is_keyframe() {
            return;
        }

        // Whether this is the first packet after re-sync.
        let is_sync_packet = self.sync_required;

        if is_sync_packet {
            if packet.is_keyframe() {
                debug!("sync key frame received");
            }

            self.seq_manager.sync(packet.sequence_number().wrapping_sub(1));
            self.sync_required = false;
        }

        let seq = self.seq_manager.input(packet.sequence_number());

        // Save original fields; the packet is shared with other
        // consumers of this producer and must go back untouched.
        let orig_ssrc = packet.ssrc();
        let orig_seq = packet.sequence_number();

        // Rewrite for our outgoing stream.
        packet.set_ssrc(self.shared.rtp_parameters.encodings[0].ssrc);
        packet.set_sequence_number(seq);

        if is_sync_packet {
            debug!(
                "sending sync packet [ssrc:{}, seq:{}, ts:{}] from original [seq:{orig_seq}]",
                packet.ssrc(),
                packet.sequence_number(),
                packet.timestamp(),
            );
        }

        if self.rtp_stream.receive_packet(packet, now) {
            listener.on_consumer_send_rtp_packet(&self.shared.id, packet);

            self.shared.emit_packet_event_rtp(packet, false, now);
        } else {
            warn!(
                "failed to send packet [ssrc:{}, seq:{}, ts:{}] from original [seq:{orig_seq}]",
                packet.ssrc(),
                packet.sequence_number(),
                packet.timestamp(),
            );
        }

        // Restore.
        packet.set_ssrc(orig_ssrc);
        packet.set_sequence_number(orig_seq);
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

        // If our fraction lost is worse than the given one, update it.
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
        if self.shared.kind != MediaKind::Video {
            return;
        }

        let mapped_ssrc = self.shared.consumable_rtp_encodings[0].ssrc;

        listener.on_consumer_key_frame_requested(&self.shared.id, mapped_ssrc);
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
