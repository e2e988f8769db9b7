//! Consumers: per-subscription forwarding engines.
//!
//! A consumer admits packets from its producer, rewrites them onto its own
//! outgoing stream and keeps the RTCP feedback loop alive. The shared
//! record and request dispatch live here; packet admission and layer
//! selection are variant-specific ([`SimpleConsumer`],
//! [`SimulcastConsumer`]).

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::channel::{ConsumerMethod, Notifier, Request, RequestError, Response};
use crate::params::{MediaKind, RtpEncodingParameters, RtpParameters};
use crate::rtcp::{CompoundPacket, KeyFrameRequestKind, Nack, ReceptionReport};
use crate::rtp::{HeaderExtensionIds, Pt, RtpPacket, Ssrc};
use crate::streams::{RtpStreamParams, RtpStreamSend, RETRANSMISSION_BUFFER_SIZE};
use crate::util::{already_happened, unix_ms};

mod simple;
mod simulcast;

pub use simple::SimpleConsumer;
pub use simulcast::SimulcastConsumer;

// Upper bounds on sender report spacing. Audio tolerates sparser reports
// than video.
const MAX_AUDIO_RTCP_INTERVAL: Duration = Duration::from_millis(5000);
const MAX_VIDEO_RTCP_INTERVAL: Duration = Duration::from_millis(1000);

/// Upcalls from a consumer to its router/transport. All calls are
/// synchronous; the router outlives every consumer it owns.
pub trait ConsumerListener {
    /// A freshly rewritten packet is ready for transmission.
    fn on_consumer_send_rtp_packet(&mut self, consumer_id: &str, packet: &RtpPacket);

    /// A retransmission (RTX-rewritten when negotiated) is ready.
    fn on_consumer_retransmit_rtp_packet(&mut self, consumer_id: &str, packet: &RtpPacket);

    /// The consumer needs a keyframe from the producer stream with the
    /// given mapped SSRC.
    fn on_consumer_key_frame_requested(&mut self, consumer_id: &str, mapped_ssrc: Ssrc);

    /// Layered consumer wants the transport to redistribute bitrate.
    fn on_consumer_need_bitrate_change(&mut self, consumer_id: &str);

    /// The producer was closed; the router must remove this consumer
    /// immediately after this call returns.
    fn on_consumer_producer_closed(&mut self, consumer_id: &str);
}

/// Which variant a consumer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerType {
    Simple,
    Simulcast,
}

impl ConsumerType {
    fn as_str(&self) -> &'static str {
        match self {
            ConsumerType::Simple => "simple",
            ConsumerType::Simulcast => "simulcast",
        }
    }
}

/// Snapshot of a producer-side stream this consumer reads from. Updated
/// through producer events; the producer itself is owned elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct ProducerStream {
    pub ssrc: Ssrc,
    pub score: u8,
}

/// Which packet events the consumer surfaces as notifications.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PacketEventTypes {
    pub rtp: bool,
    pub nack: bool,
    pub pli: bool,
    pub fir: bool,
}

impl PacketEventTypes {
    fn to_csv(self) -> String {
        let mut parts = Vec::new();
        if self.rtp {
            parts.push("rtp");
        }
        if self.nack {
            parts.push("nack");
        }
        if self.pli {
            parts.push("pli");
        }
        if self.fir {
            parts.push("fir");
        }
        parts.join(",")
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PreferredLayers {
    #[serde(default = "default_layer")]
    pub spatial_layer: i16,
    #[serde(default = "default_layer")]
    pub temporal_layer: i16,
}

fn default_layer() -> i16 {
    i16::MAX
}

impl Default for PreferredLayers {
    fn default() -> Self {
        PreferredLayers {
            spatial_layer: i16::MAX,
            temporal_layer: i16::MAX,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerData {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumable_rtp_encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    preferred_layers: Option<PreferredLayers>,
}

/// State common to every consumer variant.
#[derive(Debug)]
pub struct ConsumerShared {
    pub(crate) id: String,
    pub(crate) kind: MediaKind,
    pub(crate) rtp_parameters: RtpParameters,
    pub(crate) consumer_type: ConsumerType,
    pub(crate) consumable_rtp_encodings: Vec<RtpEncodingParameters>,
    pub(crate) header_extension_ids: HeaderExtensionIds,
    pub(crate) supported_codec_payload_types: BTreeSet<Pt>,
    pub(crate) media_ssrcs: Vec<Ssrc>,
    pub(crate) rtx_ssrcs: Vec<Ssrc>,
    pub(crate) max_rtcp_interval: Duration,
    pub(crate) last_rtcp_sent_time: Instant,
    pub(crate) packet_event_types: PacketEventTypes,
    pub(crate) externally_managed_bitrate: bool,
    pub(crate) transport_connected: bool,
    pub(crate) paused: bool,
    pub(crate) producer_paused: bool,
    pub(crate) producer_closed: bool,
    pub(crate) preferred_layers: PreferredLayers,
    pub(crate) notifier: Notifier,
}

impl ConsumerShared {
    pub(crate) fn new(
        id: &str,
        data: &Value,
        consumer_type: ConsumerType,
        notifier: Notifier,
    ) -> Result<ConsumerShared, RequestError> {
        let data: ConsumerData = serde_json::from_value(data.clone())
            .map_err(|e| RequestError::type_error(e.to_string()))?;

        data.rtp_parameters.validate()?;

        if data.consumable_rtp_encodings.is_empty() {
            return Err(RequestError::type_error("empty consumableRtpEncodings"));
        }

        for encoding in &data.consumable_rtp_encodings {
            if *encoding.ssrc == 0 {
                return Err(RequestError::type_error(
                    "wrong encoding in consumableRtpEncodings (missing ssrc)",
                ));
            }
        }

        // Resolve recognised header extension ids, first non-zero wins.
        let mut header_extension_ids = HeaderExtensionIds::default();
        for exten in &data.rtp_parameters.header_extensions {
            header_extension_ids.assign(exten.uri, exten.id);
        }

        // Only media codecs are forwardable.
        let supported_codec_payload_types: BTreeSet<Pt> = data
            .rtp_parameters
            .codecs
            .iter()
            .filter(|c| c.mime_type.is_media_codec())
            .map(|c| c.payload_type)
            .collect();

        let media_ssrcs = data.rtp_parameters.encodings.iter().map(|e| e.ssrc).collect();
        let rtx_ssrcs = data
            .rtp_parameters
            .encodings
            .iter()
            .filter_map(|e| e.rtx.map(|r| r.ssrc))
            .collect();

        let max_rtcp_interval = match data.kind {
            MediaKind::Audio => MAX_AUDIO_RTCP_INTERVAL,
            MediaKind::Video => MAX_VIDEO_RTCP_INTERVAL,
        };

        Ok(ConsumerShared {
            id: id.to_string(),
            kind: data.kind,
            rtp_parameters: data.rtp_parameters,
            consumer_type,
            consumable_rtp_encodings: data.consumable_rtp_encodings,
            header_extension_ids,
            supported_codec_payload_types,
            media_ssrcs,
            rtx_ssrcs,
            max_rtcp_interval,
            last_rtcp_sent_time: already_happened(),
            packet_event_types: PacketEventTypes::default(),
            externally_managed_bitrate: false,
            transport_connected: false,
            paused: data.paused,
            producer_paused: false,
            producer_closed: false,
            preferred_layers: data.preferred_layers.unwrap_or_default(),
            notifier,
        })
    }

    /// The gating conditions the shared record can check on its own. A
    /// variant adds the producer stream requirement on top.
    pub(crate) fn base_active(&self) -> bool {
        self.transport_connected && !self.paused && !self.producer_paused && !self.producer_closed
    }

    /// Whether the RTCP interval has elapsed. The 1.15 factor absorbs
    /// timer jitter without overrunning the interval.
    pub(crate) fn rtcp_due(&self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_rtcp_sent_time);
        elapsed.as_millis() as f64 * 1.15 >= self.max_rtcp_interval.as_millis() as f64
    }

    pub(crate) fn dump_json(&self) -> Value {
        json!({
            "id": self.id,
            "kind": self.kind.to_string(),
            "rtpParameters": self.rtp_parameters,
            "type": self.consumer_type.as_str(),
            "consumableRtpEncodings": self.consumable_rtp_encodings,
            "supportedCodecPayloadTypes": self.supported_codec_payload_types,
            "paused": self.paused,
            "producerPaused": self.producer_paused,
            "packetEventTypes": self.packet_event_types.to_csv(),
        })
    }

    pub(crate) fn emit_packet_event_rtp(&self, packet: &RtpPacket, is_rtx: bool, now: Instant) {
        if !self.packet_event_types.rtp {
            return;
        }

        let mut info = packet.header_json();
        if is_rtx {
            info["isRtx"] = json!(true);
        }

        self.notifier.emit(
            &self.id,
            "packet",
            Some(json!({
                "type": "rtp",
                "timestamp": unix_ms(now),
                "direction": "out",
                "info": info,
            })),
        );
    }

    pub(crate) fn emit_packet_event_pli(&self, ssrc: Ssrc, now: Instant) {
        if !self.packet_event_types.pli {
            return;
        }

        self.notifier.emit(
            &self.id,
            "packet",
            Some(json!({
                "type": "pli",
                "timestamp": unix_ms(now),
                "direction": "in",
                "info": { "ssrc": *ssrc },
            })),
        );
    }

    pub(crate) fn emit_packet_event_fir(&self, ssrc: Ssrc, now: Instant) {
        if !self.packet_event_types.fir {
            return;
        }

        self.notifier.emit(
            &self.id,
            "packet",
            Some(json!({
                "type": "fir",
                "timestamp": unix_ms(now),
                "direction": "in",
                "info": { "ssrc": *ssrc },
            })),
        );
    }

    pub(crate) fn emit_packet_event_nack(&self, now: Instant) {
        if !self.packet_event_types.nack {
            return;
        }

        self.notifier.emit(
            &self.id,
            "packet",
            Some(json!({
                "type": "nack",
                "timestamp": unix_ms(now),
                "direction": "in",
                "info": {},
            })),
        );
    }
}

/// Build the outgoing send stream from the consumer's first encoding: the
/// codec decides clock rate and FEC/DTX flags, its feedback entries decide
/// NACK/PLI/FIR support, and NACK support sizes the retransmission buffer.
pub(crate) fn create_rtp_stream(shared: &ConsumerShared) -> Result<RtpStreamSend, RequestError> {
    let encoding = &shared.rtp_parameters.encodings[0];
    let media_codec = shared
        .rtp_parameters
        .codec_for_encoding(encoding)
        .ok_or_else(|| RequestError::type_error("no media codec for encoding"))?;

    let mut use_in_band_fec = false;
    let mut use_dtx = false;

    if media_codec.parameter_i64("useinbandfec") == Some(1) {
        debug!("in band FEC enabled");
        use_in_band_fec = true;
    }

    if media_codec.parameter_i64("usedtx") == Some(1) || encoding.dtx {
        debug!("DTX enabled");
        use_dtx = true;
    }

    let mut use_nack = false;
    let mut use_pli = false;
    let mut use_fir = false;

    for fb in &media_codec.rtcp_feedback {
        if !use_nack && fb.kind == "nack" && fb.parameter.is_empty() {
            debug!("NACK supported");
            use_nack = true;
        } else if !use_pli && fb.kind == "nack" && fb.parameter == "pli" {
            debug!("PLI supported");
            use_pli = true;
        } else if !use_fir && fb.kind == "ccm" && fb.parameter == "fir" {
            debug!("FIR supported");
            use_fir = true;
        }
    }

    let params = RtpStreamParams {
        ssrc: encoding.ssrc,
        payload_type: media_codec.payload_type,
        mime_type: media_codec.mime_type.clone(),
        clock_rate: media_codec.clock_rate,
        cname: shared.rtp_parameters.rtcp.cname.clone(),
        use_nack,
        use_pli,
        use_fir,
        use_in_band_fec,
        use_dtx,
    };

    let buffer_size = if use_nack { RETRANSMISSION_BUFFER_SIZE } else { 0 };

    let mut stream = RtpStreamSend::new(params, buffer_size);

    if shared.paused || shared.producer_paused {
        stream.pause();
    }

    if let Some(rtx) = encoding.rtx {
        if let Some(rtx_codec) = shared.rtp_parameters.rtx_codec_for_encoding(encoding) {
            stream.set_rtx(rtx_codec.payload_type, rtx.ssrc);
        }
    }

    Ok(stream)
}

fn parse_packet_event_types(data: &Value) -> Result<PacketEventTypes, RequestError> {
    let types = data
        .get("types")
        .and_then(|v| v.as_array())
        .ok_or_else(|| RequestError::type_error("wrong types (not an array)"))?;

    let mut new_types = PacketEventTypes::default();

    for t in types {
        let s = t
            .as_str()
            .ok_or_else(|| RequestError::type_error("wrong type (not a string)"))?;

        match s {
            "rtp" => new_types.rtp = true,
            "nack" => new_types.nack = true,
            "pli" => new_types.pli = true,
            "fir" => new_types.fir = true,
            // Unknown strings are silently ignored.
            _ => {}
        }
    }

    Ok(new_types)
}

/// The consumer contract: shared dispatch plus the variant-specific
/// forwarding, RTCP and layer operations.
///
/// Back references are non-owning by design: the router outlives its
/// consumers and is handed in as `&mut dyn ConsumerListener` per call.
pub trait Consumer {
    fn shared(&self) -> &ConsumerShared;
    fn shared_mut(&mut self) -> &mut ConsumerShared;

    fn id(&self) -> &str {
        &self.shared().id
    }

    fn kind(&self) -> MediaKind {
        self.shared().kind
    }

    fn consumer_type(&self) -> ConsumerType {
        self.shared().consumer_type
    }

    fn media_ssrcs(&self) -> &[Ssrc] {
        &self.shared().media_ssrcs
    }

    fn rtx_ssrcs(&self) -> &[Ssrc] {
        &self.shared().rtx_ssrcs
    }

    fn header_extension_ids(&self) -> HeaderExtensionIds {
        self.shared().header_extension_ids
    }

    fn is_paused(&self) -> bool {
        self.shared().paused
    }

    fn is_producer_paused(&self) -> bool {
        self.shared().producer_paused
    }

    /// The transport tells a layered consumer that the arbiter manages
    /// its bitrate.
    fn set_externally_managed_bitrate(&mut self) {
        self.shared_mut().externally_managed_bitrate = true;
    }

    /// Whether the consumer currently emits packets. Every component must
    /// hold: transport up, neither side paused, producer alive and a
    /// producer stream known.
    fn is_active(&self) -> bool {
        self.shared().base_active() && self.has_producer_stream()
    }

    fn has_producer_stream(&self) -> bool;

    /// Full state dump (DUMP request).
    fn dump(&self) -> Value;

    /// Stats array (GET_STATS request).
    fn stats(&mut self, now: Instant) -> Value;

    /// Score payload for the `score` notification.
    fn score_json(&self) -> Value;

    fn emit_score(&self) {
        let data = self.score_json();
        let shared = self.shared();
        shared.notifier.emit(&shared.id, "score", Some(data));
    }

    /// Dispatch a control request. Always terminates in exactly one
    /// accept or reject.
    fn handle_request(
        &mut self,
        request: &Request,
        now: Instant,
        listener: &mut dyn ConsumerListener,
    ) -> Response {
        match request.method {
            ConsumerMethod::Dump => Response::accept_data(self.dump()),

            ConsumerMethod::GetStats => Response::accept_data(self.stats(now)),

            ConsumerMethod::Pause => {
                if self.shared().paused {
                    return Response::accept();
                }

                let was_active = self.is_active();
                self.shared_mut().paused = true;

                debug!("consumer paused [consumerId:{}]", self.id());

                if was_active {
                    self.user_on_paused();
                }

                Response::accept()
            }

            ConsumerMethod::Resume => {
                if !self.shared().paused {
                    return Response::accept();
                }

                self.shared_mut().paused = false;

                debug!("consumer resumed [consumerId:{}]", self.id());

                if self.is_active() {
                    self.user_on_resumed(listener);
                }

                Response::accept()
            }

            ConsumerMethod::EnablePacketEvent => match parse_packet_event_types(&request.data) {
                Ok(types) => {
                    self.shared_mut().packet_event_types = types;
                    Response::accept()
                }
                Err(e) => e.into(),
            },

            ConsumerMethod::RequestKeyFrame => {
                if self.is_active() {
                    self.request_key_frame(listener);
                }
                Response::accept()
            }
        }
    }

    fn transport_connected(&mut self, listener: &mut dyn ConsumerListener) {
        self.shared_mut().transport_connected = true;

        debug!("transport connected [consumerId:{}]", self.id());

        self.user_on_transport_connected(listener);
    }

    fn transport_disconnected(&mut self) {
        self.shared_mut().transport_connected = false;

        debug!("transport disconnected [consumerId:{}]", self.id());

        self.user_on_transport_disconnected();
    }

    fn producer_paused(&mut self) {
        if self.shared().producer_paused {
            return;
        }

        let was_active = self.is_active();
        self.shared_mut().producer_paused = true;

        debug!("producer paused [consumerId:{}]", self.id());

        if was_active {
            self.user_on_paused();
        }

        let shared = self.shared();
        shared.notifier.emit(&shared.id, "producerpause", None);
    }

    fn producer_resumed(&mut self, listener: &mut dyn ConsumerListener) {
        if !self.shared().producer_paused {
            return;
        }

        self.shared_mut().producer_paused = false;

        debug!("producer resumed [consumerId:{}]", self.id());

        if self.is_active() {
            self.user_on_resumed(listener);
        }

        let shared = self.shared();
        shared.notifier.emit(&shared.id, "producerresume", None);
    }

    /// The router must destroy this consumer right after this call
    /// returns.
    fn producer_closed(&mut self, listener: &mut dyn ConsumerListener) {
        if self.shared().producer_closed {
            return;
        }

        self.shared_mut().producer_closed = true;

        debug!("producer closed [consumerId:{}]", self.id());

        let shared = self.shared();
        shared.notifier.emit(&shared.id, "producerclose", None);

        listener.on_consumer_producer_closed(self.id());
    }

    // Producer side events.
    fn producer_rtp_stream(&mut self, stream: ProducerStream, mapped_ssrc: Ssrc);
    fn producer_new_rtp_stream(&mut self, stream: ProducerStream, mapped_ssrc: Ssrc);
    fn producer_rtp_stream_score(
        &mut self,
        mapped_ssrc: Ssrc,
        score: u8,
        previous_score: u8,
        listener: &mut dyn ConsumerListener,
    );
    fn producer_rtcp_sender_report(&mut self, mapped_ssrc: Ssrc, first: bool);

    // The bandwidth arbiter handshake.
    fn get_bitrate_priority(&self) -> u16;
    fn use_available_bitrate(&mut self, bitrate: u32, consider_loss: bool) -> u32;
    fn increase_layer(&mut self, bitrate: u32, consider_loss: bool) -> u32;
    fn apply_layers(&mut self, listener: &mut dyn ConsumerListener);
    fn get_desired_bitrate(&self) -> u32;

    // The packet path.
    fn send_rtp_packet(
        &mut self,
        packet: &mut RtpPacket,
        now: Instant,
        listener: &mut dyn ConsumerListener,
    );

    /// Append this consumer's periodic RTCP (sender report + SDES) for
    /// the given outgoing stream to the compound packet.
    fn get_rtcp(&mut self, packet: &mut CompoundPacket, ssrc: Ssrc, now: Instant);

    /// Fold this consumer's remote fraction lost into `worst`.
    fn need_worst_remote_fraction_lost(&self, mapped_ssrc: Ssrc, worst: &mut u8);

    fn receive_nack(&mut self, nack: &Nack, now: Instant, listener: &mut dyn ConsumerListener);

    fn receive_key_frame_request(
        &mut self,
        kind: KeyFrameRequestKind,
        ssrc: Ssrc,
        now: Instant,
        listener: &mut dyn ConsumerListener,
    );

    fn receive_rtcp_receiver_report(&mut self, report: &ReceptionReport, now: Instant);

    fn get_transmission_rate(&mut self, now: Instant) -> u32;

    fn get_rtt(&self) -> f32;

    /// Ask the producer side for a keyframe. No-op for audio.
    fn request_key_frame(&mut self, listener: &mut dyn ConsumerListener);

    // Hooks invoked by the shared dispatch on state transitions.
    fn user_on_transport_connected(&mut self, listener: &mut dyn ConsumerListener);
    fn user_on_transport_disconnected(&mut self);
    fn user_on_paused(&mut self);
    fn user_on_resumed(&mut self, listener: &mut dyn ConsumerListener);
}
