#![allow(unused)]

use serde_json::{json, Value};

use sfu_core::channel::Notifier;
use sfu_core::consumer::ConsumerListener;
use sfu_core::rtp::{Pt, RtpPacket, Ssrc};

/// Records every upcall a consumer makes.
#[derive(Default)]
pub struct TestListener {
    pub sent: Vec<RtpPacket>,
    pub retransmitted: Vec<RtpPacket>,
    pub keyframe_requests: Vec<Ssrc>,
    pub need_bitrate_change: Vec<String>,
    pub producer_closed: Vec<String>,
}

impl ConsumerListener for TestListener {
    fn on_consumer_send_rtp_packet(&mut self, _consumer_id: &str, packet: &RtpPacket) {
        self.sent.push(packet.clone());
    }

    fn on_consumer_retransmit_rtp_packet(&mut self, _consumer_id: &str, packet: &RtpPacket) {
        self.retransmitted.push(packet.clone());
    }

    fn on_consumer_key_frame_requested(&mut self, _consumer_id: &str, mapped_ssrc: Ssrc) {
        self.keyframe_requests.push(mapped_ssrc);
    }

    fn on_consumer_need_bitrate_change(&mut self, consumer_id: &str) {
        self.need_bitrate_change.push(consumer_id.to_string());
    }

    fn on_consumer_producer_closed(&mut self, consumer_id: &str) {
        self.producer_closed.push(consumer_id.to_string());
    }
}

/// One-encoding Opus consumer: outgoing SSRC 1111, consumable SSRC 2222,
/// PT 100.
pub fn audio_consumer_data() -> Value {
    json!({
        "kind": "audio",
        "rtpParameters": {
            "codecs": [
                {
                    "mimeType": "audio/opus",
                    "payloadType": 100,
                    "clockRate": 48000,
                    "channels": 2,
                }
            ],
            "encodings": [{ "ssrc": 1111 }],
            "rtcp": { "cname": "audio-cname" },
        },
        "consumableRtpEncodings": [{ "ssrc": 2222 }],
    })
}

/// One-encoding VP8 consumer with RTX: outgoing SSRC 1111 (RTX 1112),
/// consumable SSRC 2222, PT 101 (RTX 102).
pub fn video_consumer_data() -> Value {
    json!({
        "kind": "video",
        "rtpParameters": {
            "codecs": [
                {
                    "mimeType": "video/VP8",
                    "payloadType": 101,
                    "clockRate": 90000,
                    "rtcpFeedback": [
                        { "type": "nack" },
                        { "type": "nack", "parameter": "pli" },
                        { "type": "ccm", "parameter": "fir" }
                    ],
                },
                {
                    "mimeType": "video/rtx",
                    "payloadType": 102,
                    "clockRate": 90000,
                    "parameters": { "apt": 101 },
                }
            ],
            "encodings": [{ "ssrc": 1111, "rtx": { "ssrc": 1112 } }],
            "rtcp": { "cname": "video-cname" },
        },
        "consumableRtpEncodings": [{ "ssrc": 2222 }],
    })
}

/// Three-layer VP8 simulcast consumer: consumable SSRCs 2221/2222/2223
/// low to high, outgoing SSRC 1111.
pub fn simulcast_consumer_data(preferred: Option<(i64, i64)>) -> Value {
    let mut data = json!({
        "kind": "video",
        "rtpParameters": {
            "codecs": [
                {
                    "mimeType": "video/VP8",
                    "payloadType": 101,
                    "clockRate": 90000,
                    "rtcpFeedback": [{ "type": "nack" }],
                }
            ],
            "encodings": [{ "ssrc": 1111 }],
            "rtcp": { "cname": "simulcast-cname" },
        },
        "consumableRtpEncodings": [
            { "ssrc": 2221, "maxBitrate": 150_000 },
            { "ssrc": 2222, "maxBitrate": 500_000 },
            { "ssrc": 2223, "maxBitrate": 1_200_000 }
        ],
    });

    if let Some((spatial, temporal)) = preferred {
        data["preferredLayers"] = json!({
            "spatialLayer": spatial,
            "temporalLayer": temporal,
        });
    }

    data
}

pub fn media_packet(ssrc: u32, pt: u8, seq: u16, timestamp: u32) -> RtpPacket {
    RtpPacket::build(
        Ssrc::from(ssrc),
        Pt::from(pt),
        seq,
        timestamp,
        &[0xAB; 120],
    )
}

pub fn keyframe_packet(ssrc: u32, pt: u8, seq: u16, timestamp: u32) -> RtpPacket {
    let mut packet = media_packet(ssrc, pt, seq, timestamp);
    packet.set_keyframe(true);
    packet
}

pub fn notifier() -> Notifier {
    Notifier::new()
}
