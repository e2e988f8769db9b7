//! Control channel dispatch: DUMP, GET_STATS, ENABLE_PACKET_EVENT.

mod common;

use std::time::Instant;

use common::*;
use serde_json::json;
use sfu_core::channel::{ConsumerMethod, Request, RequestError, Response};
use sfu_core::consumer::{Consumer, ProducerStream, SimpleConsumer};
use sfu_core::rtcp::Nack;

fn connected_video(
    notifier: sfu_core::channel::Notifier,
    listener: &mut TestListener,
) -> SimpleConsumer {
    let mut consumer = SimpleConsumer::new("c1", &video_consumer_data(), notifier).unwrap();
    consumer.transport_connected(listener);
    consumer.producer_rtp_stream(
        ProducerStream {
            ssrc: 2222.into(),
            score: 9,
        },
        2222.into(),
    );
    consumer
}

fn request(method: ConsumerMethod, data: serde_json::Value) -> Request {
    Request::new(42, "c1", method, data)
}

#[test]
fn dump_shape() {
    let mut listener = TestListener::default();
    let mut consumer = connected_video(notifier(), &mut listener);

    let response = consumer.handle_request(
        &request(ConsumerMethod::Dump, json!({})),
        Instant::now(),
        &mut listener,
    );

    let Response::Accepted { data: Some(dump) } = response else {
        panic!("expected accepted dump");
    };

    assert_eq!(dump["id"], "c1");
    assert_eq!(dump["kind"], "video");
    assert_eq!(dump["type"], "simple");
    assert_eq!(dump["paused"], false);
    assert_eq!(dump["producerPaused"], false);
    assert_eq!(dump["packetEventTypes"], "");
    assert_eq!(dump["supportedCodecPayloadTypes"], json!([101]));
    assert_eq!(dump["consumableRtpEncodings"][0]["ssrc"], 2222);
    assert_eq!(dump["rtpParameters"]["encodings"][0]["ssrc"], 1111);
    assert_eq!(dump["rtpStream"]["params"]["ssrc"], 1111);
    assert_eq!(dump["rtpStream"]["params"]["rtxSsrc"], 1112);
}

#[test]
fn get_stats_shape() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(notifier(), &mut listener);

    let mut packet = keyframe_packet(2222, 101, 10, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);

    let response = consumer.handle_request(
        &request(ConsumerMethod::GetStats, json!({})),
        now,
        &mut listener,
    );

    let Response::Accepted { data: Some(stats) } = response else {
        panic!("expected accepted stats");
    };

    let stats = stats.as_array().unwrap();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0]["type"], "outbound-rtp");
    assert_eq!(stats[0]["ssrc"], 1111);
    assert_eq!(stats[0]["packetCount"], 1);
    assert_eq!(stats[1]["type"], "inbound-rtp");
    assert_eq!(stats[1]["ssrc"], 2222);
    assert_eq!(stats[1]["score"], 9);
}

#[test]
fn enable_packet_event_filters_events() {
    let now = Instant::now();
    let notifier = notifier();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(notifier.clone(), &mut listener);

    let response = consumer.handle_request(
        &request(
            ConsumerMethod::EnablePacketEvent,
            json!({ "types": ["rtp", "garbage", "nack"] }),
        ),
        now,
        &mut listener,
    );
    assert!(response.is_accepted());

    // Clear the score notifications from setup.
    notifier.drain();

    // An rtp event fires on forward.
    let mut packet = keyframe_packet(2222, 101, 10, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);

    // A nack event fires on NACK receipt.
    let output_seq = listener.sent[0].sequence_number();
    let nack = Nack::new(1111.into(), &[output_seq]);
    consumer.receive_nack(&nack, now, &mut listener);

    // PLI/FIR events do not (not enabled).
    consumer.receive_key_frame_request(
        sfu_core::rtcp::KeyFrameRequestKind::Pli,
        1111.into(),
        now,
        &mut listener,
    );

    let events = notifier.drain();
    let packet_events: Vec<_> = events.iter().filter(|n| n.event == "packet").collect();

    let types: Vec<&str> = packet_events
        .iter()
        .map(|n| n.data.as_ref().unwrap()["type"].as_str().unwrap())
        .collect();

    // rtp (forward), nack (in), rtp (the retransmission) - but no pli.
    assert!(types.contains(&"rtp"));
    assert!(types.contains(&"nack"));
    assert!(!types.contains(&"pli"));
    assert!(!types.contains(&"fir"));

    // Directions are tagged.
    for event in &packet_events {
        let data = event.data.as_ref().unwrap();
        match data["type"].as_str().unwrap() {
            "rtp" => assert_eq!(data["direction"], "out"),
            "nack" | "pli" | "fir" => assert_eq!(data["direction"], "in"),
            other => panic!("unexpected packet event type {other}"),
        }
        assert!(data["timestamp"].is_u64());
    }
}

#[test]
fn enable_packet_event_missing_types_rejects() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(notifier(), &mut listener);

    let response = consumer.handle_request(
        &request(ConsumerMethod::EnablePacketEvent, json!({})),
        now,
        &mut listener,
    );

    let Response::Rejected { error } = response else {
        panic!("expected rejection");
    };
    assert!(matches!(error, RequestError::TypeError(_)));

    // State unchanged: no packet events fire.
    let notifier = notifier();
    let mut packet = keyframe_packet(2222, 101, 10, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    assert!(notifier.drain().is_empty());
}

#[test]
fn enable_packet_event_non_string_element_rejects() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(notifier(), &mut listener);

    let response = consumer.handle_request(
        &request(ConsumerMethod::EnablePacketEvent, json!({ "types": [1, 2] })),
        now,
        &mut listener,
    );

    assert!(!response.is_accepted());
}

#[test]
fn enable_packet_event_replaces_previous_set() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(notifier(), &mut listener);

    consumer.handle_request(
        &request(ConsumerMethod::EnablePacketEvent, json!({ "types": ["rtp"] })),
        now,
        &mut listener,
    );
    consumer.handle_request(
        &request(ConsumerMethod::EnablePacketEvent, json!({ "types": ["pli"] })),
        now,
        &mut listener,
    );

    let response = consumer.handle_request(
        &request(ConsumerMethod::Dump, json!({})),
        now,
        &mut listener,
    );
    let Response::Accepted { data: Some(dump) } = response else {
        panic!("expected dump");
    };
    assert_eq!(dump["packetEventTypes"], "pli");
}

#[test]
fn request_key_frame_accepted_and_propagated() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(notifier(), &mut listener);

    let before = listener.keyframe_requests.len();

    let response = consumer.handle_request(
        &request(ConsumerMethod::RequestKeyFrame, json!({})),
        now,
        &mut listener,
    );

    assert!(response.is_accepted());
    assert_eq!(listener.keyframe_requests.len(), before + 1);
}

#[test]
fn malformed_consumer_data_is_type_error() {
    let err = SimpleConsumer::new("bad", &json!({ "kind": "video" }), notifier()).unwrap_err();
    assert!(matches!(err, RequestError::TypeError(_)));

    // Zero SSRC in encodings.
    let mut data = video_consumer_data();
    data["rtpParameters"]["encodings"][0]["ssrc"] = json!(0);
    let err = SimpleConsumer::new("bad", &data, notifier()).unwrap_err();
    assert!(matches!(err, RequestError::TypeError(_)));

    // Two consumable encodings break the simple variant's contract.
    let mut data = video_consumer_data();
    data["consumableRtpEncodings"] = json!([{ "ssrc": 1 }, { "ssrc": 2 }]);
    let err = SimpleConsumer::new("bad", &data, notifier()).unwrap_err();
    assert!(matches!(err, RequestError::TypeError(_)));
}

#[test]
fn unknown_method_rejected_at_parse() {
    let err = Request::parse(&json!({
        "id": 1,
        "method": "consumer.unknownThing",
    }))
    .unwrap_err();

    assert!(matches!(err, RequestError::Error(_)));
}
