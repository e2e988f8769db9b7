//! Resync points (keyframe gating) and pause/resume behavior.

mod common;

use std::time::Instant;

use common::*;
use serde_json::json;
use sfu_core::channel::{ConsumerMethod, Request};
use sfu_core::consumer::{Consumer, ProducerStream, SimpleConsumer};

fn video_consumer(notifier: sfu_core::channel::Notifier) -> SimpleConsumer {
    SimpleConsumer::new("c-video", &video_consumer_data(), notifier).unwrap()
}

fn connected_video(listener: &mut TestListener) -> SimpleConsumer {
    let mut consumer = video_consumer(notifier());
    consumer.transport_connected(listener);
    consumer.producer_rtp_stream(
        ProducerStream {
            ssrc: 2222.into(),
            score: 10,
        },
        2222.into(),
    );
    consumer
}

fn request(method: ConsumerMethod) -> Request {
    Request::new(1, "c-video", method, json!({}))
}

#[test]
fn keyframe_gates_resync_after_reconnect() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(&mut listener);

    // Initial sync needs a keyframe too (transport connect set
    // sync_required).
    let mut packet = media_packet(2222, 101, 1000, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    assert!(listener.sent.is_empty());

    let mut packet = keyframe_packet(2222, 101, 1001, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    assert_eq!(listener.sent.len(), 1);

    // Reconnect forces a new sync point.
    consumer.transport_disconnected();
    consumer.transport_connected(&mut listener);

    let mut packet = media_packet(2222, 101, 1002, 93_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    assert_eq!(listener.sent.len(), 1, "non-keyframe dropped after reconnect");

    let mut packet = keyframe_packet(2222, 101, 1003, 96_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    assert_eq!(listener.sent.len(), 2);

    let mut packet = media_packet(2222, 101, 1004, 96_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    assert_eq!(listener.sent.len(), 3);

    // Monotonic across the resync.
    let seqs: Vec<u16> = listener.sent.iter().map(|p| p.sequence_number()).collect();
    assert_eq!(seqs[1], seqs[0].wrapping_add(1));
    assert_eq!(seqs[2], seqs[1].wrapping_add(1));
}

#[test]
fn reconnect_requests_keyframe() {
    let mut listener = TestListener::default();
    let mut consumer = connected_video(&mut listener);

    let before = listener.keyframe_requests.len();

    consumer.transport_disconnected();
    consumer.transport_connected(&mut listener);

    assert_eq!(listener.keyframe_requests.len(), before + 1);
    // Keyframes are requested on the consumable (producer side) SSRC.
    assert_eq!(*listener.keyframe_requests.last().unwrap(), 2222u32.into());
}

#[test]
fn pause_suppresses_traffic() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(&mut listener);

    // Get one packet flowing first.
    let mut packet = keyframe_packet(2222, 101, 1000, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    assert_eq!(listener.sent.len(), 1);

    let response = consumer.handle_request(&request(ConsumerMethod::Pause), now, &mut listener);
    assert!(response.is_accepted());

    // The send stream froze.
    assert!(consumer.rtp_stream().is_paused());

    for seq in 0..10u16 {
        let mut packet = media_packet(2222, 101, 1001 + seq, 90_000);
        consumer.send_rtp_packet(&mut packet, now, &mut listener);
    }
    assert_eq!(listener.sent.len(), 1, "no emissions while paused");

    // Pausing again is accepted without re-running the pause hook.
    let response = consumer.handle_request(&request(ConsumerMethod::Pause), now, &mut listener);
    assert!(response.is_accepted());
}

#[test]
fn resume_is_idempotent_and_requests_keyframe() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(&mut listener);

    consumer.handle_request(&request(ConsumerMethod::Pause), now, &mut listener);

    let requests_before = listener.keyframe_requests.len();

    let response = consumer.handle_request(&request(ConsumerMethod::Resume), now, &mut listener);
    assert!(response.is_accepted());
    assert_eq!(listener.keyframe_requests.len(), requests_before + 1);

    // Resuming while already resumed has no side effects beyond the
    // first.
    let response = consumer.handle_request(&request(ConsumerMethod::Resume), now, &mut listener);
    assert!(response.is_accepted());
    assert_eq!(listener.keyframe_requests.len(), requests_before + 1);
}

#[test]
fn resume_waits_for_keyframe() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(&mut listener);

    let mut packet = keyframe_packet(2222, 101, 1000, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);

    consumer.handle_request(&request(ConsumerMethod::Pause), now, &mut listener);
    consumer.handle_request(&request(ConsumerMethod::Resume), now, &mut listener);

    let mut packet = media_packet(2222, 101, 1001, 93_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    assert_eq!(listener.sent.len(), 1, "non-keyframe dropped after resume");

    let mut packet = keyframe_packet(2222, 101, 1002, 96_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    assert_eq!(listener.sent.len(), 2);
}

#[test]
fn audio_resync_needs_no_keyframe() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = SimpleConsumer::new("c-audio", &audio_consumer_data(), notifier()).unwrap();

    consumer.transport_connected(&mut listener);
    consumer.producer_rtp_stream(
        ProducerStream {
            ssrc: 2222.into(),
            score: 10,
        },
        2222.into(),
    );

    // Audio has no keyframe notion; the first packet after sync flows.
    let mut packet = media_packet(2222, 100, 7, 48_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    assert_eq!(listener.sent.len(), 1);

    // And no keyframe was ever requested upward.
    assert!(listener.keyframe_requests.is_empty());
}
