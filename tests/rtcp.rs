//! RTCP synthesis cadence, NACK/RTX round trip, receiver report intake.

mod common;

use std::time::{Duration, Instant};

use common::*;
use sfu_core::consumer::{Consumer, ProducerStream, SimpleConsumer};
use sfu_core::rtcp::{CompoundPacket, Nack, ReceptionReport};

fn connected_audio(
    notifier: sfu_core::channel::Notifier,
    listener: &mut TestListener,
) -> SimpleConsumer {
    let mut consumer = SimpleConsumer::new("c1", &audio_consumer_data(), notifier).unwrap();
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

fn connected_video(
    notifier: sfu_core::channel::Notifier,
    listener: &mut TestListener,
) -> SimpleConsumer {
    let mut consumer = SimpleConsumer::new("c1", &video_consumer_data(), notifier).unwrap();
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

#[test]
fn rtcp_interval_gating() {
    let t0 = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_audio(notifier(), &mut listener);

    // A sender report requires sent traffic.
    let mut packet = media_packet(2222, 100, 1, 48_000);
    consumer.send_rtp_packet(&mut packet, t0, &mut listener);

    let at = |ms: u64| t0 + Duration::from_millis(ms);

    // Audio interval is 5000ms; with the 1.15 jitter allowance reports
    // become due at ceil(5000/1.15) ~ 4348ms.
    let mut compound = CompoundPacket::new();
    consumer.get_rtcp(&mut compound, 1111.into(), t0);
    assert_eq!(compound.sender_report_count(), 1, "t=0 emits");

    consumer.get_rtcp(&mut compound, 1111.into(), at(1000));
    assert_eq!(compound.sender_report_count(), 1, "t=1000 skipped");

    consumer.get_rtcp(&mut compound, 1111.into(), at(4000));
    assert_eq!(compound.sender_report_count(), 1, "t=4000 skipped");

    consumer.get_rtcp(&mut compound, 1111.into(), at(4500));
    assert_eq!(compound.sender_report_count(), 2, "t=4500 emits");

    // Every sender report travels with an SDES chunk.
    assert_eq!(compound.sdes_chunk_count(), 2);
}

#[test]
fn sender_report_describes_outgoing_stream() {
    let t0 = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_audio(notifier(), &mut listener);

    // Nothing sent yet: no report, and the interval clock does not
    // advance.
    let mut compound = CompoundPacket::new();
    consumer.get_rtcp(&mut compound, 1111.into(), t0);
    assert_eq!(compound.sender_report_count(), 0);

    for seq in 0..5u16 {
        let mut packet = media_packet(2222, 100, seq, 48_000);
        consumer.send_rtp_packet(&mut packet, t0, &mut listener);
    }

    let mut compound = CompoundPacket::new();
    consumer.get_rtcp(&mut compound, 1111.into(), t0 + Duration::from_millis(10));
    assert_eq!(compound.sender_report_count(), 1);

    let sr = &compound.sender_reports()[0];
    assert_eq!(*sr.ssrc, 1111);
    assert_eq!(sr.packet_count, 5);
    assert_eq!(sr.octet_count, 600);
    assert!(sr.ntp_time > 0);

    // The compound serializes into SR + SDES.
    let bytes = compound.serialize();
    assert!(!bytes.is_empty());
    assert_eq!(bytes[1], 200);
}

#[test]
fn nack_round_trip_uses_rtx() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(notifier(), &mut listener);

    let mut packet = keyframe_packet(2222, 101, 500, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    let mut packet = media_packet(2222, 101, 501, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);

    assert_eq!(listener.sent.len(), 2);
    let lost_seq = listener.sent[1].sequence_number();
    let lost_payload = listener.sent[1].payload().to_vec();

    let nack = Nack::new(1111.into(), &[lost_seq]);
    consumer.receive_nack(&nack, now, &mut listener);

    assert_eq!(listener.retransmitted.len(), 1);
    let rtx = &listener.retransmitted[0];

    // RTX identity per RFC 4588.
    assert_eq!(*rtx.ssrc(), 1112);
    assert_eq!(*rtx.payload_type(), 102);

    // OSN prefix followed by the original payload.
    let osn = u16::from_be_bytes([rtx.payload()[0], rtx.payload()[1]]);
    assert_eq!(osn, lost_seq);
    assert_eq!(&rtx.payload()[2..], &lost_payload[..]);
}

#[test]
fn nack_ignored_while_inactive() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(notifier(), &mut listener);

    let mut packet = keyframe_packet(2222, 101, 500, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    let seq = listener.sent[0].sequence_number();

    consumer.transport_disconnected();

    let nack = Nack::new(1111.into(), &[seq]);
    consumer.receive_nack(&nack, now, &mut listener);
    assert!(listener.retransmitted.is_empty());
}

#[test]
fn receiver_report_updates_stats_and_emits_score() {
    let now = Instant::now();
    let notifier = notifier();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(notifier.clone(), &mut listener);

    let mut packet = keyframe_packet(2222, 101, 0, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);
    for seq in 1..10u16 {
        let mut packet = media_packet(2222, 101, seq, 90_000);
        consumer.send_rtp_packet(&mut packet, now, &mut listener);
    }

    notifier.drain();

    let report = ReceptionReport {
        ssrc: 1111.into(),
        fraction_lost: 26,
        packets_lost: 1,
        max_seq: 10,
        jitter: 0,
        last_sr_time: 0,
        last_sr_delay: 0,
    };

    consumer.receive_rtcp_receiver_report(&report, now);

    // 9/10 delivered rounds to score 9; the change surfaced as a score
    // notification.
    let events = notifier.drain();
    let score_event = events.iter().find(|n| n.event == "score").unwrap();
    let data = score_event.data.as_ref().unwrap();
    assert_eq!(data["score"], 9);
    assert_eq!(data["producerScore"], 10);

    // Fraction lost feeds the worst-lost aggregation.
    let mut worst = 10u8;
    consumer.need_worst_remote_fraction_lost(2222.into(), &mut worst);
    assert_eq!(worst, 26);
}

#[test]
fn transmission_rate_reflects_traffic() {
    let now = Instant::now();
    let mut listener = TestListener::default();
    let mut consumer = connected_video(notifier(), &mut listener);

    assert_eq!(consumer.get_transmission_rate(now), 0);

    let mut packet = keyframe_packet(2222, 101, 0, 90_000);
    consumer.send_rtp_packet(&mut packet, now, &mut listener);

    assert!(consumer.get_transmission_rate(now) > 0);

    // Inactive consumers report zero.
    consumer.transport_disconnected();
    assert_eq!(consumer.get_transmission_rate(now), 0);
}
