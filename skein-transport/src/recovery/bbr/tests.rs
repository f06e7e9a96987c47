// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::timer::{testing::MockTimer, Timer as _};
use skein_core::random;

const MSS: u32 = 1500;

fn new_bbr(timer: &MockTimer, srtt: Option<Duration>) -> Bbr {
    Bbr::new(
        timer,
        Box::new(random::testing::Generator::new(9)),
        MSS,
        srtt,
    )
}

/// Obtains the transmit slot, waits out pacing, and registers the packet
fn send_packet(bbr: &mut Bbr, timer: &MockTimer, seq: u64, size: u64) -> SentPacket {
    match bbr.request_transmit(timer.now()) {
        TransmitOutcome::Ready { departure_time } => timer.advance_to(departure_time),
        TransmitOutcome::Paused => panic!("transmit unexpectedly paused"),
    }
    bbr.sent(
        timer.now(),
        OutgoingPacket {
            sequence: seq,
            size,
        },
    )
}

fn ack_one(bbr: &mut Bbr, timer: &MockTimer, packet: SentPacket) {
    bbr.on_ack(
        timer.now(),
        &Ack {
            acked_packets: vec![packet],
            ..Default::default()
        },
    );
}

/// Runs send/ack rounds at a plateaued rate until the pipe fills and BBR
/// lands in ProbeBW
fn drive_to_probe_bw(bbr: &mut Bbr, timer: &MockTimer, seq: &mut u64) {
    for _ in 0..8 {
        let packet = send_packet(bbr, timer, *seq, 1500);
        *seq += 1;
        timer.advance_by(Duration::from_millis(10));
        ack_one(bbr, timer, packet);
        if bbr.is_probing_bw() {
            return;
        }
    }
    panic!("BBR never left startup: {bbr:?}");
}

#[test]
fn initial_state() {
    let timer = MockTimer::new();
    let bbr = new_bbr(&timer, None);
    assert!(bbr.is_startup());
    assert_eq!(bbr.cwnd_bytes(), 4 * MSS as u64);
    assert_eq!(bbr.bytes_in_flight(), 0);
    assert_eq!(bbr.packets_in_flight(), 0);
    assert_eq!(bbr.rtt(), None);
    assert_eq!(bbr.bottleneck_bandwidth(), Bandwidth::ZERO);
    // pacing floor before any sample: 3 MSS per millisecond
    assert_eq!(
        bbr.pacing_rate(),
        Bandwidth::bytes_per_time(3 * MSS as u64, Duration::from_millis(1))
    );
}

#[test]
fn inflight_without_rtprop_sample() {
    let timer = MockTimer::new();
    let bbr = new_bbr(&timer, None);
    assert_eq!(bbr.inflight(Gain::UNIT), 3 * MSS as u64);
    assert_eq!(bbr.inflight(Gain::HIGH), 3 * MSS as u64);
}

#[test]
fn reservation_accounting() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, None);

    let outcome = bbr.request_transmit(timer.now());
    assert!(matches!(outcome, TransmitOutcome::Ready { .. }));
    // one MSS is reserved until the real length is known
    assert_eq!(bbr.bytes_in_flight(), MSS as u64);
    assert_eq!(bbr.packets_in_flight(), 1);

    let packet = bbr.sent(
        timer.now(),
        OutgoingPacket {
            sequence: 1,
            size: 100,
        },
    );
    assert_eq!(bbr.bytes_in_flight(), 100);
    assert_eq!(bbr.packets_in_flight(), 1);
    assert_eq!(packet.send_time, timer.now());
    assert!(!packet.is_app_limited);
    assert!(!packet.in_fast_recovery);
}

#[test]
fn sub_microsecond_intervals_are_discarded() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, None);
    let packet = send_packet(&mut bbr, &timer, 1, 1000);
    // acked in the same instant: no usable rate or rtt sample
    ack_one(&mut bbr, &timer, packet);
    assert_eq!(bbr.bottleneck_bandwidth(), Bandwidth::ZERO);
    assert_eq!(bbr.rtt(), None);
}

#[test]
fn pauses_at_cwnd_and_resumes_on_ack() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, None);

    let mut sent = Vec::new();
    for seq in 1..=4 {
        sent.push(send_packet(&mut bbr, &timer, seq, 1500));
    }
    assert_eq!(bbr.bytes_in_flight(), 6000);

    assert_eq!(bbr.request_transmit(timer.now()), TransmitOutcome::Paused);
    assert_eq!(
        bbr.bytes_in_flight(),
        6000,
        "a paused request reserves nothing"
    );
    assert!(bbr.resume_paused(timer.now()).is_none(), "still no capacity");

    timer.advance_by(Duration::from_millis(50));
    ack_one(&mut bbr, &timer, sent[0]);
    assert_eq!(bbr.bytes_in_flight(), 4500);
    assert!(bbr.cwnd_bytes() > 6000, "the window grew from the sample");

    let departure = bbr.resume_paused(timer.now()).expect("capacity available");
    assert_eq!(bbr.bytes_in_flight(), 6000);
    bbr.sent(
        timer.now().max(departure),
        OutgoingPacket {
            sequence: 5,
            size: 1500,
        },
    );
    assert_eq!(bbr.bytes_in_flight(), 6000);
    assert_eq!(bbr.packets_in_flight(), 4);
}

#[test]
fn cancellation_advances_the_send_time() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, None);

    match bbr.request_transmit(timer.now()) {
        TransmitOutcome::Ready { departure_time } => assert_eq!(departure_time, timer.now()),
        TransmitOutcome::Paused => panic!("paused"),
    }
    bbr.cancel_request(timer.now());
    assert_eq!(bbr.bytes_in_flight(), 0);
    assert_eq!(bbr.packets_in_flight(), 0);

    // the cancel paid its pacing debt: the next send waits
    match bbr.request_transmit(timer.now()) {
        TransmitOutcome::Ready { departure_time } => {
            assert!(departure_time >= timer.now() + Duration::from_millis(1));
        }
        TransmitOutcome::Paused => panic!("paused"),
    }
}

#[test]
fn consecutive_sends_respect_pacing() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, None);
    let mut last_departure = None;
    for seq in 1..=3 {
        let departure = match bbr.request_transmit(timer.now()) {
            TransmitOutcome::Ready { departure_time } => departure_time,
            TransmitOutcome::Paused => panic!("paused"),
        };
        if let Some(last) = last_departure {
            let gap = departure.saturating_duration_since(last);
            assert!(
                gap >= bbr.pacing_rate().send_time_for_bytes(1500),
                "sends must be spaced by the pacing interval"
            );
        }
        last_departure = Some(departure);
        timer.advance_to(departure);
        bbr.sent(
            timer.now(),
            OutgoingPacket {
                sequence: seq,
                size: 1500,
            },
        );
    }
}

#[test]
fn nack_enters_fast_recovery_and_ack_exits() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, Some(Duration::from_millis(10)));
    let p1 = send_packet(&mut bbr, &timer, 1, 1000);
    let p2 = send_packet(&mut bbr, &timer, 2, 1000);
    timer.advance_by(Duration::from_millis(20));

    bbr.on_ack(
        timer.now(),
        &Ack {
            acked_packets: vec![p2],
            nacked_packets: vec![p1],
        },
    );
    assert!(bbr.in_fast_recovery());
    assert_eq!(bbr.bytes_in_flight(), 0);

    // packets sent inside recovery carry the marker
    let p3 = send_packet(&mut bbr, &timer, 3, 1000);
    assert!(p3.in_fast_recovery);
    timer.advance_by(Duration::from_millis(20));
    ack_one(&mut bbr, &timer, p3);
    assert!(!bbr.in_fast_recovery(), "an ack past the recovery point exits");
}

#[test]
fn recovery_cwnd_drops_by_nacked_bytes_with_mss_floor() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, Some(Duration::from_millis(10)));
    let mut packets = Vec::new();
    for seq in 1..=4 {
        packets.push(send_packet(&mut bbr, &timer, seq, 1500));
    }
    timer.advance_by(Duration::from_millis(20));

    // first nack enters recovery
    bbr.on_ack(
        timer.now(),
        &Ack {
            acked_packets: vec![packets[3]],
            nacked_packets: vec![packets[0]],
        },
    );
    assert!(bbr.in_fast_recovery());
    let cwnd = bbr.cwnd_bytes();

    // further nacks shrink the window by the nacked bytes
    timer.advance_by(Duration::from_millis(5));
    bbr.on_ack(
        timer.now(),
        &Ack {
            acked_packets: vec![],
            nacked_packets: vec![packets[1], packets[2]],
        },
    );
    let expected = cwnd.saturating_sub(3000).max(MSS as u64);
    assert_eq!(bbr.cwnd_bytes(), expected);
    assert!(bbr.cwnd_bytes() >= MSS as u64);
}

#[test]
fn startup_fills_pipe_then_drains_into_probe_bw() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, Some(Duration::from_millis(10)));
    let mut seq = 1;
    drive_to_probe_bw(&mut bbr, &timer, &mut seq);
    assert!(bbr.filled_pipe);
    assert!(bbr.is_probing_bw());
    assert!(!bbr.is_startup());
    assert!(bbr.bottleneck_bandwidth() > Bandwidth::ZERO);
}

#[test]
fn unit_gain_phase_advances_after_a_full_round() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, Some(Duration::from_millis(10)));
    let mut seq = 1;
    drive_to_probe_bw(&mut bbr, &timer, &mut seq);

    bbr.cycle_index = 2;
    bbr.pacing_gain = Gain::UNIT;
    bbr.cycle_stamp = timer.now();

    let packet = send_packet(&mut bbr, &timer, seq, 1500);
    timer.advance_by(Duration::from_millis(30));
    ack_one(&mut bbr, &timer, packet);
    assert_eq!(bbr.cycle_index, 3);
    assert_eq!(bbr.pacing_gain, PROBE_BW_GAIN_CYCLE[3]);
}

#[test]
fn drain_phase_exits_early_when_inflight_is_level() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, Some(Duration::from_millis(10)));
    let mut seq = 1;
    drive_to_probe_bw(&mut bbr, &timer, &mut seq);

    bbr.cycle_index = 1;
    bbr.pacing_gain = Gain::new(3, 4);
    bbr.cycle_stamp = timer.now();

    let packet = send_packet(&mut bbr, &timer, seq, 1500);
    // well under a full round, but nothing is queued in the pipe
    timer.advance_by(Duration::from_millis(2));
    ack_one(&mut bbr, &timer, packet);
    assert_eq!(bbr.cycle_index, 2);
}

#[test]
fn probing_phase_holds_until_loss_or_filled_inflight() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, Some(Duration::from_millis(10)));
    let mut seq = 1;
    drive_to_probe_bw(&mut bbr, &timer, &mut seq);

    bbr.cycle_index = 0;
    bbr.pacing_gain = Gain::new(5, 4);
    bbr.cycle_stamp = timer.now();

    let packet = send_packet(&mut bbr, &timer, seq, 1500);
    seq += 1;
    timer.advance_by(Duration::from_millis(30));
    ack_one(&mut bbr, &timer, packet);
    assert_eq!(bbr.cycle_index, 0, "no loss and inflight below target");

    let lost = send_packet(&mut bbr, &timer, seq, 1500);
    let acked = send_packet(&mut bbr, &timer, seq + 1, 1500);
    timer.advance_by(Duration::from_millis(30));
    bbr.on_ack(
        timer.now(),
        &Ack {
            acked_packets: vec![acked],
            nacked_packets: vec![lost],
        },
    );
    assert_eq!(bbr.cycle_index, 1, "loss releases the probing phase");
}

#[test]
fn probe_rtt_after_rtprop_expiry() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, Some(Duration::from_millis(10)));
    let mut seq = 1;
    drive_to_probe_bw(&mut bbr, &timer, &mut seq);

    // run for over ten seconds without ever beating the propagation sample
    let deadline = Timestamp::EPOCH + Duration::from_secs(15);
    while !bbr.is_probing_rtt() && timer.now() < deadline {
        let packet = send_packet(&mut bbr, &timer, seq, 1500);
        seq += 1;
        timer.advance_by(Duration::from_millis(20));
        ack_one(&mut bbr, &timer, packet);
    }
    assert!(bbr.is_probing_rtt(), "rtprop expiry forces a probe");
    assert!(bbr.cwnd_bytes() <= 4 * MSS as u64);
    let probe_entry = timer.now();

    // a round below the pipe floor plus the probe duration releases it
    while bbr.is_probing_rtt() && timer.now() < probe_entry + Duration::from_secs(2) {
        let packet = send_packet(&mut bbr, &timer, seq, 1500);
        seq += 1;
        timer.advance_by(Duration::from_millis(120));
        ack_one(&mut bbr, &timer, packet);
    }
    assert!(!bbr.is_probing_rtt());
    assert!(bbr.is_probing_bw(), "filled pipe resumes probing bandwidth");
    assert!(
        timer.now() >= probe_entry + PROBE_RTT_DURATION,
        "the probe held for its full duration"
    );
    assert!(bbr.cwnd_bytes() > 4 * MSS as u64, "the window was restored");
}

#[test]
fn send_quantum_bands() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, None);
    bbr.pacing_rate = Some(Bandwidth::from_kilobits_per_second(1000));
    assert_eq!(bbr.send_quantum(), MSS as u64);
    bbr.pacing_rate = Some(Bandwidth::from_kilobits_per_second(12_000));
    assert_eq!(bbr.send_quantum(), 2 * MSS as u64);
    bbr.pacing_rate = Some(Bandwidth::from_kilobits_per_second(100_000));
    assert_eq!(bbr.send_quantum(), 12_500);
    bbr.pacing_rate = Some(Bandwidth::from_kilobits_per_second(1_000_000));
    assert_eq!(bbr.send_quantum(), 65_536);
}

#[test]
#[should_panic(expected = "sequence numbers must increase")]
fn sequences_must_increase() {
    let timer = MockTimer::new();
    let mut bbr = new_bbr(&timer, None);
    send_packet(&mut bbr, &timer, 5, 100);
    send_packet(&mut bbr, &timer, 5, 100);
}
