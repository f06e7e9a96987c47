// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A congestion controller implementing "Bottleneck Bandwidth and Round-trip
//! propagation time" as described in
//! <https://datatracker.ietf.org/doc/draft-cardwell-iccrg-bbr-congestion-control/>.
//!
//! The model side estimates the bottleneck bandwidth (windowed max of
//! delivery-rate samples over ten round trips) and the round-trip
//! propagation time (minimum RTT over ten seconds), and walks the
//! Startup -> Drain -> ProbeBW <-> ProbeRTT state machine. The control side
//! turns those estimates into a pacing rate and congestion window.
//!
//! The transmit side hands out at most one reservation at a time: a request
//! is readied immediately when the window has room (reserving one MSS until
//! the real packet size is known) or parked until an ack frees capacity.

use crate::timer::Timer;
use core::{cmp::max, time::Duration};
use skein_core::{
    bandwidth::{Bandwidth, Gain},
    random,
    time::Timestamp,
    windowed_filter::WindowedMaxFilter,
};

/// Smallest congestion window BBR targets, in packets
const MIN_PIPE_CWND_SEGMENTS: u64 = 4;
/// How long a round-trip propagation sample stays fresh
const RTPROP_FILTER_LENGTH: Duration = Duration::from_secs(10);
/// How long ProbeRTT holds the window at its floor
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);
/// Delivery-rate samples over a shorter interval are noise
const MIN_RTT: Duration = Duration::from_micros(1);
/// Rounds the bottleneck estimate must plateau before the pipe is full
const FULL_BW_COUNT: u8 = 3;
/// Bottleneck bandwidth filter window, in round trips
const BTLBW_FILTER_LENGTH: u64 = 10;

const PROBE_BW_GAIN_CYCLE: [Gain; 8] = [
    Gain::new(5, 4),
    Gain::new(3, 4),
    Gain::UNIT,
    Gain::UNIT,
    Gain::UNIT,
    Gain::UNIT,
    Gain::UNIT,
    Gain::UNIT,
];

/// What the caller wants to put on the wire
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutgoingPacket {
    pub sequence: u64,
    pub size: u64,
}

/// Snapshot of the delivery model taken as a packet goes out, echoed back
/// with the ack or nack so a rate sample can be formed.
#[derive(Clone, Copy, Debug)]
pub struct SentPacket {
    pub outgoing: OutgoingPacket,
    pub delivered_bytes_at_send: u64,
    pub in_fast_recovery: bool,
    pub is_app_limited: bool,
    pub send_time: Timestamp,
    pub delivered_time_at_send: Timestamp,
}

/// One batch of ack/nack feedback, packets in ascending sequence order
#[derive(Clone, Debug, Default)]
pub struct Ack {
    pub acked_packets: Vec<SentPacket>,
    pub nacked_packets: Vec<SentPacket>,
}

impl Ack {
    pub fn is_empty(&self) -> bool {
        self.acked_packets.is_empty() && self.nacked_packets.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Recovery {
    None,
    Fast,
}

/// The single transmit-reservation slot
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Reservation {
    Idle,
    /// Waiting for the window to open
    Paused,
    /// Holding one MSS of `bytes_in_flight` until `sent` or cancellation
    Readied { was_paused: bool },
}

/// Outcome of a transmit request
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransmitOutcome {
    /// Transmit no earlier than `departure_time`
    Ready { departure_time: Timestamp },
    /// The window is full; the request readies when an ack frees capacity
    Paused,
}

struct RateSample {
    delivery_rate: Bandwidth,
    rtt: Duration,
    is_app_limited: bool,
}

fn sum_bytes(packets: &[SentPacket]) -> u64 {
    packets.iter().map(|p| p.outgoing.size).sum()
}

pub struct Bbr {
    mss: u32,
    random: Box<dyn random::Generator>,

    state: State,
    recovery: Recovery,
    pacing_gain: Gain,
    cwnd_gain: Gain,

    rtprop: Option<Duration>,
    rtprop_stamp: Timestamp,
    rtprop_expired: bool,
    bottleneck_bandwidth_filter: WindowedMaxFilter<u64, Bandwidth, u64>,

    cwnd_bytes: u64,
    target_cwnd_bytes: u64,
    prior_cwnd_bytes: u64,
    pacing_rate: Option<Bandwidth>,

    packets_in_flight: u64,
    bytes_in_flight: u64,

    delivered_bytes: u64,
    delivered_seq: u64,
    delivered_time: Timestamp,
    app_limited_seq: u64,
    last_sample_is_app_limited: bool,

    round_count: u64,
    next_round_delivered_bytes: u64,
    round_start: bool,

    filled_pipe: bool,
    full_bw: Bandwidth,
    full_bw_count: u8,

    cycle_index: u8,
    cycle_stamp: Timestamp,

    packet_conservation: bool,
    idle_start: bool,
    probe_rtt_round_done: bool,
    probe_rtt_done_stamp: Option<Timestamp>,

    last_sent_packet: u64,
    exit_recovery_at_seq: u64,
    last_send_time: Timestamp,
    prior_inflight: u64,

    reservation: Reservation,
}

impl Bbr {
    pub fn new(
        timer: &dyn Timer,
        random: Box<dyn random::Generator>,
        mss: u32,
        srtt: Option<Duration>,
    ) -> Self {
        let mut bbr = Self {
            mss,
            random,
            state: State::Startup,
            recovery: Recovery::None,
            pacing_gain: Gain::HIGH,
            cwnd_gain: Gain::HIGH,
            rtprop: srtt,
            rtprop_stamp: timer.now(),
            rtprop_expired: false,
            bottleneck_bandwidth_filter: WindowedMaxFilter::new(BTLBW_FILTER_LENGTH),
            cwnd_bytes: MIN_PIPE_CWND_SEGMENTS * mss as u64,
            target_cwnd_bytes: 0,
            prior_cwnd_bytes: 0,
            pacing_rate: None,
            packets_in_flight: 0,
            bytes_in_flight: 0,
            delivered_bytes: 0,
            delivered_seq: 0,
            delivered_time: Timestamp::EPOCH,
            app_limited_seq: 0,
            last_sample_is_app_limited: false,
            round_count: 0,
            next_round_delivered_bytes: 0,
            round_start: false,
            filled_pipe: false,
            full_bw: Bandwidth::ZERO,
            full_bw_count: 0,
            cycle_index: 0,
            cycle_stamp: Timestamp::EPOCH,
            packet_conservation: false,
            idle_start: false,
            probe_rtt_round_done: false,
            probe_rtt_done_stamp: None,
            last_sent_packet: 0,
            exit_recovery_at_seq: 0,
            last_send_time: Timestamp::EPOCH,
            prior_inflight: 0,
            reservation: Reservation::Idle,
        };
        bbr.update_target_cwnd();
        bbr.validate_state();
        bbr
    }

    pub fn mss(&self) -> u32 {
        self.mss
    }

    /// The current round-trip propagation estimate, `None` until a sample
    /// lands
    pub fn rtt(&self) -> Option<Duration> {
        self.rtprop
    }

    pub fn bottleneck_bandwidth(&self) -> Bandwidth {
        self.bottleneck_bandwidth_filter
            .best_estimate()
            .unwrap_or(Bandwidth::ZERO)
    }

    pub fn cwnd_bytes(&self) -> u64 {
        self.cwnd_bytes
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn packets_in_flight(&self) -> u64 {
        self.packets_in_flight
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.recovery == Recovery::Fast
    }

    pub fn is_startup(&self) -> bool {
        self.state == State::Startup
    }

    pub fn is_drain(&self) -> bool {
        self.state == State::Drain
    }

    pub fn is_probing_bw(&self) -> bool {
        self.state == State::ProbeBw
    }

    pub fn is_probing_rtt(&self) -> bool {
        self.state == State::ProbeRtt
    }

    fn validate_state(&self) {
        assert!(self.cwnd_bytes != 0, "congestion window collapsed to zero");
    }

    //
    // Transmit reservation protocol
    //

    /// Requests the single transmit slot. At most one request may be
    /// outstanding.
    pub fn request_transmit(&mut self, now: Timestamp) -> TransmitOutcome {
        self.validate_state();
        assert_eq!(
            self.reservation,
            Reservation::Idle,
            "transmit request already outstanding"
        );
        if self.bytes_in_flight >= self.cwnd_bytes {
            tracing::debug!(
                bytes_in_flight = self.bytes_in_flight,
                cwnd = self.cwnd_bytes,
                "transmit paused"
            );
            self.reservation = Reservation::Paused;
            TransmitOutcome::Paused
        } else {
            TransmitOutcome::Ready {
                departure_time: self.ready(now, false),
            }
        }
    }

    /// Readies a paused request once an ack or cancellation has opened the
    /// window
    pub fn resume_paused(&mut self, now: Timestamp) -> Option<Timestamp> {
        if self.reservation == Reservation::Paused && self.bytes_in_flight < self.cwnd_bytes {
            Some(self.ready(now, true))
        } else {
            None
        }
    }

    fn ready(&mut self, now: Timestamp, was_paused: bool) -> Timestamp {
        self.handle_restart_from_idle();
        self.packets_in_flight += 1;
        // Reserve one packet's worth of sending until the actual length is
        // known in `sent`. This keeps a burst of requests from flooding the
        // layers below.
        self.bytes_in_flight += self.mss as u64;
        self.reservation = Reservation::Readied { was_paused };
        max(now, self.last_send_time)
    }

    /// Consumes the readied reservation with the real packet, returning the
    /// model snapshot to remember alongside it
    pub fn sent(&mut self, now: Timestamp, packet: OutgoingPacket) -> SentPacket {
        self.validate_state();
        let was_paused = match self.reservation {
            Reservation::Readied { was_paused } => was_paused,
            _ => panic!("sent without a readied transmit reservation"),
        };
        self.reservation = Reservation::Idle;

        if packet.sequence == 1 {
            self.delivered_time = now;
        }

        // Swap the MSS reservation for the actual length
        assert!(self.bytes_in_flight >= self.mss as u64, "bytes in flight underflow");
        self.bytes_in_flight -= self.mss as u64;
        self.bytes_in_flight += packet.size;

        // Cancelled reservations never assign a sequence, so the space is
        // strictly increasing but not dense.
        assert!(
            packet.sequence > self.last_sent_packet,
            "sequence numbers must increase"
        );
        self.last_sent_packet = packet.sequence;

        let mut send_time = self.last_send_time
            + max(
                Duration::from_micros(1),
                self.pacing_rate().send_time_for_bytes(packet.size),
            );
        if send_time < now {
            send_time = now;
        } else if was_paused {
            self.app_limited_seq = self.delivered_seq + max(self.packets_in_flight, 1);
        }
        self.last_send_time = send_time;

        tracing::trace!(
            sequence = packet.sequence,
            size = packet.size,
            bytes_in_flight = self.bytes_in_flight,
            next_send_time = %self.last_send_time,
            "sent"
        );

        self.validate_state();

        SentPacket {
            outgoing: packet,
            delivered_bytes_at_send: self.delivered_bytes,
            in_fast_recovery: self.recovery == Recovery::Fast,
            is_app_limited: self.app_limited_seq != 0,
            send_time: now,
            delivered_time_at_send: self.delivered_time,
        }
    }

    /// Abandons the outstanding request, if any
    pub fn cancel_request(&mut self, now: Timestamp) {
        let reservation = core::mem::replace(&mut self.reservation, Reservation::Idle);
        if let Reservation::Readied { .. } = reservation {
            assert!(self.bytes_in_flight >= self.mss as u64, "bytes in flight underflow");
            self.bytes_in_flight -= self.mss as u64;
            self.packets_in_flight -= 1;
        }
        if reservation == Reservation::Idle {
            return;
        }
        // Always move the send time forward: a cancel that does not pay its
        // pacing debt can recursively re-ready the next queued request
        // forever.
        self.last_send_time = max(
            now + Duration::from_millis(1),
            self.last_send_time + self.pacing_rate().send_time_for_bytes(self.mss as u64),
        );
    }

    fn handle_restart_from_idle(&mut self) {
        if self.packets_in_flight == 0 && self.app_limited_seq != 0 {
            self.idle_start = true;
            if self.state == State::ProbeBw {
                self.set_pacing_rate_with_gain(Gain::UNIT);
            }
        }
    }

    //
    // Per-ack model and control updates
    //

    pub fn on_ack(&mut self, now: Timestamp, ack: &Ack) {
        self.validate_state();
        self.prior_inflight = self.inflight(Gain::UNIT);

        let acked_count = ack.acked_packets.len() as u64;
        let nacked_count = ack.nacked_packets.len() as u64;
        tracing::debug!(
            acked = acked_count,
            nacked = nacked_count,
            packets_in_flight = self.packets_in_flight,
            bytes_in_flight = self.bytes_in_flight,
            "ack"
        );
        assert!(
            self.packets_in_flight >= acked_count + nacked_count,
            "packets in flight underflow"
        );
        self.packets_in_flight -= acked_count + nacked_count;
        let bytes = sum_bytes(&ack.acked_packets) + sum_bytes(&ack.nacked_packets);
        assert!(self.bytes_in_flight >= bytes, "bytes in flight underflow");
        self.bytes_in_flight -= bytes;

        self.update_model_and_state(now, ack);
        self.update_control_parameters(ack);

        tracing::debug!(
            packets_in_flight = self.packets_in_flight,
            bytes_in_flight = self.bytes_in_flight,
            cwnd = self.cwnd_bytes,
            state = ?self.state,
            "ack done"
        );
        self.validate_state();
    }

    fn update_model_and_state(&mut self, now: Timestamp, ack: &Ack) {
        self.update_bandwidth_and_rtt(now, ack);
        self.check_cycle_phase(now, ack);
        self.check_full_pipe();
        self.check_drain(now, ack);
        self.check_probe_rtt(now, ack);
    }

    fn update_control_parameters(&mut self, ack: &Ack) {
        self.set_pacing_rate();
        self.set_cwnd(ack);
    }

    fn update_bandwidth_and_rtt(&mut self, now: Timestamp, ack: &Ack) {
        let mut min_rtt: Option<Duration> = None;
        for packet in &ack.acked_packets {
            let Some(sample) = self.sample_bandwidth(now, packet) else {
                continue;
            };
            if sample.delivery_rate >= self.bottleneck_bandwidth() || !sample.is_app_limited {
                self.bottleneck_bandwidth_filter
                    .update(self.round_count, sample.delivery_rate);
            }
            if sample.rtt > Duration::ZERO {
                min_rtt = Some(min_rtt.map_or(sample.rtt, |rtt| rtt.min(sample.rtt)));
            }
        }
        if let Some(last) = ack.acked_packets.last() {
            self.last_sample_is_app_limited = last.is_app_limited;
        }
        self.update_round(ack);
        self.rtprop_expired = now > self.rtprop_stamp + RTPROP_FILTER_LENGTH;
        if let Some(min_rtt) = min_rtt {
            if self.rtprop.map_or(true, |rtprop| min_rtt < rtprop) || self.rtprop_expired {
                self.rtprop = Some(min_rtt);
                self.rtprop_stamp = now;
            }
        }
    }

    /// Forms a delivery-rate sample from one acked packet, or `None` when
    /// the interval is too short to measure
    fn sample_bandwidth(&mut self, now: Timestamp, packet: &SentPacket) -> Option<RateSample> {
        self.delivered_bytes += packet.outgoing.size;
        self.delivered_seq = packet.outgoing.sequence;
        self.delivered_time = now;
        let interval = now.saturating_duration_since(packet.delivered_time_at_send);

        // Clear the app-limited marker once the bubble is acked
        if self.app_limited_seq != 0 && self.delivered_seq > self.app_limited_seq {
            self.app_limited_seq = 0;
        }

        let delivered = self.delivered_bytes - packet.delivered_bytes_at_send;

        if interval < MIN_RTT {
            return None;
        }
        Some(RateSample {
            delivery_rate: Bandwidth::bytes_per_time(delivered, interval),
            rtt: now.saturating_duration_since(packet.send_time),
            is_app_limited: packet.is_app_limited,
        })
    }

    fn update_round(&mut self, ack: &Ack) {
        match ack.acked_packets.last() {
            Some(last) if last.delivered_bytes_at_send >= self.next_round_delivered_bytes => {
                self.next_round_delivered_bytes = self.delivered_bytes;
                self.round_count += 1;
                self.round_start = true;
            }
            _ => self.round_start = false,
        }
    }

    //
    // ProbeBW gain cycling
    //

    fn enter_probe_bw(&mut self, now: Timestamp, ack: &Ack) {
        self.state = State::ProbeBw;
        self.pacing_gain = Gain::UNIT;
        self.cwnd_gain = Gain::new(2, 1);
        // skip the drain phase on entry
        self.cycle_index =
            1 + (self.random.next_u64() % (PROBE_BW_GAIN_CYCLE.len() as u64 - 1)) as u8;
        self.advance_cycle_phase(now, ack);
    }

    fn advance_cycle_phase(&mut self, now: Timestamp, _ack: &Ack) {
        self.cycle_stamp = now;
        self.cycle_index = (self.cycle_index + 1) % PROBE_BW_GAIN_CYCLE.len() as u8;
        self.pacing_gain = PROBE_BW_GAIN_CYCLE[self.cycle_index as usize];
    }

    fn check_cycle_phase(&mut self, now: Timestamp, ack: &Ack) {
        if self.state == State::ProbeBw && self.is_next_cycle_phase(now, ack) {
            self.advance_cycle_phase(now, ack);
        }
    }

    fn is_next_cycle_phase(&self, now: Timestamp, ack: &Ack) -> bool {
        let is_full_length = now - self.cycle_stamp > self.rtprop.unwrap_or(Duration::MAX);
        if self.pacing_gain.is_one() {
            return is_full_length;
        }
        if self.pacing_gain.is_greater_than_one() {
            return is_full_length
                && (!ack.nacked_packets.is_empty()
                    || self.prior_inflight >= self.inflight(self.pacing_gain));
        }
        // pacing gain below one drains; leave as soon as the pipe is level
        is_full_length || self.prior_inflight <= self.inflight(Gain::UNIT)
    }

    //
    // Startup/Drain
    //

    fn check_full_pipe(&mut self) {
        if self.filled_pipe || !self.round_start || self.last_sample_is_app_limited {
            return;
        }
        // still growing?
        if self.bottleneck_bandwidth() >= Gain::new(5, 4) * self.full_bw {
            self.full_bw = self.bottleneck_bandwidth();
            self.full_bw_count = 0;
            return;
        }
        self.full_bw_count += 1;
        if self.full_bw_count >= FULL_BW_COUNT {
            tracing::debug!(full_bw = ?self.full_bw, "filled pipe");
            self.filled_pipe = true;
        }
    }

    fn enter_startup(&mut self) {
        self.state = State::Startup;
        self.pacing_gain = Gain::HIGH;
        self.cwnd_gain = Gain::HIGH;
    }

    fn enter_drain(&mut self) {
        self.state = State::Drain;
        self.pacing_gain = Gain::HIGH.reciprocal();
        self.cwnd_gain = Gain::HIGH;
    }

    fn check_drain(&mut self, now: Timestamp, ack: &Ack) {
        if self.state == State::Startup && self.filled_pipe {
            self.enter_drain();
        }
        if self.state == State::Drain
            && self.packets_in_flight <= self.inflight(Gain::UNIT) / self.mss as u64
        {
            self.enter_probe_bw(now, ack);
        }
    }

    //
    // ProbeRTT
    //

    fn check_probe_rtt(&mut self, now: Timestamp, ack: &Ack) {
        if self.state != State::ProbeRtt && self.rtprop_expired && !self.idle_start {
            self.enter_probe_rtt();
            self.save_cwnd();
            self.probe_rtt_done_stamp = None;
        }
        if self.state == State::ProbeRtt {
            self.handle_probe_rtt(now, ack);
        }
        self.idle_start = false;
    }

    fn enter_probe_rtt(&mut self) {
        tracing::debug!("enter probe-rtt");
        self.state = State::ProbeRtt;
        self.pacing_gain = Gain::UNIT;
        self.cwnd_gain = Gain::UNIT;
    }

    fn handle_probe_rtt(&mut self, now: Timestamp, ack: &Ack) {
        // Ignore the low inflight while probing rather than reading it as a
        // shrinking pipe
        self.app_limited_seq = self.delivered_seq + max(self.packets_in_flight, 1);
        match self.probe_rtt_done_stamp {
            None if self.packets_in_flight <= MIN_PIPE_CWND_SEGMENTS => {
                self.probe_rtt_done_stamp = Some(now + PROBE_RTT_DURATION);
                self.probe_rtt_round_done = false;
                self.next_round_delivered_bytes = self.delivered_bytes;
            }
            Some(done_stamp) => {
                if self.round_start {
                    self.probe_rtt_round_done = true;
                }
                if self.probe_rtt_round_done && now > done_stamp {
                    self.rtprop_stamp = now;
                    self.restore_cwnd();
                    self.exit_probe_rtt(now, ack);
                }
            }
            None => {}
        }
    }

    fn exit_probe_rtt(&mut self, now: Timestamp, ack: &Ack) {
        if self.filled_pipe {
            self.enter_probe_bw(now, ack);
        } else {
            self.enter_startup();
        }
    }

    //
    // Control parameters
    //

    fn set_pacing_rate(&mut self) {
        self.set_pacing_rate_with_gain(self.pacing_gain);
    }

    fn set_pacing_rate_with_gain(&mut self, gain: Gain) {
        let rate = gain * self.bottleneck_bandwidth();
        // Until the pipe fills, only ever raise the rate: transient dips are
        // noise while the estimate is still growing.
        if rate != Bandwidth::ZERO
            && (self.filled_pipe || self.pacing_rate.map_or(true, |current| rate > current))
        {
            self.pacing_rate = Some(rate);
        }
    }

    /// The current pacing rate, with a conservative floor before any
    /// bandwidth sample exists
    pub fn pacing_rate(&self) -> Bandwidth {
        self.pacing_rate.unwrap_or_else(|| {
            Bandwidth::bytes_per_time(3 * self.mss as u64, Duration::from_millis(1))
        })
    }

    fn send_quantum(&self) -> u64 {
        if self.pacing_rate() < Bandwidth::from_kilobits_per_second(1200) {
            self.mss as u64
        } else if self.pacing_rate() < Bandwidth::from_kilobits_per_second(24_000) {
            2 * self.mss as u64
        } else {
            self.pacing_rate()
                .bytes_sent_for_time(Duration::from_millis(1))
                .min(65_536)
        }
    }

    /// The amount of data `gain` would keep in flight given the current
    /// bandwidth-delay product
    fn inflight(&self, gain: Gain) -> u64 {
        let Some(rtprop) = self.rtprop else {
            return 3 * self.mss as u64;
        };
        let quanta = 3 * self.send_quantum();
        let estimated_bdp = self.bottleneck_bandwidth().bytes_sent_for_time(rtprop);
        gain * estimated_bdp + quanta
    }

    fn update_target_cwnd(&mut self) {
        self.target_cwnd_bytes = max(3 * self.mss as u64, self.inflight(self.cwnd_gain));
    }

    fn set_cwnd_bytes(&mut self, cwnd: u64) {
        if self.cwnd_bytes != cwnd {
            tracing::trace!(cwnd, "set cwnd");
        }
        self.cwnd_bytes = cwnd;
    }

    fn set_cwnd(&mut self, ack: &Ack) {
        self.update_target_cwnd();
        match self.recovery {
            Recovery::None => {
                if !ack.nacked_packets.is_empty() {
                    self.set_fast_recovery(ack);
                }
            }
            Recovery::Fast => self.modulate_cwnd_for_recovery(ack),
        }
        if !self.packet_conservation {
            let acked_bytes = sum_bytes(&ack.acked_packets);
            if self.filled_pipe {
                self.set_cwnd_bytes((self.cwnd_bytes + acked_bytes).min(self.target_cwnd_bytes));
            } else if self.cwnd_bytes < self.target_cwnd_bytes
                || acked_bytes < 3 * self.mss as u64
            {
                self.set_cwnd_bytes(self.cwnd_bytes + acked_bytes);
            }
            let floor = max(self.target_cwnd_bytes, MIN_PIPE_CWND_SEGMENTS * self.mss as u64);
            self.set_cwnd_bytes(max(self.cwnd_bytes, floor));
        }
        if self.state == State::ProbeRtt {
            self.modulate_cwnd_for_probe_rtt();
        }
    }

    fn set_fast_recovery(&mut self, ack: &Ack) {
        debug_assert_eq!(self.recovery, Recovery::None);
        tracing::debug!(exit_at = self.last_sent_packet, "enter fast recovery");
        self.save_cwnd();
        self.set_cwnd_bytes(
            self.bytes_in_flight + max(sum_bytes(&ack.acked_packets), self.mss as u64),
        );
        self.packet_conservation = true;
        self.recovery = Recovery::Fast;
        self.exit_recovery_at_seq = self.last_sent_packet;
    }

    fn modulate_cwnd_for_recovery(&mut self, ack: &Ack) {
        if !ack.nacked_packets.is_empty() {
            self.exit_recovery_at_seq = self.last_sent_packet;
            let nacked_bytes = sum_bytes(&ack.nacked_packets);
            if self.cwnd_bytes > nacked_bytes + self.mss as u64 {
                self.set_cwnd_bytes(self.cwnd_bytes - nacked_bytes);
            } else {
                self.set_cwnd_bytes(self.mss as u64);
            }
        } else if ack
            .acked_packets
            .last()
            .map_or(false, |last| last.outgoing.sequence >= self.exit_recovery_at_seq)
        {
            tracing::debug!("exit fast recovery");
            self.packet_conservation = false;
            self.restore_cwnd();
            self.recovery = Recovery::None;
        }
        if ack.nacked_packets.is_empty() {
            if self.packet_conservation {
                // conservation lasts one round: the first ack of a packet
                // sent inside recovery ends it
                for packet in &ack.acked_packets {
                    if packet.in_fast_recovery {
                        self.packet_conservation = false;
                    }
                }
            }
        } else {
            self.packet_conservation = true;
        }
        if self.packet_conservation {
            self.set_cwnd_bytes(max(
                self.cwnd_bytes,
                self.bytes_in_flight + sum_bytes(&ack.acked_packets),
            ));
        }
    }

    fn modulate_cwnd_for_probe_rtt(&mut self) {
        self.set_cwnd_bytes(
            self.cwnd_bytes
                .min(MIN_PIPE_CWND_SEGMENTS * self.mss as u64),
        );
    }

    fn save_cwnd(&mut self) {
        if self.recovery == Recovery::None && self.state != State::ProbeRtt {
            self.prior_cwnd_bytes = self.cwnd_bytes;
        } else {
            self.prior_cwnd_bytes = max(self.prior_cwnd_bytes, self.cwnd_bytes);
        }
    }

    fn restore_cwnd(&mut self) {
        self.set_cwnd_bytes(max(self.cwnd_bytes, self.prior_cwnd_bytes));
    }
}

impl core::fmt::Debug for Bbr {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Bbr")
            .field("state", &self.state)
            .field("recovery", &self.recovery)
            .field("cwnd_bytes", &self.cwnd_bytes)
            .field("bytes_in_flight", &self.bytes_in_flight)
            .field("packets_in_flight", &self.packets_in_flight)
            .field("rtprop", &self.rtprop)
            .field("bottleneck_bandwidth", &self.bottleneck_bandwidth())
            .field("filled_pipe", &self.filled_pipe)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
