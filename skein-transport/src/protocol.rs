// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The sliding-window packet protocol: sequence assignment, piggyback acks,
//! retransmission, tail-loss probing, and per-message completion, driven by
//! the BBR congestion controller.
//!
//! Everything runs inside transactions on one cooperative executor. An entry
//! point (a send, an incoming datagram, a timer firing, the link evaluating
//! a packet) opens a transaction; nested entries join it. User-visible
//! callbacks and link hand-offs are deferred to the outermost exit so state
//! is never re-entered while it is being changed. A deferred send-queue
//! scheduling pass runs after those, and quiescence, if requested, runs
//! last.

use crate::{
    bdp::BdpEstimator,
    protocol::{
        ack_sender::{AckSender, AckSenderAction},
        outstanding::{NackOutcome, OutstandingMessages},
        received_queue::ReceivedQueue,
        send_queue::SendQueue,
    },
    recovery::{bbr, Bbr},
    stats::LinkStats,
    timer::{Timeout, Timer},
};
use core::{cell::Cell, time::Duration};
use skein_core::{
    bandwidth::Bandwidth,
    codec::Codec,
    frame::AckFrame,
    random,
    seq::SeqNum,
    time::Timestamp,
    varint,
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
};

mod ack_sender;
mod outstanding;
mod received_queue;
mod send_queue;


/// Final status of a send request
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendStatus {
    /// The peer acknowledged receipt
    Ok,
    /// Nacked by the peer or abandoned by the retransmission timer
    Unavailable,
    /// The protocol closed, or the send never reached the wire
    Cancelled,
}

/// Why an incoming ack frame was rejected
#[derive(Debug, thiserror::Error, Clone, Copy, Eq, PartialEq)]
pub enum AckError {
    #[error("ack past the highest sent sequence")]
    AckPastSent,
    #[error("previously acked sequence was nacked")]
    NackOfAcked,
    #[error("ack or nack of an unsent sequence")]
    UnsentSequence,
}

/// Why an incoming datagram was not processed
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("codec rejected packet: {0}")]
    Codec(#[from] skein_core::codec::CodecError),
    #[error("malformed ack length prefix")]
    MalformedAckLength,
    #[error("ack frame extends past the end of the packet")]
    AckPastEnd,
    #[error("malformed ack frame: {0}")]
    MalformedAck(s2n_codec::DecoderError),
    #[error("invalid ack: {0}")]
    InvalidAck(#[from] AckError),
}

/// How a processed datagram needs to be acknowledged
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ProcessMessageResult {
    NotProcessed,
    Nack,
    OptionalAck,
    Ack,
    AckUrgently,
}

/// How soon the peer needs to hear an ack, in ascending order
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) enum AckUrgency {
    NotRequired,
    /// Ride along on the next outgoing packet without forcing one
    #[allow(dead_code)]
    SendBundled,
    SendSoon,
    SendImmediately,
}

/// One message for the protocol to deliver reliably
pub trait SendRequest {
    /// Fills the packet body with up to `max_length` bytes. Called at most
    /// once, and always before the completion.
    fn generate_bytes(&mut self, max_length: usize) -> Vec<u8>;

    /// Called exactly once with the final status
    fn completed(self: Box<Self>, status: SendStatus);

    /// True if this send must carry an ack frame
    fn must_send_ack(&self) -> bool {
        false
    }
}

/// Owning handle for a send request. Dropping it without a verdict counts as
/// cancellation, so the completion always fires exactly once.
pub struct SendRequestHdl {
    request: Option<Box<dyn SendRequest>>,
}

impl SendRequestHdl {
    pub fn new(request: Box<dyn SendRequest>) -> Self {
        Self {
            request: Some(request),
        }
    }

    /// Builds a request from a byte generator and a completion callback
    pub fn from_fns<G, A>(generate_bytes: G, completed: A) -> Self
    where
        G: FnMut(usize) -> Vec<u8> + 'static,
        A: FnOnce(SendStatus) + 'static,
    {
        struct Functors<G, A> {
            generate_bytes: G,
            completed: A,
        }

        impl<G, A> SendRequest for Functors<G, A>
        where
            G: FnMut(usize) -> Vec<u8> + 'static,
            A: FnOnce(SendStatus) + 'static,
        {
            fn generate_bytes(&mut self, max_length: usize) -> Vec<u8> {
                (self.generate_bytes)(max_length)
            }

            fn completed(self: Box<Self>, status: SendStatus) {
                (self.completed)(status)
            }
        }

        Self::new(Box::new(Functors {
            generate_bytes,
            completed,
        }))
    }

    fn generate_bytes(&mut self, max_length: usize) -> Vec<u8> {
        self.request
            .as_mut()
            .expect("request already completed")
            .generate_bytes(max_length)
    }

    fn must_send_ack(&self) -> bool {
        self.request
            .as_ref()
            .map_or(false, |request| request.must_send_ack())
    }

    fn complete(mut self, status: SendStatus) {
        if let Some(request) = self.request.take() {
            request.completed(status);
        }
    }
}

impl Drop for SendRequestHdl {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            request.completed(SendStatus::Cancelled);
        }
    }
}

impl core::fmt::Debug for SendRequestHdl {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("SendRequestHdl")
            .field("live", &self.request.is_some())
            .finish()
    }
}

/// The canonical ack-only send: empty body, carries whatever ack is due
struct AckSendRequest;

impl SendRequest for AckSendRequest {
    fn generate_bytes(&mut self, _max_length: usize) -> Vec<u8> {
        Vec::new()
    }

    fn completed(self: Box<Self>, _status: SendStatus) {}

    fn must_send_ack(&self) -> bool {
        true
    }
}

/// A successfully decoded incoming payload, owned by `handle_message` for
/// the duration of the callback
pub struct IncomingMessage<'a> {
    pub payload: &'a [u8],
    nacked: Cell<bool>,
}

impl<'a> IncomingMessage<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self {
            payload,
            nacked: Cell::new(false),
        }
    }

    /// Refuses the message: the sequence is reported as not received and the
    /// peer will retransmit
    pub fn nack(&self) {
        self.nacked.set(true);
    }

    fn was_nacked(&self) -> bool {
        self.nacked.get()
    }
}

/// How the protocol reaches the unreliable datagram link
pub trait PacketSender {
    /// Hands a packet to the link. The link evaluates `packet` when it is
    /// ready to put bytes on the wire; packets must be evaluated in the
    /// order they were handed over, each at most once.
    fn send_packet(&self, seq: SeqNum, packet: PacketSend);

    /// Repeated retransmission timeouts with nothing heard back
    fn no_connectivity(&self);
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum encoded packet size in bytes, codec overhead included
    pub mss: u32,
    /// Seed for the round-trip propagation estimate
    pub initial_srtt: Option<Duration>,
    /// Probe the peer with ack-only sends when the queue drains
    pub probe_tails: bool,
}

impl Config {
    pub fn new(mss: u32) -> Self {
        Self {
            mss,
            initial_srtt: None,
            probe_tails: true,
        }
    }
}

enum Action {
    Complete(SendRequestHdl, SendStatus),
    SendPacket { seq_idx: u64, seq_num: SeqNum },
    TransmitReady,
    NoConnectivity,
}

struct OpenState {
    bbr: Bbr,
    outstanding: OutstandingMessages,
    received_queue: ReceivedQueue,
    ack_sender: AckSender,
    send_queue: SendQueue,
    bdp_estimator: BdpEstimator,
    rto_timeout: Option<Timeout>,
    no_route_timeout: Option<Timeout>,
}

struct Inner {
    timer: Rc<dyn Timer>,
    packet_sender: Rc<dyn PacketSender>,
    codec: Rc<dyn Codec>,
    mss: u32,
    probe_tails: bool,
    depth: Cell<u32>,
    actions: RefCell<VecDeque<Action>>,
    schedule_send_queue: Cell<bool>,
    closing: Cell<bool>,
    closed: Cell<bool>,
    refs: Cell<usize>,
    quiesce: RefCell<Option<Box<dyn FnOnce()>>>,
    state: RefCell<Option<OpenState>>,
    stats: RefCell<LinkStats>,
}

impl Inner {
    fn acquire(&self) {
        self.refs.set(self.refs.get() + 1);
    }

    fn release(&self) {
        let refs = self.refs.get() - 1;
        self.refs.set(refs);
        if refs == 0 {
            if let Some(quiesce) = self.quiesce.borrow_mut().take() {
                quiesce();
            }
        }
    }
}

/// Keeps the protocol from quiescing while asynchronous work (a handed-off
/// packet, a scheduled timer) is still outstanding
struct ProtocolRef {
    inner: Rc<Inner>,
}

impl ProtocolRef {
    fn new(inner: &Rc<Inner>) -> Self {
        inner.acquire();
        Self {
            inner: inner.clone(),
        }
    }

    fn protocol(&self) -> PacketProtocol {
        PacketProtocol {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for ProtocolRef {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// A packet handed to the link, evaluated lazily when the link is ready to
/// transmit. Dropping it unevaluated abandons the send.
pub struct PacketSend {
    protocol: Option<ProtocolRef>,
    seq_idx: u64,
}

impl PacketSend {
    /// Formats, encodes and registers the packet, returning the wire bytes
    /// (at most `min(link_max, mss)` of them, empty if the send was
    /// abandoned). May be called at most once.
    pub fn generate(mut self, link_max: usize) -> Vec<u8> {
        let reference = self.protocol.take().expect("generate called twice");
        reference.protocol().generate_packet(self.seq_idx, link_max)
    }
}

impl Drop for PacketSend {
    fn drop(&mut self) {
        if let Some(reference) = self.protocol.take() {
            reference.protocol().cancel_packet(self.seq_idx);
        }
    }
}

impl core::fmt::Debug for PacketSend {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("PacketSend")
            .field("seq_idx", &self.seq_idx)
            .finish()
    }
}

/// The packet protocol endpoint. Cheap to clone; all clones refer to the
/// same connection.
#[derive(Clone)]
pub struct PacketProtocol {
    inner: Rc<Inner>,
}

impl PacketProtocol {
    pub fn new(
        config: Config,
        timer: Rc<dyn Timer>,
        packet_sender: Rc<dyn PacketSender>,
        codec: Rc<dyn Codec>,
        random: Box<dyn random::Generator>,
    ) -> Self {
        assert!(
            config.mss as usize > codec.border().total() + varint::MAX_SIZE,
            "mss leaves no room for payload"
        );
        let bbr = Bbr::new(&*timer, random, config.mss, config.initial_srtt);
        let state = OpenState {
            bbr,
            outstanding: OutstandingMessages::new(),
            received_queue: ReceivedQueue::new(),
            ack_sender: AckSender::new(),
            send_queue: SendQueue::new(),
            bdp_estimator: BdpEstimator::default(),
            rto_timeout: None,
            no_route_timeout: None,
        };
        Self {
            inner: Rc::new(Inner {
                timer,
                packet_sender,
                codec,
                mss: config.mss,
                probe_tails: config.probe_tails,
                depth: Cell::new(0),
                actions: RefCell::new(VecDeque::new()),
                schedule_send_queue: Cell::new(false),
                closing: Cell::new(false),
                closed: Cell::new(false),
                // the primary reference, dropped when close tears down
                refs: Cell::new(1),
                quiesce: RefCell::new(None),
                state: RefCell::new(Some(state)),
                stats: RefCell::new(LinkStats::default()),
            }),
        }
    }

    //
    // Public entry points
    //

    /// Requests that a single message be sent. The request's completion
    /// fires exactly once.
    pub fn send(&self, request: SendRequestHdl) {
        self.enter(|| {
            let inner = &self.inner;
            if inner.closing.get() {
                drop(request);
                return;
            }
            let mut state_ref = inner.state.borrow_mut();
            if let Some(state) = state_ref.as_mut() {
                tracing::trace!("send");
                if state.send_queue.add(request) {
                    inner.schedule_send_queue.set(true);
                }
                return;
            }
            drop(state_ref);
            drop(request);
        })
    }

    /// Processes one received datagram. `handle_message` observes the
    /// decoded payload (or the reason it could not be processed) before the
    /// protocol state is updated.
    pub fn process<F>(
        &self,
        received: Timestamp,
        seq_num: SeqNum,
        payload: Vec<u8>,
        handle_message: F,
    ) where
        F: FnOnce(Result<Option<&IncomingMessage>, ProcessError>),
    {
        self.enter(|| {
            let inner = &self.inner;
            inner.stats.borrow_mut().incoming_packet_count += 1;

            let seq_idx = {
                let mut state_ref = inner.state.borrow_mut();
                let Some(state) = state_ref.as_mut() else { return };
                // a live peer resets connectivity detection
                state.no_route_timeout = None;
                match state.received_queue.begin_receive(seq_num, received) {
                    Some(seq_idx) => seq_idx,
                    None => return,
                }
            };
            tracing::trace!(seq = seq_idx, len = payload.len(), "process");

            let result = match inner.codec.decode(seq_idx, payload) {
                Ok(plain) => {
                    {
                        let mut state_ref = inner.state.borrow_mut();
                        if let Some(state) = state_ref.as_mut() {
                            state.bdp_estimator.received_bytes(plain.len() as u64);
                        }
                    }
                    self.process_message(seq_idx, &plain, received, handle_message)
                }
                Err(error) => {
                    handle_message(Err(ProcessError::Codec(error)));
                    ProcessMessageResult::NotProcessed
                }
            };

            let mut state_ref = inner.state.borrow_mut();
            let Some(state) = state_ref.as_mut() else { return };
            if result == ProcessMessageResult::OptionalAck {
                inner.stats.borrow_mut().pure_acks_received += 1;
            }
            let urgency = state.received_queue.finish_receive(seq_idx, received, result);
            let now = inner.timer.now();
            self.need_ack(state, now, urgency);
            self.arm_retransmit(state, now);
        })
    }

    /// Initiates quiescence: nothing new may complete, in-flight work is
    /// cancelled, and `quiesced` runs once the last outstanding packet or
    /// timer releases the protocol.
    pub fn close<F: FnOnce() + 'static>(&self, quiesced: F) {
        self.enter(|| {
            let inner = &self.inner;
            assert!(!inner.closing.get(), "close may only be called once");
            tracing::debug!("close");
            *inner.quiesce.borrow_mut() = Some(Box::new(quiesced));
            inner.closing.set(true);
        })
    }

    pub fn maximum_send_size(&self) -> u32 {
        self.inner.mss
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.inner.state.borrow().as_ref().and_then(|s| s.bbr.rtt())
    }

    pub fn bottleneck_bandwidth(&self) -> Bandwidth {
        self.inner
            .state
            .borrow()
            .as_ref()
            .map_or(Bandwidth::ZERO, |s| s.bbr.bottleneck_bandwidth())
    }

    pub fn bdp_estimate(&self) -> u64 {
        self.inner
            .state
            .borrow()
            .as_ref()
            .map_or(0, |s| s.bdp_estimator.estimate())
    }

    pub fn stats(&self) -> LinkStats {
        self.inner.stats.borrow().clone()
    }

    #[cfg(test)]
    fn test_bytes_in_flight(&self) -> u64 {
        self.inner
            .state
            .borrow()
            .as_ref()
            .map_or(0, |s| s.bbr.bytes_in_flight())
    }

    #[cfg(test)]
    fn test_send_tip(&self) -> u64 {
        self.inner
            .state
            .borrow()
            .as_ref()
            .map_or(0, |s| s.outstanding.send_tip())
    }

    #[cfg(test)]
    fn test_in_fast_recovery(&self) -> bool {
        self.inner
            .state
            .borrow()
            .as_ref()
            .map_or(false, |s| s.bbr.in_fast_recovery())
    }

    //
    // Transaction engine
    //

    fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let inner = &self.inner;
        inner.depth.set(inner.depth.get() + 1);
        let result = f();
        self.exit();
        result
    }

    fn exit(&self) {
        let inner = &self.inner;
        let depth = inner.depth.get();
        debug_assert!(depth >= 1);
        if depth > 1 {
            inner.depth.set(depth - 1);
            return;
        }
        // Outermost exit: settle deferred work. Nested entries made by the
        // callbacks below only enqueue more of it.
        loop {
            let action = inner.actions.borrow_mut().pop_front();
            if let Some(action) = action {
                self.run_action(action);
                continue;
            }
            if inner.schedule_send_queue.replace(false) {
                self.do_schedule_send_queue();
                continue;
            }
            if inner.closing.get() && !inner.closed.get() {
                inner.closed.set(true);
                // Cancellations cascade from the drops: queued and
                // outstanding requests complete with Cancelled, timers
                // release their references.
                let open_state = inner.state.borrow_mut().take();
                drop(open_state);
                inner.release();
                continue;
            }
            break;
        }
        inner.depth.set(0);
    }

    fn run_action(&self, action: Action) {
        match action {
            Action::Complete(request, status) => request.complete(status),
            Action::SendPacket { seq_idx, seq_num } => {
                let packet = PacketSend {
                    protocol: Some(ProtocolRef::new(&self.inner)),
                    seq_idx,
                };
                self.inner.packet_sender.send_packet(seq_num, packet);
            }
            Action::TransmitReady => self.transmit_ready(),
            Action::NoConnectivity => self.inner.packet_sender.no_connectivity(),
        }
    }

    //
    // Send path
    //

    fn do_schedule_send_queue(&self) {
        let inner = &self.inner;
        let mut state_ref = inner.state.borrow_mut();
        let Some(state) = state_ref.as_mut() else { return };
        if state.send_queue.scheduled() || !state.send_queue.has_work() {
            return;
        }
        state.send_queue.set_scheduled();
        let now = inner.timer.now();
        match state.bbr.request_transmit(now) {
            bbr::TransmitOutcome::Ready { departure_time } => {
                self.pace_transmit(state, now, departure_time);
            }
            bbr::TransmitOutcome::Paused => {
                // readied by the next ack that frees capacity
            }
        }
    }

    fn pace_transmit(&self, state: &mut OpenState, now: Timestamp, departure_time: Timestamp) {
        let inner = &self.inner;
        if departure_time <= now {
            inner.actions.borrow_mut().push_back(Action::TransmitReady);
        } else {
            let reference = ProtocolRef::new(&self.inner);
            let timeout = inner.timer.schedule(
                departure_time,
                Box::new(move |status| {
                    if status.is_cancelled() {
                        return;
                    }
                    reference.protocol().transmit_ready();
                }),
            );
            state.send_queue.set_pacing_timeout(timeout);
        }
    }

    /// The pacing gate opened: move the next request into the outstanding
    /// window and hand its packet to the link
    fn transmit_ready(&self) {
        self.enter(|| {
            let inner = &self.inner;
            let mut state_ref = inner.state.borrow_mut();
            let Some(state) = state_ref.as_mut() else { return };
            debug_assert!(state.send_queue.scheduled());
            state.send_queue.clear_pacing_timeout();
            let (request, tail_probe) = state.send_queue.take_next();
            let seq_idx = state.outstanding.push_request(request, tail_probe);
            let seq_num = SeqNum::new(seq_idx, state.outstanding.seq_window());
            if tail_probe {
                inner.stats.borrow_mut().tail_loss_probes += 1;
            }
            tracing::debug!(seq = seq_idx, tail_probe, "dispatch");
            inner
                .actions
                .borrow_mut()
                .push_back(Action::SendPacket { seq_idx, seq_num });
        })
    }

    /// The link asked for the packet's bytes
    fn generate_packet(&self, seq_idx: u64, link_max: usize) -> Vec<u8> {
        self.enter(|| {
            let inner = &self.inner;
            let now = inner.timer.now();

            // Phase one: formatter inputs, under the state borrow
            let (mut request, prefix, payload_budget, first_unknown) = {
                let mut state_ref = inner.state.borrow_mut();
                let Some(state) = state_ref.as_mut() else {
                    return Vec::new();
                };
                let Some(request) = state.outstanding.begin_generate(seq_idx) else {
                    // finalized before the link got to it
                    state.bbr.cancel_request(now);
                    self.after_send_dispatched(state, now);
                    return Vec::new();
                };
                let max_length = link_max.min(inner.mss as usize);
                let border = inner.codec.border().total();
                debug_assert!(max_length > border);

                let mut prefix = vec![0u8];
                let mut first_unknown = 0u64;
                if state.received_queue.can_build_ack()
                    && (request.must_send_ack() || state.ack_sender.should_send_ack())
                {
                    let budget =
                        varint::max_length_with_prefix((max_length - border) as u64) as usize;
                    let frame = state.received_queue.build_ack(now, budget);
                    if state.ack_sender.ack_sent(seq_idx, frame.partial()) {
                        self.need_ack(state, now, AckUrgency::SendSoon);
                    }
                    first_unknown = state.received_queue.first_unknown_sequence();
                    let frame_bytes = frame.encode_to_vec();
                    let mut buf = [0u8; varint::MAX_SIZE];
                    prefix = varint::write(frame_bytes.len() as u64, &mut buf).to_vec();
                    prefix.extend_from_slice(&frame_bytes);
                    inner.stats.borrow_mut().acks_sent += 1;
                }
                let payload_budget = max_length - border - prefix.len();
                (request, prefix, payload_budget, first_unknown)
            };

            // Phase two: the request fills its bytes, outside any borrow
            let payload = request.generate_bytes(payload_budget);
            debug_assert!(payload.len() <= payload_budget);

            // Phase three: register the send
            let mut state_ref = inner.state.borrow_mut();
            let Some(state) = state_ref.as_mut() else {
                drop(state_ref);
                drop(request);
                return Vec::new();
            };
            let mut plain = prefix;
            plain.extend_from_slice(&payload);
            let encoded = match inner.codec.encode(seq_idx, plain) {
                Ok(encoded) => encoded,
                Err(error) => {
                    tracing::error!(%error, seq = seq_idx, "failed to encode packet");
                    state.outstanding.abort_generate(seq_idx);
                    state.bbr.cancel_request(now);
                    self.after_send_dispatched(state, now);
                    inner
                        .actions
                        .borrow_mut()
                        .push_back(Action::Complete(request, SendStatus::Cancelled));
                    return Vec::new();
                }
            };
            debug_assert!(encoded.len() <= inner.mss as usize);
            let bbr_packet = state.bbr.sent(
                now,
                bbr::OutgoingPacket {
                    sequence: seq_idx,
                    size: encoded.len() as u64,
                },
            );
            let bdp_data = state.bdp_estimator.sent_packet(seq_idx);
            state
                .outstanding
                .finish_generate(seq_idx, request, first_unknown, bbr_packet, bdp_data);
            inner.stats.borrow_mut().outgoing_packet_count += 1;
            self.arm_retransmit(state, now);
            self.after_send_dispatched(state, now);
            encoded
        })
    }

    /// The link dropped the packet without evaluating it
    fn cancel_packet(&self, seq_idx: u64) {
        self.enter(|| {
            let inner = &self.inner;
            let mut state_ref = inner.state.borrow_mut();
            let Some(state) = state_ref.as_mut() else { return };
            tracing::debug!(seq = seq_idx, "packet cancelled before sending");
            let now = inner.timer.now();
            state.bbr.cancel_request(now);
            let mut batch = AckBatch::new(Duration::ZERO);
            self.nack_seq(state, &mut batch, seq_idx, SendStatus::Cancelled);
            self.finish_batch(state, batch, now);
            self.after_send_dispatched(state, now);
        })
    }

    /// One dispatch resolved: keep the queue draining, or plan a tail probe
    /// if there is nothing left to say
    fn after_send_dispatched(&self, state: &mut OpenState, now: Timestamp) {
        let inner = &self.inner;
        state.send_queue.finish_dispatch();
        if state.send_queue.has_work() {
            inner.schedule_send_queue.set(true);
        } else if !state.send_queue.last_send_was_tail_probe()
            && inner.probe_tails
            && !inner.closing.get()
        {
            self.schedule_tail_probe(state, now);
        }
    }

    fn schedule_tail_probe(&self, state: &mut OpenState, now: Timestamp) {
        let inner = &self.inner;
        if !state.send_queue.is_empty() {
            return;
        }
        let when = now + self.tail_probe_delay(state);
        if state
            .send_queue
            .tail_probe_deadline()
            .map_or(false, |existing| existing <= when)
        {
            return;
        }
        tracing::trace!(at = %when, "schedule tail loss probe");
        let reference = ProtocolRef::new(&self.inner);
        let timeout = inner.timer.schedule(
            when,
            Box::new(move |status| {
                if status.is_cancelled() {
                    return;
                }
                reference.protocol().on_tail_probe();
            }),
        );
        state.send_queue.set_tail_probe(when, timeout);
    }

    fn on_tail_probe(&self) {
        self.enter(|| {
            let inner = &self.inner;
            let mut state_ref = inner.state.borrow_mut();
            let Some(state) = state_ref.as_mut() else { return };
            state.send_queue.clear_tail_probe();
            tracing::debug!("tail loss probe fires");
            if !state.send_queue.scheduled() {
                state.send_queue.force_ack();
                inner.schedule_send_queue.set(true);
            }
        })
    }

    //
    // Receive path
    //

    fn process_message<F>(
        &self,
        seq_idx: u64,
        plain: &[u8],
        received: Timestamp,
        handle_message: F,
    ) -> ProcessMessageResult
    where
        F: FnOnce(Result<Option<&IncomingMessage>, ProcessError>),
    {
        use s2n_codec::DecoderBuffer;

        if plain.is_empty() {
            handle_message(Ok(None));
            return ProcessMessageResult::OptionalAck;
        }

        let buffer = DecoderBuffer::new(plain);
        let Ok((ack_length, buffer)) = varint::decode(buffer) else {
            handle_message(Err(ProcessError::MalformedAckLength));
            return ProcessMessageResult::NotProcessed;
        };
        if ack_length > buffer.len() as u64 {
            handle_message(Err(ProcessError::AckPastEnd));
            return ProcessMessageResult::NotProcessed;
        }
        let (ack_buffer, body) = buffer
            .decode_slice(ack_length as usize)
            .expect("length checked");

        let mut ack = None;
        let mut result = ProcessMessageResult::OptionalAck;
        if ack_length > 0 {
            let frame = match AckFrame::decode(ack_buffer) {
                Ok(frame) => frame,
                Err(error) => {
                    handle_message(Err(ProcessError::MalformedAck(error)));
                    return ProcessMessageResult::NotProcessed;
                }
            };
            {
                let state_ref = self.inner.state.borrow();
                let Some(state) = state_ref.as_ref() else {
                    return ProcessMessageResult::NotProcessed;
                };
                if let Err(error) = state.outstanding.validate_ack(&frame) {
                    drop(state_ref);
                    tracing::debug!(%error, "rejecting ack");
                    handle_message(Err(ProcessError::InvalidAck(error)));
                    return ProcessMessageResult::Nack;
                }
            }
            tracing::trace!(seq = seq_idx, ack_to = frame.ack_to_seq(), "got ack");
            if frame.partial() {
                result = ProcessMessageResult::AckUrgently;
            }
            ack = Some(frame);
        }

        let body = body.into_less_safe_slice();
        if !body.is_empty() {
            let message = IncomingMessage::new(body);
            handle_message(Ok(Some(&message)));
            if message.was_nacked() {
                // the ack is deliberately not processed
                return ProcessMessageResult::Nack;
            }
            if result != ProcessMessageResult::AckUrgently {
                result = ProcessMessageResult::Ack;
            }
        } else {
            handle_message(Ok(None));
        }

        if let Some(frame) = ack {
            self.process_valid_ack(frame, received);
        }
        result
    }

    fn process_valid_ack(&self, frame: AckFrame, received: Timestamp) {
        let inner = &self.inner;
        let now = inner.timer.now();
        let mut state_ref = inner.state.borrow_mut();
        let Some(state) = state_ref.as_mut() else { return };

        if frame.ack_to_seq() < state.outstanding.send_tip() {
            // stale: everything it covers is already finalized
            return;
        }

        // move our receive window forward to what the peer had seen from us
        // when it built this ack
        if let Some(first_unknown) = state.outstanding.first_unknown_at_send(frame.ack_to_seq()) {
            if first_unknown > 0 {
                state.received_queue.set_tip(first_unknown, received);
            }
        }

        let mut batch = AckBatch::new(Duration::from_micros(frame.ack_delay_us()));

        // Nacks first, oldest first: the earliest lost fragment is the most
        // likely to be resent first, and earlier pieces are the most likely
        // to fit the peer's buffers.
        for nack in frame.nack_seqs() {
            self.nack_seq(state, &mut batch, nack, SendStatus::Unavailable);
        }

        for seq in state.outstanding.send_tip()..=frame.ack_to_seq() {
            if let Some((request, bbr_packet, bdp_data)) = state.outstanding.take_for_ack(seq) {
                batch.push_acked(bbr_packet);
                state.bdp_estimator.ack_packet(bdp_data);
                state.ack_sender.on_ack(seq);
                inner
                    .actions
                    .borrow_mut()
                    .push_back(Action::Complete(request, SendStatus::Ok));
            }
        }

        self.finish_batch(state, batch, now);
    }

    fn nack_seq(
        &self,
        state: &mut OpenState,
        batch: &mut AckBatch,
        seq: u64,
        status: SendStatus,
    ) {
        let inner = &self.inner;
        if state.ack_sender.on_nack(seq) {
            let now = inner.timer.now();
            self.need_ack(state, now, AckUrgency::SendSoon);
        }
        match state.outstanding.take_for_nack(seq) {
            NackOutcome::None => {}
            NackOutcome::Unsent(request) => {
                inner
                    .actions
                    .borrow_mut()
                    .push_back(Action::Complete(request, status));
            }
            NackOutcome::Sent(request, bbr_packet) => {
                tracing::debug!(seq, ?status, "nack");
                batch.push_nacked(bbr_packet);
                inner
                    .actions
                    .borrow_mut()
                    .push_back(Action::Complete(request, status));
            }
        }
    }

    /// Applies a batch of ack/nack feedback: the window shrinks, BBR hears
    /// about it, and a transmit paused on the old window may resume
    fn finish_batch(&self, state: &mut OpenState, batch: AckBatch, now: Timestamp) {
        state.outstanding.shrink();
        if !batch.bbr_ack.is_empty() {
            state.bbr.on_ack(now, &batch.bbr_ack);
        }
        if let Some(departure_time) = state.bbr.resume_paused(now) {
            self.pace_transmit(state, now, departure_time);
        }
    }

    fn need_ack(&self, state: &mut OpenState, now: Timestamp, urgency: AckUrgency) {
        if urgency == AckUrgency::NotRequired {
            return;
        }
        match state.ack_sender.need_ack(urgency) {
            AckSenderAction::None => {}
            AckSenderAction::ScheduleSoon => self.schedule_tail_probe(state, now),
            AckSenderAction::ForceImmediate => {
                if !state.send_queue.scheduled() {
                    state.send_queue.force_ack();
                    self.inner.schedule_send_queue.set(true);
                }
            }
        }
    }

    //
    // Retransmission and connectivity
    //

    fn retransmit_delay(&self, state: &OpenState) -> Duration {
        const MIN_RETRANSMIT_DELAY: Duration = Duration::from_secs(1);
        const RTT_SCALING: u32 = 4;
        match state.bbr.rtt() {
            Some(rtt) if rtt >= MIN_RETRANSMIT_DELAY / RTT_SCALING => rtt * RTT_SCALING,
            _ => MIN_RETRANSMIT_DELAY,
        }
    }

    fn tail_probe_delay(&self, state: &OpenState) -> Duration {
        const MIN_TAIL_PROBE_DELAY: Duration = Duration::from_millis(1);
        const RTT_SCALING: u32 = 4;
        match state.bbr.rtt() {
            Some(rtt) if rtt >= MIN_TAIL_PROBE_DELAY * RTT_SCALING => rtt / RTT_SCALING,
            _ => MIN_TAIL_PROBE_DELAY,
        }
    }

    fn arm_retransmit(&self, state: &mut OpenState, _now: Timestamp) {
        if state.rto_timeout.is_some() {
            return;
        }
        let Some(deadline) = state
            .outstanding
            .retransmit_deadline(self.retransmit_delay(state))
        else {
            return;
        };
        let reference = ProtocolRef::new(&self.inner);
        state.rto_timeout = Some(self.inner.timer.schedule(
            deadline,
            Box::new(move |status| {
                if status.is_cancelled() {
                    return;
                }
                reference.protocol().on_retransmit_timeout();
            }),
        ));
    }

    fn on_retransmit_timeout(&self) {
        self.enter(|| {
            let inner = &self.inner;
            let mut state_ref = inner.state.borrow_mut();
            let Some(state) = state_ref.as_mut() else { return };
            state.rto_timeout = None;
            let now = inner.timer.now();
            let nack_before = now - self.retransmit_delay(state);
            let due = state.outstanding.sent_due(nack_before);
            if !due.is_empty() {
                tracing::debug!(count = due.len(), "retransmission timeout");
                inner.stats.borrow_mut().retransmit_expiries += due.len() as u64;
                let mut batch = AckBatch::new(Duration::ZERO);
                for seq in &due {
                    self.nack_seq(state, &mut batch, *seq, SendStatus::Unavailable);
                }
                self.finish_batch(state, batch, now);
                if !state.outstanding.has_live_sent() {
                    self.on_failed_delivery(state, now);
                }
            }
            self.arm_retransmit(state, now);
        })
    }

    /// Every outstanding send just expired: start the no-connectivity clock
    fn on_failed_delivery(&self, state: &mut OpenState, now: Timestamp) {
        if state.no_route_timeout.is_some() {
            return;
        }
        let deadline = now + self.retransmit_delay(state) * 4;
        let reference = ProtocolRef::new(&self.inner);
        state.no_route_timeout = Some(self.inner.timer.schedule(
            deadline,
            Box::new(move |status| {
                if status.is_cancelled() {
                    return;
                }
                reference.protocol().on_no_connectivity();
            }),
        ));
    }

    fn on_no_connectivity(&self) {
        self.enter(|| {
            let inner = &self.inner;
            {
                let mut state_ref = inner.state.borrow_mut();
                let Some(state) = state_ref.as_mut() else { return };
                state.no_route_timeout = None;
            }
            tracing::warn!("no connectivity detected");
            inner.actions.borrow_mut().push_back(Action::NoConnectivity);
        })
    }
}

/// Collects ack/nack feedback destined for BBR, offsetting send times by the
/// peer's reported queuing delay
struct AckBatch {
    queue_delay: Duration,
    bbr_ack: bbr::Ack,
}

impl AckBatch {
    fn new(queue_delay: Duration) -> Self {
        Self {
            queue_delay,
            bbr_ack: bbr::Ack::default(),
        }
    }

    fn push_acked(&mut self, mut packet: bbr::SentPacket) {
        packet.send_time = packet.send_time + self.queue_delay;
        self.bbr_ack.acked_packets.push(packet);
    }

    fn push_nacked(&mut self, mut packet: bbr::SentPacket) {
        packet.send_time = packet.send_time + self.queue_delay;
        self.bbr_ack.nacked_packets.push(packet);
    }
}
