// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tracks which sequences we have received (or not) and the state needed to
//! acknowledge them.
//!
//! The queue is a dense window starting at `received_tip`; entries below the
//! tip are finalized and forgotten. Sequences between the tip and the
//! highest sequence seen exist implicitly as `Unknown` and are materialized
//! on demand.

use super::{AckUrgency, ProcessMessageResult};
use skein_core::{frame::AckFrame, seq::SeqNum, time::Timestamp};
use std::collections::VecDeque;

/// Reject sequences this far past the window, so a corrupt sequence number
/// cannot make us allocate unbounded state
const MAX_SKIP: u64 = 65_536;

/// Pure acks go quiet after this many in a row with no data between them
const OPTIONAL_ACK_RUN_LIMIT: u64 = 5;

/// Demand an immediate ack once this many data packets are unacknowledged
const MAX_UNACKED_RECEIVES: usize = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReceiveState {
    Unknown,
    NotReceived,
    ReceivedPureAck,
    Received,
    ReceivedAndAckedImmediately,
}

impl ReceiveState {
    #[cfg(test)]
    fn is_received(self) -> bool {
        matches!(
            self,
            ReceiveState::ReceivedPureAck
                | ReceiveState::Received
                | ReceiveState::ReceivedAndAckedImmediately
        )
    }
}

#[derive(Clone, Copy, Debug)]
struct ReceivedPacket {
    state: ReceiveState,
    when: Timestamp,
}

#[derive(Debug)]
pub(super) struct ReceivedQueue {
    received_tip: u64,
    optional_ack_run_length: u64,
    packets: VecDeque<ReceivedPacket>,
}

impl ReceivedQueue {
    pub fn new() -> Self {
        Self {
            received_tip: 1,
            optional_ack_run_length: 0,
            packets: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub fn received_tip(&self) -> u64 {
        self.received_tip
    }

    /// The base the peer's compact sequence numbers reconstruct against
    pub fn window_base(&self) -> u64 {
        self.received_tip + self.packets.len() as u64
    }

    /// Reconstructs and admits an incoming sequence. Returns `None` for
    /// stale sequences, absurd skips, and sequences already in a final
    /// state.
    pub fn begin_receive(&mut self, seq_num: SeqNum, received: Timestamp) -> Option<u64> {
        let seq_idx = seq_num.reconstruct(self.window_base());
        if seq_idx < self.received_tip {
            tracing::trace!(seq = seq_idx, tip = self.received_tip, "stale sequence");
            return None;
        }
        if !self.materialize(seq_idx, received) {
            tracing::debug!(seq = seq_idx, "sequence skips too far ahead");
            return None;
        }
        let entry = self.get(seq_idx);
        if entry.state != ReceiveState::Unknown {
            tracing::trace!(seq = seq_idx, state = ?entry.state, "sequence frozen");
            return None;
        }
        Some(seq_idx)
    }

    /// Applies the processing result and reports how urgently the peer
    /// should hear about it
    pub fn finish_receive(
        &mut self,
        seq_idx: u64,
        received: Timestamp,
        result: ProcessMessageResult,
    ) -> AckUrgency {
        match result {
            ProcessMessageResult::NotProcessed => {
                // Failed packets stay unknown: a retransmission of the same
                // sequence may still be processed, and failures must not
                // generate traffic.
                AckUrgency::NotRequired
            }
            ProcessMessageResult::Nack => {
                self.optional_ack_run_length = 0;
                self.set(seq_idx, ReceiveState::NotReceived, received);
                // the peer resends fastest when it hears immediately
                AckUrgency::SendImmediately
            }
            ProcessMessageResult::OptionalAck => {
                self.optional_ack_run_length += 1;
                self.set(seq_idx, ReceiveState::ReceivedPureAck, received);
                if self.optional_ack_run_length < OPTIONAL_ACK_RUN_LIMIT {
                    AckUrgency::NotRequired
                } else {
                    self.optional_ack_run_length = 0;
                    self.received_urgency()
                }
            }
            ProcessMessageResult::Ack => {
                self.optional_ack_run_length = 0;
                self.set(seq_idx, ReceiveState::Received, received);
                self.received_urgency()
            }
            ProcessMessageResult::AckUrgently => {
                self.optional_ack_run_length = 0;
                self.set(seq_idx, ReceiveState::ReceivedAndAckedImmediately, received);
                AckUrgency::SendImmediately
            }
        }
    }

    fn received_urgency(&self) -> AckUrgency {
        let unacked = self
            .packets
            .iter()
            .filter(|p| {
                matches!(
                    p.state,
                    ReceiveState::Received | ReceiveState::ReceivedAndAckedImmediately
                )
            })
            .count();
        if unacked >= MAX_UNACKED_RECEIVES {
            AckUrgency::SendImmediately
        } else {
            AckUrgency::SendSoon
        }
    }

    /// The highest sequence in a known state, if any
    pub fn max_seen_sequence(&self) -> Option<u64> {
        self.packets
            .iter()
            .rposition(|p| p.state != ReceiveState::Unknown)
            .map(|index| self.received_tip + index as u64)
    }

    /// The first sequence we do not yet know the fate of
    pub fn first_unknown_sequence(&self) -> u64 {
        let index = self
            .packets
            .iter()
            .position(|p| p.state == ReceiveState::Unknown)
            .unwrap_or(self.packets.len());
        self.received_tip + index as u64
    }

    pub fn can_build_ack(&self) -> bool {
        self.max_seen_sequence().is_some()
    }

    /// Builds an ack frame covering everything known, sized to fit
    /// `max_length` bytes
    pub fn build_ack(&mut self, now: Timestamp, max_length: usize) -> AckFrame {
        let max_seen = self
            .max_seen_sequence()
            .expect("build_ack requires a received packet");

        // everything below the newest known packet is now committed: unseen
        // entries become explicit nacks
        for index in 0..(max_seen - self.received_tip) as usize {
            let packet = &mut self.packets[index];
            if packet.state == ReceiveState::Unknown {
                *packet = ReceivedPacket {
                    state: ReceiveState::NotReceived,
                    when: now,
                };
            }
        }

        let mut frame = AckFrame::new(max_seen, self.packet_delay_us(max_seen, now));
        for seq in (self.received_tip..=max_seen).rev() {
            if self.get(seq).state == ReceiveState::NotReceived {
                frame.add_nack(seq);
            }
        }

        let tip = self.received_tip;
        let packets = &self.packets;
        frame.adjust_for_mss(max_length, |seq| {
            let when = packets[(seq - tip) as usize].when;
            now.saturating_duration_since(when).as_micros() as u64
        });
        frame
    }

    /// Advances the tip to the peer's previously-reported first unknown
    /// sequence, forgetting everything settled below it. Tips only move
    /// forward.
    pub fn set_tip(&mut self, seq_idx: u64, received: Timestamp) {
        debug_assert!(seq_idx >= 1);
        if seq_idx <= self.received_tip {
            return;
        }
        assert!(
            self.materialize(seq_idx, received),
            "tip derived from our own window cannot skip"
        );
        tracing::trace!(tip = seq_idx, "advance received tip");
        self.packets.drain(..(seq_idx - self.received_tip) as usize);
        self.received_tip = seq_idx;
    }

    fn materialize(&mut self, seq_idx: u64, received: Timestamp) -> bool {
        if seq_idx > self.received_tip && seq_idx - self.received_tip > MAX_SKIP {
            return false;
        }
        while self.window_base() <= seq_idx {
            self.packets.push_back(ReceivedPacket {
                state: ReceiveState::Unknown,
                when: received,
            });
        }
        true
    }

    fn get(&self, seq_idx: u64) -> &ReceivedPacket {
        &self.packets[(seq_idx - self.received_tip) as usize]
    }

    fn set(&mut self, seq_idx: u64, state: ReceiveState, when: Timestamp) {
        self.packets[(seq_idx - self.received_tip) as usize] = ReceivedPacket { state, when };
    }

    fn packet_delay_us(&self, seq_idx: u64, now: Timestamp) -> u64 {
        let packet = self.get(seq_idx);
        debug_assert!(packet.state != ReceiveState::Unknown);
        now.saturating_duration_since(packet.when).as_micros() as u64
    }

    /// True when the entry for `seq_idx` records a received packet
    #[cfg(test)]
    pub fn is_received(&self, seq_idx: u64) -> bool {
        seq_idx >= self.received_tip
            && ((seq_idx - self.received_tip) as usize) < self.packets.len()
            && self.get(seq_idx).state.is_received()
    }
}
