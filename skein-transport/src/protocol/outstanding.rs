// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tracks messages that are sent but not yet acknowledged.
//!
//! The window is a dense deque over `[send_tip, send_tip + len)`; an entry
//! holds the application's request until it reaches a terminal state, and
//! terminal entries at the front are forgotten as the tip advances.

use super::{AckError, SendRequestHdl};
use crate::{bdp, recovery::bbr};
use core::time::Duration;
use skein_core::{frame::AckFrame, time::Timestamp};
use std::collections::VecDeque;

#[derive(Debug)]
pub(super) enum OutstandingState {
    /// Queued ack-only probe, not yet on the wire
    PendingTailProbe { request: SendRequestHdl },
    /// Queued, not yet on the wire
    Pending { request: SendRequestHdl },
    /// The link is currently evaluating the packet's bytes; the request is
    /// temporarily with the formatter
    Generating,
    Sent {
        request: SendRequestHdl,
        /// Our receive window's first unknown sequence when this packet's
        /// ack frame was built, or 0 if it carried no ack
        first_unknown_sequence_at_send: u64,
        bbr_packet: bbr::SentPacket,
        bdp_data: bdp::PerPacketData,
    },
    Acked,
    Nacked,
}

impl OutstandingState {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Acked | Self::Nacked)
    }

    fn is_unsent(&self) -> bool {
        matches!(
            self,
            Self::PendingTailProbe { .. } | Self::Pending { .. } | Self::Generating
        )
    }
}

/// What a nack transition found
pub(super) enum NackOutcome {
    /// Already terminal, or before the window
    None,
    /// Never made it to the wire: complete it, but nothing for BBR
    Unsent(SendRequestHdl),
    Sent(SendRequestHdl, bbr::SentPacket),
}

#[derive(Debug)]
pub(super) struct OutstandingMessages {
    send_tip: u64,
    max_outstanding_size: u64,
    packets: VecDeque<OutstandingState>,
}

impl OutstandingMessages {
    pub fn new() -> Self {
        Self {
            send_tip: 1,
            max_outstanding_size: 1,
            packets: VecDeque::new(),
        }
    }

    pub fn send_tip(&self) -> u64 {
        self.send_tip
    }

    pub fn next_sequence(&self) -> u64 {
        self.send_tip + self.packets.len() as u64
    }

    /// Window size for compact sequence encoding
    pub fn seq_window(&self) -> u64 {
        self.max_outstanding_size + 1
    }

    /// Appends a request to the window, assigning it the next sequence
    pub fn push_request(&mut self, request: SendRequestHdl, tail_probe: bool) -> u64 {
        let seq = self.next_sequence();
        self.packets.push_back(if tail_probe {
            OutstandingState::PendingTailProbe { request }
        } else {
            OutstandingState::Pending { request }
        });
        self.max_outstanding_size = self.max_outstanding_size.max(self.packets.len() as u64);
        seq
    }

    fn get(&self, seq: u64) -> Option<&OutstandingState> {
        let index = seq.checked_sub(self.send_tip)?;
        self.packets.get(index as usize)
    }

    fn get_mut(&mut self, seq: u64) -> Option<&mut OutstandingState> {
        let index = seq.checked_sub(self.send_tip)?;
        self.packets.get_mut(index as usize)
    }

    /// Takes the request out of a pending entry so the formatter can fill
    /// its bytes. Returns `None` when the sequence was finalized before the
    /// link got around to it.
    pub fn begin_generate(&mut self, seq: u64) -> Option<SendRequestHdl> {
        let entry = self.get_mut(seq)?;
        match core::mem::replace(entry, OutstandingState::Generating) {
            OutstandingState::Pending { request }
            | OutstandingState::PendingTailProbe { request } => Some(request),
            other => {
                *entry = other;
                None
            }
        }
    }

    /// Registers the packet the formatter produced
    pub fn finish_generate(
        &mut self,
        seq: u64,
        request: SendRequestHdl,
        first_unknown_sequence_at_send: u64,
        bbr_packet: bbr::SentPacket,
        bdp_data: bdp::PerPacketData,
    ) {
        let entry = self.get_mut(seq).expect("window cannot shrink while generating");
        debug_assert!(matches!(entry, OutstandingState::Generating));
        *entry = OutstandingState::Sent {
            request,
            first_unknown_sequence_at_send,
            bbr_packet,
            bdp_data,
        };
    }

    /// Finalizes a sequence whose bytes could not be produced
    pub fn abort_generate(&mut self, seq: u64) {
        let entry = self.get_mut(seq).expect("window cannot shrink while generating");
        debug_assert!(matches!(entry, OutstandingState::Generating));
        *entry = OutstandingState::Nacked;
    }

    /// Checks an incoming ack frame against the window before any state
    /// changes
    pub fn validate_ack(&self, frame: &AckFrame) -> Result<(), AckError> {
        if frame.ack_to_seq() < self.send_tip {
            // stale acks are valid no-ops
            return Ok(());
        }
        if frame.ack_to_seq() >= self.next_sequence() {
            return Err(AckError::AckPastSent);
        }
        for nack in frame.nack_seqs() {
            if nack < self.send_tip {
                continue;
            }
            if matches!(self.get(nack), Some(OutstandingState::Acked)) {
                return Err(AckError::NackOfAcked);
            }
        }
        for seq in self.send_tip..=frame.ack_to_seq() {
            if self.get(seq).map_or(true, OutstandingState::is_unsent) {
                return Err(AckError::UnsentSequence);
            }
        }
        Ok(())
    }

    /// The receive-window tip recorded when `seq` went out, if it is still
    /// in the `Sent` state
    pub fn first_unknown_at_send(&self, seq: u64) -> Option<u64> {
        match self.get(seq) {
            Some(OutstandingState::Sent {
                first_unknown_sequence_at_send,
                ..
            }) => Some(*first_unknown_sequence_at_send),
            _ => None,
        }
    }

    /// Transitions a sent entry to `Acked`, handing back everything needed
    /// to complete it
    pub fn take_for_ack(
        &mut self,
        seq: u64,
    ) -> Option<(SendRequestHdl, bbr::SentPacket, bdp::PerPacketData)> {
        let entry = self.get_mut(seq)?;
        if !matches!(entry, OutstandingState::Sent { .. }) {
            return None;
        }
        match core::mem::replace(entry, OutstandingState::Acked) {
            OutstandingState::Sent {
                request,
                bbr_packet,
                bdp_data,
                ..
            } => Some((request, bbr_packet, bdp_data)),
            _ => unreachable!(),
        }
    }

    /// Transitions an entry to `Nacked`. An `Acked` entry can never be
    /// nacked; a conforming peer is rejected earlier by `validate_ack`, so
    /// hitting one here is a bug.
    pub fn take_for_nack(&mut self, seq: u64) -> NackOutcome {
        let Some(entry) = self.get_mut(seq) else {
            return NackOutcome::None;
        };
        match core::mem::replace(entry, OutstandingState::Nacked) {
            OutstandingState::Pending { request }
            | OutstandingState::PendingTailProbe { request } => NackOutcome::Unsent(request),
            OutstandingState::Sent {
                request,
                bbr_packet,
                ..
            } => NackOutcome::Sent(request, bbr_packet),
            OutstandingState::Nacked => NackOutcome::None,
            OutstandingState::Generating => {
                panic!("sequence nacked while its bytes were being generated")
            }
            OutstandingState::Acked => {
                panic!("previously acked packet became nacked")
            }
        }
    }

    /// Forgets terminal entries at the front of the window
    pub fn shrink(&mut self) {
        while self.packets.front().map_or(false, OutstandingState::is_terminal) {
            self.packets.pop_front();
            self.send_tip += 1;
        }
    }

    /// When the earliest unacknowledged send would be declared lost
    pub fn retransmit_deadline(&self, delay: Duration) -> Option<Timestamp> {
        for entry in &self.packets {
            if let OutstandingState::Sent { bbr_packet, .. } = entry {
                return Some(bbr_packet.send_time + delay);
            }
        }
        None
    }

    /// Sequences sent at or before `nack_before`, in ascending order. Stops
    /// at the first packet that has not reached the wire.
    pub fn sent_due(&self, nack_before: Timestamp) -> Vec<u64> {
        let mut due = Vec::new();
        for (index, entry) in self.packets.iter().enumerate() {
            match entry {
                OutstandingState::Sent { bbr_packet, .. } => {
                    if bbr_packet.send_time > nack_before {
                        break;
                    }
                    due.push(self.send_tip + index as u64);
                }
                OutstandingState::Acked | OutstandingState::Nacked => {}
                _ => break,
            }
        }
        due
    }

    /// True while any sent packet still awaits its fate
    pub fn has_live_sent(&self) -> bool {
        self.packets
            .iter()
            .any(|entry| matches!(entry, OutstandingState::Sent { .. }))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.packets.len()
    }
}
