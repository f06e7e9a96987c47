// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Decides when the peer needs to hear an ack from us.
//!
//! The sender latches the most urgent outstanding demand and tracks which of
//! our packets carried complete (non-truncated) ack frames. Once such a
//! packet is acknowledged, everything we had to say about the receive window
//! is known to have arrived and further acks are suppressed until new
//! traffic changes the picture.

use super::AckUrgency;

/// What the protocol should do about an urgency change
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum AckSenderAction {
    None,
    /// Arm the delayed-ack timer
    ScheduleSoon,
    /// Force an ack-bearing send now
    ForceImmediate,
}

#[derive(Debug)]
pub(super) struct AckSender {
    /// Sequences of our packets that carried a complete ack frame,
    /// ascending
    sent_full_acks: Vec<u64>,
    all_acks_acknowledged: bool,
    urgency: AckUrgency,
}

impl AckSender {
    pub fn new() -> Self {
        Self {
            sent_full_acks: Vec::new(),
            all_acks_acknowledged: true,
            urgency: AckUrgency::NotRequired,
        }
    }

    /// True when the next outgoing packet should bundle an ack
    pub fn should_send_ack(&self) -> bool {
        !self.all_acks_acknowledged && self.sent_full_acks.is_empty()
    }

    /// Raises the urgency; lower or equal demands are already covered
    pub fn need_ack(&mut self, urgency: AckUrgency) -> AckSenderAction {
        if urgency <= self.urgency {
            return AckSenderAction::None;
        }
        tracing::trace!(?urgency, "need ack");
        self.urgency = urgency;
        self.sent_full_acks.clear();
        self.all_acks_acknowledged = false;
        match urgency {
            AckUrgency::SendBundled => AckSenderAction::None,
            AckUrgency::SendSoon => AckSenderAction::ScheduleSoon,
            AckUrgency::SendImmediately => AckSenderAction::ForceImmediate,
            AckUrgency::NotRequired => unreachable!("gated above"),
        }
    }

    /// Records that our packet `seq` carried an ack frame. Returns true if
    /// the ack was truncated and another should follow soon.
    pub fn ack_sent(&mut self, seq: u64, partial: bool) -> bool {
        debug_assert!(self.sent_full_acks.last().map_or(true, |last| seq > *last));
        self.urgency = AckUrgency::NotRequired;
        if !partial {
            self.sent_full_acks.push(seq);
            false
        } else {
            self.sent_full_acks.is_empty()
        }
    }

    /// One of our packets was lost. If it carried a full ack the peer may
    /// still be waiting to hear from us. Returns true if an ack should be
    /// rescheduled.
    pub fn on_nack(&mut self, seq: u64) -> bool {
        match self.sent_full_acks.binary_search(&seq) {
            Ok(index) => {
                self.sent_full_acks.remove(index);
                self.sent_full_acks.is_empty()
            }
            Err(_) => false,
        }
    }

    /// One of our full-ack packets was acknowledged: the peer knows
    /// everything we did
    pub fn on_ack(&mut self, seq: u64) {
        if self.sent_full_acks.binary_search(&seq).is_ok() {
            self.sent_full_acks.clear();
            self.all_acks_acknowledged = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_until_something_arrives() {
        let sender = AckSender::new();
        assert!(!sender.should_send_ack());
    }

    #[test]
    fn urgency_only_rises() {
        let mut sender = AckSender::new();
        assert_eq!(sender.need_ack(AckUrgency::SendSoon), AckSenderAction::ScheduleSoon);
        assert_eq!(sender.need_ack(AckUrgency::SendSoon), AckSenderAction::None);
        assert_eq!(
            sender.need_ack(AckUrgency::SendImmediately),
            AckSenderAction::ForceImmediate
        );
        assert_eq!(sender.need_ack(AckUrgency::SendBundled), AckSenderAction::None);
    }

    #[test]
    fn full_ack_in_flight_suppresses_more_acks() {
        let mut sender = AckSender::new();
        sender.need_ack(AckUrgency::SendSoon);
        assert!(sender.should_send_ack());
        assert!(!sender.ack_sent(7, false));
        assert!(!sender.should_send_ack(), "a full ack is already in flight");

        // new urgency clears the suppression
        sender.need_ack(AckUrgency::SendSoon);
        assert!(sender.should_send_ack());
    }

    #[test]
    fn acknowledged_full_ack_quiesces() {
        let mut sender = AckSender::new();
        sender.need_ack(AckUrgency::SendSoon);
        sender.ack_sent(7, false);
        sender.on_ack(7);
        assert!(!sender.should_send_ack());
    }

    #[test]
    fn losing_the_only_full_ack_reschedules() {
        let mut sender = AckSender::new();
        sender.need_ack(AckUrgency::SendSoon);
        sender.ack_sent(7, false);
        assert!(sender.on_nack(7), "the peer never heard our ack");
        assert!(!sender.on_nack(9), "unknown sequences are ignored");
    }

    #[test]
    fn partial_ack_wants_a_follow_up() {
        let mut sender = AckSender::new();
        sender.need_ack(AckUrgency::SendImmediately);
        assert!(sender.ack_sent(3, true), "truncated acks reschedule");
        sender.need_ack(AckUrgency::SendSoon);
        assert!(!sender.ack_sent(4, false));
        assert!(!sender.ack_sent(5, true), "a full ack is already in flight");
    }
}
