// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The ack frame: a receiver's commitment that every sequence at or below
//! `ack_to_seq` was either received or is explicitly nacked.
//!
//! Wire format, all varints: `ack_to_seq`, `ack_delay_us`, then a gap list.
//! Each gap subtracts from the previous nack (starting at `ack_to_seq`), so
//! the nack list is strictly descending. The first gap may be zero:
//! `ack_to_seq` itself can be nacked when the newest packet failed
//! processing. The list runs to the end of the frame; the byte length is
//! carried outside the frame.

use crate::varint;
use s2n_codec::{DecoderBuffer, DecoderError, Encoder, EncoderBuffer};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckFrame {
    ack_to_seq: u64,
    ack_delay_us: u64,
    /// strictly descending, each strictly below `ack_to_seq`
    nack_seqs: Vec<u64>,
    partial: bool,
}

impl AckFrame {
    pub fn new(ack_to_seq: u64, ack_delay_us: u64) -> Self {
        debug_assert!(ack_to_seq >= 1);
        Self {
            ack_to_seq,
            ack_delay_us,
            nack_seqs: Vec::new(),
            partial: false,
        }
    }

    #[inline]
    pub fn ack_to_seq(&self) -> u64 {
        self.ack_to_seq
    }

    #[inline]
    pub fn ack_delay_us(&self) -> u64 {
        self.ack_delay_us
    }

    /// True if the nack list was truncated to fit a size bound. Local only,
    /// never on the wire.
    #[inline]
    pub fn partial(&self) -> bool {
        self.partial
    }

    /// Nacked sequences, oldest first
    pub fn nack_seqs(&self) -> impl Iterator<Item = u64> + '_ {
        self.nack_seqs.iter().rev().copied()
    }

    pub fn has_nacks(&self) -> bool {
        !self.nack_seqs.is_empty()
    }

    /// Nacks must be added in descending order; only the first may equal
    /// `ack_to_seq`
    pub fn add_nack(&mut self, seq: u64) {
        debug_assert!(seq >= 1);
        debug_assert!(seq <= self.ack_to_seq);
        debug_assert!(self.nack_seqs.last().map_or(true, |last| seq < *last));
        self.nack_seqs.push(seq);
    }

    pub fn wire_length(&self) -> usize {
        let mut length = varint::size(self.ack_to_seq) + varint::size(self.ack_delay_us);
        let mut previous = self.ack_to_seq;
        for &nack in &self.nack_seqs {
            length += varint::size(previous - nack);
            previous = nack;
        }
        length
    }

    /// Shrinks the frame to fit `max_length` bytes by dropping the largest
    /// nacks and retreating `ack_to_seq` below them. `packet_delay` reports
    /// the delay for the retreated ack target.
    ///
    /// Retreating (rather than dropping the oldest nacks) keeps the
    /// commitment sound: every sequence at or below the new `ack_to_seq` is
    /// still either received or listed.
    pub fn adjust_for_mss<F: Fn(u64) -> u64>(&mut self, max_length: usize, packet_delay: F) {
        while self.wire_length() > max_length && !self.nack_seqs.is_empty() {
            self.partial = true;
            let removed = self.nack_seqs.remove(0);
            // a frame holding a single nack always fits any plausible bound
            debug_assert!(removed >= 2, "cannot retreat below the first sequence");
            self.ack_to_seq = removed - 1;
            self.ack_delay_us = packet_delay(self.ack_to_seq);
        }
    }

    pub fn encode<E: Encoder>(&self, encoder: &mut E) {
        varint::encode(self.ack_to_seq, encoder);
        varint::encode(self.ack_delay_us, encoder);
        let mut previous = self.ack_to_seq;
        for &nack in &self.nack_seqs {
            varint::encode(previous - nack, encoder);
            previous = nack;
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.wire_length()];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        self.encode(&mut encoder);
        bytes
    }

    /// Parses a frame occupying exactly `buffer`
    pub fn decode(buffer: DecoderBuffer) -> Result<Self, DecoderError> {
        let (ack_to_seq, buffer) = varint::decode(buffer)?;
        if ack_to_seq == 0 {
            return Err(DecoderError::InvariantViolation(
                "ack-to sequence must be positive",
            ));
        }
        let (ack_delay_us, mut buffer) = varint::decode(buffer)?;
        let mut frame = Self::new(ack_to_seq, ack_delay_us);
        let mut previous = ack_to_seq;
        let mut first = true;
        while !buffer.is_empty() {
            let (gap, remaining) = varint::decode(buffer)?;
            buffer = remaining;
            let nack = match previous.checked_sub(gap) {
                Some(nack) if (gap >= 1 || first) && nack >= 1 => nack,
                _ => return Err(DecoderError::InvariantViolation("invalid nack gap")),
            };
            first = false;
            frame.nack_seqs.push(nack);
            previous = nack;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Result<AckFrame, DecoderError> {
        AckFrame::decode(DecoderBuffer::new(bytes))
    }

    #[test]
    fn roundtrip() {
        let mut frame = AckFrame::new(10, 250);
        frame.add_nack(8);
        frame.add_nack(7);
        frame.add_nack(3);
        let bytes = frame.encode_to_vec();
        assert_eq!(bytes.len(), frame.wire_length());
        assert_eq!(bytes, vec![10, 250, 1, 2, 1, 4]);
        assert_eq!(decode(&bytes).unwrap(), frame);
        assert_eq!(
            frame.nack_seqs().collect::<Vec<_>>(),
            vec![3, 7, 8],
            "nacks iterate oldest first"
        );
    }

    #[test]
    fn ack_only_roundtrip() {
        let frame = AckFrame::new(1, 0);
        let bytes = frame.encode_to_vec();
        assert_eq!(bytes, vec![1, 0]);
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn rejects_malformed() {
        // zero ack-to
        assert!(decode(&[0, 0]).is_err());
        // zero gap past the first entry
        assert!(decode(&[10, 0, 1, 0]).is_err());
        // gap walking below sequence one
        assert!(decode(&[10, 0, 10]).is_err());
        // truncated varint
        assert!(decode(&[0x80]).is_err());
    }

    #[test]
    fn newest_sequence_can_be_nacked() {
        let mut frame = AckFrame::new(5, 80);
        frame.add_nack(5);
        frame.add_nack(3);
        let bytes = frame.encode_to_vec();
        assert_eq!(bytes, vec![5, 80, 0, 2]);
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn truncation_retreats_ack_to() {
        let mut frame = AckFrame::new(100, 3);
        for seq in [99, 98, 50, 40] {
            frame.add_nack(seq);
        }
        let full = frame.wire_length();
        frame.adjust_for_mss(full - 1, |_| 7);
        // 99 is dropped and the ack target retreats below it; 98 remains as
        // the zero-gap first nack
        assert!(frame.partial());
        assert_eq!(frame.ack_to_seq(), 98);
        assert_eq!(frame.ack_delay_us(), 7);
        assert_eq!(frame.nack_seqs().collect::<Vec<_>>(), vec![40, 50, 98]);
        assert!(frame.wire_length() < full);
    }

    #[test]
    fn truncated_wire_is_a_valid_prefix() {
        let mut frame = AckFrame::new(1000, 9);
        for seq in (2..=500).rev() {
            frame.add_nack(seq);
        }
        frame.adjust_for_mss(64, |_| 9);
        let bytes = frame.encode_to_vec();
        assert!(bytes.len() <= 64);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.ack_to_seq(), frame.ack_to_seq());
        assert_eq!(
            decoded.nack_seqs().collect::<Vec<_>>(),
            frame.nack_seqs().collect::<Vec<_>>()
        );
        // partial stays local
        assert!(frame.partial());
        assert!(!decoded.partial());
    }

    #[test]
    fn fits_without_truncation_is_untouched() {
        let mut frame = AckFrame::new(20, 1);
        frame.add_nack(5);
        let before = frame.clone();
        frame.adjust_for_mss(frame.wire_length(), |_| unreachable!());
        assert_eq!(frame, before);
        assert!(!frame.partial());
    }
}
