// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compact wire encoding for packet sequence numbers.
//!
//! Only the low bits of a sequence travel on the wire. The sender picks a
//! width from its outstanding window so that the receiver, reconstructing
//! against its own window base, is always less than half the representable
//! range away from the true value and can pick the nearest representative.

use core::fmt;
use s2n_codec::{DecoderBuffer, DecoderBufferResult, Encoder};

/// Value bits carried by each wire length: the top two bits of the first
/// byte encode the length, the rest is payload.
const BITS: [u32; 4] = [6, 14, 22, 30];

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct SeqNum {
    bytes: [u8; 4],
}

impl SeqNum {
    pub const MAX_WIRE_LENGTH: usize = 4;

    /// Encodes `seq` with enough low bits to be reconstructed against any
    /// window base at most `window` away
    pub fn new(seq: u64, window: u64) -> Self {
        let width = BITS
            .iter()
            .position(|bits| window < 1u64 << (bits - 1))
            .expect("sequence window too large to represent");
        let mut bytes = [0u8; 4];
        bytes[0] = ((width as u8) << 6) | (seq & 0x3f) as u8;
        for (index, byte) in bytes.iter_mut().enumerate().take(width + 1).skip(1) {
            *byte = (seq >> (8 * index - 2)) as u8;
        }
        Self { bytes }
    }

    #[inline]
    pub fn wire_length(self) -> usize {
        (self.bytes[0] >> 6) as usize + 1
    }

    #[inline]
    fn bits(self) -> u32 {
        BITS[(self.bytes[0] >> 6) as usize]
    }

    fn low_bits(self) -> u64 {
        let mut value = (self.bytes[0] & 0x3f) as u64;
        for index in 1..self.wire_length() {
            value |= (self.bytes[index] as u64) << (8 * index - 2);
        }
        value
    }

    /// Recovers the absolute sequence: the representative of the encoded low
    /// bits closest to `window_base`
    pub fn reconstruct(self, window_base: u64) -> u64 {
        let win = 1u64 << self.bits();
        let half = win >> 1;
        let mask = win - 1;
        let candidate = (window_base & !mask) | self.low_bits();
        if window_base >= half && candidate <= window_base - half {
            candidate + win
        } else if candidate > window_base.saturating_add(half) && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }

    pub fn encode<E: Encoder>(self, encoder: &mut E) {
        encoder.write_slice(&self.bytes[..self.wire_length()]);
    }

    pub fn decode(buffer: DecoderBuffer) -> DecoderBufferResult<SeqNum> {
        let (first, buffer) = buffer.decode::<u8>()?;
        let length = (first >> 6) as usize;
        let (tail, buffer) = buffer.decode_slice(length)?;
        let mut bytes = [0u8; 4];
        bytes[0] = first;
        bytes[1..=length].copy_from_slice(tail.into_less_safe_slice());
        Ok((Self { bytes }, buffer))
    }
}

impl fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SeqNum(low_bits={}, bits={})",
            self.low_bits(),
            self.bits()
        )
    }
}
