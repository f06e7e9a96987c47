// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Unsigned little-endian base-128 variable-length integers: seven value
//! bits per byte, continuation bit set on every byte except the last.

use s2n_codec::{DecoderBuffer, DecoderBufferResult, DecoderError, Encoder};

/// Maximum number of bytes a `u64` can occupy
pub const MAX_SIZE: usize = 10;

/// Number of bytes needed to encode `value`
#[inline]
pub const fn size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    if bits <= 7 {
        1
    } else {
        (bits + 6) / 7
    }
}

/// Encodes `value` into the front of `buf`, returning the written prefix
#[inline]
pub fn write(mut value: u64, buf: &mut [u8; MAX_SIZE]) -> &[u8] {
    let mut index = 0;
    loop {
        if value < 0x80 {
            buf[index] = value as u8;
            index += 1;
            return &buf[..index];
        }
        buf[index] = (value as u8 & 0x7f) | 0x80;
        value >>= 7;
        index += 1;
    }
}

#[inline]
pub fn encode<E: Encoder>(value: u64, encoder: &mut E) {
    let mut buf = [0u8; MAX_SIZE];
    encoder.write_slice(write(value, &mut buf));
}

#[inline]
pub fn decode(mut buffer: DecoderBuffer) -> DecoderBufferResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (byte, remaining) = buffer.decode::<u8>()?;
        buffer = remaining;
        let group = (byte & 0x7f) as u64;
        if shift == 63 && group > 1 {
            return Err(DecoderError::InvariantViolation("varint overflows u64"));
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Ok((value, buffer));
        }
        shift += 7;
        if shift > 63 {
            return Err(DecoderError::InvariantViolation("varint overflows u64"));
        }
    }
}

/// Largest length `L` such that a varint prefix encoding `L` followed by `L`
/// bytes still fits in `capacity`
#[inline]
pub fn max_length_with_prefix(capacity: u64) -> u64 {
    let mut length = capacity.saturating_sub(1);
    while length > 0 && length + size(length) as u64 > capacity {
        length -= 1;
    }
    length
}

#[cfg(test)]
mod tests {
    use super::*;
    use s2n_codec::{Encoder as _, EncoderBuffer};

    fn roundtrip(value: u64) -> (usize, Vec<u8>) {
        let mut bytes = vec![0u8; MAX_SIZE];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encode(value, &mut encoder);
        let len = encoder.len();
        bytes.truncate(len);
        let (decoded, remaining) = decode(DecoderBuffer::new(&bytes)).unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded, value);
        (len, bytes)
    }

    #[test]
    fn boundaries() {
        assert_eq!(roundtrip(0).0, 1);
        assert_eq!(roundtrip(127).0, 1);
        assert_eq!(roundtrip(128).0, 2);
        assert_eq!(roundtrip(16_383).0, 2);
        assert_eq!(roundtrip(16_384).0, 3);
        assert_eq!(roundtrip(u64::MAX).0, MAX_SIZE);
        assert_eq!(roundtrip(300).1, vec![0b1010_1100, 0b0000_0010]);
    }

    #[test]
    fn size_matches_encoding() {
        for value in [0, 1, 127, 128, 300, 16_383, 16_384, u64::MAX / 2, u64::MAX] {
            assert_eq!(size(value), roundtrip(value).0);
        }
    }

    #[test]
    fn overflow_is_rejected() {
        // 10 continuation groups push past 64 bits
        let bytes = [0xff; 11];
        assert!(decode(DecoderBuffer::new(&bytes)).is_err());
        // the tenth byte may only contribute a single bit
        let mut bytes = [0xff; 10];
        bytes[9] = 0x02;
        assert!(decode(DecoderBuffer::new(&bytes)).is_err());
        bytes[9] = 0x01;
        assert_eq!(decode(DecoderBuffer::new(&bytes)).unwrap().0, u64::MAX);
    }

    #[test]
    fn truncated_input() {
        let bytes = [0x80u8];
        assert!(decode(DecoderBuffer::new(&bytes)).is_err());
    }

    #[test]
    fn length_with_prefix() {
        // 1 byte of prefix leaves the rest for payload
        assert_eq!(max_length_with_prefix(100), 99);
        // around the 127/128 boundary the prefix grows to two bytes
        assert_eq!(max_length_with_prefix(128), 127);
        assert_eq!(max_length_with_prefix(129), 127);
        assert_eq!(max_length_with_prefix(130), 128);
        assert_eq!(max_length_with_prefix(0), 0);
        assert_eq!(max_length_with_prefix(1), 0);
    }

    #[test]
    fn checked_roundtrip() {
        bolero::check!().with_type::<u64>().cloned().for_each(|value| {
            roundtrip(value);
        });
    }
}
