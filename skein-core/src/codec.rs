// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The payload transform applied after packet formatting and before the
//! datagram link, typically an AEAD. The codec is a pluggable seam: the
//! protocol only budgets for its border bytes.

use byteorder::{ByteOrder, LittleEndian};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use core::fmt;

/// Bytes a codec may add around the formatted payload
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Border {
    pub prefix: usize,
    pub suffix: usize,
}

impl Border {
    pub const NONE: Self = Self {
        prefix: 0,
        suffix: 0,
    };

    pub const fn suffix(suffix: usize) -> Self {
        Self { prefix: 0, suffix }
    }

    pub const fn total(self) -> usize {
        self.prefix + self.suffix
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The ciphertext failed authentication or was bound to a different
    /// sequence
    #[error("packet failed authentication for sequence {0}")]
    Authentication(u64),
    #[error("packet shorter than the codec border")]
    TooShort,
}

pub trait Codec {
    fn border(&self) -> Border;

    /// May grow the payload by at most `border().total()` bytes
    fn encode(&self, seq: u64, payload: Vec<u8>) -> Result<Vec<u8>, CodecError>;

    /// Must reject tampered or mis-sequenced payloads
    fn decode(&self, seq: u64, payload: Vec<u8>) -> Result<Vec<u8>, CodecError>;
}

/// Identity codec
#[derive(Clone, Copy, Debug, Default)]
pub struct PlaintextCodec;

impl Codec for PlaintextCodec {
    fn border(&self) -> Border {
        Border::NONE
    }

    fn encode(&self, _seq: u64, payload: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(payload)
    }

    fn decode(&self, _seq: u64, payload: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(payload)
    }
}

/// ChaCha20-Poly1305 codec. The packet sequence seeds the nonce, so replayed
/// or reordered ciphertext fails authentication.
#[derive(Clone)]
pub struct AeadCodec {
    key: [u8; Self::KEY_LENGTH],
    associated_data: Vec<u8>,
}

impl AeadCodec {
    pub const KEY_LENGTH: usize = 32;
    pub const TAG_LENGTH: usize = 16;
    const NONCE_LENGTH: usize = 12;

    pub fn new(key: [u8; Self::KEY_LENGTH], associated_data: &[u8]) -> Self {
        Self {
            key,
            associated_data: associated_data.to_vec(),
        }
    }

    fn nonce(seq: u64) -> [u8; Self::NONCE_LENGTH] {
        let mut bytes = [0u8; Self::NONCE_LENGTH];
        LittleEndian::write_u64(&mut bytes[Self::NONCE_LENGTH - 8..], seq);
        bytes
    }
}

impl Codec for AeadCodec {
    fn border(&self) -> Border {
        Border::suffix(Self::TAG_LENGTH)
    }

    fn encode(&self, seq: u64, payload: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = Self::nonce(seq);
        cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &payload,
                    aad: &self.associated_data,
                },
            )
            .map_err(|_| CodecError::Authentication(seq))
    }

    fn decode(&self, seq: u64, payload: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        if payload.len() < Self::TAG_LENGTH {
            return Err(CodecError::TooShort);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = Self::nonce(seq);
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &payload,
                    aad: &self.associated_data,
                },
            )
            .map_err(|_| CodecError::Authentication(seq))
    }
}

impl fmt::Debug for AeadCodec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // keys stay out of logs
        f.debug_struct("AeadCodec").finish_non_exhaustive()
    }
}
