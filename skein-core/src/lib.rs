// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Vocabulary and wire types for the skein packet transport: timestamps,
//! transfer rates, windowed filters, varints, compact sequence numbers, ack
//! frames, and the payload codec seam.

#![forbid(unsafe_code)]

pub mod bandwidth;
pub mod codec;
pub mod frame;
pub mod random;
pub mod seq;
pub mod time;
pub mod varint;
pub mod windowed_filter;
