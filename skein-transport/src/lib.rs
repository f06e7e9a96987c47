// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The skein reliable packet transport: an ordered, reliable, pacing
//! controlled stream of datagrams over an unreliable link.
//!
//! Two subsystems make up the transport: the BBR congestion controller in
//! [`recovery`], which decides when and how many bytes may be in flight, and
//! the sliding-window packet protocol in [`protocol`], which assigns
//! sequence numbers, bundles piggyback acks, drives retransmission, and
//! reports per-message completion.
//!
//! Everything runs on one cooperative executor: timer callbacks, link
//! callbacks and ack processing all happen on the caller's thread, and no
//! locks exist anywhere in the core.

#![forbid(unsafe_code)]

pub mod bdp;
pub mod protocol;
pub mod recovery;
pub mod stats;
pub mod timer;
