// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rolling counters describing link behavior, readable through
//! [`crate::protocol::PacketProtocol::stats`].

#[derive(Clone, Debug, Default)]
pub struct LinkStats {
    /// Packets handed to the link
    pub outgoing_packet_count: u64,
    /// Datagrams fed into `process`
    pub incoming_packet_count: u64,
    /// Outgoing packets that carried an ack frame
    pub acks_sent: u64,
    /// Incoming packets with no payload
    pub pure_acks_received: u64,
    /// Ack-only sends forced by a drained send queue
    pub tail_loss_probes: u64,
    /// Sends abandoned by the retransmission timer
    pub retransmit_expiries: u64,
}
