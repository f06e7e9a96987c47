// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Estimates the bandwidth-delay product of the path from the receive side:
//! how many bytes arrived between sending a packet and having it
//! acknowledged bounds the amount of data the pipe held over that round
//! trip.

use skein_core::windowed_filter::WindowedMaxFilter;

/// Sequences seen per filter window
const WINDOW: u64 = 1024;

/// Receive-side snapshot taken when one of our packets is sent
#[derive(Clone, Copy, Debug)]
pub struct PerPacketData {
    seq: u64,
    bytes_received_at_send: u64,
}

#[derive(Clone, Debug)]
pub struct BdpEstimator {
    bytes_received: u64,
    filter: WindowedMaxFilter<u64, u64, u64>,
}

impl Default for BdpEstimator {
    fn default() -> Self {
        Self {
            bytes_received: 0,
            filter: WindowedMaxFilter::new(WINDOW),
        }
    }
}

impl BdpEstimator {
    pub fn received_bytes(&mut self, count: u64) {
        self.bytes_received += count;
    }

    pub fn sent_packet(&mut self, seq: u64) -> PerPacketData {
        PerPacketData {
            seq,
            bytes_received_at_send: self.bytes_received,
        }
    }

    pub fn ack_packet(&mut self, data: PerPacketData) {
        self.filter
            .update(data.seq, self.bytes_received - data.bytes_received_at_send);
    }

    pub fn estimate(&self) -> u64 {
        self.filter.best_estimate().unwrap_or(0)
    }
}
