// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Orders outgoing messages and owns the timers that keep the link moving:
//! the pacing timeout for the next departure and the tail-loss probe that
//! elicits an ack when the queue runs dry.

use super::{AckSendRequest, SendRequestHdl};
use crate::timer::Timeout;
use skein_core::time::Timestamp;
use std::collections::VecDeque;

#[derive(Debug)]
pub(super) struct SendQueue {
    requests: VecDeque<SendRequestHdl>,
    /// A transmit reservation is outstanding (possibly waiting on pacing)
    scheduled: bool,
    /// An ack-only send was demanded even though the queue is empty
    forced_ack: bool,
    last_send_was_tail_probe: bool,
    pacing_timeout: Option<Timeout>,
    tail_probe: Option<(Timestamp, Timeout)>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            scheduled: false,
            forced_ack: false,
            last_send_was_tail_probe: false,
            pacing_timeout: None,
            tail_probe: None,
        }
    }

    /// Enqueues a request. Returns true when the queue needs scheduling.
    pub fn add(&mut self, request: SendRequestHdl) -> bool {
        // real traffic supersedes any planned probe
        self.tail_probe = None;
        self.requests.push_back(request);
        !self.scheduled
    }

    pub fn scheduled(&self) -> bool {
        self.scheduled
    }

    pub fn set_scheduled(&mut self) {
        debug_assert!(!self.scheduled);
        self.scheduled = true;
    }

    pub fn has_work(&self) -> bool {
        !self.requests.is_empty() || self.forced_ack
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn force_ack(&mut self) {
        self.forced_ack = true;
    }

    /// Dequeues the next request, synthesizing the canonical ack-only send
    /// when the queue has drained
    pub fn take_next(&mut self) -> (SendRequestHdl, bool) {
        self.forced_ack = false;
        match self.requests.pop_front() {
            Some(request) => {
                self.last_send_was_tail_probe = false;
                (request, false)
            }
            None => {
                self.last_send_was_tail_probe = true;
                (SendRequestHdl::new(Box::new(AckSendRequest)), true)
            }
        }
    }

    /// The in-flight dispatch resolved (sent or cancelled)
    pub fn finish_dispatch(&mut self) {
        debug_assert!(self.scheduled);
        self.scheduled = false;
    }

    pub fn last_send_was_tail_probe(&self) -> bool {
        self.last_send_was_tail_probe
    }

    pub fn set_pacing_timeout(&mut self, timeout: Timeout) {
        self.pacing_timeout = Some(timeout);
    }

    pub fn clear_pacing_timeout(&mut self) {
        // a fired timeout is inert; dropping a live one cancels it
        let _ = self.pacing_timeout.take();
    }

    pub fn tail_probe_deadline(&self) -> Option<Timestamp> {
        self.tail_probe.as_ref().map(|(when, _)| *when)
    }

    pub fn set_tail_probe(&mut self, when: Timestamp, timeout: Timeout) {
        self.tail_probe = Some((when, timeout));
    }

    pub fn clear_tail_probe(&mut self) {
        self.tail_probe = None;
    }
}
