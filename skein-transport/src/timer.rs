// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The timer collaborator: a monotonic clock plus one-shot scheduled
//! callbacks.
//!
//! A scheduled callback is invoked exactly once: with [`TimerStatus::Fired`]
//! at or after its deadline, or with [`TimerStatus::Cancelled`] when its
//! [`Timeout`] handle is dropped first. Everything runs on the one
//! cooperative executor; implementations must not invoke callbacks from
//! other threads.

use skein_core::time::Timestamp;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerStatus {
    Fired,
    Cancelled,
}

impl TimerStatus {
    #[inline]
    pub fn is_cancelled(self) -> bool {
        matches!(self, TimerStatus::Cancelled)
    }
}

pub type TimerCallback = Box<dyn FnOnce(TimerStatus)>;

pub trait Timer {
    /// The current instant on the monotonic clock
    fn now(&self) -> Timestamp;

    /// Schedules `callback` to fire at `deadline`
    fn schedule(&self, deadline: Timestamp, callback: TimerCallback) -> Timeout;
}

/// Handle to a scheduled callback. Dropping the handle cancels the callback,
/// invoking it with [`TimerStatus::Cancelled`] if it has not already fired.
pub struct Timeout {
    cancel: Option<Box<dyn FnOnce() -> Option<TimerCallback>>>,
}

impl Timeout {
    /// Builds a timeout from a cancel hook: the hook unregisters the pending
    /// callback and returns it, or `None` if it already fired.
    pub fn new(cancel: Box<dyn FnOnce() -> Option<TimerCallback>>) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }

    pub fn cancel(self) {
        // the drop impl does the work
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            if let Some(callback) = cancel() {
                callback(TimerStatus::Cancelled);
            }
        }
    }
}

impl core::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Timeout").finish_non_exhaustive()
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use core::time::Duration;
    use std::{
        cell::RefCell,
        collections::BTreeMap,
        rc::{Rc, Weak},
    };

    /// A manually advanced timer for deterministic tests.
    ///
    /// Callbacks fire in deadline order (insertion order within one instant)
    /// when the clock is advanced past them.
    #[derive(Clone, Default)]
    pub struct MockTimer {
        inner: Rc<RefCell<Inner>>,
    }

    #[derive(Default)]
    struct Inner {
        now: Timestamp,
        next_id: u64,
        pending: BTreeMap<(Timestamp, u64), TimerCallback>,
    }

    impl MockTimer {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of callbacks waiting to fire
        pub fn pending_count(&self) -> usize {
            self.inner.borrow().pending.len()
        }

        /// Earliest pending deadline
        pub fn next_deadline(&self) -> Option<Timestamp> {
            self.inner.borrow().pending.keys().next().map(|(at, _)| *at)
        }

        /// Moves the clock to `deadline`, firing everything due on the way
        pub fn advance_to(&self, deadline: Timestamp) {
            loop {
                let due = {
                    let mut inner = self.inner.borrow_mut();
                    if deadline >= inner.now {
                        // fire in order: only step the clock up to each
                        // callback as it runs
                        match inner.pending.keys().next().copied() {
                            Some((at, id)) if at <= deadline => {
                                inner.now = inner.now.max(at);
                                inner.pending.remove(&(at, id))
                            }
                            _ => {
                                inner.now = deadline;
                                None
                            }
                        }
                    } else {
                        None
                    }
                };
                match due {
                    // invoked without the borrow held: callbacks may
                    // reschedule or cancel freely
                    Some(callback) => callback(TimerStatus::Fired),
                    None => return,
                }
            }
        }

        pub fn advance_by(&self, duration: Duration) {
            let deadline = self.now() + duration;
            self.advance_to(deadline);
        }

        /// Fires everything currently due without moving the clock
        pub fn poll(&self) {
            let now = self.now();
            self.advance_to(now);
        }
    }

    impl Timer for MockTimer {
        fn now(&self) -> Timestamp {
            self.inner.borrow().now
        }

        fn schedule(&self, deadline: Timestamp, callback: TimerCallback) -> Timeout {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_id;
            inner.next_id += 1;
            // a deadline in the past still waits for the next advance/poll
            let key = (deadline.max(inner.now), id);
            inner.pending.insert(key, callback);

            let weak: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
            Timeout::new(Box::new(move || {
                let inner = weak.upgrade()?;
                let mut inner = inner.borrow_mut();
                inner.pending.remove(&key)
            }))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn fires_in_deadline_order() {
            let timer = MockTimer::new();
            let fired = Rc::new(RefCell::new(Vec::new()));
            for (at, tag) in [(30u64, 'c'), (10, 'a'), (20, 'b')] {
                let fired = fired.clone();
                let timeout = timer.schedule(
                    Timestamp::from_micros(at),
                    Box::new(move |status| {
                        assert_eq!(status, TimerStatus::Fired);
                        fired.borrow_mut().push(tag);
                    }),
                );
                // keep the timeout alive for the duration of the test
                std::mem::forget(timeout);
            }
            timer.advance_to(Timestamp::from_micros(25));
            assert_eq!(*fired.borrow(), vec!['a', 'b']);
            assert_eq!(timer.pending_count(), 1);
        }

        #[test]
        fn drop_cancels() {
            let timer = MockTimer::new();
            let status = Rc::new(RefCell::new(None));
            let seen = status.clone();
            let timeout = timer.schedule(
                Timestamp::from_micros(10),
                Box::new(move |s| *seen.borrow_mut() = Some(s)),
            );
            drop(timeout);
            assert_eq!(*status.borrow(), Some(TimerStatus::Cancelled));
            assert_eq!(timer.pending_count(), 0);
            // advancing afterwards fires nothing
            timer.advance_to(Timestamp::from_micros(20));
            assert_eq!(*status.borrow(), Some(TimerStatus::Cancelled));
        }

        #[test]
        fn dropping_after_fire_is_inert() {
            let timer = MockTimer::new();
            let count = Rc::new(RefCell::new(0));
            let seen = count.clone();
            let timeout = timer.schedule(
                Timestamp::from_micros(5),
                Box::new(move |_| *seen.borrow_mut() += 1),
            );
            timer.advance_to(Timestamp::from_micros(5));
            assert_eq!(*count.borrow(), 1);
            drop(timeout);
            assert_eq!(*count.borrow(), 1, "the callback fires exactly once");
        }
    }
}
