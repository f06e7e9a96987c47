// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Implements Kathleen Nichols' algorithm for tracking the minimum (or
//! maximum) estimate of a stream of samples over some fixed interval.
//!
//! The filter keeps the best, second best, and third best estimates,
//! maintaining the invariant that the measurement time of the n'th best is
//! at least that of the (n-1)'th best. A new best sample replaces all three
//! estimates. When the best expires it is replaced by the second best, which
//! in turn is replaced by the third best, bounding the worst-case error when
//! the true extremum moves monotonically across the window.

use core::marker::PhantomData;

/// Decides whether a new sample displaces a current estimate
pub trait Filter<V> {
    fn supersedes(new: &V, current: &V) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MaxFilter;

#[derive(Clone, Copy, Debug, Default)]
pub struct MinFilter;

impl<V: PartialOrd> Filter<V> for MaxFilter {
    #[inline]
    fn supersedes(new: &V, current: &V) -> bool {
        new >= current
    }
}

impl<V: PartialOrd> Filter<V> for MinFilter {
    #[inline]
    fn supersedes(new: &V, current: &V) -> bool {
        new <= current
    }
}

/// Window lengths need quartering and halving for the sub-window refresh
/// rules
pub trait WindowLength: Copy + PartialOrd {
    fn half(self) -> Self;
    fn quarter(self) -> Self;
}

impl WindowLength for core::time::Duration {
    #[inline]
    fn half(self) -> Self {
        self / 2
    }

    #[inline]
    fn quarter(self) -> Self {
        self / 4
    }
}

impl WindowLength for u64 {
    #[inline]
    fn half(self) -> Self {
        self / 2
    }

    #[inline]
    fn quarter(self) -> Self {
        self / 4
    }
}

#[derive(Clone, Copy, Debug)]
struct Sample<T, V> {
    time: T,
    value: V,
}

/// Tracks the windowed extremum of a sample stream over `window`
#[derive(Clone, Debug)]
pub struct WindowedFilter<T, V, D, F> {
    window: D,
    estimates: Option<[Sample<T, V>; 3]>,
    filter: PhantomData<F>,
}

/// Filter that maintains the maximum value seen over the window
pub type WindowedMaxFilter<T, V, D> = WindowedFilter<T, V, D, MaxFilter>;
/// Filter that maintains the minimum value seen over the window
pub type WindowedMinFilter<T, V, D> = WindowedFilter<T, V, D, MinFilter>;

impl<T, V, D, F> WindowedFilter<T, V, D, F>
where
    T: Copy + core::ops::Sub<Output = D>,
    V: Copy + PartialEq,
    D: WindowLength,
    F: Filter<V>,
{
    pub fn new(window: D) -> Self {
        Self {
            window,
            estimates: None,
            filter: PhantomData,
        }
    }

    pub fn best_estimate(&self) -> Option<V> {
        self.estimates.as_ref().map(|e| e[0].value)
    }

    pub fn second_best_estimate(&self) -> Option<V> {
        self.estimates.as_ref().map(|e| e[1].value)
    }

    pub fn third_best_estimate(&self) -> Option<V> {
        self.estimates.as_ref().map(|e| e[2].value)
    }

    /// Replaces all three estimates with the given sample
    pub fn reset(&mut self, time: T, value: V) {
        let sample = Sample { time, value };
        self.estimates = Some([sample, sample, sample]);
    }

    pub fn update(&mut self, time: T, value: V) {
        let window = self.window;
        match &mut self.estimates {
            // Reset on the first sample, a new extremum, or when the newest
            // recorded estimate has aged out entirely.
            Some(estimates)
                if !F::supersedes(&value, &estimates[0].value)
                    && !(time - estimates[2].time > window) =>
            {
                let sample = Sample { time, value };

                if F::supersedes(&value, &estimates[1].value) {
                    estimates[1] = sample;
                    estimates[2] = sample;
                } else if F::supersedes(&value, &estimates[2].value) {
                    estimates[2] = sample;
                }

                if time - estimates[0].time > window {
                    // The best estimate aged out: promote the others and take
                    // the new sample as third best. The promoted best may
                    // itself be stale, so rotate at most once more.
                    estimates[0] = estimates[1];
                    estimates[1] = estimates[2];
                    estimates[2] = sample;
                    if time - estimates[0].time > window {
                        estimates[0] = estimates[1];
                        estimates[1] = estimates[2];
                    }
                    return;
                }

                if estimates[1].value == estimates[0].value
                    && time - estimates[1].time > window.quarter()
                {
                    // A quarter window without a better sample: refresh the
                    // second best from the second quarter.
                    estimates[1] = sample;
                    estimates[2] = sample;
                    return;
                }

                if estimates[2].value == estimates[1].value
                    && time - estimates[2].time > window.half()
                {
                    estimates[2] = sample;
                }
            }
            _ => self.reset(time, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;
    use core::time::Duration;

    #[test]
    fn empty_filter_has_no_estimate() {
        let filter: WindowedMinFilter<u64, u64, u64> = WindowedFilter::new(10);
        assert_eq!(filter.best_estimate(), None);
    }

    #[test]
    fn new_best_resets_all_estimates() {
        let mut filter: WindowedMaxFilter<u64, u64, u64> = WindowedFilter::new(10);
        filter.update(0, 5);
        // a quarter window with no better sample refreshes the second best
        filter.update(3, 4);
        assert_eq!(filter.best_estimate(), Some(5));
        assert_eq!(filter.second_best_estimate(), Some(4));
        filter.update(5, 9);
        assert_eq!(filter.best_estimate(), Some(9));
        assert_eq!(filter.second_best_estimate(), Some(9));
        assert_eq!(filter.third_best_estimate(), Some(9));
    }

    #[test]
    fn best_expires_and_promotes() {
        let mut filter: WindowedMaxFilter<u64, u64, u64> = WindowedFilter::new(10);
        filter.update(0, 9);
        filter.update(4, 7);
        assert_eq!(filter.best_estimate(), Some(9));
        assert_eq!(filter.second_best_estimate(), Some(7));
        // The best was recorded at 0 and the window is 10: this sample ages
        // it out and promotes the second best.
        filter.update(11, 1);
        assert_eq!(filter.best_estimate(), Some(7));
        assert_eq!(filter.second_best_estimate(), Some(7));
        assert_eq!(filter.third_best_estimate(), Some(1));
    }

    #[test]
    fn whole_window_stale_resets() {
        let mut filter: WindowedMaxFilter<u64, u64, u64> = WindowedFilter::new(10);
        filter.update(0, 9);
        filter.update(20, 1);
        assert_eq!(filter.best_estimate(), Some(1));
        assert_eq!(filter.third_best_estimate(), Some(1));
    }

    #[test]
    fn quarter_window_refreshes_second_best() {
        let mut filter: WindowedMaxFilter<u64, u64, u64> = WindowedFilter::new(100);
        filter.update(0, 9);
        // second == best and a quarter of the window has passed
        filter.update(30, 4);
        assert_eq!(filter.best_estimate(), Some(9));
        assert_eq!(filter.second_best_estimate(), Some(4));
        assert_eq!(filter.third_best_estimate(), Some(4));
        // third == second and half of the window has passed
        filter.update(90, 2);
        assert_eq!(filter.second_best_estimate(), Some(4));
        assert_eq!(filter.third_best_estimate(), Some(2));
    }

    #[test]
    fn min_filter_over_durations() {
        let mut filter: WindowedMinFilter<Timestamp, Duration, Duration> =
            WindowedFilter::new(Duration::from_secs(10));
        let start = Timestamp::from_micros(0);
        filter.update(start, Duration::from_millis(30));
        filter.update(start + Duration::from_secs(1), Duration::from_millis(20));
        filter.update(start + Duration::from_secs(2), Duration::from_millis(25));
        assert_eq!(filter.best_estimate(), Some(Duration::from_millis(20)));
    }
}
