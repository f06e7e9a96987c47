// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transfer rates and the rational gain factors the congestion controller
//! applies to them. All arithmetic is integer-exact at bits-per-second
//! granularity.

use core::time::Duration;
use num_rational::Ratio;
use num_traits::Inv;

const MICRO_BITS_PER_BYTE: u64 = 8 * 1_000_000;

/// A transfer rate
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Bandwidth {
    bits_per_second: u64,
}

impl Bandwidth {
    pub const ZERO: Self = Self { bits_per_second: 0 };

    pub const MAX: Self = Self {
        bits_per_second: u64::MAX,
    };

    #[inline]
    pub const fn from_bits_per_second(bits_per_second: u64) -> Self {
        Self { bits_per_second }
    }

    #[inline]
    pub const fn from_kilobits_per_second(kilobits_per_second: u64) -> Self {
        Self {
            bits_per_second: kilobits_per_second * 1000,
        }
    }

    #[inline]
    pub const fn bits_per_second(self) -> u64 {
        self.bits_per_second
    }

    /// The rate that moves `bytes` over `interval`
    #[inline]
    pub const fn bytes_per_time(bytes: u64, interval: Duration) -> Self {
        if interval.is_zero() {
            return Self::ZERO;
        }
        let micros = interval.as_micros() as u64;
        // Prefer multiplying up to bits first to keep resolution
        let bits_per_second = match bytes.checked_mul(MICRO_BITS_PER_BYTE) {
            Some(micro_bits) => micro_bits / micros,
            None => (bytes / micros).saturating_mul(MICRO_BITS_PER_BYTE),
        };
        Self { bits_per_second }
    }

    /// How many bytes this rate moves over `interval`
    #[inline]
    pub fn bytes_sent_for_time(self, interval: Duration) -> u64 {
        let micros = interval.as_micros() as u64;
        match self.bits_per_second.checked_mul(micros) {
            Some(micro_bits) => micro_bits / MICRO_BITS_PER_BYTE,
            None => (self.bits_per_second / MICRO_BITS_PER_BYTE).saturating_mul(micros),
        }
    }

    /// How long this rate takes to move `bytes`
    ///
    /// A zero rate takes forever: callers pace against a non-zero floor.
    #[inline]
    pub fn send_time_for_bytes(self, bytes: u64) -> Duration {
        if self.bits_per_second == 0 {
            return Duration::MAX;
        }
        let micros =
            (bytes as u128 * MICRO_BITS_PER_BYTE as u128) / self.bits_per_second as u128;
        Duration::from_micros(micros.min(u64::MAX as u128) as u64)
    }
}

/// A rational gain factor. Multiplication floors, matching the exactness of
/// the bandwidth representation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Gain(Ratio<u64>);

impl Gain {
    /// 2/ln(2), the startup gain
    pub const HIGH: Self = Self(Ratio::new_raw(2885, 1000));

    pub const UNIT: Self = Self(Ratio::new_raw(1, 1));

    #[inline]
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self(Ratio::new_raw(numerator, denominator))
    }

    #[inline]
    pub fn reciprocal(self) -> Self {
        Self(self.0.inv())
    }

    #[inline]
    pub fn is_one(self) -> bool {
        self.0.numer() == self.0.denom()
    }

    #[inline]
    pub fn is_greater_than_one(self) -> bool {
        self.0.numer() > self.0.denom()
    }
}

impl core::ops::Mul<u64> for Gain {
    type Output = u64;

    #[inline]
    fn mul(self, bytes: u64) -> u64 {
        let scaled = *self.0.numer() as u128 * bytes as u128 / *self.0.denom() as u128;
        scaled.min(u64::MAX as u128) as u64
    }
}

impl core::ops::Mul<Bandwidth> for Gain {
    type Output = Bandwidth;

    #[inline]
    fn mul(self, rate: Bandwidth) -> Bandwidth {
        Bandwidth::from_bits_per_second(self * rate.bits_per_second())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_time_is_exact() {
        let rate = Bandwidth::bytes_per_time(1500, Duration::from_millis(1));
        assert_eq!(rate.bits_per_second(), 12_000_000);
        assert_eq!(rate.bytes_sent_for_time(Duration::from_millis(1)), 1500);
        assert_eq!(rate.send_time_for_bytes(1500), Duration::from_millis(1));
    }

    #[test]
    fn zero_interval_and_zero_rate() {
        assert_eq!(Bandwidth::bytes_per_time(1000, Duration::ZERO), Bandwidth::ZERO);
        assert_eq!(Bandwidth::ZERO.send_time_for_bytes(1), Duration::MAX);
        assert_eq!(Bandwidth::ZERO.bytes_sent_for_time(Duration::from_secs(10)), 0);
    }

    #[test]
    fn gain_math() {
        assert_eq!(Gain::HIGH * 1000u64, 2885);
        assert_eq!(Gain::new(5, 4) * 1000u64, 1250);
        assert_eq!(Gain::new(3, 4) * 1001u64, 750);
        assert!(Gain::new(5, 4).is_greater_than_one());
        assert!(!Gain::new(3, 4).is_greater_than_one());
        assert!(Gain::UNIT.is_one());
        assert_eq!(Gain::HIGH.reciprocal() * 2885u64, 1000);
    }

    #[test]
    fn gain_scales_bandwidth() {
        let rate = Bandwidth::from_kilobits_per_second(1200);
        assert_eq!((Gain::new(5, 4) * rate).bits_per_second(), 1_500_000);
        assert_eq!((Gain::UNIT * rate).bits_per_second(), 1_200_000);
    }
}
