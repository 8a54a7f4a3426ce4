// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Time types for the datapath core.
//!
//! The core never reads a system clock itself; every entry point takes a
//! [`Timestamp`] produced by the driver's [`Clock`]. This keeps the whole
//! datapath deterministic under test.

use core::{fmt, ops, time::Duration};

/// An absolute point in time.
///
/// The absolute value of `Timestamp`s should be treated as opaque. It is not
/// related to any calendar time and is only meaningful relative to the
/// `Clock` that produced it.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a `Timestamp` from a `Duration` since the clock's epoch
    #[inline]
    pub fn from_duration(duration: Duration) -> Self {
        Self(duration.as_micros() as u64)
    }

    /// Converts the `Timestamp` into the `Duration` since the clock's epoch
    #[inline]
    pub fn as_duration(self) -> Duration {
        Duration::from_micros(self.0)
    }

    /// Returns the `Duration` which elapsed since an earlier `Timestamp`.
    /// If `earlier` is more recent, returns a `Duration` of 0.
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// Returns true if the timestamp is not after `current_time`
    #[inline]
    pub fn has_elapsed(self, current_time: Self) -> bool {
        self <= current_time
    }

    /// Milliseconds since the clock's epoch
    #[inline]
    pub fn as_millis(self) -> u64 {
        self.0 / 1_000
    }

    /// The free-running 16 bit millisecond timestamp carried in the wire
    /// header
    #[inline]
    pub fn wire16(self) -> u16 {
        self.as_millis() as u16
    }
}

/// Difference between two 16 bit wire timestamps, reinterpreted as
/// milliseconds. The subtraction is modular so a wrapped `then` still yields
/// the elapsed time as long as less than ~65 seconds passed.
#[inline]
pub fn wire16_diff(now: u16, then: u16) -> u16 {
    now.wrapping_sub(then)
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let duration = self.as_duration();
        write!(
            f,
            "Timestamp({}.{:06})",
            duration.as_secs(),
            duration.subsec_micros()
        )
    }
}

impl ops::Add<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs.as_micros() as u64)
    }
}

impl ops::AddAssign<Duration> for Timestamp {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl ops::Sub<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Duration) -> Self {
        Self(self.0.saturating_sub(rhs.as_micros() as u64))
    }
}

impl ops::Sub for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Self) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

/// A `Clock` is a source of [`Timestamp`]s.
pub trait Clock {
    /// Returns the current [`Timestamp`]
    fn get_time(&self) -> Timestamp;
}

/// A clock which always returns a Timestamp of value 1us
#[derive(Clone, Copy, Debug)]
pub struct NoopClock;

impl Clock for NoopClock {
    fn get_time(&self) -> Timestamp {
        Timestamp::from_duration(Duration::from_micros(1))
    }
}

mod std_clock {
    use super::*;
    use std::time::Instant;

    /// A clock based on `std::time::Instant`, anchored at its creation time
    #[derive(Clone, Copy, Debug)]
    pub struct StdClock {
        epoch: Instant,
    }

    impl Default for StdClock {
        fn default() -> Self {
            Self {
                epoch: Instant::now(),
            }
        }
    }

    impl Clock for StdClock {
        fn get_time(&self) -> Timestamp {
            Timestamp::from_duration(self.epoch.elapsed())
        }
    }
}

pub use std_clock::StdClock;
