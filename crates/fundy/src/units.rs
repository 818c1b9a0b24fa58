//! # Unit Types
//!
//! Strongly typed quantities used throughout the controller: absolute
//! [`Timestamp`]s, relative [`TimeDelta`]s, [`DataRate`]s and [`DataSize`]s.
//!
//! All four are `i64` newtypes (microseconds, microseconds, bits/s, bytes)
//! extended with `{-∞, finite, +∞}`. A single infinite operand propagates
//! through addition and subtraction the way the wire encoding expects
//! (`receive_time = +∞` means "lost"); combining two infinities with
//! conflicting sign, or feeding a non-finite operand into a rate × time
//! product, is a bug and asserts in debug builds.
//!
//! Rate × time products go through `i128` intermediates so they cannot
//! overflow the `i64` range.

use serde::Serialize;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

const PLUS_INFINITY: i64 = i64::MAX;
const MINUS_INFINITY: i64 = i64::MIN;

fn sum_with_infinities(lhs: i64, rhs: i64) -> i64 {
    if lhs == PLUS_INFINITY || rhs == PLUS_INFINITY {
        debug_assert!(
            lhs != MINUS_INFINITY && rhs != MINUS_INFINITY,
            "+inf + -inf is undefined"
        );
        PLUS_INFINITY
    } else if lhs == MINUS_INFINITY || rhs == MINUS_INFINITY {
        MINUS_INFINITY
    } else {
        lhs + rhs
    }
}

fn difference_with_infinities(lhs: i64, rhs: i64) -> i64 {
    if rhs == PLUS_INFINITY || rhs == MINUS_INFINITY {
        debug_assert!(lhs != rhs, "inf - inf is undefined");
        if rhs == PLUS_INFINITY {
            MINUS_INFINITY
        } else {
            PLUS_INFINITY
        }
    } else {
        sum_with_infinities(lhs, -rhs)
    }
}

// ─── TimeDelta ──────────────────────────────────────────────────────────────

/// A relative time with microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TimeDelta(i64);

impl TimeDelta {
    pub const fn zero() -> Self {
        TimeDelta(0)
    }

    pub const fn plus_infinity() -> Self {
        TimeDelta(PLUS_INFINITY)
    }

    pub const fn minus_infinity() -> Self {
        TimeDelta(MINUS_INFINITY)
    }

    pub const fn from_micros(us: i64) -> Self {
        TimeDelta(us)
    }

    pub const fn from_millis(ms: i64) -> Self {
        TimeDelta(ms * 1_000)
    }

    pub const fn from_seconds(s: i64) -> Self {
        TimeDelta(s * 1_000_000)
    }

    pub const fn us(self) -> i64 {
        self.0
    }

    /// Whole milliseconds, rounded to nearest.
    pub fn ms(self) -> i64 {
        if !self.is_finite() {
            return self.0;
        }
        let half = if self.0 >= 0 { 500 } else { -500 };
        (self.0 + half) / 1_000
    }

    pub fn ms_f64(self) -> f64 {
        match self.0 {
            PLUS_INFINITY => f64::INFINITY,
            MINUS_INFINITY => f64::NEG_INFINITY,
            us => us as f64 / 1_000.0,
        }
    }

    pub fn seconds_f64(self) -> f64 {
        self.ms_f64() / 1_000.0
    }

    pub const fn is_finite(self) -> bool {
        self.0 != PLUS_INFINITY && self.0 != MINUS_INFINITY
    }

    pub const fn is_infinite(self) -> bool {
        !self.is_finite()
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Default for TimeDelta {
    fn default() -> Self {
        TimeDelta::zero()
    }
}

impl Add for TimeDelta {
    type Output = TimeDelta;
    fn add(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta(sum_with_infinities(self.0, rhs.0))
    }
}

impl AddAssign for TimeDelta {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl Sub for TimeDelta {
    type Output = TimeDelta;
    fn sub(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta(difference_with_infinities(self.0, rhs.0))
    }
}

impl SubAssign for TimeDelta {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        *self = *self - rhs;
    }
}

impl Mul<f64> for TimeDelta {
    type Output = TimeDelta;
    fn mul(self, rhs: f64) -> TimeDelta {
        debug_assert!(self.is_finite(), "scaling a non-finite TimeDelta");
        TimeDelta((self.0 as f64 * rhs).round() as i64)
    }
}

impl Mul<TimeDelta> for f64 {
    type Output = TimeDelta;
    fn mul(self, rhs: TimeDelta) -> TimeDelta {
        rhs * self
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            PLUS_INFINITY => write!(f, "+inf"),
            MINUS_INFINITY => write!(f, "-inf"),
            us => write!(f, "{}ms", us as f64 / 1_000.0),
        }
    }
}

// ─── Timestamp ──────────────────────────────────────────────────────────────

/// An absolute time with microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn plus_infinity() -> Self {
        Timestamp(PLUS_INFINITY)
    }

    pub const fn minus_infinity() -> Self {
        Timestamp(MINUS_INFINITY)
    }

    pub const fn from_micros(us: i64) -> Self {
        Timestamp(us)
    }

    pub const fn from_millis(ms: i64) -> Self {
        Timestamp(ms * 1_000)
    }

    pub const fn from_seconds(s: i64) -> Self {
        Timestamp(s * 1_000_000)
    }

    pub const fn us(self) -> i64 {
        self.0
    }

    /// Whole milliseconds, rounded to nearest.
    pub fn ms(self) -> i64 {
        if !self.is_finite() {
            return self.0;
        }
        let half = if self.0 >= 0 { 500 } else { -500 };
        (self.0 + half) / 1_000
    }

    pub const fn is_finite(self) -> bool {
        self.0 != PLUS_INFINITY && self.0 != MINUS_INFINITY
    }

    pub const fn is_infinite(self) -> bool {
        !self.is_finite()
    }
}

impl Default for Timestamp {
    /// An unset timestamp: minus infinity sorts below every finite time.
    fn default() -> Self {
        Timestamp::minus_infinity()
    }
}

impl Add<TimeDelta> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: TimeDelta) -> Timestamp {
        Timestamp(sum_with_infinities(self.0, rhs.us()))
    }
}

impl Sub<TimeDelta> for Timestamp {
    type Output = Timestamp;
    fn sub(self, rhs: TimeDelta) -> Timestamp {
        Timestamp(difference_with_infinities(self.0, rhs.us()))
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = TimeDelta;
    fn sub(self, rhs: Timestamp) -> TimeDelta {
        TimeDelta::from_micros(difference_with_infinities(self.0, rhs.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            PLUS_INFINITY => write!(f, "+inf"),
            MINUS_INFINITY => write!(f, "-inf"),
            us => write!(f, "{}ms", us as f64 / 1_000.0),
        }
    }
}

// ─── DataRate ───────────────────────────────────────────────────────────────

/// A transfer rate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DataRate(i64);

impl DataRate {
    pub const fn zero() -> Self {
        DataRate(0)
    }

    pub const fn plus_infinity() -> Self {
        DataRate(PLUS_INFINITY)
    }

    pub const fn minus_infinity() -> Self {
        DataRate(MINUS_INFINITY)
    }

    pub const fn from_bps(bps: i64) -> Self {
        DataRate(bps)
    }

    pub const fn from_kbps(kbps: i64) -> Self {
        DataRate(kbps * 1_000)
    }

    pub const fn bps(self) -> i64 {
        self.0
    }

    pub fn bps_f64(self) -> f64 {
        match self.0 {
            PLUS_INFINITY => f64::INFINITY,
            MINUS_INFINITY => f64::NEG_INFINITY,
            bps => bps as f64,
        }
    }

    pub fn kbps(self) -> i64 {
        if !self.is_finite() {
            return self.0;
        }
        (self.0 + 500) / 1_000
    }

    /// The raw value, or `fallback` when non-finite.
    pub fn bps_or(self, fallback: i64) -> i64 {
        if self.is_finite() {
            self.0
        } else {
            fallback
        }
    }

    pub const fn is_finite(self) -> bool {
        self.0 != PLUS_INFINITY && self.0 != MINUS_INFINITY
    }

    pub const fn is_infinite(self) -> bool {
        !self.is_finite()
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Default for DataRate {
    fn default() -> Self {
        DataRate::zero()
    }
}

impl Add for DataRate {
    type Output = DataRate;
    fn add(self, rhs: DataRate) -> DataRate {
        DataRate(sum_with_infinities(self.0, rhs.0))
    }
}

impl Sub for DataRate {
    type Output = DataRate;
    fn sub(self, rhs: DataRate) -> DataRate {
        DataRate(difference_with_infinities(self.0, rhs.0))
    }
}

impl Mul<f64> for DataRate {
    type Output = DataRate;
    fn mul(self, rhs: f64) -> DataRate {
        debug_assert!(self.is_finite(), "scaling a non-finite DataRate");
        DataRate((self.0 as f64 * rhs).round() as i64)
    }
}

impl Mul<DataRate> for f64 {
    type Output = DataRate;
    fn mul(self, rhs: DataRate) -> DataRate {
        rhs * self
    }
}

impl Mul<TimeDelta> for DataRate {
    type Output = DataSize;
    fn mul(self, rhs: TimeDelta) -> DataSize {
        debug_assert!(
            self.is_finite() && rhs.is_finite(),
            "rate x time on non-finite operands"
        );
        let bits_us = self.0 as i128 * rhs.us() as i128;
        DataSize::from_bytes((bits_us / 8_000_000) as i64)
    }
}

impl Mul<DataRate> for TimeDelta {
    type Output = DataSize;
    fn mul(self, rhs: DataRate) -> DataSize {
        rhs * self
    }
}

impl Div<i64> for DataRate {
    type Output = DataRate;
    fn div(self, rhs: i64) -> DataRate {
        debug_assert!(self.is_finite(), "dividing a non-finite DataRate");
        DataRate(self.0 / rhs)
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            PLUS_INFINITY => write!(f, "+inf"),
            MINUS_INFINITY => write!(f, "-inf"),
            bps => write!(f, "{}kbps", bps as f64 / 1_000.0),
        }
    }
}

// ─── DataSize ───────────────────────────────────────────────────────────────

/// An amount of data in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DataSize(i64);

impl DataSize {
    pub const fn zero() -> Self {
        DataSize(0)
    }

    pub const fn from_bytes(bytes: i64) -> Self {
        DataSize(bytes)
    }

    pub const fn bytes(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Default for DataSize {
    fn default() -> Self {
        DataSize::zero()
    }
}

impl Add for DataSize {
    type Output = DataSize;
    fn add(self, rhs: DataSize) -> DataSize {
        DataSize(self.0 + rhs.0)
    }
}

impl Sub for DataSize {
    type Output = DataSize;
    fn sub(self, rhs: DataSize) -> DataSize {
        DataSize(self.0 - rhs.0)
    }
}

impl Div<i64> for DataSize {
    type Output = DataSize;
    fn div(self, rhs: i64) -> DataSize {
        DataSize(self.0 / rhs)
    }
}

impl Div<TimeDelta> for DataSize {
    type Output = DataRate;
    fn div(self, rhs: TimeDelta) -> DataRate {
        debug_assert!(rhs.is_finite() && !rhs.is_zero(), "size / non-finite time");
        let bits_us = self.0 as i128 * 8_000_000;
        DataRate::from_bps((bits_us / rhs.us() as i128) as i64)
    }
}

impl Div<DataRate> for DataSize {
    type Output = TimeDelta;
    fn div(self, rhs: DataRate) -> TimeDelta {
        debug_assert!(rhs.is_finite() && !rhs.is_zero(), "size / non-finite rate");
        let bits_us = self.0 as i128 * 8_000_000;
        TimeDelta::from_micros((bits_us / rhs.bps() as i128) as i64)
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}
