// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use serde::Serialize;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;
use std::time::Duration;

const PS_PER_NS: u64 = 1_000;
const PS_PER_US: u64 = 1_000_000;
const PS_PER_MS: u64 = 1_000_000_000;
const PS_PER_S: u64 = 1_000_000_000_000;

/// Simulated time in picoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);
    pub const MAX: SimTime = SimTime(u64::MAX);

    pub const fn from_ps(ps: u64) -> Self {
        SimTime(ps)
    }

    pub const fn from_ns(ns: u64) -> Self {
        SimTime(ns.saturating_mul(PS_PER_NS))
    }

    pub const fn from_us(us: u64) -> Self {
        SimTime(us.saturating_mul(PS_PER_US))
    }

    pub const fn from_ms(ms: u64) -> Self {
        SimTime(ms.saturating_mul(PS_PER_MS))
    }

    pub const fn from_secs(s: u64) -> Self {
        SimTime(s.saturating_mul(PS_PER_S))
    }

    pub const fn as_ps(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / PS_PER_S as f64
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Number of whole cycles of a `hz` clock in this interval, rounded to nearest.
    pub fn cycles_at(self, hz: u64) -> u64 {
        let c = (self.0 as u128 * hz as u128 + (PS_PER_S as u128 / 2)) / PS_PER_S as u128;
        c.min(u64::MAX as u128) as u64
    }

    /// Duration of `cycles` periods of a `hz` clock, rounded to nearest.
    pub fn from_cycles(cycles: u64, hz: u64) -> Self {
        if hz == 0 {
            return SimTime::ZERO;
        }
        let ps = (cycles as u128 * PS_PER_S as u128 + hz as u128 / 2) / hz as u128;
        SimTime(ps.min(u64::MAX as u128) as u64)
    }

    pub fn saturating_sub(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl From<Duration> for SimTime {
    fn from(d: Duration) -> Self {
        let ps = d.as_nanos().saturating_mul(PS_PER_NS as u128);
        SimTime(ps.min(u64::MAX as u128) as u64)
    }
}

impl From<SimTime> for Duration {
    fn from(t: SimTime) -> Self {
        Duration::from_nanos(t.0 / PS_PER_NS)
    }
}

impl Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for SimTime {
    fn add_assign(&mut self, rhs: SimTime) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: SimTime) -> SimTime {
        self.saturating_sub(rhs)
    }
}

impl FromStr for SimTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        vp_config::parse_time_ps(s).map(SimTime)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ps = self.0;
        if ps == 0 {
            write!(f, "0 s")
        } else if ps % PS_PER_S == 0 {
            write!(f, "{} s", ps / PS_PER_S)
        } else if ps % PS_PER_MS == 0 {
            write!(f, "{} ms", ps / PS_PER_MS)
        } else if ps % PS_PER_US == 0 {
            write!(f, "{} us", ps / PS_PER_US)
        } else if ps % PS_PER_NS == 0 {
            write!(f, "{} ns", ps / PS_PER_NS)
        } else {
            write!(f, "{} ps", ps)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycles_round_to_nearest() {
        // 10ns at 100MHz is exactly one cycle.
        assert_eq!(SimTime::from_ns(10).cycles_at(100_000_000), 1);
        // 14ns rounds down, 15ns rounds up.
        assert_eq!(SimTime::from_ns(14).cycles_at(100_000_000), 1);
        assert_eq!(SimTime::from_ns(15).cycles_at(100_000_000), 2);
        assert_eq!(SimTime::from_us(1).cycles_at(100_000_000), 100);
        assert_eq!(SimTime::ZERO.cycles_at(100_000_000), 0);
    }

    #[test]
    fn test_from_cycles() {
        assert_eq!(SimTime::from_cycles(100, 100_000_000), SimTime::from_us(1));
        assert_eq!(SimTime::from_cycles(1, 3), SimTime::from_ps(333_333_333_333));
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("1us".parse::<SimTime>().unwrap(), SimTime::from_us(1));
        assert_eq!("2.5ms".parse::<SimTime>().unwrap(), SimTime::from_us(2500));
        assert_eq!("10ns".parse::<SimTime>().unwrap(), SimTime::from_ns(10));
        assert_eq!("1".parse::<SimTime>().unwrap(), SimTime::from_secs(1));
        assert!("1 fortnight".parse::<SimTime>().is_err());
        assert_eq!(SimTime::from_us(3).to_string(), "3 us");
        assert_eq!(SimTime::from_ps(1500).to_string(), "1500 ps");
    }

    #[test]
    fn test_duration_conversion() {
        let t: SimTime = Duration::from_micros(5).into();
        assert_eq!(t, SimTime::from_us(5));
        let d: Duration = SimTime::from_ms(2).into();
        assert_eq!(d, Duration::from_millis(2));
    }
}
