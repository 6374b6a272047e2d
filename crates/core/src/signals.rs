// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::SimTime;
use serde::Serialize;

/// A core interrupt input as seen by the fabric: its current level plus
/// how often and for how long it has been asserted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InterruptLine {
    level: bool,
    #[serde(skip)]
    asserted_since: Option<SimTime>,
    asserts: u64,
    total_asserted: SimTime,
    max_asserted: SimTime,
}

impl InterruptLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> bool {
        self.level
    }

    /// Records a level change at `now`. Returns false when the level did not change.
    pub fn set(&mut self, level: bool, now: SimTime) -> bool {
        if level == self.level {
            return false;
        }
        self.level = level;
        if level {
            self.asserts += 1;
            self.asserted_since = Some(now);
        } else if let Some(since) = self.asserted_since.take() {
            self.account(now - since);
        }
        true
    }

    fn account(&mut self, span: SimTime) {
        self.total_asserted += span;
        self.max_asserted = self.max_asserted.max(span);
    }

    pub fn asserts(&self) -> u64 {
        self.asserts
    }

    /// Total asserted time, counting a still-asserted line up to `now`.
    pub fn total_asserted(&self, now: SimTime) -> SimTime {
        self.total_asserted + self.open_span(now)
    }

    pub fn max_asserted(&self, now: SimTime) -> SimTime {
        self.max_asserted.max(self.open_span(now))
    }

    pub fn avg_asserted(&self, now: SimTime) -> SimTime {
        if self.asserts == 0 {
            return SimTime::ZERO;
        }
        SimTime::from_ps(self.total_asserted(now).as_ps() / self.asserts)
    }

    fn open_span(&self, now: SimTime) -> SimTime {
        self.asserted_since
            .map(|since| now - since)
            .unwrap_or(SimTime::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_line_levels() {
        let mut irq = InterruptLine::new();
        assert!(!irq.level());
        assert!(irq.set(true, SimTime::from_us(1)));
        assert!(irq.level());
        assert!(!irq.set(true, SimTime::from_us(2)), "no change");
        assert!(irq.set(false, SimTime::from_us(4)));
        assert!(!irq.level());
    }

    #[test]
    fn test_asserted_time_statistics() {
        let mut irq = InterruptLine::new();
        irq.set(true, SimTime::from_us(0));
        irq.set(false, SimTime::from_us(3));
        irq.set(true, SimTime::from_us(10));
        irq.set(false, SimTime::from_us(11));

        let now = SimTime::from_us(20);
        assert_eq!(irq.asserts(), 2);
        assert_eq!(irq.total_asserted(now), SimTime::from_us(4));
        assert_eq!(irq.avg_asserted(now), SimTime::from_us(2));
        assert_eq!(irq.max_asserted(now), SimTime::from_us(3));

        // A line still high counts up to `now`.
        irq.set(true, SimTime::from_us(20));
        assert_eq!(irq.max_asserted(SimTime::from_us(30)), SimTime::from_us(10));
    }
}
