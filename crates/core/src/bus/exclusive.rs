// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use vp_config::AddressRange;

/// Tracks load-exclusive reservations, at most one per initiator.
#[derive(Debug, Default)]
pub struct ExclusiveMonitor {
    reservations: Vec<Option<AddressRange>>,
}

impl ExclusiveMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, initiator: usize, range: AddressRange) {
        if self.reservations.len() <= initiator {
            self.reservations.resize(initiator + 1, None);
        }
        self.reservations[initiator] = Some(range);
    }

    pub fn holds(&self, initiator: usize, range: &AddressRange) -> bool {
        matches!(
            self.reservations.get(initiator),
            Some(Some(r)) if r.start <= range.start && range.end <= r.end
        )
    }

    /// Drops every reservation touching `range`, whoever owns it.
    pub fn clear_overlapping(&mut self, range: &AddressRange) {
        for slot in &mut self.reservations {
            if matches!(slot, Some(r) if r.overlaps(range)) {
                *slot = None;
            }
        }
    }

    pub fn clear(&mut self, initiator: usize) {
        if let Some(slot) = self.reservations.get_mut(initiator) {
            *slot = None;
        }
    }

    pub fn reservation(&self, initiator: usize) -> Option<AddressRange> {
        self.reservations.get(initiator).copied().flatten()
    }

    /// True while any initiator holds a reservation.
    pub fn is_active(&self) -> bool {
        self.reservations.iter().any(Option::is_some)
    }
}
