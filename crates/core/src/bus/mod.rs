// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod exclusive;

use crate::memory::MemoryHandle;
use crate::{Peripheral, SimResult, SimTime, SimulationError};
use bitflags::bitflags;
use exclusive::ExclusiveMonitor;
use std::fmt;
use vp_config::AddressRange;

bitflags! {
    /// Side-band attributes carried with a bus operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BusFlags: u8 {
        const DEBUG = 1 << 0;
        const EXCL = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Ok,
    AddressError,
    CommandError,
    GenericError,
}

impl BusStatus {
    pub fn is_ok(self) -> bool {
        self == BusStatus::Ok
    }
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BusStatus::Ok => "OK",
            BusStatus::AddressError => "ADDRESS_ERROR",
            BusStatus::CommandError => "COMMAND_ERROR",
            BusStatus::GenericError => "GENERIC_ERROR",
        };
        f.write_str(s)
    }
}

/// Outcome of one bus operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusResponse {
    pub status: BusStatus,
    /// Bytes actually transferred.
    pub bytes: usize,
    pub latency: SimTime,
}

impl BusResponse {
    fn error(status: BusStatus) -> Self {
        Self {
            status,
            bytes: 0,
            latency: SimTime::ZERO,
        }
    }
}

pub struct BusMapping {
    pub name: String,
    pub range: AddressRange,
    pub read_latency: SimTime,
    pub write_latency: SimTime,
    pub dev: Box<dyn Peripheral>,
}

/// Direct-access grant for a RAM-backed mapping.
#[derive(Debug, Clone)]
pub struct DmiGrant {
    pub range: AddressRange,
    pub memory: MemoryHandle,
    pub generation: u64,
    pub read_latency: SimTime,
    pub write_latency: SimTime,
}

/// Shared address-routed interconnect.
///
/// Every map, remap or unmap bumps `generation`; direct-access windows
/// stamped with an older generation must no longer be used.
#[derive(Default)]
pub struct SystemBus {
    mappings: Vec<BusMapping>,
    generation: u64,
    monitor: ExclusiveMonitor,
}

impl SystemBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `dev` at `range`, returning its device index.
    pub fn map(
        &mut self,
        name: &str,
        range: AddressRange,
        dev: Box<dyn Peripheral>,
        read_latency: SimTime,
        write_latency: SimTime,
    ) -> SimResult<usize> {
        if let Some(other) = self.mappings.iter().find(|m| m.range.overlaps(&range)) {
            return Err(SimulationError::Topology(format!(
                "mapping '{}' {} overlaps '{}' {}",
                name, range, other.name, other.range
            )));
        }
        if self.mappings.iter().any(|m| m.name == name) {
            return Err(SimulationError::Topology(format!(
                "a device named '{}' is already mapped",
                name
            )));
        }
        tracing::debug!("Mapping {} at {}", name, range);
        self.mappings.push(BusMapping {
            name: name.to_string(),
            range,
            read_latency,
            write_latency,
            dev,
        });
        self.generation += 1;
        Ok(self.mappings.len() - 1)
    }

    /// Moves an existing mapping. Outstanding direct-access grants go stale.
    pub fn remap(&mut self, name: &str, range: AddressRange) -> SimResult<()> {
        let index = self
            .index_of(name)
            .ok_or_else(|| SimulationError::Topology(format!("no device named '{}'", name)))?;
        if let Some(other) = self
            .mappings
            .iter()
            .enumerate()
            .find(|(i, m)| *i != index && m.range.overlaps(&range))
        {
            return Err(SimulationError::Topology(format!(
                "remapping '{}' to {} overlaps '{}'",
                name, range, other.1.name
            )));
        }
        let old = self.mappings[index].range;
        self.mappings[index].range = range;
        self.monitor.clear_overlapping(&old);
        self.generation += 1;
        tracing::debug!("Remapped {} from {} to {}", name, old, range);
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, grant_generation: u64) -> bool {
        grant_generation == self.generation
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.mappings.iter().position(|m| m.name == name)
    }

    pub fn mappings(&self) -> impl Iterator<Item = &BusMapping> {
        self.mappings.iter()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn device(&self, index: usize) -> Option<&dyn Peripheral> {
        self.mappings.get(index).map(|m| m.dev.as_ref())
    }

    pub fn device_mut(&mut self, index: usize) -> Option<&mut (dyn Peripheral + 'static)> {
        self.mappings.get_mut(index).map(|m| m.dev.as_mut())
    }

    /// Downcasts the device named `name` to its concrete type.
    pub fn device_as<T: 'static>(&self, name: &str) -> Option<&T> {
        let index = self.index_of(name)?;
        self.mappings[index].dev.as_any()?.downcast_ref::<T>()
    }

    pub fn device_as_mut<T: 'static>(&mut self, name: &str) -> Option<&mut T> {
        let index = self.index_of(name)?;
        self.mappings[index].dev.as_any_mut()?.downcast_mut::<T>()
    }

    pub fn monitor(&self) -> &ExclusiveMonitor {
        &self.monitor
    }

    /// Finds the mapping covering all of `[addr, addr + len)`.
    fn route(&self, addr: u64, len: usize) -> Option<usize> {
        self.mappings
            .iter()
            .position(|m| m.range.contains_span(addr, len as u64))
    }

    pub fn read(
        &mut self,
        initiator: usize,
        addr: u64,
        data: &mut [u8],
        flags: BusFlags,
    ) -> BusResponse {
        let Some(index) = self.route(addr, data.len()) else {
            return BusResponse::error(BusStatus::AddressError);
        };
        let m = &mut self.mappings[index];
        let offset = addr - m.range.start;
        let res = if flags.contains(BusFlags::DEBUG) {
            m.dev.peek(offset, data)
        } else {
            m.dev.read(offset, data)
        };
        if let Err(e) = res {
            tracing::trace!("{} refused read at {:#x}: {}", m.name, addr, e);
            return BusResponse::error(BusStatus::CommandError);
        }
        let latency = m.read_latency;
        if flags.contains(BusFlags::EXCL) && !flags.contains(BusFlags::DEBUG) {
            if let Some(range) = AddressRange::with_size(addr, data.len() as u64) {
                self.monitor.reserve(initiator, range);
            }
        }
        BusResponse {
            status: BusStatus::Ok,
            bytes: data.len(),
            latency,
        }
    }

    pub fn write(
        &mut self,
        initiator: usize,
        addr: u64,
        data: &[u8],
        flags: BusFlags,
    ) -> BusResponse {
        let Some(index) = self.route(addr, data.len()) else {
            return BusResponse::error(BusStatus::AddressError);
        };
        let debug = flags.contains(BusFlags::DEBUG);
        let range = AddressRange::with_size(addr, data.len().max(1) as u64)
            .unwrap_or(AddressRange::new(addr, addr));

        if flags.contains(BusFlags::EXCL) && !debug {
            if !self.monitor.holds(initiator, &range) {
                // Lost reservation: nothing is written.
                self.monitor.clear(initiator);
                return BusResponse {
                    status: BusStatus::Ok,
                    bytes: 0,
                    latency: self.mappings[index].write_latency,
                };
            }
        }

        let m = &mut self.mappings[index];
        let offset = addr - m.range.start;
        if let Err(e) = m.dev.write(offset, data) {
            tracing::trace!("{} refused write at {:#x}: {}", m.name, addr, e);
            return BusResponse::error(BusStatus::CommandError);
        }
        let latency = m.write_latency;
        if !debug {
            self.monitor.clear_overlapping(&range);
        }
        BusResponse {
            status: BusStatus::Ok,
            bytes: data.len(),
            latency,
        }
    }

    /// Offers a direct-access grant for the mapping containing `addr`.
    /// Only devices with a RAM backing store grant one.
    pub fn dmi(&self, addr: u64) -> Option<DmiGrant> {
        let m = self.mappings.iter().find(|m| m.range.contains(addr))?;
        let memory = m.dev.direct_memory()?;
        Some(DmiGrant {
            range: m.range,
            memory,
            generation: self.generation,
            read_latency: m.read_latency,
            write_latency: m.write_latency,
        })
    }

    pub fn tick(&mut self, now: SimTime) {
        for m in &mut self.mappings {
            m.dev.tick(now);
        }
    }

    pub fn reset(&mut self) {
        for m in &mut self.mappings {
            m.dev.reset();
        }
        self.monitor = ExclusiveMonitor::new();
    }

    pub fn irq_level(&self, device: usize, output: usize) -> bool {
        self.mappings
            .get(device)
            .map(|m| m.dev.irq_level(output))
            .unwrap_or(false)
    }

    /// Writes `data` through the debug path, e.g. for image loading.
    pub fn load(&mut self, addr: u64, data: &[u8]) -> SimResult<()> {
        let resp = self.write(usize::MAX, addr, data, BusFlags::DEBUG);
        if resp.status.is_ok() {
            Ok(())
        } else {
            Err(SimulationError::UnmappedAddress(addr))
        }
    }
}
