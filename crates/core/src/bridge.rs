// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Per-core transaction bridge.
//!
//! Turns an engine's memory request into a bus operation, converts the bus
//! latency into core cycles and caches direct-access windows for the
//! engine's fast path.

use crate::bus::{BusFlags, SystemBus};
use crate::engine::CpuContext;
use crate::memory::MemoryHandle;
use crate::SimTime;
use serde::Serialize;
use std::fmt;
use vp_config::AddressRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemorySpace {
    Instruction,
    Data,
}

impl MemorySpace {
    fn slot(self) -> usize {
        match self {
            MemorySpace::Instruction => 0,
            MemorySpace::Data => 1,
        }
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySpace::Instruction => f.write_str("insn"),
            MemorySpace::Data => f.write_str("data"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// One memory access. Data travels in `data`; `cycles` is filled in by the bridge.
#[derive(Debug)]
pub struct Request<'a> {
    pub addr: u64,
    pub data: &'a mut [u8],
    pub direction: Direction,
    pub space: MemorySpace,
    pub flags: BusFlags,
    pub cycles: u64,
}

impl<'a> Request<'a> {
    pub fn read(space: MemorySpace, addr: u64, data: &'a mut [u8]) -> Self {
        Self {
            addr,
            data,
            direction: Direction::Read,
            space,
            flags: BusFlags::empty(),
            cycles: 0,
        }
    }

    pub fn write(space: MemorySpace, addr: u64, data: &'a mut [u8]) -> Self {
        Self {
            direction: Direction::Write,
            ..Self::read(space, addr, data)
        }
    }

    pub fn with_flags(mut self, flags: BusFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_debug(&self) -> bool {
        self.flags.contains(BusFlags::DEBUG)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Success,
    /// Exclusive access that transferred fewer bytes than requested.
    Failed,
    /// Bus fault.
    Error,
}

/// Cached direct-access grant. Valid only while the bus generation it was
/// stamped with is current.
#[derive(Debug, Clone)]
pub struct DirectAccessWindow {
    pub space: MemorySpace,
    pub range: AddressRange,
    pub generation: u64,
    memory: MemoryHandle,
    read_cycles: u64,
    write_cycles: u64,
}

impl DirectAccessWindow {
    pub fn covers(&self, addr: u64, len: usize) -> bool {
        self.range.contains_span(addr, len as u64)
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        self.covers(addr, buf.len()) && self.memory.read(addr - self.range.start, buf)
    }

    pub fn write(&self, addr: u64, buf: &[u8]) -> bool {
        self.covers(addr, buf.len()) && self.memory.write(addr - self.range.start, buf)
    }

    /// Cycle cost of one access through the window at the core's clock.
    pub fn cycles(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Read => self.read_cycles,
            Direction::Write => self.write_cycles,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BridgeStats {
    pub reads: u64,
    pub writes: u64,
    pub debug_accesses: u64,
    pub exclusive_loads: u64,
    pub exclusive_stores: u64,
    pub exclusive_failed: u64,
    pub bus_errors: u64,
    pub dmi_grants: u64,
}

#[derive(Debug)]
pub struct TransactionBridge {
    core: usize,
    clock_hz: u64,
    dmi_enabled: [bool; 2],
    windows: [Option<DirectAccessWindow>; 2],
    stats: BridgeStats,
}

impl TransactionBridge {
    pub fn new(core: usize, clock_hz: u64, insn_dmi: bool, data_dmi: bool) -> Self {
        Self {
            core,
            clock_hz,
            dmi_enabled: [insn_dmi, data_dmi],
            windows: [None, None],
            stats: BridgeStats::default(),
        }
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn clock_hz(&self) -> u64 {
        self.clock_hz
    }

    /// Window cycle costs are computed at grant time, so a clock change drops them.
    pub fn set_clock(&mut self, hz: u64) {
        if hz != self.clock_hz {
            self.clock_hz = hz;
            self.invalidate_windows();
        }
    }

    pub fn dmi_enabled(&self, space: MemorySpace) -> bool {
        self.dmi_enabled[space.slot()]
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn invalidate_windows(&mut self) {
        self.windows = [None, None];
    }

    /// The installed window for `space` if it is still current and covers the access.
    pub fn window(
        &self,
        space: MemorySpace,
        addr: u64,
        len: usize,
        bus_generation: u64,
    ) -> Option<&DirectAccessWindow> {
        self.windows[space.slot()]
            .as_ref()
            .filter(|w| w.generation == bus_generation && w.covers(addr, len))
    }

    pub fn transact(
        &mut self,
        bus: &mut SystemBus,
        now: SimTime,
        req: &mut Request<'_>,
        ctx: CpuContext,
    ) -> Response {
        let debug = req.is_debug();
        let exclusive = req.flags.contains(BusFlags::EXCL);
        let size = req.size();

        let resp = match req.direction {
            Direction::Read => bus.read(self.core, req.addr, req.data, req.flags),
            Direction::Write => bus.write(self.core, req.addr, req.data, req.flags),
        };
        req.cycles = if debug {
            0
        } else {
            resp.latency.cycles_at(self.clock_hz)
        };

        if debug {
            self.stats.debug_accesses += 1;
        } else if exclusive {
            match req.direction {
                Direction::Read => self.stats.exclusive_loads += 1,
                Direction::Write => self.stats.exclusive_stores += 1,
            }
        }

        if exclusive && resp.bytes < size {
            if !debug {
                self.stats.exclusive_failed += 1;
            }
            return Response::Failed;
        }

        if !resp.status.is_ok() {
            if !debug {
                self.stats.bus_errors += 1;
                tracing::warn!(
                    time = %now,
                    addr = %format!("{:#010x}", req.addr),
                    dir = %req.direction,
                    pc = %format!("{:#010x}", ctx.pc),
                    sp = %format!("{:#010x}", ctx.sp),
                    size,
                    core = self.core,
                    port = %req.space,
                    code = %resp.status,
                    "bus error at {:#010x}: {} of {} bytes by core {} on {} port ({})",
                    req.addr,
                    req.direction,
                    size,
                    self.core,
                    req.space,
                    resp.status
                );
            }
            return Response::Error;
        }

        if !debug {
            match req.direction {
                Direction::Read => self.stats.reads += 1,
                Direction::Write => self.stats.writes += 1,
            }
            self.install_window(bus, req.space, req.addr);
        }
        Response::Success
    }

    fn install_window(&mut self, bus: &SystemBus, space: MemorySpace, addr: u64) {
        let slot = space.slot();
        if !self.dmi_enabled[slot] {
            return;
        }
        if self.windows[slot]
            .as_ref()
            .is_some_and(|w| w.generation == bus.generation() && w.range.contains(addr))
        {
            return;
        }
        let Some(grant) = bus.dmi(addr) else {
            return;
        };
        tracing::debug!(
            "core {}: direct access granted for {} port over {}",
            self.core,
            space,
            grant.range
        );
        self.stats.dmi_grants += 1;
        self.windows[slot] = Some(DirectAccessWindow {
            space,
            range: grant.range,
            generation: grant.generation,
            memory: grant.memory,
            read_cycles: grant.read_latency.cycles_at(self.clock_hz),
            write_cycles: grant.write_latency.cycles_at(self.clock_hz),
        });
    }
}
