// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Per-core run state, breakpoints and watchpoints.
//!
//! Breakpoints are persistent: a hit leaves the address armed. Resuming
//! from a breakpoint executes the instruction under it once without
//! re-triggering.

use crate::engine::{CoreEngine, StepResult, NUM_GPRS, REG_NPC, REG_PPC, REG_SR};
use crate::{SimResult, SimulationError};
use serde::Serialize;
use std::collections::BTreeSet;
use vp_config::AddressRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CoreState {
    #[default]
    Running,
    AtBreakpoint,
    AtWatchpoint,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WatchKind {
    Read,
    Write,
    Access,
}

/// A completed access that overlapped a watched range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WatchHit {
    pub addr: u64,
    pub size: usize,
    /// Direction of the access, `Read` or `Write`.
    pub kind: WatchKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEvent {
    BreakpointHit { core: usize, pc: u64 },
    WatchpointHit { core: usize, hit: WatchHit },
    Exit { core: usize, code: u32 },
}

/// Receives debug events from a [`DebugController`]. A controller holds at
/// most one; a GDB session attaches its own for the core it debugs.
pub trait DebugSubscriber: std::fmt::Debug + Send {
    fn on_event(&mut self, event: &DebugEvent);
}

#[derive(Debug)]
pub struct DebugController {
    core: usize,
    addr_limit: u64,
    state: CoreState,
    breakpoints: BTreeSet<u64>,
    read_watch: Vec<AddressRange>,
    write_watch: Vec<AddressRange>,
    skip_once: Option<u64>,
    last_watch: Option<WatchHit>,
    exit_code: Option<u32>,
    subscriber: Option<Box<dyn DebugSubscriber>>,
}

impl DebugController {
    /// `addr_bits` is the core's address width.
    pub fn new(core: usize, addr_bits: u32) -> Self {
        let addr_limit = if addr_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << addr_bits) - 1
        };
        Self {
            core,
            addr_limit,
            state: CoreState::Running,
            breakpoints: BTreeSet::new(),
            read_watch: Vec::new(),
            write_watch: Vec::new(),
            skip_once: None,
            last_watch: None,
            exit_code: None,
            subscriber: None,
        }
    }

    pub fn state(&self) -> CoreState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, CoreState::AtBreakpoint | CoreState::AtWatchpoint)
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    pub fn last_watchpoint(&self) -> Option<WatchHit> {
        self.last_watch
    }

    pub fn attach(&mut self, subscriber: Box<dyn DebugSubscriber>) {
        self.subscriber = Some(subscriber);
    }

    pub fn detach(&mut self) -> Option<Box<dyn DebugSubscriber>> {
        self.subscriber.take()
    }

    fn check_addr(&self, addr: u64) -> SimResult<()> {
        if addr > self.addr_limit {
            return Err(SimulationError::AddressOutOfRange(addr));
        }
        Ok(())
    }

    pub fn insert_breakpoint(&mut self, addr: u64) -> SimResult<()> {
        self.check_addr(addr)?;
        if self.breakpoints.insert(addr) {
            tracing::debug!("core {}: breakpoint set at {:#010x}", self.core, addr);
        }
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, addr: u64) -> SimResult<bool> {
        self.check_addr(addr)?;
        Ok(self.breakpoints.remove(&addr))
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = u64> + '_ {
        self.breakpoints.iter().copied()
    }

    fn watch_range(&self, addr: u64, len: u64) -> SimResult<AddressRange> {
        self.check_addr(addr)?;
        let range = AddressRange::with_size(addr, len.max(1))
            .ok_or(SimulationError::AddressOutOfRange(addr))?;
        self.check_addr(range.end)?;
        Ok(range)
    }

    pub fn insert_watchpoint(&mut self, addr: u64, len: u64, kind: WatchKind) -> SimResult<()> {
        let range = self.watch_range(addr, len)?;
        if matches!(kind, WatchKind::Read | WatchKind::Access) && !self.read_watch.contains(&range) {
            self.read_watch.push(range);
        }
        if matches!(kind, WatchKind::Write | WatchKind::Access) && !self.write_watch.contains(&range) {
            self.write_watch.push(range);
        }
        tracing::debug!("core {}: {:?} watchpoint set on {}", self.core, kind, range);
        Ok(())
    }

    /// Returns whether anything was removed.
    pub fn remove_watchpoint(&mut self, addr: u64, len: u64, kind: WatchKind) -> SimResult<bool> {
        let range = self.watch_range(addr, len)?;
        let mut removed = false;
        if matches!(kind, WatchKind::Read | WatchKind::Access) {
            let before = self.read_watch.len();
            self.read_watch.retain(|r| *r != range);
            removed |= self.read_watch.len() != before;
        }
        if matches!(kind, WatchKind::Write | WatchKind::Access) {
            let before = self.write_watch.len();
            self.write_watch.retain(|r| *r != range);
            removed |= self.write_watch.len() != before;
        }
        Ok(removed)
    }

    pub fn has_watchpoints(&self) -> bool {
        !self.read_watch.is_empty() || !self.write_watch.is_empty()
    }

    /// Whether execution must stop before the instruction at `pc`.
    pub fn breakpoint_at(&mut self, pc: u64) -> bool {
        // The first check after a resume consumes the skip, hit or not.
        if self.skip_once.take() == Some(pc) {
            return false;
        }
        self.breakpoints.contains(&pc)
    }

    pub fn watchpoint_hit(&self, addr: u64, size: usize, kind: WatchKind) -> Option<WatchHit> {
        let watched = match kind {
            WatchKind::Read => &self.read_watch,
            WatchKind::Write => &self.write_watch,
            WatchKind::Access => return None,
        };
        let access = AddressRange::with_size(addr, size.max(1) as u64)?;
        watched
            .iter()
            .any(|r| r.overlaps(&access))
            .then_some(WatchHit { addr, size, kind })
    }

    /// Applies the result of one engine step and publishes any event.
    pub fn handle_step(&mut self, result: &StepResult) -> CoreState {
        let event = match *result {
            StepResult::Ok => return self.state,
            StepResult::Exit { code } => {
                self.state = CoreState::Exited;
                self.exit_code = Some(code);
                tracing::info!("core {}: exit requested with code {}", self.core, code);
                DebugEvent::Exit {
                    core: self.core,
                    code,
                }
            }
            StepResult::Breakpoint { pc } => {
                self.state = CoreState::AtBreakpoint;
                tracing::info!("core {}: breakpoint hit at {:#010x}", self.core, pc);
                DebugEvent::BreakpointHit { core: self.core, pc }
            }
            StepResult::Watchpoint(hit) => {
                self.state = CoreState::AtWatchpoint;
                self.last_watch = Some(hit);
                tracing::info!(
                    "core {}: {:?} watchpoint hit at {:#010x} ({} bytes)",
                    self.core,
                    hit.kind,
                    hit.addr,
                    hit.size
                );
                DebugEvent::WatchpointHit {
                    core: self.core,
                    hit,
                }
            }
        };
        if let Some(subscriber) = self.subscriber.as_mut() {
            subscriber.on_event(&event);
        }
        self.state
    }

    /// Leaves a paused state. `pc` is where execution continues.
    pub fn resume(&mut self, pc: u64) {
        match self.state {
            CoreState::AtBreakpoint => {
                self.skip_once = Some(pc);
                self.state = CoreState::Running;
            }
            CoreState::AtWatchpoint => self.state = CoreState::Running,
            CoreState::Running | CoreState::Exited => {}
        }
    }

    /// Back to the power-on state. Breakpoints and watchpoints stay armed.
    pub fn reset(&mut self) {
        self.state = CoreState::Running;
        self.skip_once = None;
        self.last_watch = None;
        self.exit_code = None;
    }

    pub fn read_register(engine: &dyn CoreEngine, index: usize) -> SimResult<u32> {
        match index {
            i if i < NUM_GPRS => Ok(engine.gpr(i)),
            REG_PPC => Ok(engine.ppc()),
            REG_NPC => Ok(engine.pc()),
            REG_SR => Ok(engine.sr()),
            _ => Err(SimulationError::InvalidRegister(index)),
        }
    }

    pub fn write_register(engine: &mut dyn CoreEngine, index: usize, value: u32) -> SimResult<()> {
        match index {
            i if i < NUM_GPRS => engine.set_gpr(i, value),
            REG_PPC => engine.set_ppc(value),
            REG_NPC => engine.set_pc(value),
            REG_SR => engine.set_sr(value),
            _ => return Err(SimulationError::InvalidRegister(index)),
        }
        Ok(())
    }

    /// Data-side translation is tried before instruction-side.
    pub fn virtual_to_physical(engine: &dyn CoreEngine, addr: u64) -> Option<u64> {
        let data = engine.data_translation_active();
        let insn = engine.insn_translation_active();
        if !data && !insn {
            return Some(addr);
        }
        data.then(|| engine.translate_data(addr))
            .flatten()
            .or_else(|| insn.then(|| engine.translate_insn(addr)).flatten())
    }
}
