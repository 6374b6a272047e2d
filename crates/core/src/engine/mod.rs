// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Interface between a core and the engine that executes its instructions.
//!
//! The engine owns instruction semantics; everything it needs from the
//! platform (memory, direct-access windows, debug checks) goes through
//! [`ExecutionEnvironment`].

#[cfg(test)]
pub(crate) mod asm;
pub mod decode;
pub mod rv32;

pub use rv32::Rv32Engine;

use crate::bridge::{Direction, DirectAccessWindow, MemorySpace, Request, Response};
use crate::debug::{WatchHit, WatchKind};

/// Number of general purpose registers exposed to a debugger.
pub const NUM_GPRS: usize = 32;
/// Debug register index of the previous program counter.
pub const REG_PPC: usize = 32;
/// Debug register index of the next program counter.
pub const REG_NPC: usize = 33;
/// Debug register index of the status register.
pub const REG_SR: usize = 34;
pub const NUM_DEBUG_REGS: usize = 35;

/// Program counter and stack pointer at the time of an access, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    pub pc: u64,
    pub sp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepResult {
    #[default]
    Ok,
    /// The guest asked to end the simulation.
    Exit { code: u32 },
    /// Stopped before executing the instruction at `pc`.
    Breakpoint { pc: u64 },
    /// The last retired instruction touched a watched range.
    Watchpoint(WatchHit),
}

/// Interrupt controller view of an engine, one bit per input line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptState {
    /// Lines allowed to interrupt.
    pub mask: u32,
    /// Lines currently driven high.
    pub pending: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub result: StepResult,
    pub instructions: u64,
    pub cycles: u64,
    pub sleep_cycles: u64,
}

/// Services a core provides to its engine.
pub trait ExecutionEnvironment {
    fn core_id(&self) -> usize;

    fn transact(&mut self, req: &mut Request<'_>, ctx: CpuContext) -> Response;

    /// A current window covering `[addr, addr + len)` in `space`, if the
    /// engine may bypass [`transact`](Self::transact) for this access.
    fn direct_window(
        &self,
        space: MemorySpace,
        direction: Direction,
        addr: u64,
        len: usize,
    ) -> Option<&DirectAccessWindow>;

    /// Whether execution must stop before the instruction at `pc`.
    fn breakpoint_at(&mut self, pc: u64) -> bool;

    /// Checks a completed access against the watch ranges.
    fn watchpoint_hit(&mut self, addr: u64, size: usize, kind: WatchKind) -> Option<WatchHit>;
}

/// An instruction-set engine stepped by a [`Core`](crate::Core).
pub trait CoreEngine: std::fmt::Debug + Send {
    fn name(&self) -> &str;

    fn reset(&mut self, vector: u64);

    fn set_core_id(&mut self, id: usize);

    fn set_clock(&mut self, hz: u64);

    /// Executes instructions until at least `max_cycles` cycles are consumed
    /// or a stop condition is reached. An instruction costs one cycle plus
    /// the cycles its bus accesses report, so at most `max_cycles`
    /// instructions retire.
    fn step(&mut self, env: &mut dyn ExecutionEnvironment, max_cycles: u64) -> StepOutcome;

    /// Drives interrupt input `line` to `level`.
    fn interrupt(&mut self, line: u32, level: bool);

    fn gpr(&self, index: usize) -> u32;
    fn set_gpr(&mut self, index: usize, value: u32);

    fn pc(&self) -> u32;
    fn set_pc(&mut self, pc: u32);

    fn ppc(&self) -> u32;
    fn set_ppc(&mut self, ppc: u32);

    fn sr(&self) -> u32;
    fn set_sr(&mut self, sr: u32);

    fn stack_pointer(&self) -> u32;

    /// Reads a control/status register by number.
    fn read_csr(&self, _csr: u16) -> Option<u32> {
        None
    }

    /// Writes a control/status register. False when the number is unknown.
    fn write_csr(&mut self, _csr: u16, _value: u32) -> bool {
        false
    }

    fn interrupt_state(&self) -> Option<InterruptState> {
        None
    }

    fn data_translation_active(&self) -> bool {
        false
    }

    fn insn_translation_active(&self) -> bool {
        false
    }

    fn translate_data(&self, _addr: u64) -> Option<u64> {
        None
    }

    fn translate_insn(&self, _addr: u64) -> Option<u64> {
        None
    }

    fn register_names(&self) -> Vec<String> {
        let mut names: Vec<String> = (0..NUM_GPRS).map(|i| format!("r{}", i)).collect();
        names.extend(["ppc", "npc", "sr"].map(String::from));
        names
    }

    fn context(&self) -> CpuContext {
        CpuContext {
            pc: self.pc() as u64,
            sp: self.stack_pointer() as u64,
        }
    }
}
