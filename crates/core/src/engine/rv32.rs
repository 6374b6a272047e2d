// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::decode::{decode, CsrOp, CsrSrc, Instruction};
use super::{CoreEngine, ExecutionEnvironment, InterruptState, StepOutcome, StepResult};
use crate::bridge::{Direction, MemorySpace, Request, Response};
use crate::bus::BusFlags;
use crate::debug::WatchKind;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const MSTATUS_MIE: u32 = 1 << 3;
const MSTATUS_MPIE: u32 = 1 << 7;
const MSTATUS_MASK: u32 = 0x0000_1888;
const MIE_MEIE: u32 = 1 << 11;
const MIP_MEIP: u32 = 1 << 11;
/// RV32 with the I and A extensions.
const MISA: u32 = 0x4000_0101;

const CAUSE_INSN_MISALIGNED: u32 = 0;
const CAUSE_INSN_ACCESS: u32 = 1;
const CAUSE_ILLEGAL: u32 = 2;
const CAUSE_BREAKPOINT: u32 = 3;
const CAUSE_LOAD_MISALIGNED: u32 = 4;
const CAUSE_LOAD_ACCESS: u32 = 5;
const CAUSE_STORE_MISALIGNED: u32 = 6;
const CAUSE_STORE_ACCESS: u32 = 7;
const CAUSE_ECALL: u32 = 11;
const CAUSE_EXTERNAL_IRQ: u32 = 0x8000_000B;

/// `a7` value of the exit system call.
const SYS_EXIT: u32 = 93;
const REG_SP: usize = 2;
const REG_A0: usize = 10;
const REG_A7: usize = 17;

mod csr {
    pub const MSTATUS: u16 = 0x300;
    pub const MISA: u16 = 0x301;
    pub const MIE: u16 = 0x304;
    pub const MTVEC: u16 = 0x305;
    pub const MSCRATCH: u16 = 0x340;
    pub const MEPC: u16 = 0x341;
    pub const MCAUSE: u16 = 0x342;
    pub const MTVAL: u16 = 0x343;
    pub const MIP: u16 = 0x344;
    pub const MCYCLE: u16 = 0xB00;
    pub const MINSTRET: u16 = 0xB02;
    pub const MCYCLEH: u16 = 0xB80;
    pub const MINSTRETH: u16 = 0xB82;
    /// Programmable interrupt mask, one bit per line.
    pub const PICMR: u16 = 0xBC0;
    pub const CYCLE: u16 = 0xC00;
    pub const TIME: u16 = 0xC01;
    pub const INSTRET: u16 = 0xC02;
    pub const CYCLEH: u16 = 0xC80;
    pub const TIMEH: u16 = 0xC81;
    pub const INSTRETH: u16 = 0xC82;
    pub const MHARTID: u16 = 0xF14;
    /// Programmable interrupt status: current level of every line.
    pub const PICSR: u16 = 0xFC0;
}

#[derive(Debug, Clone, Copy)]
struct Trap {
    cause: u32,
    tval: u32,
}

impl Trap {
    fn new(cause: u32, tval: u32) -> Self {
        Self { cause, tval }
    }
}

/// RV32I machine-mode engine with LR/SC, Zicsr, MRET and WFI.
///
/// External interrupts arrive on 32 level-sensitive lines collected in
/// PICSR and masked by PICMR. A pending unmasked line traps with cause
/// `0x8000000B` when `mstatus.MIE` and `mie.MEIE` are set.
#[derive(Debug)]
pub struct Rv32Engine {
    x: [u32; 32],
    pc: u32,
    ppc: u32,
    hart: u32,
    clock_hz: u64,

    mstatus: u32,
    mie: u32,
    mtvec: u32,
    mscratch: u32,
    mepc: u32,
    mcause: u32,
    mtval: u32,
    picmr: u32,
    picsr: u32,
    mcycle: u64,
    minstret: u64,

    sleep_mode: bool,
    sleeping: bool,
    trace: Option<BufWriter<File>>,
}

impl Rv32Engine {
    /// With `sleep_mode`, WFI idles the core until an unmasked line is
    /// pending; otherwise WFI is a no-op.
    pub fn new(sleep_mode: bool) -> Self {
        Self {
            x: [0; 32],
            pc: 0,
            ppc: 0,
            hart: 0,
            clock_hz: 1,
            mstatus: 0,
            mie: 0,
            mtvec: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            picmr: 0,
            picsr: 0,
            mcycle: 0,
            minstret: 0,
            sleep_mode,
            sleeping: false,
            trace: None,
        }
    }

    /// Writes one line per executed instruction to `path`.
    pub fn with_trace_file(mut self, path: &Path) -> std::io::Result<Self> {
        self.trace = Some(BufWriter::new(File::create(path)?));
        Ok(self)
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    pub fn mcause(&self) -> u32 {
        self.mcause
    }

    pub fn mepc(&self) -> u32 {
        self.mepc
    }

    fn reg(&self, n: u8) -> u32 {
        self.x[n as usize]
    }

    fn set_reg(&mut self, n: u8, val: u32) {
        if n != 0 {
            self.x[n as usize] = val;
        }
    }

    fn irq_pending(&self) -> bool {
        self.picsr & self.picmr != 0
    }

    fn interrupts_enabled(&self) -> bool {
        self.mstatus & MSTATUS_MIE != 0 && self.mie & MIE_MEIE != 0
    }

    fn trap(&mut self, trap: Trap, epc: u32) {
        self.mepc = epc;
        self.mcause = trap.cause;
        self.mtval = trap.tval;
        let mpie = if self.mstatus & MSTATUS_MIE != 0 {
            MSTATUS_MPIE
        } else {
            0
        };
        self.mstatus = (self.mstatus & !(MSTATUS_MIE | MSTATUS_MPIE)) | mpie;

        let base = self.mtvec & !3;
        self.pc = if self.mtvec & 3 == 1 && trap.cause & 0x8000_0000 != 0 {
            base.wrapping_add((trap.cause & 0x7FFF_FFFF) * 4)
        } else {
            base
        };
        tracing::trace!(
            "hart {}: trap cause {:#x} tval {:#x} at {:#010x} -> {:#010x}",
            self.hart,
            trap.cause,
            trap.tval,
            epc,
            self.pc
        );
    }

    fn mret(&mut self) -> u32 {
        let mie = if self.mstatus & MSTATUS_MPIE != 0 {
            MSTATUS_MIE
        } else {
            0
        };
        self.mstatus = (self.mstatus & !MSTATUS_MIE) | mie | MSTATUS_MPIE;
        self.mepc
    }

    fn elapsed_us(&self) -> u64 {
        (self.mcycle as u128 * 1_000_000 / self.clock_hz.max(1) as u128) as u64
    }

    fn csr_read(&self, csr: u16) -> Option<u32> {
        let v = match csr {
            csr::MSTATUS => self.mstatus,
            csr::MISA => MISA,
            csr::MIE => self.mie,
            csr::MTVEC => self.mtvec,
            csr::MSCRATCH => self.mscratch,
            csr::MEPC => self.mepc,
            csr::MCAUSE => self.mcause,
            csr::MTVAL => self.mtval,
            csr::MIP => {
                if self.irq_pending() {
                    MIP_MEIP
                } else {
                    0
                }
            }
            csr::PICMR => self.picmr,
            csr::PICSR => self.picsr,
            csr::MCYCLE | csr::CYCLE => self.mcycle as u32,
            csr::MCYCLEH | csr::CYCLEH => (self.mcycle >> 32) as u32,
            csr::MINSTRET | csr::INSTRET => self.minstret as u32,
            csr::MINSTRETH | csr::INSTRETH => (self.minstret >> 32) as u32,
            csr::TIME => self.elapsed_us() as u32,
            csr::TIMEH => (self.elapsed_us() >> 32) as u32,
            csr::MHARTID => self.hart,
            _ => return None,
        };
        Some(v)
    }

    fn csr_write(&mut self, csr: u16, val: u32) {
        match csr {
            csr::MSTATUS => self.mstatus = val & MSTATUS_MASK,
            csr::MIE => self.mie = val,
            csr::MTVEC => self.mtvec = val,
            csr::MSCRATCH => self.mscratch = val,
            csr::MEPC => self.mepc = val & !3,
            csr::MCAUSE => self.mcause = val,
            csr::MTVAL => self.mtval = val,
            csr::PICMR => self.picmr = val,
            csr::MCYCLE => self.mcycle = (self.mcycle & !0xFFFF_FFFF) | val as u64,
            csr::MCYCLEH => self.mcycle = (self.mcycle & 0xFFFF_FFFF) | ((val as u64) << 32),
            csr::MINSTRET => self.minstret = (self.minstret & !0xFFFF_FFFF) | val as u64,
            csr::MINSTRETH => {
                self.minstret = (self.minstret & 0xFFFF_FFFF) | ((val as u64) << 32)
            }
            // misa and mip are WARL with nothing writable.
            _ => {}
        }
    }

    fn csr_op(&mut self, op: CsrOp, rd: u8, src: CsrSrc, csr: u16, raw: u32) -> Result<(), Trap> {
        let old = self.csr_read(csr).ok_or(Trap::new(CAUSE_ILLEGAL, raw))?;
        let (operand, src_zero) = match src {
            CsrSrc::Reg(r) => (self.reg(r), r == 0),
            CsrSrc::Imm(i) => (i as u32, i == 0),
        };
        let writes = op == CsrOp::Write || !src_zero;
        if writes {
            // The top two address bits 0b11 mark read-only CSRs.
            if csr >> 10 == 0b11 {
                return Err(Trap::new(CAUSE_ILLEGAL, raw));
            }
            let new = match op {
                CsrOp::Write => operand,
                CsrOp::Set => old | operand,
                CsrOp::Clear => old & !operand,
            };
            self.csr_write(csr, new);
        }
        self.set_reg(rd, old);
        Ok(())
    }

    fn fetch(&mut self, env: &mut dyn ExecutionEnvironment, cycles: &mut u64) -> Result<u32, Trap> {
        if self.pc & 3 != 0 {
            return Err(Trap::new(CAUSE_INSN_MISALIGNED, self.pc));
        }
        let addr = self.pc as u64;
        let mut buf = [0u8; 4];
        if let Some(w) = env.direct_window(MemorySpace::Instruction, Direction::Read, addr, 4) {
            if w.read(addr, &mut buf) {
                *cycles += w.cycles(Direction::Read);
                return Ok(u32::from_le_bytes(buf));
            }
        }
        let ctx = self.context();
        let mut req = Request::read(MemorySpace::Instruction, addr, &mut buf);
        let resp = env.transact(&mut req, ctx);
        *cycles += req.cycles;
        if resp != Response::Success {
            return Err(Trap::new(CAUSE_INSN_ACCESS, self.pc));
        }
        Ok(u32::from_le_bytes(buf))
    }

    fn load(
        &mut self,
        env: &mut dyn ExecutionEnvironment,
        addr: u32,
        size: usize,
        flags: BusFlags,
        cycles: &mut u64,
    ) -> Result<u32, Trap> {
        if addr as usize % size != 0 {
            return Err(Trap::new(CAUSE_LOAD_MISALIGNED, addr));
        }
        let a = addr as u64;
        let mut buf = [0u8; 4];
        let data = &mut buf[..size];
        let mut done = false;
        if !flags.contains(BusFlags::EXCL) {
            if let Some(w) = env.direct_window(MemorySpace::Data, Direction::Read, a, size) {
                if w.read(a, data) {
                    *cycles += w.cycles(Direction::Read);
                    done = true;
                }
            }
        }
        if !done {
            let ctx = self.context();
            let mut req = Request::read(MemorySpace::Data, a, data).with_flags(flags);
            let resp = env.transact(&mut req, ctx);
            *cycles += req.cycles;
            if resp != Response::Success {
                return Err(Trap::new(CAUSE_LOAD_ACCESS, addr));
            }
        }
        Ok(u32::from_le_bytes(buf))
    }

    /// Returns false when an exclusive store lost its reservation.
    fn store(
        &mut self,
        env: &mut dyn ExecutionEnvironment,
        addr: u32,
        value: u32,
        size: usize,
        flags: BusFlags,
        cycles: &mut u64,
    ) -> Result<bool, Trap> {
        if addr as usize % size != 0 {
            return Err(Trap::new(CAUSE_STORE_MISALIGNED, addr));
        }
        let a = addr as u64;
        let mut buf = value.to_le_bytes();
        let data = &mut buf[..size];
        if !flags.contains(BusFlags::EXCL) {
            if let Some(w) = env.direct_window(MemorySpace::Data, Direction::Write, a, size) {
                if w.write(a, data) {
                    *cycles += w.cycles(Direction::Write);
                    return Ok(true);
                }
            }
        }
        let ctx = self.context();
        let mut req = Request::write(MemorySpace::Data, a, data).with_flags(flags);
        let resp = env.transact(&mut req, ctx);
        *cycles += req.cycles;
        match resp {
            Response::Success => Ok(true),
            Response::Failed => Ok(false),
            Response::Error => Err(Trap::new(CAUSE_STORE_ACCESS, addr)),
        }
    }

    fn trace_insn(&mut self, raw: u32, insn: &Instruction) {
        let Some(trace) = self.trace.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(trace, "{:08x}: {:08x} {:?}", self.pc, raw, insn) {
            tracing::warn!("hart {}: instruction trace disabled: {}", self.hart, e);
            self.trace = None;
        }
    }

    /// Executes the instruction at `pc`. On success returns the next pc and
    /// any stop condition raised by the retired instruction.
    fn execute(
        &mut self,
        env: &mut dyn ExecutionEnvironment,
        cycles: &mut u64,
    ) -> Result<(u32, Option<StepResult>), Trap> {
        let raw = self.fetch(env, cycles)?;
        let insn = decode(raw);
        self.trace_insn(raw, &insn);

        let pc = self.pc;
        let mut next = pc.wrapping_add(4);
        let mut stop = None;

        match insn {
            Instruction::Lui { rd, imm } => self.set_reg(rd, imm),
            Instruction::Auipc { rd, imm } => self.set_reg(rd, pc.wrapping_add(imm)),
            Instruction::Jal { rd, offset } => {
                self.set_reg(rd, next);
                next = pc.wrapping_add(offset as u32);
            }
            Instruction::Jalr { rd, rs1, offset } => {
                let target = self.reg(rs1).wrapping_add(offset as u32) & !1;
                self.set_reg(rd, next);
                next = target;
            }
            Instruction::Branch {
                op,
                rs1,
                rs2,
                offset,
            } => {
                if op.taken(self.reg(rs1), self.reg(rs2)) {
                    next = pc.wrapping_add(offset as u32);
                }
            }
            Instruction::Load {
                rd,
                rs1,
                offset,
                size,
                signed,
            } => {
                let addr = self.reg(rs1).wrapping_add(offset as u32);
                let raw = self.load(env, addr, size, BusFlags::empty(), cycles)?;
                let val = match (size, signed) {
                    (1, true) => raw as u8 as i8 as i32 as u32,
                    (2, true) => raw as u16 as i16 as i32 as u32,
                    _ => raw,
                };
                self.set_reg(rd, val);
                stop = env
                    .watchpoint_hit(addr as u64, size, WatchKind::Read)
                    .map(StepResult::Watchpoint);
            }
            Instruction::Store {
                rs1,
                rs2,
                offset,
                size,
            } => {
                let addr = self.reg(rs1).wrapping_add(offset as u32);
                self.store(env, addr, self.reg(rs2), size, BusFlags::empty(), cycles)?;
                stop = env
                    .watchpoint_hit(addr as u64, size, WatchKind::Write)
                    .map(StepResult::Watchpoint);
            }
            Instruction::OpImm { op, rd, rs1, imm } => {
                self.set_reg(rd, op.apply(self.reg(rs1), imm as u32))
            }
            Instruction::Op { op, rd, rs1, rs2 } => {
                self.set_reg(rd, op.apply(self.reg(rs1), self.reg(rs2)))
            }
            Instruction::LrW { rd, rs1 } => {
                let addr = self.reg(rs1);
                let val = self.load(env, addr, 4, BusFlags::EXCL, cycles)?;
                self.set_reg(rd, val);
                stop = env
                    .watchpoint_hit(addr as u64, 4, WatchKind::Read)
                    .map(StepResult::Watchpoint);
            }
            Instruction::ScW { rd, rs1, rs2 } => {
                let addr = self.reg(rs1);
                let stored = self.store(env, addr, self.reg(rs2), 4, BusFlags::EXCL, cycles)?;
                self.set_reg(rd, if stored { 0 } else { 1 });
                if stored {
                    stop = env
                        .watchpoint_hit(addr as u64, 4, WatchKind::Write)
                        .map(StepResult::Watchpoint);
                }
            }
            Instruction::Csr { op, rd, src, csr } => self.csr_op(op, rd, src, csr, raw)?,
            Instruction::Fence => {}
            Instruction::Ecall => {
                if self.x[REG_A7] != SYS_EXIT {
                    return Err(Trap::new(CAUSE_ECALL, 0));
                }
                stop = Some(StepResult::Exit {
                    code: self.x[REG_A0],
                });
            }
            Instruction::Ebreak => return Err(Trap::new(CAUSE_BREAKPOINT, pc)),
            Instruction::Mret => next = self.mret(),
            Instruction::Wfi => {
                if self.sleep_mode && !self.irq_pending() {
                    self.sleeping = true;
                }
            }
            Instruction::Illegal(raw) => {
                tracing::debug!("hart {}: illegal instruction {:#010x} at {:#010x}", self.hart, raw, pc);
                return Err(Trap::new(CAUSE_ILLEGAL, raw));
            }
        }
        Ok((next, stop))
    }
}

impl CoreEngine for Rv32Engine {
    fn name(&self) -> &str {
        "rv32"
    }

    fn reset(&mut self, vector: u64) {
        let picsr = self.picsr;
        let trace = self.trace.take();
        *self = Self {
            hart: self.hart,
            clock_hz: self.clock_hz,
            sleep_mode: self.sleep_mode,
            // Line levels are driven from outside the core.
            picsr,
            trace,
            ..Self::new(self.sleep_mode)
        };
        self.pc = vector as u32;
        self.ppc = vector as u32;
    }

    fn set_core_id(&mut self, id: usize) {
        self.hart = id as u32;
    }

    fn set_clock(&mut self, hz: u64) {
        self.clock_hz = hz;
    }

    fn step(&mut self, env: &mut dyn ExecutionEnvironment, max_cycles: u64) -> StepOutcome {
        let mut out = StepOutcome::default();
        if self.sleeping && self.irq_pending() {
            self.sleeping = false;
        }

        while out.cycles < max_cycles {
            if self.sleeping {
                let idle = max_cycles - out.cycles;
                out.cycles += idle;
                out.sleep_cycles += idle;
                self.mcycle += idle;
                break;
            }
            if self.interrupts_enabled() && self.irq_pending() {
                self.trap(Trap::new(CAUSE_EXTERNAL_IRQ, 0), self.pc);
            }
            if env.breakpoint_at(self.pc as u64) {
                out.result = StepResult::Breakpoint { pc: self.pc as u64 };
                break;
            }

            let mut cycles = 1;
            let pc = self.pc;
            let result = self.execute(env, &mut cycles);
            out.cycles += cycles;
            self.mcycle += cycles;
            match result {
                Ok((next, stop)) => {
                    self.ppc = pc;
                    self.pc = next;
                    self.minstret += 1;
                    out.instructions += 1;
                    if let Some(stop) = stop {
                        out.result = stop;
                        break;
                    }
                }
                Err(trap) => self.trap(trap, pc),
            }
        }

        if let Some(trace) = self.trace.as_mut() {
            if let Err(e) = trace.flush() {
                tracing::warn!("hart {}: instruction trace disabled: {}", self.hart, e);
                self.trace = None;
            }
        }
        out
    }

    fn interrupt(&mut self, line: u32, level: bool) {
        if line >= 32 {
            tracing::warn!("hart {}: interrupt line {} does not exist", self.hart, line);
            return;
        }
        if level {
            self.picsr |= 1 << line;
        } else {
            self.picsr &= !(1 << line);
        }
        if self.irq_pending() {
            self.sleeping = false;
        }
    }

    fn gpr(&self, index: usize) -> u32 {
        self.x.get(index).copied().unwrap_or(0)
    }

    fn set_gpr(&mut self, index: usize, value: u32) {
        if index != 0 && index < self.x.len() {
            self.x[index] = value;
        }
    }

    fn pc(&self) -> u32 {
        self.pc
    }

    fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    fn ppc(&self) -> u32 {
        self.ppc
    }

    fn set_ppc(&mut self, ppc: u32) {
        self.ppc = ppc;
    }

    fn sr(&self) -> u32 {
        self.mstatus
    }

    fn set_sr(&mut self, sr: u32) {
        self.mstatus = sr & MSTATUS_MASK;
    }

    fn stack_pointer(&self) -> u32 {
        self.x[REG_SP]
    }

    fn read_csr(&self, csr: u16) -> Option<u32> {
        self.csr_read(csr)
    }

    fn write_csr(&mut self, csr: u16, value: u32) -> bool {
        // The top two number bits set mark a read-only register.
        if self.csr_read(csr).is_none() || csr >> 10 == 0b11 {
            return false;
        }
        self.csr_write(csr, value);
        true
    }

    fn interrupt_state(&self) -> Option<InterruptState> {
        Some(InterruptState {
            mask: self.picmr,
            pending: self.picsr,
        })
    }

    fn register_names(&self) -> Vec<String> {
        let mut names: Vec<String> = (0..32).map(|i| format!("x{}", i)).collect();
        names.extend(["ppc", "pc", "mstatus"].map(String::from));
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::DirectAccessWindow;
    use crate::debug::WatchHit;
    use crate::engine::asm::*;
    use crate::engine::CpuContext;

    /// Flat 64 KiB memory with a single reservation slot and fixed latency.
    #[derive(Default)]
    struct FlatEnv {
        mem: Vec<u8>,
        breakpoints: Vec<u64>,
        write_watch: Option<(u64, u64)>,
        reservation: Option<u64>,
        transactions: u64,
    }

    impl FlatEnv {
        fn with_program(base: u64, words: &[u32]) -> Self {
            let mut env = Self {
                mem: vec![0; 0x10000],
                ..Self::default()
            };
            env.load(base, &program(words));
            env
        }

        fn load(&mut self, addr: u64, bytes: &[u8]) {
            let a = addr as usize;
            self.mem[a..a + bytes.len()].copy_from_slice(bytes);
        }

        fn word(&self, addr: u64) -> u32 {
            let a = addr as usize;
            u32::from_le_bytes([self.mem[a], self.mem[a + 1], self.mem[a + 2], self.mem[a + 3]])
        }
    }

    impl ExecutionEnvironment for FlatEnv {
        fn core_id(&self) -> usize {
            0
        }

        fn transact(&mut self, req: &mut Request<'_>, _ctx: CpuContext) -> Response {
            self.transactions += 1;
            req.cycles = 2;
            let a = req.addr as usize;
            let n = req.data.len();
            let excl = req.flags.contains(BusFlags::EXCL);
            if a + n > self.mem.len() {
                return if excl { Response::Failed } else { Response::Error };
            }
            match req.direction {
                Direction::Read => {
                    req.data.copy_from_slice(&self.mem[a..a + n]);
                    if excl {
                        self.reservation = Some(req.addr);
                    }
                }
                Direction::Write => {
                    if excl && self.reservation.take() != Some(req.addr) {
                        return Response::Failed;
                    }
                    if !excl && self.reservation == Some(req.addr) {
                        self.reservation = None;
                    }
                    self.mem[a..a + n].copy_from_slice(req.data);
                }
            }
            Response::Success
        }

        fn direct_window(
            &self,
            _space: MemorySpace,
            _direction: Direction,
            _addr: u64,
            _len: usize,
        ) -> Option<&DirectAccessWindow> {
            None
        }

        fn breakpoint_at(&mut self, pc: u64) -> bool {
            self.breakpoints.contains(&pc)
        }

        fn watchpoint_hit(&mut self, addr: u64, size: usize, kind: WatchKind) -> Option<WatchHit> {
            let (lo, hi) = self.write_watch?;
            (kind == WatchKind::Write && addr < hi && addr + size as u64 > lo)
                .then_some(WatchHit { addr, size, kind })
        }
    }

    fn engine_at(pc: u64) -> Rv32Engine {
        let mut e = Rv32Engine::new(true);
        e.set_clock(100_000_000);
        e.reset(pc);
        e
    }

    #[test]
    fn test_arithmetic_and_branch_loop() {
        // Sum 1..=10 into x10.
        let mut env = FlatEnv::with_program(
            0x100,
            &[
                addi(10, 0, 0),
                addi(5, 0, 10),
                add(10, 10, 5),
                addi(5, 5, -1),
                bne(5, 0, -8),
                addi(17, 0, 93),
                ecall(),
            ],
        );
        let mut e = engine_at(0x100);
        let out = e.step(&mut env, 1_000);
        assert_eq!(out.result, StepResult::Exit { code: 55 });
        assert_eq!(e.gpr(10), 55);
        assert_eq!(out.instructions, 2 + 3 * 10 + 2);
        // One base cycle plus two fetch cycles per instruction.
        assert_eq!(out.cycles, out.instructions * 3);
    }

    #[test]
    fn test_step_budget_is_respected() {
        let mut env = FlatEnv::with_program(0x100, &[jal(0, 0)]);
        let mut e = engine_at(0x100);
        let out = e.step(&mut env, 10);
        assert_eq!(out.result, StepResult::Ok);
        // Each instruction costs 3 cycles: 4 instructions reach the budget.
        assert_eq!(out.instructions, 4);
        assert_eq!(out.cycles, 12);
    }

    #[test]
    fn test_loads_and_stores() {
        let mut words = li(6, 0x8000).to_vec();
        words.extend(li(7, 0xDEAD_BEEF));
        words.extend([
            sw(7, 6, 0),
            lb(8, 6, 3),
            lbu(9, 6, 3),
            lh(11, 6, 0),
            lw(12, 6, 0),
            sb(0, 6, 1),
            lw(13, 6, 0),
        ]);
        let mut env = FlatEnv::with_program(0x100, &words);
        let mut e = engine_at(0x100);
        e.step(&mut env, (words.len() * 5) as u64);
        assert_eq!(e.gpr(8), 0xFFFF_FFDE);
        assert_eq!(e.gpr(9), 0xDE);
        assert_eq!(e.gpr(11), 0xFFFF_BEEF);
        assert_eq!(e.gpr(12), 0xDEAD_BEEF);
        assert_eq!(e.gpr(13), 0xDEAD_00EF);
        assert_eq!(env.word(0x8000), 0xDEAD_00EF);
    }

    #[test]
    fn test_breakpoint_stops_before_execution() {
        let mut env = FlatEnv::with_program(0x100, &[addi(1, 0, 1), addi(2, 0, 2), addi(3, 0, 3)]);
        env.breakpoints.push(0x104);
        let mut e = engine_at(0x100);
        let out = e.step(&mut env, 100);
        assert_eq!(out.result, StepResult::Breakpoint { pc: 0x104 });
        assert_eq!(out.instructions, 1);
        assert_eq!(e.pc(), 0x104);
        assert_eq!(e.gpr(2), 0);
    }

    #[test]
    fn test_watchpoint_reported_after_store_retires() {
        let mut env = FlatEnv::with_program(
            0x100,
            &[addi(5, 0, 0x7F), lui(6, 0x1000), sw(5, 6, 0xC), addi(1, 0, 1)],
        );
        env.write_watch = Some((0x1000, 0x1010));
        let mut e = engine_at(0x100);
        let out = e.step(&mut env, 100);
        assert_eq!(
            out.result,
            StepResult::Watchpoint(WatchHit {
                addr: 0x100C,
                size: 4,
                kind: WatchKind::Write
            })
        );
        assert_eq!(env.word(0x100C), 0x7F);
        assert_eq!(e.pc(), 0x10C);
    }

    #[test]
    fn test_bus_error_traps_to_handler() {
        let mut words = li(6, 0x00F0_0000).to_vec();
        words.push(lw(7, 6, 0));
        let mut env = FlatEnv::with_program(0x100, &words);
        let mut e = engine_at(0x100);
        e.csr_write(csr::MTVEC, 0x400);
        e.step(&mut env, 3 * 3);
        assert_eq!(e.pc(), 0x400);
        assert_eq!(e.mcause(), CAUSE_LOAD_ACCESS);
        assert_eq!(e.mepc(), 0x108);
        assert_eq!(e.mtval, 0x00F0_0000);
    }

    #[test]
    fn test_illegal_instruction_traps() {
        let mut env = FlatEnv::with_program(0x100, &[0xFFFF_FFFF]);
        let mut e = engine_at(0x100);
        e.csr_write(csr::MTVEC, 0x200);
        let out = e.step(&mut env, 1);
        assert_eq!(out.instructions, 0);
        assert_eq!(e.pc(), 0x200);
        assert_eq!(e.mcause(), CAUSE_ILLEGAL);
    }

    #[test]
    fn test_lr_sc_pair() {
        let mut env = FlatEnv::with_program(
            0x100,
            &[
                lui(10, 0x2000),
                lr_w(5, 10),
                addi(5, 5, 1),
                sc_w(6, 10, 5),
                // Second SC without a reservation must fail.
                sc_w(7, 10, 5),
            ],
        );
        env.load(0x2000, &41u32.to_le_bytes());
        let mut e = engine_at(0x100);
        e.step(&mut env, 21);
        assert_eq!(env.word(0x2000), 42);
        assert_eq!(e.gpr(6), 0);
        assert_eq!(e.gpr(7), 1);
    }

    #[test]
    fn test_external_interrupt_and_mret() {
        let mut words = li(5, 0x300).to_vec();
        words.push(csrrw(0, 0x305, 5)); // mtvec
        words.extend(li(5, 1 << 11));
        words.push(csrrw(0, 0x304, 5)); // mie.MEIE
        words.push(csrrwi(0, 0xBC0, 4)); // unmask line 2
        words.push(csrrsi(0, 0x300, 8)); // mstatus.MIE
        words.push(jal(0, 0));
        let mut env = FlatEnv::with_program(0x100, &words);
        // Handler: count and mask the line, then return.
        env.load(
            0x300,
            &program(&[addi(20, 20, 1), csrrwi(0, 0xBC0, 0), mret()]),
        );
        let mut e = engine_at(0x100);
        e.step(&mut env, 100);
        let spin = e.pc();
        assert_eq!(e.gpr(20), 0);

        e.interrupt(2, true);
        e.step(&mut env, 3);
        assert_eq!(e.mcause(), CAUSE_EXTERNAL_IRQ);
        e.step(&mut env, 30);
        assert_eq!(e.gpr(20), 1);
        assert_eq!(e.pc(), spin, "mret returns to the spin loop");
        assert_ne!(e.sr() & MSTATUS_MIE, 0, "MIE restored");
    }

    #[test]
    fn test_wfi_sleeps_until_unmasked_line() {
        let mut env = FlatEnv::with_program(0x100, &[csrrwi(0, 0xBC0, 2), wfi(), addi(1, 0, 7)]);
        let mut e = engine_at(0x100);
        let out = e.step(&mut env, 1_000);
        assert!(e.is_sleeping());
        assert_eq!(out.instructions, 2);
        assert_eq!(out.cycles, 1_000);
        assert_eq!(out.sleep_cycles, 1_000 - 6);

        // A masked line does not wake the core.
        e.interrupt(3, true);
        assert!(e.is_sleeping());
        e.interrupt(1, true);
        assert!(!e.is_sleeping());
        let out = e.step(&mut env, 3);
        assert_eq!(out.sleep_cycles, 0);
        assert_eq!(e.gpr(1), 7);
    }

    #[test]
    fn test_wfi_without_sleep_mode_is_a_nop() {
        let mut env = FlatEnv::with_program(0x100, &[wfi(), addi(1, 0, 7)]);
        let mut e = Rv32Engine::new(false);
        e.reset(0x100);
        let out = e.step(&mut env, 6);
        assert_eq!(out.sleep_cycles, 0);
        assert_eq!(e.gpr(1), 7);
    }

    #[test]
    fn test_hart_id_and_readonly_csrs() {
        let mut env = FlatEnv::with_program(0x100, &[csrrs(5, 0xF14, 0), csrrw(0, 0xF14, 5)]);
        let mut e = engine_at(0x100);
        e.set_core_id(3);
        e.csr_write(csr::MTVEC, 0x200);
        e.step(&mut env, 6);
        assert_eq!(e.gpr(5), 3);
        assert_eq!(e.mcause(), CAUSE_ILLEGAL, "writing mhartid traps");
    }

    #[test]
    fn test_debugger_csr_access_and_interrupt_state() {
        let mut e = engine_at(0x100);
        assert!(CoreEngine::write_csr(&mut e, csr::PICMR, 0x6));
        assert!(!CoreEngine::write_csr(&mut e, csr::PICSR, 0xFF), "levels are driven");
        assert!(!CoreEngine::write_csr(&mut e, 0x7C0, 1));
        assert_eq!(CoreEngine::read_csr(&e, 0x7C0), None);

        e.interrupt(2, true);
        assert_eq!(CoreEngine::read_csr(&e, csr::PICSR), Some(0x4));
        assert_eq!(
            e.interrupt_state(),
            Some(InterruptState {
                mask: 0x6,
                pending: 0x4
            })
        );
    }

    #[test]
    fn test_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let mut e = Rv32Engine::new(true).with_trace_file(&path).unwrap();
        e.reset(0x100);
        let mut env = FlatEnv::with_program(0x100, &[addi(1, 0, 1), addi(2, 0, 2)]);
        e.step(&mut env, 6);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000100: 00100093"));
    }
}
