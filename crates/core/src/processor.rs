// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bridge::{BridgeStats, Direction, DirectAccessWindow, MemorySpace, Request, Response};
use crate::bus::{BusFlags, SystemBus};
use crate::debug::{CoreState, DebugController, WatchHit, WatchKind};
use crate::engine::{CoreEngine, CpuContext, ExecutionEnvironment, InterruptState, StepOutcome};
use crate::{SimResult, SimTime, SimulationError, TransactionBridge};
use serde::Serialize;
use vp_config::CoreConfig;

/// Address width of the modeled cores.
pub const ADDRESS_BITS: u32 = 32;

/// Lifecycle surface a topology drives on every core it owns.
pub trait DeviceLifecycle {
    fn id(&self) -> usize;
    fn name(&self) -> &str;
    fn clock_hz(&self) -> u64;
    fn set_clock(&mut self, hz: u64);
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoreCounters {
    pub instructions: u64,
    pub cycles: u64,
    pub sleep_cycles: u64,
}

/// One processor: an engine plus the bridge and debug state around it.
#[derive(Debug)]
pub struct Core {
    id: usize,
    name: String,
    clock_hz: u64,
    reset_vector: u64,
    engine: Box<dyn CoreEngine>,
    bridge: TransactionBridge,
    debug: DebugController,
    counters: CoreCounters,
}

impl Core {
    pub fn new(config: &CoreConfig, mut engine: Box<dyn CoreEngine>) -> Self {
        engine.set_core_id(config.id);
        engine.set_clock(config.clock_hz);
        engine.reset(config.reset_vector);
        Self {
            id: config.id,
            name: format!("cpu{}", config.id),
            clock_hz: config.clock_hz,
            reset_vector: config.reset_vector,
            engine,
            bridge: TransactionBridge::new(
                config.id,
                config.clock_hz,
                config.enable_insn_dmi,
                config.enable_data_dmi,
            ),
            debug: DebugController::new(config.id, ADDRESS_BITS),
            counters: CoreCounters::default(),
        }
    }

    pub fn engine(&self) -> &dyn CoreEngine {
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> &mut dyn CoreEngine {
        self.engine.as_mut()
    }

    pub fn bridge(&self) -> &TransactionBridge {
        &self.bridge
    }

    pub fn bridge_stats(&self) -> &BridgeStats {
        self.bridge.stats()
    }

    pub fn debug(&self) -> &DebugController {
        &self.debug
    }

    pub fn debug_mut(&mut self) -> &mut DebugController {
        &mut self.debug
    }

    pub fn counters(&self) -> CoreCounters {
        self.counters
    }

    pub fn state(&self) -> CoreState {
        self.debug.state()
    }

    pub fn reset_vector(&self) -> u64 {
        self.reset_vector
    }

    pub fn pc(&self) -> u64 {
        self.engine.pc() as u64
    }

    /// Runs the engine for up to `max_cycles` cycles starting at `now`.
    /// Exited and paused cores do not advance.
    ///
    /// Every instruction costs at least one cycle, so the budget is also an
    /// upper bound on instructions executed. Bus latency and sleep consume
    /// the same budget, so with zero-latency memory and no WFI the two
    /// counts are equal.
    pub fn simulate(&mut self, bus: &mut SystemBus, now: SimTime, max_cycles: u64) -> CoreState {
        if self.debug.state() != CoreState::Running {
            return self.debug.state();
        }
        self.engine.set_clock(self.clock_hz);
        self.bridge.set_clock(self.clock_hz);

        let mut port = BridgePort {
            bridge: &mut self.bridge,
            debug: &mut self.debug,
            bus,
            now,
        };
        let outcome: StepOutcome = self.engine.step(&mut port, max_cycles);

        self.counters.instructions += outcome.instructions;
        self.counters.cycles += outcome.cycles;
        self.counters.sleep_cycles += outcome.sleep_cycles;
        self.debug.handle_step(&outcome.result)
    }

    /// Leaves a breakpoint or watchpoint pause.
    pub fn resume(&mut self) {
        let pc = self.pc();
        self.debug.resume(pc);
    }

    pub fn interrupt(&mut self, line: u32, level: bool) {
        self.engine.interrupt(line, level);
    }

    /// Issues `req` through this core's bridge as if the engine had.
    pub fn transact(&mut self, bus: &mut SystemBus, now: SimTime, req: &mut Request<'_>) -> Response {
        let ctx = self.engine.context();
        self.bridge.transact(bus, now, req, ctx)
    }

    /// Issues a debug-flagged access through this core's bridge. Costs no time.
    pub fn debug_transact(
        &mut self,
        bus: &mut SystemBus,
        direction: Direction,
        addr: u64,
        data: &mut [u8],
    ) -> Response {
        let mut req = match direction {
            Direction::Read => Request::read(MemorySpace::Data, addr, data),
            Direction::Write => Request::write(MemorySpace::Data, addr, data),
        }
        .with_flags(BusFlags::DEBUG);
        self.transact(bus, SimTime::ZERO, &mut req)
    }

    pub fn read_memory(&mut self, bus: &mut SystemBus, addr: u64, data: &mut [u8]) -> SimResult<()> {
        match self.debug_transact(bus, Direction::Read, addr, data) {
            Response::Success => Ok(()),
            _ => Err(SimulationError::UnmappedAddress(addr)),
        }
    }

    pub fn write_memory(&mut self, bus: &mut SystemBus, addr: u64, data: &[u8]) -> SimResult<()> {
        let mut buf = data.to_vec();
        match self.debug_transact(bus, Direction::Write, addr, &mut buf) {
            Response::Success => Ok(()),
            _ => Err(SimulationError::UnmappedAddress(addr)),
        }
    }

    pub fn read_register(&self, index: usize) -> SimResult<u32> {
        DebugController::read_register(self.engine.as_ref(), index)
    }

    pub fn write_register(&mut self, index: usize, value: u32) -> SimResult<()> {
        DebugController::write_register(self.engine.as_mut(), index, value)
    }

    pub fn read_csr(&self, csr: u16) -> Option<u32> {
        self.engine.read_csr(csr)
    }

    pub fn write_csr(&mut self, csr: u16, value: u32) -> bool {
        self.engine.write_csr(csr, value)
    }

    pub fn interrupt_state(&self) -> Option<InterruptState> {
        self.engine.interrupt_state()
    }

    pub fn virtual_to_physical(&self, addr: u64) -> Option<u64> {
        DebugController::virtual_to_physical(self.engine.as_ref(), addr)
    }

    pub fn register_names(&self) -> Vec<String> {
        self.engine.register_names()
    }
}

impl DeviceLifecycle for Core {
    fn id(&self) -> usize {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn clock_hz(&self) -> u64 {
        self.clock_hz
    }

    fn set_clock(&mut self, hz: u64) {
        self.clock_hz = hz;
        self.bridge.set_clock(hz);
        self.engine.set_clock(hz);
    }

    fn reset(&mut self) {
        self.engine.reset(self.reset_vector);
        self.bridge.invalidate_windows();
        self.debug.reset();
        self.counters = CoreCounters::default();
    }
}

/// The environment a core hands its engine for one `simulate` call.
struct BridgePort<'a> {
    bridge: &'a mut TransactionBridge,
    debug: &'a mut DebugController,
    bus: &'a mut SystemBus,
    now: SimTime,
}

impl ExecutionEnvironment for BridgePort<'_> {
    fn core_id(&self) -> usize {
        self.bridge.core()
    }

    fn transact(&mut self, req: &mut Request<'_>, ctx: CpuContext) -> Response {
        self.bridge.transact(self.bus, self.now, req, ctx)
    }

    fn direct_window(
        &self,
        space: MemorySpace,
        direction: Direction,
        addr: u64,
        len: usize,
    ) -> Option<&DirectAccessWindow> {
        // Stores must reach the exclusive monitor while any reservation is live.
        if direction == Direction::Write && self.bus.monitor().is_active() {
            return None;
        }
        self.bridge.window(space, addr, len, self.bus.generation())
    }

    fn breakpoint_at(&mut self, pc: u64) -> bool {
        self.debug.breakpoint_at(pc)
    }

    fn watchpoint_hit(&mut self, addr: u64, size: usize, kind: WatchKind) -> Option<WatchHit> {
        self.debug.watchpoint_hit(addr, size, kind)
    }
}
