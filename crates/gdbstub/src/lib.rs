// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! GDB remote protocol session attached to one core of a [`Topology`].
//!
//! Continue and single step drive the shared [`StepScheduler`], so the
//! other cores and the devices advance exactly as they would without a
//! debugger attached.

use core::convert::Infallible;
use gdbstub::common::Signal;
use gdbstub::conn::ConnectionExt;
use gdbstub::stub::run_blocking::{BlockingEventLoop, Event, WaitForStopReasonError};
use gdbstub::stub::{GdbStub, SingleThreadStopReason};
use gdbstub::target::ext::base::singlethread::{
    SingleThreadBase, SingleThreadResume, SingleThreadResumeOps, SingleThreadSingleStep,
    SingleThreadSingleStepOps,
};
use gdbstub::target::ext::base::BaseOps;
use gdbstub::target::ext::breakpoints::{
    Breakpoints, BreakpointsOps, HwWatchpoint, HwWatchpointOps, SwBreakpoint, SwBreakpointOps,
    WatchKind as GdbWatchKind,
};
use gdbstub::target::ext::monitor_cmd::{ConsoleOutput, MonitorCmd, MonitorCmdOps};
use gdbstub::target::{Target, TargetError, TargetResult};
use gdbstub_arch::riscv::reg::RiscvCoreRegs;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io;
use std::marker::PhantomData;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};
use vp_core::debug::{DebugEvent, DebugSubscriber, WatchKind};
use vp_core::engine::{NUM_GPRS, REG_NPC};
use vp_core::{DeviceLifecycle, StepScheduler, StopReason, Topology};
use vp_loader::SymbolTable;

pub use gdbstub::stub::DisconnectReason;

/// Scheduler rounds between checks for incoming debugger data.
const ROUNDS_PER_POLL: u64 = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind GDB server on port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("GDB connection error: {0}")]
    Io(#[from] io::Error),
    #[error("GDB protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecMode {
    Continue,
    Step,
}

/// What interrupted [`VpTarget::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    IncomingData,
    Stopped(SingleThreadStopReason<u32>),
}

fn to_watch_kind(kind: GdbWatchKind) -> WatchKind {
    match kind {
        GdbWatchKind::Write => WatchKind::Write,
        GdbWatchKind::Read => WatchKind::Read,
        GdbWatchKind::ReadWrite => WatchKind::Access,
    }
}

fn to_gdb_watch_kind(kind: WatchKind) -> GdbWatchKind {
    match kind {
        WatchKind::Write => GdbWatchKind::Write,
        WatchKind::Read => GdbWatchKind::Read,
        WatchKind::Access => GdbWatchKind::ReadWrite,
    }
}

/// Debug events of the session's core, queued until the next stop reply.
#[derive(Debug, Clone, Default)]
struct EventQueue(Arc<Mutex<VecDeque<DebugEvent>>>);

impl EventQueue {
    fn take_last(&self) -> Option<DebugEvent> {
        let mut queue = self.0.lock().ok()?;
        let last = queue.pop_back();
        queue.clear();
        last
    }
}

impl DebugSubscriber for EventQueue {
    fn on_event(&mut self, event: &DebugEvent) {
        if let Ok(mut queue) = self.0.lock() {
            queue.push_back(*event);
        }
    }
}

pub struct VpTarget<'a> {
    topology: &'a mut Topology,
    scheduler: &'a mut StepScheduler,
    core: usize,
    symbols: Option<&'a SymbolTable>,
    exec: ExecMode,
    breakpoints: Vec<u64>,
    watchpoints: Vec<(u64, u64, WatchKind)>,
    events: EventQueue,
}

impl<'a> VpTarget<'a> {
    /// Attaches to `core`, replacing any debug event subscriber it had
    /// until [`teardown`](Self::teardown).
    pub fn new(
        topology: &'a mut Topology,
        scheduler: &'a mut StepScheduler,
        core: usize,
        symbols: Option<&'a SymbolTable>,
    ) -> Self {
        let events = EventQueue::default();
        if let Some(c) = topology.core_mut(core) {
            c.debug_mut().attach(Box::new(events.clone()));
        }
        Self {
            topology,
            scheduler,
            core,
            symbols,
            exec: ExecMode::Continue,
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
            events,
        }
    }

    pub fn core(&self) -> usize {
        self.core
    }

    fn describe(&self, addr: u64) -> String {
        match self.symbols.and_then(|s| s.nearest(addr)) {
            Some(sym) => format!("{:#x} <{}>", addr, sym),
            None => format!("{:#x}", addr),
        }
    }

    fn stop_reason(&self, reason: StopReason) -> SingleThreadStopReason<u32> {
        match reason {
            StopReason::Exit { code, .. } => {
                info!("Target exited with code {}", code);
                SingleThreadStopReason::Exited(code as u8)
            }
            StopReason::DurationReached => SingleThreadStopReason::Terminated(Signal::SIGXCPU),
            StopReason::ExternalStop => SingleThreadStopReason::Signal(Signal::SIGINT),
            StopReason::Breakpoint { core, pc } if core == self.core => {
                info!("Breakpoint hit at {}", self.describe(pc));
                SingleThreadStopReason::SwBreak(())
            }
            StopReason::Watchpoint { core, hit } if core == self.core => {
                let pc = self.topology.core(core).map_or(0, |c| c.pc());
                info!(
                    "Watchpoint hit: {:?} of {:#x}, stopped at {}",
                    hit.kind,
                    hit.addr,
                    self.describe(pc)
                );
                SingleThreadStopReason::Watch {
                    tid: (),
                    kind: to_gdb_watch_kind(hit.kind),
                    addr: hit.addr as u32,
                }
            }
            other => {
                debug!("Stop on another core: {:?}", other);
                SingleThreadStopReason::Signal(Signal::SIGTRAP)
            }
        }
    }

    /// Prefers this core's own breakpoint or watchpoint over a stop the
    /// scheduler attributed to another core in the same round.
    fn stop_reply(&self, reason: StopReason) -> SingleThreadStopReason<u32> {
        let own = self.events.take_last();
        let reason = match (reason, own) {
            (StopReason::Breakpoint { core, .. } | StopReason::Watchpoint { core, .. }, Some(event))
                if core != self.core =>
            {
                match event {
                    DebugEvent::BreakpointHit { core, pc } => StopReason::Breakpoint { core, pc },
                    DebugEvent::WatchpointHit { core, hit } => StopReason::Watchpoint { core, hit },
                    DebugEvent::Exit { .. } => reason,
                }
            }
            _ => reason,
        };
        self.stop_reason(reason)
    }

    /// Advances the platform according to the last resume request.
    /// `incoming` is polled between scheduler chunks while continuing.
    pub fn run(&mut self, mut incoming: impl FnMut() -> bool) -> RunEvent {
        if self.exec == ExecMode::Step {
            let reason = self.scheduler.step_core(self.topology, self.core);
            return RunEvent::Stopped(match reason {
                Some(r) => self.stop_reply(r),
                None => SingleThreadStopReason::DoneStep,
            });
        }
        loop {
            if incoming() {
                return RunEvent::IncomingData;
            }
            if let Some(reason) = self.scheduler.run_rounds(self.topology, ROUNDS_PER_POLL) {
                return RunEvent::Stopped(self.stop_reply(reason));
            }
        }
    }

    /// Removes every breakpoint and watchpoint this session inserted and
    /// detaches from the core's debug events.
    pub fn teardown(&mut self) {
        let Some(core) = self.topology.core_mut(self.core) else {
            return;
        };
        core.debug_mut().detach();
        for addr in self.breakpoints.drain(..) {
            let _ = core.debug_mut().remove_breakpoint(addr);
        }
        for (addr, len, kind) in self.watchpoints.drain(..) {
            let _ = core.debug_mut().remove_watchpoint(addr, len, kind);
        }
    }
}

const MONITOR_HELP: &str = "\
pic               interrupt mask, pending lines and line levels of this core
spr <n> [value]   read or write control/status register <n>
help              this text
";

fn line_list(bits: u32) -> String {
    let lines: Vec<String> = (0..32u32)
        .filter(|i| bits & (1 << i) != 0)
        .map(|i| i.to_string())
        .collect();
    if lines.is_empty() {
        "none".to_string()
    } else {
        lines.join(", ")
    }
}

impl VpTarget<'_> {
    /// Runs one `monitor` command and returns its console text.
    pub fn monitor(&mut self, cmd: &str) -> String {
        let mut words = cmd.split_whitespace();
        match words.next() {
            Some("pic") => self.monitor_pic(),
            Some("spr") => {
                let args: Vec<&str> = words.collect();
                self.monitor_spr(&args)
            }
            Some("help") | None => MONITOR_HELP.to_string(),
            Some(other) => format!("unknown command '{}'\n{}", other, MONITOR_HELP),
        }
    }

    fn monitor_pic(&self) -> String {
        let Some(core) = self.topology.core(self.core) else {
            return format!("no core {}\n", self.core);
        };
        let mut out = String::new();
        let _ = writeln!(out, "{} interrupt controller status", core.name());
        match core.interrupt_state() {
            Some(state) => {
                let _ = writeln!(out, "  PICSR: 0x{:08x}", state.pending);
                let _ = writeln!(out, "  PICMR: 0x{:08x}", state.mask);
                let _ = writeln!(out, "  Masked: {}", line_list(!state.mask));
                let _ = writeln!(out, "  Pending: {}", line_list(state.pending));
            }
            None => {
                let _ = writeln!(out, "  engine has no interrupt controller");
            }
        }
        let now = self.scheduler.now();
        for (dest, record) in self.topology.fabric().lines() {
            if dest.core != self.core {
                continue;
            }
            let _ = writeln!(
                out,
                "  irq{}: {} ({}), {} asserts, {} asserted",
                dest.line,
                if record.line.level() { "high" } else { "low" },
                record.sources.join(", "),
                record.line.asserts(),
                record.line.total_asserted(now)
            );
        }
        out
    }

    fn monitor_spr(&mut self, args: &[&str]) -> String {
        let usage = "usage: spr <n> [value]\n".to_string();
        let Some(number) = args.first() else {
            return usage;
        };
        let csr = match parse_number(number).and_then(|n| u16::try_from(n).ok()) {
            Some(n) if n < 0x1000 => n,
            _ => return format!("invalid register number '{}'\n", number),
        };
        let Some(core) = self.topology.core_mut(self.core) else {
            return format!("no core {}\n", self.core);
        };
        match args.get(1) {
            None => match core.read_csr(csr) {
                Some(v) => format!("SPR[0x{:03x}] = 0x{:08x}\n", csr, v),
                None => format!("SPR[0x{:03x}] does not exist\n", csr),
            },
            Some(value) => {
                let Some(v) = parse_number(value).and_then(|v| u32::try_from(v).ok()) else {
                    return format!("invalid value '{}'\n", value);
                };
                if core.write_csr(csr, v) {
                    debug!("Debugger wrote {:#x} to CSR {:#x}", v, csr);
                    format!("SPR[0x{:03x}] = 0x{:08x} written\n", csr, v)
                } else {
                    format!("SPR[0x{:03x}] is not writable\n", csr)
                }
            }
        }
    }
}

fn parse_number(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl MonitorCmd for VpTarget<'_> {
    fn handle_monitor_cmd(
        &mut self,
        cmd: &[u8],
        mut out: ConsoleOutput<'_>,
    ) -> Result<(), Self::Error> {
        let text = match std::str::from_utf8(cmd) {
            Ok(cmd) => self.monitor(cmd),
            Err(_) => "command is not valid UTF-8\n".to_string(),
        };
        out.write_raw(text.as_bytes());
        Ok(())
    }
}

impl Target for VpTarget<'_> {
    type Arch = gdbstub_arch::riscv::Riscv32;
    type Error = Infallible;

    fn base_ops(&mut self) -> BaseOps<'_, Self::Arch, Self::Error> {
        BaseOps::SingleThread(self)
    }

    fn support_breakpoints(&mut self) -> Option<BreakpointsOps<'_, Self>> {
        Some(self)
    }

    fn support_monitor_cmd(&mut self) -> Option<MonitorCmdOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadBase for VpTarget<'_> {
    fn read_registers(&mut self, regs: &mut RiscvCoreRegs<u32>) -> TargetResult<(), Self> {
        let core = self.topology.core(self.core).ok_or(TargetError::NonFatal)?;
        for (i, reg) in regs.x.iter_mut().enumerate().take(NUM_GPRS) {
            *reg = core.read_register(i).map_err(|_| TargetError::NonFatal)?;
        }
        regs.pc = core.read_register(REG_NPC).map_err(|_| TargetError::NonFatal)?;
        Ok(())
    }

    fn write_registers(&mut self, regs: &RiscvCoreRegs<u32>) -> TargetResult<(), Self> {
        let core = self.topology.core_mut(self.core).ok_or(TargetError::NonFatal)?;
        // x0 is hardwired.
        for (i, value) in regs.x.iter().enumerate().skip(1).take(NUM_GPRS - 1) {
            core.write_register(i, *value).map_err(|_| TargetError::NonFatal)?;
        }
        core.write_register(REG_NPC, regs.pc)
            .map_err(|_| TargetError::NonFatal)?;
        Ok(())
    }

    fn read_addrs(&mut self, start_addr: u32, data: &mut [u8]) -> TargetResult<usize, Self> {
        self.topology
            .read_memory(self.core, start_addr as u64, data)
            .map_err(|e| {
                debug!("GDB read of {:#x} failed: {}", start_addr, e);
                TargetError::NonFatal
            })?;
        Ok(data.len())
    }

    fn write_addrs(&mut self, start_addr: u32, data: &[u8]) -> TargetResult<(), Self> {
        self.topology
            .write_memory(self.core, start_addr as u64, data)
            .map_err(|e| {
                debug!("GDB write of {:#x} failed: {}", start_addr, e);
                TargetError::NonFatal
            })
    }

    fn support_resume(&mut self) -> Option<SingleThreadResumeOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadResume for VpTarget<'_> {
    fn resume(&mut self, signal: Option<Signal>) -> Result<(), Self::Error> {
        if let Some(signal) = signal {
            debug!("Ignoring resume signal {:?}", signal);
        }
        self.exec = ExecMode::Continue;
        Ok(())
    }

    fn support_single_step(&mut self) -> Option<SingleThreadSingleStepOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadSingleStep for VpTarget<'_> {
    fn step(&mut self, signal: Option<Signal>) -> Result<(), Self::Error> {
        if let Some(signal) = signal {
            debug!("Ignoring step signal {:?}", signal);
        }
        self.exec = ExecMode::Step;
        Ok(())
    }
}

impl Breakpoints for VpTarget<'_> {
    fn support_sw_breakpoint(&mut self) -> Option<SwBreakpointOps<'_, Self>> {
        Some(self)
    }

    fn support_hw_watchpoint(&mut self) -> Option<HwWatchpointOps<'_, Self>> {
        Some(self)
    }
}

impl SwBreakpoint for VpTarget<'_> {
    fn add_sw_breakpoint(&mut self, addr: u32, _kind: usize) -> TargetResult<bool, Self> {
        let addr = addr as u64;
        let core = self.topology.core_mut(self.core).ok_or(TargetError::NonFatal)?;
        if core.debug_mut().insert_breakpoint(addr).is_err() {
            return Ok(false);
        }
        if !self.breakpoints.contains(&addr) {
            self.breakpoints.push(addr);
        }
        debug!("Breakpoint set at {}", self.describe(addr));
        Ok(true)
    }

    fn remove_sw_breakpoint(&mut self, addr: u32, _kind: usize) -> TargetResult<bool, Self> {
        let addr = addr as u64;
        let core = self.topology.core_mut(self.core).ok_or(TargetError::NonFatal)?;
        let removed = core.debug_mut().remove_breakpoint(addr).unwrap_or(false);
        self.breakpoints.retain(|a| *a != addr);
        Ok(removed)
    }
}

impl HwWatchpoint for VpTarget<'_> {
    fn add_hw_watchpoint(
        &mut self,
        addr: u32,
        len: u32,
        kind: GdbWatchKind,
    ) -> TargetResult<bool, Self> {
        let (addr, len, kind) = (addr as u64, len as u64, to_watch_kind(kind));
        let core = self.topology.core_mut(self.core).ok_or(TargetError::NonFatal)?;
        if core.debug_mut().insert_watchpoint(addr, len, kind).is_err() {
            return Ok(false);
        }
        self.watchpoints.push((addr, len, kind));
        Ok(true)
    }

    fn remove_hw_watchpoint(
        &mut self,
        addr: u32,
        len: u32,
        kind: GdbWatchKind,
    ) -> TargetResult<bool, Self> {
        let (addr, len, kind) = (addr as u64, len as u64, to_watch_kind(kind));
        let core = self.topology.core_mut(self.core).ok_or(TargetError::NonFatal)?;
        let removed = core
            .debug_mut()
            .remove_watchpoint(addr, len, kind)
            .unwrap_or(false);
        self.watchpoints.retain(|w| *w != (addr, len, kind));
        Ok(removed)
    }
}

pub struct SessionLoop<'a>(PhantomData<&'a mut ()>);

impl<'a> BlockingEventLoop for SessionLoop<'a> {
    type Target = VpTarget<'a>;
    type Connection = TcpStream;
    type StopReason = SingleThreadStopReason<u32>;

    fn wait_for_stop_reason(
        target: &mut Self::Target,
        conn: &mut Self::Connection,
    ) -> Result<Event<Self::StopReason>, WaitForStopReasonError<Infallible, io::Error>> {
        let mut failed = None;
        let event = target.run(|| match ConnectionExt::peek(conn) {
            Ok(byte) => byte.is_some(),
            Err(e) => {
                failed = Some(e);
                true
            }
        });
        if let Some(e) = failed {
            return Err(WaitForStopReasonError::Connection(e));
        }
        match event {
            RunEvent::IncomingData => {
                let byte = ConnectionExt::read(conn).map_err(WaitForStopReasonError::Connection)?;
                Ok(Event::IncomingData(byte))
            }
            RunEvent::Stopped(reason) => Ok(Event::TargetStopped(reason)),
        }
    }

    fn on_interrupt(_target: &mut Self::Target) -> Result<Option<Self::StopReason>, Infallible> {
        Ok(Some(SingleThreadStopReason::Signal(Signal::SIGINT)))
    }
}

pub struct GdbServer {
    listener: TcpListener,
    port: u16,
}

impl GdbServer {
    /// Binds on all interfaces. Port 0 picks a free port.
    pub fn bind(port: u16) -> Result<Self, SessionError> {
        let listener =
            TcpListener::bind(("0.0.0.0", port)).map_err(|source| SessionError::Bind { port, source })?;
        let port = listener.local_addr()?.port();
        info!("GDB server listening on 0.0.0.0:{}", port);
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Blocks until a debugger connects.
    pub fn accept(&self) -> Result<TcpStream, SessionError> {
        self.listener.set_nonblocking(false)?;
        let (stream, addr) = self.listener.accept()?;
        info!("GDB client connected from {}", addr);
        Ok(stream)
    }

    pub fn try_accept(&self) -> Result<Option<TcpStream>, SessionError> {
        self.listener.set_nonblocking(true)?;
        match self.listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                info!("GDB client connected from {}", addr);
                Ok(Some(stream))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs one session to completion. Breakpoints and watchpoints inserted
    /// by the debugger are removed when it ends, however it ends.
    pub fn serve<'a>(
        stream: TcpStream,
        target: &mut VpTarget<'a>,
    ) -> Result<DisconnectReason, SessionError> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let result = GdbStub::new(stream)
            .run_blocking::<SessionLoop<'a>>(target)
            .map_err(|e| SessionError::Protocol(format!("{:?}", e)));
        target.teardown();
        match &result {
            Ok(reason) => info!("GDB session ended: {:?}", reason),
            Err(e) => warn!("GDB session aborted: {}", e),
        }
        result
    }
}
