// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Quantum-based round robin over the cores of a [`Topology`].
//!
//! Each round gives every running core one slice of simulated time, then
//! advances devices and delivers interrupt level changes. Cores only yield
//! between slices.

use crate::debug::{CoreState, WatchHit};
use crate::{DeviceLifecycle, SimTime, Topology};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Requests a running scheduler to stop at the next round boundary.
/// Cloneable and usable from other threads.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// A core requested the end of the simulation. Terminal.
    Exit { core: usize, code: u32 },
    DurationReached,
    ExternalStop,
    Breakpoint { core: usize, pc: u64 },
    Watchpoint { core: usize, hit: WatchHit },
}

impl StopReason {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopReason::Exit { .. } | StopReason::DurationReached)
    }
}

#[derive(Debug)]
pub struct StepScheduler {
    quantum: SimTime,
    /// Zero means unbounded.
    duration: SimTime,
    now: SimTime,
    rounds: u64,
    exit: Option<(usize, u32)>,
    stop: StopHandle,
}

impl StepScheduler {
    pub fn new(quantum: SimTime, duration: SimTime) -> Self {
        Self {
            quantum,
            duration,
            now: SimTime::ZERO,
            rounds: 0,
            exit: None,
            stop: StopHandle::default(),
        }
    }

    pub fn for_topology(topology: &Topology) -> Self {
        let config = topology.config();
        Self::new(config.quantum.into(), config.duration.into())
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn quantum(&self) -> SimTime {
        self.quantum
    }

    pub fn duration(&self) -> SimTime {
        self.duration
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.is_some()
    }

    fn duration_reached(&self) -> bool {
        !self.duration.is_zero() && self.now >= self.duration
    }

    /// Runs until a stop condition. Cores paused at a breakpoint or
    /// watchpoint are resumed first.
    pub fn run(&mut self, topology: &mut Topology) -> StopReason {
        loop {
            if let Some(reason) = self.run_rounds(topology, u64::MAX) {
                return reason;
            }
        }
    }

    /// Like [`run`](Self::run) but gives up after `max_rounds` rounds,
    /// returning `None` if nothing stopped the simulation.
    pub fn run_rounds(&mut self, topology: &mut Topology, max_rounds: u64) -> Option<StopReason> {
        if let Some((core, code)) = self.exit {
            return Some(StopReason::Exit { core, code });
        }
        for core in topology.cores_mut() {
            if core.debug().is_paused() {
                core.resume();
            }
        }
        for _ in 0..max_rounds {
            if self.stop.take() {
                tracing::info!("Simulation stopped externally at {}", self.now);
                return Some(StopReason::ExternalStop);
            }
            if self.duration_reached() {
                tracing::info!("Simulation duration {} reached", self.duration);
                return Some(StopReason::DurationReached);
            }
            if let Some(reason) = self.round(topology) {
                return Some(reason);
            }
        }
        None
    }

    /// One quantum for every running core.
    fn round(&mut self, topology: &mut Topology) -> Option<StopReason> {
        let slice = if self.duration.is_zero() {
            self.quantum
        } else {
            self.quantum.min(self.duration - self.now)
        };
        let now = self.now;

        let mut hit = None;
        {
            let (cores, bus, _) = topology.parts_mut();
            for core in cores.iter_mut() {
                if core.state() != CoreState::Running {
                    continue;
                }
                let cycles = slice.cycles_at(core.clock_hz()).max(1);
                match core.simulate(bus, now, cycles) {
                    CoreState::Running => {}
                    CoreState::Exited => {
                        let code = core.debug().exit_code().unwrap_or(0);
                        let id = core.id();
                        self.exit = Some((id, code));
                        tracing::info!("Core {} exited with code {} at {}", id, code, now);
                        return Some(StopReason::Exit { core: id, code });
                    }
                    CoreState::AtBreakpoint => {
                        hit.get_or_insert(StopReason::Breakpoint {
                            core: core.id(),
                            pc: core.pc(),
                        });
                    }
                    CoreState::AtWatchpoint => {
                        if let Some(w) = core.debug().last_watchpoint() {
                            hit.get_or_insert(StopReason::Watchpoint {
                                core: core.id(),
                                hit: w,
                            });
                        }
                    }
                }
            }
        }

        self.now += slice;
        self.rounds += 1;
        topology.advance_devices(self.now);
        hit
    }

    /// Executes exactly one instruction on `core`, for debugger single-step.
    /// Other cores do not advance.
    pub fn step_core(&mut self, topology: &mut Topology, core: usize) -> Option<StopReason> {
        if let Some((core, code)) = self.exit {
            return Some(StopReason::Exit { core, code });
        }
        let now = self.now;
        let reason = {
            let (cores, bus, _) = topology.parts_mut();
            let c = cores.get_mut(core)?;
            c.resume();
            match c.simulate(bus, now, 1) {
                CoreState::Running => None,
                CoreState::Exited => {
                    let code = c.debug().exit_code().unwrap_or(0);
                    self.exit = Some((core, code));
                    Some(StopReason::Exit { core, code })
                }
                CoreState::AtBreakpoint => Some(StopReason::Breakpoint { core, pc: c.pc() }),
                CoreState::AtWatchpoint => c
                    .debug()
                    .last_watchpoint()
                    .map(|hit| StopReason::Watchpoint { core, hit }),
            }
        };
        topology.advance_devices(now);
        reason
    }
}
