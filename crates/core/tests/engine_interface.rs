// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::sync::{Arc, Mutex};
use vp_config::PlatformConfig;
use vp_core::debug::{DebugEvent, DebugSubscriber};
use vp_core::engine::{CoreEngine, CpuContext, ExecutionEnvironment, StepOutcome, StepResult};
use vp_core::{
    CoreState, Direction, MemorySpace, Request, Response, StepScheduler, StopReason, Topology,
};

const RTC: u64 = 0x9000_4000;

#[derive(Debug, Clone, Copy)]
enum Op {
    Store { addr: u64, value: u32 },
    Load { addr: u64 },
    Exit(u32),
}

/// Replays a fixed list of memory operations, one per cycle, then idles.
#[derive(Debug, Default)]
struct ScriptEngine {
    ops: Vec<Op>,
    next: usize,
    pc: u32,
    /// Responses seen, in order.
    responses: Arc<Mutex<Vec<Response>>>,
    /// Interrupt line changes delivered to this engine.
    irqs: Arc<Mutex<Vec<(u32, bool)>>>,
    fast_path_hits: Arc<Mutex<u64>>,
}

impl ScriptEngine {
    fn access(&mut self, env: &mut dyn ExecutionEnvironment, op: Op) -> u64 {
        let (addr, direction, mut buf) = match op {
            Op::Store { addr, value } => (addr, Direction::Write, value.to_le_bytes()),
            Op::Load { addr } => (addr, Direction::Read, [0u8; 4]),
            Op::Exit(_) => return 0,
        };
        if let Some(w) = env.direct_window(MemorySpace::Data, direction, addr, 4) {
            let ok = match direction {
                Direction::Read => w.read(addr, &mut buf),
                Direction::Write => w.write(addr, &buf),
            };
            if ok {
                *self.fast_path_hits.lock().unwrap() += 1;
                return w.cycles(direction);
            }
        }
        let mut req = match direction {
            Direction::Read => Request::read(MemorySpace::Data, addr, &mut buf),
            Direction::Write => Request::write(MemorySpace::Data, addr, &mut buf),
        };
        let ctx = CpuContext {
            pc: self.pc as u64,
            sp: 0,
        };
        let resp = env.transact(&mut req, ctx);
        self.responses.lock().unwrap().push(resp);
        req.cycles
    }
}

impl CoreEngine for ScriptEngine {
    fn name(&self) -> &str {
        "script"
    }

    fn reset(&mut self, vector: u64) {
        self.pc = vector as u32;
        self.next = 0;
    }

    fn set_core_id(&mut self, _id: usize) {}

    fn set_clock(&mut self, _hz: u64) {}

    fn step(&mut self, env: &mut dyn ExecutionEnvironment, max_cycles: u64) -> StepOutcome {
        let mut out = StepOutcome::default();
        while out.cycles < max_cycles {
            let Some(op) = self.ops.get(self.next).copied() else {
                out.sleep_cycles += max_cycles - out.cycles;
                out.cycles = max_cycles;
                break;
            };
            self.next += 1;
            self.pc += 4;
            out.instructions += 1;
            out.cycles += 1 + self.access(env, op);
            if let Op::Exit(code) = op {
                out.result = StepResult::Exit { code };
                break;
            }
        }
        out
    }

    fn interrupt(&mut self, line: u32, level: bool) {
        self.irqs.lock().unwrap().push((line, level));
    }

    fn gpr(&self, _index: usize) -> u32 {
        0
    }

    fn set_gpr(&mut self, _index: usize, _value: u32) {}

    fn pc(&self) -> u32 {
        self.pc
    }

    fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    fn ppc(&self) -> u32 {
        self.pc.wrapping_sub(4)
    }

    fn set_ppc(&mut self, _ppc: u32) {}

    fn sr(&self) -> u32 {
        0
    }

    fn set_sr(&mut self, _sr: u32) {}

    fn stack_pointer(&self) -> u32 {
        0
    }
}

struct Observed {
    responses: Vec<Arc<Mutex<Vec<Response>>>>,
    irqs: Vec<Arc<Mutex<Vec<(u32, bool)>>>>,
    fast: Vec<Arc<Mutex<u64>>>,
}

fn build(overrides: &[&str], scripts: Vec<Vec<Op>>) -> (Topology, Observed) {
    let mut all = vec!["system.mem=0x0+64KiB"];
    all.extend_from_slice(overrides);
    let config = PlatformConfig::with_overrides(all).unwrap();
    let mut observed = Observed {
        responses: Vec::new(),
        irqs: Vec::new(),
        fast: Vec::new(),
    };
    let mut engines: Vec<ScriptEngine> = scripts
        .into_iter()
        .map(|ops| ScriptEngine {
            ops,
            ..ScriptEngine::default()
        })
        .collect();
    for e in &engines {
        observed.responses.push(e.responses.clone());
        observed.irqs.push(e.irqs.clone());
        observed.fast.push(e.fast_path_hits.clone());
    }
    engines.reverse();
    let topo = Topology::build_with(&config, |_| {
        let engine: Box<dyn CoreEngine> = Box::new(engines.pop().unwrap_or_default());
        Ok(engine)
    })
    .unwrap();
    (topo, observed)
}

#[test]
fn broadcast_interrupt_reaches_every_core() {
    let (mut topo, observed) = build(
        &["system.nrcpu=3", "system.duration=3us"],
        vec![vec![Op::Store { addr: RTC, value: 1 }], vec![], vec![]],
    );
    let mut sched = StepScheduler::for_topology(&topo);
    assert_eq!(sched.run(&mut topo), StopReason::DurationReached);
    for irqs in &observed.irqs {
        assert_eq!(*irqs.lock().unwrap(), vec![(9, true)]);
    }
}

#[test]
fn subset_interrupt_skips_unselected_core() {
    let (mut topo, observed) = build(
        &["system.nrcpu=3", "system.rtc.irq_cores=1", "system.duration=2us"],
        vec![vec![Op::Store { addr: RTC, value: 1 }], vec![], vec![]],
    );
    let mut sched = StepScheduler::for_topology(&topo);
    sched.run(&mut topo);
    assert!(observed.irqs[0].lock().unwrap().is_empty());
    assert_eq!(*observed.irqs[1].lock().unwrap(), vec![(9, true)]);
    assert!(observed.irqs[2].lock().unwrap().is_empty());
}

#[test]
fn per_core_line_numbers_are_honored() {
    let (mut topo, observed) = build(
        &["system.nrcpu=2", "system.cpu1.irq_rtc=17", "system.duration=2us"],
        vec![
            vec![
                Op::Store { addr: RTC, value: 1 },
                Op::Store { addr: RTC, value: 0 },
            ],
            vec![],
        ],
    );
    let mut sched = StepScheduler::for_topology(&topo);
    sched.run(&mut topo);
    // Both stores land in the first round, so the level never changes.
    assert!(observed.irqs[0].lock().unwrap().is_empty());
    assert!(observed.irqs[1].lock().unwrap().is_empty());

    let (mut topo, observed) = build(
        &["system.nrcpu=2", "system.cpu1.irq_rtc=17", "system.duration=2us", "system.quantum=10ns"],
        vec![vec![Op::Store { addr: RTC, value: 1 }], vec![]],
    );
    let mut sched = StepScheduler::for_topology(&topo);
    sched.run(&mut topo);
    assert_eq!(*observed.irqs[0].lock().unwrap(), vec![(9, true)]);
    assert_eq!(*observed.irqs[1].lock().unwrap(), vec![(17, true)]);
}

#[test]
fn bus_error_is_returned_to_the_engine() {
    let (mut topo, observed) = build(
        &[],
        vec![vec![Op::Load { addr: 0x10 }, Op::Load { addr: 0x8000_0000 }, Op::Exit(3)]],
    );
    let mut sched = StepScheduler::for_topology(&topo);
    assert_eq!(sched.run(&mut topo), StopReason::Exit { core: 0, code: 3 });
    assert_eq!(
        *observed.responses[0].lock().unwrap(),
        vec![Response::Success, Response::Error]
    );
    assert_eq!(topo.core(0).unwrap().bridge_stats().bus_errors, 1);
}

#[test]
fn data_window_serves_later_accesses() {
    let (mut topo, observed) = build(
        &["system.mem.read_latency=20ns", "system.mem.write_latency=30ns"],
        vec![vec![
            Op::Store { addr: 0x100, value: 7 },
            Op::Load { addr: 0x100 },
            Op::Load { addr: 0x104 },
            Op::Exit(0),
        ]],
    );
    let mut sched = StepScheduler::for_topology(&topo);
    sched.run(&mut topo);
    assert_eq!(observed.responses[0].lock().unwrap().len(), 1);
    assert_eq!(*observed.fast[0].lock().unwrap(), 2);
    // 1 + 3 (store) + 1 + 2 + 1 + 2 (loads) + 1 (exit)
    assert_eq!(topo.core(0).unwrap().counters().cycles, 11);
}

#[test]
fn disabled_data_window_routes_through_bridge() {
    let (mut topo, observed) = build(
        &["system.cpu0.enable_data_dmi=false"],
        vec![vec![
            Op::Store { addr: 0x100, value: 7 },
            Op::Load { addr: 0x100 },
            Op::Exit(0),
        ]],
    );
    let mut sched = StepScheduler::for_topology(&topo);
    sched.run(&mut topo);
    assert_eq!(observed.responses[0].lock().unwrap().len(), 2);
    assert_eq!(*observed.fast[0].lock().unwrap(), 0);
}

#[derive(Debug)]
struct Events(Arc<Mutex<Vec<DebugEvent>>>);

impl DebugSubscriber for Events {
    fn on_event(&mut self, event: &DebugEvent) {
        self.0.lock().unwrap().push(*event);
    }
}

#[test]
fn exit_is_published_and_stops_every_core() {
    let (mut topo, _) = build(
        &["system.nrcpu=2"],
        vec![vec![Op::Load { addr: 0 }], vec![Op::Exit(9)]],
    );
    let events = Arc::new(Mutex::new(Vec::new()));
    topo.core_mut(1)
        .unwrap()
        .debug_mut()
        .attach(Box::new(Events(events.clone())));

    let mut sched = StepScheduler::for_topology(&topo);
    assert_eq!(sched.run(&mut topo), StopReason::Exit { core: 1, code: 9 });
    assert_eq!(
        *events.lock().unwrap(),
        vec![DebugEvent::Exit { core: 1, code: 9 }]
    );
    assert_eq!(topo.core(1).unwrap().state(), CoreState::Exited);
    let now = sched.now();
    assert_eq!(sched.run(&mut topo), StopReason::Exit { core: 1, code: 9 });
    assert_eq!(sched.now(), now, "time does not advance after exit");
}
