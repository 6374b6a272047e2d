// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Routing of device interrupt outputs to core interrupt inputs.
//!
//! Every device output is bound exactly once, either straight to one core
//! line or to a fan-out point with one output per destination. Destinations
//! driven by more than one binding see the OR of their drivers.

use crate::bus::SystemBus;
use crate::signals::InterruptLine;
use crate::{SimResult, SimTime, SimulationError};
use std::collections::BTreeMap;
use std::fmt;

/// One interrupt output of a mapped device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqSource {
    /// Bus device index.
    pub device: usize,
    pub output: usize,
}

/// A numbered interrupt input of one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqDestination {
    pub core: usize,
    pub line: u32,
}

impl fmt::Display for IrqDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}.irq{}", self.core, self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FanOutput {
    dest: IrqDestination,
    broadcast: bool,
    selected: bool,
}

impl FanOutput {
    fn driven(&self) -> bool {
        self.broadcast || self.selected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Direct {
        source: IrqSource,
        dest: IrqDestination,
    },
    FanOut {
        source: IrqSource,
        outputs: Vec<FanOutput>,
    },
}

impl Binding {
    fn source(&self) -> IrqSource {
        match self {
            Binding::Direct { source, .. } | Binding::FanOut { source, .. } => *source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingId(usize);

/// Observed state of one destination line.
#[derive(Debug, Clone, Default)]
pub struct LineRecord {
    /// Names of the devices wired to this line.
    pub sources: Vec<String>,
    pub line: InterruptLine,
}

#[derive(Debug, Default)]
pub struct InterruptFabric {
    bindings: Vec<(String, Binding)>,
    lines: BTreeMap<IrqDestination, LineRecord>,
}

impl InterruptFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_unbound(&self, source: IrqSource) -> SimResult<()> {
        if let Some((name, _)) = self.bindings.iter().find(|(_, b)| b.source() == source) {
            return Err(SimulationError::Topology(format!(
                "output {} of '{}' is already bound",
                source.output, name
            )));
        }
        Ok(())
    }

    fn register(&mut self, name: &str, dest: IrqDestination) {
        let record = self.lines.entry(dest).or_default();
        if !record.sources.iter().any(|s| s == name) {
            record.sources.push(name.to_string());
        }
    }

    /// Wires `source` straight to one core input.
    pub fn bind_direct(
        &mut self,
        name: &str,
        source: IrqSource,
        dest: IrqDestination,
    ) -> SimResult<BindingId> {
        self.check_unbound(source)?;
        self.register(name, dest);
        tracing::debug!("irq: {} output {} -> {}", name, source.output, dest);
        self.bindings
            .push((name.to_string(), Binding::Direct { source, dest }));
        Ok(BindingId(self.bindings.len() - 1))
    }

    /// Creates a fan-out point for `source` with no outputs yet.
    pub fn bind_fanout(&mut self, name: &str, source: IrqSource) -> SimResult<BindingId> {
        self.check_unbound(source)?;
        self.bindings.push((
            name.to_string(),
            Binding::FanOut {
                source,
                outputs: Vec::new(),
            },
        ));
        Ok(BindingId(self.bindings.len() - 1))
    }

    fn fanout_mut(&mut self, id: BindingId) -> SimResult<(&str, &mut Vec<FanOutput>)> {
        match self.bindings.get_mut(id.0) {
            Some((name, Binding::FanOut { outputs, .. })) => Ok((name.as_str(), outputs)),
            Some((name, Binding::Direct { .. })) => Err(SimulationError::Topology(format!(
                "'{}' is bound directly, not through a fan-out",
                name
            ))),
            None => Err(SimulationError::Topology(format!(
                "unknown interrupt binding {}",
                id.0
            ))),
        }
    }

    /// Adds a destination to a fan-out. Broadcast outputs mirror the source;
    /// others stay undriven until [`select`](Self::select)ed.
    pub fn add_output(
        &mut self,
        id: BindingId,
        dest: IrqDestination,
        broadcast: bool,
    ) -> SimResult<()> {
        let (name, outputs) = self.fanout_mut(id)?;
        if outputs.iter().any(|o| o.dest == dest) {
            return Err(SimulationError::Topology(format!(
                "'{}' already drives {}",
                name, dest
            )));
        }
        outputs.push(FanOutput {
            dest,
            broadcast,
            selected: false,
        });
        let name = name.to_string();
        tracing::debug!(
            "irq: {} -> {}{}",
            name,
            dest,
            if broadcast { " (broadcast)" } else { "" }
        );
        self.register(&name, dest);
        Ok(())
    }

    /// Gates a non-broadcast fan-out destination on or off.
    pub fn select(&mut self, id: BindingId, dest: IrqDestination, selected: bool) -> SimResult<()> {
        let (name, outputs) = self.fanout_mut(id)?;
        let name = name.to_string();
        let out = outputs
            .iter_mut()
            .find(|o| o.dest == dest)
            .ok_or_else(|| SimulationError::Topology(format!("'{}' does not drive {}", name, dest)))?;
        out.selected = selected;
        Ok(())
    }

    /// Binds mailbox output `i` to the configured mailbox line of core `i`.
    ///
    /// `routes[i]` is `(core id, line)`; the mailbox must expose exactly one
    /// output per route.
    pub fn bind_mailbox(
        &mut self,
        name: &str,
        device: usize,
        outputs: usize,
        routes: &[(usize, u32)],
    ) -> SimResult<()> {
        if outputs != routes.len() {
            return Err(SimulationError::Topology(format!(
                "'{}' has {} outputs for {} cores",
                name,
                outputs,
                routes.len()
            )));
        }
        for &(core, line) in routes {
            self.bind_direct(
                name,
                IrqSource {
                    device,
                    output: core,
                },
                IrqDestination { core, line },
            )?;
        }
        Ok(())
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Destinations currently reachable from `source`.
    pub fn destinations(&self, source: IrqSource) -> Vec<IrqDestination> {
        match self.bindings.iter().find(|(_, b)| b.source() == source) {
            Some((_, Binding::Direct { dest, .. })) => vec![*dest],
            Some((_, Binding::FanOut { outputs, .. })) => outputs
                .iter()
                .filter(|o| o.driven())
                .map(|o| o.dest)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn level(&self, dest: IrqDestination) -> bool {
        self.lines.get(&dest).is_some_and(|r| r.line.level())
    }

    pub fn lines(&self) -> impl Iterator<Item = (&IrqDestination, &LineRecord)> {
        self.lines.iter()
    }

    /// Samples every bound device output and returns the destination lines
    /// whose level changed since the previous sample.
    pub fn sample(&mut self, bus: &SystemBus, now: SimTime) -> Vec<(IrqDestination, bool)> {
        let mut driven: BTreeMap<IrqDestination, bool> =
            self.lines.keys().map(|d| (*d, false)).collect();

        for (_, binding) in &self.bindings {
            let level = {
                let s = binding.source();
                bus.irq_level(s.device, s.output)
            };
            if !level {
                continue;
            }
            match binding {
                Binding::Direct { dest, .. } => {
                    driven.insert(*dest, true);
                }
                Binding::FanOut { outputs, .. } => {
                    for o in outputs.iter().filter(|o| o.driven()) {
                        driven.insert(o.dest, true);
                    }
                }
            }
        }

        let mut changes = Vec::new();
        for (dest, level) in driven {
            if let Some(record) = self.lines.get_mut(&dest) {
                if record.line.set(level, now) {
                    tracing::trace!("irq: {} -> {}", dest, level);
                    changes.push((dest, level));
                }
            }
        }
        changes
    }

    /// Drops every line level back to low and returns the destinations that
    /// were high, so their cores can be told.
    pub fn reset(&mut self, now: SimTime) -> Vec<IrqDestination> {
        let mut lowered = Vec::new();
        for (dest, record) in self.lines.iter_mut() {
            if record.line.set(false, now) {
                lowered.push(*dest);
            }
        }
        lowered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripherals::mailbox::{control_word, Mailbox};
    use crate::peripherals::register_block::RegisterBlock;
    use crate::{ByteOrder, Peripheral};
    use vp_config::AddressRange;

    fn dest(core: usize, line: u32) -> IrqDestination {
        IrqDestination { core, line }
    }

    fn bus_with_block() -> (SystemBus, IrqSource) {
        let mut bus = SystemBus::new();
        let dev = bus
            .map(
                "rtc",
                AddressRange::new(0x9000_4000, 0x9000_5FFF),
                Box::new(RegisterBlock::new("rtc", 0x2000, ByteOrder::Little)),
                SimTime::ZERO,
                SimTime::ZERO,
            )
            .unwrap();
        (bus, IrqSource { device: dev, output: 0 })
    }

    fn raise(bus: &mut SystemBus, level: bool) {
        bus.device_as_mut::<RegisterBlock>("rtc")
            .unwrap()
            .set_register(0, level as u32)
            .unwrap();
    }

    #[test]
    fn test_direct_binding_reports_changes_only() {
        let (mut bus, src) = bus_with_block();
        let mut fabric = InterruptFabric::new();
        fabric.bind_direct("rtc", src, dest(0, 9)).unwrap();

        assert!(fabric.sample(&bus, SimTime::ZERO).is_empty());
        raise(&mut bus, true);
        assert_eq!(fabric.sample(&bus, SimTime::from_us(1)), vec![(dest(0, 9), true)]);
        assert!(fabric.sample(&bus, SimTime::from_us(2)).is_empty());
        raise(&mut bus, false);
        assert_eq!(fabric.sample(&bus, SimTime::from_us(3)), vec![(dest(0, 9), false)]);

        let (_, record) = fabric.lines().next().unwrap();
        assert_eq!(record.sources, vec!["rtc".to_string()]);
        assert_eq!(record.line.asserts(), 1);
        assert_eq!(record.line.total_asserted(SimTime::from_us(3)), SimTime::from_us(2));
    }

    #[test]
    fn test_output_bound_only_once() {
        let (_, src) = bus_with_block();
        let mut fabric = InterruptFabric::new();
        fabric.bind_direct("rtc", src, dest(0, 9)).unwrap();
        assert!(fabric.bind_direct("rtc", src, dest(1, 9)).is_err());
        assert!(fabric.bind_fanout("rtc", src).is_err());
    }

    #[test]
    fn test_broadcast_to_three_cores() {
        let (mut bus, src) = bus_with_block();
        let mut fabric = InterruptFabric::new();
        let id = fabric.bind_fanout("rtc", src).unwrap();
        for core in 0..3 {
            fabric.add_output(id, dest(core, 9), true).unwrap();
        }
        raise(&mut bus, true);
        let changes = fabric.sample(&bus, SimTime::ZERO);
        assert_eq!(changes.len(), 3);
        assert!((0..3).all(|c| fabric.level(dest(c, 9))));

        // A non-broadcast destination added later is left alone.
        fabric.add_output(id, dest(3, 9), false).unwrap();
        assert!(fabric.sample(&bus, SimTime::ZERO).is_empty());
        assert!(!fabric.level(dest(3, 9)));

        raise(&mut bus, false);
        let changes = fabric.sample(&bus, SimTime::ZERO);
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|(d, level)| d.core < 3 && !level));
    }

    #[test]
    fn test_selected_destination_follows_source() {
        let (mut bus, src) = bus_with_block();
        let mut fabric = InterruptFabric::new();
        let id = fabric.bind_fanout("rtc", src).unwrap();
        fabric.add_output(id, dest(0, 9), true).unwrap();
        fabric.add_output(id, dest(1, 9), false).unwrap();
        assert_eq!(fabric.destinations(src), vec![dest(0, 9)]);

        fabric.select(id, dest(1, 9), true).unwrap();
        raise(&mut bus, true);
        fabric.sample(&bus, SimTime::ZERO);
        assert!(fabric.level(dest(1, 9)));

        fabric.select(id, dest(1, 9), false).unwrap();
        assert_eq!(fabric.sample(&bus, SimTime::ZERO), vec![(dest(1, 9), false)]);
        assert!(fabric.select(id, dest(2, 9), true).is_err());
        assert!(fabric.add_output(id, dest(0, 9), false).is_err());
    }

    #[test]
    fn test_shared_destination_is_or_combined() {
        let mut bus = SystemBus::new();
        let mut fabric = InterruptFabric::new();
        for (i, name) in ["a", "b"].iter().enumerate() {
            let base = 0x1000 * (i as u64 + 1);
            let dev = bus
                .map(
                    name,
                    AddressRange::new(base, base + 0xFFF),
                    Box::new(RegisterBlock::new(name, 0x1000, ByteOrder::Little)),
                    SimTime::ZERO,
                    SimTime::ZERO,
                )
                .unwrap();
            fabric
                .bind_direct(name, IrqSource { device: dev, output: 0 }, dest(0, 5))
                .unwrap();
        }
        let set = |bus: &mut SystemBus, name: &str, v: u32| {
            bus.device_as_mut::<RegisterBlock>(name)
                .unwrap()
                .set_register(0, v)
                .unwrap();
        };
        set(&mut bus, "a", 1);
        set(&mut bus, "b", 1);
        fabric.sample(&bus, SimTime::ZERO);
        set(&mut bus, "a", 0);
        assert!(fabric.sample(&bus, SimTime::ZERO).is_empty(), "b still drives");
        set(&mut bus, "b", 0);
        assert_eq!(fabric.sample(&bus, SimTime::ZERO), vec![(dest(0, 5), false)]);
    }

    #[test]
    fn test_mailbox_routes_by_core_identity() {
        let mut bus = SystemBus::new();
        let dev = bus
            .map(
                "ompic",
                AddressRange::new(0x9800_0000, 0x9800_1FFF),
                Box::new(Mailbox::new(2, ByteOrder::Little)),
                SimTime::ZERO,
                SimTime::ZERO,
            )
            .unwrap();
        let mut fabric = InterruptFabric::new();
        // Core 1 uses a non-default line number.
        fabric
            .bind_mailbox("ompic", dev, 2, &[(0, 1), (1, 7)])
            .unwrap();

        bus.device_mut(dev)
            .unwrap()
            .write(0, &control_word(1, 0x42).to_le_bytes())
            .unwrap();
        assert_eq!(fabric.sample(&bus, SimTime::ZERO), vec![(dest(1, 7), true)]);
        assert!(!fabric.level(dest(0, 1)));

        bus.device_mut(dev)
            .unwrap()
            .write(8, &control_word(0, 0x43).to_le_bytes())
            .unwrap();
        assert_eq!(fabric.sample(&bus, SimTime::ZERO), vec![(dest(0, 1), true)]);
    }

    #[test]
    fn test_reset_reports_lowered_lines() {
        let (mut bus, src) = bus_with_block();
        let mut fabric = InterruptFabric::new();
        let id = fabric.bind_fanout("rtc", src).unwrap();
        fabric.add_output(id, dest(0, 9), true).unwrap();
        fabric.add_output(id, dest(1, 9), false).unwrap();
        raise(&mut bus, true);
        fabric.sample(&bus, SimTime::ZERO);

        assert_eq!(fabric.reset(SimTime::from_us(1)), vec![dest(0, 9)]);
        assert!(!fabric.level(dest(0, 9)));
        assert!(fabric.reset(SimTime::from_us(2)).is_empty());
    }

    #[test]
    fn test_mailbox_output_count_must_match() {
        let mut fabric = InterruptFabric::new();
        assert!(fabric.bind_mailbox("ompic", 0, 3, &[(0, 1), (1, 1)]).is_err());
    }
}
