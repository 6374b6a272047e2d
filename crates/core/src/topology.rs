// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Platform assembly from a resolved [`PlatformConfig`].
//!
//! Build order is fixed: cores first so their identities exist, then the
//! devices, then interrupt bindings (which read per-core line numbers).
//! Cores reach the bus through their bridges, which take the bus per access.

use crate::bus::SystemBus;
use crate::engine::{CoreEngine, Rv32Engine};
use crate::interrupt::{InterruptFabric, IrqDestination, IrqSource};
use crate::memory::{Memory, ProgramImage};
use crate::peripherals::{mailbox::Mailbox, register_block::RegisterBlock, uart::Uart};
use crate::{ByteOrder, Core, DeviceLifecycle, Peripheral, SimResult, SimTime, SimulationError};
use anyhow::Context;
use std::sync::{Arc, Mutex};
use vp_config::{CoreConfig, DeviceConfig, DeviceKind, IrqCores, PlatformConfig};

/// Register byte order of the memory-mapped devices, matching the engine.
pub const PLATFORM_BYTE_ORDER: ByteOrder = ByteOrder::Little;

/// Engine used when no factory is supplied: the RV32 reference engine.
pub fn default_engine(core: &CoreConfig) -> anyhow::Result<Box<dyn CoreEngine>> {
    let mut engine = Rv32Engine::new(core.enable_sleep_mode);
    if let Some(path) = &core.insn_trace_file {
        engine = engine.with_trace_file(path).with_context(|| {
            format!(
                "core {}: failed to create instruction trace {}",
                core.id,
                path.display()
            )
        })?;
    }
    Ok(Box::new(engine))
}

pub struct Topology {
    // Field order is teardown order.
    fabric: InterruptFabric,
    bus: SystemBus,
    cores: Vec<Core>,
    config: PlatformConfig,
}

impl Topology {
    pub fn build(config: &PlatformConfig) -> anyhow::Result<Self> {
        Self::build_with(config, default_engine)
    }

    /// Builds the platform, creating each core's engine with `factory`.
    pub fn build_with<F>(config: &PlatformConfig, mut factory: F) -> anyhow::Result<Self>
    where
        F: FnMut(&CoreConfig) -> anyhow::Result<Box<dyn CoreEngine>>,
    {
        let mut cores = Vec::with_capacity(config.nrcpu);
        for (id, cc) in config.cores.iter().enumerate() {
            if cc.id != id {
                return Err(SimulationError::Topology(format!(
                    "core identities must be contiguous, found {} at position {}",
                    cc.id, id
                ))
                .into());
            }
            let engine = factory(cc).with_context(|| format!("failed to create core {}", id))?;
            tracing::debug!("cpu{}: {} engine at {} Hz", id, engine.name(), cc.clock_hz);
            cores.push(Core::new(cc, engine));
        }

        let mut bus = SystemBus::new();
        let mem = &config.memory;
        let size = usize::try_from(mem.range.len())
            .context("memory region does not fit in the host address space")?;
        bus.map(
            "mem",
            mem.range,
            Box::new(Memory::new(size)),
            mem.read_latency.into(),
            mem.write_latency.into(),
        )
        .context("failed to map memory")?;

        let io_latency: SimTime = config.io_latency.into();
        for device in &config.devices {
            let dev = Self::create_device(config, device)
                .with_context(|| format!("failed to create device '{}'", device.name))?;
            bus.map(&device.name, device.range, dev, io_latency, io_latency)
                .with_context(|| format!("failed to map device '{}'", device.name))?;
        }

        let mut fabric = InterruptFabric::new();
        for device in &config.devices {
            Self::bind_interrupts(&mut fabric, &bus, config, device)
                .with_context(|| format!("failed to wire interrupts of '{}'", device.name))?;
        }

        tracing::info!(
            "Platform built: {} core(s), {} mappings, {} interrupt bindings",
            cores.len(),
            bus.len(),
            fabric.binding_count()
        );

        Ok(Self {
            fabric,
            bus,
            cores,
            config: config.clone(),
        })
    }

    fn create_device(
        config: &PlatformConfig,
        device: &DeviceConfig,
    ) -> anyhow::Result<Box<dyn Peripheral>> {
        let dev: Box<dyn Peripheral> = match device.kind {
            DeviceKind::Uart => Box::new(Uart::new()),
            DeviceKind::Mailbox => Box::new(Mailbox::new(config.nrcpu, PLATFORM_BYTE_ORDER)),
            DeviceKind::Spi => {
                let block =
                    RegisterBlock::new(&device.name, device.range.len(), PLATFORM_BYTE_ORDER);
                match &config.sdcard_image {
                    Some(path) => {
                        let len = std::fs::metadata(path)
                            .with_context(|| format!("cannot stat SD card image {}", path.display()))?
                            .len();
                        tracing::info!("{}: SD card image {} ({} bytes)", device.name, path.display(), len);
                        Box::new(block.with_backing(path.clone(), len))
                    }
                    None => Box::new(block),
                }
            }
            DeviceKind::Rtc | DeviceKind::Ethernet | DeviceKind::Keyboard | DeviceKind::Framebuffer => {
                Box::new(RegisterBlock::new(
                    &device.name,
                    device.range.len(),
                    PLATFORM_BYTE_ORDER,
                ))
            }
        };
        Ok(dev)
    }

    fn bind_interrupts(
        fabric: &mut InterruptFabric,
        bus: &SystemBus,
        config: &PlatformConfig,
        device: &DeviceConfig,
    ) -> SimResult<()> {
        let index = bus.index_of(&device.name).ok_or_else(|| {
            SimulationError::Topology(format!("device '{}' is not mapped", device.name))
        })?;
        let line_of = |core: &CoreConfig| {
            core.irq_line(&device.name).ok_or_else(|| {
                SimulationError::Topology(format!(
                    "core {} has no line for '{}'",
                    core.id, device.name
                ))
            })
        };

        if device.kind == DeviceKind::Mailbox {
            let outputs = bus.device(index).map_or(0, |d| d.irq_outputs());
            let routes = config
                .cores
                .iter()
                .map(|c| Ok((c.id, line_of(c)?)))
                .collect::<SimResult<Vec<_>>>()?;
            return fabric.bind_mailbox(&device.name, index, outputs, &routes);
        }

        let source = IrqSource {
            device: index,
            output: 0,
        };
        match (&device.irq_cores, config.cores.as_slice()) {
            (IrqCores::All, [only]) => {
                let dest = IrqDestination {
                    core: only.id,
                    line: line_of(only)?,
                };
                fabric.bind_direct(&device.name, source, dest)?;
            }
            (cores_seen, cores) => {
                let id = fabric.bind_fanout(&device.name, source)?;
                for core in cores {
                    let dest = IrqDestination {
                        core: core.id,
                        line: line_of(core)?,
                    };
                    fabric.add_output(id, dest, cores_seen.includes(core.id))?;
                }
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    pub fn cores_mut(&mut self) -> &mut [Core] {
        &mut self.cores
    }

    pub fn core(&self, id: usize) -> Option<&Core> {
        self.cores.get(id)
    }

    pub fn core_mut(&mut self, id: usize) -> Option<&mut Core> {
        self.cores.get_mut(id)
    }

    pub fn bus(&self) -> &SystemBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut SystemBus {
        &mut self.bus
    }

    pub fn fabric(&self) -> &InterruptFabric {
        &self.fabric
    }

    pub fn fabric_mut(&mut self) -> &mut InterruptFabric {
        &mut self.fabric
    }

    pub fn parts_mut(&mut self) -> (&mut [Core], &mut SystemBus, &mut InterruptFabric) {
        (&mut self.cores, &mut self.bus, &mut self.fabric)
    }

    /// Ticks every device to `now` and forwards interrupt level changes to the cores.
    pub fn advance_devices(&mut self, now: SimTime) {
        self.bus.tick(now);
        for (dest, level) in self.fabric.sample(&self.bus, now) {
            if let Some(core) = self.cores.get_mut(dest.core) {
                core.interrupt(dest.line, level);
            }
        }
    }

    /// Copies every segment of `image` into the platform through the debug path.
    pub fn load_image(&mut self, image: &ProgramImage) -> anyhow::Result<()> {
        for seg in &image.segments {
            self.bus
                .load(seg.start_addr, &seg.data)
                .with_context(|| {
                    format!(
                        "segment at {:#x} ({} bytes) does not fit any mapping",
                        seg.start_addr,
                        seg.data.len()
                    )
                })?;
        }
        tracing::info!(
            "Loaded {} segment(s), {} bytes, entry {:#x}",
            image.segments.len(),
            image.total_bytes(),
            image.entry_point
        );
        Ok(())
    }

    /// Resets devices, interrupt lines and every core, in that order. Lines
    /// that were high are then driven low at their cores.
    pub fn reset(&mut self, now: SimTime) {
        self.bus.reset();
        let lowered = self.fabric.reset(now);
        for core in &mut self.cores {
            core.reset();
        }
        for dest in lowered {
            if let Some(core) = self.cores.get_mut(dest.core) {
                core.interrupt(dest.line, false);
            }
        }
    }

    pub fn set_clock(&mut self, core: usize, hz: u64) -> SimResult<()> {
        let c = self
            .cores
            .get_mut(core)
            .ok_or_else(|| SimulationError::Topology(format!("no core {}", core)))?;
        c.set_clock(hz);
        Ok(())
    }

    fn core_and_bus(&mut self, core: usize) -> SimResult<(&mut Core, &mut SystemBus)> {
        let c = self
            .cores
            .get_mut(core)
            .ok_or_else(|| SimulationError::Topology(format!("no core {}", core)))?;
        Ok((c, &mut self.bus))
    }

    /// Debug read through `core`'s bridge. Costs no simulated time.
    pub fn read_memory(&mut self, core: usize, addr: u64, data: &mut [u8]) -> SimResult<()> {
        let (c, bus) = self.core_and_bus(core)?;
        c.read_memory(bus, addr, data)
    }

    pub fn write_memory(&mut self, core: usize, addr: u64, data: &[u8]) -> SimResult<()> {
        let (c, bus) = self.core_and_bus(core)?;
        c.write_memory(bus, addr, data)
    }

    /// Redirects a serial port's output into a buffer instead of stdout.
    pub fn capture_uart(&mut self, name: &str) -> Option<Arc<Mutex<Vec<u8>>>> {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let uart = self.bus.device_as_mut::<Uart>(name)?;
        uart.set_sink(Some(sink.clone()), false);
        Some(sink)
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("cores", &self.cores.len())
            .field("mappings", &self.bus.len())
            .field("bindings", &self.fabric.binding_count())
            .finish()
    }
}
