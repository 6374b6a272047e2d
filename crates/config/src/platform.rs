// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Typed, immutable platform description resolved from a [`PropertyStore`].

use crate::{
    parse_bool, parse_frequency, parse_size, parse_time, parse_u64, ConfigError, ConfigResult,
    PropertyStore,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_CORES: usize = 32;
pub const IRQ_LINES: u32 = 32;
pub const PAGE_SIZE: u64 = 8 * 1024;

const DEFAULT_CLOCK_HZ: u64 = 100_000_000;
const DEFAULT_MEM_SIZE: u64 = 128 * 1024 * 1024;
const DEFAULT_RESET_VECTOR: u64 = 0x100;

/// Inclusive address range `[start, end]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn with_size(start: u64, size: u64) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let end = start.checked_add(size - 1)?;
        Some(Self { start, end })
    }

    /// Size in bytes. The full 64-bit space saturates at `u64::MAX`.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end
    }

    /// True when every byte of `[addr, addr + len)` lies inside the range.
    pub fn contains_span(&self, addr: u64, len: u64) -> bool {
        if len == 0 {
            return self.contains(addr);
        }
        match addr.checked_add(len - 1) {
            Some(last) => self.contains(addr) && last <= self.end,
            None => false,
        }
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Accepts `start..end` (inclusive), `start+size`, or a bare base address
    /// which then spans `default_size` bytes.
    pub fn parse(s: &str, default_size: u64) -> Result<Self, String> {
        let s = s.trim();
        if let Some((a, b)) = s.split_once("..") {
            let start = parse_u64(a)?;
            let end = parse_u64(b)?;
            if end < start {
                return Err(format!("range end 0x{:x} lies below start 0x{:x}", end, start));
            }
            if end - start == u64::MAX {
                return Err("range covers the whole address space".to_string());
            }
            return Ok(Self::new(start, end));
        }
        if let Some((a, size)) = s.split_once('+') {
            let start = parse_u64(a)?;
            let size = parse_size(size).map_err(|e| e.to_string())?;
            return Self::with_size(start, size)
                .ok_or_else(|| format!("range '{}' is empty or wraps the address space", s));
        }
        let start = parse_u64(s)?;
        Self::with_size(start, default_size)
            .ok_or_else(|| format!("range at '{}' wraps the address space", s))
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:08x}..0x{:08x}]", self.start, self.end)
    }
}

impl fmt::Debug for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Uart,
    Rtc,
    Spi,
    Ethernet,
    Keyboard,
    Framebuffer,
    Mailbox,
}

/// Which cores observe a shared device interrupt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum IrqCores {
    All,
    Only(Vec<usize>),
}

impl IrqCores {
    pub fn includes(&self, core: usize) -> bool {
        match self {
            IrqCores::All => true,
            IrqCores::Only(ids) => ids.contains(&core),
        }
    }

    fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(IrqCores::All);
        }
        let mut ids = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let id = parse_u64(part)? as usize;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(IrqCores::Only(ids))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: DeviceKind,
    pub range: AddressRange,
    pub irq_cores: IrqCores,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryConfig {
    pub range: AddressRange,
    pub read_latency: Duration,
    pub write_latency: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelConfig {
    pub path: PathBuf,
    pub load_addr: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreConfig {
    pub id: usize,
    pub clock_hz: u64,
    /// Interrupt input number per device name (`uart0`, `ompic`, ...).
    pub irq_lines: BTreeMap<String, u32>,
    pub enable_insn_dmi: bool,
    pub enable_data_dmi: bool,
    pub enable_sleep_mode: bool,
    pub insn_trace_file: Option<PathBuf>,
    pub gdb_port: u16,
    pub gdb_wait: bool,
    pub symbols: Option<PathBuf>,
    pub reset_vector: u64,
}

impl CoreConfig {
    pub fn irq_line(&self, device: &str) -> Option<u32> {
        self.irq_lines.get(device).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformConfig {
    pub nrcpu: usize,
    /// Zero means run until an explicit stop.
    pub duration: Duration,
    pub quantum: Duration,
    pub clock_hz: u64,
    pub memory: MemoryConfig,
    pub io_latency: Duration,
    pub devices: Vec<DeviceConfig>,
    pub kernel: Option<KernelConfig>,
    pub sdcard_image: Option<PathBuf>,
    pub cores: Vec<CoreConfig>,
}

struct DeviceDefault {
    name: &'static str,
    kind: DeviceKind,
    base: u64,
    irq: u32,
}

const DEVICES: &[DeviceDefault] = &[
    DeviceDefault { name: "uart0", kind: DeviceKind::Uart, base: 0x9000_0000, irq: 2 },
    DeviceDefault { name: "uart1", kind: DeviceKind::Uart, base: 0x9000_2000, irq: 3 },
    DeviceDefault { name: "rtc", kind: DeviceKind::Rtc, base: 0x9000_4000, irq: 9 },
    DeviceDefault { name: "ocspi", kind: DeviceKind::Spi, base: 0x9100_0000, irq: 6 },
    DeviceDefault { name: "ethoc", kind: DeviceKind::Ethernet, base: 0x9200_0000, irq: 4 },
    DeviceDefault { name: "ockbd", kind: DeviceKind::Keyboard, base: 0x9400_0000, irq: 5 },
    DeviceDefault { name: "ocfbc", kind: DeviceKind::Framebuffer, base: 0x9700_0000, irq: 8 },
    DeviceDefault { name: "ompic", kind: DeviceKind::Mailbox, base: 0x9800_0000, irq: 1 },
];

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty path".to_string());
    }
    Ok(PathBuf::from(s))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let v = parse_u64(s)?;
    u32::try_from(v).map_err(|_| format!("{} does not fit in 32 bits", v))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let v = parse_u64(s)?;
    u16::try_from(v).map_err(|_| format!("{} does not fit in 16 bits", v))
}

fn require_file(key: &str, path: Option<PathBuf>) -> ConfigResult<Option<PathBuf>> {
    match path {
        Some(p) if !Path::new(&p).exists() => Err(ConfigError::MissingFile {
            key: key.to_string(),
            path: p,
        }),
        other => Ok(other),
    }
}

impl PlatformConfig {
    /// Resolves every platform property, applying defaults and validating
    /// the result. Fails before anything is built.
    pub fn resolve(store: &PropertyStore) -> ConfigResult<Self> {
        let nrcpu = store.get_or("system.nrcpu", 1usize, |s| {
            parse_u64(s).map(|v| v as usize)
        })?;
        if nrcpu == 0 || nrcpu > MAX_CORES {
            return Err(ConfigError::InvalidCoreCount {
                got: nrcpu,
                max: MAX_CORES,
            });
        }

        let duration = store.get_or("system.duration", Duration::ZERO, parse_time)?;
        let quantum = store.get_or("system.quantum", Duration::from_micros(1), parse_time)?;
        if quantum.is_zero() {
            return Err(ConfigError::ZeroQuantum);
        }
        let clock_hz = store.get_or("system.clock", DEFAULT_CLOCK_HZ, parse_frequency)?;

        let memory = MemoryConfig {
            range: store.get_or(
                "system.mem",
                AddressRange::new(0, DEFAULT_MEM_SIZE - 1),
                |s| AddressRange::parse(s, DEFAULT_MEM_SIZE),
            )?,
            read_latency: store.get_or("system.mem.read_latency", Duration::ZERO, parse_time)?,
            write_latency: store.get_or("system.mem.write_latency", Duration::ZERO, parse_time)?,
        };
        let io_latency = store.get_or("system.io_latency", Duration::ZERO, parse_time)?;

        let mut devices = Vec::with_capacity(DEVICES.len());
        for d in DEVICES {
            let range = store.get_or(
                &format!("system.{}", d.name),
                AddressRange::new(d.base, d.base + PAGE_SIZE - 1),
                |s| AddressRange::parse(s, PAGE_SIZE),
            )?;
            let irq_cores = store.get_or(
                &format!("system.{}.irq_cores", d.name),
                IrqCores::All,
                IrqCores::parse,
            )?;
            if let IrqCores::Only(ids) = &irq_cores {
                if let Some(bad) = ids.iter().find(|id| **id >= nrcpu) {
                    return Err(ConfigError::InvalidValue {
                        key: format!("system.{}.irq_cores", d.name),
                        value: bad.to_string(),
                        reason: format!("only {} core(s) configured", nrcpu),
                    });
                }
            }
            devices.push(DeviceConfig {
                name: d.name.to_string(),
                kind: d.kind,
                range,
                irq_cores,
            });
        }

        let load_addr = store.get_or("system.kernel_addr", 0, parse_u64)?;
        let kernel = require_file("system.kernel", store.get_opt("system.kernel", parse_path)?)?
            .map(|path| KernelConfig { path, load_addr });
        let sdcard_image = require_file(
            "system.sdcard.image",
            store.get_opt("system.sdcard.image", parse_path)?,
        )?;

        let mut cores = Vec::with_capacity(nrcpu);
        for id in 0..nrcpu {
            cores.push(Self::resolve_core(store, id, clock_hz)?);
        }

        let config = Self {
            nrcpu,
            duration,
            quantum,
            clock_hz,
            memory,
            io_latency,
            devices,
            kernel,
            sdcard_image,
            cores,
        };
        config.check_overlaps()?;

        for key in store.unconsumed_keys() {
            tracing::warn!("Ignoring unknown property '{}'", key);
        }
        Ok(config)
    }

    fn resolve_core(store: &PropertyStore, id: usize, clock_hz: u64) -> ConfigResult<CoreConfig> {
        let key = |name: &str| format!("system.cpu{}.{}", id, name);

        let mut irq_lines = BTreeMap::new();
        for d in DEVICES {
            let k = key(&format!("irq_{}", d.name));
            let line = store.get_or(&k, d.irq, parse_u32)?;
            if line >= IRQ_LINES {
                return Err(ConfigError::InvalidIrqLine {
                    core: id,
                    device: d.name.to_string(),
                    line,
                    max: IRQ_LINES,
                });
            }
            irq_lines.insert(d.name.to_string(), line);
        }

        let symbols_key = key("symbols");
        Ok(CoreConfig {
            id,
            clock_hz: store.get_or(&key("clock"), clock_hz, parse_frequency)?,
            irq_lines,
            enable_insn_dmi: store.get_or(&key("enable_insn_dmi"), true, parse_bool)?,
            enable_data_dmi: store.get_or(&key("enable_data_dmi"), true, parse_bool)?,
            enable_sleep_mode: store.get_or(&key("enable_sleep_mode"), true, parse_bool)?,
            insn_trace_file: store.get_opt(&key("insn_trace_file"), parse_path)?,
            gdb_port: store.get_or(&key("gdb_port"), 0, parse_u16)?,
            gdb_wait: store.get_or(&key("gdb_wait"), false, parse_bool)?,
            symbols: require_file(&symbols_key, store.get_opt(&symbols_key, parse_path)?)?,
            reset_vector: store.get_or(&key("reset_vector"), DEFAULT_RESET_VECTOR, parse_u64)?,
        })
    }

    fn check_overlaps(&self) -> ConfigResult<()> {
        let mut regions: Vec<(&str, AddressRange)> = vec![("mem", self.memory.range)];
        regions.extend(self.devices.iter().map(|d| (d.name.as_str(), d.range)));
        for (i, (a_name, a)) in regions.iter().enumerate() {
            for (b_name, b) in regions.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(ConfigError::OverlappingRanges {
                        first: a_name.to_string(),
                        first_range: *a,
                        second: b_name.to_string(),
                        second_range: *b,
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolves a platform from `key=value` overrides on top of the defaults.
    pub fn with_overrides<I, S>(assignments: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::resolve(&PropertyStore::from_assignments(assignments)?)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }
}
