// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod bridge;
pub mod bus;
pub mod debug;
pub mod engine;
pub mod interrupt;
pub mod memory;
pub mod metrics;
pub mod peripherals;
pub mod processor;
pub mod scheduler;
pub mod signals;
pub mod time;
pub mod topology;

pub use bridge::{Direction, DirectAccessWindow, MemorySpace, Request, Response, TransactionBridge};
pub use bus::{BusFlags, BusStatus, SystemBus};
pub use debug::{CoreState, DebugController, DebugEvent, DebugSubscriber, WatchKind};
pub use engine::{
    CoreEngine, CpuContext, ExecutionEnvironment, InterruptState, StepOutcome, StepResult,
};
pub use processor::{Core, DeviceLifecycle};
pub use scheduler::{StepScheduler, StopHandle, StopReason};
pub use time::SimTime;
pub use topology::Topology;

use std::any::Any;


#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Memory access violation at {0:#x}")]
    MemoryViolation(u64),
    #[error("No device mapped at {0:#x}")]
    UnmappedAddress(u64),
    #[error("Device '{device}' refused access: {reason}")]
    DeviceFault { device: String, reason: String },
    #[error("Invalid register index {0}")]
    InvalidRegister(usize),
    #[error("Address {0:#x} is outside the core's address space")]
    AddressOutOfRange(u64),
    #[error("Topology error: {0}")]
    Topology(String),
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Byte order of multi-byte device registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum ByteOrder {
    Big,
    #[default]
    Little,
}

impl ByteOrder {
    pub fn to_bytes(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Little => value.to_le_bytes(),
        }
    }

    pub fn from_bytes(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Big => u32::from_be_bytes(bytes),
            ByteOrder::Little => u32::from_le_bytes(bytes),
        }
    }
}

/// Trait representing a memory-mapped device on the shared bus.
///
/// Offsets are relative to the start of the device's mapping. Accesses may be
/// any length the device accepts; a device returns an error to refuse one.
pub trait Peripheral: std::fmt::Debug + Send {
    fn read(&mut self, offset: u64, data: &mut [u8]) -> SimResult<()>;
    fn write(&mut self, offset: u64, data: &[u8]) -> SimResult<()>;

    /// Side-effect free read used for debug accesses.
    fn peek(&self, offset: u64, data: &mut [u8]) -> SimResult<()>;

    fn reset(&mut self) {}

    /// Advances device-internal state to simulated time `now`.
    fn tick(&mut self, _now: SimTime) {}

    fn irq_outputs(&self) -> usize {
        0
    }

    fn irq_level(&self, _index: usize) -> bool {
        false
    }

    /// Backing store for devices that can grant direct access.
    fn direct_memory(&self) -> Option<memory::MemoryHandle> {
        None
    }

    fn as_any(&self) -> Option<&dyn Any> {
        None
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}
