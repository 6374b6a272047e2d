// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{ByteOrder, SimResult, SimulationError};
use std::path::PathBuf;

/// Plain 32-bit register file with a single interrupt output.
///
/// Stands in for device classes whose register behavior is not modeled
/// (RTC, Ethernet, framebuffer, keyboard, SPI). Bit 0 of register 0 drives
/// the interrupt output.
#[derive(Debug, serde::Serialize)]
pub struct RegisterBlock {
    name: String,
    order: ByteOrder,
    regs: Vec<u32>,
    #[serde(skip)]
    backing: Option<(PathBuf, u64)>,
}

impl RegisterBlock {
    pub fn new(name: &str, size: u64, order: ByteOrder) -> Self {
        Self {
            name: name.to_string(),
            order,
            regs: vec![0; (size / 4) as usize],
            backing: None,
        }
    }

    /// Associates a backing image (the SD card behind the SPI controller).
    pub fn with_backing(mut self, path: PathBuf, len: u64) -> Self {
        self.backing = Some((path, len));
        self
    }

    pub fn backing(&self) -> Option<(&PathBuf, u64)> {
        self.backing.as_ref().map(|(p, l)| (p, *l))
    }

    pub fn register(&self, index: usize) -> Option<u32> {
        self.regs.get(index).copied()
    }

    pub fn set_register(&mut self, index: usize, value: u32) -> SimResult<()> {
        let slot = self
            .regs
            .get_mut(index)
            .ok_or(SimulationError::InvalidRegister(index))?;
        *slot = value;
        Ok(())
    }

    fn index(&self, offset: u64, len: usize) -> SimResult<usize> {
        let index = super::word_index(&self.name, offset, len)?;
        if index >= self.regs.len() {
            return Err(SimulationError::MemoryViolation(offset));
        }
        Ok(index)
    }
}

impl crate::Peripheral for RegisterBlock {
    fn read(&mut self, offset: u64, data: &mut [u8]) -> SimResult<()> {
        self.peek(offset, data)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> SimResult<()> {
        let index = self.index(offset, data.len())?;
        let bytes: [u8; 4] = [data[0], data[1], data[2], data[3]];
        self.regs[index] = self.order.from_bytes(bytes);
        Ok(())
    }

    fn peek(&self, offset: u64, data: &mut [u8]) -> SimResult<()> {
        let index = self.index(offset, data.len())?;
        data.copy_from_slice(&self.order.to_bytes(self.regs[index]));
        Ok(())
    }

    fn reset(&mut self) {
        self.regs.iter_mut().for_each(|r| *r = 0);
    }

    fn irq_outputs(&self) -> usize {
        1
    }

    fn irq_level(&self, index: usize) -> bool {
        index == 0 && self.regs.first().is_some_and(|r| r & 1 != 0)
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
