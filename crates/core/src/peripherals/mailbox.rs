// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Inter-processor interrupt controller.
//!
//! Each core owns an 8-byte slot: CONTROL at `8 * id`, STATUS at `8 * id + 4`.
//! Writing CONTROL with `IRQ_GEN` raises the destination core's output and
//! latches the sender and payload into its STATUS; writing `IRQ_ACK` clears
//! the writer's own pending interrupt.

use crate::{ByteOrder, SimResult, SimulationError};

pub const IRQ_ACK: u32 = 1 << 31;
pub const IRQ_GEN: u32 = 1 << 30;
pub const STATUS_PENDING: u32 = 1 << 30;

const DEST_SHIFT: u32 = 16;
const DEST_MASK: u32 = 0x3FFF;
const DATA_MASK: u32 = 0xFFFF;

const CONTROL: u64 = 0;

/// Composes a CONTROL word raising an interrupt on `dest` with `data`.
pub fn control_word(dest: usize, data: u16) -> u32 {
    IRQ_GEN | ((dest as u32 & DEST_MASK) << DEST_SHIFT) | data as u32
}

#[derive(Debug, serde::Serialize)]
pub struct Mailbox {
    order: ByteOrder,
    control: Vec<u32>,
    status: Vec<u32>,
    messages: u64,
}

impl Mailbox {
    pub fn new(cores: usize, order: ByteOrder) -> Self {
        Self {
            order,
            control: vec![0; cores],
            status: vec![0; cores],
            messages: 0,
        }
    }

    pub fn cores(&self) -> usize {
        self.status.len()
    }

    pub fn status(&self, core: usize) -> Option<u32> {
        self.status.get(core).copied()
    }

    pub fn messages(&self) -> u64 {
        self.messages
    }

    fn decode(&self, offset: u64, len: usize) -> SimResult<(usize, u64)> {
        let word = super::word_index("ompic", offset, len)?;
        let core = word / 2;
        if core >= self.cores() {
            return Err(SimulationError::DeviceFault {
                device: "ompic".to_string(),
                reason: format!("no slot for core {} ({} configured)", core, self.cores()),
            });
        }
        Ok((core, offset % 8))
    }

    fn write_control(&mut self, src: usize, value: u32) {
        self.control[src] = value;
        if value & IRQ_ACK != 0 {
            self.status[src] &= !STATUS_PENDING;
            tracing::trace!("ompic: core {} acknowledged", src);
        }
        if value & IRQ_GEN != 0 {
            let dst = ((value >> DEST_SHIFT) & DEST_MASK) as usize;
            if dst >= self.cores() {
                tracing::warn!(
                    "ompic: core {} addressed nonexistent core {}, ignoring",
                    src,
                    dst
                );
                return;
            }
            self.status[dst] = STATUS_PENDING | ((src as u32) << DEST_SHIFT) | (value & DATA_MASK);
            self.messages += 1;
            tracing::trace!("ompic: core {} -> core {} data {:#x}", src, dst, value & DATA_MASK);
        }
    }
}

impl crate::Peripheral for Mailbox {
    fn read(&mut self, offset: u64, data: &mut [u8]) -> SimResult<()> {
        self.peek(offset, data)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> SimResult<()> {
        let (core, reg) = self.decode(offset, data.len())?;
        let value = self.order.from_bytes([data[0], data[1], data[2], data[3]]);
        // STATUS is read-only.
        if reg == CONTROL {
            self.write_control(core, value);
        }
        Ok(())
    }

    fn peek(&self, offset: u64, data: &mut [u8]) -> SimResult<()> {
        let (core, reg) = self.decode(offset, data.len())?;
        let value = if reg == CONTROL {
            self.control[core]
        } else {
            self.status[core]
        };
        data.copy_from_slice(&self.order.to_bytes(value));
        Ok(())
    }

    fn reset(&mut self) {
        self.control.iter_mut().for_each(|c| *c = 0);
        self.status.iter_mut().for_each(|s| *s = 0);
    }

    fn irq_outputs(&self) -> usize {
        self.cores()
    }

    fn irq_level(&self, index: usize) -> bool {
        self.status
            .get(index)
            .is_some_and(|s| s & STATUS_PENDING != 0)
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
