// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{SimResult, SimulationError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub start_addr: u64,
    pub data: Vec<u8>,
}

/// A loadable image: entry point plus the segments to place in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramImage {
    pub entry_point: u64,
    pub segments: Vec<Segment>,
}

impl ProgramImage {
    pub fn new(entry_point: u64) -> Self {
        Self {
            entry_point,
            segments: Vec::new(),
        }
    }

    pub fn add_segment(&mut self, start_addr: u64, data: Vec<u8>) {
        self.segments.push(Segment { start_addr, data });
    }

    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }
}

/// Shared handle to a RAM backing store.
///
/// Cloned into direct-access windows so cores can bypass the bus while the
/// owning `Memory` device stays mapped.
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryHandle {
    pub fn new(size: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0; size])),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> bool {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let Some(src) = slice_range(offset, buf.len(), data.len()) else {
            return false;
        };
        buf.copy_from_slice(&data[src]);
        true
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> bool {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let len = data.len();
        let Some(dst) = slice_range(offset, buf.len(), len) else {
            return false;
        };
        data[dst].copy_from_slice(buf);
        true
    }

    pub fn same_backing(&self, other: &MemoryHandle) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

fn slice_range(offset: u64, len: usize, size: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(len)?;
    (end <= size).then_some(start..end)
}

/// Flat RAM device.
#[derive(Debug)]
pub struct Memory {
    handle: MemoryHandle,
}

impl Memory {
    pub fn new(size: usize) -> Self {
        Self {
            handle: MemoryHandle::new(size),
        }
    }

    pub fn size(&self) -> usize {
        self.handle.len()
    }

    pub fn handle(&self) -> &MemoryHandle {
        &self.handle
    }

    /// Copies `segment` in if it lies completely inside this memory mapped at `base`.
    pub fn load_from_segment(&mut self, base: u64, segment: &Segment) -> bool {
        let Some(offset) = segment.start_addr.checked_sub(base) else {
            return false;
        };
        self.handle.write(offset, &segment.data)
    }
}

impl crate::Peripheral for Memory {
    fn read(&mut self, offset: u64, data: &mut [u8]) -> SimResult<()> {
        self.peek(offset, data)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> SimResult<()> {
        if self.handle.write(offset, data) {
            Ok(())
        } else {
            Err(SimulationError::MemoryViolation(offset))
        }
    }

    fn peek(&self, offset: u64, data: &mut [u8]) -> SimResult<()> {
        if self.handle.read(offset, data) {
            Ok(())
        } else {
            Err(SimulationError::MemoryViolation(offset))
        }
    }

    fn direct_memory(&self) -> Option<MemoryHandle> {
        Some(self.handle.clone())
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}
