// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod mailbox;
pub mod register_block;
pub mod uart;

use crate::{SimResult, SimulationError};

/// Splits a byte access at `offset` into whole 32-bit register indices.
/// Register devices only accept naturally aligned word accesses.
pub(crate) fn word_index(device: &str, offset: u64, len: usize) -> SimResult<usize> {
    if len != 4 || offset % 4 != 0 {
        return Err(SimulationError::DeviceFault {
            device: device.to_string(),
            reason: format!("unaligned or non-word access of {} bytes at +{:#x}", len, offset),
        });
    }
    Ok((offset / 4) as usize)
}
