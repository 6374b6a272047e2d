// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{SimResult, SimulationError};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

const RBR_THR: u64 = 0;
const IER: u64 = 1;
const IIR_FCR: u64 = 2;
const LCR: u64 = 3;
const MCR: u64 = 4;
const LSR: u64 = 5;
const MSR: u64 = 6;
const SCR: u64 = 7;

const IER_RDI: u8 = 1 << 0;
const IER_THRI: u8 = 1 << 1;

const IIR_NO_INT: u8 = 0x01;
const IIR_THRI: u8 = 0x02;
const IIR_RDI: u8 = 0x04;

const LSR_DR: u8 = 1 << 0;
const LSR_THRE: u8 = 1 << 5;
const LSR_TEMT: u8 = 1 << 6;

const LCR_DLAB: u8 = 1 << 7;

/// 8250-style serial port. Transmission is instantaneous, so the holding
/// register is always empty.
#[derive(Debug, Default, serde::Serialize)]
pub struct Uart {
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    divisor: u16,
    thr_empty_pending: bool,
    rx: VecDeque<u8>,
    #[serde(skip)]
    sink: Option<Arc<Mutex<Vec<u8>>>>,
    echo_stdout: bool,
}

impl Uart {
    pub fn new() -> Self {
        Self {
            echo_stdout: true,
            ..Self::default()
        }
    }

    fn push_tx(&mut self, value: u8) {
        if let Some(sink) = &self.sink {
            if let Ok(mut guard) = sink.lock() {
                guard.push(value);
            }
        }

        if self.echo_stdout {
            #[allow(unused_must_use)]
            {
                print!("{}", value as char);
                io::stdout().flush();
            }
        }
    }

    pub fn set_sink(&mut self, sink: Option<Arc<Mutex<Vec<u8>>>>, echo_stdout: bool) {
        self.sink = sink;
        self.echo_stdout = echo_stdout;
    }

    /// Queues bytes as if received on the line.
    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    fn dlab(&self) -> bool {
        self.lcr & LCR_DLAB != 0
    }

    fn lsr(&self) -> u8 {
        let mut v = LSR_THRE | LSR_TEMT;
        if !self.rx.is_empty() {
            v |= LSR_DR;
        }
        v
    }

    fn iir(&self) -> u8 {
        if self.ier & IER_RDI != 0 && !self.rx.is_empty() {
            IIR_RDI
        } else if self.ier & IER_THRI != 0 && self.thr_empty_pending {
            IIR_THRI
        } else {
            IIR_NO_INT
        }
    }

    fn peek_reg(&self, reg: u64) -> u8 {
        match reg {
            RBR_THR if self.dlab() => self.divisor as u8,
            RBR_THR => self.rx.front().copied().unwrap_or(0),
            IER if self.dlab() => (self.divisor >> 8) as u8,
            IER => self.ier,
            IIR_FCR => self.iir(),
            LCR => self.lcr,
            MCR => self.mcr,
            LSR => self.lsr(),
            MSR => 0,
            SCR => self.scr,
            _ => 0,
        }
    }

    fn read_reg(&mut self, reg: u64) -> u8 {
        let v = self.peek_reg(reg);
        match reg {
            RBR_THR if !self.dlab() => {
                self.rx.pop_front();
            }
            // Reading IIR acknowledges a THR-empty interrupt.
            IIR_FCR if v == IIR_THRI => self.thr_empty_pending = false,
            _ => {}
        }
        v
    }

    fn write_reg(&mut self, reg: u64, value: u8) {
        match reg {
            RBR_THR if self.dlab() => self.divisor = (self.divisor & 0xFF00) | value as u16,
            RBR_THR => {
                self.push_tx(value);
                self.thr_empty_pending = true;
            }
            IER if self.dlab() => {
                self.divisor = (self.divisor & 0x00FF) | ((value as u16) << 8);
            }
            IER => {
                let was = self.ier & IER_THRI != 0;
                self.ier = value & 0x0F;
                if !was && self.ier & IER_THRI != 0 {
                    self.thr_empty_pending = true;
                }
            }
            IIR_FCR => {
                if value & 0x02 != 0 {
                    self.rx.clear();
                }
            }
            LCR => self.lcr = value,
            MCR => self.mcr = value,
            SCR => self.scr = value,
            _ => {}
        }
    }

    fn check(offset: u64, len: usize) -> SimResult<()> {
        if offset.saturating_add(len as u64) > 8 {
            return Err(SimulationError::DeviceFault {
                device: "uart".to_string(),
                reason: format!("access of {} bytes at +{:#x} is outside the register file", len, offset),
            });
        }
        Ok(())
    }
}

impl crate::Peripheral for Uart {
    fn read(&mut self, offset: u64, data: &mut [u8]) -> SimResult<()> {
        Self::check(offset, data.len())?;
        for (i, b) in data.iter_mut().enumerate() {
            *b = self.read_reg(offset + i as u64);
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> SimResult<()> {
        Self::check(offset, data.len())?;
        for (i, b) in data.iter().enumerate() {
            self.write_reg(offset + i as u64, *b);
        }
        Ok(())
    }

    fn peek(&self, offset: u64, data: &mut [u8]) -> SimResult<()> {
        Self::check(offset, data.len())?;
        for (i, b) in data.iter_mut().enumerate() {
            *b = self.peek_reg(offset + i as u64);
        }
        Ok(())
    }

    fn reset(&mut self) {
        let sink = self.sink.take();
        let echo = self.echo_stdout;
        *self = Self::default();
        self.sink = sink;
        self.echo_stdout = echo;
    }

    fn irq_outputs(&self) -> usize {
        1
    }

    fn irq_level(&self, index: usize) -> bool {
        index == 0 && self.iir() != IIR_NO_INT
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
