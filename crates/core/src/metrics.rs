// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bridge::BridgeStats;
use crate::processor::CoreCounters;
use crate::{DeviceLifecycle, SimTime, Topology};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct CoreReport {
    pub id: usize,
    pub clock_hz: u64,
    pub counters: CoreCounters,
    pub sleep_percent: f64,
    pub bridge: BridgeStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineReport {
    pub line: String,
    pub sources: String,
    pub asserts: u64,
    pub avg_asserted: SimTime,
    pub max_asserted: SimTime,
}

/// End-of-run summary of simulated versus host time.
#[derive(Debug, Clone, Serialize)]
pub struct TimingReport {
    pub simulated: SimTime,
    pub host_secs: f64,
    /// Simulated seconds per host second.
    pub realtime_ratio: f64,
    pub mips: f64,
    pub cores: Vec<CoreReport>,
    pub lines: Vec<LineReport>,
    /// Register state of every device that exposes one, by mapping name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: BTreeMap<String, serde_json::Value>,
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

impl TimingReport {
    pub fn collect(topology: &Topology, simulated: SimTime, host: Duration) -> Self {
        let host_secs = host.as_secs_f64();
        let cores: Vec<CoreReport> = topology
            .cores()
            .iter()
            .map(|c| {
                let counters = c.counters();
                CoreReport {
                    id: c.id(),
                    clock_hz: c.clock_hz(),
                    counters,
                    sleep_percent: 100.0
                        * ratio(counters.sleep_cycles as f64, counters.cycles as f64),
                    bridge: *c.bridge_stats(),
                }
            })
            .collect();
        let instructions: u64 = cores.iter().map(|c| c.counters.instructions).sum();

        let lines = topology
            .fabric()
            .lines()
            .filter(|(_, r)| r.line.asserts() > 0)
            .map(|(dest, r)| LineReport {
                line: dest.to_string(),
                sources: r.sources.join(","),
                asserts: r.line.asserts(),
                avg_asserted: r.line.avg_asserted(simulated),
                max_asserted: r.line.max_asserted(simulated),
            })
            .collect();

        let devices = topology
            .bus()
            .mappings()
            .filter_map(|m| {
                let state = m.dev.snapshot();
                (!state.is_null()).then(|| (m.name.clone(), state))
            })
            .collect();

        Self {
            simulated,
            host_secs,
            realtime_ratio: ratio(simulated.as_secs_f64(), host_secs),
            mips: ratio(instructions as f64, host_secs) / 1e6,
            cores,
            lines,
            devices,
        }
    }

    pub fn total_instructions(&self) -> u64 {
        self.cores.iter().map(|c| c.counters.instructions).sum()
    }
}

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Simulated time: {}", self.simulated)?;
        writeln!(f, "Host time:      {:.3} s", self.host_secs)?;
        writeln!(f, "Real-time ratio: {:.4}", self.realtime_ratio)?;
        writeln!(f, "Aggregate MIPS: {:.2}", self.mips)?;
        for c in &self.cores {
            writeln!(
                f,
                "cpu{}: {} Hz, {} insns, {} cycles, {} sleep ({:.1}%)",
                c.id,
                c.clock_hz,
                c.counters.instructions,
                c.counters.cycles,
                c.counters.sleep_cycles,
                c.sleep_percent
            )?;
            writeln!(
                f,
                "  excl loads {}, excl stores {} ({} failed), bus errors {}, dmi grants {}",
                c.bridge.exclusive_loads,
                c.bridge.exclusive_stores,
                c.bridge.exclusive_failed,
                c.bridge.bus_errors,
                c.bridge.dmi_grants
            )?;
        }
        for l in &self.lines {
            writeln!(
                f,
                "{} ({}): {} asserts, avg {}, max {}",
                l.line, l.sources, l.asserts, l.avg_asserted, l.max_asserted
            )?;
        }
        Ok(())
    }
}
