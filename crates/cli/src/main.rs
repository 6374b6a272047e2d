// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, warn};
use vp_config::{ArgProvider, DefaultProvider, EnvProvider, FileProvider, PlatformConfig, PropertyStore};
use vp_core::metrics::TimingReport;
use vp_core::{StepScheduler, StopReason, Topology};
use vp_gdbstub::{DisconnectReason, GdbServer, VpTarget};
use vp_loader::SymbolTable;

const EXIT_PASS: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

/// Scheduler rounds between polls for a late debugger connection.
const ACCEPT_POLL_ROUNDS: u64 = 1024;

fn parse_addr(s: &str) -> Result<u64, String> {
    vp_config::parse_u64(s).map_err(|e| format!("Invalid address '{}': {}", s, e))
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Multicore virtual platform", long_about = None)]
struct Cli {
    /// Verbose logging
    #[arg(short, long)]
    debug: bool,

    /// Maximally verbose logging
    #[arg(short, long)]
    trace: bool,

    /// Configuration file (YAML)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Override a configuration property (repeatable), e.g. -c system.nrcpu=2
    #[arg(short = 'c', long = "config", value_name = "KEY=VALUE")]
    config: Vec<String>,

    /// Breakpoint address installed on every core (repeatable)
    #[arg(long, value_parser = parse_addr)]
    breakpoint: Vec<u64>,

    /// Print the timing report at exit
    #[arg(long)]
    stats: bool,

    /// Print the timing report as JSON at exit
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.trace {
        tracing::Level::TRACE
    } else if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    run(cli)
}

fn load_config(cli: &Cli) -> anyhow::Result<PlatformConfig> {
    let file = cli.file.as_ref().map(FileProvider::from_file).transpose()?;
    let store = PropertyStore::new(
        ArgProvider::from_assignments(&cli.config)?,
        EnvProvider::from_process(),
        file,
        DefaultProvider::default(),
    );
    Ok(PlatformConfig::resolve(&store)?)
}

/// Builds the platform, loads the kernel and installs command-line breakpoints.
fn build_platform(config: &PlatformConfig, breakpoints: &[u64]) -> anyhow::Result<Topology> {
    let mut topology = Topology::build(config).context("Failed to build platform")?;

    if let Some(kernel) = &config.kernel {
        info!("Loading kernel: {:?}", kernel.path);
        let image = vp_loader::load_kernel(&kernel.path, kernel.load_addr)?;
        info!(
            "Kernel loaded: {} bytes in {} segment(s), entry point {:#x}",
            image.total_bytes(),
            image.segments.len(),
            image.entry_point
        );
        topology.load_image(&image)?;
    } else {
        warn!("No kernel configured, cores start from zeroed memory");
    }

    for core in topology.cores_mut() {
        for addr in breakpoints {
            core.debug_mut()
                .insert_breakpoint(*addr)
                .with_context(|| format!("Invalid breakpoint {:#x}", addr))?;
        }
    }
    Ok(topology)
}

fn load_symbols(config: &PlatformConfig) -> anyhow::Result<Vec<Option<SymbolTable>>> {
    config
        .cores
        .iter()
        .map(|c| c.symbols.as_deref().map(SymbolTable::from_file).transpose())
        .collect()
}

fn describe(symbols: &[Option<SymbolTable>], core: usize, addr: u64) -> String {
    match symbols.get(core).and_then(|s| s.as_ref()).and_then(|s| s.nearest(addr)) {
        Some(sym) => format!("{:#x} <{}>", addr, sym),
        None => format!("{:#x}", addr),
    }
}

fn run(cli: Cli) -> ExitCode {
    info!("Starting multicore virtual platform");

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    info!(
        "Platform: {} core(s), quantum {:?}, duration {}",
        config.nrcpu,
        config.quantum,
        if config.duration.is_zero() {
            "unbounded".to_string()
        } else {
            format!("{:?}", config.duration)
        }
    );

    let mut topology = match build_platform(&config, &cli.breakpoint) {
        Ok(topology) => topology,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let symbols = match load_symbols(&config) {
        Ok(symbols) => symbols,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let mut scheduler = StepScheduler::for_topology(&topology);
    let started = Instant::now();
    let reason = simulate(&mut topology, &mut scheduler, &config, &symbols);
    let report = TimingReport::collect(&topology, scheduler.now(), started.elapsed());

    if let Err(e) = report_metrics(&report, &cli) {
        error!("{:#}", e);
        return ExitCode::from(EXIT_RUNTIME_ERROR);
    }

    match reason {
        StopReason::Exit { core, code } => {
            info!("Core {} requested exit with code {}", core, code);
        }
        StopReason::DurationReached => info!("Simulation duration reached"),
        StopReason::ExternalStop => info!("Simulation stopped"),
        StopReason::Breakpoint { core, pc } => {
            info!("Core {} stopped at breakpoint {}", core, describe(&symbols, core, pc));
        }
        StopReason::Watchpoint { core, hit } => {
            let pc = topology.core(core).map_or(0, |c| c.pc());
            info!(
                "Core {} stopped on {:?} watchpoint at {:#x}, pc {}",
                core,
                hit.kind,
                hit.addr,
                describe(&symbols, core, pc)
            );
        }
    }
    ExitCode::from(EXIT_PASS)
}

/// Runs the scheduler to a stop, serving at most one debugger session on
/// the first core that configures a GDB port.
fn simulate(
    topology: &mut Topology,
    scheduler: &mut StepScheduler,
    config: &PlatformConfig,
    symbols: &[Option<SymbolTable>],
) -> StopReason {
    let mut debugged = config.cores.iter().filter(|c| c.gdb_port != 0);
    let Some(core_cfg) = debugged.next() else {
        return scheduler.run(topology);
    };
    for extra in debugged {
        warn!(
            "Only one debugger session is supported, ignoring gdb_port {} of core {}",
            extra.gdb_port, extra.id
        );
    }

    let server = match GdbServer::bind(core_cfg.gdb_port) {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return scheduler.run(topology);
        }
    };

    let stream = if core_cfg.gdb_wait {
        info!("Waiting for debugger on port {}", server.port());
        match server.accept() {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    } else {
        loop {
            match server.try_accept() {
                Ok(Some(stream)) => break Some(stream),
                Ok(None) => {}
                Err(e) => {
                    error!("{}", e);
                    break None;
                }
            }
            if let Some(reason) = scheduler.run_rounds(topology, ACCEPT_POLL_ROUNDS) {
                return reason;
            }
        }
    };

    if let Some(stream) = stream {
        let core = core_cfg.id;
        let table = symbols.get(core).and_then(|s| s.as_ref());
        let stop = scheduler.stop_handle();
        let mut target = VpTarget::new(topology, scheduler, core, table);
        if let Ok(DisconnectReason::Kill) = GdbServer::serve(stream, &mut target) {
            stop.stop();
        }
    }
    info!("Continuing without debugger");
    scheduler.run(topology)
}

fn report_metrics(report: &TimingReport, cli: &Cli) -> anyhow::Result<()> {
    info!(
        "Simulated {} in {:.3} s host time (ratio {:.4}, {:.2} MIPS)",
        report.simulated, report.host_secs, report.realtime_ratio, report.mips
    );
    for core in &report.cores {
        info!(
            "cpu{}: {} instructions, {} cycles, {:.1}% asleep, {} bus errors",
            core.id,
            core.counters.instructions,
            core.counters.cycles,
            core.sleep_percent,
            core.bridge.bus_errors
        );
    }
    let mut out = std::io::stdout().lock();
    if cli.stats {
        write!(out, "{}", report).context("Failed to print timing report")?;
    }
    if cli.json {
        serde_json::to_writer(&mut out, report).context("Failed to serialize timing report")?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}
