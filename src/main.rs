use anyhow::{Context, Result};
use clap::Parser;
use kdscope::cli::{self, Cli, Command, OutputFormat};
use kdscope::config::MachineConfig;
use kdscope::kdebug::TraceFile;
use kdscope::machine::Machine;
use kdscope::render;
use kdscope::summary::CpuSummary;
use kdscope::time::{AbsInterval, AbsTime};
use regex::Regex;
use std::io::{self, Write};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn reconstruct(path: &Path, config: &MachineConfig) -> Result<(TraceFile, Machine)> {
    let trace = TraceFile::open(path)
        .with_context(|| format!("Failed to load trace: {}", path.display()))?;
    let machine = Machine::new(trace.buffers(), config);
    Ok((trace, machine))
}

fn print_info(path: &Path, trace: &TraceFile, machine: &Machine) {
    let buffers = trace.buffers();
    println!("trace:          {}", path.display());
    println!("pointer width:  {}", buffers.width);
    println!(
        "events:         {} ({} dispatched, {} unhandled)",
        machine.events().len(),
        machine.events_dispatched(),
        machine.events_unhandled()
    );
    println!("timespan:       {}", machine.timespan());
    println!(
        "cpus:           {} ({} active)",
        machine.cpus().len(),
        machine.active_cpu_count()
    );
    for cpu in machine.cpus() {
        let kind = if cpu.is_iop() { " [IOP]" } else { "" };
        println!("  {:>3} {}{}", cpu.index(), cpu.name(), kind);
    }
    println!("processes:      {}", machine.processes().len());
    println!("threads:        {}", machine.threads().len());
    println!(
        "vouchers:       {} live, {} destroyed",
        machine.vouchers().live_count(),
        machine.vouchers().destroyed_count()
    );
    println!("mach messages:  {}", machine.mach_msgs().len());
    println!("disk i/o:       {}", machine.io_activity().len());
    match machine.lost_events_at() {
        Some(t) => println!("lost events:    at {}", t),
        None => println!("lost events:    no"),
    }
}

fn print_summary_text(summary: &CpuSummary) {
    println!("window {} ({} units)", summary.window, summary.window.length());
    if let Some(cpu) = summary.cpu_filter {
        println!("cpu filter: {}", cpu);
    }
    println!();
    println!(
        "{:>4} {:<12} {:>12} {:>12} {:>12} {:>12} {:>8} {:>8}",
        "cpu", "name", "run", "idle", "intr", "unknown", "csw", "intrs"
    );
    println!("─────────────────────────────────────────────────────────────────────────────────────");
    for cpu in &summary.cpus {
        println!(
            "{:>4} {:<12} {:>12} {:>12} {:>12} {:>12} {:>8} {:>8}",
            cpu.cpu,
            cpu.name,
            cpu.run_time,
            cpu.idle_time,
            cpu.intr_time,
            cpu.unknown_time,
            cpu.context_switches,
            cpu.intr_count
        );
    }
    println!("─────────────────────────────────────────────────────────────────────────────────────");
    println!(
        "{:>4} {:<12} {:>12} {:>12} {:>12} {:>12} {:>8} {:>8}",
        "",
        "total",
        summary.run_time,
        summary.idle_time,
        summary.intr_time,
        summary.unknown_time,
        summary.context_switches,
        summary.intr_count
    );
    println!();
    println!("wallclock run:  {}", summary.wallclock_run_time);
    println!("all cpus idle:  {}", summary.all_cpus_idle_time);
    println!(
        "disk i/o:       {} ops, {} bytes, {} units",
        summary.io.count, summary.io.bytes, summary.io.time
    );
    if let Some(future) = summary.future_window {
        println!("future window:  {}", future);
    }
    println!();
    println!(
        "{:>7} {:<20} {:>12} {:>12} {:>12} {:>12} {:>8} {:>12}",
        "pid", "process", "run", "wallclock", "blocked", "faults", "csw", "future"
    );
    for process in &summary.processes {
        println!(
            "{:>7} {:<20} {:>12} {:>12} {:>12} {:>12} {:>8} {:>12}",
            process.pid,
            process.name,
            process.run_time,
            process.wallclock_run_time,
            process.blocked_time,
            process.fault_time,
            process.context_switches,
            process.future_run_time
        );
    }
}

fn run_summary(
    machine: &Machine,
    start: Option<u64>,
    end: Option<u64>,
    cpu: Option<u32>,
    filter: Option<&Regex>,
    format: OutputFormat,
) -> Result<()> {
    let span = machine.timespan();
    let start = start.map_or(span.location(), AbsTime);
    let end = end.map_or(span.max(), AbsTime);
    if end < start {
        anyhow::bail!("Window end {} is before start {}", end, start);
    }

    let mut summary = machine.summary_for_window(AbsInterval::from_bounds(start, end), cpu);
    if let Some(re) = filter {
        summary.processes.retain(|p| re.is_match(&p.name));
    }

    match format {
        OutputFormat::Text => print_summary_text(&summary),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&summary)
                .context("Failed to serialize summary")?;
            println!("{}", json);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let config = args.machine_config()?;

    match &args.command {
        Command::Info { trace } => {
            let (file, machine) = reconstruct(trace, &config)?;
            print_info(trace, &file, &machine);
        }
        Command::Summary {
            trace,
            start,
            end,
            cpu,
            process,
            format,
        } => {
            let filter = cli::process_filter(process.as_deref())?;
            let (_, machine) = reconstruct(trace, &config)?;
            run_summary(&machine, *start, *end, *cpu, filter.as_ref(), *format)?;
        }
        Command::Events { trace, workers } => {
            let (_, machine) = reconstruct(trace, &config)?;
            let stdout = io::stdout();
            let mut out = io::BufWriter::new(stdout);
            render::render_events(
                &machine,
                0..machine.events().len(),
                *workers,
                config.render_chunk_size,
                &mut out,
            )
            .context("Failed to write event listing")?;
            out.flush()?;
        }
    }

    Ok(())
}
