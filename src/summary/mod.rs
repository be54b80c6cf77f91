//! Windowed summaries over a finalized [`Machine`]
//!
//! A query walks each selected CPU's timeline once, clipped to the window,
//! adding every activity's length to the matching total. Process and
//! thread totals are discovered lazily from the `Run` entries touched.
//!
//! Wallclock run time is the union of per-CPU run intervals. Each CPU's run
//! list is already sorted, so the lists are merged once at the end with
//! [`union_all`]; nothing is re-unioned per interval.
//!
//! Summarizing never mutates the machine, so any number of queries can run
//! concurrently against the same model.

mod types;


pub use types::{CpuSummary, IoTotals, ProcessSummary, SummaryCpu, ThreadSummary};

use crate::machine::{CpuActivityKind, Machine, MachineCpu, ProcessHandle, ThreadHandle};
use crate::time::{intersect_all, total_length, union_all, AbsInterval};
use fnv::FnvHashMap;

#[derive(Default)]
struct ThreadAcc {
    run_time: u64,
    context_switches: usize,
    io: IoTotals,
}

#[derive(Default)]
struct ProcessAcc {
    /// Per selected CPU, in timeline order
    runs: Vec<Vec<AbsInterval>>,
    threads: Vec<ThreadHandle>,
}

/// Totals for `window`, machine-wide or for `cpu` only.
///
/// The window is clipped to the machine timespan first. Unknown CPU ids
/// select nothing.
pub fn summarize(machine: &Machine, window: AbsInterval, cpu: Option<u32>) -> CpuSummary {
    let timespan = machine.timespan();
    let span = window.clipped_to(&timespan).unwrap_or_else(|| {
        let at = window.location().clamp(timespan.location(), timespan.max());
        AbsInterval::new(at, 0)
    });

    let selected: Vec<&MachineCpu> = machine
        .cpus()
        .iter()
        .filter(|c| match cpu {
            Some(id) => c.index() == id,
            None => !c.is_iop(),
        })
        .collect();

    let mut summary = CpuSummary {
        window: span,
        cpu_filter: cpu,
        unknown_time: 0,
        run_time: 0,
        idle_time: 0,
        intr_time: 0,
        context_switches: 0,
        intr_count: 0,
        event_count: 0,
        wallclock_run_time: 0,
        all_cpus_idle_time: 0,
        io: IoTotals::default(),
        future_window: None,
        cpus: Vec::with_capacity(selected.len()),
        processes: Vec::new(),
    };

    let mut threads: FnvHashMap<ThreadHandle, ThreadAcc> = FnvHashMap::default();
    let mut processes: FnvHashMap<ProcessHandle, ProcessAcc> = FnvHashMap::default();
    let mut cpu_runs: Vec<Vec<AbsInterval>> = Vec::with_capacity(selected.len());
    let mut cpu_idles: Vec<Vec<AbsInterval>> = Vec::with_capacity(selected.len());

    for (slot, machine_cpu) in selected.iter().enumerate() {
        let mut totals = SummaryCpu {
            cpu: machine_cpu.index(),
            name: machine_cpu.name().to_string(),
            is_iop: machine_cpu.is_iop(),
            intr_count: machine_cpu.intr_intervals().count_starting_in(&span),
            event_count: machine_cpu.event_count_in(&span),
            ..SummaryCpu::default()
        };
        let mut runs = Vec::new();
        let mut idles = Vec::new();

        for activity in machine_cpu.activity_in(&span) {
            let Some(clipped) = activity.interval.clipped_to(&span) else {
                continue;
            };
            let length = clipped.length();
            match activity.kind {
                CpuActivityKind::Unknown => totals.unknown_time += length,
                CpuActivityKind::Idle => {
                    totals.idle_time += length;
                    idles.push(clipped);
                }
                CpuActivityKind::Intr => totals.intr_time += length,
                CpuActivityKind::Run {
                    thread,
                    is_context_switch,
                } => {
                    totals.run_time += length;
                    runs.push(clipped);
                    let switched_in = is_context_switch && span.contains(activity.interval.location());
                    if switched_in {
                        totals.context_switches += 1;
                    }

                    let acc = threads.entry(thread).or_default();
                    acc.run_time += length;
                    if switched_in {
                        acc.context_switches += 1;
                    }
                    let process = processes
                        .entry(machine.thread_for(thread).process())
                        .or_default();
                    if process.runs.len() < selected.len() {
                        process.runs.resize_with(selected.len(), Vec::new);
                    }
                    process.runs[slot].push(clipped);
                    if !process.threads.contains(&thread) {
                        process.threads.push(thread);
                    }
                }
            }
        }

        summary.unknown_time += totals.unknown_time;
        summary.run_time += totals.run_time;
        summary.idle_time += totals.idle_time;
        summary.intr_time += totals.intr_time;
        summary.context_switches += totals.context_switches;
        summary.intr_count += totals.intr_count;
        summary.event_count += totals.event_count;
        summary.cpus.push(totals);
        cpu_runs.push(runs);
        cpu_idles.push(idles);
    }

    summary.wallclock_run_time = total_length(&union_all(&cpu_runs));
    summary.all_cpus_idle_time = total_length(&intersect_all(&cpu_idles));

    if cpu.is_none() {
        accumulate_io(machine, &span, &mut threads, &mut processes, &mut summary.io);
    }

    summary.future_window = future_window(machine, &span);
    let future_runs = match summary.future_window {
        Some(future) => future_runs(&future, &selected),
        None => FnvHashMap::default(),
    };

    let mut process_summaries: Vec<ProcessSummary> = processes
        .into_iter()
        .map(|(handle, acc)| {
            build_process(machine, handle, acc, &span, &threads, &future_runs, summary.future_window)
        })
        .collect();
    process_summaries.sort_by_key(|p| (p.pid, p.handle));
    summary.processes = process_summaries;
    summary
}

/// Completed I/O overlapping the window. Counts and bytes go to the window
/// the I/O started in; time is the overlap.
fn accumulate_io(
    machine: &Machine,
    span: &AbsInterval,
    threads: &mut FnvHashMap<ThreadHandle, ThreadAcc>,
    processes: &mut FnvHashMap<ProcessHandle, ProcessAcc>,
    total: &mut IoTotals,
) {
    for io in machine.io_activity() {
        let time = io.interval.clipped_to(span).map_or(0, |c| c.length());
        let started = span.contains(io.interval.location());
        if time == 0 && !started {
            continue;
        }
        let entry = IoTotals {
            count: usize::from(started),
            bytes: if started { io.size } else { 0 },
            time,
        };
        total.add(&entry);
        threads.entry(io.thread).or_default().io.add(&entry);
        let process = processes
            .entry(machine.thread_for(io.thread).process())
            .or_default();
        if !process.threads.contains(&io.thread) {
            process.threads.push(io.thread);
        }
    }
}

/// `[span.max(), span.max() + multiplier × span.length())`, only if the
/// machine timespan covers all of it.
fn future_window(machine: &Machine, span: &AbsInterval) -> Option<AbsInterval> {
    if span.is_empty() {
        return None;
    }
    let length = span
        .length()
        .checked_mul(machine.config().future_window_multiplier)?;
    span.max().value().checked_add(length)?;
    let future = AbsInterval::new(span.max(), length);
    machine.timespan().contains_interval(&future).then_some(future)
}

/// Per-thread run intervals inside `future`, across the selected CPUs.
fn future_runs(
    future: &AbsInterval,
    selected: &[&MachineCpu],
) -> FnvHashMap<ThreadHandle, Vec<AbsInterval>> {
    let mut runs: FnvHashMap<ThreadHandle, Vec<AbsInterval>> = FnvHashMap::default();
    for cpu in selected {
        for activity in cpu.activity_in(future) {
            if let (Some(thread), Some(clipped)) =
                (activity.thread(), activity.interval.clipped_to(future))
            {
                runs.entry(thread).or_default().push(clipped);
            }
        }
    }
    runs
}

fn build_process(
    machine: &Machine,
    handle: ProcessHandle,
    acc: ProcessAcc,
    span: &AbsInterval,
    threads: &FnvHashMap<ThreadHandle, ThreadAcc>,
    future_runs: &FnvHashMap<ThreadHandle, Vec<AbsInterval>>,
    future: Option<AbsInterval>,
) -> ProcessSummary {
    let process = machine.process_for(handle);
    let mut summary = ProcessSummary {
        handle,
        pid: process.pid(),
        name: process.name().to_string(),
        run_time: 0,
        wallclock_run_time: total_length(&union_all(&acc.runs)),
        context_switches: 0,
        blocked_time: 0,
        fault_time: 0,
        jetsam_time: 0,
        io: IoTotals::default(),
        future_run_time: 0,
        threads: Vec::with_capacity(acc.threads.len()),
    };

    for thread_handle in acc.threads {
        let thread = machine.thread_for(thread_handle);
        let (run_time, context_switches, io) = threads
            .get(&thread_handle)
            .map_or((0, 0, IoTotals::default()), |t| {
                (t.run_time, t.context_switches, t.io.clone())
            });
        let blocked_time = thread.blocked().overlap_with(span);
        let future_run_time = match future {
            Some(future) => {
                let cap = span
                    .length()
                    .saturating_sub(blocked_time)
                    .saturating_sub(run_time);
                let cutoff = match thread.blocked().containing(future.location()) {
                    Some(_) => future.location(),
                    None => thread
                        .blocked()
                        .first_starting_at_or_after(future.location())
                        .map_or(future.max(), |b| b.location().min(future.max())),
                };
                let runnable = AbsInterval::from_bounds(future.location(), cutoff);
                let ran: u64 = future_runs
                    .get(&thread_handle)
                    .into_iter()
                    .flatten()
                    .filter_map(|r| r.clipped_to(&runnable))
                    .map(|r| r.length())
                    .sum();
                ran.min(cap)
            }
            None => 0,
        };

        let thread_summary = ThreadSummary {
            handle: thread_handle,
            tid: thread.tid(),
            run_time,
            context_switches,
            blocked_time,
            fault_time: thread.faults().overlap_with(span),
            jetsam_time: thread.jetsam_activity().overlap_with(span),
            io,
            future_run_time,
        };
        summary.run_time += thread_summary.run_time;
        summary.context_switches += thread_summary.context_switches;
        summary.blocked_time += thread_summary.blocked_time;
        summary.fault_time += thread_summary.fault_time;
        summary.jetsam_time += thread_summary.jetsam_time;
        summary.io.add(&thread_summary.io);
        summary.future_run_time += thread_summary.future_run_time;
        summary.threads.push(thread_summary);
    }
    summary.threads.sort_by_key(|t| (t.tid, t.handle));
    summary
}
