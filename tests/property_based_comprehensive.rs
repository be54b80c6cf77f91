//! Comprehensive property-based tests for the reconstruction and window queries
//!
//! Generated scheduler workloads go through the full decode path, then the
//! finished machine is checked for the invariants every query relies on:
//!
//! 1. CPU timelines tile the machine timespan
//! 2. Per-CPU totals equal the clipped window length
//! 3. Wallclock and all-idle time are bounded by the per-CPU sums
//! 4. Process run time adds up to machine run time
//! 5. Summaries are additive across adjacent windows
//! 6. Records for one tid never overlap
//! 7. Voucher lifetimes at one address never overlap
//! 8. A terminated process outlives none of its threads

mod utils;

use kdscope::kdebug::{Kd64Record, TraceBuffers};
use kdscope::time::{is_sorted_non_overlapping, AbsInterval, AbsTime};
use proptest::prelude::*;
use utils::{ops, voucher_address, workload};

fn window(machine_span: AbsInterval, a: u64, b: u64) -> AbsInterval {
    let base = machine_span.location().value();
    let (x, y) = (a % (machine_span.length() + 1), b % (machine_span.length() + 1));
    AbsInterval::from_bounds(AbsTime(base + x.min(y)), AbsTime(base + x.max(y)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_cpu_timelines_tile_timespan(ops in ops(120), cpus in 1u32..5) {
        let machine = workload(cpus, &ops).machine();
        let span = machine.timespan();

        for cpu in machine.cpus() {
            let timeline = cpu.timeline();
            prop_assert!(!timeline.is_empty());
            prop_assert_eq!(timeline[0].interval.location(), span.location());
            prop_assert_eq!(timeline[timeline.len() - 1].interval.max(), span.max());
            for pair in timeline.windows(2) {
                prop_assert_eq!(pair[0].interval.max(), pair[1].interval.location());
            }
        }
    }

    #[test]
    fn prop_cpu_totals_equal_window(
        ops in ops(120),
        cpus in 1u32..5,
        a in 0u64..10_000,
        b in 0u64..10_000,
    ) {
        let machine = workload(cpus, &ops).machine();
        let w = window(machine.timespan(), a, b);
        let summary = machine.summary_for_window(w, None);

        for cpu in &summary.cpus {
            prop_assert_eq!(cpu.total_time(), summary.window.length());
        }
        prop_assert_eq!(
            summary.run_time + summary.idle_time + summary.intr_time + summary.unknown_time,
            summary.window.length() * summary.cpus.len() as u64
        );
    }

    #[test]
    fn prop_wallclock_and_idle_bounds(ops in ops(120), cpus in 1u32..5) {
        let machine = workload(cpus, &ops).machine();
        let summary = machine.summary_for_window(machine.timespan(), None);

        prop_assert!(summary.wallclock_run_time <= summary.run_time);
        prop_assert!(summary.wallclock_run_time <= summary.window.length());
        let min_idle = summary.cpus.iter().map(|c| c.idle_time).min().unwrap_or(0);
        prop_assert!(summary.all_cpus_idle_time <= min_idle);

        for process in &summary.processes {
            prop_assert!(process.wallclock_run_time <= process.run_time);
            let thread_run: u64 = process.threads.iter().map(|t| t.run_time).sum();
            prop_assert_eq!(thread_run, process.run_time);
        }
    }

    #[test]
    fn prop_process_run_adds_up(
        ops in ops(120),
        cpus in 1u32..5,
        a in 0u64..10_000,
        b in 0u64..10_000,
    ) {
        let machine = workload(cpus, &ops).machine();
        let summary = machine.summary_for_window(window(machine.timespan(), a, b), None);

        let by_process: u64 = summary.processes.iter().map(|p| p.run_time).sum();
        prop_assert_eq!(by_process, summary.run_time);
        let switches: usize = summary.processes.iter().map(|p| p.context_switches).sum();
        prop_assert_eq!(switches, summary.context_switches);
    }

    #[test]
    fn prop_summaries_are_additive(ops in ops(120), cpus in 1u32..5, split in 0u64..10_000) {
        let machine = workload(cpus, &ops).machine();
        let span = machine.timespan();
        let mid = AbsTime(span.location().value() + split % (span.length() + 1));

        let whole = machine.summary_for_window(span, None);
        let left = machine.summary_for_window(AbsInterval::from_bounds(span.location(), mid), None);
        let right = machine.summary_for_window(AbsInterval::from_bounds(mid, span.max()), None);

        prop_assert_eq!(left.run_time + right.run_time, whole.run_time);
        prop_assert_eq!(left.idle_time + right.idle_time, whole.idle_time);
        prop_assert_eq!(left.intr_time + right.intr_time, whole.intr_time);
        prop_assert_eq!(
            left.all_cpus_idle_time + right.all_cpus_idle_time,
            whole.all_cpus_idle_time
        );
        for process in &whole.processes {
            let part = |s: &kdscope::summary::CpuSummary| {
                s.process(process.pid).map_or(0, |p| p.run_time)
            };
            prop_assert_eq!(part(&left) + part(&right), process.run_time);
        }
    }

    #[test]
    fn prop_cpu_filter_matches_cpu_row(ops in ops(120), cpus in 1u32..5, pick in 0u32..4) {
        let machine = workload(cpus, &ops).machine();
        let pick = pick % cpus;
        let all = machine.summary_for_window(machine.timespan(), None);
        let one = machine.summary_for_window(machine.timespan(), Some(pick));

        let row = all.cpu(pick).unwrap();
        prop_assert_eq!(one.run_time, row.run_time);
        prop_assert_eq!(one.idle_time, row.idle_time);
        prop_assert_eq!(one.all_cpus_idle_time, row.idle_time);
        prop_assert_eq!(one.io.count, 0);
    }

    #[test]
    fn prop_tid_records_never_overlap(ops in ops(120), cpus in 1u32..5) {
        let machine = workload(cpus, &ops).machine();
        let tids = utils::workload_threads().into_iter().chain(utils::spawned_threads());
        for (tid, _) in tids {
            let spans: Vec<AbsInterval> = machine.threads_for_tid(tid).map(|t| t.timespan()).collect();
            for pair in spans.windows(2) {
                prop_assert!(pair[0].max() <= pair[1].location());
            }
        }
    }

    #[test]
    fn prop_voucher_history_never_overlaps(ops in ops(120), cpus in 1u32..5) {
        let machine = workload(cpus, &ops).machine();
        for slot in 0..4 {
            let spans: Vec<AbsInterval> = machine
                .vouchers()
                .history(voucher_address(slot))
                .iter()
                .map(|v| v.timespan())
                .collect();
            prop_assert!(is_sorted_non_overlapping(&spans), "{:?}", spans);
        }
    }

    #[test]
    fn prop_terminated_processes_end_after_threads(ops in ops(120), cpus in 1u32..5) {
        let machine = workload(cpus, &ops).machine();
        for process in machine.processes().iter().filter(|p| p.is_trace_terminated()) {
            for handle in process.threads() {
                let thread = machine.thread_for(*handle);
                prop_assert!(thread.is_trace_terminated());
                prop_assert!(thread.end() <= process.end());
            }
        }
    }

    #[test]
    fn prop_decoder_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..1024)) {
        let _ = TraceBuffers::from_parts(&bytes, &[], &[]);
        let _ = kdscope::kdebug::TraceFile::parse(&bytes);
    }

    #[test]
    fn prop_record_fields_survive_encoding(
        ts in any::<u64>(),
        cpu in 0u32..64,
        tid in any::<u64>(),
        debug_id in any::<u32>(),
    ) {
        let record = Kd64Record::new(ts, cpu, [1, 2, 3, 4], tid, debug_id);
        let buffers = TraceBuffers::from_parts_with_width(
            kdscope::kdebug::PointerWidth::Bits64,
            &record.to_bytes(),
            &[],
            &[],
        );
        if let Ok(buffers) = buffers {
            let event = &buffers.events[0];
            prop_assert_eq!(event.timestamp, AbsTime(ts));
            prop_assert_eq!(event.tid, tid);
            prop_assert_eq!(event.arg4(), 4);
        }
    }
}
