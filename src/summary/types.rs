// Aggregation records returned by window queries
//
// Times are in kernel absolute-time units. `run_time` is CPU time (summed
// across CPUs); `wallclock_run_time` is the union across CPUs.

use crate::machine::{ProcessHandle, ThreadHandle};
use crate::time::AbsInterval;
use serde::Serialize;

/// Totals for one CPU inside the window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SummaryCpu {
    pub cpu: u32,
    pub name: String,
    pub is_iop: bool,
    pub unknown_time: u64,
    pub run_time: u64,
    pub idle_time: u64,
    pub intr_time: u64,
    pub context_switches: usize,
    pub intr_count: usize,
    pub event_count: usize,
}

impl SummaryCpu {
    /// Sum of the four activity kinds; equals the clipped window length.
    pub fn total_time(&self) -> u64 {
        self.unknown_time + self.run_time + self.idle_time + self.intr_time
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IoTotals {
    pub count: usize,
    pub bytes: u64,
    pub time: u64,
}

impl IoTotals {
    pub(crate) fn add(&mut self, other: &IoTotals) {
        self.count += other.count;
        self.bytes += other.bytes;
        self.time += other.time;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub handle: ThreadHandle,
    pub tid: u64,
    pub run_time: u64,
    pub context_switches: usize,
    pub blocked_time: u64,
    pub fault_time: u64,
    pub jetsam_time: u64,
    pub io: IoTotals,
    /// Run time in the future window before the thread next blocks
    pub future_run_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub handle: ProcessHandle,
    pub pid: i32,
    pub name: String,
    pub run_time: u64,
    pub wallclock_run_time: u64,
    pub context_switches: usize,
    pub blocked_time: u64,
    pub fault_time: u64,
    pub jetsam_time: u64,
    pub io: IoTotals,
    pub future_run_time: u64,
    pub threads: Vec<ThreadSummary>,
}

/// Machine-wide (or single-CPU) totals for one window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuSummary {
    /// Requested window clipped to the machine timespan
    pub window: AbsInterval,
    pub cpu_filter: Option<u32>,
    pub unknown_time: u64,
    pub run_time: u64,
    pub idle_time: u64,
    pub intr_time: u64,
    pub context_switches: usize,
    pub intr_count: usize,
    pub event_count: usize,
    pub wallclock_run_time: u64,
    pub all_cpus_idle_time: u64,
    pub io: IoTotals,
    /// Window used for future-run projection, when the trace covers it
    pub future_window: Option<AbsInterval>,
    pub cpus: Vec<SummaryCpu>,
    pub processes: Vec<ProcessSummary>,
}

impl CpuSummary {
    pub fn process(&self, pid: i32) -> Option<&ProcessSummary> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    pub fn cpu(&self, cpu: u32) -> Option<&SummaryCpu> {
        self.cpus.iter().find(|c| c.cpu == cpu)
    }

    pub fn active_cpus(&self) -> usize {
        self.cpus.iter().filter(|c| !c.is_iop).count()
    }
}
