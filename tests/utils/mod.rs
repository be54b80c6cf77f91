// Integration Test Utilities
//
// Builds kdebug traces as raw little-endian buffers so tests go through the
// same decode path as real captures.

#![allow(dead_code)]

use kdscope::config::MachineConfig;
use kdscope::kdebug::codes::{self, kdbg_code, DBG_FUNC_END, DBG_FUNC_START};
use kdscope::kdebug::{
    CpuMapEntry, Kd64Record, KdEvent, PointerWidth, ThreadMapEntry, TraceBuffers, TraceFile,
};
use kdscope::machine::Machine;
use std::path::{Path, PathBuf};

/// Debug id with no meaning to the reconstruction
pub const MARKER: u32 = kdbg_code(codes::DBG_MACH, 0x7f, 0);

#[derive(Debug, Clone, Default)]
pub struct RawTrace {
    pub records: Vec<Kd64Record>,
    pub threads: Vec<ThreadMapEntry>,
    pub cpus: Vec<CpuMapEntry>,
}

impl RawTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread(mut self, tid: u64, pid: i32, name: &str) -> Self {
        self.threads.push(ThreadMapEntry::new(tid, pid, name));
        self
    }

    pub fn cpu(mut self, id: u32, is_iop: bool, name: &str) -> Self {
        self.cpus.push(CpuMapEntry::new(id, is_iop, name));
        self
    }

    pub fn event(&mut self, ts: u64, cpu: u32, tid: u64, debug_id: u32, args: [u64; 4]) -> &mut Self {
        self.records.push(Kd64Record::new(ts, cpu, args, tid, debug_id));
        self
    }

    pub fn start(&mut self, ts: u64, cpu: u32, tid: u64, code: u32) -> &mut Self {
        self.event(ts, cpu, tid, code | DBG_FUNC_START, [0; 4])
    }

    pub fn end(&mut self, ts: u64, cpu: u32, tid: u64, code: u32) -> &mut Self {
        self.event(ts, cpu, tid, code | DBG_FUNC_END, [0; 4])
    }

    pub fn switch(&mut self, ts: u64, cpu: u32, old: u64, new: u64, reason: u64) -> &mut Self {
        self.event(ts, cpu, old, codes::MACH_SCHED, [reason, new, 0, 0])
    }

    pub fn marker(&mut self, ts: u64, cpu: u32, tid: u64) -> &mut Self {
        self.event(ts, cpu, tid, MARKER, [0; 4])
    }

    pub fn event_bytes(&self) -> Vec<u8> {
        self.records.iter().flat_map(|r| r.to_bytes()).collect()
    }

    pub fn threadmap_bytes(&self) -> Vec<u8> {
        self.threads
            .iter()
            .flat_map(|t| t.to_bytes(PointerWidth::Bits64))
            .collect()
    }

    pub fn cpumap_bytes(&self) -> Vec<u8> {
        self.cpus.iter().flat_map(|c| c.to_bytes()).collect()
    }

    pub fn buffers(&self) -> TraceBuffers {
        TraceBuffers::from_parts(&self.event_bytes(), &self.threadmap_bytes(), &self.cpumap_bytes())
            .expect("trace decodes")
    }

    pub fn events(&self) -> Vec<KdEvent> {
        self.buffers().events
    }

    pub fn machine(&self) -> Machine {
        self.machine_with(&MachineConfig::default())
    }

    pub fn machine_with(&self, config: &MachineConfig) -> Machine {
        Machine::new(&self.buffers(), config)
    }

    /// RAW version 1 image; these carry no cpu map.
    pub fn raw_file(&self) -> Vec<u8> {
        TraceFile::encode(PointerWidth::Bits64, &self.threads, &self.event_bytes())
    }

    pub fn write_raw(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.raw_file()).expect("write trace file");
        path
    }
}

/// One step of a generated scheduler workload
#[derive(Debug, Clone, Copy)]
pub enum Op {
    Switch { cpu: u32, to: usize, block: bool },
    Intr { cpu: u32 },
    Idle { cpu: u32 },
    Fault { cpu: u32 },
    Wake { thread: usize },
    Deactivate { cpu: u32 },
    Spawn { slot: usize },
    Exit { slot: usize },
    Voucher { slot: usize },
}

/// Threads created and terminated by [`Op::Spawn`] and [`Op::Exit`]. They
/// never run; each lives in its own pid so exits end whole processes.
pub fn spawned_threads() -> Vec<(u64, i32)> {
    (0..4u64).map(|i| (0x200 + i, 20 + i as i32)).collect()
}

/// Voucher address toggled by [`Op::Voucher`] for `slot`
pub fn voucher_address(slot: usize) -> u64 {
    0xfeed_0000 + (slot as u64 % 4) * 0x10
}

/// Thread ids and pids used by [`workload`]: four processes, two threads each.
pub fn workload_threads() -> Vec<(u64, i32)> {
    (0..8u64).map(|i| (0x100 + i, 10 + (i / 2) as i32)).collect()
}

/// Turn generated ops into a valid trace on `cpus` CPUs.
///
/// Every CPU gets a thread switched in at time 0 so no state is backdated.
/// Interrupt, idle and fault intervals are only ended after being started,
/// and context switches are skipped while a CPU is interrupted or idle, or
/// when the incoming thread is already on another CPU. A deactivate is only
/// emitted on an idle CPU and is followed by the forced switch it arms.
/// Spawns, exits and voucher records toggle per slot so that every exit
/// and destroy has a matching live record.
pub fn workload(cpus: u32, ops: &[(u64, Op)]) -> RawTrace {
    let threads = workload_threads();
    let mut trace = RawTrace::new();
    for id in 0..cpus {
        trace = trace.cpu(id, false, &format!("cpu{}", id));
    }
    for (tid, pid) in &threads {
        trace = trace.thread(*tid, *pid, &format!("proc{}", pid));
    }

    let mut current: Vec<usize> = (0..cpus as usize).map(|c| c % threads.len()).collect();
    let mut intr = vec![false; cpus as usize];
    let mut idle = vec![false; cpus as usize];
    let mut faulting = vec![false; threads.len()];
    let spawned = spawned_threads();
    let mut alive = vec![false; spawned.len()];
    let mut vouchers = [false; 4];

    let mut ts = 0;
    for cpu in 0..cpus {
        let tid = threads[current[cpu as usize]].0;
        trace.switch(ts, cpu, tid, tid, codes::AST_PREEMPT);
    }

    for (delta, op) in ops {
        ts += (*delta).max(1);
        match *op {
            Op::Switch { cpu, to, block } => {
                let c = (cpu % cpus) as usize;
                if intr[c] || idle[c] {
                    continue;
                }
                let old = threads[current[c]].0;
                let to = to % threads.len();
                if to != current[c] && current.contains(&to) {
                    continue;
                }
                let reason = if block { 0 } else { codes::AST_QUANTUM };
                trace.switch(ts, c as u32, old, threads[to].0, reason);
                current[c] = to;
            }
            Op::Intr { cpu } => {
                let c = (cpu % cpus) as usize;
                let tid = threads[current[c]].0;
                if intr[c] {
                    trace.end(ts, c as u32, tid, codes::MACH_INTR);
                } else {
                    trace.start(ts, c as u32, tid, codes::MACH_INTR);
                }
                intr[c] = !intr[c];
            }
            Op::Idle { cpu } => {
                let c = (cpu % cpus) as usize;
                if !idle[c] && intr[c] {
                    continue;
                }
                let tid = threads[current[c]].0;
                if idle[c] {
                    trace.end(ts, c as u32, tid, codes::MACH_IDLE);
                } else {
                    trace.start(ts, c as u32, tid, codes::MACH_IDLE);
                }
                idle[c] = !idle[c];
            }
            Op::Fault { cpu } => {
                let c = (cpu % cpus) as usize;
                let thread = current[c];
                let tid = threads[thread].0;
                if faulting[thread] {
                    trace.end(ts, c as u32, tid, codes::MACH_VM_FAULT);
                } else {
                    trace.start(ts, c as u32, tid, codes::MACH_VM_FAULT);
                }
                faulting[thread] = !faulting[thread];
            }
            Op::Wake { thread } => {
                let thread = thread % threads.len();
                let c = 0;
                let tid = threads[current[c]].0;
                trace.event(
                    ts,
                    c as u32,
                    tid,
                    codes::MACH_MAKE_RUNNABLE,
                    [threads[thread].0, 0, 0, 0],
                );
            }
            Op::Deactivate { cpu } => {
                let c = (cpu % cpus) as usize;
                if !idle[c] || intr[c] {
                    continue;
                }
                let tid = threads[current[c]].0;
                trace
                    .event(ts, c as u32, tid, codes::MACH_CPU_DEACTIVATE, [0; 4])
                    .switch(ts, c as u32, tid, tid, codes::AST_QUANTUM);
                idle[c] = false;
            }
            Op::Spawn { slot } => {
                let slot = slot % spawned.len();
                if alive[slot] {
                    continue;
                }
                let (tid, pid) = spawned[slot];
                let parent = threads[current[0]].0;
                trace.event(ts, 0, parent, codes::TRACE_DATA_NEWTHREAD, [tid, pid as u64, 0, 0]);
                alive[slot] = true;
            }
            Op::Exit { slot } => {
                let slot = slot % spawned.len();
                if !alive[slot] {
                    continue;
                }
                let parent = threads[current[0]].0;
                trace.event(
                    ts,
                    0,
                    parent,
                    codes::TRACE_DATA_THREAD_TERMINATE,
                    [spawned[slot].0, 0, 0, 0],
                );
                alive[slot] = false;
            }
            Op::Voucher { slot } => {
                let slot = slot % vouchers.len();
                let code = if vouchers[slot] {
                    codes::MACH_IPC_VOUCHER_DESTROY
                } else {
                    codes::MACH_IPC_VOUCHER_CREATE
                };
                let tid = threads[current[0]].0;
                trace.event(ts, 0, tid, code, [voucher_address(slot), 0, 0, 0]);
                vouchers[slot] = !vouchers[slot];
            }
        }
    }
    trace.marker(ts + 1, 0, threads[current[0]].0);
    trace
}

/// Proptest strategy for a workload of up to `len` ops on four CPUs.
pub fn ops(len: usize) -> impl proptest::strategy::Strategy<Value = Vec<(u64, Op)>> {
    use proptest::prelude::*;

    let op = prop_oneof![
        4 => (0u32..4, 0usize..8, any::<bool>())
            .prop_map(|(cpu, to, block)| Op::Switch { cpu, to, block }),
        1 => (0u32..4).prop_map(|cpu| Op::Intr { cpu }),
        1 => (0u32..4).prop_map(|cpu| Op::Idle { cpu }),
        1 => (0u32..4).prop_map(|cpu| Op::Fault { cpu }),
        1 => (0usize..8).prop_map(|thread| Op::Wake { thread }),
        1 => (0u32..4).prop_map(|cpu| Op::Deactivate { cpu }),
        1 => (0usize..4).prop_map(|slot| Op::Spawn { slot }),
        1 => (0usize..4).prop_map(|slot| Op::Exit { slot }),
        1 => (0usize..4).prop_map(|slot| Op::Voucher { slot }),
    ];
    prop::collection::vec((1u64..50, op), 1..len)
}
