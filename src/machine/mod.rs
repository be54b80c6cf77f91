//! Reconstructed machine model
//!
//! A [`Machine`] is built by one sequential pass over a finalized event
//! array. Every record mutates CPU, process, thread, voucher, message or
//! I/O state; after the pass `post_initialize` closes whatever is still
//! open and freezes the model. All queries run on the frozen model.
//!
//! Threads and processes live in registry vectors owned by the machine and
//! are named by [`ThreadHandle`]/[`ProcessHandle`]. Processes hold handles
//! of the threads they ever owned; threads hold the handle of their
//! process. Nothing owns anything by pointer.
//!
//! # Example
//!
//! ```
//! use kdscope::config::MachineConfig;
//! use kdscope::kdebug::{codes, KdEvent, PointerWidth, ThreadMapEntry};
//! use kdscope::machine::Machine;
//! use kdscope::time::AbsTime;
//!
//! let event = |ts, debug_id, args| KdEvent {
//!     index: 0,
//!     timestamp: AbsTime(ts),
//!     cpu: 0,
//!     args,
//!     tid: 0x100,
//!     debug_id: kdscope::kdebug::DebugId(debug_id),
//! };
//! let events = vec![
//!     event(0, codes::MACH_VM_FAULT | 1, [0; 4]),
//!     event(50, codes::MACH_VM_FAULT | 2, [0; 4]),
//!     event(100, codes::MACH_SCHED, [0, 0x100, 0, 0]),
//! ];
//! let threadmap = vec![ThreadMapEntry::new(0x100, 7, "demo")];
//!
//! let machine = Machine::from_events(
//!     PointerWidth::Bits64,
//!     events,
//!     &threadmap,
//!     &[],
//!     &MachineConfig::default(),
//! );
//! let thread = machine.thread(0x100, AbsTime(10)).unwrap();
//! assert_eq!(thread.faults().len(), 1);
//! assert_eq!(machine.process(7, AbsTime(10)).unwrap().name(), "demo");
//! ```

pub mod cpu;
mod dispatch;
mod forward;
pub mod io;
pub mod mach_msg;
pub mod process;
pub mod thread;
pub mod voucher;


pub use cpu::{CpuActivity, CpuActivityKind, MachineCpu, RunInterval};
pub use forward::RetiredMachine;
pub use io::{IoActivity, IoKind};
pub use mach_msg::{MachineMachMsg, MsgEndpoint, MsgOp, NurseryMachMsg};
pub use process::{AppType, ExitReason, MachineProcess, ProcessCreatedBy, UNKNOWN_PID};
pub use thread::{MachineThread, ThreadCreatedBy, ThreadVoucher};
pub use voucher::{MachineVoucher, VoucherFlags, VoucherId, VoucherRef, VoucherTable};

use crate::config::MachineConfig;
use crate::kdebug::codes;
use crate::kdebug::{CpuMapEntry, KdEvent, PointerWidth, ThreadMapEntry, TraceBuffers};
use crate::summary::CpuSummary;
use crate::time::{AbsInterval, AbsTime};
use fnv::FnvHashMap;
use io::IoTable;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Index of a thread record in [`Machine::threads`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ThreadHandle(pub(crate) usize);

/// Index of a process record in [`Machine::processes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ProcessHandle(pub(crate) usize);

impl ThreadHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

impl ProcessHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

const UNKNOWN_PROCESS_NAME: &str = "unknown";

#[derive(Debug)]
pub struct Machine {
    generation: u32,
    width: PointerWidth,
    config: MachineConfig,
    events: Vec<KdEvent>,
    timespan: AbsInterval,

    cpus: Vec<MachineCpu>,
    cpu_slots: FnvHashMap<u32, usize>,

    processes: Vec<MachineProcess>,
    threads: Vec<MachineThread>,
    pid_index: FnvHashMap<i32, Vec<ProcessHandle>>,
    tid_index: FnvHashMap<u64, Vec<ThreadHandle>>,
    current_tid: FnvHashMap<u64, ThreadHandle>,
    unknown_process: Option<ProcessHandle>,
    exec_names: FnvHashMap<ThreadHandle, Vec<u8>>,

    vouchers: VoucherTable,
    msg_nursery: FnvHashMap<u64, NurseryMachMsg>,
    mach_msgs: Vec<MachineMachMsg>,
    msg_by_event: FnvHashMap<usize, usize>,
    io: IoTable,

    last_ap_time: AbsTime,
    events_dispatched: usize,
    events_unhandled: usize,
    lost_events_at: Option<AbsTime>,
    finalized: bool,
}

impl Machine {
    /// Reconstruct a machine from decoded trace buffers.
    pub fn new(buffers: &TraceBuffers, config: &MachineConfig) -> Self {
        Self::from_events(
            buffers.width,
            buffers.events.clone(),
            &buffers.threadmap,
            &buffers.cpumap,
            config,
        )
    }

    /// Reconstruct a machine from an event array and the two maps.
    ///
    /// # Panics
    ///
    /// Panics when the events describe an impossible state transition, for
    /// example a context switch during an interrupt, a double voucher
    /// destroy, or an application-processor record that goes back in time
    /// while `sort_events` is off.
    pub fn from_events(
        width: PointerWidth,
        events: Vec<KdEvent>,
        threadmap: &[ThreadMapEntry],
        cpumap: &[CpuMapEntry],
        config: &MachineConfig,
    ) -> Self {
        let events = prepare_events(events, config);
        let start = events
            .iter()
            .map(|e| e.timestamp)
            .min()
            .unwrap_or(AbsTime::ZERO);
        let layout = cpu_layout(cpumap, &events);

        let mut machine = Self::empty(0, width, events, &layout, config, start);
        machine.load_threadmap(threadmap);
        machine.run();
        machine
    }

    fn empty(
        generation: u32,
        width: PointerWidth,
        events: Vec<KdEvent>,
        layout: &[(u32, bool, String)],
        config: &MachineConfig,
        start: AbsTime,
    ) -> Self {
        let mut cpu_slots = FnvHashMap::default();
        let cpus = layout
            .iter()
            .enumerate()
            .map(|(slot, (id, is_iop, name))| {
                cpu_slots.insert(*id, slot);
                MachineCpu::new(*id, *is_iop, name, start)
            })
            .collect();

        Self {
            generation,
            width,
            config: config.clone(),
            events,
            timespan: AbsInterval::from_bounds(start, start),
            cpus,
            cpu_slots,
            processes: Vec::new(),
            threads: Vec::new(),
            pid_index: FnvHashMap::default(),
            tid_index: FnvHashMap::default(),
            current_tid: FnvHashMap::default(),
            unknown_process: None,
            exec_names: FnvHashMap::default(),
            vouchers: VoucherTable::new(start),
            msg_nursery: FnvHashMap::default(),
            mach_msgs: Vec::new(),
            msg_by_event: FnvHashMap::default(),
            io: IoTable::default(),
            last_ap_time: start,
            events_dispatched: 0,
            events_unhandled: 0,
            lost_events_at: None,
            finalized: false,
        }
    }

    fn load_threadmap(&mut self, threadmap: &[ThreadMapEntry]) {
        let start = self.timespan.location();
        for entry in threadmap {
            if self.current_tid.contains_key(&entry.tid) {
                debug!("duplicate thread map entry for tid 0x{:x}", entry.tid);
                continue;
            }
            let (process, created) = match self.live_process(entry.pid) {
                Some(process) => (process, false),
                None => (
                    self.create_process(entry.pid, &entry.name, start, ProcessCreatedBy::ThreadMap),
                    true,
                ),
            };
            let thread = self.create_thread(entry.tid, process, start, ThreadCreatedBy::ThreadMap);
            if created {
                self.threads[thread.0].set_main_thread();
            }
        }
    }

    /// Dispatch every event, then finalize.
    fn run(&mut self) {
        let events = std::mem::take(&mut self.events);
        let mut end = self.timespan.location();
        for event in &events {
            self.cpu_mut(event.cpu).record_event(event.timestamp);
            let lost = event.debug_id.event_id() == codes::TRACE_LOST_EVENTS;
            let iop = self.is_iop_event(event);
            if iop && !lost {
                continue;
            }
            if !self.config.sort_events && !iop {
                assert!(
                    event.timestamp >= self.last_ap_time,
                    "event {} on cpu {} at {} goes backwards (previous {})",
                    event.index,
                    event.cpu,
                    event.timestamp,
                    self.last_ap_time
                );
            }
            self.last_ap_time = event.timestamp;
            end = end.max(event.timestamp);
            if !self.dispatch(event) {
                warn!(
                    "lost events at {} (event {}); dispatch stopped",
                    event.timestamp, event.index
                );
                self.lost_events_at = Some(event.timestamp);
                break;
            }
        }
        self.events = events;
        self.timespan = AbsInterval::from_bounds(self.timespan.location(), end);
        self.post_initialize();
        info!(
            "generation {} reconstructed: {} events, {} processes, {} threads, {} cpus",
            self.generation,
            self.events_dispatched,
            self.processes.len(),
            self.threads.len(),
            self.cpus.len()
        );
    }

    fn post_initialize(&mut self) {
        assert!(!self.finalized, "machine generation {} finalized twice", self.generation);
        self.finalized = true;

        let timespan = self.timespan;
        let last = timespan.max();
        for cpu in &mut self.cpus {
            cpu.post_initialize(timespan);
        }
        for thread in &mut self.threads {
            thread.post_initialize(last);
        }
        for process in &mut self.processes {
            process.post_initialize(last);
        }
        self.vouchers.post_initialize(last + 1);
        let pending: Vec<MachineMachMsg> = self
            .msg_nursery
            .values()
            .filter_map(NurseryMachMsg::finish)
            .collect();
        for msg in pending {
            self.commit_mach_msg(msg);
        }
        self.io.post_initialize();
    }

    // ----- registry -----

    fn is_iop_event(&self, event: &KdEvent) -> bool {
        self.cpu_slots
            .get(&event.cpu)
            .is_some_and(|slot| self.cpus[*slot].is_iop())
    }

    fn cpu_mut(&mut self, id: u32) -> &mut MachineCpu {
        let slot = self.cpu_slots[&id];
        &mut self.cpus[slot]
    }

    fn live_process(&self, pid: i32) -> Option<ProcessHandle> {
        self.pid_index
            .get(&pid)
            .and_then(|handles| handles.last())
            .copied()
            .filter(|h| self.processes[h.0].end().is_none())
    }

    /// Register a new process record.
    ///
    /// # Panics
    ///
    /// Panics if the previous record for `pid` is still alive at `start`.
    fn create_process(
        &mut self,
        pid: i32,
        name: &str,
        start: AbsTime,
        created_by: ProcessCreatedBy,
    ) -> ProcessHandle {
        let handle = ProcessHandle(self.processes.len());
        if let Some(previous) = self.pid_index.get(&pid).and_then(|h| h.last()) {
            let previous = &self.processes[previous.0];
            assert!(
                previous.end().is_some_and(|end| end <= start),
                "pid {} ('{}') created at {} overlaps its previous record {}",
                pid,
                name,
                start,
                previous.timespan()
            );
        }
        self.processes
            .push(MachineProcess::new(handle, pid, name, start, created_by));
        self.pid_index.entry(pid).or_default().push(handle);
        handle
    }

    fn create_thread(
        &mut self,
        tid: u64,
        process: ProcessHandle,
        start: AbsTime,
        created_by: ThreadCreatedBy,
    ) -> ThreadHandle {
        if let Some(previous) = self.current_tid.get(&tid).copied() {
            let previous = &mut self.threads[previous.0];
            if previous.end().is_none() {
                debug!(
                    "tid 0x{:x} reused at {} without a terminate record",
                    tid, start
                );
                previous.end_for_exec(start);
                let previous_process = previous.process();
                self.check_process_terminated(previous_process, start);
            }
        }
        let handle = ThreadHandle(self.threads.len());
        self.threads
            .push(MachineThread::new(handle, tid, process, start, created_by));
        self.processes[process.0].add_thread(handle);
        self.tid_index.entry(tid).or_default().push(handle);
        self.current_tid.insert(tid, handle);
        handle
    }

    fn unknown_process(&mut self) -> ProcessHandle {
        if let Some(process) = self.unknown_process {
            return process;
        }
        let handle = ProcessHandle(self.processes.len());
        self.processes.push(MachineProcess::new(
            handle,
            UNKNOWN_PID,
            UNKNOWN_PROCESS_NAME,
            self.timespan.location(),
            ProcessCreatedBy::UnknownTid,
        ));
        self.pid_index.entry(UNKNOWN_PID).or_default().push(handle);
        self.unknown_process = Some(handle);
        handle
    }

    /// Thread record currently bound to `tid`, creating a placeholder under
    /// the unknown process if the tid has never been seen.
    fn resolve_thread(&mut self, tid: u64) -> ThreadHandle {
        if let Some(thread) = self.current_tid.get(&tid) {
            return *thread;
        }
        warn!("tid 0x{:x} has no setup data; attaching to unknown process", tid);
        let process = self.unknown_process();
        self.create_thread(
            tid,
            process,
            self.timespan.location(),
            ThreadCreatedBy::UnknownTid,
        )
    }

    /// Mark `process` trace-terminated if every thread it ever owned is.
    fn check_process_terminated(&mut self, process: ProcessHandle, t: AbsTime) {
        if Some(process) == self.unknown_process {
            return;
        }
        let all_terminated = self.processes[process.0]
            .threads()
            .iter()
            .all(|thread| self.threads[thread.0].is_trace_terminated());
        if all_terminated && !self.processes[process.0].is_trace_terminated() {
            self.processes[process.0].mark_trace_terminated(t);
        }
    }

    fn commit_mach_msg(&mut self, msg: MachineMachMsg) {
        let idx = self.mach_msgs.len();
        for endpoint in msg.endpoints() {
            if endpoint.generation == self.generation {
                self.msg_by_event.insert(endpoint.event_index, idx);
            }
        }
        self.mach_msgs.push(msg);
    }

    // ----- queries -----

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn width(&self) -> PointerWidth {
        self.width
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// `[first event, last dispatched event)`
    pub fn timespan(&self) -> AbsInterval {
        self.timespan
    }

    pub fn events(&self) -> &[KdEvent] {
        &self.events
    }

    /// Events actually dispatched; stops short of the array on lost events.
    pub fn events_dispatched(&self) -> usize {
        self.events_dispatched
    }

    pub fn events_unhandled(&self) -> usize {
        self.events_unhandled
    }

    pub fn cpus(&self) -> &[MachineCpu] {
        &self.cpus
    }

    pub fn cpu(&self, id: u32) -> Option<&MachineCpu> {
        self.cpu_slots.get(&id).map(|slot| &self.cpus[*slot])
    }

    /// Number of application processors. IOPs never count.
    pub fn active_cpu_count(&self) -> usize {
        self.cpus.iter().filter(|cpu| !cpu.is_iop()).count()
    }

    pub fn processes(&self) -> &[MachineProcess] {
        &self.processes
    }

    pub fn threads(&self) -> &[MachineThread] {
        &self.threads
    }

    pub fn process_for(&self, handle: ProcessHandle) -> &MachineProcess {
        &self.processes[handle.0]
    }

    pub fn thread_for(&self, handle: ThreadHandle) -> &MachineThread {
        &self.threads[handle.0]
    }

    /// Process owning the thread behind `handle`.
    pub fn process_of(&self, handle: ThreadHandle) -> &MachineProcess {
        self.process_for(self.threads[handle.0].process())
    }

    /// Process record for `pid` alive at `t`.
    pub fn process(&self, pid: i32, t: AbsTime) -> Option<&MachineProcess> {
        let handles = self.pid_index.get(&pid)?;
        let idx = handles.partition_point(|h| self.processes[h.0].start() <= t);
        handles[..idx]
            .iter()
            .rev()
            .map(|h| &self.processes[h.0])
            .find(|p| p.is_live_at(t))
    }

    /// Thread record for `tid` alive at `t`.
    pub fn thread(&self, tid: u64, t: AbsTime) -> Option<&MachineThread> {
        let handles = self.tid_index.get(&tid)?;
        let idx = handles.partition_point(|h| self.threads[h.0].start() <= t);
        handles[..idx]
            .iter()
            .rev()
            .map(|h| &self.threads[h.0])
            .find(|thread| thread.is_live_at(t))
    }

    /// Every record ever created for `pid`, in start order.
    pub fn processes_for_pid(&self, pid: i32) -> impl Iterator<Item = &MachineProcess> {
        self.pid_index
            .get(&pid)
            .into_iter()
            .flatten()
            .map(|h| &self.processes[h.0])
    }

    /// Every record ever created for `tid`, in start order.
    pub fn threads_for_tid(&self, tid: u64) -> impl Iterator<Item = &MachineThread> {
        self.tid_index
            .get(&tid)
            .into_iter()
            .flatten()
            .map(|h| &self.threads[h.0])
    }

    pub fn voucher(&self, address: u64, t: AbsTime) -> Option<&MachineVoucher> {
        self.vouchers.lookup(address, t)
    }

    pub fn vouchers(&self) -> &VoucherTable {
        &self.vouchers
    }

    /// Message that the event at `event_index` sent or received.
    pub fn mach_msg(&self, event_index: usize) -> Option<&MachineMachMsg> {
        self.msg_by_event
            .get(&event_index)
            .map(|idx| &self.mach_msgs[*idx])
    }

    pub fn mach_msgs(&self) -> &[MachineMachMsg] {
        &self.mach_msgs
    }

    pub fn io_activity(&self) -> &[IoActivity] {
        self.io.completed()
    }

    /// Totals for `window`, machine-wide or restricted to one CPU.
    pub fn summary_for_window(&self, window: AbsInterval, cpu: Option<u32>) -> CpuSummary {
        crate::summary::summarize(self, window, cpu)
    }

    /// True if a lost-events record stopped dispatch. Event-level queries
    /// past that point are meaningless; summaries cover what was processed.
    pub fn is_lost_events(&self) -> bool {
        self.lost_events_at.is_some()
    }

    pub fn lost_events_at(&self) -> Option<AbsTime> {
        self.lost_events_at
    }
}

fn prepare_events(mut events: Vec<KdEvent>, config: &MachineConfig) -> Vec<KdEvent> {
    if config.sort_events {
        events.sort_by_key(|e| e.timestamp);
    }
    for (index, event) in events.iter_mut().enumerate() {
        event.index = index;
    }
    events
}

/// CPU identities from the cpu map, plus any id only seen in events.
fn cpu_layout(cpumap: &[CpuMapEntry], events: &[KdEvent]) -> Vec<(u32, bool, String)> {
    let mut layout: Vec<(u32, bool, String)> = cpumap
        .iter()
        .map(|entry| (entry.cpu_id, entry.is_iop, entry.name.clone()))
        .collect();
    let known: BTreeSet<u32> = layout.iter().map(|(id, _, _)| *id).collect();
    let seen: BTreeSet<u32> = events.iter().map(|e| e.cpu).collect();
    for id in seen.difference(&known) {
        if !cpumap.is_empty() {
            debug!("cpu {} missing from cpu map; treating as AP", id);
        }
        layout.push((*id, false, format!("cpu{}", id)));
    }
    layout.sort_by_key(|(id, _, _)| *id);
    layout
}
