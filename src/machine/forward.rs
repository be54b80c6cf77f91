//! Generation forwarding
//!
//! A long capture can be reconstructed in slices. [`Machine::forward`]
//! consumes a finalized parent, moves everything still alive at its end
//! into a child machine and dispatches the next slice of events on the
//! child. The parent comes back as a [`RetiredMachine`]: readable, but no
//! longer owned by value, so it cannot be forwarded a second time.

use super::{Machine, MachineProcess, ProcessHandle, ThreadHandle, VoucherRef};
use crate::config::MachineConfig;
use crate::kdebug::KdEvent;
use fnv::FnvHashMap;
use std::ops::Deref;
use tracing::{debug, info, warn};

/// A parent machine whose live state has been moved into its child
#[derive(Debug)]
pub struct RetiredMachine(Machine);

impl Deref for RetiredMachine {
    type Target = Machine;

    fn deref(&self) -> &Machine {
        &self.0
    }
}

impl Machine {
    /// Continue `parent` with the next slice of `events`.
    ///
    /// The child's timespan begins where the parent's ends. Live threads
    /// and their processes are re-created, each CPU is seeded with the
    /// interrupt, idle and on-core state the parent ended in, live
    /// vouchers are moved (their lifetimes reset to zero length at the
    /// child start) and pending messages and I/O are moved with their
    /// thread handles rewritten.
    ///
    /// A parent that stopped at a lost-events record is still forwarded,
    /// with a warning: its end state is whatever dispatch reached before
    /// the gap, so the child starts from state that may be stale.
    pub fn forward(
        mut parent: Machine,
        events: Vec<KdEvent>,
        config: &MachineConfig,
    ) -> (RetiredMachine, Machine) {
        let start = parent.timespan.max();
        if let Some(at) = parent.lost_events_at {
            warn!(
                "forwarding generation {} which lost events at {}; child state may be stale",
                parent.generation, at
            );
        }
        let events = super::prepare_events(events, config);
        let mut layout: Vec<(u32, bool, String)> = parent
            .cpus
            .iter()
            .map(|cpu| (cpu.index(), cpu.is_iop(), cpu.name().to_string()))
            .collect();
        for event in &events {
            if !parent.cpu_slots.contains_key(&event.cpu)
                && !layout.iter().any(|(id, _, _)| *id == event.cpu)
            {
                layout.push((event.cpu, false, format!("cpu{}", event.cpu)));
            }
        }
        layout.sort_by_key(|(id, _, _)| *id);

        let mut child = Machine::empty(
            parent.generation + 1,
            parent.width,
            events,
            &layout,
            config,
            start,
        );

        let remap = child.adopt_threads(&parent);
        let lookup = |h: ThreadHandle| remap.get(&h).copied();

        for cpu in &parent.cpus {
            let state = cpu.end_state();
            let target = child.cpu_mut(cpu.index());
            if let Some(intr) = state.intr {
                target.initialize_intr_state(intr, start);
            }
            if let Some(idle) = state.idle {
                target.initialize_idle_state(idle, start);
            }
            match state.thread {
                Some(Some(thread)) => match lookup(thread) {
                    Some(thread) => target.initialize_thread_state(Some(thread), start),
                    None => debug!(
                        "cpu {} thread {:?} not forwarded; state left unobserved",
                        cpu.index(),
                        thread
                    ),
                },
                Some(None) => target.initialize_thread_state(None, start),
                None => {}
            }
            target.initialize_deactivate_state(state.deactivate_switch_to_idle_thread);
        }

        child.vouchers = parent.vouchers.forward(start);
        for (kmsg, mut msg) in parent.msg_nursery.drain() {
            msg.remap_threads(lookup);
            child.msg_nursery.insert(kmsg, msg);
        }
        child.io = parent.io.forward(lookup);

        info!(
            "forwarding generation {} at {}: {} threads, {} live vouchers, {} pending messages",
            parent.generation,
            start,
            remap.len(),
            child.vouchers.live_count(),
            child.msg_nursery.len()
        );

        child.run();
        (RetiredMachine(parent), child)
    }

    /// Re-create every thread still alive at the parent's end, plus
    /// terminated threads still on a CPU, under forwarded processes.
    fn adopt_threads(&mut self, parent: &Machine) -> FnvHashMap<ThreadHandle, ThreadHandle> {
        let start = self.timespan.location();
        let last = parent.timespan.max() + 1;
        let on_core: Vec<ThreadHandle> = parent
            .cpus
            .iter()
            .filter_map(|cpu| cpu.end_state().thread.flatten())
            .collect();

        let mut current: Vec<ThreadHandle> = parent.current_tid.values().copied().collect();
        current.sort();

        let mut processes: FnvHashMap<ProcessHandle, ProcessHandle> = FnvHashMap::default();
        let mut remap = FnvHashMap::default();
        for old in current {
            let thread = &parent.threads[old.0];
            let alive = !thread.is_trace_terminated() && thread.end() == Some(last);
            if !alive && !on_core.contains(&old) {
                continue;
            }

            let old_process = thread.process();
            let process = match processes.get(&old_process) {
                Some(process) => *process,
                None => {
                    let forwarded = if parent.processes[old_process.0].is_unknown() {
                        self.unknown_process()
                    } else {
                        self.forward_process(&parent.processes[old_process.0])
                    };
                    processes.insert(old_process, forwarded);
                    forwarded
                }
            };

            let handle = ThreadHandle(self.threads.len());
            let voucher = thread.carry().voucher.unwrap_or(VoucherRef::UNSET);
            let mut forwarded = thread.forwarded(handle, process, start, voucher);
            if !alive {
                forwarded.mark_terminated_at_start();
            }
            self.threads.push(forwarded);
            self.processes[process.0].add_thread(handle);
            self.tid_index.entry(thread.tid()).or_default().push(handle);
            self.current_tid.insert(thread.tid(), handle);
            remap.insert(old, handle);
        }

        for process in processes.into_values() {
            self.check_process_terminated(process, start);
        }
        remap
    }

    fn forward_process(&mut self, old: &MachineProcess) -> ProcessHandle {
        let handle = ProcessHandle(self.processes.len());
        let process = old.forwarded(handle, self.timespan.location());
        self.pid_index.entry(process.pid()).or_default().push(handle);
        self.processes.push(process);
        handle
    }
}
