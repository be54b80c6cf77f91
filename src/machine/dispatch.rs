// Event dispatch: one record, one state mutation

use super::io::IoKind;
use super::mach_msg::{MsgEndpoint, MsgOp, NurseryMachMsg};
use super::process::{AppType, ExitReason, ProcessCreatedBy};
use super::thread::ThreadCreatedBy;
use super::{Machine, ThreadHandle};
use crate::kdebug::codes::{self, kdbg_code};
use crate::kdebug::{c_name, FuncQualifier, KdEvent};
use crate::time::AbsTime;
use tracing::{debug, trace};

const DKIO_CLASS: u32 = kdbg_code(codes::DBG_FSYSTEM, codes::DBG_DKRW, 0);
const APPTYPE_CLASS: u32 = kdbg_code(codes::DBG_IMPORTANCE, codes::IMP_TASK_APPTYPE, 0);

impl Machine {
    /// Apply one event. Returns `false` when dispatch must stop.
    pub(super) fn dispatch(&mut self, event: &KdEvent) -> bool {
        self.events_dispatched += 1;
        let t = event.timestamp;
        let id = event.debug_id;

        if id.event_id() == codes::TRACE_LOST_EVENTS {
            return false;
        }

        let thread = self.resolve_thread(event.tid);

        match id.class_subclass() {
            DKIO_CLASS => {
                self.disk_io(event, thread);
                return true;
            }
            APPTYPE_CLASS => {
                let pid = event.arg1() as i32;
                match self.live_process(pid) {
                    Some(process) => self.processes[process.0]
                        .set_app_type(AppType::from_code(id.code())),
                    None => trace!("app type for unknown pid {} at {}", pid, t),
                }
                return true;
            }
            _ => {}
        }

        match id.event_id() {
            codes::TRACE_DATA_NEWTHREAD => {
                self.new_thread(thread, event.arg1(), event.arg2() as i32, t);
            }
            codes::TRACE_DATA_EXEC => {
                self.exec(thread, event.arg1() as i32, event.cpu, t);
            }
            codes::TRACE_STRING_EXEC => {
                self.exec_name(thread, event);
            }
            codes::TRACE_DATA_THREAD_TERMINATE => {
                let terminated = self.resolve_thread(event.arg1());
                self.threads[terminated.0].terminate(t);
                let process = self.threads[terminated.0].process();
                self.check_process_terminated(process, t + 1);
            }
            codes::MACH_SCHED | codes::MACH_STACK_HANDOFF => {
                let new = self.resolve_thread(event.arg2());
                let reason = event.arg1();
                if reason & codes::AST_PREEMPTION_MASK == 0 {
                    self.threads[thread.0].make_unrunnable(t);
                }
                self.threads[new.0].make_runnable(t);
                self.cpu_mut(event.cpu)
                    .context_switch(Some(thread), Some(new), t);
            }
            codes::MACH_MAKE_RUNNABLE => {
                let runnable = self.resolve_thread(event.arg1());
                self.threads[runnable.0].make_runnable(t);
            }
            codes::MACH_IDLE => match id.func() {
                FuncQualifier::Start => self.cpu_mut(event.cpu).set_idle(t),
                FuncQualifier::End => self.cpu_mut(event.cpu).clear_idle(t),
                _ => {}
            },
            codes::MACH_CPU_DEACTIVATE => {
                self.cpu_mut(event.cpu).set_deactivate_switch_to_idle_thread();
            }
            codes::MACH_INTR => match id.func() {
                FuncQualifier::Start => self.cpu_mut(event.cpu).set_intr(t),
                FuncQualifier::End => self.cpu_mut(event.cpu).clear_intr(t),
                _ => {}
            },
            codes::MACH_VM_FAULT => match id.func() {
                FuncQualifier::Start => self.threads[thread.0].begin_fault(t),
                FuncQualifier::End => self.threads[thread.0].end_fault(t),
                _ => {}
            },
            codes::BSD_MEMSTAT_SCAN => match id.func() {
                FuncQualifier::Start => self.threads[thread.0].begin_jetsam_activity(t),
                FuncQualifier::End => self.threads[thread.0].end_jetsam_activity(t),
                _ => {}
            },
            codes::BSD_MEMSTAT_JETSAM => {
                let pid = event.arg1() as i32;
                match self.live_process(pid) {
                    Some(process) => self.processes[process.0]
                        .set_jetsam_killed(event.arg2() as u32, t),
                    None => debug!("jetsam kill of unknown pid {} at {}", pid, t),
                }
            }
            codes::BSD_PROC_EXIT => {
                if id.func() == FuncQualifier::Start {
                    let pid = event.arg1() as i32;
                    let status = event.arg2() as i32;
                    match self.live_process(pid) {
                        Some(process) => {
                            self.processes[process.0]
                                .set_exit_reason(ExitReason::Syscall { status }, t);
                        }
                        None => debug!("exit of unknown pid {} at {}", pid, t),
                    }
                }
            }
            codes::MACH_THREAD_SET_VOUCHER => {
                let voucher = self.vouchers.reference(event.arg2(), t);
                self.threads[thread.0].set_voucher(voucher, t);
            }
            codes::MACH_IPC_VOUCHER_CREATE => {
                self.vouchers
                    .create(event.arg1(), t, event.arg3() as usize);
            }
            codes::MACH_IPC_VOUCHER_CREATE_ATTR_DATA => {
                if self.config.capture_voucher_contents {
                    self.vouchers.capture_content(thread, event, self.width);
                }
            }
            codes::MACH_IPC_VOUCHER_DESTROY => {
                self.vouchers.destroy(event.arg1(), t);
            }
            codes::MACH_IPC_MSG_SEND => {
                let endpoint = self.msg_endpoint(event, thread);
                self.mach_msg_op(event.arg1(), MsgOp::Send(endpoint));
            }
            codes::MACH_IPC_MSG_RECV => {
                let endpoint = self.msg_endpoint(event, thread);
                self.mach_msg_op(event.arg1(), MsgOp::Recv(endpoint));
            }
            codes::MACH_IPC_KMSG_FREE => {
                if self.msg_nursery.contains_key(&event.arg1()) {
                    self.mach_msg_op(event.arg1(), MsgOp::Free);
                }
            }
            _ => self.events_unhandled += 1,
        }
        true
    }

    fn new_thread(&mut self, parent: ThreadHandle, tid: u64, pid: i32, t: AbsTime) {
        let (process, created) = match self.live_process(pid) {
            Some(process) => (process, false),
            None => {
                let name = self.process_of(parent).name().to_string();
                (
                    self.create_process(pid, &name, t, ProcessCreatedBy::ForkExec),
                    true,
                )
            }
        };
        let thread = self.create_thread(tid, process, t, ThreadCreatedBy::NewThread);
        if created {
            self.threads[thread.0].set_main_thread();
        }
    }

    /// Exec replaces the process record for `pid` and moves the calling
    /// thread's tid onto a fresh thread record in it.
    fn exec(&mut self, old_thread: ThreadHandle, pid: i32, cpu: u32, t: AbsTime) {
        let old_process = self.threads[old_thread.0].process();
        let name = self.processes[old_process.0].name().to_string();
        let tid = self.threads[old_thread.0].tid();
        let voucher = self.threads[old_thread.0].current_voucher();

        if Some(old_process) != self.unknown_process {
            self.processes[old_process.0].set_exit_reason(ExitReason::Exec, t);
            let siblings = self.processes[old_process.0].threads().to_vec();
            for sibling in siblings {
                self.threads[sibling.0].end_for_exec(t);
            }
            self.check_process_terminated(old_process, t);
        } else {
            self.threads[old_thread.0].end_for_exec(t);
        }
        if let Some(previous) = self.live_process(pid) {
            self.processes[previous.0].close(t);
        }

        let process = self.create_process(pid, &name, t, ProcessCreatedBy::Exec);
        let thread = self.create_thread(tid, process, t, ThreadCreatedBy::Exec);
        self.threads[thread.0].set_main_thread();
        self.threads[thread.0].set_voucher(voucher, t);
        self.cpu_mut(cpu).replace_current_thread(old_thread, thread, t);
    }

    fn exec_name(&mut self, thread: ThreadHandle, event: &KdEvent) {
        let bytes = event.arg_bytes(self.width);
        let name = match event.debug_id.func() {
            FuncQualifier::Start => {
                self.exec_names.insert(thread, bytes);
                return;
            }
            FuncQualifier::None | FuncQualifier::Both => bytes,
            FuncQualifier::End => {
                let mut buffered = self.exec_names.remove(&thread).unwrap_or_default();
                buffered.extend(bytes);
                buffered
            }
        };
        let process = self.threads[thread.0].process();
        self.processes[process.0].set_exec_name(&c_name(&name));
    }

    fn msg_endpoint(&self, event: &KdEvent, thread: ThreadHandle) -> MsgEndpoint {
        let voucher = match event.arg4() {
            0 => self.threads[thread.0].current_voucher(),
            address => self
                .vouchers
                .lookup(address, event.timestamp)
                .map_or(self.threads[thread.0].current_voucher(), |v| v.reference()),
        };
        MsgEndpoint {
            generation: self.generation,
            event_index: event.index,
            time: event.timestamp,
            tid: event.tid,
            thread: Some(thread),
            voucher,
            msgh_id: event.arg3() as u32,
        }
    }

    /// # Panics
    ///
    /// Panics on a double send or double receive of the same kmsg.
    fn mach_msg_op(&mut self, kmsg: u64, op: MsgOp) {
        let nursery = self
            .msg_nursery
            .entry(kmsg)
            .or_insert_with(|| NurseryMachMsg::new(kmsg));
        let committed = match nursery.transition(op) {
            Ok(committed) => committed,
            Err(e) => panic!("{}", e),
        };
        if !nursery.is_pending() {
            self.msg_nursery.remove(&kmsg);
        }
        if let Some(msg) = committed {
            self.commit_mach_msg(msg);
        }
    }

    fn disk_io(&mut self, event: &KdEvent, thread: ThreadHandle) {
        if !self.config.track_io {
            return;
        }
        let flags = u32::from(event.debug_id.code());
        let buf = event.arg1();
        if flags & codes::DKIO_DONE != 0 {
            self.io.complete(buf, event.timestamp);
        } else {
            let kind = if flags & codes::DKIO_READ != 0 {
                IoKind::Read
            } else {
                IoKind::Write
            };
            self.io.issue(buf, thread, event.timestamp, event.arg4(), kind);
        }
    }
}
