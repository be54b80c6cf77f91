// Process records
//
// A process owns no threads; it keeps back-references into the machine's
// thread registry. Termination is derived: the machine marks a process
// trace-terminated only after every thread it ever owned has terminated.

use super::{ProcessHandle, ThreadHandle};
use crate::time::{AbsInterval, AbsTime};
use serde::Serialize;
use tracing::warn;

/// Pid used for the placeholder process that adopts threads with no setup data
pub const UNKNOWN_PID: i32 = -1;

/// Why a process began exiting. The first reason observed wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    None,
    Syscall { status: i32 },
    Jetsam { reason: u32 },
    Exec,
}

/// Importance app-type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AppType {
    Unknown,
    DaemonInteractive,
    DaemonStandard,
    DaemonAdaptive,
    DaemonBackground,
    AppDefault,
    AppTal,
}

impl AppType {
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => AppType::DaemonInteractive,
            2 => AppType::DaemonStandard,
            3 => AppType::DaemonAdaptive,
            4 => AppType::DaemonBackground,
            5 => AppType::AppDefault,
            6 => AppType::AppTal,
            _ => AppType::Unknown,
        }
    }
}

/// How a process record came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessCreatedBy {
    ThreadMap,
    UnknownTid,
    ForkExec,
    Exec,
    PreviousMachine,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineProcess {
    handle: ProcessHandle,
    pid: i32,
    name: String,
    name_set_by_exec: bool,
    start: AbsTime,
    end: Option<AbsTime>,
    exit_reason: ExitReason,
    exit_initiated_at: Option<AbsTime>,
    jetsam_killed_at: Option<AbsTime>,
    app_type: AppType,
    threads: Vec<ThreadHandle>,
    created_by: ProcessCreatedBy,
    trace_terminated: bool,
}

impl MachineProcess {
    pub(crate) fn new(
        handle: ProcessHandle,
        pid: i32,
        name: &str,
        start: AbsTime,
        created_by: ProcessCreatedBy,
    ) -> Self {
        Self {
            handle,
            pid,
            name: name.to_string(),
            name_set_by_exec: false,
            start,
            end: None,
            exit_reason: ExitReason::None,
            exit_initiated_at: None,
            jetsam_killed_at: None,
            app_type: AppType::Unknown,
            threads: Vec::new(),
            created_by,
            trace_terminated: false,
        }
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> &[ThreadHandle] {
        &self.threads
    }

    pub fn created_by(&self) -> ProcessCreatedBy {
        self.created_by
    }

    pub fn is_unknown(&self) -> bool {
        self.created_by == ProcessCreatedBy::UnknownTid
    }

    pub fn is_kernel(&self) -> bool {
        self.pid == 0
    }

    pub fn exit_reason(&self) -> ExitReason {
        self.exit_reason
    }

    pub fn is_exiting(&self) -> bool {
        self.exit_reason != ExitReason::None
    }

    pub fn exit_initiated_at(&self) -> Option<AbsTime> {
        self.exit_initiated_at
    }

    pub fn jetsam_killed_at(&self) -> Option<AbsTime> {
        self.jetsam_killed_at
    }

    pub fn app_type(&self) -> AppType {
        self.app_type
    }

    pub fn is_trace_terminated(&self) -> bool {
        self.trace_terminated
    }

    pub fn start(&self) -> AbsTime {
        self.start
    }

    /// End of the lifetime, if it has been closed
    pub fn end(&self) -> Option<AbsTime> {
        self.end
    }

    /// Lifetime interval. Open lifetimes are reported up to `start` until
    /// the machine is finalized.
    pub fn timespan(&self) -> AbsInterval {
        AbsInterval::from_bounds(self.start, self.end.unwrap_or(self.start))
    }

    /// True if `t` falls within the lifetime, treating an open lifetime as unbounded.
    pub fn is_live_at(&self, t: AbsTime) -> bool {
        t >= self.start && self.end.map_or(true, |end| t < end)
    }

    pub(crate) fn add_thread(&mut self, thread: ThreadHandle) {
        self.threads.push(thread);
    }

    /// Record the first exit reason; later reasons are ignored.
    pub(crate) fn set_exit_reason(&mut self, reason: ExitReason, t: AbsTime) -> bool {
        if self.exit_reason != ExitReason::None {
            return false;
        }
        self.exit_reason = reason;
        self.exit_initiated_at = Some(t);
        true
    }

    pub(crate) fn set_jetsam_killed(&mut self, reason: u32, t: AbsTime) {
        self.jetsam_killed_at.get_or_insert(t);
        self.set_exit_reason(ExitReason::Jetsam { reason }, t);
    }

    /// Name assigned by an exec name record. Only the first one sticks.
    pub(crate) fn set_exec_name(&mut self, name: &str) -> bool {
        if self.name_set_by_exec {
            warn!(
                "pid {} already named '{}' by exec, ignoring '{}'",
                self.pid, self.name, name
            );
            return false;
        }
        self.name = name.to_string();
        self.name_set_by_exec = true;
        true
    }

    pub(crate) fn set_app_type(&mut self, app_type: AppType) {
        self.app_type = app_type;
    }

    /// Close the lifetime at `t` unless already closed.
    pub(crate) fn close(&mut self, t: AbsTime) {
        if self.end.is_none() {
            self.end = Some(t.max(self.start));
        }
    }

    pub(crate) fn mark_trace_terminated(&mut self, t: AbsTime) {
        self.close(t);
        self.trace_terminated = true;
    }

    pub(crate) fn post_initialize(&mut self, last: AbsTime) {
        self.close(last + 1);
    }

    /// Copy identity and exit state into a record for the next generation.
    pub(crate) fn forwarded(&self, handle: ProcessHandle, start: AbsTime) -> Self {
        let created_by = if self.is_unknown() {
            ProcessCreatedBy::UnknownTid
        } else {
            ProcessCreatedBy::PreviousMachine
        };
        Self {
            handle,
            pid: self.pid,
            name: self.name.clone(),
            name_set_by_exec: self.name_set_by_exec,
            start,
            end: None,
            exit_reason: self.exit_reason,
            exit_initiated_at: self.exit_initiated_at,
            jetsam_killed_at: self.jetsam_killed_at,
            app_type: self.app_type,
            threads: Vec::new(),
            created_by,
            trace_terminated: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process() -> MachineProcess {
        MachineProcess::new(ProcessHandle(0), 42, "cat", AbsTime(10), ProcessCreatedBy::ThreadMap)
    }

    #[test]
    fn test_first_exit_reason_wins() {
        let mut p = process();
        assert!(p.set_exit_reason(ExitReason::Syscall { status: 0 }, AbsTime(20)));
        assert!(!p.set_exit_reason(ExitReason::Exec, AbsTime(30)));
        assert_eq!(p.exit_reason(), ExitReason::Syscall { status: 0 });
        assert_eq!(p.exit_initiated_at(), Some(AbsTime(20)));
    }

    #[test]
    fn test_exec_name_set_once() {
        let mut p = process();
        assert!(p.set_exec_name("bash"));
        assert!(!p.set_exec_name("zsh"));
        assert_eq!(p.name(), "bash");
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut p = process();
        p.close(AbsTime(50));
        p.close(AbsTime(80));
        assert_eq!(p.timespan(), AbsInterval::from_bounds(AbsTime(10), AbsTime(50)));
        assert!(p.is_live_at(AbsTime(49)));
        assert!(!p.is_live_at(AbsTime(50)));
    }

    #[test]
    fn test_app_type_codes() {
        assert_eq!(AppType::from_code(5), AppType::AppDefault);
        assert_eq!(AppType::from_code(99), AppType::Unknown);
    }
}
