// Thread records
//
// Each sub-state (blocked, page fault, jetsam scan) is a symmetric
// begin/end pair backed by an append-only `IntervalList`. A trace snapshot
// can start mid-interval, so an end with no begin is a no-op. Once the
// lifetime is closed no sub-state can be opened again.

use super::voucher::VoucherRef;
use super::{ProcessHandle, ThreadHandle};
use crate::time::{AbsInterval, AbsTime, IntervalList};
use serde::Serialize;

/// How a thread record came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadCreatedBy {
    ThreadMap,
    UnknownTid,
    NewThread,
    Exec,
    PreviousMachine,
}

/// Interval of a thread's life during which one voucher was adopted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadVoucher {
    pub interval: AbsInterval,
    pub voucher: VoucherRef,
}

/// A closed list plus an optional open interval start
#[derive(Debug, Clone, Default, Serialize)]
pub struct OpenIntervals {
    closed: IntervalList,
    open: Option<AbsTime>,
}

impl OpenIntervals {
    fn begin(&mut self, t: AbsTime) -> bool {
        if self.open.is_some() {
            return false;
        }
        self.open = Some(t);
        true
    }

    fn end(&mut self, t: AbsTime) -> bool {
        match self.open.take() {
            Some(start) => {
                self.closed
                    .push(AbsInterval::from_bounds(start, t.max(start)));
                true
            }
            None => false,
        }
    }

    pub fn intervals(&self) -> &IntervalList {
        &self.closed
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn open_since(&self) -> Option<AbsTime> {
        self.open
    }
}

/// Sub-states open when a machine was finalized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ThreadCarry {
    pub blocked: bool,
    pub faulting: bool,
    pub jetsam: bool,
    pub voucher: Option<VoucherRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineThread {
    handle: ThreadHandle,
    tid: u64,
    process: ProcessHandle,
    start: AbsTime,
    end: Option<AbsTime>,
    is_main_thread: bool,
    created_by: ThreadCreatedBy,
    trace_terminated: bool,

    vouchers: Vec<ThreadVoucher>,
    voucher_since: AbsTime,
    current_voucher: VoucherRef,

    blocked: OpenIntervals,
    faults: OpenIntervals,
    jetsam: OpenIntervals,

    #[serde(skip)]
    carry: ThreadCarry,
}

impl MachineThread {
    pub(crate) fn new(
        handle: ThreadHandle,
        tid: u64,
        process: ProcessHandle,
        start: AbsTime,
        created_by: ThreadCreatedBy,
    ) -> Self {
        Self {
            handle,
            tid,
            process,
            start,
            end: None,
            is_main_thread: false,
            created_by,
            trace_terminated: false,
            vouchers: Vec::new(),
            voucher_since: start,
            current_voucher: VoucherRef::UNSET,
            blocked: OpenIntervals::default(),
            faults: OpenIntervals::default(),
            jetsam: OpenIntervals::default(),
            carry: ThreadCarry::default(),
        }
    }

    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn process(&self) -> ProcessHandle {
        self.process
    }

    pub fn is_main_thread(&self) -> bool {
        self.is_main_thread
    }

    pub fn created_by(&self) -> ThreadCreatedBy {
        self.created_by
    }

    pub fn is_trace_terminated(&self) -> bool {
        self.trace_terminated
    }

    pub fn start(&self) -> AbsTime {
        self.start
    }

    pub fn end(&self) -> Option<AbsTime> {
        self.end
    }

    pub fn timespan(&self) -> AbsInterval {
        AbsInterval::from_bounds(self.start, self.end.unwrap_or(self.start))
    }

    pub fn is_live_at(&self, t: AbsTime) -> bool {
        t >= self.start && self.end.map_or(true, |end| t < end)
    }

    pub fn blocked(&self) -> &IntervalList {
        self.blocked.intervals()
    }

    pub fn faults(&self) -> &IntervalList {
        self.faults.intervals()
    }

    pub fn jetsam_activity(&self) -> &IntervalList {
        self.jetsam.intervals()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_open()
    }

    /// Voucher adopted right now; only meaningful during dispatch.
    pub fn current_voucher(&self) -> VoucherRef {
        self.current_voucher
    }

    /// Voucher history. Covers the whole lifetime once the thread is closed.
    pub fn vouchers(&self) -> &[ThreadVoucher] {
        &self.vouchers
    }

    pub fn voucher_at(&self, t: AbsTime) -> Option<VoucherRef> {
        if self.end.is_none() {
            return (t >= self.voucher_since).then_some(self.current_voucher);
        }
        let idx = self.vouchers.partition_point(|v| v.interval.max() <= t);
        self.vouchers
            .get(idx)
            .filter(|v| v.interval.contains(t))
            .map(|v| v.voucher)
    }

    pub(crate) fn set_main_thread(&mut self) {
        self.is_main_thread = true;
    }

    pub(crate) fn make_runnable(&mut self, t: AbsTime) {
        self.blocked.end(t);
    }

    pub(crate) fn make_unrunnable(&mut self, t: AbsTime) {
        if self.end.is_none() {
            self.blocked.begin(t);
        }
    }

    pub(crate) fn begin_fault(&mut self, t: AbsTime) {
        if self.end.is_none() {
            self.faults.begin(t);
        }
    }

    pub(crate) fn end_fault(&mut self, t: AbsTime) {
        self.faults.end(t);
    }

    pub(crate) fn begin_jetsam_activity(&mut self, t: AbsTime) {
        if self.end.is_none() {
            self.jetsam.begin(t);
        }
    }

    pub(crate) fn end_jetsam_activity(&mut self, t: AbsTime) {
        self.jetsam.end(t);
    }

    pub(crate) fn set_voucher(&mut self, voucher: VoucherRef, t: AbsTime) {
        if voucher == self.current_voucher || self.end.is_some() {
            return;
        }
        if t > self.voucher_since {
            self.vouchers.push(ThreadVoucher {
                interval: AbsInterval::from_bounds(self.voucher_since, t),
                voucher: self.current_voucher,
            });
            self.voucher_since = t;
        }
        self.current_voucher = voucher;
    }

    fn close_at(&mut self, end: AbsTime) {
        if self.end.is_some() {
            return;
        }
        let end = end.max(self.start);
        self.carry = ThreadCarry {
            blocked: self.blocked.end(end),
            faulting: self.faults.end(end),
            jetsam: self.jetsam.end(end),
            voucher: Some(self.current_voucher),
        };
        if end > self.voucher_since || self.vouchers.is_empty() {
            self.vouchers.push(ThreadVoucher {
                interval: AbsInterval::from_bounds(self.voucher_since, end.max(self.voucher_since)),
                voucher: self.current_voucher,
            });
        }
        self.end = Some(end);
    }

    /// Terminate record at `t`: the thread existed through `t` inclusive.
    pub(crate) fn terminate(&mut self, t: AbsTime) {
        self.close_at(t + 1);
        self.trace_terminated = true;
    }

    /// Exec moves the tid to a new record; this one ends exactly at `t`.
    pub(crate) fn end_for_exec(&mut self, t: AbsTime) {
        self.close_at(t);
        self.trace_terminated = true;
    }

    /// A terminated thread still on core when its generation ended: the
    /// record exists only so the next generation can attribute that run.
    pub(crate) fn mark_terminated_at_start(&mut self) {
        self.close_at(self.start);
        self.trace_terminated = true;
    }

    pub(crate) fn post_initialize(&mut self, last: AbsTime) {
        self.close_at(last + 1);
    }

    pub(crate) fn carry(&self) -> ThreadCarry {
        self.carry
    }

    /// Fresh record for the next generation, re-opening carried sub-states at `start`.
    pub(crate) fn forwarded(
        &self,
        handle: ThreadHandle,
        process: ProcessHandle,
        start: AbsTime,
        voucher: VoucherRef,
    ) -> Self {
        let created_by = if self.created_by == ThreadCreatedBy::UnknownTid {
            ThreadCreatedBy::UnknownTid
        } else {
            ThreadCreatedBy::PreviousMachine
        };
        let mut thread = Self::new(handle, self.tid, process, start, created_by);
        thread.is_main_thread = self.is_main_thread;
        thread.current_voucher = voucher;
        if self.carry.blocked {
            thread.make_unrunnable(start);
        }
        if self.carry.faulting {
            thread.begin_fault(start);
        }
        if self.carry.jetsam {
            thread.begin_jetsam_activity(start);
        }
        thread
    }
}
