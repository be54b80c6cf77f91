//! Per-CPU timeline automaton
//!
//! During dispatch a CPU tracks three independent pieces of state (in an
//! interrupt, idle, which thread is on core) and appends closed intervals
//! of each kind to its own raw list. `post_initialize` merges the three
//! lists into one gap-free timeline with precedence
//! `Intr > Idle > Run > Unknown`.
//!
//! Every piece of state starts out *unobserved*. The first END record for a
//! state proves it was on since the trace began, so it is back-dated; the
//! first START proves it was off until then.

use super::ThreadHandle;
use crate::time::{AbsInterval, AbsTime, IntervalList};
use serde::Serialize;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CpuActivityKind {
    Unknown,
    Idle,
    Intr,
    Run {
        thread: ThreadHandle,
        is_context_switch: bool,
    },
}

/// One entry of a finalized timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuActivity {
    pub interval: AbsInterval,
    pub kind: CpuActivityKind,
}

impl CpuActivity {
    pub fn thread(&self) -> Option<ThreadHandle> {
        match self.kind {
            CpuActivityKind::Run { thread, .. } => Some(thread),
            _ => None,
        }
    }

    pub fn is_context_switch(&self) -> bool {
        matches!(
            self.kind,
            CpuActivityKind::Run {
                is_context_switch: true,
                ..
            }
        )
    }
}

/// A thread's stay on this CPU, before precedence is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunInterval {
    pub interval: AbsInterval,
    pub thread: ThreadHandle,
    pub began_with_context_switch: bool,
}

/// Automaton state left at the end of dispatch, used to seed the next generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CpuEndState {
    pub intr: Option<bool>,
    pub idle: Option<bool>,
    pub thread: Option<Option<ThreadHandle>>,
    pub deactivate_switch_to_idle_thread: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineCpu {
    index: u32,
    is_iop: bool,
    name: String,
    trace_start: AbsTime,

    #[serde(skip)]
    intr: Option<bool>,
    #[serde(skip)]
    intr_since: AbsTime,
    #[serde(skip)]
    idle: Option<bool>,
    #[serde(skip)]
    idle_since: AbsTime,
    #[serde(skip)]
    thread: Option<Option<ThreadHandle>>,
    #[serde(skip)]
    thread_since: AbsTime,
    #[serde(skip)]
    thread_switched_in: bool,
    #[serde(skip)]
    deactivate_switch_to_idle_thread: bool,

    intr_intervals: IntervalList,
    idle_intervals: IntervalList,
    run_intervals: Vec<RunInterval>,
    timeline: Vec<CpuActivity>,
    #[serde(skip)]
    event_times: Vec<AbsTime>,
    finalized: bool,
}

impl MachineCpu {
    pub(crate) fn new(index: u32, is_iop: bool, name: &str, trace_start: AbsTime) -> Self {
        Self {
            index,
            is_iop,
            name: name.to_string(),
            trace_start,
            intr: None,
            intr_since: trace_start,
            idle: None,
            idle_since: trace_start,
            thread: None,
            thread_since: trace_start,
            thread_switched_in: false,
            deactivate_switch_to_idle_thread: false,
            intr_intervals: IntervalList::new(),
            idle_intervals: IntervalList::new(),
            run_intervals: Vec::new(),
            timeline: Vec::new(),
            event_times: Vec::new(),
            finalized: false,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_iop(&self) -> bool {
        self.is_iop
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thread currently on core, if known. Only meaningful during dispatch.
    pub fn current_thread(&self) -> Option<ThreadHandle> {
        self.thread.flatten()
    }

    pub fn is_intr(&self) -> bool {
        self.intr == Some(true)
    }

    pub fn is_idle(&self) -> bool {
        self.idle == Some(true)
    }

    pub fn intr_intervals(&self) -> &IntervalList {
        &self.intr_intervals
    }

    pub fn idle_intervals(&self) -> &IntervalList {
        &self.idle_intervals
    }

    pub fn run_intervals(&self) -> &[RunInterval] {
        &self.run_intervals
    }

    pub fn timeline(&self) -> &[CpuActivity] {
        &self.timeline
    }

    /// Timeline entry covering `t`.
    pub fn activity_at(&self, t: AbsTime) -> Option<&CpuActivity> {
        let idx = self.timeline.partition_point(|a| a.interval.max() <= t);
        self.timeline.get(idx).filter(|a| a.interval.contains(t))
    }

    /// Timeline entries overlapping `window`, in order.
    pub fn activity_in(&self, window: &AbsInterval) -> &[CpuActivity] {
        let start = self
            .timeline
            .partition_point(|a| a.interval.max() <= window.location());
        let end = self
            .timeline
            .partition_point(|a| a.interval.location() < window.max());
        &self.timeline[start..end.max(start)]
    }

    /// Number of events this CPU emitted inside `window`.
    pub fn event_count_in(&self, window: &AbsInterval) -> usize {
        let start = self.event_times.partition_point(|t| *t < window.location());
        let end = self.event_times.partition_point(|t| *t < window.max());
        end - start
    }

    pub fn event_count(&self) -> usize {
        self.event_times.len()
    }

    pub(crate) fn record_event(&mut self, t: AbsTime) {
        self.event_times.push(t);
    }

    pub fn set_intr(&mut self, t: AbsTime) {
        if self.intr == Some(true) {
            trace!("cpu {} interrupt start at {} while interrupted", self.index, t);
            return;
        }
        self.intr = Some(true);
        self.intr_since = t;
    }

    pub fn clear_intr(&mut self, t: AbsTime) {
        match self.intr {
            None => {
                self.intr_intervals
                    .push(AbsInterval::from_bounds(self.trace_start, t));
                self.intr = Some(false);
            }
            Some(true) => {
                self.intr_intervals
                    .push(AbsInterval::from_bounds(self.intr_since, t));
                self.intr = Some(false);
            }
            Some(false) => {}
        }
    }

    pub fn set_idle(&mut self, t: AbsTime) {
        if self.idle == Some(true) {
            return;
        }
        self.idle = Some(true);
        self.idle_since = t;
    }

    pub fn clear_idle(&mut self, t: AbsTime) {
        match self.idle {
            None => {
                self.idle_intervals
                    .push(AbsInterval::from_bounds(self.trace_start, t));
                self.idle = Some(false);
            }
            Some(true) => {
                self.idle_intervals
                    .push(AbsInterval::from_bounds(self.idle_since, t));
                self.idle = Some(false);
            }
            Some(false) => {}
        }
    }

    pub fn set_deactivate_switch_to_idle_thread(&mut self) {
        self.deactivate_switch_to_idle_thread = true;
    }

    /// Take `new` onto the core at `t`, closing the stay of whatever was there.
    ///
    /// # Panics
    ///
    /// Panics if the CPU is interrupted, or idle without its thread state
    /// being known-empty and without a pending deactivate switch.
    pub fn context_switch(
        &mut self,
        old: Option<ThreadHandle>,
        new: Option<ThreadHandle>,
        t: AbsTime,
    ) {
        assert!(
            self.intr != Some(true),
            "cpu {} context switch at {} while interrupted",
            self.index,
            t
        );
        if self.idle == Some(true) {
            if self.deactivate_switch_to_idle_thread {
                debug!("cpu {} forced switch to idle thread at {}", self.index, t);
                self.deactivate_switch_to_idle_thread = false;
                self.clear_idle(t);
            } else {
                assert!(
                    self.thread == Some(None),
                    "cpu {} context switch at {} while idle",
                    self.index,
                    t
                );
            }
        }

        match self.thread {
            None => {
                if let Some(old) = old {
                    self.push_run(self.trace_start, t, old, false);
                }
            }
            Some(Some(current)) => {
                if old.is_some() && old != Some(current) {
                    debug!(
                        "cpu {} switch at {} names {:?} as outgoing, but {:?} was on core",
                        self.index, t, old, current
                    );
                }
                self.push_run(self.thread_since, t, current, self.thread_switched_in);
            }
            Some(None) => {}
        }

        self.thread = Some(new);
        self.thread_since = t;
        self.thread_switched_in = true;
    }

    /// Swap the on-core thread record without a scheduling boundary (exec).
    pub(crate) fn replace_current_thread(
        &mut self,
        old: ThreadHandle,
        new: ThreadHandle,
        t: AbsTime,
    ) {
        if self.thread == Some(Some(old)) {
            self.push_run(self.thread_since, t, old, self.thread_switched_in);
            self.thread = Some(Some(new));
            self.thread_since = t;
            self.thread_switched_in = false;
        }
    }

    fn push_run(&mut self, start: AbsTime, end: AbsTime, thread: ThreadHandle, switched_in: bool) {
        let interval = AbsInterval::from_bounds(start, end.max(start));
        if let Some(last) = self.run_intervals.last() {
            assert!(
                interval.location() >= last.interval.max(),
                "cpu {} run interval {} overlaps {}",
                self.index,
                interval,
                last.interval
            );
        }
        self.run_intervals.push(RunInterval {
            interval,
            thread,
            began_with_context_switch: switched_in,
        });
    }

    pub(crate) fn initialize_intr_state(&mut self, intr: bool, t: AbsTime) {
        self.intr = Some(intr);
        self.intr_since = t;
    }

    pub(crate) fn initialize_idle_state(&mut self, idle: bool, t: AbsTime) {
        self.idle = Some(idle);
        self.idle_since = t;
    }

    pub(crate) fn initialize_thread_state(&mut self, thread: Option<ThreadHandle>, t: AbsTime) {
        self.thread = Some(thread);
        self.thread_since = t;
        self.thread_switched_in = false;
    }

    pub(crate) fn initialize_deactivate_state(&mut self, armed: bool) {
        self.deactivate_switch_to_idle_thread = armed;
    }

    pub(crate) fn end_state(&self) -> CpuEndState {
        CpuEndState {
            intr: self.intr,
            idle: self.idle,
            thread: self.thread,
            deactivate_switch_to_idle_thread: self.deactivate_switch_to_idle_thread,
        }
    }

    /// Flush open state to the end of `timespan` and build the timeline.
    pub(crate) fn post_initialize(&mut self, timespan: AbsInterval) {
        assert!(!self.finalized, "cpu {} finalized twice", self.index);
        self.finalized = true;
        // IOP records may arrive out of order.
        self.event_times.sort_unstable();

        if self.is_iop {
            self.timeline = vec![CpuActivity {
                interval: timespan,
                kind: CpuActivityKind::Unknown,
            }];
            return;
        }

        let end = timespan.max();
        if self.intr == Some(true) {
            self.intr_intervals
                .push(AbsInterval::from_bounds(self.intr_since, end.max(self.intr_since)));
        }
        if self.idle == Some(true) {
            self.idle_intervals
                .push(AbsInterval::from_bounds(self.idle_since, end.max(self.idle_since)));
        }
        if let Some(Some(thread)) = self.thread {
            self.push_run(self.thread_since, end, thread, self.thread_switched_in);
        }

        self.timeline = self.sweep(timespan);
    }

    fn sweep(&self, timespan: AbsInterval) -> Vec<CpuActivity> {
        let intr = self.intr_intervals.as_slice();
        let idle = self.idle_intervals.as_slice();
        let run = &self.run_intervals;
        let (mut i, mut d, mut r) = (0, 0, 0);

        let mut timeline: Vec<CpuActivity> = Vec::new();
        let mut t = timespan.location();
        let end = timespan.max();

        while t < end {
            while intr.get(i).is_some_and(|x| x.max() <= t) {
                i += 1;
            }
            while idle.get(d).is_some_and(|x| x.max() <= t) {
                d += 1;
            }
            while run.get(r).is_some_and(|x| x.interval.max() <= t) {
                r += 1;
            }

            let mut next = end;
            let mut active = |interval: &AbsInterval| -> bool {
                if interval.location() <= t {
                    next = next.min(interval.max());
                    true
                } else {
                    next = next.min(interval.location());
                    false
                }
            };
            let in_intr = intr.get(i).is_some_and(|x| active(x));
            let in_idle = idle.get(d).is_some_and(|x| active(x));
            let in_run = run.get(r).filter(|x| active(&x.interval));

            let kind = if in_intr {
                CpuActivityKind::Intr
            } else if in_idle {
                CpuActivityKind::Idle
            } else if let Some(stay) = in_run {
                CpuActivityKind::Run {
                    thread: stay.thread,
                    is_context_switch: stay.began_with_context_switch
                        && stay.interval.location() == t,
                }
            } else {
                CpuActivityKind::Unknown
            };

            push_merged(&mut timeline, AbsInterval::from_bounds(t, next), kind);
            t = next;
        }
        timeline
    }
}

fn push_merged(timeline: &mut Vec<CpuActivity>, interval: AbsInterval, kind: CpuActivityKind) {
    if let Some(last) = timeline.last_mut() {
        let same = match (last.kind, kind) {
            (
                CpuActivityKind::Run { thread: a, .. },
                CpuActivityKind::Run {
                    thread: b,
                    is_context_switch,
                },
            ) => a == b && !is_context_switch,
            (a, b) => a == b,
        };
        if same && last.interval.max() == interval.location() {
            last.interval = last.interval.union(&interval);
            return;
        }
    }
    timeline.push(CpuActivity { interval, kind });
}
