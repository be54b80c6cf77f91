// Disk I/O correlation
//
// Issue and completion records share the buffer address. Issues wait in a
// nursery until their completion arrives.

use super::ThreadHandle;
use crate::time::{AbsInterval, AbsTime};
use fnv::FnvHashMap;
use serde::Serialize;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IoKind {
    Read,
    Write,
}

/// A completed disk I/O attributed to the issuing thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IoActivity {
    pub thread: ThreadHandle,
    pub interval: AbsInterval,
    pub size: u64,
    pub kind: IoKind,
    pub buf: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingIo {
    thread: ThreadHandle,
    start: AbsTime,
    size: u64,
    kind: IoKind,
}

#[derive(Debug, Default)]
pub struct IoTable {
    pending: FnvHashMap<u64, PendingIo>,
    completed: Vec<IoActivity>,
}

impl IoTable {
    pub(crate) fn issue(&mut self, buf: u64, thread: ThreadHandle, t: AbsTime, size: u64, kind: IoKind) {
        let previous = self.pending.insert(
            buf,
            PendingIo {
                thread,
                start: t,
                size,
                kind,
            },
        );
        if previous.is_some() {
            debug!("I/O on buffer 0x{:x} reissued at {} before completing", buf, t);
        }
    }

    pub(crate) fn complete(&mut self, buf: u64, t: AbsTime) -> bool {
        let Some(pending) = self.pending.remove(&buf) else {
            trace!("I/O completion on buffer 0x{:x} at {} with no issue", buf, t);
            return false;
        };
        self.completed.push(IoActivity {
            thread: pending.thread,
            interval: AbsInterval::from_bounds(pending.start, t.max(pending.start)),
            size: pending.size,
            kind: pending.kind,
            buf,
        });
        true
    }

    /// Completed I/O in completion order.
    pub fn completed(&self) -> &[IoActivity] {
        &self.completed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pending issues never become activity in this generation; they are
    /// only kept for forwarding.
    pub(crate) fn post_initialize(&mut self) {
        if !self.pending.is_empty() {
            debug!("{} I/O operations still pending at end of trace", self.pending.len());
        }
    }

    /// Move pending issues into a fresh table, rewriting thread handles.
    pub(crate) fn forward<F>(&mut self, remap: F) -> IoTable
    where
        F: Fn(ThreadHandle) -> Option<ThreadHandle>,
    {
        let mut next = IoTable::default();
        for (buf, mut pending) in self.pending.drain() {
            match remap(pending.thread) {
                Some(thread) => {
                    pending.thread = thread;
                    next.pending.insert(buf, pending);
                }
                None => trace!("I/O on buffer 0x{:x} dropped with its thread", buf),
            }
        }
        next
    }
}
