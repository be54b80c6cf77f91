//! Vouchers and the voucher nursery
//!
//! Kernel addresses are reused, so a voucher's identity is its sequence
//! number, not its address. A live voucher sits in the nursery (at most one
//! per address). Destroying it moves the record, by value, onto the end of
//! that address's history vector, which therefore stays sorted and
//! non-overlapping.
//!
//! Two tolerated kernel races are handled here:
//!
//! * a reference record can precede the official create record for the same
//!   address; the reference inserts a placeholder which the create then
//!   patches in place;
//! * a destroy can be the first record seen for a voucher created before the
//!   trace began; the voucher is synthesized from the trace start.

use super::ThreadHandle;
use crate::kdebug::{KdEvent, PointerWidth};
use crate::time::{AbsInterval, AbsTime};
use fnv::FnvHashMap;
use serde::Serialize;
use tracing::{debug, trace};

/// True identity of a voucher
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct VoucherId(pub u64);

impl VoucherId {
    pub const NULL: VoucherId = VoucherId(0);
    pub const UNSET: VoucherId = VoucherId(1);
    const FIRST_REAL: u64 = 2;
}

/// Stable reference to a voucher wherever it currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct VoucherRef {
    pub id: VoucherId,
    pub address: u64,
}

impl VoucherRef {
    pub const NULL: VoucherRef = VoucherRef {
        id: VoucherId::NULL,
        address: 0,
    };
    pub const UNSET: VoucherRef = VoucherRef {
        id: VoucherId::UNSET,
        address: 0,
    };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VoucherFlags {
    pub is_null: bool,
    pub is_unset: bool,
    /// Inserted by a reference record before any create record
    pub created_by_reference: bool,
    /// Destroyed in the trace without ever being created in it
    pub created_before_trace: bool,
    pub created_by_previous_machine: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineVoucher {
    id: VoucherId,
    address: u64,
    start: AbsTime,
    end: Option<AbsTime>,
    content_size: usize,
    content: Option<Vec<u8>>,
    flags: VoucherFlags,
}

impl MachineVoucher {
    fn new(id: VoucherId, address: u64, start: AbsTime, flags: VoucherFlags) -> Self {
        Self {
            id,
            address,
            start,
            end: None,
            content_size: 0,
            content: None,
            flags,
        }
    }

    fn well_known(id: VoucherId) -> Self {
        let flags = VoucherFlags {
            is_null: id == VoucherId::NULL,
            is_unset: id == VoucherId::UNSET,
            ..VoucherFlags::default()
        };
        let mut voucher = Self::new(id, 0, AbsTime::ZERO, flags);
        voucher.end = Some(AbsTime(u64::MAX));
        voucher
    }

    pub fn id(&self) -> VoucherId {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn reference(&self) -> VoucherRef {
        VoucherRef {
            id: self.id,
            address: self.address,
        }
    }

    pub fn flags(&self) -> VoucherFlags {
        self.flags
    }

    pub fn is_null(&self) -> bool {
        self.flags.is_null
    }

    pub fn is_unset(&self) -> bool {
        self.flags.is_unset
    }

    pub fn content(&self) -> Option<&[u8]> {
        self.content.as_deref()
    }

    pub fn content_size(&self) -> usize {
        self.content_size
    }

    pub fn is_live(&self) -> bool {
        self.end.is_none()
    }

    /// Lifetime; an open lifetime is reported as empty at its start.
    pub fn timespan(&self) -> AbsInterval {
        AbsInterval::from_bounds(self.start, self.end.unwrap_or(self.start))
    }

    fn covers(&self, t: AbsTime) -> bool {
        t >= self.start && self.end.map_or(true, |end| t < end)
    }
}

/// Attribute bytes being collected for one voucher on one thread
#[derive(Debug, Clone)]
pub(crate) struct ContentCapture {
    address: u64,
    bytes: Vec<u8>,
}

/// Nursery, history and the two well-known vouchers
#[derive(Debug)]
pub struct VoucherTable {
    next_id: u64,
    trace_start: AbsTime,
    null: MachineVoucher,
    unset: MachineVoucher,
    nursery: FnvHashMap<u64, MachineVoucher>,
    history: FnvHashMap<u64, Vec<MachineVoucher>>,
    captures: FnvHashMap<ThreadHandle, ContentCapture>,
}

impl VoucherTable {
    pub(crate) fn new(trace_start: AbsTime) -> Self {
        Self {
            next_id: VoucherId::FIRST_REAL,
            trace_start,
            null: MachineVoucher::well_known(VoucherId::NULL),
            unset: MachineVoucher::well_known(VoucherId::UNSET),
            nursery: FnvHashMap::default(),
            history: FnvHashMap::default(),
            captures: FnvHashMap::default(),
        }
    }

    fn allocate_id(&mut self) -> VoucherId {
        let id = VoucherId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Earliest start a new voucher at `address` may have without overlapping history.
    fn earliest_start(&self, address: u64) -> AbsTime {
        self.history
            .get(&address)
            .and_then(|h| h.last())
            .map_or(self.trace_start, |last| last.timespan().max().max(self.trace_start))
    }

    /// Create record. Patches a placeholder left by an earlier reference.
    pub(crate) fn create(&mut self, address: u64, t: AbsTime, content_size: usize) -> VoucherRef {
        if let Some(existing) = self.nursery.get_mut(&address) {
            trace!(
                "voucher 0x{:x} created at {} after being referenced; patching {:?}",
                address,
                t,
                existing.id
            );
            existing.flags.created_by_reference = false;
            existing.content_size = content_size;
            return existing.reference();
        }
        let id = self.allocate_id();
        let mut voucher = MachineVoucher::new(id, address, t, VoucherFlags::default());
        voucher.content_size = content_size;
        let reference = voucher.reference();
        self.nursery.insert(address, voucher);
        reference
    }

    /// A record that names a voucher by address. Address 0 is the Null voucher.
    pub(crate) fn reference(&mut self, address: u64, t: AbsTime) -> VoucherRef {
        if address == 0 {
            return VoucherRef::NULL;
        }
        if let Some(live) = self.nursery.get(&address) {
            return live.reference();
        }
        let start = self.earliest_start(address).min(t);
        debug!("voucher 0x{:x} referenced at {} before create", address, t);
        let id = self.allocate_id();
        let flags = VoucherFlags {
            created_by_reference: true,
            ..VoucherFlags::default()
        };
        let voucher = MachineVoucher::new(id, address, start, flags);
        let reference = voucher.reference();
        self.nursery.insert(address, voucher);
        reference
    }

    /// Destroy record: move the live voucher from the nursery into history.
    ///
    /// # Panics
    ///
    /// Panics on a double destroy: no live voucher at `address` although one
    /// has already been destroyed there during the trace.
    pub(crate) fn destroy(&mut self, address: u64, t: AbsTime) {
        let voucher = match self.nursery.remove(&address) {
            Some(mut voucher) => {
                voucher.end = Some(t.max(voucher.start));
                voucher
            }
            None => {
                assert!(
                    self.history.get(&address).map_or(true, Vec::is_empty),
                    "voucher 0x{:x} destroyed at {} twice",
                    address,
                    t
                );
                debug!("voucher 0x{:x} destroyed at {} predates the trace", address, t);
                let id = self.allocate_id();
                let flags = VoucherFlags {
                    created_before_trace: true,
                    ..VoucherFlags::default()
                };
                let mut voucher =
                    MachineVoucher::new(id, address, self.trace_start.min(t), flags);
                voucher.end = Some(t);
                voucher
            }
        };
        self.history.entry(address).or_default().push(voucher);
    }

    /// Start, continue or finish collecting attribute bytes on a thread.
    pub(crate) fn capture_content(
        &mut self,
        thread: ThreadHandle,
        event: &KdEvent,
        width: PointerWidth,
    ) {
        if event.is_start() {
            self.captures.insert(
                thread,
                ContentCapture {
                    address: event.arg1(),
                    bytes: Vec::new(),
                },
            );
            return;
        }
        let Some(capture) = self.captures.get_mut(&thread) else {
            trace!("voucher content record with no capture open on {:?}", thread);
            return;
        };
        capture.bytes.extend(event.arg_bytes(width));
        if event.is_end() {
            let Some(capture) = self.captures.remove(&thread) else {
                return;
            };
            if let Some(voucher) = self.nursery.get_mut(&capture.address) {
                let mut bytes = capture.bytes;
                if voucher.content_size > 0 {
                    bytes.truncate(voucher.content_size);
                }
                voucher.content = Some(bytes);
            }
        }
    }

    /// Voucher at `address` that was alive at `t`.
    pub fn lookup(&self, address: u64, t: AbsTime) -> Option<&MachineVoucher> {
        if address == 0 {
            return Some(&self.null);
        }
        if let Some(live) = self.nursery.get(&address) {
            if live.covers(t) {
                return Some(live);
            }
        }
        let history = self.history.get(&address)?;
        // Binary search only bounds the candidate; membership needs `covers`.
        let idx = history.partition_point(|v| v.timespan().max() <= t);
        history.get(idx).filter(|v| v.covers(t))
    }

    /// Resolve a reference held by a thread or message.
    pub fn resolve(&self, reference: VoucherRef) -> Option<&MachineVoucher> {
        match reference.id {
            VoucherId::NULL => Some(&self.null),
            VoucherId::UNSET => Some(&self.unset),
            id => {
                if let Some(live) = self.nursery.get(&reference.address) {
                    if live.id == id {
                        return Some(live);
                    }
                }
                let history = self.history.get(&reference.address)?;
                history
                    .binary_search_by_key(&id, |v| v.id)
                    .ok()
                    .map(|idx| &history[idx])
            }
        }
    }

    pub fn null_voucher(&self) -> &MachineVoucher {
        &self.null
    }

    pub fn unset_voucher(&self) -> &MachineVoucher {
        &self.unset
    }

    pub fn live(&self) -> impl Iterator<Item = &MachineVoucher> {
        self.nursery.values()
    }

    pub fn history(&self, address: u64) -> &[MachineVoucher] {
        self.history.get(&address).map_or(&[], Vec::as_slice)
    }

    pub fn live_count(&self) -> usize {
        self.nursery.len()
    }

    pub fn destroyed_count(&self) -> usize {
        self.history.values().map(Vec::len).sum()
    }

    /// Close live vouchers at the end of the trace. They stay in the nursery.
    pub(crate) fn post_initialize(&mut self, end: AbsTime) {
        for voucher in self.nursery.values_mut() {
            voucher.end = Some(end.max(voucher.start));
        }
        self.captures.clear();
    }

    /// Move every live voucher into a fresh table for the next generation,
    /// reset to a zero-length open lifetime at `start`.
    pub(crate) fn forward(&mut self, start: AbsTime) -> VoucherTable {
        let mut next = VoucherTable::new(start);
        next.next_id = self.next_id;
        for (address, mut voucher) in self.nursery.drain() {
            voucher.start = start;
            voucher.end = None;
            voucher.flags.created_by_previous_machine = true;
            next.nursery.insert(address, voucher);
        }
        next
    }
}
