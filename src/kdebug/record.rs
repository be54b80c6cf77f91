// Fixed-layout kdebug records and their normalized view
//
// The kernel writes one of two layouts depending on its pointer width. Both
// are exposed through `KdRecord`; the rest of the crate only ever sees the
// normalized `KdEvent`.

use crate::time::AbsTime;
use serde::Serialize;
use std::fmt;

/// Which of the two record layouts a buffer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    pub fn bits(self) -> u8 {
        match self {
            PointerWidth::Bits32 => 32,
            PointerWidth::Bits64 => 64,
        }
    }

    pub fn word_size(self) -> usize {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }

    pub fn event_size(self) -> usize {
        match self {
            PointerWidth::Bits32 => Kd32Record::SIZE,
            PointerWidth::Bits64 => Kd64Record::SIZE,
        }
    }
}

impl fmt::Display for PointerWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Function qualifier in the low two debug-id bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FuncQualifier {
    None,
    Start,
    End,
    /// Both bits set; legal on the wire, dispatched like `None`
    Both,
}

/// 32-bit kdebug debug-id: class(8) | subclass(8) | code(14) | func(2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DebugId(pub u32);

impl DebugId {
    pub fn class(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn subclass(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn code(self) -> u16 {
        ((self.0 >> 2) & 0x3fff) as u16
    }

    pub fn func(self) -> FuncQualifier {
        match self.0 & 0x3 {
            0 => FuncQualifier::None,
            1 => FuncQualifier::Start,
            2 => FuncQualifier::End,
            _ => FuncQualifier::Both,
        }
    }

    /// Debug-id with the qualifier bits cleared
    pub fn event_id(self) -> u32 {
        self.0 & !0x3
    }

    /// Debug-id with only the class and subclass kept
    pub fn class_subclass(self) -> u32 {
        self.0 & 0xffff_0000
    }
}

impl fmt::Display for DebugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Normalized accessor over either record layout
pub trait KdRecord {
    const WIDTH: PointerWidth;
    const SIZE: usize;

    fn timestamp(&self) -> AbsTime;
    fn cpu(&self) -> u32;
    fn args(&self) -> [u64; 4];
    fn tid(&self) -> u64;
    fn debug_id(&self) -> DebugId;

    /// Format self-check: the 64-bit layout has a field that must be zero.
    fn reserved_is_zero(&self) -> bool {
        true
    }

    /// Decode one record from exactly `SIZE` little-endian bytes.
    fn from_bytes(bytes: &[u8]) -> Self;
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

pub(crate) fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    read_u32(bytes, offset)
}

pub(crate) fn le_u64(bytes: &[u8], offset: usize) -> u64 {
    read_u64(bytes, offset)
}

const TIMESTAMP_MASK_32: u64 = 0x00ff_ffff_ffff_ffff;

/// Record written by a 32-bit kernel: cpu packed into the timestamp word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kd32Record {
    pub timestamp_and_cpu: u64,
    pub args: [u32; 4],
    pub tid: u32,
    pub debug_id: u32,
}

impl Kd32Record {
    pub fn new(timestamp: u64, cpu: u8, args: [u32; 4], tid: u32, debug_id: u32) -> Self {
        Self {
            timestamp_and_cpu: ((cpu as u64) << 56) | (timestamp & TIMESTAMP_MASK_32),
            args,
            tid,
            debug_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[0..8].copy_from_slice(&self.timestamp_and_cpu.to_le_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            out[8 + i * 4..12 + i * 4].copy_from_slice(&arg.to_le_bytes());
        }
        out[24..28].copy_from_slice(&self.tid.to_le_bytes());
        out[28..32].copy_from_slice(&self.debug_id.to_le_bytes());
        out
    }
}

impl KdRecord for Kd32Record {
    const WIDTH: PointerWidth = PointerWidth::Bits32;
    const SIZE: usize = 32;

    fn timestamp(&self) -> AbsTime {
        AbsTime(self.timestamp_and_cpu & TIMESTAMP_MASK_32)
    }

    fn cpu(&self) -> u32 {
        (self.timestamp_and_cpu >> 56) as u32
    }

    fn args(&self) -> [u64; 4] {
        self.args.map(u64::from)
    }

    fn tid(&self) -> u64 {
        self.tid as u64
    }

    fn debug_id(&self) -> DebugId {
        DebugId(self.debug_id)
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            timestamp_and_cpu: read_u64(bytes, 0),
            args: [
                read_u32(bytes, 8),
                read_u32(bytes, 12),
                read_u32(bytes, 16),
                read_u32(bytes, 20),
            ],
            tid: read_u32(bytes, 24),
            debug_id: read_u32(bytes, 28),
        }
    }
}

/// Record written by a 64-bit kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kd64Record {
    pub timestamp: u64,
    pub args: [u64; 4],
    pub tid: u64,
    pub debug_id: u32,
    pub cpu: u32,
    pub reserved: u64,
}

impl Kd64Record {
    pub fn new(timestamp: u64, cpu: u32, args: [u64; 4], tid: u64, debug_id: u32) -> Self {
        Self {
            timestamp,
            args,
            tid,
            debug_id,
            cpu,
            reserved: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            out[8 + i * 8..16 + i * 8].copy_from_slice(&arg.to_le_bytes());
        }
        out[40..48].copy_from_slice(&self.tid.to_le_bytes());
        out[48..52].copy_from_slice(&self.debug_id.to_le_bytes());
        out[52..56].copy_from_slice(&self.cpu.to_le_bytes());
        out[56..64].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }
}

impl KdRecord for Kd64Record {
    const WIDTH: PointerWidth = PointerWidth::Bits64;
    const SIZE: usize = 64;

    fn timestamp(&self) -> AbsTime {
        AbsTime(self.timestamp)
    }

    fn cpu(&self) -> u32 {
        self.cpu
    }

    fn args(&self) -> [u64; 4] {
        self.args
    }

    fn tid(&self) -> u64 {
        self.tid
    }

    fn debug_id(&self) -> DebugId {
        DebugId(self.debug_id)
    }

    fn reserved_is_zero(&self) -> bool {
        self.reserved == 0
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            timestamp: read_u64(bytes, 0),
            args: [
                read_u64(bytes, 8),
                read_u64(bytes, 16),
                read_u64(bytes, 24),
                read_u64(bytes, 32),
            ],
            tid: read_u64(bytes, 40),
            debug_id: read_u32(bytes, 48),
            cpu: read_u32(bytes, 52),
            reserved: read_u64(bytes, 56),
        }
    }
}

/// Width-independent copy of one trace record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KdEvent {
    pub index: usize,
    pub timestamp: AbsTime,
    pub cpu: u32,
    pub args: [u64; 4],
    pub tid: u64,
    pub debug_id: DebugId,
}

impl KdEvent {
    pub fn from_record<R: KdRecord>(record: &R, index: usize) -> Self {
        Self {
            index,
            timestamp: record.timestamp(),
            cpu: record.cpu(),
            args: record.args(),
            tid: record.tid(),
            debug_id: record.debug_id(),
        }
    }

    pub fn arg1(&self) -> u64 {
        self.args[0]
    }

    pub fn arg2(&self) -> u64 {
        self.args[1]
    }

    pub fn arg3(&self) -> u64 {
        self.args[2]
    }

    pub fn arg4(&self) -> u64 {
        self.args[3]
    }

    pub fn is_start(&self) -> bool {
        self.debug_id.func() == FuncQualifier::Start
    }

    pub fn is_end(&self) -> bool {
        self.debug_id.func() == FuncQualifier::End
    }

    /// Argument words as raw bytes, for string-carrying records
    pub fn arg_bytes(&self, width: PointerWidth) -> Vec<u8> {
        let word = width.word_size();
        self.args
            .iter()
            .flat_map(|arg| arg.to_le_bytes().into_iter().take(word))
            .collect()
    }
}
