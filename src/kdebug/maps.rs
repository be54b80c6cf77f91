// Thread-map and cpu-map records captured alongside the event buffer

use super::record::{le_u32, le_u64, PointerWidth};
use serde::Serialize;

const THREADMAP_NAME_LEN: usize = 20;
const CPUMAP_NAME_LEN: usize = 8;

/// Flag bit marking an I/O processor in `kd_cpumap.flags`
pub const CPUMAP_FLAG_IOP: u32 = 0x1;

/// One `{tid, pid, name}` entry from the kernel thread map
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadMapEntry {
    pub tid: u64,
    pub pid: i32,
    pub name: String,
}

impl ThreadMapEntry {
    pub fn new(tid: u64, pid: i32, name: &str) -> Self {
        Self {
            tid,
            pid,
            name: name.to_string(),
        }
    }

    pub fn entry_size(width: PointerWidth) -> usize {
        width.word_size() + 4 + THREADMAP_NAME_LEN
    }

    pub fn to_bytes(&self, width: PointerWidth) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::entry_size(width));
        match width {
            PointerWidth::Bits32 => out.extend_from_slice(&(self.tid as u32).to_le_bytes()),
            PointerWidth::Bits64 => out.extend_from_slice(&self.tid.to_le_bytes()),
        }
        out.extend_from_slice(&self.pid.to_le_bytes());
        let mut name = [0u8; THREADMAP_NAME_LEN];
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(THREADMAP_NAME_LEN);
        name[..len].copy_from_slice(&bytes[..len]);
        out.extend_from_slice(&name);
        out
    }
}

/// One `{cpu_id, flags, name}` entry from the kernel cpu map
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuMapEntry {
    pub cpu_id: u32,
    pub is_iop: bool,
    pub name: String,
}

impl CpuMapEntry {
    pub const SIZE: usize = 8 + CPUMAP_NAME_LEN;

    pub fn new(cpu_id: u32, is_iop: bool, name: &str) -> Self {
        Self {
            cpu_id,
            is_iop,
            name: name.to_string(),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.cpu_id.to_le_bytes());
        let flags = if self.is_iop { CPUMAP_FLAG_IOP } else { 0 };
        out[4..8].copy_from_slice(&flags.to_le_bytes());
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(CPUMAP_NAME_LEN);
        out[8..8 + len].copy_from_slice(&bytes[..len]);
        out
    }
}

/// Decode a NUL-padded C name field.
pub fn c_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decode a thread map. Parsing stops at the first zero pid because the
/// kernel leaves the unused tail of the buffer zeroed. A trailing partial
/// entry is ignored.
pub fn parse_threadmap(bytes: &[u8], width: PointerWidth) -> Vec<ThreadMapEntry> {
    let size = ThreadMapEntry::entry_size(width);
    let word = width.word_size();
    let mut entries = Vec::new();
    for chunk in bytes.chunks_exact(size) {
        let tid = match width {
            PointerWidth::Bits32 => le_u32(chunk, 0) as u64,
            PointerWidth::Bits64 => le_u64(chunk, 0),
        };
        let pid = le_u32(chunk, word) as i32;
        if pid == 0 {
            break;
        }
        entries.push(ThreadMapEntry {
            tid,
            pid,
            name: c_name(&chunk[word + 4..]),
        });
    }
    entries
}

/// Decode a cpu map.
pub fn parse_cpumap(bytes: &[u8]) -> Vec<CpuMapEntry> {
    bytes
        .chunks_exact(CpuMapEntry::SIZE)
        .map(|chunk| CpuMapEntry {
            cpu_id: le_u32(chunk, 0),
            is_iop: le_u32(chunk, 4) & CPUMAP_FLAG_IOP != 0,
            name: c_name(&chunk[8..]),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threadmap_stops_at_zero_pid() {
        let width = PointerWidth::Bits64;
        let mut bytes = Vec::new();
        bytes.extend(ThreadMapEntry::new(100, 1, "launchd").to_bytes(width));
        bytes.extend(ThreadMapEntry::new(101, 0, "").to_bytes(width));
        bytes.extend(ThreadMapEntry::new(102, 7, "late").to_bytes(width));

        let entries = parse_threadmap(&bytes, width);
        assert_eq!(entries, vec![ThreadMapEntry::new(100, 1, "launchd")]);
    }

    #[test]
    fn test_threadmap_32bit_entry_size() {
        assert_eq!(ThreadMapEntry::entry_size(PointerWidth::Bits32), 28);
        assert_eq!(ThreadMapEntry::entry_size(PointerWidth::Bits64), 32);

        let bytes = ThreadMapEntry::new(9, 3, "a-very-long-process-name").to_bytes(PointerWidth::Bits32);
        let entries = parse_threadmap(&bytes, PointerWidth::Bits32);
        assert_eq!(entries[0].name, "a-very-long-process-");
    }

    #[test]
    fn test_cpumap_iop_flag() {
        let mut bytes = Vec::new();
        bytes.extend(CpuMapEntry::new(0, false, "AP-0").to_bytes());
        bytes.extend(CpuMapEntry::new(1, true, "SMC").to_bytes());
        let entries = parse_cpumap(&bytes);
        assert!(!entries[0].is_iop);
        assert!(entries[1].is_iop);
        assert_eq!(entries[1].name, "SMC");
    }
}
