//! Turning raw trace bytes into typed arrays
//!
//! The pointer width of a kdebug buffer is not recorded anywhere reliable, so
//! loading is an explicit two-attempt parse: interpret as 64-bit, sanity-check
//! the first few events, and fall back to 32-bit. A buffer that passes neither
//! check is rejected.

use super::maps::{parse_cpumap, parse_threadmap, CpuMapEntry, ThreadMapEntry};
use super::record::{le_u32, Kd32Record, Kd64Record, KdEvent, KdRecord, PointerWidth};
use crate::error::KdError;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Number of leading events inspected by the format self-check
pub const SANITY_CHECK_EVENTS: usize = 10;

/// Upper bound on cpu ids when no cpu map is available
pub const MAX_CPUS: u32 = 256;

/// Magic at the start of a RAW version 1 trace file
pub const RAW_VERSION1: u32 = 0x55aa_0101;

const RAW_HEADER_SIZE: usize = 20;
const RAW_PAGE_SIZE: usize = 4096;

/// Everything the reconstruction consumes, already decoded
#[derive(Debug, Clone)]
pub struct TraceBuffers {
    pub width: PointerWidth,
    pub events: Vec<KdEvent>,
    pub threadmap: Vec<ThreadMapEntry>,
    pub cpumap: Vec<CpuMapEntry>,
}

impl TraceBuffers {
    /// Decode separately captured event, thread-map and cpu-map buffers.
    pub fn from_parts(
        events: &[u8],
        threadmap: &[u8],
        cpumap: &[u8],
    ) -> Result<Self, KdError> {
        let cpumap = parse_cpumap(cpumap);
        detect(|width| {
            let events = decode_events(events, width, &cpumap)?;
            Ok(TraceBuffers {
                width,
                events,
                threadmap: parse_threadmap(threadmap, width),
                cpumap: cpumap.clone(),
            })
        })
    }

    /// Decode with a known pointer width, still applying the self-check.
    pub fn from_parts_with_width(
        width: PointerWidth,
        events: &[u8],
        threadmap: &[u8],
        cpumap: &[u8],
    ) -> Result<Self, KdError> {
        let cpumap = parse_cpumap(cpumap);
        let events = decode_events(events, width, &cpumap)?;
        Ok(TraceBuffers {
            width,
            events,
            threadmap: parse_threadmap(threadmap, width),
            cpumap,
        })
    }
}

fn detect<F>(mut attempt: F) -> Result<TraceBuffers, KdError>
where
    F: FnMut(PointerWidth) -> Result<TraceBuffers, KdError>,
{
    let bits64 = match attempt(PointerWidth::Bits64) {
        Ok(buffers) => return Ok(buffers),
        Err(e) => e,
    };
    debug!("64-bit interpretation failed: {}", bits64);

    match attempt(PointerWidth::Bits32) {
        Ok(buffers) => Ok(buffers),
        Err(bits32) => Err(KdError::AmbiguousPointerWidth {
            bits64: bits64.to_string(),
            bits32: bits32.to_string(),
        }),
    }
}

fn decode_events(
    bytes: &[u8],
    width: PointerWidth,
    cpumap: &[CpuMapEntry],
) -> Result<Vec<KdEvent>, KdError> {
    match width {
        PointerWidth::Bits32 => decode_records::<Kd32Record>(bytes, cpumap),
        PointerWidth::Bits64 => decode_records::<Kd64Record>(bytes, cpumap),
    }
}

fn mismatch(width: PointerWidth, reason: String) -> KdError {
    KdError::LayoutMismatch {
        width: width.bits(),
        reason,
    }
}

fn decode_records<R: KdRecord>(
    bytes: &[u8],
    cpumap: &[CpuMapEntry],
) -> Result<Vec<KdEvent>, KdError> {
    if bytes.len() % R::SIZE != 0 {
        return Err(mismatch(
            R::WIDTH,
            format!(
                "event buffer length {} is not a multiple of {}",
                bytes.len(),
                R::SIZE
            ),
        ));
    }

    let records: Vec<R> = bytes.chunks_exact(R::SIZE).map(R::from_bytes).collect();
    sanity_check(&records, cpumap)?;

    Ok(records
        .iter()
        .enumerate()
        .map(|(index, record)| KdEvent::from_record(record, index))
        .collect())
}

/// Self-check the leading records: cpu ids in range, reserved field zero and
/// timestamps non-decreasing on application processors. IOP events are
/// allowed to arrive out of order.
pub fn sanity_check<R: KdRecord>(records: &[R], cpumap: &[CpuMapEntry]) -> Result<(), KdError> {
    let cpu_limit = if cpumap.is_empty() {
        MAX_CPUS
    } else {
        cpumap.iter().map(|c| c.cpu_id + 1).max().unwrap_or(0)
    };
    let is_iop = |cpu: u32| cpumap.iter().any(|c| c.cpu_id == cpu && c.is_iop);

    let mut last_ap_timestamp = None;
    for (i, record) in records.iter().take(SANITY_CHECK_EVENTS).enumerate() {
        if !record.reserved_is_zero() {
            return Err(mismatch(R::WIDTH, format!("event {} has a non-zero reserved field", i)));
        }
        let cpu = record.cpu();
        if cpu >= cpu_limit {
            return Err(mismatch(
                R::WIDTH,
                format!("event {} names cpu {} (limit {})", i, cpu, cpu_limit),
            ));
        }
        if is_iop(cpu) {
            continue;
        }
        let timestamp = record.timestamp();
        if let Some(last) = last_ap_timestamp {
            if timestamp < last {
                return Err(mismatch(
                    R::WIDTH,
                    format!("event {} timestamp {} goes backwards from {}", i, timestamp, last),
                ));
            }
        }
        last_ap_timestamp = Some(timestamp);
    }
    Ok(())
}

/// A RAW version 1 trace file mapped into memory
///
/// Layout: a packed 20-byte header `{version, thread_count, tod_secs, tod_usecs}`,
/// `thread_count` thread-map entries, zero padding to the next 4096-byte
/// boundary, then the event records. V1 files carry no cpu map.
///
/// # Example
///
/// ```no_run
/// use kdscope::kdebug::TraceFile;
///
/// let trace = TraceFile::open("trace.raw")?;
/// println!("{} events ({})", trace.buffers().events.len(), trace.buffers().width);
/// # Ok::<(), kdscope::error::KdError>(())
/// ```
#[derive(Debug)]
pub struct TraceFile {
    buffers: TraceBuffers,
    tod_secs: u64,
    tod_usecs: u32,
}

impl TraceFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KdError> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the mapping is read-only and dropped before this function returns
        let mmap = unsafe { Mmap::map(&file)? };
        Self::parse(&mmap)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, KdError> {
        if bytes.len() < RAW_HEADER_SIZE {
            return Err(KdError::Truncated {
                needed: RAW_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let version = le_u32(bytes, 0);
        if version != RAW_VERSION1 {
            return Err(KdError::BadMagic {
                expected: RAW_VERSION1,
                found: version,
            });
        }
        let thread_count = le_u32(bytes, 4) as usize;
        let tod_secs = super::record::le_u64(bytes, 8);
        let tod_usecs = le_u32(bytes, 16);

        let buffers = detect(|width| {
            let threadmap_len = thread_count * ThreadMapEntry::entry_size(width);
            let threadmap_end = RAW_HEADER_SIZE + threadmap_len;
            if bytes.len() < threadmap_end {
                return Err(KdError::Truncated {
                    needed: threadmap_end,
                    available: bytes.len(),
                });
            }
            let events_start = threadmap_end.div_ceil(RAW_PAGE_SIZE) * RAW_PAGE_SIZE;
            let events = bytes.get(events_start..).unwrap_or(&[]);
            let events = decode_events(events, width, &[])?;
            Ok(TraceBuffers {
                width,
                events,
                threadmap: parse_threadmap(&bytes[RAW_HEADER_SIZE..threadmap_end], width),
                cpumap: Vec::new(),
            })
        })?;

        Ok(Self {
            buffers,
            tod_secs,
            tod_usecs,
        })
    }

    /// Encode buffers as a RAW version 1 image.
    pub fn encode(width: PointerWidth, threadmap: &[ThreadMapEntry], events: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&RAW_VERSION1.to_le_bytes());
        out.extend_from_slice(&(threadmap.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for entry in threadmap {
            out.extend(entry.to_bytes(width));
        }
        out.resize(out.len().div_ceil(RAW_PAGE_SIZE) * RAW_PAGE_SIZE, 0);
        out.extend_from_slice(events);
        out
    }

    pub fn buffers(&self) -> &TraceBuffers {
        &self.buffers
    }

    pub fn into_buffers(self) -> TraceBuffers {
        self.buffers
    }

    /// Wall-clock time of day recorded when the trace was written
    pub fn time_of_day(&self) -> (u64, u32) {
        (self.tod_secs, self.tod_usecs)
    }
}
