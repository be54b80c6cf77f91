// Raw kdebug input: record layouts, thread/cpu maps and the loader
//
// Records are produced by the kernel and never mutated here. The loader
// normalizes both pointer widths into `KdEvent` so the reconstruction
// engine is width-agnostic.

pub mod codes;
mod loader;
mod maps;
mod record;

pub use loader::{sanity_check, TraceBuffers, TraceFile, MAX_CPUS, RAW_VERSION1, SANITY_CHECK_EVENTS};
pub use maps::{c_name, parse_cpumap, parse_threadmap, CpuMapEntry, ThreadMapEntry, CPUMAP_FLAG_IOP};
pub use record::{DebugId, FuncQualifier, Kd32Record, Kd64Record, KdEvent, KdRecord, PointerWidth};

#[cfg(test)]
mod tests;
