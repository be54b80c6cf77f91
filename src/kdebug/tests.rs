// Loader tests: pointer-width detection and RAW v1 framing

use super::*;
use crate::error::KdError;
use crate::time::AbsTime;

fn events64(records: &[Kd64Record]) -> Vec<u8> {
    records.iter().flat_map(|r| r.to_bytes()).collect()
}

fn events32(records: &[Kd32Record]) -> Vec<u8> {
    records.iter().flat_map(|r| r.to_bytes()).collect()
}

fn cpumap(count: u32) -> Vec<u8> {
    (0..count)
        .flat_map(|cpu| CpuMapEntry::new(cpu, false, &format!("cpu{}", cpu)).to_bytes())
        .collect()
}

#[test]
fn test_detects_64bit_layout() {
    let records: Vec<Kd64Record> = (0..12)
        .map(|i| Kd64Record::new(100 + i, (i % 2) as u32, [i, 0, 0, 0], 7, codes::MACH_SCHED))
        .collect();

    let buffers = TraceBuffers::from_parts(&events64(&records), &[], &cpumap(2)).unwrap();
    assert_eq!(buffers.width, PointerWidth::Bits64);
    assert_eq!(buffers.events.len(), 12);
    assert_eq!(buffers.events[3].timestamp, AbsTime(103));
    assert_eq!(buffers.events[3].cpu, 1);
    assert_eq!(buffers.events[3].index, 3);
}

#[test]
fn test_falls_back_to_32bit_layout() {
    // 4 records of 32 bytes: a multiple of 64 too, so the 64-bit attempt has
    // to be rejected by the self-check rather than by length.
    let records: Vec<Kd32Record> = (0..4)
        .map(|i| Kd32Record::new(1000 + i as u64, 1, [0xdead, 0xbeef, 1, 2], 42, codes::MACH_IDLE | 1))
        .collect();

    let buffers = TraceBuffers::from_parts(&events32(&records), &[], &cpumap(2)).unwrap();
    assert_eq!(buffers.width, PointerWidth::Bits32);
    assert_eq!(buffers.events[0].cpu, 1);
    assert_eq!(buffers.events[0].tid, 42);
    assert_eq!(buffers.events[3].timestamp, AbsTime(1003));
}

#[test]
fn test_rejects_input_matching_neither_width() {
    // The 64-bit view has a non-zero reserved field, the 32-bit view names cpu 0xff.
    let garbage = vec![0xffu8; 64];
    match TraceBuffers::from_parts(&garbage, &[], &cpumap(4)) {
        Err(KdError::AmbiguousPointerWidth { bits64, bits32 }) => {
            assert!(bits64.contains("reserved"));
            assert!(bits32.contains("cpu"));
        }
        other => panic!("expected ambiguity error, got {:?}", other),
    }
}

#[test]
fn test_backwards_timestamps_rejected_on_ap_only() {
    let cpus: Vec<u8> = [
        CpuMapEntry::new(0, false, "AP"),
        CpuMapEntry::new(1, true, "IOP"),
    ]
    .iter()
    .flat_map(|c| c.to_bytes())
    .collect();

    // IOP event out of order is tolerated.
    let tolerated = events64(&[
        Kd64Record::new(100, 0, [0; 4], 1, 0),
        Kd64Record::new(50, 1, [0; 4], 1, 0),
        Kd64Record::new(101, 0, [0; 4], 1, 0),
    ]);
    assert!(TraceBuffers::from_parts_with_width(PointerWidth::Bits64, &tolerated, &[], &cpus).is_ok());

    let rejected = events64(&[
        Kd64Record::new(100, 0, [0; 4], 1, 0),
        Kd64Record::new(50, 0, [0; 4], 1, 0),
    ]);
    let err = TraceBuffers::from_parts_with_width(PointerWidth::Bits64, &rejected, &[], &cpus).unwrap_err();
    assert!(err.to_string().contains("goes backwards"));
}

#[test]
fn test_raw_v1_round_trip() {
    let threadmap = vec![
        ThreadMapEntry::new(0x100, 1, "launchd"),
        ThreadMapEntry::new(0x200, 55, "WindowServer"),
    ];
    let records: Vec<Kd64Record> = (0..3)
        .map(|i| Kd64Record::new(10 * i, 0, [0; 4], 0x100, codes::MACH_SCHED))
        .collect();
    let image = TraceFile::encode(PointerWidth::Bits64, &threadmap, &events64(&records));

    let trace = TraceFile::parse(&image).unwrap();
    assert_eq!(trace.buffers().width, PointerWidth::Bits64);
    assert_eq!(trace.buffers().threadmap, threadmap);
    assert_eq!(trace.buffers().events.len(), 3);
    assert!(trace.buffers().cpumap.is_empty());
}

#[test]
fn test_raw_v1_bad_magic() {
    let image = vec![0u8; 64];
    assert!(matches!(
        TraceFile::parse(&image),
        Err(KdError::BadMagic { found: 0, .. })
    ));
}

#[test]
fn test_raw_v1_truncated_header() {
    assert!(matches!(
        TraceFile::parse(&[1, 2, 3]),
        Err(KdError::Truncated { needed: 20, available: 3 })
    ));
}
