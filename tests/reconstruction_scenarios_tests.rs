//! End-to-end reconstruction scenarios through the public decode path

mod utils;

use kdscope::error::KdError;
use kdscope::kdebug::codes;
use kdscope::kdebug::{Kd32Record, PointerWidth, ThreadMapEntry, TraceBuffers, TraceFile};
use kdscope::machine::{CpuActivityKind, ThreadCreatedBy};
use kdscope::time::{AbsInterval, AbsTime};
use utils::RawTrace;

fn iv(start: u64, end: u64) -> AbsInterval {
    AbsInterval::from_bounds(AbsTime(start), AbsTime(end))
}

#[test]
fn test_interrupt_then_unknown() {
    let mut trace = RawTrace::new()
        .cpu(0, false, "cpu0")
        .thread(0x10, 1, "launchd");
    trace
        .start(0, 0, 0x10, codes::MACH_INTR)
        .end(10, 0, 0x10, codes::MACH_INTR)
        .marker(20, 0, 0x10);
    let machine = trace.machine();

    let timeline: Vec<_> = machine.cpus()[0]
        .timeline()
        .iter()
        .map(|a| (a.interval, a.kind))
        .collect();
    assert_eq!(
        timeline,
        vec![
            (iv(0, 10), CpuActivityKind::Intr),
            (iv(10, 20), CpuActivityKind::Unknown)
        ]
    );
}

#[test]
fn test_voucher_address_reuse() {
    let mut trace = RawTrace::new()
        .cpu(0, false, "cpu0")
        .thread(0x10, 1, "launchd");
    trace
        .event(5, 0, 0x10, codes::MACH_IPC_VOUCHER_CREATE, [0xfeed, 0, 0, 0])
        .event(15, 0, 0x10, codes::MACH_IPC_VOUCHER_DESTROY, [0xfeed, 0, 0, 0])
        .event(20, 0, 0x10, codes::MACH_IPC_VOUCHER_CREATE, [0xfeed, 0, 0, 0])
        .marker(30, 0, 0x10);
    let machine = trace.machine();

    let first = machine.voucher(0xfeed, AbsTime(10)).expect("first voucher");
    assert!(machine.voucher(0xfeed, AbsTime(16)).is_none());
    let second = machine.voucher(0xfeed, AbsTime(25)).expect("second voucher");
    assert_ne!(first.id(), second.id());
    assert_eq!(machine.vouchers().live_count(), 1);
    assert_eq!(machine.vouchers().destroyed_count(), 1);
}

#[test]
fn test_open_fault_closes_after_last_event() {
    let mut trace = RawTrace::new()
        .cpu(0, false, "cpu0")
        .thread(0x10, 1, "launchd");
    trace
        .marker(0, 0, 0x10)
        .start(100, 0, 0x10, codes::MACH_VM_FAULT)
        .marker(500, 0, 0x10);
    let machine = trace.machine();

    let thread = machine.thread(0x10, AbsTime(100)).unwrap();
    assert_eq!(thread.faults().as_slice(), &[iv(100, 501)]);
    assert_eq!(thread.timespan(), iv(0, 501));
}

#[test]
fn test_thread_and_process_records_never_overlap() {
    let mut trace = RawTrace::new()
        .cpu(0, false, "cpu0")
        .thread(0x10, 5, "sh");
    trace
        .marker(0, 0, 0x10)
        .event(10, 0, 0x10, codes::TRACE_DATA_NEWTHREAD, [0x11, 6, 0, 0])
        .event(20, 0, 0x11, codes::TRACE_DATA_EXEC, [6, 0, 0, 0])
        .event(30, 0, 0x11, codes::TRACE_DATA_THREAD_TERMINATE, [0x11, 0, 0, 0])
        .event(40, 0, 0x10, codes::TRACE_DATA_NEWTHREAD, [0x11, 5, 0, 0])
        .marker(50, 0, 0x11);
    let machine = trace.machine();

    let records: Vec<AbsInterval> = machine.threads_for_tid(0x11).map(|t| t.timespan()).collect();
    assert_eq!(records.len(), 3);
    for pair in records.windows(2) {
        assert!(pair[0].max() <= pair[1].location());
    }
    let pid6: Vec<AbsInterval> = machine.processes_for_pid(6).map(|p| p.timespan()).collect();
    assert_eq!(pid6, vec![iv(10, 20), iv(20, 31)]);

    // Every thread of a terminated process terminated first.
    for process in machine.processes() {
        if process.is_trace_terminated() {
            for handle in process.threads() {
                let thread = machine.thread_for(*handle);
                assert!(thread.is_trace_terminated());
                assert!(thread.end() <= process.end());
            }
        }
    }
}

#[test]
fn test_unknown_tid_is_adopted() {
    let mut trace = RawTrace::new().cpu(0, false, "cpu0");
    trace.marker(0, 0, 0xdead).marker(10, 0, 0xdead);
    let machine = trace.machine();

    let thread = machine.thread(0xdead, AbsTime(5)).unwrap();
    assert_eq!(thread.created_by(), ThreadCreatedBy::UnknownTid);
    assert!(machine.process_of(thread.handle()).is_unknown());
}

#[test]
fn test_raw_file_round_trip() {
    let mut trace = RawTrace::new()
        .thread(0x10, 1, "launchd")
        .thread(0x20, 2, "logd");
    trace
        .switch(0, 0, 0x10, 0x10, codes::AST_PREEMPT)
        .switch(0, 1, 0x20, 0x20, codes::AST_PREEMPT)
        .marker(40, 1, 0x20);

    let file = TraceFile::parse(&trace.raw_file()).unwrap();
    let buffers = file.buffers();
    assert_eq!(buffers.width, PointerWidth::Bits64);
    assert_eq!(buffers.events.len(), 3);
    assert_eq!(buffers.threadmap, trace.threads);
    assert!(buffers.cpumap.is_empty());

    let machine = kdscope::machine::Machine::new(buffers, &Default::default());
    assert_eq!(machine.active_cpu_count(), 2);
    assert_eq!(machine.process(2, AbsTime(10)).unwrap().name(), "logd");
}

#[test]
fn test_bad_magic_is_rejected() {
    let mut bytes = RawTrace::new().raw_file();
    bytes[0] ^= 0xff;
    match TraceFile::parse(&bytes) {
        Err(KdError::BadMagic { expected, .. }) => {
            assert_eq!(expected, kdscope::kdebug::RAW_VERSION1)
        }
        other => panic!("expected bad magic, got {:?}", other),
    }
}

#[test]
fn test_32bit_trace_is_detected() {
    let records: Vec<u8> = (0..11u64)
        .flat_map(|i| Kd32Record::new(i * 10, 0, [0; 4], 0x10, utils::MARKER).to_bytes())
        .collect();
    let threadmap: Vec<u8> = ThreadMapEntry::new(0x10, 1, "init").to_bytes(PointerWidth::Bits32);

    let buffers = TraceBuffers::from_parts(&records, &threadmap, &[]).unwrap();
    assert_eq!(buffers.width, PointerWidth::Bits32);
    assert_eq!(buffers.events.len(), 11);
    assert_eq!(buffers.threadmap[0].name, "init");
}

#[test]
fn test_summary_serializes_to_json() {
    let mut trace = RawTrace::new()
        .cpu(0, false, "cpu0")
        .thread(0x10, 1, "launchd");
    trace
        .switch(0, 0, 0x10, 0x10, codes::AST_PREEMPT)
        .marker(100, 0, 0x10);
    let machine = trace.machine();

    let summary = machine.summary_for_window(machine.timespan(), None);
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["run_time"], 100);
    assert_eq!(json["processes"][0]["name"], "launchd");
    assert_eq!(json["cpus"][0]["name"], "cpu0");
}
