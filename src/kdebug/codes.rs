// kdebug debug-id values understood by the dispatcher
//
// A debug-id packs class(8) | subclass(8) | code(14) | qualifier(2).
// Constants below have their qualifier bits cleared; match on
// `DebugId::event_id()` and inspect `DebugId::func()` separately.

pub const fn kdbg_code(class: u32, subclass: u32, code: u32) -> u32 {
    ((class & 0xff) << 24) | ((subclass & 0xff) << 16) | ((code & 0x3fff) << 2)
}

/// Qualifier bits OR-ed into a debug-id
pub const DBG_FUNC_START: u32 = 1;
pub const DBG_FUNC_END: u32 = 2;

pub const DBG_MACH: u32 = 1;
pub const DBG_FSYSTEM: u32 = 3;
pub const DBG_BSD: u32 = 4;
pub const DBG_IMPORTANCE: u32 = 5;
pub const DBG_TRACE: u32 = 7;

pub const DBG_MACH_EXCP_INTR: u32 = 0x05;
pub const DBG_MACH_IPC: u32 = 0x20;
pub const DBG_MACH_VM: u32 = 0x30;
pub const DBG_MACH_SCHED: u32 = 0x40;

pub const DBG_TRACE_DATA: u32 = 0;
pub const DBG_TRACE_STRING: u32 = 1;
pub const DBG_TRACE_INFO: u32 = 2;

pub const DBG_BSD_PROC: u32 = 0x01;
pub const DBG_BSD_MEMSTAT: u32 = 0x05;

pub const DBG_DKRW: u32 = 0x02;

pub const IMP_TASK_APPTYPE: u32 = 0x20;

// Trace infrastructure
pub const TRACE_DATA_NEWTHREAD: u32 = kdbg_code(DBG_TRACE, DBG_TRACE_DATA, 1);
pub const TRACE_DATA_EXEC: u32 = kdbg_code(DBG_TRACE, DBG_TRACE_DATA, 2);
pub const TRACE_DATA_THREAD_TERMINATE: u32 = kdbg_code(DBG_TRACE, DBG_TRACE_DATA, 3);
pub const TRACE_STRING_NEWTHREAD: u32 = kdbg_code(DBG_TRACE, DBG_TRACE_STRING, 1);
pub const TRACE_STRING_EXEC: u32 = kdbg_code(DBG_TRACE, DBG_TRACE_STRING, 2);
pub const TRACE_LOST_EVENTS: u32 = kdbg_code(DBG_TRACE, DBG_TRACE_INFO, 1);

// Scheduler
pub const MACH_SCHED: u32 = kdbg_code(DBG_MACH, DBG_MACH_SCHED, 0x00);
pub const MACH_STACK_HANDOFF: u32 = kdbg_code(DBG_MACH, DBG_MACH_SCHED, 0x02);
pub const MACH_MAKE_RUNNABLE: u32 = kdbg_code(DBG_MACH, DBG_MACH_SCHED, 0x06);
pub const MACH_IDLE: u32 = kdbg_code(DBG_MACH, DBG_MACH_SCHED, 0x09);
pub const MACH_CPU_DEACTIVATE: u32 = kdbg_code(DBG_MACH, DBG_MACH_SCHED, 0x2a);

// Context-switch reason bits that leave the switched-out thread runnable
pub const AST_PREEMPT: u64 = 0x01;
pub const AST_QUANTUM: u64 = 0x02;
pub const AST_YIELD: u64 = 0x10;
pub const AST_PREEMPTION_MASK: u64 = AST_PREEMPT | AST_QUANTUM | AST_YIELD;

// Interrupts and faults
pub const MACH_INTR: u32 = kdbg_code(DBG_MACH, DBG_MACH_EXCP_INTR, 0);
pub const MACH_VM_FAULT: u32 = kdbg_code(DBG_MACH, DBG_MACH_VM, 2);

// IPC and vouchers
pub const MACH_THREAD_SET_VOUCHER: u32 = kdbg_code(DBG_MACH, DBG_MACH_IPC, 0x2);
pub const MACH_IPC_MSG_SEND: u32 = kdbg_code(DBG_MACH, DBG_MACH_IPC, 0x3);
pub const MACH_IPC_MSG_RECV: u32 = kdbg_code(DBG_MACH, DBG_MACH_IPC, 0x4);
pub const MACH_IPC_KMSG_FREE: u32 = kdbg_code(DBG_MACH, DBG_MACH_IPC, 0x6);
pub const MACH_IPC_VOUCHER_CREATE: u32 = kdbg_code(DBG_MACH, DBG_MACH_IPC, 0x7);
pub const MACH_IPC_VOUCHER_CREATE_ATTR_DATA: u32 = kdbg_code(DBG_MACH, DBG_MACH_IPC, 0x8);
pub const MACH_IPC_VOUCHER_DESTROY: u32 = kdbg_code(DBG_MACH, DBG_MACH_IPC, 0x9);

// BSD process lifecycle and memory pressure
pub const BSD_PROC_EXIT: u32 = kdbg_code(DBG_BSD, DBG_BSD_PROC, 1);
pub const BSD_MEMSTAT_SCAN: u32 = kdbg_code(DBG_BSD, DBG_BSD_MEMSTAT, 1);
pub const BSD_MEMSTAT_JETSAM: u32 = kdbg_code(DBG_BSD, DBG_BSD_MEMSTAT, 2);

// Disk I/O: the code field carries DKIO_* flags
pub const DKIO_DONE: u32 = 0x01;
pub const DKIO_READ: u32 = 0x02;

/// Human-readable name for the event ids the dispatcher knows.
pub fn event_name(event_id: u32) -> Option<&'static str> {
    let name = match event_id {
        TRACE_DATA_NEWTHREAD => "TRACE_DATA_NEWTHREAD",
        TRACE_DATA_EXEC => "TRACE_DATA_EXEC",
        TRACE_DATA_THREAD_TERMINATE => "TRACE_DATA_THREAD_TERMINATE",
        TRACE_STRING_NEWTHREAD => "TRACE_STRING_NEWTHREAD",
        TRACE_STRING_EXEC => "TRACE_STRING_EXEC",
        TRACE_LOST_EVENTS => "TRACE_LOST_EVENTS",
        MACH_SCHED => "MACH_SCHED",
        MACH_STACK_HANDOFF => "MACH_STACK_HANDOFF",
        MACH_MAKE_RUNNABLE => "MACH_MAKE_RUNNABLE",
        MACH_IDLE => "MACH_IDLE",
        MACH_CPU_DEACTIVATE => "MACH_CPU_DEACTIVATE",
        MACH_INTR => "MACH_INTR",
        MACH_VM_FAULT => "MACH_VM_FAULT",
        MACH_THREAD_SET_VOUCHER => "MACH_THREAD_SET_VOUCHER",
        MACH_IPC_MSG_SEND => "MACH_IPC_MSG_SEND",
        MACH_IPC_MSG_RECV => "MACH_IPC_MSG_RECV",
        MACH_IPC_KMSG_FREE => "MACH_IPC_KMSG_FREE",
        MACH_IPC_VOUCHER_CREATE => "MACH_IPC_VOUCHER_CREATE",
        MACH_IPC_VOUCHER_CREATE_ATTR_DATA => "MACH_IPC_VOUCHER_CREATE_ATTR_DATA",
        MACH_IPC_VOUCHER_DESTROY => "MACH_IPC_VOUCHER_DESTROY",
        BSD_PROC_EXIT => "BSD_PROC_EXIT",
        BSD_MEMSTAT_SCAN => "BSD_MEMSTAT_SCAN",
        BSD_MEMSTAT_JETSAM => "BSD_MEMSTAT_JETSAM",
        _ => return None,
    };
    Some(name)
}
