#![no_main]

use kdscope::kdebug::TraceBuffers;
use kdscope::kdebug::TraceFile;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Whole-file parse: header, thread map and records
    let _ = TraceFile::parse(data);

    // Bare buffers, with the input split into events and a thread map
    let split = data.first().map_or(0, |b| *b as usize).min(data.len());
    let (threadmap, events) = data.split_at(split);
    let _ = TraceBuffers::from_parts(events, threadmap, &[]);
});
