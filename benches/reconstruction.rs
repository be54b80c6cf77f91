//! Reconstruction throughput benchmark
//!
//! Measures decoding raw buffers and replaying them into a finished
//! machine, for synthetic scheduler workloads of increasing size.
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench reconstruction
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kdscope::config::MachineConfig;
use kdscope::kdebug::TraceBuffers;
use kdscope::machine::Machine;

#[path = "../tests/utils/mod.rs"]
mod utils;

use utils::{workload, Op, RawTrace};

/// Deterministic op stream: mostly context switches, with interrupts,
/// idle periods and faults mixed in.
fn synthetic(cpus: u32, len: usize) -> RawTrace {
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let ops: Vec<(u64, Op)> = (0..len)
        .map(|_| {
            let r = next();
            let cpu = (r >> 8) as u32 % cpus;
            let op = match r % 8 {
                0 => Op::Intr { cpu },
                1 => Op::Idle { cpu },
                2 => Op::Fault { cpu },
                3 => Op::Wake {
                    thread: (r >> 16) as usize,
                },
                _ => Op::Switch {
                    cpu,
                    to: (r >> 16) as usize,
                    block: r & 0x100 != 0,
                },
            };
            (1 + (r >> 32) % 100, op)
        })
        .collect();
    workload(cpus, &ops)
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for len in [1_000usize, 10_000, 100_000] {
        let trace = synthetic(4, len);
        let events = trace.event_bytes();
        let threads = trace.threadmap_bytes();
        let cpus = trace.cpumap_bytes();
        group.throughput(Throughput::Elements(trace.records.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                TraceBuffers::from_parts(black_box(&events), black_box(&threads), black_box(&cpus))
            })
        });
    }
    group.finish();
}

fn bench_reconstruct(c: &mut Criterion) {
    let config = MachineConfig::default();
    let mut group = c.benchmark_group("reconstruct");
    for len in [1_000usize, 10_000, 100_000] {
        let buffers = synthetic(4, len).buffers();
        group.throughput(Throughput::Elements(buffers.events.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| Machine::new(black_box(&buffers), &config))
        });
    }
    group.finish();
}

fn bench_forward(c: &mut Criterion) {
    let config = MachineConfig::default();
    let trace = synthetic(4, 20_000);
    let events = trace.events();
    let half = events.len() / 2;

    c.bench_function("forward_half", |b| {
        b.iter_batched(
            || {
                let parent = Machine::from_events(
                    kdscope::kdebug::PointerWidth::Bits64,
                    events[..half].to_vec(),
                    &trace.threads,
                    &trace.cpus,
                    &config,
                );
                (parent, events[half..].to_vec())
            },
            |(parent, rest)| Machine::forward(parent, rest, &config),
            criterion::BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_decode, bench_reconstruct, bench_forward);
criterion_main!(benches);
