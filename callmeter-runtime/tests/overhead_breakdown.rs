//! Overhead breakdown: isolate the cost of each piece of the enter/exit path.
//!
//! Run with: cargo test -p callmeter-runtime --release --test overhead_breakdown -- --ignored --nocapture

use std::hint::black_box;
use std::time::Instant;

use callmeter_runtime::{
    clock, cpu_now, AllocatorMemory, Algorithm, CallStack, FunctionKey, FunctionRef, FunctionSelector,
    FramePool, MemorySource,
};

const N: u64 = 2_000_000;

fn ns_per_call(elapsed: std::time::Duration) -> f64 {
    elapsed.as_nanos() as f64 / N as f64
}

fn measure_baseline() -> f64 {
    let start = Instant::now();
    for _ in 0..N {
        black_box(42u64);
    }
    ns_per_call(start.elapsed())
}

fn measure_counter_read() -> f64 {
    let start = Instant::now();
    for _ in 0..N {
        black_box(clock::read());
    }
    ns_per_call(start.elapsed())
}

fn selector(algorithm: Algorithm) -> FunctionSelector {
    let keys: Vec<FunctionKey> = (0..64)
        .map(|i| FunctionKey::method(&format!("Owner{i}"), &format!("method_{i}")).unwrap())
        .collect();
    FunctionSelector::build(algorithm, &keys).unwrap().0
}

fn measure_resolve(algorithm: Algorithm, key: FunctionRef<'_>) -> f64 {
    let mut selector = selector(algorithm);
    let start = Instant::now();
    for _ in 0..N {
        black_box(selector.resolve(black_box(key)));
    }
    ns_per_call(start.elapsed())
}

fn measure_frame_push_pop() -> f64 {
    let mut pool = FramePool::with_limit(16);
    let mut stack = CallStack::new();
    let start = Instant::now();
    for i in 0..N {
        let id = pool.acquire().unwrap();
        pool.get_mut(id).start_ticks = i;
        stack.push(&mut pool, id);
        let id = stack.pop(&pool).unwrap();
        black_box(pool.get(id).start_ticks);
        pool.release(id);
    }
    ns_per_call(start.elapsed())
}

fn measure_cpu_sample() -> f64 {
    let start = Instant::now();
    for _ in 0..N / 10 {
        black_box(cpu_now());
    }
    start.elapsed().as_nanos() as f64 / (N / 10) as f64
}

fn measure_memory_sample() -> f64 {
    let memory = AllocatorMemory;
    let start = Instant::now();
    for _ in 0..N {
        black_box(memory.usage());
        black_box(memory.peak_usage());
    }
    ns_per_call(start.elapsed())
}

#[test]
#[ignore]
fn overhead_breakdown() {
    let hit = FunctionRef::method("Owner31", "method_31");
    let miss = FunctionRef::method("Owner31", "method_32");

    let rows = [
        ("baseline", measure_baseline()),
        ("counter read", measure_counter_read()),
        ("hash resolve (hit)", measure_resolve(Algorithm::Hash, hit)),
        ("hash resolve (miss)", measure_resolve(Algorithm::Hash, miss)),
        ("trie resolve (hit)", measure_resolve(Algorithm::Trie, hit)),
        ("trie resolve (miss)", measure_resolve(Algorithm::Trie, miss)),
        ("frame push+pop", measure_frame_push_pop()),
        ("cpu sample", measure_cpu_sample()),
        ("memory sample", measure_memory_sample()),
    ];

    eprintln!();
    eprintln!("{:<24} {:>10}", "component", "ns/call");
    eprintln!("{}", "-".repeat(35));
    for (name, ns) in rows {
        eprintln!("{name:<24} {ns:>10.2}");
    }
    eprintln!();
}
