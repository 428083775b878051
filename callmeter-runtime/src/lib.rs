//! Call-level profiling engine.
//!
//! A host reports function entries and exits; the engine keeps a shadow call
//! stack for the functions it was configured to track and aggregates call
//! counts, wall time (from a calibrated cycle counter on a pinned CPU) and,
//! optionally, CPU time and memory deltas per function.

#![allow(unsafe_code)]

pub mod affinity;
mod alloc;
pub mod clock;
mod controller;
mod cpu_clock;
mod error;
mod frames;
mod selector;
pub mod session;
mod stats;

pub use alloc::{AllocatorMemory, CountingAllocator, MemorySource};
pub use controller::{
    Config, FunctionStats, ProfileReport, ProfilerController, SessionState, DEFAULT_FRAME_LIMIT,
    ROOT_FUNCTION,
};
pub use cpu_clock::{cpu_now, CpuTimes};
pub use error::Error;
pub use frames::{CallFrame, CallStack, FrameId, FramePool, MemorySample};
pub use selector::{
    Algorithm, FunctionKey, FunctionRef, FunctionSelector, HashSelector, Insert, Slot,
    TrieSelector, SEPARATOR, UNTRACKED,
};
pub use session::{disable, enable, enter, is_enabled, Guard};
pub use stats::{Sample, StatsRow, StatsTable};

/// Busy work that the optimizer cannot remove.
#[cfg(test)]
pub(crate) fn burn_cpu(iterations: u64) {
    let mut buf = [0x42u8; 4096];
    for i in 0..iterations {
        for b in &mut buf {
            *b = b.wrapping_add(i as u8).wrapping_mul(31);
        }
    }
    std::hint::black_box(&buf);
}
