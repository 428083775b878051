//! Heap usage for memory measurement.
//!
//! `CountingAllocator` wraps the host's global allocator and keeps live and
//! peak byte counts in process-wide atomics. Sessions read them through
//! `MemorySource`, so tests can substitute their own numbers.

use std::alloc::{GlobalAlloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

/// Where a session reads memory usage from when memory measurement is on.
///
/// Values are bytes. `peak_usage` must never decrease over the life of the
/// source.
pub trait MemorySource {
    fn usage(&self) -> i64;
    fn peak_usage(&self) -> i64;
}

static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
static PEAK_BYTES: AtomicU64 = AtomicU64::new(0);

/// A global allocator wrapper that keeps a process-wide count of live heap
/// bytes and their high-water mark.
///
/// Install it in the host binary:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: CountingAllocator<std::alloc::System> = CountingAllocator::new(std::alloc::System);
/// ```
pub struct CountingAllocator<A: GlobalAlloc> {
    inner: A,
}

impl<A: GlobalAlloc> CountingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for CountingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() {
            track_alloc(layout.size() as u64);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.dealloc(ptr, layout) };
        track_dealloc(layout.size() as u64);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_size = layout.size() as u64;
        let result = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if !result.is_null() {
            track_dealloc(old_size);
            track_alloc(new_size as u64);
        }
        result
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !ptr.is_null() {
            track_alloc(layout.size() as u64);
        }
        ptr
    }
}

fn track_alloc(bytes: u64) {
    let live = LIVE_BYTES.fetch_add(bytes, Ordering::Relaxed) + bytes;
    PEAK_BYTES.fetch_max(live, Ordering::Relaxed);
}

fn track_dealloc(bytes: u64) {
    // Memory freed that was allocated before the counter existed would
    // underflow; clamp at zero instead.
    let _ = LIVE_BYTES.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
        Some(live.saturating_sub(bytes))
    });
}

/// Reads the counters maintained by `CountingAllocator`.
///
/// Reads zero forever if the host never installed the allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorMemory;

impl MemorySource for AllocatorMemory {
    fn usage(&self) -> i64 {
        LIVE_BYTES.load(Ordering::Relaxed) as i64
    }

    fn peak_usage(&self) -> i64 {
        PEAK_BYTES.load(Ordering::Relaxed) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Other tests in this binary allocate concurrently, so these assertions
    // only rely on monotonic effects of our own bookkeeping calls.

    #[test]
    fn track_alloc_raises_peak_to_at_least_live() {
        track_alloc(1 << 20);
        let mem = AllocatorMemory;
        assert!(mem.peak_usage() >= mem.usage());
        assert!(mem.peak_usage() >= 1 << 20);
        track_dealloc(1 << 20);
    }

    #[test]
    fn counting_allocator_forwards_to_inner() {
        let alloc = CountingAllocator::new(std::alloc::System);
        let layout = Layout::from_size_align(4096, 8).unwrap();
        let peak_before = AllocatorMemory.peak_usage();
        unsafe {
            let ptr = alloc.alloc_zeroed(layout);
            assert!(!ptr.is_null());
            assert_eq!(*ptr, 0);
            let ptr = alloc.realloc(ptr, layout, 8192);
            assert!(!ptr.is_null());
            alloc.dealloc(ptr, Layout::from_size_align(8192, 8).unwrap());
        }
        assert!(AllocatorMemory.peak_usage() >= peak_before);
    }
}
