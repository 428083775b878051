//! Call frames, the pool they come from, and the shadow call stack they form.
//!
//! Frames live in one arena and are addressed by `FrameId`. The stack is a
//! singly linked list threaded through `CallFrame::caller`; released frames
//! go on a free list of ids and are reused without being cleared. The arena
//! only grows, so once the deepest call chain of a session has been seen,
//! enter/exit never allocate.

use crate::cpu_clock::CpuTimes;
use crate::error::Error;
use crate::selector::Slot;

/// Index of a frame in its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(u32);

/// Memory counters sampled at call entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub usage: i64,
    pub peak: i64,
}

/// One active invocation of a tracked function.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallFrame {
    pub slot: Slot,
    pub start_ticks: u64,
    /// Present only when the session measures CPU time.
    pub start_cpu: Option<CpuTimes>,
    /// Present only when the session measures memory.
    pub start_mem: Option<MemorySample>,
    caller: Option<FrameId>,
}

/// Frames handed out on enter and returned on exit.
#[derive(Debug)]
pub struct FramePool {
    frames: Vec<CallFrame>,
    free: Vec<FrameId>,
    limit: usize,
}

impl FramePool {
    /// A pool that will never hand out more than `limit` frames at once.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            frames: Vec::new(),
            free: Vec::new(),
            limit: limit.min(u32::MAX as usize),
        }
    }

    /// Take a frame. Its contents are whatever the last user left; the caller
    /// must overwrite every field it reads later.
    #[inline]
    pub fn acquire(&mut self) -> Result<FrameId, Error> {
        if self.in_use() >= self.limit {
            return Err(Error::PoolExhausted { limit: self.limit });
        }
        if let Some(id) = self.free.pop() {
            return Ok(id);
        }
        self.grow()
    }

    #[cold]
    fn grow(&mut self) -> Result<FrameId, Error> {
        let limit = self.limit;
        // The free list must be able to take every frame back without
        // allocating, so it grows in step with the arena.
        self.frames
            .try_reserve(1)
            .and_then(|()| self.free.try_reserve(1))
            .map_err(|_| Error::PoolExhausted { limit })?;
        let id = FrameId(self.frames.len() as u32);
        self.frames.push(CallFrame::default());
        Ok(id)
    }

    /// Return a frame for reuse. Its contents are left in place.
    #[inline]
    pub fn release(&mut self, id: FrameId) {
        self.free.push(id);
    }

    #[inline]
    pub fn get(&self, id: FrameId) -> &CallFrame {
        &self.frames[id.0 as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, id: FrameId) -> &mut CallFrame {
        &mut self.frames[id.0 as usize]
    }

    /// Frames ever allocated by this pool.
    pub fn allocated(&self) -> usize {
        self.frames.len()
    }

    /// Frames currently handed out.
    pub fn in_use(&self) -> usize {
        self.frames.len() - self.free.len()
    }

    /// Change how many frames may be in use at once. Frames already
    /// allocated past the new limit stay in the arena but are not handed out.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.min(u32::MAX as usize);
    }
}

/// The shadow call stack: tracked calls that have entered and not exited.
#[derive(Debug, Default)]
pub struct CallStack {
    top: Option<FrameId>,
    depth: usize,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, pool: &mut FramePool, id: FrameId) {
        pool.get_mut(id).caller = self.top;
        self.top = Some(id);
        self.depth += 1;
    }

    /// Detach the top frame. `None` on an empty stack, which means an exit
    /// arrived without its enter.
    #[inline]
    pub fn pop(&mut self, pool: &FramePool) -> Option<FrameId> {
        let id = self.top?;
        self.top = pool.get(id).caller;
        self.depth -= 1;
        Some(id)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_none()
    }

    /// Pop every frame, innermost first, hand each to `finalize`, and return
    /// it to the pool. Returns the number of frames unwound.
    pub fn unwind_to_empty(&mut self, pool: &mut FramePool, mut finalize: impl FnMut(&CallFrame)) -> usize {
        let mut unwound = 0;
        while let Some(id) = self.pop(pool) {
            finalize(pool.get(id));
            pool.release(id);
            unwound += 1;
        }
        unwound
    }
}
