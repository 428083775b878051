//! The profiling session state machine.
//!
//! A `ProfilerController` owns one session at a time:
//! `Disabled -> Enabling -> Enabled -> Disabling -> Disabled`.
//!
//! On every call boundary the host asks `on_call_enter(key)`. Untracked calls
//! cost one selector lookup and nothing else; the host must then skip the
//! matching `on_call_exit`. Tracked calls take a frame from the pool, stamp it
//! with the cycle counter (plus CPU and memory counters if enabled) and push
//! it on the shadow stack. `on_call_exit` pops it, turns the differences into
//! a `Sample` and adds that to the function's row.
//!
//! `disable()` finalizes any frames still open using the current time as
//! their exit, restores CPU affinity, and returns the report.
//!
//! Hooks never panic into the host. An exit without an enter (or any other
//! broken pairing) is logged, shuts the session down as if `disable()` had
//! been called, and parks the report for the next `disable()`.

use crate::affinity::{self, PinnedCpu};
use crate::alloc::{AllocatorMemory, MemorySource};
use crate::clock::{self, CycleClock, FrequencyTable};
use crate::cpu_clock;
use crate::error::Error;
use crate::frames::{CallFrame, CallStack, FramePool, MemorySample};
use crate::selector::{Algorithm, FunctionKey, FunctionRef, FunctionSelector, Slot, UNTRACKED};
use crate::stats::{Sample, StatsTable};

/// Name of the synthetic function standing for the whole session.
pub const ROOT_FUNCTION: &str = "main()";

pub const DEFAULT_FRAME_LIMIT: usize = 1 << 16;

/// What a session tracks and measures.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Tracked functions in declaration order; slot `i + 1` for entry `i`.
    pub tracked_functions: Vec<FunctionKey>,
    pub algorithm: Algorithm,
    pub measure_cpu: bool,
    pub measure_memory: bool,
    /// Count the session itself as one call of `ROOT_FUNCTION`.
    pub track_root: bool,
    /// CPU to pin to. `None` picks one at random from the calibrated CPUs
    /// this thread may run on.
    pub pin_cpu: Option<usize>,
    /// Most tracked calls open at once; deeper ones go unprofiled. Must be
    /// at least 1.
    pub frame_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracked_functions: Vec::new(),
            algorithm: Algorithm::default(),
            measure_cpu: false,
            measure_memory: false,
            track_root: false,
            pin_cpu: None,
            frame_limit: DEFAULT_FRAME_LIMIT,
        }
    }
}

impl Config {
    /// Track the given `name` / `Owner:name` keys with default settings.
    pub fn tracking<I, S>(functions: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tracked_functions = functions
            .into_iter()
            .map(|s| FunctionKey::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            tracked_functions,
            ..Self::default()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Disabled => "disabled",
            SessionState::Enabling => "enabling",
            SessionState::Enabled => "enabled",
            SessionState::Disabling => "disabling",
        }
    }
}

/// Aggregates for one tracked function at the end of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionStats {
    pub slot: Slot,
    pub key: FunctionKey,
    pub call_count: u64,
    pub wall_time_us: f64,
    pub cpu_time_us: Option<u64>,
    pub memory_delta: Option<i64>,
    pub peak_memory_delta: Option<i64>,
}

/// Everything a session measured, in slot order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileReport {
    pub functions: Vec<FunctionStats>,
    pub algorithm: Algorithm,
    /// CPU the session was pinned to.
    pub cpu: usize,
    pub ticks_per_us: f64,
    pub measured_cpu: bool,
    pub measured_memory: bool,
    /// Tracked calls that could not be profiled because no frame was free.
    pub dropped_frames: u64,
    /// Frames still open when the session ended, finalized by the unwind.
    pub unwound_frames: usize,
}

impl ProfileReport {
    /// Look a function up by its qualified display name.
    pub fn get(&self, qualified: &str) -> Option<&FunctionStats> {
        self.functions
            .iter()
            .find(|f| f.key.to_ref().to_string() == qualified)
    }

    pub fn total_calls(&self) -> u64 {
        self.functions.iter().map(|f| f.call_count).sum()
    }
}

/// State that exists only while a session is enabled.
struct Session {
    selector: FunctionSelector,
    /// `keys[slot - 1]`, the root last if tracked.
    keys: Vec<FunctionKey>,
    stats: StatsTable,
    stack: CallStack,
    clock: CycleClock,
    pin: Option<PinnedCpu>,
    measure_cpu: bool,
    measure_memory: bool,
    dropped_frames: u64,
}

/// One profiler per execution context (thread, request, task).
pub struct ProfilerController<M: MemorySource = AllocatorMemory> {
    state: SessionState,
    pool: FramePool,
    session: Option<Session>,
    memory: M,
    /// Report of a session that shut itself down on an invariant violation.
    faulted: Option<ProfileReport>,
    generation: u64,
}

impl Default for ProfilerController<AllocatorMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfilerController<AllocatorMemory> {
    pub fn new() -> Self {
        Self::with_memory(AllocatorMemory)
    }
}

impl<M: MemorySource> ProfilerController<M> {
    pub fn with_memory(memory: M) -> Self {
        Self {
            state: SessionState::Disabled,
            pool: FramePool::with_limit(DEFAULT_FRAME_LIMIT),
            session: None,
            memory,
            faulted: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == SessionState::Enabled
    }

    /// Counts enables; lets a caller tell whether the session it entered in
    /// is still the current one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Tracked calls currently open.
    pub fn depth(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.stack.depth())
    }

    /// Totals of calls completed so far, without ending the session. Open
    /// frames are not included.
    pub fn snapshot(&self) -> Option<ProfileReport> {
        self.session.as_ref().map(|s| build_report(s, 0))
    }

    /// Start a session. A second `enable` while enabled changes nothing.
    pub fn enable(&mut self, config: &Config) -> Result<(), Error> {
        match self.state {
            SessionState::Enabled => {
                tracing::debug!("profiler already enabled; keeping current session");
                return Ok(());
            }
            SessionState::Disabled => {}
            other => return Err(Error::InvalidState(other.name())),
        }
        if self.faulted.take().is_some() {
            tracing::warn!("discarding report of a session that ended on an invariant violation");
        }

        self.state = SessionState::Enabling;
        let session = match start_session(config) {
            Ok(s) => s,
            Err(e) => {
                self.state = SessionState::Disabled;
                return Err(e);
            }
        };
        tracing::debug!(
            functions = session.keys.len(),
            algorithm = %config.algorithm,
            cpu = session.clock.cpu(),
            ticks_per_us = session.clock.ticks_per_us(),
            "profiler enabled"
        );

        self.pool.set_limit(config.frame_limit);
        self.session = Some(session);
        self.generation += 1;
        self.state = SessionState::Enabled;

        if config.track_root {
            let root = self.session.as_ref().map_or(0, |s| s.keys.len() as Slot);
            self.push_frame(root);
        }
        Ok(())
    }

    /// Called by the host before a function body runs. Returns whether the
    /// call is tracked; only tracked calls may be followed by `on_call_exit`.
    #[inline]
    pub fn on_call_enter(&mut self, key: FunctionRef<'_>) -> bool {
        if self.state != SessionState::Enabled {
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let slot = session.selector.resolve(key);
        if slot == UNTRACKED {
            return false;
        }
        self.push_frame(slot)
    }

    fn push_frame(&mut self, slot: Slot) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let id = match self.pool.acquire() {
            Ok(id) => id,
            Err(e) => {
                if session.dropped_frames == 0 {
                    tracing::warn!(error = %e, "calls beyond this depth are not profiled");
                }
                session.dropped_frames += 1;
                return false;
            }
        };

        let frame = self.pool.get_mut(id);
        frame.slot = slot;
        frame.start_cpu = session.measure_cpu.then(cpu_clock::cpu_now);
        frame.start_mem = session.measure_memory.then(|| MemorySample {
            usage: self.memory.usage(),
            peak: self.memory.peak_usage(),
        });
        // Last, so the bookkeeping above is not charged to the call.
        frame.start_ticks = session.clock.now();
        session.stack.push(&mut self.pool, id);
        true
    }

    /// Called by the host after a tracked call returns.
    ///
    /// Errors are for diagnostics only; the host should carry on regardless.
    #[inline]
    pub fn on_call_exit(&mut self) -> Result<(), Error> {
        if self.state != SessionState::Enabled {
            return Err(Error::NotEnabled);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(Error::NotEnabled);
        };
        let end_ticks = session.clock.now();
        let Some(id) = session.stack.pop(&self.pool) else {
            return Err(self.fault(Error::EmptyStack));
        };
        let recorded = finish(session, &self.memory, self.pool.get(id), end_ticks);
        self.pool.release(id);
        recorded.map_err(|e| self.fault(e))
    }

    /// End the session and return what it measured.
    ///
    /// Open frames are finalized as if they returned now. Fails with
    /// `NotEnabled` if there is no session, unless the previous session shut
    /// itself down on a fault, in which case its report is returned once.
    pub fn disable(&mut self) -> Result<ProfileReport, Error> {
        match self.state {
            SessionState::Enabled => {}
            SessionState::Disabled => return self.faulted.take().ok_or(Error::NotEnabled),
            other => return Err(Error::InvalidState(other.name())),
        }
        let Some(session) = self.session.take() else {
            self.state = SessionState::Disabled;
            return Err(Error::NotEnabled);
        };
        Ok(self.shutdown(session))
    }

    fn shutdown(&mut self, mut session: Session) -> ProfileReport {
        self.state = SessionState::Disabling;

        let now = session.clock.now();
        let Session {
            stats,
            stack,
            clock,
            ..
        } = &mut session;
        let memory = &self.memory;
        let unwound = stack.unwind_to_empty(&mut self.pool, |frame| {
            if let Err(e) = record(stats, clock, memory, frame, now) {
                tracing::error!(error = %e, "dropping unwound frame");
            }
        });

        if let Some(pin) = session.pin.take() {
            if let Err(e) = pin.restore() {
                tracing::error!(error = %e, "CPU affinity left pinned");
            }
        }

        let report = build_report(&session, unwound);
        self.state = SessionState::Disabled;
        tracing::debug!(
            calls = report.total_calls(),
            unwound,
            dropped = report.dropped_frames,
            "profiler disabled"
        );
        report
    }

    /// Log an invariant violation and shut the session down, keeping its
    /// report for the next `disable()`.
    #[cold]
    fn fault(&mut self, error: Error) -> Error {
        tracing::error!(error = %error, "enter/exit pairing broken; stopping profiler");
        if let Some(session) = self.session.take() {
            let report = self.shutdown(session);
            self.faulted = Some(report);
        }
        self.state = SessionState::Disabled;
        error
    }
}

fn start_session(config: &Config) -> Result<Session, Error> {
    if config.frame_limit == 0 {
        return Err(Error::InvalidConfig("frame limit must be at least 1"));
    }
    let (selector, mut keys) = FunctionSelector::build(config.algorithm, &config.tracked_functions)?;
    if config.track_root {
        keys.push(FunctionKey::function(ROOT_FUNCTION)?);
    }
    let stats = StatsTable::new(keys.len());

    let table = clock::calibration()?;
    let cpu = match config.pin_cpu {
        Some(cpu) => cpu,
        None => choose_cpu(&table)?,
    };
    let clock = CycleClock::new(&table, cpu)?;
    let pin = PinnedCpu::pin(cpu)?;

    Ok(Session {
        selector,
        keys,
        stats,
        stack: CallStack::new(),
        clock,
        pin: Some(pin),
        measure_cpu: config.measure_cpu,
        measure_memory: config.measure_memory,
        dropped_frames: 0,
    })
}

/// A random calibrated CPU that the current thread is allowed to use.
fn choose_cpu(table: &FrequencyTable) -> Result<usize, Error> {
    use rand::seq::SliceRandom;

    let allowed = affinity::allowed_cpus()?;
    let candidates: Vec<usize> = allowed
        .iter()
        .copied()
        .filter(|&cpu| table.ticks_per_us(cpu).is_some())
        .collect();
    candidates
        .choose(&mut rand::thread_rng())
        .copied()
        .ok_or(Error::UncalibratedCpu(allowed.first().copied().unwrap_or(0)))
}

#[inline]
fn finish<M: MemorySource>(session: &mut Session, memory: &M, frame: &CallFrame, end_ticks: u64) -> Result<(), Error> {
    record(&mut session.stats, &session.clock, memory, frame, end_ticks)
}

#[inline]
fn record<M: MemorySource>(
    stats: &mut StatsTable,
    clock: &CycleClock,
    memory: &M,
    frame: &CallFrame,
    end_ticks: u64,
) -> Result<(), Error> {
    let sample = Sample {
        wall_us: clock.elapsed_us(frame.start_ticks, end_ticks),
        cpu_us: frame
            .start_cpu
            .map(|start| cpu_clock::cpu_now().since(&start)),
        mem_delta: frame.start_mem.map(|start| memory.usage() - start.usage),
        peak_mem_delta: frame
            .start_mem
            .map(|start| memory.peak_usage() - start.peak),
    };
    stats.record(frame.slot, &sample)
}

fn build_report(session: &Session, unwound: usize) -> ProfileReport {
    let functions = session
        .stats
        .snapshot()
        .into_iter()
        .zip(&session.keys)
        .map(|((slot, row), key)| FunctionStats {
            slot,
            key: key.clone(),
            call_count: row.call_count,
            wall_time_us: row.wall_time_us,
            cpu_time_us: session.measure_cpu.then_some(row.cpu_time_us),
            memory_delta: session.measure_memory.then_some(row.mem_delta),
            peak_memory_delta: session.measure_memory.then_some(row.peak_mem_delta),
        })
        .collect();
    ProfileReport {
        functions,
        algorithm: session.selector.algorithm(),
        cpu: session.clock.cpu(),
        ticks_per_us: session.clock.ticks_per_us(),
        measured_cpu: session.measure_cpu,
        measured_memory: session.measure_memory,
        dropped_frames: session.dropped_frames,
        unwound_frames: unwound,
    }
}
