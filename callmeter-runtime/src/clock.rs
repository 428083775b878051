//! Hardware cycle counter (TSC on x86_64, CNTVCT on aarch64) calibrated
//! against wall-clock time, one frequency per logical CPU.
//!
//! `read()` returns raw ticks. `calibrate()` pins the calling thread to every
//! CPU it is allowed to run on, measures ticks per microsecond on each over a
//! ~5ms sleep, and restores the original affinity. The result is cached for
//! the process by `calibration()`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::affinity;
use crate::error::Error;

/// Wall-clock window for one CPU's measurement.
const CALIBRATION_WINDOW: Duration = Duration::from_millis(5);

/// Read the hardware cycle counter. Single inline instruction on both
/// x86_64 (`rdtsc`) and aarch64 (`mrs cntvct_el0`).
#[inline(always)]
pub fn read() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(target_arch = "aarch64")]
    {
        let val: u64;
        unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) val) };
        val
    }
    // Fallback: nanoseconds since first use. Calibration then measures
    // ~1000 ticks per microsecond and everything downstream is unchanged.
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        use std::sync::OnceLock;
        static FALLBACK_EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = FALLBACK_EPOCH.get_or_init(Instant::now);
        Instant::now().duration_since(*epoch).as_nanos() as u64
    }
}

/// Ticks per microsecond for each calibrated logical CPU.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyTable {
    per_cpu: Vec<Option<f64>>,
}

impl FrequencyTable {
    pub fn from_measurements(measurements: impl IntoIterator<Item = (usize, f64)>) -> Self {
        let mut per_cpu = Vec::new();
        for (cpu, ticks_per_us) in measurements {
            if per_cpu.len() <= cpu {
                per_cpu.resize(cpu + 1, None);
            }
            per_cpu[cpu] = Some(ticks_per_us);
        }
        Self { per_cpu }
    }

    pub fn ticks_per_us(&self, cpu: usize) -> Option<f64> {
        self.per_cpu.get(cpu).copied().flatten()
    }

    /// Convert a tick delta measured on `cpu` to microseconds.
    pub fn ticks_to_us(&self, delta_ticks: u64, cpu: usize) -> Option<f64> {
        self.ticks_per_us(cpu).map(|f| delta_ticks as f64 / f)
    }

    /// Calibrated CPUs with their frequency, ascending by CPU id.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.per_cpu
            .iter()
            .enumerate()
            .filter_map(|(cpu, f)| f.map(|f| (cpu, f)))
    }

    pub fn cpus(&self) -> Vec<usize> {
        self.iter().map(|(cpu, _)| cpu).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// Measure ticks per microsecond on whatever CPU the thread is on now.
fn measure(cpu: usize) -> Result<f64, Error> {
    let wall_start = Instant::now();
    let tsc_start = read();
    std::thread::sleep(CALIBRATION_WINDOW);
    let tsc_end = read();
    let wall_us = wall_start.elapsed().as_secs_f64() * 1_000_000.0;

    let ticks = tsc_end.wrapping_sub(tsc_start);
    if ticks == 0 || wall_us <= 0.0 {
        return Err(Error::Calibration {
            cpu,
            reason: format!("counter did not advance ({ticks} ticks over {wall_us:.1}us)"),
        });
    }
    Ok(ticks as f64 / wall_us)
}

/// Calibrate every CPU in the calling thread's allowed set.
///
/// Leaves the thread's affinity as it found it, on success and on failure.
pub fn calibrate() -> Result<FrequencyTable, Error> {
    let original = affinity::current_mask()?;
    let result = original
        .cpus()
        .into_iter()
        .map(|cpu| {
            affinity::pin_to(cpu)?;
            // Give the scheduler a chance to migrate us onto the target.
            std::thread::yield_now();
            measure(cpu).map(|f| (cpu, f))
        })
        .collect::<Result<Vec<_>, Error>>();
    let restored = affinity::apply_mask(&original);

    let table = FrequencyTable::from_measurements(result?);
    restored?;
    for (cpu, f) in table.iter() {
        tracing::debug!(cpu, ticks_per_us = f, "calibrated");
    }
    Ok(table)
}

static CALIBRATION: Mutex<Option<Arc<FrequencyTable>>> = Mutex::new(None);

/// Process-wide calibration, computed on first successful call.
///
/// Failures are not cached; the next caller retries.
pub fn calibration() -> Result<Arc<FrequencyTable>, Error> {
    let mut cached = CALIBRATION.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(table) = cached.as_ref() {
        return Ok(Arc::clone(table));
    }
    let table = Arc::new(calibrate()?);
    *cached = Some(Arc::clone(&table));
    Ok(table)
}

/// A cycle counter bound to one calibrated CPU.
#[derive(Debug, Clone)]
pub struct CycleClock {
    cpu: usize,
    ticks_per_us: f64,
}

impl CycleClock {
    pub fn new(table: &FrequencyTable, cpu: usize) -> Result<Self, Error> {
        let ticks_per_us = table.ticks_per_us(cpu).ok_or(Error::UncalibratedCpu(cpu))?;
        Ok(Self { cpu, ticks_per_us })
    }

    #[inline(always)]
    pub fn now(&self) -> u64 {
        read()
    }

    #[inline(always)]
    pub fn ticks_to_us(&self, delta_ticks: u64) -> f64 {
        delta_ticks as f64 / self.ticks_per_us
    }

    /// Zero if `end` reads earlier than `start`.
    #[inline]
    pub fn elapsed_us(&self, start: u64, end: u64) -> f64 {
        self.ticks_to_us(end.saturating_sub(start))
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn ticks_per_us(&self) -> f64 {
        self.ticks_per_us
    }
}
