//! User and system CPU time via `getrusage`.
//!
//! Linux reports the calling thread only (`RUSAGE_THREAD`), which matches a
//! session's scope. Other Unix targets fall back to the whole process.

use std::mem;

#[cfg(target_os = "linux")]
const WHO: libc::c_int = libc::RUSAGE_THREAD;

#[cfg(not(target_os = "linux"))]
const WHO: libc::c_int = libc::RUSAGE_SELF;

/// CPU time consumed so far, split by mode, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user_us: u64,
    pub sys_us: u64,
}

impl CpuTimes {
    pub fn total_us(&self) -> u64 {
        self.user_us + self.sys_us
    }

    /// CPU microseconds spent between `earlier` and `self`.
    pub fn since(&self, earlier: &CpuTimes) -> u64 {
        self.user_us.saturating_sub(earlier.user_us) + self.sys_us.saturating_sub(earlier.sys_us)
    }
}

fn timeval_us(tv: &libc::timeval) -> u64 {
    tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64
}

/// Sample the CPU clock. A failed `getrusage` reads as zero usage.
pub fn cpu_now() -> CpuTimes {
    // SAFETY: rusage is plain data; all-zero is valid.
    let mut usage: libc::rusage = unsafe { mem::zeroed() };
    // SAFETY: `usage` is a valid out-pointer.
    let ret = unsafe { libc::getrusage(WHO, &mut usage) };
    debug_assert!(ret == 0, "getrusage failed");
    if ret != 0 {
        return CpuTimes::default();
    }
    CpuTimes {
        user_us: timeval_us(&usage.ru_utime),
        sys_us: timeval_us(&usage.ru_stime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_time_advances_during_compute() {
        let before = cpu_now();
        crate::burn_cpu(50_000);
        let after = cpu_now();
        assert!(
            after.since(&before) > 0,
            "CPU clock should advance during compute: before={before:?}, after={after:?}"
        );
    }

    #[test]
    fn cpu_time_does_not_advance_during_sleep() {
        let before = cpu_now();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let after = cpu_now();
        let delta_ms = after.since(&before) as f64 / 1_000.0;
        assert!(
            delta_ms < 5.0,
            "CPU clock should not advance during sleep, but delta was {delta_ms:.2}ms"
        );
    }

    #[test]
    fn since_saturates_instead_of_wrapping() {
        let later = CpuTimes { user_us: 10, sys_us: 5 };
        let earlier = CpuTimes { user_us: 20, sys_us: 1 };
        assert_eq!(later.since(&earlier), 4);
        assert_eq!(later.total_us(), 15);
    }
}
