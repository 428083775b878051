//! CPU affinity for the calling thread.
//!
//! The cycle counter is only comparable between two readings taken on the
//! same core, so calibration pins to each allowed CPU in turn and a session
//! pins to one CPU for its whole lifetime. `PinnedCpu` owns the mask that was
//! in effect before pinning and puts it back exactly once: explicitly through
//! `restore()`, or on drop.
//!
//! Linux uses `sched_{get,set}affinity` on the calling thread. Other targets
//! have no per-thread pinning; there the "allowed set" is `{0}` and pinning is
//! a no-op, which degrades to a single calibrated frequency.

use crate::error::Error;

#[cfg(target_os = "linux")]
mod imp {
    use std::io;
    use std::mem;

    pub(crate) struct Mask(libc::cpu_set_t);

    impl Mask {
        pub(crate) fn cpus(&self) -> Vec<usize> {
            (0..libc::CPU_SETSIZE as usize)
                .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &self.0) })
                .collect()
        }
    }

    pub(crate) fn current() -> io::Result<Mask> {
        // SAFETY: cpu_set_t is a plain bitmask; all-zero is a valid value.
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
        // SAFETY: pid 0 is the calling thread; `set` is a valid out-pointer
        // of the size we pass.
        let rc = unsafe { libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Mask(set))
    }

    pub(crate) fn apply(mask: &Mask) -> io::Result<()> {
        // SAFETY: `mask.0` is a fully initialized cpu_set_t.
        let rc = unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mask.0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn single(cpu: usize) -> io::Result<Mask> {
        if cpu >= libc::CPU_SETSIZE as usize {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
        unsafe {
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
        }
        Ok(Mask(set))
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::io;

    pub(crate) struct Mask;

    impl Mask {
        pub(crate) fn cpus(&self) -> Vec<usize> {
            vec![0]
        }
    }

    pub(crate) fn current() -> io::Result<Mask> {
        Ok(Mask)
    }

    pub(crate) fn apply(_mask: &Mask) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn single(_cpu: usize) -> io::Result<Mask> {
        Ok(Mask)
    }
}

pub(crate) use imp::Mask;

/// CPUs the calling thread is currently allowed to run on, ascending.
pub fn allowed_cpus() -> Result<Vec<usize>, Error> {
    Ok(current_mask()?.cpus())
}

pub(crate) fn current_mask() -> Result<Mask, Error> {
    imp::current().map_err(|source| Error::Affinity { op: "read", source })
}

pub(crate) fn apply_mask(mask: &Mask) -> Result<(), Error> {
    imp::apply(mask).map_err(|source| Error::Affinity { op: "restore", source })
}

/// Move the calling thread onto `cpu` without remembering the old mask.
pub(crate) fn pin_to(cpu: usize) -> Result<(), Error> {
    let mask = imp::single(cpu).map_err(|source| Error::Affinity { op: "set", source })?;
    imp::apply(&mask).map_err(|source| Error::Affinity { op: "set", source })
}

/// The calling thread pinned to one CPU. Restores the previous mask once.
#[must_use = "dropping the pin restores the previous affinity immediately"]
pub struct PinnedCpu {
    cpu: usize,
    previous: Option<Mask>,
}

impl PinnedCpu {
    pub fn pin(cpu: usize) -> Result<Self, Error> {
        let previous = current_mask()?;
        pin_to(cpu)?;
        Ok(Self {
            cpu,
            previous: Some(previous),
        })
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Put back the mask saved by `pin`.
    pub fn restore(mut self) -> Result<(), Error> {
        self.restore_previous()
    }

    fn restore_previous(&mut self) -> Result<(), Error> {
        match self.previous.take() {
            Some(mask) => apply_mask(&mask),
            None => Ok(()),
        }
    }
}

impl Drop for PinnedCpu {
    fn drop(&mut self) {
        if let Err(e) = self.restore_previous() {
            tracing::warn!(cpu = self.cpu, error = %e, "could not restore CPU affinity");
        }
    }
}

impl std::fmt::Debug for PinnedCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedCpu")
            .field("cpu", &self.cpu)
            .field("restored", &self.previous.is_none())
            .finish()
    }
}
