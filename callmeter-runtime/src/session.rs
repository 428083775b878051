//! A per-thread profiler behind free functions, for hosts that would rather
//! not carry a `ProfilerController` around.
//!
//! ```ignore
//! callmeter_runtime::enable(&Config::tracking(["parse", "Lexer:next"])?)?;
//! {
//!     let _guard = callmeter_runtime::enter(FunctionRef::function("parse"));
//!     // ...
//! }
//! let report = callmeter_runtime::disable()?;
//! ```

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::controller::{Config, ProfileReport, ProfilerController};
use crate::error::Error;
use crate::selector::FunctionRef;

thread_local! {
    static PROFILER: RefCell<ProfilerController> = RefCell::new(ProfilerController::new());
}

/// Enable profiling on the current thread.
pub fn enable(config: &Config) -> Result<(), Error> {
    PROFILER.with(|p| p.borrow_mut().enable(config))
}

/// Disable profiling on the current thread and return its report.
pub fn disable() -> Result<ProfileReport, Error> {
    PROFILER.with(|p| p.borrow_mut().disable())
}

pub fn is_enabled() -> bool {
    PROFILER
        .try_with(|p| p.try_borrow().is_ok_and(|p| p.is_enabled()))
        .unwrap_or(false)
}

/// Records the call on drop if it was tracked.
///
/// Tied to the thread that created it. A guard outliving its session (the
/// session was disabled, or disabled and enabled again) does nothing on drop.
#[must_use = "dropping the guard immediately records a zero-length call; bind it with `let _guard = ...`"]
pub struct Guard {
    /// Generation of the session the call was tracked in.
    tracked_in: Option<u64>,
    _not_send: PhantomData<*const ()>,
}

impl Guard {
    pub fn is_tracked(&self) -> bool {
        self.tracked_in.is_some()
    }
}

/// Report a call entry on the current thread.
pub fn enter(key: FunctionRef<'_>) -> Guard {
    let tracked_in = PROFILER
        .try_with(|p| {
            let mut p = p.try_borrow_mut().ok()?;
            p.on_call_enter(key).then(|| p.generation())
        })
        .ok()
        .flatten();
    Guard {
        tracked_in,
        _not_send: PhantomData,
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        let Some(generation) = self.tracked_in else {
            return;
        };
        // Thread-local may already be gone during thread teardown.
        let _ = PROFILER.try_with(|p| {
            let Ok(mut p) = p.try_borrow_mut() else {
                return;
            };
            if p.is_enabled() && p.generation() == generation {
                // Faults are logged and handled by the controller.
                let _ = p.on_call_exit();
            }
        });
    }
}
