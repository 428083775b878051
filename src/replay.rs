//! Drive the engine from a recorded call trace.
//!
//! One directive per line; blank lines and `#` comments are ignored.
//!
//! ```text
//! enter Parser:parse     # call boundary, `name` or `Owner:name`
//! spin 250               # busy-wait for 250us
//! alloc 4096             # allocate 4096 bytes and keep them
//! release                # drop everything kept by `alloc`
//! exit                   # return from the innermost open call
//! ```
//!
//! The replayer plays the host: it pairs enters with exits itself and only
//! forwards an exit when the matching enter was tracked.

use std::collections::TryReserveError;
use std::path::Path;
use std::time::{Duration, Instant};

use callmeter_runtime::{Config, FunctionKey, MemorySource, ProfileReport, ProfilerController};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Enter(FunctionKey),
    Exit,
    Spin(Duration),
    Alloc(usize),
    Release,
}

/// A directive and the 1-based line it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub line: usize,
    pub directive: Directive,
}

pub fn load_trace(path: &Path) -> Result<Vec<Step>, Error> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::TraceRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_trace(&contents, path)
}

/// Parse a trace. Exits that would close more calls than are open are
/// rejected here, so a parsed trace is always replayable.
pub fn parse_trace(contents: &str, path: &Path) -> Result<Vec<Step>, Error> {
    let mut steps = Vec::new();
    let mut depth = 0usize;

    for (i, raw) in contents.lines().enumerate() {
        let line = i + 1;
        let invalid = |reason: String| Error::InvalidTrace {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let text = raw.split_once('#').map_or(raw, |(code, _)| code).trim();
        if text.is_empty() {
            continue;
        }
        let (word, arg) = match text.split_once(char::is_whitespace) {
            Some((word, arg)) => (word, Some(arg.trim())),
            None => (text, None),
        };

        let directive = match (word, arg) {
            ("enter", Some(key)) => {
                depth += 1;
                Directive::Enter(FunctionKey::parse(key).map_err(|e| invalid(e.to_string()))?)
            }
            ("exit", None) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| invalid("exit without a matching enter".into()))?;
                Directive::Exit
            }
            ("spin", Some(micros)) => Directive::Spin(Duration::from_micros(
                micros
                    .parse()
                    .map_err(|_| invalid(format!("expected microseconds, got '{micros}'")))?,
            )),
            ("alloc", Some(bytes)) => Directive::Alloc(
                bytes
                    .parse()
                    .map_err(|_| invalid(format!("expected a byte count, got '{bytes}'")))?,
            ),
            ("release", None) => Directive::Release,
            ("enter" | "spin" | "alloc", None) => {
                return Err(invalid(format!("'{word}' needs an argument")));
            }
            ("exit" | "release", Some(_)) => {
                return Err(invalid(format!("'{word}' takes no argument")));
            }
            (other, _) => return Err(invalid(format!("unknown directive '{other}'"))),
        };
        steps.push(Step { line, directive });
    }

    if depth > 0 {
        tracing::debug!(open = depth, "trace ends with open calls");
    }
    Ok(steps)
}

/// Counts from one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub enters: u64,
    pub tracked: u64,
}

/// Enable a session, play `steps` through it, and disable it.
///
/// Calls still open at the end of the trace are finalized by the disable.
/// An `alloc` the heap cannot satisfy ends the session and fails the replay.
pub fn replay<M: MemorySource>(
    controller: &mut ProfilerController<M>,
    config: &Config,
    steps: &[Step],
) -> Result<(ProfileReport, ReplayStats), Error> {
    controller.enable(config)?;

    let mut stats = ReplayStats::default();
    let mut open: Vec<bool> = Vec::new();
    let mut retained: Vec<Vec<u8>> = Vec::new();

    for step in steps {
        match &step.directive {
            Directive::Enter(key) => {
                let tracked = controller.on_call_enter(key.to_ref());
                stats.enters += 1;
                stats.tracked += u64::from(tracked);
                open.push(tracked);
            }
            Directive::Exit => {
                if open.pop() == Some(true) {
                    if let Err(e) = controller.on_call_exit() {
                        tracing::warn!(line = step.line, error = %e, "exit not recorded");
                    }
                }
            }
            Directive::Spin(duration) => spin(*duration),
            Directive::Alloc(bytes) => match zeroed(*bytes) {
                Ok(buf) => retained.push(std::hint::black_box(buf)),
                Err(source) => {
                    if let Err(e) = controller.disable() {
                        tracing::warn!(error = %e, "session not closed cleanly");
                    }
                    return Err(Error::TraceAlloc {
                        line: step.line,
                        bytes: *bytes,
                        source,
                    });
                }
            },
            Directive::Release => retained.clear(),
        }
    }

    let report = controller.disable()?;
    drop(retained);
    tracing::info!(
        enters = stats.enters,
        tracked = stats.tracked,
        unwound = report.unwound_frames,
        "replay finished"
    );
    Ok((report, stats))
}

fn zeroed(bytes: usize) -> Result<Vec<u8>, TryReserveError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(bytes)?;
    buf.resize(bytes, 0);
    Ok(buf)
}

fn spin(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(trace: &str) -> Result<Vec<Step>, Error> {
        parse_trace(trace, Path::new("t.trace"))
    }

    fn directives(trace: &str) -> Vec<Directive> {
        parse(trace).unwrap().into_iter().map(|s| s.directive).collect()
    }

    #[test]
    fn parses_every_directive() {
        let trace = "\
# header
enter Widget:render
  spin 10   # inline comment
alloc 64

release
exit
";
        assert_eq!(
            directives(trace),
            vec![
                Directive::Enter(FunctionKey::method("Widget", "render").unwrap()),
                Directive::Spin(Duration::from_micros(10)),
                Directive::Alloc(64),
                Directive::Release,
                Directive::Exit,
            ]
        );
        let lines: Vec<usize> = parse(trace).unwrap().iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![2, 3, 4, 6, 7]);
    }

    #[test]
    fn unbalanced_exit_is_rejected_with_its_line() {
        let err = parse("enter a\nexit\nexit\n").unwrap_err();
        match err {
            Error::InvalidTrace { line, ref reason, .. } => {
                assert_eq!(line, 3);
                assert!(reason.contains("without a matching enter"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().starts_with("t.trace:3:"), "{err}");
    }

    #[test]
    fn malformed_lines_are_rejected() {
        for (trace, needle) in [
            ("enter", "needs an argument"),
            ("exit now", "takes no argument"),
            ("spin fast", "expected microseconds"),
            ("alloc -1", "expected a byte count"),
            ("call foo", "unknown directive 'call'"),
            ("enter :foo", "empty owner"),
        ] {
            let err = parse(trace).unwrap_err();
            assert!(err.to_string().contains(needle), "{trace}: {err}");
        }
    }

    #[test]
    fn open_calls_at_end_are_allowed() {
        assert_eq!(directives("enter a\nenter b\n").len(), 2);
    }

    #[test]
    fn replay_forwards_only_tracked_exits() {
        let steps = parse(
            "\
enter main
  enter work
    enter helper
      spin 50
    exit
  exit
  enter work
exit
enter other
exit
",
        )
        .unwrap();
        let config = Config::tracking(["work", "helper"]).unwrap();
        let mut controller = ProfilerController::new();
        let (report, stats) = replay(&mut controller, &config, &steps).unwrap();

        assert_eq!(stats, ReplayStats { enters: 5, tracked: 3 });
        assert_eq!(report.get("work").unwrap().call_count, 2);
        assert_eq!(report.get("helper").unwrap().call_count, 1);
        assert!(report.get("helper").unwrap().wall_time_us >= 50.0);
        assert_eq!(report.unwound_frames, 0);
        assert!(!controller.is_enabled());
    }

    #[test]
    fn replay_unwinds_calls_left_open() {
        let steps = parse("enter work\nenter work\nexit\n").unwrap();
        let config = Config::tracking(["work"]).unwrap();
        let (report, _) = replay(&mut ProfilerController::new(), &config, &steps).unwrap();
        assert_eq!(report.get("work").unwrap().call_count, 2);
        assert_eq!(report.unwound_frames, 1);
    }

    #[test]
    fn oversized_alloc_fails_and_ends_the_session() {
        let steps = parse(&format!("enter work\n  alloc {}\nexit\n", usize::MAX)).unwrap();
        let config = Config::tracking(["work"]).unwrap();
        let mut controller = ProfilerController::new();
        let err = replay(&mut controller, &config, &steps).unwrap_err();
        assert!(matches!(err, Error::TraceAlloc { line: 2, .. }), "{err}");
        assert!(err.to_string().contains("cannot allocate"), "{err}");
        assert!(!controller.is_enabled());
    }
}
