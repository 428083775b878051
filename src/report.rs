use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use callmeter_runtime::clock::FrequencyTable;
use callmeter_runtime::ProfileReport;

use crate::error::Error;

/// A profiling run as stored on disk.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Run {
    pub run_id: String,
    pub timestamp_ms: u128,
    pub algorithm: String,
    pub cpu: usize,
    pub ticks_per_us: f64,
    #[serde(default)]
    pub dropped_frames: u64,
    pub functions: Vec<FnEntry>,
}

/// Aggregates for one function within a run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FnEntry {
    pub slot: u32,
    pub name: String,
    pub calls: u64,
    pub wall_us: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_us: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_mem_delta: Option<i64>,
}

impl Run {
    pub fn from_report(report: &ProfileReport, timestamp_ms: u128) -> Self {
        Self {
            run_id: format!("{timestamp_ms}-{}", std::process::id()),
            timestamp_ms,
            algorithm: report.algorithm.to_string(),
            cpu: report.cpu,
            ticks_per_us: report.ticks_per_us,
            dropped_frames: report.dropped_frames,
            functions: report
                .functions
                .iter()
                .map(|f| FnEntry {
                    slot: f.slot,
                    name: f.key.to_string(),
                    calls: f.call_count,
                    wall_us: f.wall_time_us,
                    cpu_us: f.cpu_time_us,
                    mem_delta: f.memory_delta,
                    peak_mem_delta: f.peak_memory_delta,
                })
                .collect(),
        }
    }
}

pub fn now_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

/// Write a run to `<timestamp_ms>.json` in `runs_dir`, creating the directory
/// if needed. If that name is taken the next free millisecond is used.
pub fn save_run(runs_dir: &Path, run: &Run) -> Result<PathBuf, Error> {
    std::fs::create_dir_all(runs_dir).map_err(|source| Error::RunWriteError {
        path: runs_dir.to_path_buf(),
        source,
    })?;
    let json = serde_json::to_string_pretty(run).map_err(|e| Error::InvalidRunData {
        path: runs_dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut stamp = run.timestamp_ms;
    loop {
        let path = runs_dir.join(format!("{stamp}.json"));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                file.write_all(json.as_bytes())
                    .map_err(|source| Error::RunWriteError {
                        path: path.clone(),
                        source,
                    })?;
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => stamp += 1,
            Err(source) => return Err(Error::RunWriteError { path, source }),
        }
    }
}

/// Read a profiling run from a JSON file on disk.
pub fn load_run(path: &Path) -> Result<Run, Error> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::RunReadError {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|e| Error::InvalidRunData {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Find the most recent run file in a directory by parsing timestamps from filenames.
///
/// Run files are named `<timestamp>.json`. This function parses the stem as u128
/// and returns the path with the highest timestamp.
pub fn latest_run(runs_dir: &Path) -> Result<PathBuf, Error> {
    let entries = match std::fs::read_dir(runs_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NoRuns),
        Err(source) => {
            return Err(Error::RunReadError {
                path: runs_dir.to_path_buf(),
                source,
            });
        }
    };

    entries
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                return None;
            }
            let ts: u128 = path.file_stem()?.to_str()?.parse().ok()?;
            Some((ts, path))
        })
        .max_by_key(|(ts, _)| *ts)
        .map(|(_, path)| path)
        .ok_or(Error::NoRuns)
}

pub fn load_latest_run(runs_dir: &Path) -> Result<Run, Error> {
    load_run(&latest_run(runs_dir)?)
}

/// Human-readable duration from microseconds.
fn format_us(us: f64) -> String {
    if us >= 1_000_000.0 {
        format!("{:.2}s", us / 1_000_000.0)
    } else if us >= 1_000.0 {
        format!("{:.2}ms", us / 1_000.0)
    } else {
        format!("{us:.1}us")
    }
}

fn format_bytes(bytes: i64) -> String {
    let abs = bytes.unsigned_abs() as f64;
    let sign = if bytes < 0 { "-" } else { "" };
    if abs >= (1 << 20) as f64 {
        format!("{sign}{:.1}MiB", abs / (1 << 20) as f64)
    } else if abs >= 1024.0 {
        format!("{sign}{:.1}KiB", abs / 1024.0)
    } else {
        format!("{bytes}B")
    }
}

/// Format a run as a text table sorted by wall time descending.
///
/// Functions with zero calls are left out unless `show_all` is set. CPU and
/// memory columns appear only if the run measured them.
pub fn format_table(run: &Run, show_all: bool) -> String {
    let mut entries: Vec<&FnEntry> = run
        .functions
        .iter()
        .filter(|e| show_all || e.calls > 0)
        .collect();
    entries.sort_by(|a, b| b.wall_us.total_cmp(&a.wall_us));

    let has_cpu = run.functions.iter().any(|e| e.cpu_us.is_some());
    let has_mem = run.functions.iter().any(|e| e.mem_delta.is_some());

    let mut out = String::new();
    let mut width = 62;
    out.push_str(&format!("{:<40} {:>8} {:>12}", "Function", "Calls", "Wall"));
    if has_cpu {
        out.push_str(&format!(" {:>12}", "CPU"));
        width += 13;
    }
    if has_mem {
        out.push_str(&format!(" {:>10} {:>10}", "Mem", "Peak"));
        width += 22;
    }
    out.push('\n');
    out.push_str(&format!("{}\n", "-".repeat(width)));

    for entry in &entries {
        out.push_str(&format!(
            "{:<40} {:>8} {:>12}",
            entry.name,
            entry.calls,
            format_us(entry.wall_us)
        ));
        if has_cpu {
            let cpu = entry.cpu_us.map_or_else(|| "-".into(), |us| format_us(us as f64));
            out.push_str(&format!(" {cpu:>12}"));
        }
        if has_mem {
            let mem = entry.mem_delta.map_or_else(|| "-".into(), format_bytes);
            let peak = entry.peak_mem_delta.map_or_else(|| "-".into(), format_bytes);
            out.push_str(&format!(" {mem:>10} {peak:>10}"));
        }
        out.push('\n');
    }

    if run.dropped_frames > 0 {
        out.push_str(&format!(
            "\n{} tracked calls were not profiled (frame limit reached)\n",
            run.dropped_frames
        ));
    }
    out
}

/// Show the wall-time delta between two runs, comparing functions by name.
pub fn diff_runs(a: &Run, b: &Run) -> String {
    let a_map: HashMap<&str, &FnEntry> = a.functions.iter().map(|f| (f.name.as_str(), f)).collect();
    let b_map: HashMap<&str, &FnEntry> = b.functions.iter().map(|f| (f.name.as_str(), f)).collect();

    // Collect all function names, sorted for deterministic output.
    let mut names: Vec<&str> = a_map.keys().chain(b_map.keys()).copied().collect();
    names.sort_unstable();
    names.dedup();

    let mut out = String::new();
    out.push_str(&format!(
        "{:<40} {:>12} {:>12} {:>12}\n",
        "Function", "Before", "After", "Delta"
    ));
    out.push_str(&format!("{}\n", "-".repeat(79)));

    for name in &names {
        let before = a_map.get(name).map_or(0.0, |e| e.wall_us);
        let after = b_map.get(name).map_or(0.0, |e| e.wall_us);
        let delta = after - before;
        let sign = if delta < 0.0 { "-" } else { "+" };
        out.push_str(&format!(
            "{:<40} {:>12} {:>12} {:>12}\n",
            name,
            format_us(before),
            format_us(after),
            format!("{sign}{}", format_us(delta.abs()))
        ));
    }
    out
}

/// Ticks per microsecond for each calibrated CPU.
pub fn format_calibration(table: &FrequencyTable) -> String {
    let mut out = String::new();
    out.push_str(&format!("{:<6} {:>14} {:>10}\n", "CPU", "ticks/us", "GHz"));
    out.push_str(&format!("{}\n", "-".repeat(32)));
    for (cpu, ticks_per_us) in table.iter() {
        out.push_str(&format!(
            "{cpu:<6} {ticks_per_us:>14.3} {:>10.3}\n",
            ticks_per_us / 1_000.0
        ));
    }
    out
}
