//! Integration tests for `callmeter report`, `diff` and `calibrate`.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn callmeter(runs_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_callmeter"))
        .args(args)
        .env("CALLMETER_RUNS_DIR", runs_dir)
        .output()
        .expect("failed to run callmeter")
}

fn write_run(dir: &Path, timestamp_ms: u64, walk_us: f64) -> std::path::PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(format!("{timestamp_ms}.json"));
    fs::write(
        &path,
        format!(
            r#"{{
  "run_id": "{timestamp_ms}-1",
  "timestamp_ms": {timestamp_ms},
  "algorithm": "trie",
  "cpu": 0,
  "ticks_per_us": 1000.0,
  "functions": [
    {{"slot": 1, "name": "walk", "calls": 3, "wall_us": {walk_us}}},
    {{"slot": 2, "name": "idle", "calls": 0, "wall_us": 0.0}}
  ]
}}"#
        ),
    )
    .unwrap();
    path
}

#[test]
fn report_shows_latest_run() {
    let tmp = tempfile::tempdir().unwrap();
    let runs = tmp.path().join("runs");
    write_run(&runs, 1_700_000_000_000, 1_000.0);
    write_run(&runs, 1_700_000_005_000, 2_500.0);

    let output = callmeter(&runs, &["report"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("2.50ms"), "latest run expected:\n{stdout}");
    assert!(!stdout.contains("idle"), "{stdout}");

    let output = callmeter(&runs, &["report", "--all"]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("idle"));
}

#[test]
fn report_of_specific_file() {
    let tmp = tempfile::tempdir().unwrap();
    let runs = tmp.path().join("runs");
    let older = write_run(&runs, 1_700_000_000_000, 1_000.0);
    write_run(&runs, 1_700_000_005_000, 2_500.0);

    let output = callmeter(&runs, &["report", older.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("1.00ms"), "{stdout}");
}

#[test]
fn report_without_runs_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let output = callmeter(&tmp.path().join("missing"), &["report"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("error: no callmeter runs found"), "{stderr}");
}

#[test]
fn diff_shows_wall_time_change() {
    let tmp = tempfile::tempdir().unwrap();
    let runs = tmp.path().join("runs");
    let a = write_run(&runs, 1, 3_000.0);
    let b = write_run(&runs, 2, 1_000.0);

    let output = callmeter(&runs, &["diff", a.to_str().unwrap(), b.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("walk"), "{stdout}");
    assert!(stdout.contains("-2.00ms"), "{stdout}");
}

#[test]
fn calibrate_lists_cpus() {
    let tmp = tempfile::tempdir().unwrap();
    let output = callmeter(tmp.path(), &["calibrate"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("ticks/us"), "{stdout}");
    assert!(stdout.lines().count() >= 3, "at least one cpu row:\n{stdout}");
}
