use std::alloc::System;
use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use callmeter::config::{self, Overrides, ProfileFile};
use callmeter::error::Error;
use callmeter::replay::{load_trace, replay};
use callmeter::report::{
    diff_runs, format_calibration, format_table, load_latest_run, load_run, now_ms, save_run, Run,
};
use callmeter_runtime::{clock, Algorithm, CountingAllocator, ProfilerController};

#[global_allocator]
static ALLOC: CountingAllocator<System> = CountingAllocator::new(System);

#[derive(Parser)]
#[command(
    name = "callmeter",
    about = "Call-level instrumentation profiler",
    version,
    after_help = "Workflow: callmeter replay TRACE --fn NAME (then: callmeter report, callmeter diff)"
)]
struct Cli {
    /// Log more (-v info, -vv debug, -vvv trace). Overrides CALLMETER_LOG.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Profile a recorded call trace and save the run.
    Replay {
        /// Trace file: one `enter KEY`, `exit`, `spin MICROS`, `alloc BYTES`
        /// or `release` per line.
        trace: PathBuf,

        /// TOML profile with tracked functions and measurement options.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Track function KEY, `name` or `Owner:name` (repeatable).
        #[arg(long = "fn", value_name = "KEY")]
        fn_keys: Vec<String>,

        /// Function lookup structure.
        #[arg(long, value_name = "hash|trie")]
        algorithm: Option<Algorithm>,

        /// Measure per-thread CPU time.
        #[arg(long)]
        cpu: bool,

        /// Measure heap usage deltas.
        #[arg(long)]
        memory: bool,

        /// Count the whole replay as one call of `main()`.
        #[arg(long)]
        root: bool,

        /// Pin to this CPU instead of a random one.
        #[arg(long, value_name = "N")]
        pin_cpu: Option<usize>,

        /// Most calls that may be open at once.
        #[arg(long, value_name = "N")]
        frame_limit: Option<usize>,

        /// Show all functions, including those with zero calls.
        #[arg(long)]
        all: bool,

        /// Print the run as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Show the latest run (or a specific one).
    Report {
        /// Path to a specific run file. If omitted, shows the latest.
        run: Option<PathBuf>,

        /// Show all functions, including those with zero calls.
        #[arg(long)]
        all: bool,
    },
    /// Compare two runs.
    Diff {
        /// First run file.
        a: PathBuf,
        /// Second run file.
        b: PathBuf,
    },
    /// Measure cycle-counter frequency on every CPU this process may use.
    Calibrate,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env("CALLMETER_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::Replay {
            trace,
            config,
            fn_keys,
            algorithm,
            cpu,
            memory,
            root,
            pin_cpu,
            frame_limit,
            all,
            json,
        } => {
            let overrides = Overrides {
                functions: fn_keys,
                algorithm,
                cpu,
                memory,
                root,
                pin_cpu,
                frame_limit,
            };
            cmd_replay(trace, config, &overrides, all, json)
        }
        Commands::Report { run, all } => cmd_report(run, all),
        Commands::Diff { a, b } => cmd_diff(a, b),
        Commands::Calibrate => cmd_calibrate(),
    }
}

fn cmd_replay(
    trace: PathBuf,
    config_path: Option<PathBuf>,
    overrides: &Overrides,
    show_all: bool,
    json: bool,
) -> Result<(), Error> {
    let file = config_path.as_deref().map(ProfileFile::load).transpose()?;
    let config = config::resolve(file, overrides)?;
    let steps = load_trace(&trace)?;

    let mut controller = ProfilerController::new();
    let (report, stats) = replay(&mut controller, &config, &steps)?;

    let run = Run::from_report(&report, now_ms());
    let path = save_run(&config::runs_dir(), &run)?;
    eprintln!(
        "replayed {} calls ({} tracked) on cpu {}; saved {}",
        stats.enters,
        stats.tracked,
        report.cpu,
        path.display()
    );

    if json {
        let out = serde_json::to_string_pretty(&run).map_err(|e| Error::InvalidRunData {
            path,
            reason: e.to_string(),
        })?;
        anstream::println!("{out}");
    } else {
        anstream::print!("{}", format_table(&run, show_all));
    }
    Ok(())
}

fn cmd_report(run_path: Option<PathBuf>, show_all: bool) -> Result<(), Error> {
    let run = match run_path {
        Some(p) => load_run(&p)?,
        None => load_latest_run(&config::runs_dir())?,
    };
    anstream::print!("{}", format_table(&run, show_all));
    Ok(())
}

fn cmd_diff(a: PathBuf, b: PathBuf) -> Result<(), Error> {
    let run_a = load_run(&a)?;
    let run_b = load_run(&b)?;
    anstream::print!("{}", diff_runs(&run_a, &run_b));
    Ok(())
}

fn cmd_calibrate() -> Result<(), Error> {
    let table = clock::calibrate()?;
    anstream::print!("{}", format_calibration(&table));
    Ok(())
}
