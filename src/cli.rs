use crate::config::config::{MarkingConfig, MarkingOptions, ProcessConfig};
use crate::config::types::{ProcessStrategy, StdinSource, StreamKind};
use crate::config::validator::validate_options;
use crate::kernel::signal::SignalHandler;
use crate::marking::result::{MarkingResult, ResultRecord};
use crate::marking::runnable::{RunContext, TestRunnable};
use crate::marking::MarkingCoordinator;
use crate::process::{ProcessFactory, ProcessHandle, ProcessSpec};
use crate::suite::CommandSuite;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Exit code used when the operator interrupted a run
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct MarkArgs {
    /// Suite file describing the tests
    #[arg(long)]
    suite: PathBuf,
    /// Directory holding one subdirectory per submission.
    /// Without it the current directory is marked in-process.
    #[arg(long, short = 'd')]
    directory: Option<PathBuf>,
    /// Number of worker processes
    #[arg(long, short = 'j')]
    processes: Option<usize>,
    /// Reuse existing per-submission results
    #[arg(long)]
    resume: bool,
    /// Only collect existing results, never run tests
    #[arg(long)]
    tally: bool,
    /// Dispatch submissions in random order
    #[arg(long)]
    random_order: bool,
    /// Trace every descendant process with ptrace
    #[arg(long)]
    traced: bool,
    /// Protection library injected with LD_PRELOAD
    #[arg(long)]
    ld_preload: Option<PathBuf>,
    /// Default per-process timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Where aggregate files are written (defaults to the directory)
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Per-submission result file name
    #[arg(long)]
    results_filename: Option<String>,
    /// Configuration file (defaults to ./marks.json when present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Pass-through option for the tests (name[=value])
    #[arg(short = 'o', value_name = "NAME[=VALUE]")]
    options: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Mark submissions with a command suite
    Mark(MarkArgs),
    /// Run one command through the process controller and report how it ended
    Run {
        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Trace descendants with ptrace
        #[arg(long)]
        traced: bool,
        /// Protection library injected with LD_PRELOAD
        #[arg(long)]
        ld_preload: Option<PathBuf>,
        /// File streamed to the command's stdin
        #[arg(long)]
        stdin_file: Option<PathBuf>,
        /// Command and arguments to execute
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Mark(args) => {
            let config = match &args.config {
                Some(path) => MarkingConfig::load_from_file(path)?,
                None => MarkingConfig::load_default()?,
            };
            let suite = CommandSuite::load(&args.suite)?;
            let marking = marking_options(&args, &config)?;

            validate_options(&marking)?;
            let signals = SignalHandler::init()?;

            if args.directory.is_some() {
                mark_directory(marking, suite, &signals)
            } else {
                mark_current(marking, &suite)
            }
        }
        Commands::Run {
            timeout,
            traced,
            ld_preload,
            stdin_file,
            command,
        } => run_command(timeout, traced, ld_preload, stdin_file, command),
    }
}

/// Config file values first, then every flag the operator gave on top
fn marking_options(args: &MarkArgs, config: &MarkingConfig) -> Result<MarkingOptions> {
    let target = match &args.directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("current directory")?,
    };
    let mut marking = MarkingOptions::new(target);
    marking.apply_config(config);

    if let Some(processes) = args.processes {
        marking.processes = processes;
    }
    marking.resume = args.resume;
    marking.tally = args.tally;
    if args.random_order {
        marking.random_order = true;
    }
    if let Some(dir) = &args.output_dir {
        marking.output_dir = dir.clone();
    }
    if let Some(name) = &args.results_filename {
        marking.results_filename = name.clone();
    }
    if args.traced {
        marking.process.strategy = ProcessStrategy::Traced;
    }
    if let Some(path) = &args.ld_preload {
        marking.process.ld_preload = Some(path.clone());
    }
    if let Some(seconds) = args.timeout {
        marking.process.default_timeout = Some(Duration::from_secs(seconds));
    }
    marking.add_pass_through(&args.options);
    Ok(marking)
}

fn mark_directory(
    options: MarkingOptions,
    suite: CommandSuite,
    signals: &SignalHandler,
) -> Result<()> {
    let mut coordinator = MarkingCoordinator::new(options, Arc::new(suite));
    let summary = coordinator.run()?;

    eprintln!(
        "Marked {} submissions ({} executed, {} without result)",
        summary.records.len(),
        summary.executed,
        summary.records.iter().filter(|r| !r.has_results()).count()
    );
    eprintln!("Results JSON: {}", summary.artifacts.json.display());
    eprintln!("Results CSV:  {}", summary.artifacts.csv.display());
    if let Some(path) = &summary.artifacts.no_results {
        eprintln!("No results:   {}", path.display());
    }

    if summary.interrupted {
        eprintln!(
            "Marking was interrupted by signal {}; completed results were kept",
            signals.get_signal()
        );
        std::process::exit(EXIT_INTERRUPTED);
    }
    Ok(())
}

/// Single-submission mode: run the suite here and print the marks
fn mark_current(options: MarkingOptions, suite: &CommandSuite) -> Result<()> {
    let submission = options
        .directory
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!("Marking {} in-process", options.directory.display());

    let ctx = RunContext::from_options(options);
    let mut sink = MarkingResult::new();
    suite.run(&mut sink, &ctx)?;
    let record = sink.finish(submission);

    print!("{}", render_marks_table(&record));
    Ok(())
}

/// Per-category marks table for a single record
pub fn render_marks_table(record: &ResultRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("{:<30} {:>10} {:>15}\n", "Category", "Passed", "Marks"));
    out.push_str(&format!("{}\n", "-".repeat(57)));

    if let Some(marks) = &record.marks {
        for (category, info) in marks {
            let name = if category.is_empty() { "(default)" } else { category };
            let available = info.category_marks.unwrap_or(info.total_marks);
            out.push_str(&format!(
                "{:<30} {:>10} {:>15}\n",
                name,
                format!("{}/{}", info.passed, info.tests.len()),
                format!("{:.2}/{:.2}", info.mark, available)
            ));
        }
    }

    if let Some(totals) = &record.totals {
        out.push_str(&format!("{}\n", "-".repeat(57)));
        out.push_str(&format!(
            "{:<30} {:>10} {:>15}\n",
            "Total",
            format!("{}/{}", totals.passed, totals.test_count),
            format!("{:.2}/{:.2}", totals.received_marks, totals.total_marks)
        ));
    }
    out
}

/// Drive a spawned command to completion and describe how it ended
fn describe_run(handle: &mut ProcessHandle) -> serde_json::Value {
    handle.finish_input();
    let stdout = handle.read_to_end(StreamKind::Stdout);
    let stderr = handle.read_to_end(StreamKind::Stderr);
    let termination = handle.wait();

    serde_json::json!({
        "argv": handle.argv(),
        "pid": handle.pid(),
        "termination": termination,
        "timed_out": handle.timed_out(),
        "wall_time_ms": handle.wall_time().as_millis() as u64,
        "stdout": String::from_utf8_lossy(&stdout),
        "stderr": String::from_utf8_lossy(&stderr),
    })
}

fn run_command(
    timeout: Option<u64>,
    traced: bool,
    ld_preload: Option<PathBuf>,
    stdin_file: Option<PathBuf>,
    command: Vec<String>,
) -> Result<()> {
    let mut spec = ProcessSpec::new(command);
    if let Some(seconds) = timeout {
        spec = spec.timeout_secs(seconds)?;
    }
    if let Some(path) = stdin_file {
        spec = spec.with_stdin(StdinSource::File(path));
    }

    let mut config = ProcessConfig {
        ld_preload,
        ..Default::default()
    };
    if traced {
        config.strategy = ProcessStrategy::Traced;
    }
    let factory = ProcessFactory::new(config);

    let report = if traced {
        let mut handle = factory.spawn_traced(&spec)?;
        let mut report = describe_run(&mut handle);
        report["descendants"] = serde_json::json!(handle.descendant_pids());
        report["threads"] = serde_json::json!(handle.thread_ids());
        report
    } else {
        let mut handle = factory.spawn(&spec)?;
        describe_run(&mut handle)
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
