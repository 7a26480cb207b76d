//! pipeline-manager — entry point
//!
//! Human-readable output goes to stdout; tracing logs go to stderr.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline_manager::config::{InitOptions, Mode, RunOptions};
use pipeline_manager::graph::{CycleError, DuplicateOutputs, ProduceCleanConflict};
use pipeline_manager::job::Pipeline;
use pipeline_manager::paths::{PipePaths, resolve_logs_root};
use pipeline_manager::status::JobStatus;
use pipeline_manager::store::{JobNotFound, StateStore};
use pipeline_manager::{init, runner, supervisor};

#[derive(Debug, Parser)]
#[command(name = "pipeline-manager")]
#[command(about = "File-driven pipeline manager", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only report warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Initialize a pipeline: validate, plan restarts, prepare the logs
    /// directory.
    Init {
        /// Override the logs directory.
        #[arg(long)]
        logs: Option<String>,

        /// Search path exported to every job; "omitted" disables it.
        #[arg(long)]
        search: Option<String>,

        /// Interpreter invocation used by script backends.
        #[arg(long)]
        runner: Option<String>,

        /// Force-restart every job whose name contains this substring.
        #[arg(long = "restart", value_name = "SUBSTRING", action = clap::ArgAction::Append)]
        restart: Vec<String>,

        /// Disable descriptor-diff-driven restart.
        #[arg(long)]
        no_update: bool,

        /// Ask before destructive writes and before starting with
        /// missing inputs.
        #[arg(long)]
        pause: bool,

        /// Keep prior output files of to-be-restarted jobs.
        #[arg(long)]
        no_clean: bool,

        /// Pipeline description file (TOML).
        pipeline: String,
    },

    /// Run the supervisor over an initialized pipeline.
    Run {
        /// Override the logs directory.
        #[arg(long)]
        logs: Option<String>,

        /// Backend: session | background | batch | qsub | msub.
        #[arg(long, default_value = "background")]
        mode: String,

        /// Concurrency cap on in-flight jobs.
        #[arg(long, default_value = "1")]
        max_queued: usize,

        /// Poll interval between supervisor ticks, in milliseconds.
        #[arg(long, default_value = "1000")]
        poll_ms: u64,

        /// Pause after polling before log ingestion, in milliseconds.
        #[arg(long, default_value = "0")]
        cool_down_ms: u64,

        /// Extra flags for the cluster submission command line.
        #[arg(long, default_value = "")]
        qsub_options: String,

        /// Shell-options prologue for wrapper scripts.
        #[arg(long, default_value = "")]
        shell_options: String,

        /// Bootstrap lines inserted before the runner invocation.
        #[arg(long, default_value = "")]
        runner_prelude: String,

        /// Keep wrapper scripts of failed jobs.
        #[arg(long)]
        debug: bool,

        /// Detach the supervisor and return immediately.
        #[arg(long)]
        detach: bool,
    },

    /// Show the status of every job in a logs directory.
    Status {
        /// Override the logs directory.
        #[arg(long)]
        logs: Option<String>,
    },

    /// Print the aggregated log of one job.
    Logs {
        /// Override the logs directory.
        #[arg(long)]
        logs: Option<String>,

        /// Number of lines to show from the end of the log (0 = all).
        #[arg(long, default_value = "0")]
        tail_lines: u64,

        /// Maximum bytes to read from the end of the log.
        #[arg(long, default_value = "1048576")]
        max_bytes: u64,

        /// Job name.
        job: String,
    },

    /// Interrupt a running supervisor by removing its lock file.
    Stop {
        /// Override the logs directory.
        #[arg(long)]
        logs: Option<String>,
    },

    /// Print the run history of a logs directory.
    History {
        /// Override the logs directory.
        #[arg(long)]
        logs: Option<String>,
    },

    /// [Internal] Execute one job from the jobs store — not for direct use.
    #[command(name = "_run-job", hide = true)]
    RunJob {
        #[arg(long)]
        logs: String,

        #[arg(long)]
        search: Option<String>,

        job: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    // Logs always go to stderr so stdout stays reserved for reports.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        // Structural pipeline mistakes and unknown names are usage
        // errors, not infrastructure failures.
        let usage = e.downcast_ref::<CycleError>().is_some()
            || e.downcast_ref::<DuplicateOutputs>().is_some()
            || e.downcast_ref::<ProduceCleanConflict>().is_some()
            || e.downcast_ref::<JobNotFound>().is_some();
        std::process::exit(if usage { 2 } else { 1 });
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init {
            logs,
            search,
            runner,
            restart,
            no_update,
            pause,
            no_clean,
            pipeline,
        } => {
            let pipeline = Pipeline::load(std::path::Path::new(&pipeline))?;
            let opts = InitOptions {
                path_search: search,
                command_runner: runner,
                restart,
                flag_update: !no_update,
                flag_pause: pause,
                flag_clean: !no_clean,
                flag_verbose: !cli.quiet,
                ..InitOptions::new(resolve_logs_root(logs.as_deref()))
            };
            let pipe = init::initialize(&pipeline, &opts)?;
            println!("{}", pipe.display());
        }

        Command::Run {
            logs,
            mode,
            max_queued,
            poll_ms,
            cool_down_ms,
            qsub_options,
            shell_options,
            runner_prelude,
            debug,
            detach,
        } => {
            let paths = PipePaths::new(resolve_logs_root(logs.as_deref()));
            let opts = RunOptions {
                mode: Mode::parse(&mode)?,
                max_queued,
                time_between_checks: Duration::from_millis(poll_ms),
                time_cool_down: Duration::from_millis(cool_down_ms),
                qsub_options,
                shell_options,
                runner_prelude,
                flag_verbose: !cli.quiet,
                flag_debug: debug,
            };
            if detach {
                supervisor::spawn_detached(&paths, &opts)?;
            } else {
                let report = supervisor::run(&paths, &opts)?;
                println!(
                    "finished {}  failed {}  blocked {}",
                    report.finished, report.failed, report.blocked
                );
            }
        }

        Command::Status { logs } => {
            print_status(&PipePaths::new(resolve_logs_root(logs.as_deref())))?;
        }

        Command::Logs {
            logs,
            tail_lines,
            max_bytes,
            job,
        } => {
            print_job_log(
                &PipePaths::new(resolve_logs_root(logs.as_deref())),
                &job,
                tail_lines,
                max_bytes,
            )?;
        }

        Command::Stop { logs } => {
            let paths = PipePaths::new(resolve_logs_root(logs.as_deref()));
            let lock = paths.lock();
            if lock.exists() {
                std::fs::remove_file(&lock)?;
                println!("lock removed; the supervisor will stop on its next tick");
            } else {
                println!("no supervisor lock at {}", lock.display());
            }
        }

        Command::History { logs } => {
            let paths = PipePaths::new(resolve_logs_root(logs.as_deref()));
            let text = std::fs::read_to_string(paths.history()).unwrap_or_default();
            print!("{text}");
        }

        Command::RunJob { logs, search, job } => {
            let paths = PipePaths::new(&logs);
            runner::run_job(&paths, &job, search.as_deref())?;
        }
    }
    Ok(())
}

fn print_status(paths: &PipePaths) -> Result<()> {
    let store = StateStore::new(paths);
    let record = store.load_pipe()?;
    let status = store.load_status()?;
    let profile = store.load_profile()?;

    // current pipeline first in declaration order, prior-only names after
    let mut names: Vec<&String> = record.jobs.iter().collect();
    let mut extra: Vec<&String> = status
        .keys()
        .filter(|name| !record.jobs.contains(*name))
        .collect();
    extra.sort();
    names.extend(extra);

    for name in names {
        let st = status.get(name).copied().unwrap_or(JobStatus::None);
        let timing = profile
            .get(name)
            .filter(|p| !p.finished_at.is_empty())
            .map(|p| match p.exit_code {
                Some(code) => format!("  {} ms  exit {code}", p.elapsed_ms),
                None => format!("  {} ms", p.elapsed_ms),
            })
            .unwrap_or_default();
        println!("{name:<24} {}{timing}", st.as_str());
    }
    Ok(())
}

fn print_job_log(paths: &PipePaths, job: &str, tail_lines: u64, max_bytes: u64) -> Result<()> {
    let store = StateStore::new(paths);
    let logs = store.load_logs()?;
    let Some(text) = logs.get(job) else {
        anyhow::bail!(JobNotFound(job.to_string()));
    };
    print!("{}", tail_text(text, tail_lines, max_bytes));
    Ok(())
}

/// Keep at most `max_bytes` from the end, then at most `tail_lines`
/// lines (0 = no line limit).
fn tail_text(text: &str, tail_lines: u64, max_bytes: u64) -> String {
    let bytes = text.as_bytes();
    // avoid splitting a UTF-8 sequence
    let mut start = bytes.len().saturating_sub(max_bytes as usize);
    while start < bytes.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    let tail = &text[start..];
    if tail_lines == 0 {
        return tail.to_string();
    }
    let lines: Vec<&str> = tail.lines().collect();
    let skip = lines.len().saturating_sub(tail_lines as usize);
    lines[skip..].join("\n")
}
