//! Configuration surface for the initializer and the supervisor.
//!
//! All options are plain immutable structs built once by the caller and
//! passed by reference; the core keeps no process-wide mutable state.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};

/// Sentinel path/option value meaning "skip this entry entirely".
///
/// A file list entry equal to this string is dropped at parse time; a
/// `path_search` equal to it disables search-path export for every job.
pub const OMITTED: &str = "omitted";

/// Execution backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// In-process synchronous evaluation; the supervisor blocks per job.
    Session,
    /// Detached local subprocess.
    Background,
    /// Logout-proof local scheduler (`at now`).
    Batch,
    /// SGE-style cluster queue.
    Qsub,
    /// Moab/Torque cluster queue.
    Msub,
}

impl Mode {
    /// Parse a mode name such as `"background"` (case-insensitive).
    pub fn parse(s: &str) -> Result<Mode> {
        match s.to_lowercase().as_str() {
            "session" => Ok(Mode::Session),
            "background" => Ok(Mode::Background),
            "batch" => Ok(Mode::Batch),
            "qsub" => Ok(Mode::Qsub),
            "msub" => Ok(Mode::Msub),
            other => bail!(
                "unknown mode {other:?} (supported: session, background, batch, qsub, msub)"
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Session => "session",
            Mode::Background => "background",
            Mode::Batch => "batch",
            Mode::Qsub => "qsub",
            Mode::Msub => "msub",
        }
    }

    /// Cluster modes route wrapper stdout/stderr through `.oqsub`/`.eqsub`.
    pub fn is_cluster(&self) -> bool {
        matches!(self, Mode::Qsub | Mode::Msub)
    }
}

/// Options for pipeline initialization.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Root of the logs directory (required).
    pub path_logs: PathBuf,
    /// Search path exported to every payload; `Some(OMITTED)` disables
    /// path setup, `None` leaves the environment untouched.
    pub path_search: Option<String>,
    /// Interpreter invocation used by script-based backends; `None`
    /// resolves to the current executable's internal run-job entry.
    pub command_runner: Option<String>,
    /// Substrings forcing a restart of any job whose name contains one.
    pub restart: Vec<String>,
    /// Enable descriptor-diff-driven restart.
    pub flag_update: bool,
    /// Require operator confirmation before destructive writes and
    /// before starting with missing inputs.
    pub flag_pause: bool,
    /// Delete prior output files of to-be-restarted jobs.
    pub flag_clean: bool,
    /// Human-readable progress reporting.
    pub flag_verbose: bool,
}

impl InitOptions {
    pub fn new(path_logs: impl Into<PathBuf>) -> Self {
        InitOptions {
            path_logs: path_logs.into(),
            path_search: None,
            command_runner: None,
            restart: vec![],
            flag_update: true,
            flag_pause: false,
            flag_clean: true,
            flag_verbose: true,
        }
    }
}

/// Options for the execution supervisor.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Execution backend.
    pub mode: Mode,
    /// Concurrency cap on in-flight jobs.
    pub max_queued: usize,
    /// Poll interval between supervisor ticks.
    pub time_between_checks: Duration,
    /// Post-poll pause letting cluster filesystems settle before log
    /// ingestion.
    pub time_cool_down: Duration,
    /// Extra flags appended to the cluster submission command line.
    pub qsub_options: String,
    /// Shell-options prologue written at the top of wrapper scripts.
    pub shell_options: String,
    /// Environment/bootstrap lines inserted before the runner invocation
    /// in wrapper scripts.
    pub runner_prelude: String,
    /// Human-readable progress reporting.
    pub flag_verbose: bool,
    /// Keep wrapper scripts of failed jobs for post-mortem.
    pub flag_debug: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            mode: Mode::Background,
            max_queued: 1,
            time_between_checks: Duration::from_millis(1000),
            time_cool_down: Duration::ZERO,
            qsub_options: String::new(),
            shell_options: String::new(),
            runner_prelude: String::new(),
            flag_verbose: true,
            flag_debug: false,
        }
    }
}
