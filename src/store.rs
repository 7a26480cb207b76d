//! Persistent control-plane state under the logs directory.
//!
//! Five whole-file JSON records: the `PIPE` record plus four parallel
//! maps keyed by job name (descriptors, status, logs, profile). Each has
//! a sibling backup copy. Reads fall back to the backup and restore the
//! main file from it; writes land in the main file through a temp-file
//! rename, then are copied to the backup. There is no per-key mutation
//! and no journaling; the backup bounds the damage of a crash during a
//! single write.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::job::JobSpec;
use crate::paths::PipePaths;
use crate::status::JobStatus;

/// Error returned when a job name is not present in the jobs store.
#[derive(Debug)]
pub struct JobNotFound(pub String);

impl std::fmt::Display for JobNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job not found: {}", self.0)
    }
}

impl std::error::Error for JobNotFound {}

/// The `PIPE` record: graph shape, location, and run history.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PipeRecord {
    /// Job names in pipeline order; indices below refer into this list.
    pub jobs: Vec<String>,
    /// `children[b]` lists the dependants of job `b`.
    pub children: Vec<Vec<usize>>,
    pub path_logs: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path_search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub command_runner: Option<String>,
    /// One line per initialization or supervisor run.
    #[serde(default)]
    pub history: Vec<String>,
}

/// Start/end timing of one job execution.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct JobProfile {
    pub started_at: String,
    pub finished_at: String,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_code: Option<i32>,
}

pub type JobsMap = BTreeMap<String, JobSpec>;
pub type StatusMap = BTreeMap<String, JobStatus>;
pub type LogsMap = BTreeMap<String, String>;
pub type ProfileMap = BTreeMap<String, JobProfile>;

/// Typed access to the five persistent records of one logs directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: PipePaths,
}

impl StateStore {
    pub fn new(paths: &PipePaths) -> Self {
        StateStore {
            paths: paths.clone(),
        }
    }

    /// A prior run exists if the jobs store (or its backup) is present.
    pub fn exists(&self) -> bool {
        self.paths.jobs_main().exists() || self.paths.jobs_backup().exists()
    }

    pub fn load_pipe(&self) -> Result<PipeRecord> {
        self.read(&self.paths.pipe_main(), &self.paths.pipe_backup())
    }

    pub fn save_pipe(&self, record: &PipeRecord) -> Result<()> {
        self.write(&self.paths.pipe_main(), &self.paths.pipe_backup(), record)
    }

    pub fn load_jobs(&self) -> Result<JobsMap> {
        self.read(&self.paths.jobs_main(), &self.paths.jobs_backup())
    }

    pub fn save_jobs(&self, jobs: &JobsMap) -> Result<()> {
        self.write(&self.paths.jobs_main(), &self.paths.jobs_backup(), jobs)
    }

    pub fn load_status(&self) -> Result<StatusMap> {
        self.read(&self.paths.status_main(), &self.paths.status_backup())
    }

    pub fn save_status(&self, status: &StatusMap) -> Result<()> {
        self.write(
            &self.paths.status_main(),
            &self.paths.status_backup(),
            status,
        )
    }

    pub fn load_logs(&self) -> Result<LogsMap> {
        self.read(&self.paths.logs_main(), &self.paths.logs_backup())
    }

    pub fn save_logs(&self, logs: &LogsMap) -> Result<()> {
        self.write(&self.paths.logs_main(), &self.paths.logs_backup(), logs)
    }

    pub fn load_profile(&self) -> Result<ProfileMap> {
        self.read(&self.paths.profile_main(), &self.paths.profile_backup())
    }

    pub fn save_profile(&self, profile: &ProfileMap) -> Result<()> {
        self.write(
            &self.paths.profile_main(),
            &self.paths.profile_backup(),
            profile,
        )
    }

    /// Look up one descriptor; distinguishable by callers via
    /// [`JobNotFound`].
    pub fn load_job(&self, name: &str) -> Result<JobSpec> {
        let mut jobs = self.load_jobs()?;
        match jobs.remove(name) {
            Some(spec) => Ok(spec),
            None => bail!(JobNotFound(name.to_string())),
        }
    }

    /// Read protocol: attempt the main file; on any error fall back to
    /// the backup and restore the main file from it.
    fn read<T: DeserializeOwned>(&self, main: &Path, backup: &Path) -> Result<T> {
        match read_json::<T>(main) {
            Ok(value) => Ok(value),
            Err(main_err) => match read_json::<T>(backup) {
                Ok(value) => {
                    tracing::warn!(
                        main = %main.display(),
                        "state file unreadable, restored from backup"
                    );
                    if let Err(e) = std::fs::copy(backup, main) {
                        tracing::warn!(error = %e, "could not restore main state file");
                    }
                    Ok(value)
                }
                Err(_) => Err(main_err),
            },
        }
    }

    /// Write protocol: temp-file rename into the main file, then copy to
    /// the backup.
    fn write<T: Serialize>(&self, main: &Path, backup: &Path, value: &T) -> Result<()> {
        let dir = main
            .parent()
            .with_context(|| format!("state file {} has no parent", main.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("create temp file in {}", dir.display()))?;
        let contents = serde_json::to_string_pretty(value)?;
        tmp.write_all(contents.as_bytes())
            .with_context(|| format!("write state for {}", main.display()))?;
        tmp.persist(main)
            .with_context(|| format!("persist state file {}", main.display()))?;
        std::fs::copy(main, backup)
            .with_context(|| format!("copy state to backup {}", backup.display()))?;
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw =
        std::fs::read(path).with_context(|| format!("read state file {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("parse state file {}", path.display()))
}

/// Record one history line both in the `PIPE` record and in the
/// append-only `PIPE_history.txt`.
pub fn append_history(paths: &PipePaths, record: &mut PipeRecord, line: String) -> Result<()> {
    use std::io::Write as _;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.history())
        .with_context(|| format!("open history file {}", paths.history().display()))?;
    writeln!(file, "{line}").context("append history line")?;
    record.history.push(line);
    Ok(())
}

/// Union a prior run's entries into the current map: names present only
/// in the old run are preserved for later resumption of a superset
/// pipeline; current entries win on conflict.
pub fn merge_prior<T>(current: &mut BTreeMap<String, T>, prior: BTreeMap<String, T>) {
    for (name, value) in prior {
        current.entry(name).or_insert(value);
    }
}
