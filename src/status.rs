//! Job status values and the on-disk tag-file probe.
//!
//! Tag files are authoritative: a status persisted in `PIPE_status` only
//! reflects what the supervisor last observed, while the marker files
//! under the logs directory carry the transitions made by runners in
//! other processes.

use serde::{Deserialize, Serialize};

use crate::paths::PipePaths;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Never run, or scheduled for (re)execution.
    None,
    /// Handed to a backend; no `.running` tag observed yet.
    Submitted,
    /// `.running` tag observed.
    Running,
    Finished,
    Failed,
    /// The wrapper reported termination without a proper outcome tag;
    /// reclassified to `Failed` by the supervisor.
    Exit,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::None => "none",
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Exit => "exit",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Exit)
    }
}

/// Inspect a job's tag files and report the status they encode, if any.
///
/// Outcome tags win over `.exit`, which wins over `.running`: a runner
/// that crashed after its payload may leave both `.running` and `.exit`
/// behind, and the wrapper always writes `.exit` last.
pub fn probe_tags(paths: &PipePaths, job: &str) -> Option<JobStatus> {
    if paths.finished_tag(job).exists() {
        Some(JobStatus::Finished)
    } else if paths.failed_tag(job).exists() {
        Some(JobStatus::Failed)
    } else if paths.exit_tag(job).exists() {
        Some(JobStatus::Exit)
    } else if paths.running_tag(job).exists() {
        Some(JobStatus::Running)
    } else {
        None
    }
}

/// Collect a job's log text from its per-job files: the payload log,
/// with cluster wrapper stdout/stderr appended when present.
pub fn harvest_log(paths: &PipePaths, job: &str) -> String {
    let mut text = std::fs::read_to_string(paths.job_log(job)).unwrap_or_default();
    for (label, path) in [
        ("qsub stdout", paths.job_oqsub(job)),
        ("qsub stderr", paths.job_eqsub(job)),
    ] {
        if let Ok(extra) = std::fs::read_to_string(&path) {
            if !extra.is_empty() {
                text.push_str(&format!("\n***** {label} *****\n"));
                text.push_str(&extra);
            }
        }
    }
    text
}

/// Remove every tag file belonging to `job`. Errors are ignored; a tag
/// that cannot be removed will be purged by the next preparation pass.
pub fn clear_tags(paths: &PipePaths, job: &str) {
    for tag in [
        paths.running_tag(job),
        paths.finished_tag(job),
        paths.failed_tag(job),
        paths.exit_tag(job),
    ] {
        let _ = std::fs::remove_file(tag);
    }
}
