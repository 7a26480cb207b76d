//! The run-job entry point.
//!
//! This is the contract the supervisor relies on: on start the runner
//! creates `<job>.running`; on exit it writes exactly one of
//! `<job>.finished` or `<job>.failed`, removes `<job>.running`, and
//! writes `<job>.profile`. A crash that skips these steps manifests
//! only as the wrapper's `<job>.exit` tag and is treated as a failure.
//! A job whose declared outputs are absent after the command returns is
//! marked failed even when the command itself reported success.

use std::io::Write;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::OMITTED;
use crate::paths::PipePaths;
use crate::status::JobStatus;
use crate::store::{JobProfile, StateStore};

/// Execute one job from the jobs store and report the outcome tag that
/// was written. Infrastructure problems (unreadable store, unwritable
/// logs directory) surface as errors; payload failure does not.
pub fn run_job(paths: &PipePaths, job: &str, path_search: Option<&str>) -> Result<JobStatus> {
    let store = StateStore::new(paths);
    let spec = store.load_job(job)?;

    std::fs::write(paths.running_tag(job), b"")
        .with_context(|| format!("create running tag for {job}"))?;

    let started_at = now_rfc3339();
    let clock = std::time::Instant::now();

    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.job_log(job))
        .with_context(|| format!("open log file for {job}"))?;
    let log_err = log.try_clone().context("clone log handle")?;

    info!(job, "running command");
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&spec.command)
        .stdin(std::process::Stdio::null())
        .stdout(log)
        .stderr(log_err);
    if let Some(search) = path_search {
        if search != OMITTED && !search.is_empty() {
            command.env("PATH", prepend_path(search));
        }
    }

    let exit = command
        .status()
        .with_context(|| format!("spawn command for {job}"))?;
    let exit_code = exit.code();
    debug!(job, ?exit_code, "command returned");

    // A clean exit only counts when every declared output materialized.
    let missing: Vec<_> = spec
        .files_out
        .iter()
        .filter(|f| !f.exists())
        .cloned()
        .collect();
    let ok = exit.success() && missing.is_empty();

    if !missing.is_empty() {
        let mut log = std::fs::OpenOptions::new()
            .append(true)
            .open(paths.job_log(job))
            .with_context(|| format!("reopen log file for {job}"))?;
        for file in &missing {
            warn!(job, file = %file.display(), "declared output missing");
            let _ = writeln!(log, "pipeline-manager: declared output missing: {}", file.display());
        }
    }

    let finished_at = now_rfc3339();
    let profile = JobProfile {
        started_at,
        finished_at,
        elapsed_ms: clock.elapsed().as_millis() as u64,
        exit_code,
    };
    let profile_json = serde_json::to_string_pretty(&profile)?;
    std::fs::write(paths.job_profile(job), profile_json)
        .with_context(|| format!("write profile for {job}"))?;

    let status = if ok {
        JobStatus::Finished
    } else {
        JobStatus::Failed
    };
    let tag = if ok {
        paths.finished_tag(job)
    } else {
        paths.failed_tag(job)
    };
    std::fs::write(&tag, b"").with_context(|| format!("write outcome tag for {job}"))?;
    let _ = std::fs::remove_file(paths.running_tag(job));

    info!(job, status = status.as_str(), "job done");
    Ok(status)
}

fn prepend_path(search: &str) -> String {
    match std::env::var("PATH") {
        Ok(existing) if !existing.is_empty() => format!("{search}:{existing}"),
        _ => search.to_string(),
    }
}

pub fn now_rfc3339() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_rfc3339(secs)
}

/// Render a Unix timestamp as `YYYY-MM-DDThh:mm:ssZ`. Profiles and
/// history lines only need second resolution in UTC, which does not
/// justify a date-time crate.
fn format_rfc3339(secs: u64) -> String {
    let (year, month, day) = civil_from_days(secs / 86_400);
    let tod = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        tod / 3_600,
        tod / 60 % 60,
        tod % 60
    )
}

/// Gregorian (year, month, day) for a count of days since 1970-01-01,
/// by decomposing into 400-year eras of 146097 days each. Closed-form,
/// valid for any date this system will ever stamp.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    // rebase so day 0 is 0000-03-01 and leap days land at year end
    let shifted = days + 719_468;
    let era = shifted / 146_097;
    let day_of_era = shifted % 146_097;
    let year_of_era =
        (day_of_era - day_of_era / 1_460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_shifted = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * month_shifted + 2) / 5 + 1;
    let month = if month_shifted < 10 {
        month_shifted + 3
    } else {
        month_shifted - 9
    };
    let mut year = year_of_era + era * 400;
    if month <= 2 {
        year += 1;
    }
    (year, month, day)
}
