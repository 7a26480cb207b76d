//! The execution supervisor.
//!
//! Single-threaded cooperative loop over a prepared plan: keep a
//! bounded set of ready jobs in flight across the configured backend,
//! observe their tag files, fold per-job logs and profiles into the
//! aggregate stores, and cascade failure to descendants. Parallelism
//! lives entirely in backend processes; the only shared state is the
//! logs directory.
//!
//! Tick order is fixed: persist, poll, cool-down, transitions, submit,
//! sleep. Edge clearing for newly finished jobs is applied after the
//! submission step, so a job observed finished in tick `t` has its
//! descendants eligible starting tick `t+1`, never within the same
//! tick.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::config::RunOptions;
use crate::backend::Backend;
use crate::paths::PipePaths;
use crate::runner;
use crate::status::{self, JobStatus};
use crate::store::{JobProfile, StateStore, StatusMap, append_history};

/// Outcome counts of one supervisor run, over the current pipeline's
/// job universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub finished: usize,
    pub failed: usize,
    /// Jobs left unexecuted: pruned below a failure, or still pending
    /// when the lock disappeared.
    pub blocked: usize,
}

/// Scoped ownership of `PIPE.lock`. The file is the single-writer
/// guarantee for a logs directory and doubles as the cancellation
/// channel: the operator deletes it, the supervisor notices and drains
/// no further jobs. Dropped on every exit path, including unwind.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(paths: &PipePaths, run_id: &str) -> Result<Self> {
        let path = paths.lock();
        if path.exists() {
            bail!(
                "lock file {} exists; another supervisor owns this pipeline \
                 (remove the file if that run is gone)",
                path.display()
            );
        }
        let meta = serde_json::json!({
            "run_id": run_id,
            "pid": std::process::id(),
            "started_at": runner::now_rfc3339(),
        });
        std::fs::write(&path, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("create lock file {}", path.display()))?;
        Ok(LockGuard { path })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Run the supervisor loop until the pipeline drains or the lock file
/// disappears. Expects an initialized logs directory.
pub fn run(paths: &PipePaths, opts: &RunOptions) -> Result<RunReport> {
    let store = StateStore::new(paths);
    let mut record = store.load_pipe().context("load pipeline record")?;
    let jobs = store.load_jobs()?;
    let mut status = store.load_status()?;
    let mut logs = store.load_logs()?;
    let mut profile = store.load_profile()?;

    let names = record.jobs.clone();
    let n = names.len();
    let children = record.children.clone();
    let mut indeg = vec![0usize; n];
    for list in &children {
        for &child in list {
            indeg[child] += 1;
        }
    }

    let backend = Backend {
        mode: opts.mode,
        paths,
        qsub_options: &opts.qsub_options,
        shell_options: &opts.shell_options,
        runner_prelude: &opts.runner_prelude,
        command_runner: record.command_runner.as_deref(),
        path_search: record.path_search.as_deref(),
    };

    // Partition the universe. Jobs already finished release their
    // out-edges up front; everything else is work to do.
    let mut todo: BTreeSet<usize> = BTreeSet::new();
    let mut running: BTreeSet<usize> = BTreeSet::new();
    let mut done: BTreeSet<usize> = BTreeSet::new();
    for idx in 0..n {
        let st = status.get(&names[idx]).copied().unwrap_or(JobStatus::None);
        if st == JobStatus::Finished {
            done.insert(idx);
            for &child in &children[idx] {
                indeg[child] -= 1;
            }
        } else {
            todo.insert(idx);
        }
    }

    let run_id = ulid::Ulid::new().to_string();
    let _lock = LockGuard::acquire(paths, &run_id)?;
    info!(
        run_id = %run_id,
        mode = opts.mode.as_str(),
        todo = todo.len(),
        "supervisor started"
    );

    let mut queued = 0usize;
    let mut interrupted = false;

    while !todo.is_empty() || !running.is_empty() {
        if !paths.lock().exists() {
            warn!("lock file removed; interrupting after this point");
            interrupted = true;
            break;
        }

        // 1. persist
        store.save_jobs(&jobs)?;
        store.save_status(&status)?;
        store.save_logs(&logs)?;
        store.save_profile(&profile)?;

        // 2. poll running jobs
        let mut transitions: Vec<(usize, JobStatus)> = Vec::new();
        for &idx in &running {
            let name = &names[idx];
            match status::probe_tags(paths, name) {
                Some(st) if st.is_terminal() => transitions.push((idx, st)),
                Some(JobStatus::Running) => {
                    if status.get(name).copied() == Some(JobStatus::Submitted) {
                        debug!(job = %name, "running tag observed");
                        status.insert(name.clone(), JobStatus::Running);
                    }
                }
                _ => {}
            }
        }

        // 3. cool-down before log ingestion
        if !transitions.is_empty() && !opts.time_cool_down.is_zero() {
            std::thread::sleep(opts.time_cool_down);
        }

        // 4. transition handling
        let mut cleared: Vec<usize> = Vec::new();
        for (idx, observed) in transitions {
            let name = names[idx].clone();
            let terminal = match observed {
                JobStatus::Exit => {
                    warn!(job = %name, "terminated without an outcome tag");
                    JobStatus::Failed
                }
                other => other,
            };
            status.insert(name.clone(), terminal);
            logs.insert(name.clone(), status::harvest_log(paths, &name));
            if let Some(p) = read_profile(paths, &name) {
                profile.insert(name.clone(), p);
            }

            status::clear_tags(paths, &name);
            let keep_script = opts.flag_debug && terminal == JobStatus::Failed;
            if !keep_script {
                let _ = std::fs::remove_file(paths.job_script(&name));
            }

            queued -= 1;
            running.remove(&idx);
            done.insert(idx);

            match terminal {
                JobStatus::Failed => {
                    let pruned = prune_descendants(&children, idx, &mut todo);
                    if pruned > 0 {
                        warn!(job = %name, pruned, "failure removed descendants from the queue");
                    }
                    info!(job = %name, "job failed");
                }
                JobStatus::Finished => {
                    info!(job = %name, "job finished");
                    cleared.push(idx);
                }
                _ => unreachable!("terminal transition"),
            }
        }

        // 5. submit ready jobs, ties broken by pipeline order
        while queued < opts.max_queued {
            let Some(next) = todo.iter().copied().find(|&idx| indeg[idx] == 0) else {
                break;
            };
            let name = names[next].clone();
            status.insert(name.clone(), JobStatus::Submitted);
            todo.remove(&next);
            running.insert(next);
            queued += 1;
            debug!(job = %name, "submitting");
            backend.submit(&name)?;
        }

        // edges of jobs finished this tick release only now, making
        // their descendants eligible from the next tick onward
        for idx in cleared {
            for &child in &children[idx] {
                indeg[child] -= 1;
            }
        }

        // 6. sleep until the next tick
        if !opts.time_between_checks.is_zero() {
            std::thread::sleep(opts.time_between_checks);
        }
    }

    // final persistence so the tail of the run survives a restart
    store.save_jobs(&jobs)?;
    store.save_status(&status)?;
    store.save_logs(&logs)?;
    store.save_profile(&profile)?;

    let report = report_counts(&names, &status);
    let line = format!(
        "{}\t{}\trun mode={} finished={} failed={} blocked={}{}",
        runner::now_rfc3339(),
        run_id,
        opts.mode.as_str(),
        report.finished,
        report.failed,
        report.blocked,
        if interrupted { " (interrupted)" } else { "" },
    );
    append_history(paths, &mut record, line)?;
    store.save_pipe(&record)?;

    if opts.flag_verbose {
        info!(
            finished = report.finished,
            failed = report.failed,
            blocked = report.blocked,
            interrupted,
            "supervisor done"
        );
    }
    Ok(report)
}

/// Write the manager script and relaunch the supervisor as a detached
/// process, returning immediately. Progress is observable through the
/// state stores and `PIPE_history.txt`.
pub fn spawn_detached(paths: &PipePaths, opts: &RunOptions) -> Result<()> {
    use std::fmt::Write as _;

    let exe = std::env::current_exe().context("resolve current exe")?;
    let mut script = String::from("#!/bin/sh\n");
    write!(
        script,
        "'{}' run --logs '{}' --mode {} --max-queued {} --poll-ms {} --cool-down-ms {}",
        exe.display(),
        paths.logs_dir().display(),
        opts.mode.as_str(),
        opts.max_queued,
        opts.time_between_checks.as_millis(),
        opts.time_cool_down.as_millis(),
    )?;
    if !opts.qsub_options.is_empty() {
        write!(script, " --qsub-options '{}'", opts.qsub_options)?;
    }
    if !opts.shell_options.is_empty() {
        write!(script, " --shell-options '{}'", opts.shell_options)?;
    }
    if !opts.runner_prelude.is_empty() {
        write!(script, " --runner-prelude '{}'", opts.runner_prelude)?;
    }
    if opts.flag_debug {
        script.push_str(" --debug");
    }
    script.push_str(" > /dev/null 2>&1\n");

    std::fs::create_dir_all(paths.tmp_dir())
        .with_context(|| format!("create {}", paths.tmp_dir().display()))?;
    let path = paths.manager_script();
    std::fs::write(&path, script)
        .with_context(|| format!("write manager script {}", path.display()))?;

    let child = std::process::Command::new("sh")
        .arg(&path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("spawn detached supervisor")?;
    info!(pid = child.id(), "supervisor detached");
    Ok(())
}

fn read_profile(paths: &PipePaths, job: &str) -> Option<JobProfile> {
    let raw = std::fs::read(paths.job_profile(job)).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Remove every transitive descendant of `start` from `todo`; returns
/// how many were pruned.
fn prune_descendants(
    children: &[Vec<usize>],
    start: usize,
    todo: &mut BTreeSet<usize>,
) -> usize {
    let mut pruned = 0;
    let mut seen = vec![false; children.len()];
    let mut stack = children[start].clone();
    while let Some(node) = stack.pop() {
        if seen[node] {
            continue;
        }
        seen[node] = true;
        if todo.remove(&node) {
            pruned += 1;
        }
        stack.extend_from_slice(&children[node]);
    }
    pruned
}

fn report_counts(names: &[String], status: &StatusMap) -> RunReport {
    let mut report = RunReport {
        finished: 0,
        failed: 0,
        blocked: 0,
    };
    for name in names {
        match status.get(name).copied().unwrap_or(JobStatus::None) {
            JobStatus::Finished => report.finished += 1,
            JobStatus::Failed | JobStatus::Exit => report.failed += 1,
            _ => report.blocked += 1,
        }
    }
    report
}
