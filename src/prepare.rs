//! Filesystem preparation between planning and execution.
//!
//! Creates the directory skeleton the run will write into, removes the
//! stale artifacts of jobs about to re-execute, and purges the per-job
//! remnants of previous runs from the logs directory. Missing inputs
//! are reported but never abort the run on their own; `flag_pause`
//! hands the decision to the operator.

use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::graph::DepGraph;
use crate::job::Pipeline;
use crate::paths::PipePaths;
use crate::status::JobStatus;
use crate::store::StatusMap;

#[derive(Debug, Clone, Copy)]
pub struct PrepareOptions {
    /// Delete prior output files of non-finished jobs.
    pub flag_clean: bool,
    /// Ask the operator before destructive deletes and before starting
    /// with missing inputs.
    pub flag_pause: bool,
}

/// Per-job extensions purged from the logs directory before execution.
const STALE_EXTENSIONS: &[&str] = &[
    "running", "failed", "finished", "exit", "log", "oqsub", "eqsub",
];

pub fn prepare(
    pipeline: &Pipeline,
    graph: &DepGraph,
    paths: &PipePaths,
    status: &StatusMap,
    opts: &PrepareOptions,
) -> Result<()> {
    std::fs::create_dir_all(paths.logs_dir())
        .with_context(|| format!("create logs directory {}", paths.logs_dir().display()))?;

    create_output_dirs(pipeline)?;

    if opts.flag_clean {
        clean_stale_outputs(pipeline, status, opts.flag_pause)?;
    }

    purge_logs_dir(paths)?;

    report_missing_inputs(pipeline, graph, status, opts.flag_pause)?;

    Ok(())
}

/// Create every missing parent directory of declared outputs.
fn create_output_dirs(pipeline: &Pipeline) -> Result<()> {
    let mut dirs: BTreeSet<&Path> = BTreeSet::new();
    for (_, spec) in pipeline.iter() {
        for file in &spec.files_out {
            if let Some(parent) = file.parent() {
                dirs.insert(parent);
            }
        }
    }
    for dir in dirs {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create output directory {}", dir.display()))?;
        }
    }
    Ok(())
}

/// Delete the declared outputs of every job that is not `finished`.
/// Permission problems are downgraded to warnings; a file that cannot
/// be removed will simply be overwritten by the re-run.
fn clean_stale_outputs(
    pipeline: &Pipeline,
    status: &StatusMap,
    flag_pause: bool,
) -> Result<()> {
    let mut targets: Vec<&PathBuf> = Vec::new();
    for (name, spec) in pipeline.iter() {
        let finished = status.get(name).copied() == Some(JobStatus::Finished);
        if finished {
            continue;
        }
        targets.extend(spec.files_out.iter().filter(|f| f.exists()));
    }
    if targets.is_empty() {
        return Ok(());
    }

    if flag_pause
        && !confirm(&format!(
            "About to delete {} stale output file(s). Continue?",
            targets.len()
        ))?
    {
        bail!("aborted by operator before cleaning stale outputs");
    }

    for file in targets {
        match std::fs::remove_file(file) {
            Ok(()) => info!(file = %file.display(), "removed stale output"),
            Err(e) => warn!(file = %file.display(), error = %e, "could not remove stale output"),
        }
    }
    Ok(())
}

/// Remove per-job tag/log remnants and the `tmp/` script directory.
fn purge_logs_dir(paths: &PipePaths) -> Result<()> {
    let entries = std::fs::read_dir(paths.logs_dir())
        .with_context(|| format!("read logs directory {}", paths.logs_dir().display()))?;
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "unreadable logs directory entry; skipping");
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        let stale = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| STALE_EXTENSIONS.contains(&ext));
        if stale {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "could not purge stale file");
            }
        }
    }

    let tmp = paths.tmp_dir();
    if tmp.exists() {
        std::fs::remove_dir_all(&tmp)
            .with_context(|| format!("remove script directory {}", tmp.display()))?;
    }
    Ok(())
}

/// Verify that every external input (one not produced by a pipeline
/// job) of a non-finished job exists on disk.
fn report_missing_inputs(
    pipeline: &Pipeline,
    graph: &DepGraph,
    status: &StatusMap,
    flag_pause: bool,
) -> Result<()> {
    // Files covered by some parent edge are produced within the
    // pipeline; everything else in files_in is expected to pre-exist.
    let mut missing: Vec<(String, PathBuf)> = Vec::new();
    for idx in 0..pipeline.len() {
        let name = pipeline.name(idx);
        if status.get(name).copied() == Some(JobStatus::Finished) {
            continue;
        }
        let produced: BTreeSet<&PathBuf> = graph.parents[idx]
            .iter()
            .flat_map(|&p| graph.edge_files[&(p, idx)].iter())
            .collect();
        for file in &pipeline.job(idx).files_in {
            if !produced.contains(file) && !file.exists() {
                missing.push((name.to_string(), file.clone()));
            }
        }
    }

    if missing.is_empty() {
        return Ok(());
    }
    for (job, file) in &missing {
        warn!(job, file = %file.display(), "input file not found");
    }
    if flag_pause
        && !confirm(&format!(
            "{} input file(s) are missing. Start anyway?",
            missing.len()
        ))?
    {
        bail!("aborted by operator because of missing input files");
    }
    Ok(())
}

/// Ask the operator a yes/no question on the controlling terminal.
fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush().context("flush prompt")?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read operator answer")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "YES"))
}
