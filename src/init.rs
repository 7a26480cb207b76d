//! Pipeline initialization.
//!
//! Validates the user-declared pipeline, diffs it against the persisted
//! description of a previous run, plans the restart closure, prepares
//! the filesystem, and persists the plan. Structural errors (cycles,
//! duplicated outputs, produce/clean conflicts) abort before anything
//! under the logs directory is touched.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::InitOptions;
use crate::graph::{self, DepGraph};
use crate::job::Pipeline;
use crate::paths::PipePaths;
use crate::planner::{self, PlanOptions};
use crate::prepare::{self, PrepareOptions};
use crate::status::JobStatus;
use crate::store::{
    JobsMap, LogsMap, PipeRecord, ProfileMap, StateStore, StatusMap, append_history, merge_prior,
};

/// Initialize (or re-initialize) a pipeline under `opts.path_logs` and
/// return the canonical path of the persisted `PIPE` record.
pub fn initialize(pipeline: &Pipeline, opts: &InitOptions) -> Result<PathBuf> {
    let graph = DepGraph::build(pipeline);
    graph::validate(pipeline, &graph)?;

    let paths = PipePaths::new(&opts.path_logs);
    let store = StateStore::new(&paths);

    // Prior state, if any; a first run starts from empty maps.
    let (prior_jobs, prior_status, prior_logs, prior_profile) = if store.exists() {
        (
            store.load_jobs()?,
            store.load_status()?,
            store.load_logs()?,
            store.load_profile()?,
        )
    } else {
        (
            JobsMap::new(),
            StatusMap::new(),
            LogsMap::new(),
            ProfileMap::new(),
        )
    };

    let plan = planner::plan(
        pipeline,
        &graph,
        &paths,
        &prior_jobs,
        &prior_status,
        &prior_logs,
        &PlanOptions {
            restart: &opts.restart,
            flag_update: opts.flag_update,
        },
    );
    if opts.flag_verbose {
        info!(
            jobs = pipeline.len(),
            restart = plan.restart_count(),
            "pipeline planned"
        );
    }
    if plan.restart_count() > 0 {
        tracing::debug!(jobs = ?plan.restart_names(pipeline), "restart set");
    }

    prepare::prepare(
        pipeline,
        &graph,
        &paths,
        &plan.status,
        &PrepareOptions {
            flag_clean: opts.flag_clean,
            flag_pause: opts.flag_pause,
        },
    )?;

    // Assemble the four parallel stores over the union of the current
    // and prior job universes; names only the old run knew keep their
    // entries for later resumption of a superset pipeline.
    let mut jobs: JobsMap = pipeline
        .iter()
        .map(|(name, spec)| (name.to_string(), spec.clone()))
        .collect();
    let mut status = plan.status.clone();
    let mut logs = plan.logs.clone();
    let mut profile: ProfileMap = pipeline
        .iter()
        .map(|(name, _)| {
            let kept = plan.status.get(name).copied() == Some(JobStatus::Finished);
            let entry = if kept {
                prior_profile.get(name).cloned().unwrap_or_default()
            } else {
                Default::default()
            };
            (name.to_string(), entry)
        })
        .collect();
    merge_prior(&mut jobs, prior_jobs);
    merge_prior(&mut status, prior_status);
    merge_prior(&mut logs, prior_logs);
    merge_prior(&mut profile, prior_profile);

    store.save_jobs(&jobs)?;
    store.save_status(&status)?;
    store.save_logs(&logs)?;
    store.save_profile(&profile)?;

    let mut record = PipeRecord {
        jobs: pipeline.names().to_vec(),
        children: graph.children.clone(),
        path_logs: opts.path_logs.clone(),
        path_search: opts.path_search.clone(),
        command_runner: opts.command_runner.clone(),
        history: store.load_pipe().map(|r| r.history).unwrap_or_default(),
    };
    let line = format!(
        "{}\t{}\tinit jobs={} restart={}",
        crate::runner::now_rfc3339(),
        ulid::Ulid::new(),
        pipeline.len(),
        plan.restart_count(),
    );
    append_history(&paths, &mut record, line)?;
    store.save_pipe(&record)?;

    let pipe = paths.pipe_main();
    pipe.canonicalize()
        .with_context(|| format!("canonicalize {}", pipe.display()))
}
