//! Incremental restart planning.
//!
//! Given the current pipeline, the persisted description of a previous
//! run, and user overrides, compute the minimal-but-sufficient set of
//! jobs to re-execute so that every requested output ends up fresh and
//! internally consistent. The closure propagates forward (children of
//! restarted jobs) and backward (producers of missing files anywhere in
//! a restarted job's ancestry), iterating to fixpoint; monotonicity over
//! a finite job set guarantees termination.

use tracing::debug;

use crate::graph::DepGraph;
use crate::job::Pipeline;
use crate::paths::PipePaths;
use crate::status::{self, JobStatus};
use crate::store::{JobsMap, LogsMap, StatusMap};

/// User-controlled planning inputs.
#[derive(Debug, Default)]
pub struct PlanOptions<'a> {
    /// Case-sensitive substrings; any job whose name contains one is
    /// force-restarted.
    pub restart: &'a [String],
    /// Enable descriptor-diff-driven restart.
    pub flag_update: bool,
}

/// Result of planning: the restart mask over pipeline indices and the
/// normalized status/log assignment for the current job universe.
#[derive(Debug)]
pub struct Plan {
    pub restart: Vec<bool>,
    pub status: StatusMap,
    pub logs: LogsMap,
}

impl Plan {
    pub fn restart_names<'p>(&self, pipeline: &'p Pipeline) -> Vec<&'p str> {
        (0..pipeline.len())
            .filter(|&i| self.restart[i])
            .map(|i| pipeline.name(i))
            .collect()
    }

    pub fn restart_count(&self) -> usize {
        self.restart.iter().filter(|&&r| r).count()
    }
}

pub fn plan(
    pipeline: &Pipeline,
    graph: &DepGraph,
    paths: &PipePaths,
    prior_jobs: &JobsMap,
    prior_status: &StatusMap,
    prior_logs: &LogsMap,
    opts: &PlanOptions,
) -> Plan {
    let n = pipeline.len();

    // Phase A: normalize the persisted status of jobs interrupted
    // mid-flight against the on-disk tags, harvesting the log of any job
    // that actually completed after the previous supervisor went away.
    let mut normalized = Vec::with_capacity(n);
    let mut harvested: Vec<Option<String>> = vec![None; n];
    for idx in 0..n {
        let name = pipeline.name(idx);
        let prior = prior_status
            .get(name)
            .copied()
            .unwrap_or(JobStatus::None);
        let current = match prior {
            JobStatus::Submitted | JobStatus::Running => {
                if paths.finished_tag(name).exists() {
                    harvested[idx] = Some(status::harvest_log(paths, name));
                    debug!(job = name, "interrupted job completed after the fact");
                    JobStatus::Finished
                } else {
                    debug!(job = name, "interrupted job reverted to none");
                    JobStatus::None
                }
            }
            other => other,
        };
        normalized.push(current);
    }

    // Phase B: seed the restart set.
    let mut restart = vec![false; n];
    for idx in 0..n {
        let name = pipeline.name(idx);
        let reason = seed_reason(name, normalized[idx], pipeline.job(idx), prior_jobs, opts);
        if let Some(reason) = reason {
            restart[idx] = true;
            debug!(job = name, reason, "seeded for restart");
        }
    }

    // Phase C: closure to fixpoint. Forward: descendants of restarted
    // jobs. Backward: anywhere in a restarted job's ancestry, a producer
    // whose edge files are no longer on disk must run again.
    loop {
        let mut changed = false;

        for job in 0..n {
            if !restart[job] {
                continue;
            }
            for &child in &graph.children[job] {
                if !restart[child] {
                    restart[child] = true;
                    changed = true;
                    debug!(
                        job = pipeline.name(child),
                        ancestor = pipeline.name(job),
                        "restarted as descendant"
                    );
                }
            }
        }

        // Jobs whose upstream chain must be intact: the restarted jobs
        // and all of their ancestors.
        let mut needed = restart.clone();
        let mut stack: Vec<usize> = (0..n).filter(|&i| restart[i]).collect();
        while let Some(job) = stack.pop() {
            for &parent in &graph.parents[job] {
                if !needed[parent] {
                    needed[parent] = true;
                    stack.push(parent);
                }
            }
        }

        for job in 0..n {
            if !needed[job] {
                continue;
            }
            for &parent in &graph.parents[job] {
                if restart[parent] {
                    // already regenerating its outputs
                    continue;
                }
                let files = &graph.edge_files[&(parent, job)];
                if let Some(missing) = files.iter().find(|f| !f.exists()) {
                    restart[parent] = true;
                    changed = true;
                    debug!(
                        job = pipeline.name(parent),
                        file = %missing.display(),
                        "restarted to regenerate a missing file"
                    );
                }
            }
        }

        if !changed {
            break;
        }
    }

    // Phase D: final status assignment. Only an unrestarted finished job
    // keeps its status and log; everything else reverts to none with a
    // blank log.
    let mut status = StatusMap::new();
    let mut logs = LogsMap::new();
    for idx in 0..n {
        let name = pipeline.name(idx);
        if normalized[idx] == JobStatus::Finished && !restart[idx] {
            status.insert(name.to_string(), JobStatus::Finished);
            let log = harvested[idx]
                .take()
                .or_else(|| prior_logs.get(name).cloned())
                .unwrap_or_default();
            logs.insert(name.to_string(), log);
        } else {
            status.insert(name.to_string(), JobStatus::None);
            logs.insert(name.to_string(), String::new());
        }
    }

    Plan {
        restart,
        status,
        logs,
    }
}

fn seed_reason(
    name: &str,
    normalized: JobStatus,
    spec: &crate::job::JobSpec,
    prior_jobs: &JobsMap,
    opts: &PlanOptions,
) -> Option<&'static str> {
    if matches!(
        normalized,
        JobStatus::None | JobStatus::Failed | JobStatus::Submitted | JobStatus::Exit
    ) {
        return Some("status");
    }
    if opts.restart.iter().any(|sub| name.contains(sub.as_str())) {
        return Some("user request");
    }
    if opts.flag_update {
        match prior_jobs.get(name) {
            None => return Some("new job"),
            Some(old) if !old.same_as(spec) => return Some("descriptor changed"),
            Some(_) => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        paths: PipePaths,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().to_path_buf();
            let paths = PipePaths::new(tmp.path().join("logs"));
            std::fs::create_dir_all(paths.logs_dir()).unwrap();
            Fixture {
                _tmp: tmp,
                root,
                paths,
            }
        }

        fn out(&self, name: &str) -> String {
            self.root.join(name).to_string_lossy().into_owned()
        }

        fn touch(&self, name: &str) {
            std::fs::write(self.root.join(name), b"data").unwrap();
        }

        /// A diamond: a → {b, c} → d, with outputs under the fixture root.
        fn diamond(&self) -> (Pipeline, DepGraph) {
            let job = |files_in: &[String], files_out: &[String]| JobSpec {
                command: "true".to_string(),
                files_in: files_in.iter().map(PathBuf::from).collect(),
                files_out: files_out.iter().map(PathBuf::from).collect(),
                ..Default::default()
            };
            let (a, b, c, d) = (
                self.out("a.out"),
                self.out("b.out"),
                self.out("c.out"),
                self.out("d.out"),
            );
            let pipeline = Pipeline::from_named([
                ("a".to_string(), job(&[], &[a.clone()])),
                ("b".to_string(), job(&[a.clone()], &[b.clone()])),
                ("c".to_string(), job(&[a.clone()], &[c.clone()])),
                ("d".to_string(), job(&[b.clone(), c.clone()], &[d.clone()])),
            ])
            .unwrap();
            let graph = DepGraph::build(&pipeline);
            (pipeline, graph)
        }
    }

    fn all_finished(pipeline: &Pipeline) -> StatusMap {
        pipeline
            .iter()
            .map(|(name, _)| (name.to_string(), JobStatus::Finished))
            .collect()
    }

    fn descriptors(pipeline: &Pipeline) -> JobsMap {
        pipeline
            .iter()
            .map(|(name, spec)| (name.to_string(), spec.clone()))
            .collect()
    }

    #[test]
    fn fresh_pipeline_restarts_everything() {
        let fx = Fixture::new();
        let (pipeline, graph) = fx.diamond();
        let plan = plan(
            &pipeline,
            &graph,
            &fx.paths,
            &JobsMap::new(),
            &StatusMap::new(),
            &LogsMap::new(),
            &PlanOptions {
                restart: &[],
                flag_update: true,
            },
        );
        assert_eq!(plan.restart, [true, true, true, true]);
        assert!(plan.status.values().all(|&s| s == JobStatus::None));
    }

    #[test]
    fn unchanged_rerun_restarts_nothing() {
        let fx = Fixture::new();
        let (pipeline, graph) = fx.diamond();
        for f in ["a.out", "b.out", "c.out", "d.out"] {
            fx.touch(f);
        }
        let prior_logs: LogsMap = pipeline
            .iter()
            .map(|(name, _)| (name.to_string(), format!("{name} ran fine\n")))
            .collect();
        let run = || {
            plan(
                &pipeline,
                &graph,
                &fx.paths,
                &descriptors(&pipeline),
                &all_finished(&pipeline),
                &prior_logs,
                &PlanOptions {
                    restart: &[],
                    flag_update: true,
                },
            )
        };
        let first = run();
        assert_eq!(first.restart_count(), 0);
        assert!(first.status.values().all(|&s| s == JobStatus::Finished));
        assert_eq!(first.logs["b"], "b ran fine\n", "logs preserved");

        // planning twice yields the identical status map
        let second = run();
        assert_eq!(first.status, second.status);
    }

    #[test]
    fn descriptor_change_restarts_job_and_descendants() {
        let fx = Fixture::new();
        let (pipeline, graph) = fx.diamond();
        for f in ["a.out", "b.out", "c.out", "d.out"] {
            fx.touch(f);
        }
        let mut prior = descriptors(&pipeline);
        prior.get_mut("b").unwrap().command = "old command".to_string();

        let plan = plan(
            &pipeline,
            &graph,
            &fx.paths,
            &prior,
            &all_finished(&pipeline),
            &LogsMap::new(),
            &PlanOptions {
                restart: &[],
                flag_update: true,
            },
        );
        assert_eq!(plan.restart, [false, true, false, true], "b and d only");
        assert_eq!(plan.status["a"], JobStatus::Finished);
        assert_eq!(plan.status["c"], JobStatus::Finished);
        assert_eq!(plan.status["b"], JobStatus::None);
        assert_eq!(plan.status["d"], JobStatus::None);
    }

    #[test]
    fn descriptor_change_ignored_without_flag_update() {
        let fx = Fixture::new();
        let (pipeline, graph) = fx.diamond();
        for f in ["a.out", "b.out", "c.out", "d.out"] {
            fx.touch(f);
        }
        let mut prior = descriptors(&pipeline);
        prior.get_mut("b").unwrap().command = "old command".to_string();

        let plan = plan(
            &pipeline,
            &graph,
            &fx.paths,
            &prior,
            &all_finished(&pipeline),
            &LogsMap::new(),
            &PlanOptions {
                restart: &[],
                flag_update: false,
            },
        );
        assert_eq!(plan.restart_count(), 0);
    }

    #[test]
    fn missing_intermediate_restarts_ancestor_chain() {
        let fx = Fixture::new();
        let (pipeline, graph) = fx.diamond();
        // a.out was deleted by the user; everything else is in place.
        for f in ["b.out", "c.out", "d.out"] {
            fx.touch(f);
        }
        let forced = vec!["d".to_string()];
        let plan = plan(
            &pipeline,
            &graph,
            &fx.paths,
            &descriptors(&pipeline),
            &all_finished(&pipeline),
            &LogsMap::new(),
            &PlanOptions {
                restart: &forced,
                flag_update: true,
            },
        );
        assert_eq!(
            plan.restart,
            [true, true, true, true],
            "ancestor closure pulls in a, then re-descends through b and c"
        );
    }

    #[test]
    fn restart_substrings_are_case_sensitive() {
        let fx = Fixture::new();
        let (pipeline, graph) = fx.diamond();
        for f in ["a.out", "b.out", "c.out", "d.out"] {
            fx.touch(f);
        }
        let forced = vec!["D".to_string()];
        let plan = plan(
            &pipeline,
            &graph,
            &fx.paths,
            &descriptors(&pipeline),
            &all_finished(&pipeline),
            &LogsMap::new(),
            &PlanOptions {
                restart: &forced,
                flag_update: true,
            },
        );
        assert_eq!(plan.restart_count(), 0, "\"D\" does not match job \"d\"");
    }

    #[test]
    fn interrupted_job_promoted_by_finished_tag() {
        let fx = Fixture::new();
        let (pipeline, graph) = fx.diamond();
        for f in ["a.out", "b.out", "c.out", "d.out"] {
            fx.touch(f);
        }
        let mut prior_status = all_finished(&pipeline);
        prior_status.insert("d".to_string(), JobStatus::Running);
        std::fs::write(fx.paths.finished_tag("d"), b"").unwrap();
        std::fs::write(fx.paths.job_log("d"), "late but done\n").unwrap();

        let plan = plan(
            &pipeline,
            &graph,
            &fx.paths,
            &descriptors(&pipeline),
            &prior_status,
            &LogsMap::new(),
            &PlanOptions {
                restart: &[],
                flag_update: true,
            },
        );
        assert_eq!(plan.restart_count(), 0);
        assert_eq!(plan.status["d"], JobStatus::Finished);
        assert_eq!(plan.logs["d"], "late but done\n");
    }

    #[test]
    fn interrupted_job_without_tag_reverts_and_restarts() {
        let fx = Fixture::new();
        let (pipeline, graph) = fx.diamond();
        for f in ["a.out", "b.out", "c.out", "d.out"] {
            fx.touch(f);
        }
        let mut prior_status = all_finished(&pipeline);
        prior_status.insert("b".to_string(), JobStatus::Submitted);

        let plan = plan(
            &pipeline,
            &graph,
            &fx.paths,
            &descriptors(&pipeline),
            &prior_status,
            &LogsMap::new(),
            &PlanOptions {
                restart: &[],
                flag_update: true,
            },
        );
        // b reverts to none and restarts, dragging d with it
        assert_eq!(plan.restart, [false, true, false, true]);
    }

    #[test]
    fn failed_job_restarts_with_descendants() {
        let fx = Fixture::new();
        let (pipeline, graph) = fx.diamond();
        for f in ["a.out", "b.out", "c.out", "d.out"] {
            fx.touch(f);
        }
        let mut prior_status = all_finished(&pipeline);
        prior_status.insert("c".to_string(), JobStatus::Failed);

        let plan = plan(
            &pipeline,
            &graph,
            &fx.paths,
            &descriptors(&pipeline),
            &prior_status,
            &LogsMap::new(),
            &PlanOptions {
                restart: &[],
                flag_update: true,
            },
        );
        assert_eq!(plan.restart, [false, false, true, true]);
    }

    #[test]
    fn blanked_log_for_restarted_jobs() {
        let fx = Fixture::new();
        let (pipeline, graph) = fx.diamond();
        for f in ["a.out", "b.out", "c.out", "d.out"] {
            fx.touch(f);
        }
        let mut prior_status = all_finished(&pipeline);
        prior_status.insert("d".to_string(), JobStatus::Failed);
        let prior_logs: LogsMap =
            BTreeMap::from([("d".to_string(), "stale failure output".to_string())]);

        let plan = plan(
            &pipeline,
            &graph,
            &fx.paths,
            &descriptors(&pipeline),
            &prior_status,
            &prior_logs,
            &PlanOptions {
                restart: &[],
                flag_update: true,
            },
        );
        assert_eq!(plan.logs["d"], "");
    }

    #[test]
    fn source_job_never_restarted_by_ancestor_rule() {
        let fx = Fixture::new();
        // lone source and an unrelated consumer chain; source finished,
        // consumer forced. The source has no parents and must stay put.
        let src_out = fx.out("src.out");
        let sink_out = fx.out("sink.out");
        fx.touch("src.out");
        let pipeline = Pipeline::from_named([
            (
                "src".to_string(),
                JobSpec {
                    command: "true".to_string(),
                    files_out: [PathBuf::from(&src_out)].into_iter().collect(),
                    ..Default::default()
                },
            ),
            (
                "sink".to_string(),
                JobSpec {
                    command: "true".to_string(),
                    files_in: [PathBuf::from(&src_out)].into_iter().collect(),
                    files_out: [PathBuf::from(&sink_out)].into_iter().collect(),
                    ..Default::default()
                },
            ),
        ])
        .unwrap();
        let graph = DepGraph::build(&pipeline);
        let forced = vec!["sink".to_string()];
        let plan = plan(
            &pipeline,
            &graph,
            &fx.paths,
            &descriptors(&pipeline),
            &all_finished(&pipeline),
            &LogsMap::new(),
            &PlanOptions {
                restart: &forced,
                flag_update: true,
            },
        );
        assert_eq!(plan.restart, [false, true], "src.out exists, src stays");
        assert_eq!(Path::new(&src_out).exists(), true);
    }
}
