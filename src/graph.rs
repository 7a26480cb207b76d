//! Dependency graph construction and validation.
//!
//! There is an edge `B → A` iff `files_in(A)` intersects
//! `files_out(B) ∪ files_clean(B)`; the files that induced each edge are
//! retained so the restart planner can detect missing parent outputs.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{Result, bail};

use crate::job::Pipeline;

/// Adjacency representation of the job DAG, indexed by pipeline order.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    /// `children[b]` lists every `a` with an edge `b → a`, ascending.
    pub children: Vec<Vec<usize>>,
    /// `parents[a]` lists every `b` with an edge `b → a`, ascending.
    pub parents: Vec<Vec<usize>>,
    /// Files shared along each `(parent, child)` edge.
    pub edge_files: BTreeMap<(usize, usize), BTreeSet<PathBuf>>,
}

impl DepGraph {
    /// Invert producers (`files_out ∪ files_clean`) into a path index,
    /// then wire every consumer to its producers. Duplicate edges are
    /// coalesced and their file sets unioned.
    pub fn build(pipeline: &Pipeline) -> DepGraph {
        let n = pipeline.len();
        let mut graph = DepGraph {
            children: vec![vec![]; n],
            parents: vec![vec![]; n],
            edge_files: BTreeMap::new(),
        };

        // A path may have several producers here (one job's output being
        // another's cleaning target); validation rejects only duplicated
        // *outputs*.
        let mut producer: BTreeMap<&PathBuf, Vec<usize>> = BTreeMap::new();
        for idx in 0..n {
            let spec = pipeline.job(idx);
            for file in spec.files_out.iter().chain(spec.files_clean.iter()) {
                producer.entry(file).or_default().push(idx);
            }
        }

        for consumer in 0..n {
            for file in &pipeline.job(consumer).files_in {
                let Some(sources) = producer.get(file) else {
                    continue;
                };
                for &source in sources {
                    if source == consumer {
                        continue;
                    }
                    match graph.edge_files.entry((source, consumer)) {
                        Entry::Vacant(slot) => {
                            graph.children[source].push(consumer);
                            graph.parents[consumer].push(source);
                            slot.insert(BTreeSet::from([file.clone()]));
                        }
                        Entry::Occupied(mut slot) => {
                            slot.get_mut().insert(file.clone());
                        }
                    }
                }
            }
        }

        for list in graph.children.iter_mut().chain(graph.parents.iter_mut()) {
            list.sort_unstable();
        }
        graph
    }

    /// All descendants of `start` (excluding `start` itself).
    pub fn descendants(&self, start: usize) -> Vec<usize> {
        let mut seen = vec![false; self.children.len()];
        let mut stack = self.children[start].clone();
        let mut out = Vec::new();
        while let Some(node) = stack.pop() {
            if seen[node] {
                continue;
            }
            seen[node] = true;
            out.push(node);
            stack.extend_from_slice(&self.children[node]);
        }
        out.sort_unstable();
        out
    }
}

/// The pipeline contains at least one dependency cycle.
#[derive(Debug)]
pub struct CycleError {
    /// Names of jobs participating in at least one cycle.
    pub jobs: Vec<String>,
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dependency cycle involving: {}", self.jobs.join(", "))
    }
}

impl std::error::Error for CycleError {}

/// Some output path is declared by more than one job.
#[derive(Debug)]
pub struct DuplicateOutputs {
    /// Offending path together with the jobs producing it.
    pub dups: Vec<(PathBuf, Vec<String>)>,
}

impl std::fmt::Display for DuplicateOutputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "outputs produced by more than one job:")?;
        for (path, jobs) in &self.dups {
            write!(f, " {} ({})", path.display(), jobs.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for DuplicateOutputs {}

/// A job declares the same path in both `files_out` and `files_clean`;
/// the ordering of production and cleaning within one job is undefined.
#[derive(Debug)]
pub struct ProduceCleanConflict {
    pub conflicts: Vec<(String, PathBuf)>,
}

impl std::fmt::Display for ProduceCleanConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "jobs both producing and cleaning a path:")?;
        for (job, path) in &self.conflicts {
            write!(f, " {} ({})", job, path.display())?;
        }
        Ok(())
    }
}

impl std::error::Error for ProduceCleanConflict {}

/// Run all structural checks. Fatal on the first failing category; the
/// initializer aborts without touching the logs directory.
pub fn validate(pipeline: &Pipeline, graph: &DepGraph) -> Result<()> {
    let cyclic = cycle_members(graph);
    if !cyclic.is_empty() {
        bail!(CycleError {
            jobs: cyclic
                .into_iter()
                .map(|i| pipeline.name(i).to_string())
                .collect(),
        });
    }

    let dups = duplicate_outputs(pipeline);
    if !dups.is_empty() {
        bail!(DuplicateOutputs { dups });
    }

    let conflicts = produce_clean_conflicts(pipeline);
    if !conflicts.is_empty() {
        bail!(ProduceCleanConflict { conflicts });
    }

    Ok(())
}

/// DFS with gray/black coloring; every node on the gray stack when a
/// back edge is found belongs to a cycle.
fn cycle_members(graph: &DepGraph) -> Vec<usize> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    fn dfs(
        node: usize,
        graph: &DepGraph,
        color: &mut [u8],
        stack: &mut Vec<usize>,
        cyclic: &mut [bool],
    ) {
        color[node] = GRAY;
        stack.push(node);
        for &next in &graph.children[node] {
            if color[next] == WHITE {
                dfs(next, graph, color, stack, cyclic);
            } else if color[next] == GRAY {
                let pos = stack
                    .iter()
                    .position(|&x| x == next)
                    .unwrap_or(stack.len() - 1);
                for &member in &stack[pos..] {
                    cyclic[member] = true;
                }
            }
        }
        stack.pop();
        color[node] = BLACK;
    }

    let n = graph.children.len();
    let mut color = vec![WHITE; n];
    let mut cyclic = vec![false; n];
    let mut stack = Vec::new();
    for node in 0..n {
        if color[node] == WHITE {
            dfs(node, graph, &mut color, &mut stack, &mut cyclic);
        }
    }
    (0..n).filter(|&i| cyclic[i]).collect()
}

fn duplicate_outputs(pipeline: &Pipeline) -> Vec<(PathBuf, Vec<String>)> {
    let mut producers: BTreeMap<&PathBuf, Vec<&str>> = BTreeMap::new();
    for (name, spec) in pipeline.iter() {
        for file in &spec.files_out {
            producers.entry(file).or_default().push(name);
        }
    }
    producers
        .into_iter()
        .filter(|(_, jobs)| jobs.len() >= 2)
        .map(|(path, jobs)| {
            (
                path.clone(),
                jobs.into_iter().map(str::to_string).collect(),
            )
        })
        .collect()
}

fn produce_clean_conflicts(pipeline: &Pipeline) -> Vec<(String, PathBuf)> {
    let mut conflicts = Vec::new();
    for (name, spec) in pipeline.iter() {
        for file in spec.files_out.intersection(&spec.files_clean) {
            conflicts.push((name.to_string(), file.clone()));
        }
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use std::path::Path;

    fn job(command: &str, files_in: &[&str], files_out: &[&str]) -> JobSpec {
        JobSpec {
            command: command.to_string(),
            files_in: files_in.iter().map(PathBuf::from).collect(),
            files_out: files_out.iter().map(PathBuf::from).collect(),
            ..Default::default()
        }
    }

    fn diamond() -> Pipeline {
        Pipeline::from_named([
            ("a".to_string(), job("gen", &[], &["/t/a.out"])),
            ("b".to_string(), job("use", &["/t/a.out"], &["/t/b.out"])),
            ("c".to_string(), job("use", &["/t/a.out"], &["/t/c.out"])),
            (
                "d".to_string(),
                job("join", &["/t/b.out", "/t/c.out"], &["/t/d.out"]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn diamond_edges_and_files() {
        let p = diamond();
        let g = DepGraph::build(&p);
        assert_eq!(g.children[0], [1, 2]);
        assert_eq!(g.children[1], [3]);
        assert_eq!(g.children[2], [3]);
        assert_eq!(g.parents[3], [1, 2]);
        assert!(
            g.edge_files[&(0, 1)].contains(Path::new("/t/a.out")),
            "edge files must record the inducing path"
        );
        assert!(g.edge_files[&(1, 3)].contains(Path::new("/t/b.out")));
        assert!(validate(&p, &g).is_ok());
    }

    #[test]
    fn descendants_are_transitive() {
        let p = diamond();
        let g = DepGraph::build(&p);
        assert_eq!(g.descendants(0), [1, 2, 3]);
        assert_eq!(g.descendants(1), [3]);
        assert!(g.descendants(3).is_empty());
    }

    #[test]
    fn cycle_is_fatal_and_names_members() {
        let p = Pipeline::from_named([
            ("a".to_string(), job("x", &["/t/c.out"], &["/t/a.out"])),
            ("b".to_string(), job("x", &["/t/a.out"], &["/t/b.out"])),
            ("c".to_string(), job("x", &["/t/b.out"], &["/t/c.out"])),
            ("free".to_string(), job("x", &[], &["/t/free.out"])),
        ])
        .unwrap();
        let g = DepGraph::build(&p);
        let err = validate(&p, &g).unwrap_err();
        let cycle = err.downcast_ref::<CycleError>().expect("cycle error");
        assert_eq!(cycle.jobs, ["a", "b", "c"]);
    }

    #[test]
    fn duplicate_output_is_fatal() {
        let p = Pipeline::from_named([
            ("a".to_string(), job("x", &[], &["/t/same.out"])),
            ("b".to_string(), job("x", &[], &["/t/same.out"])),
        ])
        .unwrap();
        let g = DepGraph::build(&p);
        let err = validate(&p, &g).unwrap_err();
        let dup = err.downcast_ref::<DuplicateOutputs>().expect("dup error");
        assert_eq!(dup.dups.len(), 1);
        assert_eq!(dup.dups[0].1, ["a", "b"]);
    }

    #[test]
    fn cleaner_edge_is_built_and_not_flagged_as_duplicate() {
        // producer writes shared.out, cleaner deletes it, consumer reads it:
        // consumer depends on both, and the validator stays quiet.
        let mut cleaner = job("rm", &[], &[]);
        cleaner.files_clean.insert(PathBuf::from("/t/shared.out"));
        let p = Pipeline::from_named([
            ("producer".to_string(), job("x", &[], &["/t/shared.out"])),
            ("cleaner".to_string(), cleaner),
            (
                "consumer".to_string(),
                job("x", &["/t/shared.out"], &["/t/final.out"]),
            ),
        ])
        .unwrap();
        let g = DepGraph::build(&p);
        assert_eq!(g.parents[2], [0, 1], "consumer depends on producer and cleaner");
        assert!(validate(&p, &g).is_ok());
    }

    #[test]
    fn produce_and_clean_same_path_is_rejected() {
        let mut spec = job("x", &[], &["/t/f.out"]);
        spec.files_clean.insert(PathBuf::from("/t/f.out"));
        let p = Pipeline::from_named([("a".to_string(), spec)]).unwrap();
        let g = DepGraph::build(&p);
        let err = validate(&p, &g).unwrap_err();
        assert!(err.downcast_ref::<ProduceCleanConflict>().is_some());
    }

    #[test]
    fn no_edges_means_no_parents() {
        let p = Pipeline::from_named([
            ("a".to_string(), job("x", &[], &[])),
            ("b".to_string(), job("x", &[], &[])),
        ])
        .unwrap();
        let g = DepGraph::build(&p);
        assert!(g.children.iter().all(Vec::is_empty));
        assert!(g.edge_files.is_empty());
    }
}
