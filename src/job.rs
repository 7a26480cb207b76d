//! Job descriptors and the pipeline they form.
//!
//! A pipeline is an ordered list of descriptors plus a name→index map;
//! declaration order is preserved all the way to the scheduler, which
//! breaks ties between ready jobs by it. File lists are sets of absolute
//! paths; wildcard entries and the `omitted` sentinel are dropped at
//! parse time rather than rejected.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::OMITTED;

/// A single job: an opaque command plus its declared file interface.
/// Immutable within a run; compared structurally across runs to decide
/// whether the job must be re-executed.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct JobSpec {
    /// Opaque command string, evaluated by the runner through `sh -c`.
    pub command: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub files_in: BTreeSet<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub files_out: BTreeSet<PathBuf>,
    /// Paths this job deletes during execution; consumers of a cleaned
    /// file depend on the cleaner.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub files_clean: BTreeSet<PathBuf>,
    /// Opaque payload, compared structurally for change detection.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub opt: serde_json::Value,
}

impl JobSpec {
    /// Deep structural equality: command, file sets, and the canonical
    /// byte form of `opt`. Map key order inside `opt` is irrelevant.
    pub fn same_as(&self, other: &JobSpec) -> bool {
        self.command == other.command
            && self.files_in == other.files_in
            && self.files_out == other.files_out
            && self.files_clean == other.files_clean
            && canonical_bytes(&self.opt) == canonical_bytes(&other.opt)
    }
}

/// Emit a deterministic byte sequence for an opaque payload value.
///
/// Scalars, ordered sequences, and maps sorted by key each contribute a
/// framed record, so two payloads are byte-equal iff they are deeply
/// structurally equal regardless of the key order any serializer chose.
pub fn canonical_bytes(value: &serde_json::Value) -> Vec<u8> {
    let mut out = Vec::new();
    walk(value, &mut out);
    out
}

fn walk(value: &serde_json::Value, out: &mut Vec<u8>) {
    use serde_json::Value;
    match value {
        Value::Null => out.push(b'z'),
        Value::Bool(b) => out.extend_from_slice(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            out.push(b'#');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(0);
        }
        Value::String(s) => {
            out.push(b's');
            out.extend_from_slice(&(s.len() as u64).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            out.push(b'[');
            for item in items {
                walk(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                out.push(b'k');
                out.extend_from_slice(&(key.len() as u64).to_le_bytes());
                out.extend_from_slice(key.as_bytes());
                walk(&map[key], out);
            }
            out.push(b'}');
        }
    }
}

/// An ordered set of named jobs. Names are unique, stable across runs,
/// and double as filenames under the logs directory.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    names: Vec<String>,
    jobs: Vec<JobSpec>,
    index: HashMap<String, usize>,
}

impl Pipeline {
    /// Build a pipeline from named descriptors, preserving iteration
    /// order. Rejects empty/unsafe names, duplicate names, and jobs with
    /// no command. File lists are made absolute and stripped of wildcard
    /// and sentinel entries.
    pub fn from_named(entries: impl IntoIterator<Item = (String, JobSpec)>) -> Result<Self> {
        let mut pipeline = Pipeline::default();
        for (name, mut spec) in entries {
            validate_name(&name)?;
            if spec.command.trim().is_empty() {
                bail!("job {name:?} has no command");
            }
            if pipeline.index.contains_key(&name) {
                bail!("duplicate job name {name:?}");
            }
            spec.files_in = sanitize_files(&spec.files_in);
            spec.files_out = sanitize_files(&spec.files_out);
            spec.files_clean = sanitize_files(&spec.files_clean);
            pipeline.index.insert(name.clone(), pipeline.names.len());
            pipeline.names.push(name);
            pipeline.jobs.push(spec);
        }
        Ok(pipeline)
    }

    /// Parse a pipeline description from TOML text.
    ///
    /// ```toml
    /// [jobs.average]
    /// command = "avg data.csv > mean.csv"
    /// files_in = ["data.csv"]
    /// files_out = ["mean.csv"]
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct PipelineFile {
            jobs: IndexMap<String, JobFile>,
        }
        #[derive(Deserialize)]
        struct JobFile {
            command: String,
            #[serde(default)]
            files_in: Vec<String>,
            #[serde(default)]
            files_out: Vec<String>,
            #[serde(default)]
            files_clean: Vec<String>,
            #[serde(default)]
            opt: Option<toml::Value>,
        }

        let file: PipelineFile = toml::from_str(text).context("parse pipeline description")?;
        let entries = file.jobs.into_iter().map(|(name, job)| {
            let opt = match job.opt {
                Some(v) => serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                None => serde_json::Value::Null,
            };
            let to_set = |paths: Vec<String>| paths.into_iter().map(PathBuf::from).collect();
            (
                name,
                JobSpec {
                    command: job.command,
                    files_in: to_set(job.files_in),
                    files_out: to_set(job.files_out),
                    files_clean: to_set(job.files_clean),
                    opt,
                },
            )
        });
        Self::from_named(entries.collect::<Vec<_>>())
    }

    /// Load and parse a pipeline description file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read pipeline file {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    pub fn job(&self, idx: usize) -> &JobSpec {
        &self.jobs[idx]
    }

    pub fn get(&self, name: &str) -> Option<(usize, &JobSpec)> {
        self.index.get(name).map(|&i| (i, &self.jobs[i]))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobSpec)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.jobs.iter())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("job name may not be empty");
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !ok {
        bail!(
            "job name {name:?} contains characters unfit for a filename \
             (allowed: alphanumerics, '_', '-', '.')"
        );
    }
    Ok(())
}

/// Drop wildcard and sentinel entries, make the rest absolute.
fn sanitize_files(files: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
    files
        .iter()
        .filter(|p| {
            let s = p.to_string_lossy();
            s != OMITTED && !s.contains('*') && !s.contains('?')
        })
        .map(|p| absolutize(p))
        .collect()
}

/// Make a path absolute against the current directory without touching
/// the filesystem (outputs usually do not exist yet).
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    }
}
