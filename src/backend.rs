//! Backend adapters: one submit path per execution mode.
//!
//! Every mode speaks the same tag-file protocol; only submission,
//! process lifetime, and stdout/stderr routing differ. Script-based
//! modes run a generated wrapper under `tmp/` that invokes the runner
//! and writes the `.exit` tag no matter how the runner ended.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::config::{Mode, OMITTED};
use crate::paths::PipePaths;
use crate::runner;

/// Cluster queues truncate job names; submit with at most this many
/// characters so the queue-side name stays predictable.
const QSUB_NAME_MAX: usize = 15;

/// A configured submission channel for one supervisor run.
#[derive(Debug)]
pub struct Backend<'a> {
    pub mode: Mode,
    pub paths: &'a PipePaths,
    /// Extra flags for the cluster submission command line.
    pub qsub_options: &'a str,
    /// Shell-options prologue for wrapper scripts.
    pub shell_options: &'a str,
    /// Environment/bootstrap lines before the runner invocation.
    pub runner_prelude: &'a str,
    /// Interpreter invocation; `None` resolves to the current
    /// executable's internal run-job entry.
    pub command_runner: Option<&'a str>,
    /// Search path forwarded to the runner; `Some(OMITTED)` disables it.
    pub path_search: Option<&'a str>,
}

impl<'a> Backend<'a> {
    /// Hand one job to the backend. Submission failure is fatal to the
    /// supervisor; job failure is not (it arrives later via tag files).
    pub fn submit(&self, job: &str) -> Result<()> {
        match self.mode {
            Mode::Session => self.submit_session(job),
            Mode::Background => self.submit_background(job),
            Mode::Batch => self.submit_batch(job),
            Mode::Qsub | Mode::Msub => self.submit_cluster(job),
        }
    }

    /// In-process synchronous evaluation; the caller blocks for the
    /// job's duration. The `.exit` tag is written here since there is
    /// no wrapper script to do it.
    fn submit_session(&self, job: &str) -> Result<()> {
        info!(job, "running in session");
        let search = self.effective_search();
        let result = runner::run_job(self.paths, job, search);
        std::fs::write(self.paths.exit_tag(job), b"")
            .with_context(|| format!("write exit tag for {job}"))?;
        result.map(|_| ())
    }

    fn submit_background(&self, job: &str) -> Result<()> {
        let script = self.write_script(job)?;
        let mut command = Command::new("sh");
        command
            .arg(&script)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        detach(&mut command);
        let child = command
            .spawn()
            .with_context(|| format!("spawn background job {job}"))?;
        info!(job, pid = child.id(), "submitted in background");
        Ok(())
    }

    /// `at now` keeps the job alive across logout; output still lands
    /// in `<job>.log` through the script's own redirection.
    fn submit_batch(&self, job: &str) -> Result<()> {
        let script = self.write_script(job)?;
        let output = Command::new("at")
            .arg("now")
            .arg("-f")
            .arg(&script)
            .output()
            .with_context(|| format!("invoke at(1) for {job}"))?;
        if !output.status.success() {
            bail!(
                "batch submission of {job} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!(job, "submitted via at(1)");
        Ok(())
    }

    fn submit_cluster(&self, job: &str) -> Result<()> {
        let script = self.write_script(job)?;
        let queue_cmd = match self.mode {
            Mode::Qsub => "qsub",
            Mode::Msub => "msub",
            _ => unreachable!(),
        };
        let mut command = Command::new(queue_cmd);
        command
            .arg("-N")
            .arg(truncate_name(job))
            .args(self.qsub_options.split_whitespace())
            .arg("-o")
            .arg(self.paths.job_oqsub(job))
            .arg("-e")
            .arg(self.paths.job_eqsub(job))
            .arg(&script);
        debug!(job, queue = queue_cmd, "cluster submission");
        let output = command
            .output()
            .with_context(|| format!("invoke {queue_cmd} for {job}"))?;
        if !output.status.success() {
            bail!(
                "{queue_cmd} submission of {job} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!(job, queue = queue_cmd, "submitted to cluster queue");
        Ok(())
    }

    /// Compose the wrapper script for `job` under `tmp/` and return its
    /// path.
    pub fn write_script(&self, job: &str) -> Result<PathBuf> {
        let path = self.paths.job_script(job);
        std::fs::create_dir_all(self.paths.tmp_dir())
            .with_context(|| format!("create {}", self.paths.tmp_dir().display()))?;
        let text = self.script_text(job);
        std::fs::write(&path, text)
            .with_context(|| format!("write wrapper script {}", path.display()))?;
        make_executable(&path)?;
        Ok(path)
    }

    fn script_text(&self, job: &str) -> String {
        let mut script = String::from("#!/bin/sh\n");
        if !self.shell_options.is_empty() {
            script.push_str(self.shell_options);
            script.push('\n');
        }
        if !self.runner_prelude.is_empty() {
            script.push_str(self.runner_prelude);
            script.push('\n');
        }
        script.push_str(&self.runner_invocation(job));
        script.push('\n');
        // the exit tag must appear regardless of the runner's outcome
        script.push_str(&format!(
            "touch '{}'\n",
            self.paths.exit_tag(job).display()
        ));
        script
    }

    /// The interpreter invocation: load the descriptor from `PIPE_jobs`,
    /// set search paths unless opted out, run the job. Runner chatter is
    /// appended to the job log; cluster wrapper output goes through the
    /// queue's own `-o`/`-e` routing instead.
    fn runner_invocation(&self, job: &str) -> String {
        let runner = match self.command_runner {
            Some(cmd) => cmd.to_string(),
            None => format!(
                "'{}' _run-job",
                std::env::current_exe()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "pipeline-manager".to_string())
            ),
        };
        let mut invocation = format!(
            "{runner} --logs '{}'",
            self.paths.logs_dir().display()
        );
        if let Some(search) = self.effective_search() {
            invocation.push_str(&format!(" --search '{search}'"));
        }
        invocation.push_str(&format!(" '{job}'"));
        if !self.mode.is_cluster() {
            invocation.push_str(&format!(
                " >> '{}' 2>&1",
                self.paths.job_log(job).display()
            ));
        }
        invocation
    }

    fn effective_search(&self) -> Option<&'a str> {
        match self.path_search {
            Some(OMITTED) | None => None,
            Some(s) if s.is_empty() => None,
            Some(s) => Some(s),
        }
    }
}

fn truncate_name(job: &str) -> String {
    job.chars().take(QSUB_NAME_MAX).collect()
}

/// Detach the child into its own session so it survives the supervisor.
#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid is async-signal-safe and called in the child
    // before exec.
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach(_command: &mut Command) {}

#[cfg(unix)]
fn make_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("chmod {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend<'a>(paths: &'a PipePaths, mode: Mode) -> Backend<'a> {
        Backend {
            mode,
            paths,
            qsub_options: "",
            shell_options: "",
            runner_prelude: "",
            command_runner: Some("run-one"),
            path_search: None,
        }
    }

    #[test]
    fn script_contains_runner_invocation_and_exit_tag() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = PipePaths::new(tmp.path());
        let be = backend(&paths, Mode::Background);
        let script = be.write_script("stage1").unwrap();
        let text = std::fs::read_to_string(&script).unwrap();
        assert!(text.starts_with("#!/bin/sh\n"));
        assert!(text.contains("run-one --logs"));
        assert!(text.contains("'stage1'"));
        assert!(text.contains("stage1.log"));
        assert!(text.contains("stage1.exit"));
    }

    #[test]
    fn cluster_script_skips_log_redirect() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = PipePaths::new(tmp.path());
        let be = backend(&paths, Mode::Qsub);
        let text = be.script_text("stage1");
        assert!(
            !text.contains(">>"),
            "cluster stdout/stderr routes through -o/-e"
        );
    }

    #[test]
    fn prologue_lines_precede_the_invocation() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = PipePaths::new(tmp.path());
        let mut be = backend(&paths, Mode::Background);
        be.shell_options = "set -e";
        be.runner_prelude = "export TOOLBOX=/opt/toolbox";
        let text = be.script_text("stage1");
        let set_pos = text.find("set -e").unwrap();
        let prelude_pos = text.find("export TOOLBOX").unwrap();
        let run_pos = text.find("run-one").unwrap();
        assert!(set_pos < prelude_pos && prelude_pos < run_pos);
    }

    #[test]
    fn search_path_forwarded_unless_omitted() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = PipePaths::new(tmp.path());
        let mut be = backend(&paths, Mode::Background);

        be.path_search = Some("/opt/tools/bin");
        assert!(be.script_text("a").contains("--search '/opt/tools/bin'"));

        be.path_search = Some(OMITTED);
        assert!(!be.script_text("a").contains("--search"));

        be.path_search = None;
        assert!(!be.script_text("a").contains("--search"));
    }

    #[test]
    fn cluster_names_are_truncated() {
        assert_eq!(truncate_name("short"), "short");
        assert_eq!(
            truncate_name("a-very-long-pipeline-job-name"),
            "a-very-long-pip"
        );
        assert_eq!(truncate_name("a-very-long-pip").len(), QSUB_NAME_MAX);
    }
}
