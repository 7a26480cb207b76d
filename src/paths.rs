//! Canonical filenames under a pipeline's logs directory.
//!
//! An explicit `--logs` flag or `PIPELINE_MANAGER_LOGS` names the logs
//! root directly; otherwise it defaults to `pipeline-manager/logs`
//! inside the per-user data directory.

use directories::BaseDirs;
use std::path::{Path, PathBuf};

/// Wrapper-script extension; cluster and local shells expect `.sh`,
/// Windows command interpreters `.bat`.
pub const SCRIPT_EXT: &str = if cfg!(windows) { "bat" } else { "sh" };

/// Resolve the logs root: explicit flag, then environment override,
/// then the per-user default location.
pub fn resolve_logs_root(cli_logs: Option<&str>) -> PathBuf {
    cli_logs
        .map(PathBuf::from)
        .or_else(|| env_path("PIPELINE_MANAGER_LOGS"))
        .unwrap_or_else(|| data_home().join("pipeline-manager").join("logs"))
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Per-user data directory. `XDG_DATA_HOME` wins where set; the
/// platform convention applies otherwise, and a relative fallback keeps
/// the tool usable in stripped-down environments with no home at all.
fn data_home() -> PathBuf {
    env_path("XDG_DATA_HOME")
        .or_else(|| BaseDirs::new().map(|dirs| dirs.data_local_dir().to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Handle to a pipeline's logs directory; one accessor per canonical
/// filename. These names are part of the on-disk contract and must stay
/// bit-exact across versions so that restarts of old runs keep working.
#[derive(Debug, Clone)]
pub struct PipePaths {
    logs: PathBuf,
}

impl PipePaths {
    pub fn new(logs: impl Into<PathBuf>) -> Self {
        PipePaths { logs: logs.into() }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs
    }

    // -- control-plane stores ------------------------------------------------

    pub fn pipe_main(&self) -> PathBuf {
        self.logs.join("PIPE.main")
    }
    pub fn pipe_backup(&self) -> PathBuf {
        self.logs.join("PIPE.backup")
    }
    pub fn jobs_main(&self) -> PathBuf {
        self.logs.join("PIPE_jobs.main")
    }
    pub fn jobs_backup(&self) -> PathBuf {
        self.logs.join("PIPE_jobs.backup")
    }
    pub fn status_main(&self) -> PathBuf {
        self.logs.join("PIPE_status.main")
    }
    pub fn status_backup(&self) -> PathBuf {
        self.logs.join("PIPE_status.backup")
    }
    pub fn logs_main(&self) -> PathBuf {
        self.logs.join("PIPE_logs.main")
    }
    pub fn logs_backup(&self) -> PathBuf {
        self.logs.join("PIPE_logs.backup")
    }
    pub fn profile_main(&self) -> PathBuf {
        self.logs.join("PIPE_profile.main")
    }
    pub fn profile_backup(&self) -> PathBuf {
        self.logs.join("PIPE_profile.backup")
    }

    pub fn lock(&self) -> PathBuf {
        self.logs.join("PIPE.lock")
    }
    pub fn history(&self) -> PathBuf {
        self.logs.join("PIPE_history.txt")
    }

    // -- per-job artifacts ---------------------------------------------------

    pub fn running_tag(&self, job: &str) -> PathBuf {
        self.logs.join(format!("{job}.running"))
    }
    pub fn finished_tag(&self, job: &str) -> PathBuf {
        self.logs.join(format!("{job}.finished"))
    }
    pub fn failed_tag(&self, job: &str) -> PathBuf {
        self.logs.join(format!("{job}.failed"))
    }
    pub fn exit_tag(&self, job: &str) -> PathBuf {
        self.logs.join(format!("{job}.exit"))
    }
    pub fn job_log(&self, job: &str) -> PathBuf {
        self.logs.join(format!("{job}.log"))
    }
    pub fn job_oqsub(&self, job: &str) -> PathBuf {
        self.logs.join(format!("{job}.oqsub"))
    }
    pub fn job_eqsub(&self, job: &str) -> PathBuf {
        self.logs.join(format!("{job}.eqsub"))
    }
    pub fn job_profile(&self, job: &str) -> PathBuf {
        self.logs.join(format!("{job}.profile"))
    }

    // -- generated scripts ---------------------------------------------------

    pub fn tmp_dir(&self) -> PathBuf {
        self.logs.join("tmp")
    }
    pub fn job_script(&self, job: &str) -> PathBuf {
        self.tmp_dir().join(format!("{job}.{SCRIPT_EXT}"))
    }
    pub fn manager_script(&self) -> PathBuf {
        self.tmp_dir().join(format!("pipeline_manager.{SCRIPT_EXT}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_flag_names_the_root_directly() {
        let logs = resolve_logs_root(Some("/tmp/my-logs"));
        assert_eq!(logs, PathBuf::from("/tmp/my-logs"));
    }

    #[test]
    fn env_chain_falls_through_to_the_data_home() {
        // one test for both env branches so the mutations stay
        // sequential under the parallel test runner
        // SAFETY: no other test touches these variables.
        unsafe {
            std::env::set_var("PIPELINE_MANAGER_LOGS", "/tmp/env-logs");
            std::env::remove_var("XDG_DATA_HOME");
        }
        assert_eq!(resolve_logs_root(None), PathBuf::from("/tmp/env-logs"));

        unsafe {
            std::env::remove_var("PIPELINE_MANAGER_LOGS");
            std::env::set_var("XDG_DATA_HOME", "/tmp/xdg-data");
        }
        let fallback = resolve_logs_root(None);
        unsafe {
            std::env::remove_var("XDG_DATA_HOME");
        }
        assert_eq!(
            fallback,
            PathBuf::from("/tmp/xdg-data/pipeline-manager/logs")
        );
    }

    #[test]
    fn store_and_tag_names_are_stable() {
        let p = PipePaths::new("/logs");
        assert_eq!(p.pipe_main(), PathBuf::from("/logs/PIPE.main"));
        assert_eq!(p.jobs_backup(), PathBuf::from("/logs/PIPE_jobs.backup"));
        assert_eq!(p.status_main(), PathBuf::from("/logs/PIPE_status.main"));
        assert_eq!(p.lock(), PathBuf::from("/logs/PIPE.lock"));
        assert_eq!(p.history(), PathBuf::from("/logs/PIPE_history.txt"));
        assert_eq!(p.finished_tag("a"), PathBuf::from("/logs/a.finished"));
        assert_eq!(p.job_oqsub("a"), PathBuf::from("/logs/a.oqsub"));
        assert_eq!(
            p.job_script("a"),
            PathBuf::from(format!("/logs/tmp/a.{SCRIPT_EXT}"))
        );
        assert_eq!(
            p.manager_script(),
            PathBuf::from(format!("/logs/tmp/pipeline_manager.{SCRIPT_EXT}"))
        );
    }
}
