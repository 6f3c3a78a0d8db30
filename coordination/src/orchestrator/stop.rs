//! Cooperative stop — the single cancellation primitive (spec §5).
//!
//! Three flags are polled: a repo-global STOP file, a namespace STOP file,
//! and the RunDir's own `state/STOP`. `STOP_ALL=1` in the environment is
//! treated as presence of the global flag. Grounded on
//! `contract_repair.py::_stop_requested`'s three-path existence check.

use std::path::{Path, PathBuf};

use super::config::OrchestratorConfig;

/// Namespace-wide stop flag, analogous to the original's
/// `ramshare/state/STOP`.
const NAMESPACE_STOP_REL: &str = "state/STOP_ALL_AGENTS";

pub fn global_stop_path(repo_root: &Path) -> PathBuf {
    repo_root.join("STOP_ALL_AGENTS.flag")
}

pub fn namespace_stop_path(repo_root: &Path) -> PathBuf {
    repo_root.join(NAMESPACE_STOP_REL)
}

pub fn run_stop_path(run_dir: &Path) -> PathBuf {
    run_dir.join("state").join("STOP")
}

/// True if any of the three stop flags is present, or `STOP_ALL` is set.
pub fn stop_requested(cfg: &OrchestratorConfig, run_dir: &Path) -> bool {
    if cfg.stop_all {
        return true;
    }
    global_stop_path(&cfg.repo_root).exists()
        || namespace_stop_path(&cfg.repo_root).exists()
        || run_stop_path(run_dir).exists()
}

/// Write a terminal marker to the RunDir on stop (spec §5 cancellation step c).
pub fn write_stopped_marker(run_dir: &Path, round: u32) -> std::io::Result<()> {
    let path = run_dir.join("state").join("STOPPED");
    super::fsio::atomic_write(
        &path,
        format!("{{\"round\":{round},\"stopped_at\":{}}}", super::unix_now()).as_bytes(),
    )
    .map_err(|e| std::io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn run_stop_flag_detected() {
        let repo = tempdir().unwrap();
        let run = tempdir().unwrap();
        let cfg = OrchestratorConfig {
            repo_root: repo.path().to_path_buf(),
            ..OrchestratorConfig::default()
        };
        assert!(!stop_requested(&cfg, run.path()));
        std::fs::create_dir_all(run.path().join("state")).unwrap();
        std::fs::write(run_stop_path(run.path()), "").unwrap();
        assert!(stop_requested(&cfg, run.path()));
    }
}
