//! Pluggable post-round enrichers (spec §4.2 "ENRICHING?") — sequential,
//! non-fatal, must not mutate decisions.
//!
//! Grounded on the teacher's `reviewer_tools`/`feedback` plugin-trait shape
//! (a small `async_trait` interface implementors register into a `Vec<Box<dyn
//! _>>`), re-scoped from tool-call dispatch to round-level enrichment.
//! §9 Open Question 4 resolved: a crashed or timed-out enricher leaves
//! whatever partial bytes it wrote at its `.tmp` path rather than getting an
//! atomic rename — the half-written artifact is forensic evidence, not
//! garbage to hide.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::decision::Decision;
use super::mission::RunDir;

pub fn enrichers_dir(run_dir: &RunDir) -> PathBuf {
    run_dir.state_dir().join("enrichers")
}

pub fn enricher_tmp_path(run_dir: &RunDir, name: &str, round: u32) -> PathBuf {
    enrichers_dir(run_dir).join(format!("{name}_round{round}.tmp"))
}

pub fn enricher_output_path(run_dir: &RunDir, name: &str, round: u32) -> PathBuf {
    enrichers_dir(run_dir).join(format!("{name}_round{round}.json"))
}

/// One pluggable post-round enricher. Implementors write their result
/// incrementally to `tmp_path`; a successful return promotes it to the
/// enricher's final `.json` artifact.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;
    fn timeout(&self) -> Duration;
    async fn run(
        &self,
        run_dir: &RunDir,
        round: u32,
        decisions: &[Decision],
        tmp_path: &Path,
    ) -> anyhow::Result<()>;
}

/// Outcome of one enricher invocation (spec §4.2: "failures are non-fatal").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnricherReport {
    pub name: String,
    pub ok: bool,
    pub duration_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn run_one(
    enricher: &dyn Enricher,
    run_dir: &RunDir,
    round: u32,
    decisions: &[Decision],
) -> EnricherReport {
    let name = enricher.name().to_string();
    let tmp = enricher_tmp_path(run_dir, &name, round);
    if let Some(parent) = tmp.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let t0 = Instant::now();
    let outcome = tokio::time::timeout(
        enricher.timeout(),
        enricher.run(run_dir, round, decisions, &tmp),
    )
    .await;

    match outcome {
        Ok(Ok(())) => {
            let final_path = enricher_output_path(run_dir, &name, round);
            let _ = std::fs::rename(&tmp, &final_path);
            EnricherReport { name, ok: true, duration_s: t0.elapsed().as_secs_f64(), error: None }
        }
        Ok(Err(e)) => {
            tracing::warn!(enricher = %name, round, error = %e, "enricher failed, leaving partial artifact");
            EnricherReport { name, ok: false, duration_s: t0.elapsed().as_secs_f64(), error: Some(e.to_string()) }
        }
        Err(_) => {
            tracing::warn!(enricher = %name, round, "enricher timed out, leaving partial artifact");
            EnricherReport {
                name,
                ok: false,
                duration_s: t0.elapsed().as_secs_f64(),
                error: Some("timeout exceeded".to_string()),
            }
        }
    }
}

/// Run every enricher in order against the round's decisions. Enrichers
/// never see each other's output and never mutate `decisions` (the slice
/// is shared, not threaded through mutably).
pub async fn run_enrichers(
    run_dir: &RunDir,
    round: u32,
    decisions: &[Decision],
    enrichers: &[Box<dyn Enricher>],
) -> Vec<EnricherReport> {
    let mut reports = Vec::with_capacity(enrichers.len());
    for enricher in enrichers {
        reports.push(run_one(enricher.as_ref(), run_dir, round, decisions).await);
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct Noop;
    #[async_trait]
    impl Enricher for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        async fn run(&self, _run_dir: &RunDir, _round: u32, _decisions: &[Decision], tmp_path: &Path) -> anyhow::Result<()> {
            std::fs::write(tmp_path, b"{}")?;
            Ok(())
        }
    }

    struct AlwaysFails;
    #[async_trait]
    impl Enricher for AlwaysFails {
        fn name(&self) -> &str {
            "broken"
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        async fn run(&self, _run_dir: &RunDir, _round: u32, _decisions: &[Decision], tmp_path: &Path) -> anyhow::Result<()> {
            std::fs::write(tmp_path, b"partial")?;
            anyhow::bail!("boom")
        }
    }

    struct NeverFinishes;
    #[async_trait]
    impl Enricher for NeverFinishes {
        fn name(&self) -> &str {
            "slow"
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(20)
        }
        async fn run(&self, _run_dir: &RunDir, _round: u32, _decisions: &[Decision], tmp_path: &Path) -> anyhow::Result<()> {
            std::fs::write(tmp_path, b"partial-slow")?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_enricher_promotes_tmp_to_json() {
        let dir = tempdir().unwrap();
        let run_dir = RunDir::new(dir.path());
        let enrichers: Vec<Box<dyn Enricher>> = vec![Box::new(Noop)];
        let reports = run_enrichers(&run_dir, 1, &[], &enrichers).await;
        assert!(reports[0].ok);
        assert!(enricher_output_path(&run_dir, "noop", 1).exists());
        assert!(!enricher_tmp_path(&run_dir, "noop", 1).exists());
    }

    #[tokio::test]
    async fn failing_enricher_leaves_partial_tmp_file() {
        let dir = tempdir().unwrap();
        let run_dir = RunDir::new(dir.path());
        let enrichers: Vec<Box<dyn Enricher>> = vec![Box::new(AlwaysFails)];
        let reports = run_enrichers(&run_dir, 1, &[], &enrichers).await;
        assert!(!reports[0].ok);
        assert!(enricher_tmp_path(&run_dir, "broken", 1).exists());
        assert!(!enricher_output_path(&run_dir, "broken", 1).exists());
    }

    #[tokio::test]
    async fn timed_out_enricher_leaves_partial_tmp_file() {
        let dir = tempdir().unwrap();
        let run_dir = RunDir::new(dir.path());
        let enrichers: Vec<Box<dyn Enricher>> = vec![Box::new(NeverFinishes)];
        let reports = run_enrichers(&run_dir, 1, &[], &enrichers).await;
        assert!(!reports[0].ok);
        assert_eq!(reports[0].error.as_deref(), Some("timeout exceeded"));
        assert!(enricher_tmp_path(&run_dir, "slow", 1).exists());
    }

    #[tokio::test]
    async fn one_broken_enricher_does_not_block_the_next() {
        let dir = tempdir().unwrap();
        let run_dir = RunDir::new(dir.path());
        let enrichers: Vec<Box<dyn Enricher>> = vec![Box::new(AlwaysFails), Box::new(Noop)];
        let reports = run_enrichers(&run_dir, 1, &[], &enrichers).await;
        assert!(!reports[0].ok);
        assert!(reports[1].ok);
    }
}
