//! Concurrency governor (spec §4.3) — slot locks, adaptive feedback, memory
//! pressure throttle.
//!
//! Slot acquisition is grounded on `wampum_ledger.py::sign_treaty`'s
//! spin-lock-via-lockfile idiom (touch a lockfile, bounded wait, reclaim on
//! timeout), generalized from one ad-hoc lock to a K-slot pool backed by
//! `fs2::FileExt::try_lock_exclusive` per `slotI.lock` file, with staleness
//! eviction keyed on the recorded pid's liveness via `sysinfo` rather than a
//! blind force-reclaim.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use super::error::{OrchestratorError, OrchestratorResult};
use super::fsio::atomic_write_json;
use super::{p95, unix_now};

/// Contents of a held `slotI.lock` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotHolder {
    pub pid: u32,
    pub seat: String,
    pub ts: f64,
}

/// A held slot; releases (deletes the lock file) on drop.
pub struct SlotGuard {
    path: PathBuf,
    file: std::fs::File,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    sys.process(sysinfo::Pid::from_u32(pid)).is_some()
}

/// Try to reclaim one stale slot lock (owning pid no longer alive) in
/// `slots_dir`. Returns true if a stale lock was removed.
fn reap_one_stale(slots_dir: &Path, k: usize, grace_s: u64) -> bool {
    for i in 1..=k {
        let path = slots_dir.join(format!("slot{i}.lock"));
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(holder) = serde_json::from_str::<SlotHolder>(&content) else {
            // Corrupt/partial lock content past the grace period is also stale.
            if let Ok(meta) = std::fs::metadata(&path) {
                if let Ok(modified) = meta.modified() {
                    if modified.elapsed().unwrap_or_default() > Duration::from_secs(grace_s) {
                        let _ = std::fs::remove_file(&path);
                        return true;
                    }
                }
            }
            continue;
        };
        let age_ok = unix_now() - holder.ts > grace_s as f64;
        if age_ok && !pid_alive(holder.pid) {
            let _ = std::fs::remove_file(&path);
            return true;
        }
    }
    false
}

/// Attempt to acquire one of `k` slots under `slots_dir`, waiting up to
/// `wait_budget` and reaping stale locks along the way (spec §4.3).
///
/// Available memory is sampled before each acquire attempt; while it sits
/// below `min_free_mem_mb` the seat waits rather than acquiring, to avoid
/// piling more subprocesses onto an already memory-starved host (spec §4.3
/// "Memory pressure"). A `min_free_mem_mb` of 0 disables the gate.
pub fn acquire_slot(
    slots_dir: &Path,
    k: usize,
    seat_identity: &str,
    wait_budget: Duration,
    min_free_mem_mb: u64,
) -> OrchestratorResult<SlotGuard> {
    std::fs::create_dir_all(slots_dir)?;
    let started = Instant::now();
    loop {
        if min_free_mem_mb > 0 {
            if let Some(available) = available_memory_mb() {
                if available < min_free_mem_mb {
                    if started.elapsed() >= wait_budget {
                        return Err(OrchestratorError::LocalOverload {
                            waited_s: started.elapsed().as_secs_f64(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(200));
                    continue;
                }
            }
        }

        for i in 1..=k {
            let path = slots_dir.join(format!("slot{i}.lock"));
            match std::fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&path)
            {
                Ok(mut f) => {
                    if f.try_lock_exclusive().is_ok() {
                        let holder = SlotHolder {
                            pid: std::process::id(),
                            seat: seat_identity.to_string(),
                            ts: unix_now(),
                        };
                        use std::io::Write;
                        let _ = write!(f, "{}", serde_json::to_string(&holder).unwrap_or_default());
                        let _ = f.sync_all();
                        return Ok(SlotGuard { path, file: f });
                    }
                    let _ = std::fs::remove_file(&path);
                }
                Err(_) => continue, // slot already taken
            }
        }

        if reap_one_stale(slots_dir, k, 120) {
            continue; // retry immediately after reclaiming a slot
        }

        if started.elapsed() >= wait_budget {
            return Err(OrchestratorError::LocalOverload {
                waited_s: started.elapsed().as_secs_f64(),
            });
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Count currently-live slot lock files (spec §8 invariant 1).
pub fn live_slot_count(slots_dir: &Path, k: usize) -> usize {
    (1..=k)
        .filter(|i| slots_dir.join(format!("slot{i}.lock")).exists())
        .count()
}

/// Sample available physical memory in MB, or `None` if unreadable
/// (spec §4.3 memory pressure, `MIN_FREE_MEM_MB`).
pub fn available_memory_mb() -> Option<u64> {
    let mut sys = System::new();
    sys.refresh_memory();
    let bytes = sys.available_memory();
    if bytes == 0 {
        None
    } else {
        Some(bytes / (1024 * 1024))
    }
}

/// Sample aggregate CPU load percentage. Requires two refreshes spaced by
/// `sysinfo::MINIMUM_CPU_UPDATE_INTERVAL` to be meaningful; callers that
/// need an instantaneous read accept the first-call zero.
pub fn cpu_load_percent(sys: &mut System) -> f32 {
    sys.refresh_cpu_usage();
    sys.global_cpu_usage()
}

/// A `System` handle kept alive across rounds so successive
/// [`cpu_load_percent`] samples are spaced far enough apart to be
/// meaningful, without every caller needing its own `sysinfo` dependency
/// (spec §4.3 thermal failsafe).
pub struct CpuProbe(System);

impl CpuProbe {
    pub fn new() -> Self {
        Self(System::new())
    }

    pub fn sample(&mut self) -> f32 {
        cpu_load_percent(&mut self.0)
    }
}

impl Default for CpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// One row of `state/agent_metrics.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetricRow {
    pub ts: f64,
    pub seat: usize,
    pub duration_s: f64,
    #[serde(default)]
    pub local_slot_wait_s: f64,
    pub ok: bool,
    #[serde(default)]
    pub error: String,
}

pub fn append_metric(run_dir: &Path, row: &AgentMetricRow) -> OrchestratorResult<()> {
    let path = run_dir.join("state").join("agent_metrics.jsonl");
    super::fsio::append_line_locked(&path, &serde_json::to_string(row)?)
}

fn read_metrics(path: &Path) -> Vec<AgentMetricRow> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

/// Current + recommended concurrency, written to `state/concurrency.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyPlan {
    pub generated_at: f64,
    pub current: ConcurrencyLevels,
    pub recommended: ConcurrencyLevels,
    pub metrics: ConcurrencyMetrics,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyLevels {
    pub max_parallel: usize,
    pub max_local: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyMetrics {
    pub duration_p95_s: f64,
    pub local_slot_wait_p95_s: f64,
    pub rows: usize,
}

/// Recommend `max_parallel`/`max_local` from observed metrics (spec §4.3),
/// rule order verbatim from `adaptive_concurrency.py::main`. Never
/// increases parallelism — only a human can raise it back.
pub fn recommend_concurrency(
    run_dir: &Path,
    current: ConcurrencyLevels,
    cpu_load_pct: f32,
) -> ConcurrencyPlan {
    let rows = read_metrics(&run_dir.join("state").join("agent_metrics.jsonl"));
    let durations: Vec<f64> = rows.iter().map(|r| r.duration_s).filter(|d| *d > 0.0).collect();
    let waits: Vec<f64> = rows
        .iter()
        .map(|r| r.local_slot_wait_s)
        .filter(|w| *w > 0.0)
        .collect();
    let d95 = p95(&durations);
    let w95 = p95(&waits);

    let mut max_parallel = current.max_parallel.max(1);
    let mut max_local = current.max_local.max(1);
    let mut reasons = Vec::new();

    if cpu_load_pct >= 90.0 {
        max_parallel = 1;
        reasons.push(format!(
            "CPU_LOAD={cpu_load_pct:.1}% >= 90% -> thermal failsafe throttle to 1"
        ));
    }
    if w95 >= 30.0 && max_parallel > 1 {
        max_parallel -= 1;
        reasons.push(format!("local_slot_wait_p95={w95:.1}s >= 30s -> reduce max_parallel"));
    }
    if d95 >= 240.0 {
        max_parallel = max_parallel.saturating_sub(1).max(1);
        reasons.push(format!("duration_p95={d95:.1}s >= 240s -> reduce max_parallel"));
    }
    if w95 >= 60.0 {
        max_local = max_local.saturating_sub(1).max(1);
        reasons.push(format!("local_slot_wait_p95={w95:.1}s >= 60s -> reduce max_local"));
    }

    ConcurrencyPlan {
        generated_at: unix_now(),
        current,
        recommended: ConcurrencyLevels { max_parallel, max_local },
        metrics: ConcurrencyMetrics {
            duration_p95_s: d95,
            local_slot_wait_p95_s: w95,
            rows: rows.len(),
        },
        reasons,
    }
}

pub fn write_concurrency_plan(run_dir: &Path, plan: &ConcurrencyPlan) -> OrchestratorResult<()> {
    atomic_write_json(&run_dir.join("state").join("concurrency.json"), plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn slot_safety_holds_under_contention() {
        let dir = tempdir().unwrap();
        let slots = dir.path().to_path_buf();
        let g1 = acquire_slot(&slots, 2, "seat-1", Duration::from_secs(1), 0).unwrap();
        let g2 = acquire_slot(&slots, 2, "seat-2", Duration::from_secs(1), 0).unwrap();
        assert_eq!(live_slot_count(&slots, 2), 2);
        // A third acquire with no slots free should time out as local_overload.
        let err = acquire_slot(&slots, 2, "seat-3", Duration::from_millis(300), 0).unwrap_err();
        assert!(matches!(err, OrchestratorError::LocalOverload { .. }));
        drop(g1);
        assert_eq!(live_slot_count(&slots, 2), 1);
        drop(g2);
        assert_eq!(live_slot_count(&slots, 2), 0);
    }

    #[test]
    fn recommend_reduces_on_high_wait() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir).unwrap();
        let metrics_path = state_dir.join("agent_metrics.jsonl");
        let mut content = String::new();
        for _ in 0..10 {
            content.push_str(
                &serde_json::to_string(&AgentMetricRow {
                    ts: unix_now(),
                    seat: 1,
                    duration_s: 10.0,
                    local_slot_wait_s: 45.0,
                    ok: true,
                    error: String::new(),
                })
                .unwrap(),
            );
            content.push('\n');
        }
        std::fs::write(&metrics_path, content).unwrap();

        let plan = recommend_concurrency(
            dir.path(),
            ConcurrencyLevels { max_parallel: 3, max_local: 2 },
            10.0,
        );
        assert_eq!(plan.recommended.max_parallel, 2);
        assert!(!plan.reasons.is_empty());
    }

    #[test]
    fn never_increases_parallelism() {
        let dir = tempdir().unwrap();
        let plan = recommend_concurrency(
            dir.path(),
            ConcurrencyLevels { max_parallel: 1, max_local: 1 },
            0.0,
        );
        assert_eq!(plan.recommended.max_parallel, 1);
        assert_eq!(plan.recommended.max_local, 1);
    }
}
