//! Action-id idempotency (spec §4.10) — dedupe of inbound action requests.
//!
//! Grounded verbatim on `action_ledger.py`: a flat JSONL scan over
//! `state/actions.jsonl`, no index structure. TTL expiry (§9 Open Question
//! 3, resolved to 14 days) is layered as a read-time filter over the same
//! file rather than a separate GC pass — stale rows are skipped, not
//! deleted, preserving forensic history.

use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::OrchestratorResult;
use super::unix_now;

/// One row of `state/actions.jsonl` (spec §3 `ActionRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub schema_version: u32,
    pub ts: f64,
    pub action_id: String,
    pub kind: String,
    #[serde(default)]
    pub details: Value,
}

impl ActionRecord {
    pub fn new(action_id: impl Into<String>, kind: impl Into<String>, details: Value) -> Self {
        Self { schema_version: 1, ts: unix_now(), action_id: action_id.into(), kind: kind.into(), details }
    }
}

pub fn actions_path(run_dir: &Path) -> PathBuf {
    run_dir.join("state").join("actions.jsonl")
}

fn read_actions(path: &Path) -> Vec<ActionRecord> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

/// True if a live (within `ttl_days`) row with `action_id` (and `kind`,
/// when non-empty) already exists.
pub fn has_action(path: &Path, action_id: &str, kind: &str, ttl_days: i64) -> bool {
    let cutoff = unix_now() - (ttl_days as f64 * 86_400.0);
    read_actions(path)
        .iter()
        .any(|r| r.action_id == action_id && (kind.is_empty() || r.kind == kind) && r.ts >= cutoff)
}

/// Outcome of [`receive`] — the dedupe decision for one inbound action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveOutcome {
    Queued,
    DuplicateIgnored,
}

/// Receive one inbound action request: if a live row with the same
/// `action_id` (+ `kind`) already exists, return `DuplicateIgnored`
/// without appending; otherwise append and return `Queued` (spec §8
/// invariant 5). The whole check-then-append is serialized through an
/// exclusive lock on `path` so concurrent receivers can't both queue the
/// same `action_id` (spec §5 "writers serialize through an exclusive file
/// lock").
pub fn receive(
    path: &Path,
    action_id: &str,
    kind: &str,
    details: Value,
    ttl_days: i64,
) -> OrchestratorResult<ReceiveOutcome> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::OpenOptions::new().create(true).read(true).append(true).open(path)?;
    f.lock_exclusive().map_err(|e| super::error::OrchestratorError::RuntimeIo(e.to_string()))?;

    let result = (|| -> OrchestratorResult<ReceiveOutcome> {
        if has_action(path, action_id, kind, ttl_days) {
            return Ok(ReceiveOutcome::DuplicateIgnored);
        }
        use std::io::Write;
        let record = ActionRecord::new(action_id, kind, details);
        writeln!(f, "{}", serde_json::to_string(&record)?)?;
        f.sync_all()?;
        Ok(ReceiveOutcome::Queued)
    })();

    let _ = FileExt::unlock(&f);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn second_receive_within_ttl_is_duplicate() {
        let dir = tempdir().unwrap();
        let path = actions_path(dir.path());
        let first = receive(&path, "a1", "patch_apply", json!({}), 14).unwrap();
        let second = receive(&path, "a1", "patch_apply", json!({}), 14).unwrap();
        assert_eq!(first, ReceiveOutcome::Queued);
        assert_eq!(second, ReceiveOutcome::DuplicateIgnored);
    }

    #[test]
    fn different_action_ids_both_queue() {
        let dir = tempdir().unwrap();
        let path = actions_path(dir.path());
        assert_eq!(receive(&path, "a1", "k", json!({}), 14).unwrap(), ReceiveOutcome::Queued);
        assert_eq!(receive(&path, "a2", "k", json!({}), 14).unwrap(), ReceiveOutcome::Queued);
    }

    #[test]
    fn expired_entry_treated_as_absent() {
        let dir = tempdir().unwrap();
        let path = actions_path(dir.path());
        let mut stale = ActionRecord::new("a1", "k", json!({}));
        stale.ts = unix_now() - 15.0 * 86_400.0;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_string(&stale).unwrap() + "\n").unwrap();

        assert!(!has_action(&path, "a1", "k", 14));
        assert_eq!(receive(&path, "a1", "k", json!({}), 14).unwrap(), ReceiveOutcome::Queued);
    }
}
