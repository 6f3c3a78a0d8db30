//! HITL approvals (spec §4.10) — append-only JSONL gate for patch-apply
//! and other side-effecting stages.
//!
//! Grounded verbatim on `approve_action.py`: one JSONL row per grant,
//! `{schema_version, ts, action_id, kind, actor, note}`, default
//! `kind = "patch_apply"`, default `actor = "human"`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::OrchestratorResult;
use super::fsio::append_line_locked;
use super::unix_now;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub schema_version: u32,
    pub ts: f64,
    pub action_id: String,
    pub kind: String,
    pub actor: String,
    pub note: String,
}

impl Approval {
    pub fn new(action_id: impl Into<String>, kind: impl Into<String>, actor: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            schema_version: 1,
            ts: unix_now(),
            action_id: action_id.into(),
            kind: kind.into(),
            actor: actor.into(),
            note: note.into(),
        }
    }
}

/// Append a new approval row to `<run>/state/approvals.jsonl`.
pub fn append_approval(approvals_path: &Path, approval: &Approval) -> OrchestratorResult<()> {
    append_line_locked(approvals_path, &serde_json::to_string(approval)?)
}

fn read_approvals(approvals_path: &Path) -> Vec<Approval> {
    std::fs::read_to_string(approvals_path)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

/// True if any row in `approvals_path` matches `action_id` (and `kind`,
/// when non-empty).
pub fn has_approval(approvals_path: &Path, action_id: &str, kind: &str) -> bool {
    read_approvals(approvals_path)
        .iter()
        .any(|a| a.action_id == action_id && (kind.is_empty() || a.kind == kind))
}

/// Abstraction the patch-apply stage consults, so tests can stub approval
/// state without touching the filesystem.
pub trait HasApproval: Send + Sync {
    fn has_approval(&self, action_id: &str, kind: &str) -> bool;
}

/// Filesystem-backed implementation reading `<run>/state/approvals.jsonl`.
pub struct FileApprovals {
    pub path: std::path::PathBuf,
}

impl HasApproval for FileApprovals {
    fn has_approval(&self, action_id: &str, kind: &str) -> bool {
        has_approval(&self.path, action_id, kind)
    }
}
