//! Patch apply (spec §4.6) — unified-diff extraction, edit-surface
//! validation, and guarded application.
//!
//! Unified-diff parsing (`+++ b/` stripping, `@@ -a,b +c,d @@` hunk-header
//! parsing, `+`/`-`/context line classification) is grounded on
//! `coordination/src/verifier/safety_scan.rs`'s diff-walking code. Hunk
//! application reuses `crate::patch::PatchEngine`'s match-kind ladder
//! (Exact → TrimmedTrailing → WhitespaceNormalized → Fuzzy), generalized
//! from that module's single-repo-context use to the spec's per-round
//! "winning decision's diff blocks" use.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::approvals::HasApproval;
use super::error::OrchestratorResult;
use super::fsio::atomic_write_json;
use super::mission::RunDir;
use super::risk_scan::{scan_text, PatternFamily};
use super::unix_now;
use crate::patch::{PatchConfig, PatchEngine, PatchHunk};

/// A single file's unified-diff block, parsed from a decision's raw output.
#[derive(Debug, Clone)]
pub struct DiffBlock {
    pub old_path: Option<String>,
    pub new_path: String,
    pub hunks: Vec<PatchHunk>,
}

fn diff_fence_re() -> Regex {
    Regex::new(r"(?is)```diff\s*(.*?)```").unwrap()
}

/// Extract every fenced ```diff block from free-form text and parse each
/// into per-file unified-diff blocks.
pub fn extract_diff_blocks(text: &str) -> Vec<DiffBlock> {
    let mut blocks = Vec::new();
    for caps in diff_fence_re().captures_iter(text) {
        blocks.extend(parse_unified_diff(&caps[1]));
    }
    blocks
}

/// Parse one or more concatenated unified-diff file sections.
pub fn parse_unified_diff(diff_text: &str) -> Vec<DiffBlock> {
    let mut blocks = Vec::new();
    let mut old_path: Option<String> = None;
    let mut new_path: Option<String> = None;
    let mut hunks: Vec<PatchHunk> = Vec::new();
    let mut old_lines: Vec<String> = Vec::new();
    let mut new_lines: Vec<String> = Vec::new();
    let mut in_hunk = false;

    let flush_hunk = |old_lines: &mut Vec<String>, new_lines: &mut Vec<String>, hunks: &mut Vec<PatchHunk>| {
        if !old_lines.is_empty() || !new_lines.is_empty() {
            hunks.push(PatchHunk {
                old_lines: std::mem::take(old_lines),
                new_lines: std::mem::take(new_lines),
                description: None,
            });
        }
    };

    let flush_file = |old_path: &mut Option<String>,
                       new_path: &mut Option<String>,
                       hunks: &mut Vec<PatchHunk>,
                       blocks: &mut Vec<DiffBlock>| {
        if let Some(np) = new_path.take() {
            blocks.push(DiffBlock { old_path: old_path.take(), new_path: np, hunks: std::mem::take(hunks) });
        }
    };

    for line in diff_text.lines() {
        if let Some(rest) = line.strip_prefix("--- a/") {
            flush_hunk(&mut old_lines, &mut new_lines, &mut hunks);
            flush_file(&mut old_path, &mut new_path, &mut hunks, &mut blocks);
            old_path = Some(rest.trim().to_string());
            in_hunk = false;
        } else if let Some(rest) = line.strip_prefix("+++ b/") {
            new_path = Some(rest.trim().to_string());
            in_hunk = false;
        } else if line.starts_with("@@ ") {
            flush_hunk(&mut old_lines, &mut new_lines, &mut hunks);
            in_hunk = true;
        } else if in_hunk {
            if let Some(rest) = line.strip_prefix('+') {
                new_lines.push(rest.to_string());
            } else if let Some(rest) = line.strip_prefix('-') {
                old_lines.push(rest.to_string());
            } else {
                let ctx = line.strip_prefix(' ').unwrap_or(line);
                old_lines.push(ctx.to_string());
                new_lines.push(ctx.to_string());
            }
        }
    }
    flush_hunk(&mut old_lines, &mut new_lines, &mut hunks);
    flush_file(&mut old_path, &mut new_path, &mut hunks, &mut blocks);
    blocks
}

/// Reject reasons for a disallowed patch block (spec §4.6, §7, §8 invariant 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRejection {
    AbsolutePath,
    PathTraversal,
    OutsideEditSurface,
    SecretPattern,
}

/// Validate a touched path is repo-relative, non-traversing, and under an
/// allowed edit-surface prefix.
pub fn validate_path(path: &str, allowed_prefixes: &[String]) -> Result<(), PathRejection> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(PathRejection::AbsolutePath);
    }
    if path.contains("..") || p.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(PathRejection::PathTraversal);
    }
    // Windows drive letters like `C:\` never parse as relative on POSIX,
    // but reject the textual pattern defensively regardless of platform.
    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        return Err(PathRejection::AbsolutePath);
    }
    let under_allowed = allowed_prefixes.is_empty()
        || allowed_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()));
    if !under_allowed {
        return Err(PathRejection::OutsideEditSurface);
    }
    Ok(())
}

/// Does a block's incoming content match a must-block secret pattern (spec
/// §4.6 "not match a secrets pattern"; patterns defined in §4.8)?
fn touches_secret_pattern(block: &DiffBlock) -> bool {
    let added: String = block
        .hunks
        .iter()
        .flat_map(|h| h.new_lines.iter())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    scan_text(&block.new_path, &added)
        .iter()
        .any(|hit| hit.family == PatternFamily::Secret)
}

/// Per-block outcome (spec §3 `PatchApplyReport` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockReport {
    pub ok: bool,
    pub touched_files: Vec<String>,
    pub reason: Option<String>,
}

/// One round's patch-apply report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchApplyReport {
    pub round: u32,
    pub agent: usize,
    pub generated_at: f64,
    pub blocks: Vec<BlockReport>,
}

/// Apply every diff block in `blocks` against `repo_root`, validating each
/// block as a whole unit (a rejected block is never partially re-scoped).
/// Later blocks are still attempted after an earlier rejection/failure
/// (spec §4.6 apply semantics).
pub fn apply_blocks(
    repo_root: &Path,
    blocks: &[DiffBlock],
    allowed_prefixes: &[String],
) -> Vec<BlockReport> {
    let engine = PatchEngine::new(PatchConfig::default());
    let mut reports = Vec::new();

    for block in blocks {
        let touched_files = vec![block.new_path.clone()];
        if let Err(rejection) = validate_path(&block.new_path, allowed_prefixes) {
            reports.push(BlockReport {
                ok: false,
                touched_files,
                reason: Some(match rejection {
                    PathRejection::AbsolutePath => "disallowed_path".to_string(),
                    PathRejection::PathTraversal => "disallowed_path".to_string(),
                    PathRejection::OutsideEditSurface => "disallowed_path".to_string(),
                    PathRejection::SecretPattern => "secret_pattern".to_string(),
                }),
            });
            continue;
        }
        if touches_secret_pattern(block) {
            reports.push(BlockReport {
                ok: false,
                touched_files,
                reason: Some("secret_pattern".to_string()),
            });
            continue;
        }

        let target = repo_root.join(&block.new_path);
        let existing = std::fs::read_to_string(&target).unwrap_or_default();
        let result = engine.apply(&existing, &block.hunks);

        if !result.success {
            reports.push(BlockReport {
                ok: false,
                touched_files,
                reason: Some("hunk_apply_failed".to_string()),
            });
            continue;
        }

        let write_ok = result
            .patched_content
            .as_ref()
            .map(|content| {
                if let Some(parent) = target.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                std::fs::write(&target, content).is_ok()
            })
            .unwrap_or(false);

        reports.push(BlockReport {
            ok: write_ok,
            touched_files,
            reason: if write_ok { None } else { Some("write_failed".to_string()) },
        });
    }

    reports
}

/// Patch apply for one round's winning seat, gated by an optional HITL
/// approval lookup (spec §4.6). `approval_check` returns `awaiting_approval`
/// without attempting any block when it denies.
pub fn patch_apply_round(
    run_dir: &RunDir,
    repo_root: &Path,
    round: u32,
    agent: usize,
    decision_raw_text: &str,
    allowed_prefixes: &[String],
    approval: &dyn HasApproval,
    action_id: Option<&str>,
) -> OrchestratorResult<PatchApplyReport> {
    if let Some(action_id) = action_id {
        if !approval.has_approval(action_id, "patch_apply") {
            let report = PatchApplyReport {
                round,
                agent,
                generated_at: unix_now(),
                blocks: vec![BlockReport {
                    ok: false,
                    touched_files: Vec::new(),
                    reason: Some("awaiting_approval".to_string()),
                }],
            };
            atomic_write_json(&run_dir.patch_apply_report_path(round), &report)?;
            return Ok(report);
        }
    }

    let blocks = extract_diff_blocks(decision_raw_text);
    let block_reports = apply_blocks(repo_root, &blocks, allowed_prefixes);
    let report = PatchApplyReport { round, agent, generated_at: unix_now(), blocks: block_reports };
    atomic_write_json(&run_dir.patch_apply_report_path(round), &report)?;
    Ok(report)
}

/// Default edit surface: code/docs/config directories relative to repo
/// root (spec §4.6 "default: the repo's code/docs/config directories").
pub fn default_edit_surface() -> Vec<String> {
    vec!["src/".into(), "crates/".into(), "docs/".into(), "config/".into(), "tests/".into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DIFF: &str = "```diff\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,2 +1,2 @@\n-old line\n+new line\n context\n```";

    #[test]
    fn parses_single_file_block() {
        let blocks = extract_diff_blocks(SAMPLE_DIFF);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].new_path, "src/lib.rs");
        assert_eq!(blocks[0].hunks.len(), 1);
    }

    #[test]
    fn rejects_absolute_path() {
        let err = validate_path("/etc/hosts", &default_edit_surface()).unwrap_err();
        assert_eq!(err, PathRejection::AbsolutePath);
    }

    #[test]
    fn rejects_traversal() {
        let err = validate_path("src/../../../etc/passwd", &default_edit_surface()).unwrap_err();
        assert_eq!(err, PathRejection::PathTraversal);
    }

    #[test]
    fn rejects_outside_edit_surface() {
        let err = validate_path("random_top_level.rs", &default_edit_surface()).unwrap_err();
        assert_eq!(err, PathRejection::OutsideEditSurface);
    }

    #[test]
    fn scenario_d_disallowed_path_block_rejected_whole() {
        let diff = "```diff\n--- a/etc/hosts\n+++ b/etc/hosts\n@@ -1 +1 @@\n-a\n+b\n```";
        let blocks = extract_diff_blocks(diff);
        let reports = apply_blocks(Path::new("/tmp"), &blocks, &default_edit_surface());
        assert!(!reports[0].ok);
        assert_eq!(reports[0].reason.as_deref(), Some("disallowed_path"));
    }

    #[test]
    fn block_introducing_a_secret_is_rejected_whole() {
        let diff = "```diff\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-old\n+let api_key = \"sk-abc1234567890abcdef1234567890\";\n```";
        let blocks = extract_diff_blocks(diff);
        let reports = apply_blocks(Path::new("/tmp"), &blocks, &default_edit_surface());
        assert!(!reports[0].ok);
        assert_eq!(reports[0].reason.as_deref(), Some("secret_pattern"));
    }

    struct AlwaysApprove;
    impl HasApproval for AlwaysApprove {
        fn has_approval(&self, _action_id: &str, _kind: &str) -> bool {
            true
        }
    }
    struct NeverApprove;
    impl HasApproval for NeverApprove {
        fn has_approval(&self, _action_id: &str, _kind: &str) -> bool {
            false
        }
    }

    #[test]
    fn missing_approval_skips_patch_apply() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = RunDir::new(dir.path());
        std::fs::create_dir_all(run_dir.state_dir()).unwrap();
        let report = patch_apply_round(
            &run_dir,
            dir.path(),
            2,
            1,
            SAMPLE_DIFF,
            &default_edit_surface(),
            &NeverApprove,
            Some("action-1"),
        )
        .unwrap();
        assert_eq!(report.blocks[0].reason.as_deref(), Some("awaiting_approval"));
    }

    #[test]
    fn approved_action_applies() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = RunDir::new(dir.path());
        std::fs::create_dir_all(run_dir.state_dir()).unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "old line\ncontext\n").unwrap();
        let report = patch_apply_round(
            &run_dir,
            dir.path(),
            2,
            1,
            SAMPLE_DIFF,
            &default_edit_surface(),
            &AlwaysApprove,
            Some("action-1"),
        )
        .unwrap();
        assert!(report.blocks[0].ok);
    }
}
