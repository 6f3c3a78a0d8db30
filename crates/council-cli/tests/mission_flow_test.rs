//! End-to-end exercise of the subsystems `council`'s subcommands wrap,
//! standing in for driving the binary itself (clap dispatch has no logic
//! of its own worth a subprocess test): intake, decision extraction,
//! ranking, patch apply gated on HITL approval, verify, and the evidence
//! ledger, run back to back against one `RunDir`.

use std::collections::HashMap;

use coordination::orchestrator::approvals::{append_approval, Approval, FileApprovals, HasApproval};
use coordination::orchestrator::decision::extract_round;
use coordination::orchestrator::ledger::{append_signed_entry, verify_log, Keyring};
use coordination::orchestrator::mission::init_run;
use coordination::orchestrator::patch_gate::{default_edit_surface, patch_apply_round};
use coordination::orchestrator::rank_seats;
use coordination::orchestrator::risk_scan::scan_text;
use coordination::{Decision, Mission, OrchestratorConfig};
use serde_json::json;
use tempfile::tempdir;

fn seat_decision_text(files: &str, confidence: f64) -> String {
    format!(
        "I reviewed the module.\n\n```json\nDECISION_JSON\n{{\"summary\": \"fix it\", \
         \"files\": [\"{files}\"], \"commands\": [\"true\"], \"risks\": [], \
         \"confidence\": {confidence}}}\n```\n\n```diff\n--- a/{files}\n+++ b/{files}\n\
         @@ -1,1 +1,1 @@\n-old\n+new\n```\n"
    )
}

#[test]
fn mission_intake_produces_manifest_and_per_seat_prompts() {
    let repo = tempdir().unwrap();
    let mission = Mission::new("review the auth module for security issues", 2, 3, false, true).unwrap();
    let run_dir = init_run(&mission, repo.path()).unwrap();

    assert!(run_dir.manifest_path().exists());
    assert!(mission.team.contains(&"Security".to_string()));
    for seat in 1..=mission.team.len() {
        assert!(run_dir.prompt_path(seat).exists());
    }
}

#[test]
fn extract_rank_and_apply_winning_patch_end_to_end() {
    let root = tempdir().unwrap();
    let repo_root = root.path().join("repo");
    std::fs::create_dir_all(repo_root.join("src")).unwrap();
    std::fs::write(repo_root.join("src/lib.rs"), "old\n").unwrap();

    let mission = Mission::new("tighten up the auth module", 1, 3, false, false).unwrap();
    let run_dir = init_run(&mission, &root.path().join("run")).unwrap();

    // Two seats answer with valid contracts; seat 2 has higher confidence
    // and should win the tie-break ladder with no supervisor scores.
    std::fs::write(run_dir.seat_output_path(1, 1), seat_decision_text("src/lib.rs", 0.4)).unwrap();
    std::fs::write(run_dir.seat_output_path(1, 2), seat_decision_text("src/lib.rs", 0.9)).unwrap();
    std::fs::write(run_dir.seat_output_path(1, 3), "no fence here, just prose").unwrap();

    let report = extract_round(&run_dir, 1, mission.team.len(), false).unwrap();
    assert!(report.ok);
    assert_eq!(report.extracted, 2);
    assert_eq!(report.missing, vec![3]);

    let mut decisions: Vec<Decision> = Vec::new();
    for seat in 1..=mission.team.len() {
        if let Ok(text) = std::fs::read_to_string(run_dir.decision_path(1, seat)) {
            decisions.push(serde_json::from_str(&text).unwrap());
        }
    }
    let winner = rank_seats(&decisions, &HashMap::new()).unwrap();
    assert_eq!(winner, 2);

    let winning = decisions.iter().find(|d| d.agent == winner).unwrap();
    let raw_text = std::fs::read_to_string(&winning.source_path).unwrap();

    let approval = FileApprovals { path: run_dir.approvals_path() };
    let action_id = "apply-round-1";

    // No approval recorded yet: apply must refuse without touching the tree.
    let gated = patch_apply_round(&run_dir, &repo_root, 1, winner, &raw_text, &default_edit_surface(), &approval, Some(action_id)).unwrap();
    assert_eq!(gated.blocks[0].reason.as_deref(), Some("awaiting_approval"));
    assert_eq!(std::fs::read_to_string(repo_root.join("src/lib.rs")).unwrap(), "old\n");

    append_approval(&run_dir.approvals_path(), &Approval::new(action_id, "patch_apply", "reviewer", "looks fine")).unwrap();
    assert!(approval.has_approval(action_id, "patch_apply"));

    let applied = patch_apply_round(&run_dir, &repo_root, 1, winner, &raw_text, &default_edit_surface(), &approval, Some(action_id)).unwrap();
    assert!(applied.blocks.iter().all(|b| b.ok));
    assert_eq!(std::fs::read_to_string(repo_root.join("src/lib.rs")).unwrap(), "new\n");
}

#[test]
fn patch_apply_rejects_paths_outside_the_edit_surface() {
    let root = tempdir().unwrap();
    let repo_root = root.path().join("repo");
    std::fs::create_dir_all(repo_root.join("src")).unwrap();

    let mission = Mission::new("patch something", 1, 3, false, false).unwrap();
    let run_dir = init_run(&mission, &root.path().join("run")).unwrap();
    let approval = FileApprovals { path: run_dir.approvals_path() };

    let raw = "```diff\n--- a/../../etc/passwd\n+++ b/../../etc/passwd\n@@ -1,1 +1,1 @@\n-root\n+pwned\n```\n";
    let report = patch_apply_round(&run_dir, &repo_root, 1, 1, raw, &default_edit_surface(), &approval, None).unwrap();

    assert!(!report.blocks[0].ok);
    assert_eq!(report.blocks[0].reason.as_deref(), Some("disallowed_path"));
}

#[test]
fn evidence_ledger_chain_detects_tampering() {
    let root = tempdir().unwrap();
    let cfg = OrchestratorConfig {
        evidence_key: Some("test-signing-key".to_string()),
        evidence_signing_required: true,
        ..OrchestratorConfig::default()
    };
    let keyring = Keyring::from_config(&cfg);
    let log_path = root.path().join("evidence.jsonl");

    append_signed_entry(&log_path, &keyring, json!({"round": 1, "final_state": "Complete"})).unwrap();
    append_signed_entry(&log_path, &keyring, json!({"round": 2, "final_state": "Complete"})).unwrap();

    let clean = verify_log(&log_path, &keyring);
    assert!(clean.ok);
    assert_eq!(clean.entries, 2);

    let mut content = std::fs::read_to_string(&log_path).unwrap();
    content = content.replace("\"round\":1", "\"round\":99");
    std::fs::write(&log_path, content).unwrap();

    let tampered = verify_log(&log_path, &keyring);
    assert!(!tampered.ok);
}

#[test]
fn risk_scan_blocks_on_secret_pattern_in_added_lines() {
    let content = "let api_key = \"sk-abc1234567890abcdef1234567890\";\nlet x = 1;\n";
    let hits = scan_text("src/lib.rs", content);
    assert!(hits.iter().any(|h| h.name == "generic_api_key_var"));
}
