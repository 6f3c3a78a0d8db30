//! Decision contract layer (spec §4.5) — extraction and repair.
//!
//! Extraction regex equivalents and normalization are grounded verbatim on
//! `extract_agent_decisions.py`; the repair prompt shape on
//! `contract_repair.py::_build_repair_prompt`.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::OrchestratorResult;
use super::fsio::atomic_write_json;
use super::mission::RunDir;
use super::unix_now;

fn decision_fence_re() -> Regex {
    Regex::new(r"(?is)```json\s+DECISION_JSON\s*(.*?)```").unwrap()
}

fn generic_json_fence_re() -> Regex {
    Regex::new(r"(?is)```json\s*(.*?)```").unwrap()
}

fn try_parse_json_object(blob: &str) -> Option<Value> {
    let blob = blob.trim();
    if blob.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(blob).ok()?;
    if value.is_object() {
        Some(value)
    } else {
        None
    }
}

/// Scan `text` for a `DECISION_JSON`-labeled fence; fall back to the first
/// generic JSON fence that looks like the schema (spec §4.5 extraction).
pub fn extract_decision_object(text: &str) -> Option<Value> {
    if let Some(caps) = decision_fence_re().captures(text) {
        if let Some(obj) = try_parse_json_object(&caps[1]) {
            return Some(obj);
        }
    }
    for caps in generic_json_fence_re().captures_iter(text) {
        let Some(obj) = try_parse_json_object(&caps[1]) else {
            continue;
        };
        let has_known_key = ["files", "commands", "summary", "plan"]
            .iter()
            .any(|k| obj.get(k).is_some());
        if has_known_key {
            return Some(obj);
        }
    }
    None
}

/// Normalized structured decision (spec §3 `Decision`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub agent: usize,
    pub round: u32,
    pub summary: String,
    pub files: Vec<String>,
    pub commands: Vec<String>,
    pub risks: Vec<String>,
    pub confidence: f64,
    pub raw: Value,
    pub extracted_at: f64,
    pub source_path: String,
}

fn string_array(obj: &Value, key: &str) -> Vec<String> {
    obj.get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .filter(|s| !s.trim().is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Normalize a raw decision object into the [`Decision`] entity, clamping
/// confidence to `[0,1]` and coercing missing arrays to empty.
pub fn normalize(obj: Value, agent: usize, round: u32, source_path: &Path) -> Decision {
    let summary = obj
        .get("summary")
        .and_then(|v| v.as_str())
        .or_else(|| obj.get("plan").and_then(|v| v.as_str()))
        .unwrap_or("")
        .trim()
        .to_string();
    let confidence = obj
        .get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);

    Decision {
        agent,
        round,
        summary,
        files: string_array(&obj, "files"),
        commands: string_array(&obj, "commands"),
        risks: string_array(&obj, "risks"),
        confidence,
        raw: obj,
        extracted_at: unix_now(),
        source_path: source_path.display().to_string(),
    }
}

/// The newest repair output file for `(round, agent)`, if any (spec §4.5:
/// "extraction re-runs and preferentially uses the newest repair output").
pub fn latest_repair_output(run_dir: &RunDir, round: u32, agent: usize) -> Option<PathBuf> {
    let repairs = run_dir.repairs_dir();
    let mut candidates: Vec<(u32, PathBuf)> = std::fs::read_dir(&repairs)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            let prefix = format!("round{round}_agent{agent}_repair");
            let suffix = name.strip_prefix(&prefix)?.strip_suffix(".md")?;
            suffix.parse::<u32>().ok().map(|attempt| (attempt, e.path()))
        })
        .collect();
    candidates.sort_by_key(|(attempt, _)| *attempt);
    candidates.pop().map(|(_, path)| path)
}

/// Report written once per round after extraction (+ repair), spec §3
/// `RoundReport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundReport {
    pub ok: bool,
    pub round: u32,
    pub agent_count: usize,
    pub extracted: usize,
    pub missing: Vec<usize>,
    pub generated_at: f64,
}

/// Extract decisions for every seat `1..=agent_count` in `round`, writing
/// one file per seat plus the round-level report. `require` governs
/// whether missing decisions make the report non-`ok` (spec §4.5 /
/// §9 Open Question 2).
pub fn extract_round(
    run_dir: &RunDir,
    round: u32,
    agent_count: usize,
    require: bool,
) -> OrchestratorResult<RoundReport> {
    std::fs::create_dir_all(run_dir.decisions_dir())?;
    let mut missing = Vec::new();
    let mut extracted = 0usize;

    for seat in 1..=agent_count {
        let primary = run_dir.seat_output_path(round, seat);
        let mut source = primary.clone();
        let mut text = std::fs::read_to_string(&primary).unwrap_or_default();
        let mut obj = extract_decision_object(&text);

        if obj.is_none() {
            if let Some(repair_path) = latest_repair_output(run_dir, round, seat) {
                text = std::fs::read_to_string(&repair_path).unwrap_or_default();
                obj = extract_decision_object(&text);
                if obj.is_some() {
                    source = repair_path;
                }
            }
        }

        match obj {
            Some(obj) => {
                let decision = normalize(obj, seat, round, &source);
                atomic_write_json(&run_dir.decision_path(round, seat), &decision)?;
                extracted += 1;
            }
            None => missing.push(seat),
        }
    }

    let report = RoundReport {
        ok: missing.is_empty() || !require,
        round,
        agent_count,
        extracted,
        missing,
        generated_at: unix_now(),
    };
    atomic_write_json(&run_dir.decisions_report_path(round), &report)?;
    Ok(report)
}

/// Deterministic repair prompt (spec §4.5), grounded verbatim on
/// `contract_repair.py::_build_repair_prompt`.
pub fn build_repair_prompt(
    mission_anchor: &str,
    round: u32,
    agent: usize,
    prior_tail: &str,
) -> String {
    format!(
        "[SYSTEM]\n\
         REPAIR_MODE=decision_json\n\
         You are repairing a contract violation. Output must be machine-parseable.\n\n\
         ROUND: {round}\n\
         AGENT_ID: {agent}\n\n\
         TASK:\n{task}\n\n\
         [INSTRUCTIONS]\n\
         - Return EXACTLY ONE fenced JSON block labeled DECISION_JSON.\n\
         - No prose outside the JSON fence.\n\
         - The JSON must include keys: summary (string), files (array), commands (array), \
           risks (array), confidence (0..1).\n\
         - files must be repo-relative paths only (no absolute paths, no drive letters, no .. traversal).\n\
         - commands must be runnable commands to verify your suggested work.\n\n\
         [PRIOR_OUTPUT_TAIL]\n{tail}\n",
        round = round,
        agent = agent,
        task = mission_anchor.trim(),
        tail = {
            let trimmed = prior_tail.trim();
            if trimmed.is_empty() { "(empty)" } else { trimmed }
        },
    )
}

/// Tail the last `max_chars` characters of `path`'s contents.
pub fn tail_text(path: &Path, max_chars: usize) -> String {
    let text = std::fs::read_to_string(path).unwrap_or_default();
    if max_chars == 0 || text.chars().count() <= max_chars {
        return text;
    }
    let start = text.chars().count() - max_chars;
    text.chars().skip(start).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "Here is my plan.\n```json DECISION_JSON\n{\"summary\":\"do it\",\"files\":[\"a.rs\"],\"commands\":[],\"risks\":[],\"confidence\":1.4}\n```\n";

    #[test]
    fn extracts_labeled_fence() {
        let obj = extract_decision_object(SAMPLE).unwrap();
        assert_eq!(obj["summary"], "do it");
    }

    #[test]
    fn falls_back_to_generic_fence_with_known_key() {
        let text = "```json\n{\"plan\":\"x\",\"files\":[]}\n```";
        let obj = extract_decision_object(text).unwrap();
        assert_eq!(obj["plan"], "x");
    }

    #[test]
    fn confidence_is_clamped() {
        let obj = extract_decision_object(SAMPLE).unwrap();
        let decision = normalize(obj, 1, 1, Path::new("out.md"));
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn two_generic_fences_no_label_picks_first_with_known_key() {
        let text = "```json\n{\"irrelevant\":true}\n```\nmore prose\n```json\n{\"summary\":\"s\",\"files\":[]}\n```";
        let obj = extract_decision_object(text).unwrap();
        assert_eq!(obj["summary"], "s");
    }

    #[test]
    fn repair_is_noop_law_on_compliant_output() {
        let before = extract_decision_object(SAMPLE).unwrap();
        let prompt = build_repair_prompt("task", 1, 1, SAMPLE);
        // Compliant output never reaches repair in the orchestrator; this
        // asserts extraction itself is idempotent on the same text.
        let after = extract_decision_object(SAMPLE).unwrap();
        assert_eq!(before, after);
        assert!(prompt.contains("REPAIR_MODE=decision_json"));
    }

    #[test]
    fn missing_decision_marks_seat_and_report_policy() {
        let dir = tempdir().unwrap();
        let run_dir = RunDir::new(dir.path());
        std::fs::create_dir_all(run_dir.state_dir()).unwrap();
        std::fs::write(run_dir.seat_output_path(1, 1), SAMPLE).unwrap();
        std::fs::write(run_dir.seat_output_path(1, 2), "no json here").unwrap();

        let report = extract_round(&run_dir, 1, 2, false).unwrap();
        assert_eq!(report.extracted, 1);
        assert_eq!(report.missing, vec![2]);
        assert!(report.ok); // not required -> still ok

        let report_required = extract_round(&run_dir, 1, 2, true).unwrap();
        assert!(!report_required.ok);
    }

    #[test]
    fn extraction_prefers_newest_repair_output() {
        let dir = tempdir().unwrap();
        let run_dir = RunDir::new(dir.path());
        std::fs::create_dir_all(run_dir.repairs_dir()).unwrap();
        std::fs::write(run_dir.seat_output_path(1, 2), "no json here").unwrap();
        std::fs::write(run_dir.repair_output_path(1, 2, 1), "still nothing").unwrap();
        std::fs::write(run_dir.repair_output_path(1, 2, 2), SAMPLE).unwrap();

        let latest = latest_repair_output(&run_dir, 1, 2).unwrap();
        assert_eq!(latest, run_dir.repair_output_path(1, 2, 2));
    }
}
