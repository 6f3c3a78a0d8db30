//! Mission intake (spec §4.1) — team compilation and RunDir materialization.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{OrchestratorError, OrchestratorResult};
use super::fsio::atomic_write;

/// Core roles every team seeds with, in order, never dropped (spec §4.1).
const CORE_ROLES: &[&str] = &["Architect", "Engineer", "Tester", "Critic"];

/// Keyword-to-role table, in append order, grounded verbatim on
/// `team_compiler.py::compile_team`.
const SITUATIONAL_ROLES: &[(&str, &[&str])] = &[
    (
        "ResearchLead",
        &["research", "browse", "web", "docs", "compare", "evaluate", "latest"],
    ),
    (
        "Security",
        &["security", "threat", "prompt injection", "secrets", "rbac", "auth"],
    ),
    (
        "Release",
        &["deploy", "release", "version", "changelog", "ship"],
    ),
    (
        "Ops",
        &["ops", "monitor", "logging", "tracing", "sentry", "metrics"],
    ),
    ("Docs", &["docs", "readme", "documentation"]),
];

/// `CompileTeam(prompt) → [role]` — deterministic, order-preserving,
/// de-duplicated, clamped to 3..=7 (the 4-role core makes under-3
/// unreachable).
pub fn compile_team(prompt: &str) -> Vec<String> {
    let lower = prompt.to_lowercase();
    let mut roles: Vec<String> = CORE_ROLES.iter().map(|s| s.to_string()).collect();

    for (role, markers) in SITUATIONAL_ROLES {
        if markers.iter().any(|m| lower.contains(m)) {
            roles.push(role.to_string());
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut deduped: Vec<String> = Vec::new();
    for r in roles {
        if seen.insert(r.clone()) {
            deduped.push(r);
        }
    }

    deduped.truncate(7);
    deduped
}

/// Per-mission run budgets and preferences, written to `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub prompt: String,
    pub team: Vec<String>,
    pub max_rounds: u32,
    pub max_parallel: usize,
    pub online: bool,
    pub strict: bool,
}

impl Mission {
    /// Build a mission from a free-form task prompt, compiling the team
    /// and validating the team-size invariant (spec §3: team size in [3,7]).
    pub fn new(
        prompt: impl Into<String>,
        max_rounds: u32,
        max_parallel: usize,
        online: bool,
        strict: bool,
    ) -> OrchestratorResult<Self> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(OrchestratorError::InvalidMission);
        }
        let team = compile_team(&prompt);
        if team.len() < 3 || team.len() > 7 {
            return Err(OrchestratorError::InvalidMission);
        }
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt,
            team,
            max_rounds,
            max_parallel,
            online,
            strict,
        })
    }
}

/// The filesystem root of a single mission's artifacts (spec §3, §6).
#[derive(Debug, Clone)]
pub struct RunDir {
    pub root: PathBuf,
}

impl RunDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn mission_anchor_path(&self) -> PathBuf {
        self.root.join("mission_anchor.md")
    }

    pub fn prompt_path(&self, seat: usize) -> PathBuf {
        self.root.join(format!("prompt{seat}.txt"))
    }

    pub fn seat_output_path(&self, round: u32, seat: usize) -> PathBuf {
        self.root.join(format!("round{round}_agent{seat}.md"))
    }

    pub fn decisions_dir(&self) -> PathBuf {
        self.state_dir().join("decisions")
    }

    pub fn decision_path(&self, round: u32, seat: usize) -> PathBuf {
        self.decisions_dir().join(format!("round{round}_agent{seat}.json"))
    }

    pub fn decisions_report_path(&self, round: u32) -> PathBuf {
        self.state_dir().join(format!("decisions_round{round}.json"))
    }

    pub fn repairs_dir(&self) -> PathBuf {
        self.state_dir().join("repairs")
    }

    pub fn repair_output_path(&self, round: u32, seat: usize, attempt: u32) -> PathBuf {
        self.repairs_dir()
            .join(format!("round{round}_agent{seat}_repair{attempt}.md"))
    }

    pub fn patch_apply_report_path(&self, round: u32) -> PathBuf {
        self.state_dir().join(format!("patch_apply_round{round}.json"))
    }

    pub fn verify_report_path(&self) -> PathBuf {
        self.state_dir().join("verify_report.json")
    }

    pub fn agent_metrics_path(&self) -> PathBuf {
        self.state_dir().join("agent_metrics.jsonl")
    }

    pub fn concurrency_path(&self) -> PathBuf {
        self.state_dir().join("concurrency.json")
    }

    pub fn slots_dir(&self) -> PathBuf {
        self.state_dir().join("local_slots")
    }

    pub fn providers_path(&self) -> PathBuf {
        self.state_dir().join("providers.json")
    }

    pub fn approvals_path(&self) -> PathBuf {
        self.state_dir().join("approvals.jsonl")
    }

    pub fn actions_path(&self) -> PathBuf {
        self.state_dir().join("actions.jsonl")
    }
}

/// A header shared by every per-seat prompt, followed by the role template.
fn render_prompt(mission: &Mission, role: &str, seat: usize) -> String {
    format!(
        "[SYSTEM]\nROLE: {role}\nSEAT: {seat}\nTEAM: {team}\n\n[TASK]\n{task}\n\n\
         [INSTRUCTIONS]\nReturn your analysis as prose followed by exactly one fenced JSON \
         block labeled DECISION_JSON with keys: summary, files, commands, risks, confidence.\n",
        role = role,
        seat = seat,
        team = mission.team.join(", "),
        task = mission.prompt.trim(),
    )
}

/// `InitRun(mission) → RunDir` — creates `state/`, writes the manifest,
/// mission anchor, and one `promptK.txt` per seat.
pub fn init_run(mission: &Mission, root: &Path) -> OrchestratorResult<RunDir> {
    let run_dir = RunDir::new(root);
    std::fs::create_dir_all(run_dir.state_dir())?;

    atomic_write(
        &run_dir.manifest_path(),
        serde_json::to_string_pretty(mission)?.as_bytes(),
    )?;
    atomic_write(&run_dir.mission_anchor_path(), mission.prompt.as_bytes())?;

    for (idx, role) in mission.team.iter().enumerate() {
        let seat = idx + 1;
        atomic_write(
            &run_dir.prompt_path(seat),
            render_prompt(mission, role, seat).as_bytes(),
        )?;
    }

    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn core_roles_always_present() {
        let team = compile_team("write a poem");
        assert_eq!(team, vec!["Architect", "Engineer", "Tester", "Critic"]);
    }

    #[test]
    fn situational_roles_append_in_table_order() {
        let team = compile_team("research the latest auth CVEs and ship a release");
        assert_eq!(
            team,
            vec![
                "Architect",
                "Engineer",
                "Tester",
                "Critic",
                "ResearchLead",
                "Security",
                "Release"
            ]
        );
    }

    #[test]
    fn clamped_to_seven() {
        let team = compile_team(
            "research security deploy ops docs auth monitor readme release version",
        );
        assert_eq!(team.len(), 7);
    }

    #[test]
    fn empty_prompt_is_invalid_mission() {
        let err = Mission::new("   ", 2, 3, false, false).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidMission));
    }

    #[test]
    fn init_run_writes_manifest_and_prompts() {
        let dir = tempdir().unwrap();
        let mission = Mission::new("review the auth module", 2, 3, false, false).unwrap();
        let run_dir = init_run(&mission, dir.path()).unwrap();
        assert!(run_dir.manifest_path().exists());
        assert!(run_dir.mission_anchor_path().exists());
        for seat in 1..=mission.team.len() {
            assert!(run_dir.prompt_path(seat).exists());
        }
    }
}
