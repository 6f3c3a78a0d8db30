//! Round orchestrator (spec §4.2, the hardest subsystem) — fans out a
//! round's seats concurrently, extracts and repairs decisions, enriches,
//! ranks, optionally patches, and always verifies.
//!
//! The per-round state machine is grounded directly on
//! `crates/swarm-agents/src/state_machine.rs`'s `OrchestratorState` /
//! `is_legal_transition` / `StateMachine::advance` pattern: an explicit enum,
//! a pure transition-guard function, and an append-only transition log. The
//! teacher's mission-level states (`SelectingIssue..Resolved`) are replaced
//! with the spec's per-round states; the teacher's `iteration` field is
//! renamed `round` to avoid the collision with this module's own round
//! counter.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::approvals::HasApproval;
use super::config::OrchestratorConfig;
use super::decision::{build_repair_prompt, extract_round, tail_text, Decision, RoundReport};
use super::enrichers::{run_enrichers, Enricher, EnricherReport};
use super::error::{OrchestratorError, OrchestratorResult};
use super::fsio::atomic_write;
use super::governor::{acquire_slot, append_metric, AgentMetricRow};
use super::mission::{Mission, RunDir};
use super::patch_gate::{default_edit_surface, extract_diff_blocks, patch_apply_round, PatchApplyReport};
use super::router::{BudgetGate, CircuitBreaker, ProviderCall, ProviderRouter, ProviderSpec};
use super::stop::{stop_requested, write_stopped_marker};
use super::unix_now;
use super::verify::{run_pipeline, CheckSpec, VerifyReport};

/// The per-round state machine (spec §4.2 diagram, verbatim).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Init,
    Launching,
    Waiting,
    Extracting,
    Repairing,
    Enriching,
    Ranking,
    Applying,
    Verifying,
    Complete,
    Failed,
    Stopped,
}

impl RoundState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Legal round-state transitions. `Failed` and `Stopped` are reachable from
/// any non-terminal state (spec §4.2: "Any state may transition to STOPPED
/// if the stop flag appears"; `Failed` mirrors that for unrecoverable
/// round-internal IO errors, kept distinct from mission-level strict
/// failure, which rides on [`RoundOutcome::mission_failed`] instead).
fn is_legal_transition(from: RoundState, to: RoundState) -> bool {
    use RoundState::*;

    if !from.is_terminal() && matches!(to, Failed | Stopped) {
        return true;
    }

    matches!(
        (from, to),
        (Init, Launching)
            | (Launching, Waiting)
            | (Waiting, Extracting)
            | (Extracting, Repairing)
            | (Extracting, Enriching)
            | (Repairing, Enriching)
            | (Enriching, Ranking)
            | (Ranking, Applying)
            | (Ranking, Verifying)
            | (Applying, Verifying)
            | (Verifying, Complete)
    )
}

/// One recorded round-state transition (spec §4.2 supplement, grounded on
/// the teacher's `TransitionRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTransition {
    pub from: RoundState,
    pub to: RoundState,
    pub round: u32,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IllegalRoundTransition {
    pub from: RoundState,
    pub to: RoundState,
}

impl fmt::Display for IllegalRoundTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal round transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalRoundTransition {}

/// Tracks the current round state plus its full transition history.
struct RoundStateMachine {
    current: RoundState,
    round: u32,
    created_at: Instant,
    transitions: Vec<RoundTransition>,
}

impl RoundStateMachine {
    fn new(round: u32) -> Self {
        Self { current: RoundState::Init, round, created_at: Instant::now(), transitions: Vec::new() }
    }

    fn advance(&mut self, to: RoundState, reason: Option<&str>) -> Result<(), IllegalRoundTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalRoundTransition { from: self.current, to });
        }
        self.transitions.push(RoundTransition {
            from: self.current,
            to,
            round: self.round,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        tracing::debug!(round = self.round, from = %self.current, to = %to, "round state transition");
        self.current = to;
        Ok(())
    }
}

/// Outcome of one seat's launch attempt within [`Round::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatOutcome {
    pub seat: usize,
    pub role: String,
    pub ok: bool,
    pub timed_out: bool,
    pub local_slot_wait_s: f64,
    pub duration_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything produced by running one round to completion (spec §3/§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub round: u32,
    pub final_state: RoundState,
    pub seat_outcomes: Vec<SeatOutcome>,
    pub decisions_report: Option<RoundReport>,
    pub enricher_reports: Vec<EnricherReport>,
    pub winner: Option<usize>,
    pub patch_report: Option<PatchApplyReport>,
    pub verify_report: Option<VerifyReport>,
    pub transitions: Vec<RoundTransition>,
    pub mission_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// One round's complete set of collaborators, owned rather than borrowed so
/// seat tasks can be spawned as `'static` futures on the runtime's
/// [`JoinSet`] (spec §4.2 "each seat spawn is a task").
pub struct Round {
    pub run_dir: RunDir,
    pub repo_root: PathBuf,
    pub cfg: OrchestratorConfig,
    pub mission: Mission,
    pub round: u32,
    pub providers: Vec<ProviderSpec>,
    pub call: Arc<dyn ProviderCall>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub budget: Arc<dyn BudgetGate>,
    pub approval: Arc<dyn HasApproval>,
    pub enrichers: Vec<Box<dyn Enricher>>,
    pub checks: Vec<CheckSpec>,
    pub require_decisions: bool,
    pub action_id: Option<String>,
    /// External supervisor scores, keyed by seat (spec §3 `VerdictSet`,
    /// optional). Empty unless a supervisor stage populated it upstream.
    pub supervisor_scores: HashMap<usize, f64>,
}

#[allow(clippy::too_many_arguments)]
async fn run_seat(
    seat: usize,
    role: String,
    run_dir: RunDir,
    slots_dir: PathBuf,
    max_local: usize,
    slot_wait: Duration,
    min_free_mem_mb: u64,
    providers: Vec<ProviderSpec>,
    call: Arc<dyn ProviderCall>,
    breaker: Option<Arc<CircuitBreaker>>,
    budget: Arc<dyn BudgetGate>,
    deadline: Duration,
    round: u32,
    parallel_limiter: Arc<tokio::sync::Semaphore>,
) -> SeatOutcome {
    // Bounds live seat subprocesses to `max_parallel`, independent of the
    // `max_local` slot pool (spec §8 invariant 2). Held for the seat's full
    // lifetime so a seat waiting on a slot still counts against the cap.
    let _parallel_permit = parallel_limiter.acquire_owned().await.expect("parallel limiter semaphore never closed");

    let seat_identity = format!("seat-{seat}");
    let wait_started = Instant::now();

    let slot_outcome = {
        let slots_dir = slots_dir.clone();
        let seat_identity = seat_identity.clone();
        tokio::task::spawn_blocking(move || acquire_slot(&slots_dir, max_local, &seat_identity, slot_wait, min_free_mem_mb)).await
    };
    let local_slot_wait_s = wait_started.elapsed().as_secs_f64();

    let guard = match slot_outcome {
        Ok(Ok(guard)) => guard,
        Ok(Err(e)) => {
            let _ = append_metric(
                &run_dir.root,
                &AgentMetricRow { ts: unix_now(), seat, duration_s: 0.0, local_slot_wait_s, ok: false, error: e.to_string() },
            );
            return SeatOutcome { seat, role, ok: false, timed_out: false, local_slot_wait_s, duration_s: 0.0, error: Some(e.to_string()) };
        }
        Err(join_err) => {
            return SeatOutcome { seat, role, ok: false, timed_out: false, local_slot_wait_s, duration_s: 0.0, error: Some(join_err.to_string()) };
        }
    };

    let prompt_text = std::fs::read_to_string(run_dir.prompt_path(seat)).unwrap_or_default();
    let router = ProviderRouter::new(breaker.as_deref(), budget.as_ref());
    let t0 = Instant::now();
    let attempt = tokio::time::timeout(deadline, router.route(&providers, &prompt_text, call.as_ref())).await;
    drop(guard);
    let duration_s = t0.elapsed().as_secs_f64();

    match attempt {
        Ok(attempt) => {
            let _ = atomic_write(&run_dir.seat_output_path(round, seat), attempt.text.as_bytes());
            let _ = append_metric(
                &run_dir.root,
                &AgentMetricRow { ts: unix_now(), seat, duration_s, local_slot_wait_s, ok: attempt.ok, error: attempt.error.clone() },
            );
            SeatOutcome {
                seat,
                role,
                ok: attempt.ok,
                timed_out: false,
                local_slot_wait_s,
                duration_s,
                error: if attempt.ok { None } else { Some(attempt.error) },
            }
        }
        Err(_) => {
            let _ = append_metric(
                &run_dir.root,
                &AgentMetricRow { ts: unix_now(), seat, duration_s, local_slot_wait_s, ok: false, error: "timeout".to_string() },
            );
            SeatOutcome { seat, role, ok: false, timed_out: true, local_slot_wait_s, duration_s, error: Some("deadline exceeded".to_string()) }
        }
    }
}

fn has_diff_block(decision: &Decision) -> bool {
    std::fs::read_to_string(&decision.source_path)
        .map(|text| !extract_diff_blocks(&text).is_empty())
        .unwrap_or(false)
}

/// Tie-break ladder (spec §4.2 ENRICHING→RANKING): (1) presence of a valid
/// decision — implicit, `decisions` already holds only extracted seats; (2)
/// external supervisor score if present; (3) presence of a well-formed
/// `diff` block; (4) higher confidence; (5) lower seat index.
pub fn rank_seats(decisions: &[Decision], supervisor_scores: &HashMap<usize, f64>) -> Option<usize> {
    use std::cmp::Ordering;

    let mut candidates: Vec<&Decision> = decisions.iter().collect();
    candidates.sort_by(|a, b| {
        if !supervisor_scores.is_empty() {
            let sa = supervisor_scores.get(&a.agent).copied();
            let sb = supervisor_scores.get(&b.agent).copied();
            match (sa, sb) {
                (Some(x), Some(y)) => match y.partial_cmp(&x).unwrap_or(Ordering::Equal) {
                    Ordering::Equal => {}
                    other => return other,
                },
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (None, None) => {}
            }
        }

        match has_diff_block(b).cmp(&has_diff_block(a)) {
            Ordering::Equal => {}
            other => return other,
        }
        match b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal) {
            Ordering::Equal => {}
            other => return other,
        }
        a.agent.cmp(&b.agent)
    });
    candidates.first().map(|d| d.agent)
}

impl Round {
    fn stopped_outcome(&self, sm: RoundStateMachine, seat_outcomes: Vec<SeatOutcome>) -> RoundOutcome {
        RoundOutcome {
            round: self.round,
            final_state: RoundState::Stopped,
            seat_outcomes,
            decisions_report: None,
            enricher_reports: Vec::new(),
            winner: None,
            patch_report: None,
            verify_report: None,
            transitions: sm.transitions,
            mission_failed: false,
            failure_reason: Some("stop requested".to_string()),
        }
    }

    fn advance(&self, sm: &mut RoundStateMachine, to: RoundState, reason: Option<&str>) -> OrchestratorResult<()> {
        sm.advance(to, reason).map_err(|e| OrchestratorError::RuntimeIo(e.to_string()))
    }

    /// Drive one round through its full state machine (spec §4.2).
    pub async fn run(&self) -> OrchestratorResult<RoundOutcome> {
        let mut sm = RoundStateMachine::new(self.round);

        if stop_requested(&self.cfg, &self.run_dir.root) {
            self.advance(&mut sm, RoundState::Stopped, Some("stop flag present at round start"))?;
            let _ = write_stopped_marker(&self.run_dir.root, self.round);
            return Ok(self.stopped_outcome(sm, Vec::new()));
        }

        self.advance(&mut sm, RoundState::Launching, None)?;

        // Caps concurrently-running seats at `max_parallel`, independent of
        // the `max_local` slot pool (spec §4.3/§8 invariant 2).
        let parallel_limiter = Arc::new(tokio::sync::Semaphore::new(self.cfg.max_parallel.max(1)));

        let mut joinset: JoinSet<SeatOutcome> = JoinSet::new();
        for (idx, role) in self.mission.team.iter().enumerate() {
            let seat = idx + 1;
            let role = role.clone();
            let run_dir = self.run_dir.clone();
            let slots_dir = self.run_dir.slots_dir();
            let max_local = self.cfg.max_local;
            let slot_wait = Duration::from_secs(self.cfg.slot_wait_s);
            let min_free_mem_mb = self.cfg.min_free_mem_mb;
            let providers = self.providers.clone();
            let call = Arc::clone(&self.call);
            let breaker = self.breaker.clone();
            let budget = Arc::clone(&self.budget);
            let deadline = Duration::from_secs(self.cfg.seat_deadline_s);
            let round = self.round;
            let limiter = Arc::clone(&parallel_limiter);
            joinset.spawn(async move {
                run_seat(
                    seat, role, run_dir, slots_dir, max_local, slot_wait, min_free_mem_mb, providers, call, breaker, budget, deadline, round,
                    limiter,
                )
                .await
            });
        }

        self.advance(&mut sm, RoundState::Waiting, None)?;

        let mut seat_outcomes = Vec::new();
        let was_stopped = loop {
            tokio::select! {
                next = joinset.join_next() => {
                    match next {
                        Some(Ok(outcome)) => seat_outcomes.push(outcome),
                        Some(Err(_)) => {}
                        None => break false,
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    if stop_requested(&self.cfg, &self.run_dir.root) {
                        joinset.abort_all();
                        break true;
                    }
                }
            }
        };

        if was_stopped {
            self.advance(&mut sm, RoundState::Stopped, Some("stop flag observed while waiting"))?;
            let _ = write_stopped_marker(&self.run_dir.root, self.round);
            return Ok(self.stopped_outcome(sm, seat_outcomes));
        }

        self.advance(&mut sm, RoundState::Extracting, None)?;
        let team_len = self.mission.team.len();
        let mut report = extract_round(&self.run_dir, self.round, team_len, self.require_decisions)?;

        if !report.missing.is_empty() {
            self.advance(&mut sm, RoundState::Repairing, Some(&format!("{} seat(s) missing a decision", report.missing.len())))?;

            let mission_anchor = std::fs::read_to_string(self.run_dir.mission_anchor_path()).unwrap_or_default();
            let repair_deadline = Duration::from_secs((self.cfg.seat_deadline_s / 3).max(60));

            for attempt in 1..=self.cfg.repair_attempts_max {
                if report.missing.is_empty() {
                    break;
                }
                for seat in report.missing.clone() {
                    let tail = tail_text(&self.run_dir.seat_output_path(self.round, seat), self.cfg.repair_tail_chars);
                    let prompt = build_repair_prompt(&mission_anchor, self.round, seat, &tail);
                    let router = ProviderRouter::new(self.breaker.as_deref(), self.budget.as_ref());
                    let result = tokio::time::timeout(repair_deadline, router.route(&self.providers, &prompt, self.call.as_ref())).await;
                    if let Ok(attempt_result) = result {
                        let _ = atomic_write(&self.run_dir.repair_output_path(self.round, seat, attempt), attempt_result.text.as_bytes());
                    }
                }
                report = extract_round(&self.run_dir, self.round, team_len, self.require_decisions)?;
            }

            self.advance(&mut sm, RoundState::Enriching, None)?;
        } else {
            self.advance(&mut sm, RoundState::Enriching, None)?;
        }

        let all_missing = report.missing.len() == team_len;

        let mut decisions: Vec<Decision> = Vec::new();
        for seat in 1..=team_len {
            if report.missing.contains(&seat) {
                continue;
            }
            if let Ok(text) = std::fs::read_to_string(self.run_dir.decision_path(self.round, seat)) {
                if let Ok(decision) = serde_json::from_str::<Decision>(&text) {
                    decisions.push(decision);
                }
            }
        }

        let enricher_reports = run_enrichers(&self.run_dir, self.round, &decisions, &self.enrichers).await;

        self.advance(&mut sm, RoundState::Ranking, None)?;
        let winner = rank_seats(&decisions, &self.supervisor_scores);

        let can_apply = self.round >= 2 && winner.is_some();
        let patch_report = if can_apply {
            self.advance(&mut sm, RoundState::Applying, None)?;
            let seat = winner.expect("can_apply implies winner is Some");
            let decision = decisions.iter().find(|d| d.agent == seat);
            let raw_text = decision.map(|d| std::fs::read_to_string(&d.source_path).unwrap_or_default()).unwrap_or_default();
            let report = patch_apply_round(
                &self.run_dir,
                &self.repo_root,
                self.round,
                seat,
                &raw_text,
                &default_edit_surface(),
                self.approval.as_ref(),
                self.action_id.as_deref(),
            )?;
            Some(report)
        } else {
            None
        };

        self.advance(&mut sm, RoundState::Verifying, None)?;
        let verify_report = Some(
            run_pipeline(
                &self.run_dir,
                &self.repo_root,
                &self.checks,
                Duration::from_secs(self.cfg.seat_deadline_s),
                self.cfg.allow_risky_code,
            )
            .await?,
        );

        self.advance(&mut sm, RoundState::Complete, None)?;

        let strict_verify_failed = self.mission.strict
            && patch_report.is_some()
            && !verify_report.as_ref().map(|v| v.ok).unwrap_or(true);
        let mission_failed = all_missing || strict_verify_failed;
        let failure_reason = if all_missing {
            Some("every seat missing a decision after repair".to_string())
        } else if strict_verify_failed {
            Some("strict mode: verify failed in a round that applied a patch".to_string())
        } else {
            None
        };

        Ok(RoundOutcome {
            round: self.round,
            final_state: RoundState::Complete,
            seat_outcomes,
            decisions_report: Some(report),
            enricher_reports,
            winner,
            patch_report,
            verify_report,
            transitions: sm.transitions,
            mission_failed,
            failure_reason,
        })
    }
}
