mod config;
mod provider;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};

use coordination::orchestrator::approvals::{append_approval, Approval, FileApprovals};
use coordination::orchestrator::decision::extract_round;
use coordination::orchestrator::governor::{recommend_concurrency, write_concurrency_plan, ConcurrencyLevels, CpuProbe};
use coordination::orchestrator::ledger::{append_signed_entry, sink_entry, verify_log, Keyring};
use coordination::orchestrator::mission::init_run;
use coordination::orchestrator::patch_gate::{default_edit_surface, patch_apply_round};
use coordination::orchestrator::rank_seats;
use coordination::orchestrator::risk_scan::scan_staged;
use coordination::orchestrator::router::CircuitBreaker;
use coordination::orchestrator::verify::{default_checks, run_pipeline};
use coordination::{Decision, Mission, OrchestratorConfig, Round, RunDir};

use config::{provider_ladder, EnvBudgetGate};
use provider::SeatRunner;

/// Council orchestrator CLI (spec §6). Drives a multi-round, multi-seat
/// mission end to end, or runs one stage in isolation against an existing
/// RunDir for operators and CI.
#[derive(Parser)]
#[command(name = "council", about = "Multi-agent council orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full mission: compile the team, drive every round, apply the
    /// winning patch from round 2 onward, and verify.
    Run {
        #[arg(long)]
        task: String,
        #[arg(long, default_value_t = 2)]
        rounds: u32,
        #[arg(long, default_value_t = 3)]
        parallel: usize,
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        online: bool,
        #[arg(long)]
        run_dir: Option<PathBuf>,
    },
    /// Re-extract decisions for an already-run round.
    ExtractDecisions {
        #[arg(long = "run-dir")]
        run_dir: PathBuf,
        #[arg(long)]
        round: u32,
        #[arg(long)]
        require: bool,
        /// Number of seats in the mission's team; read from the manifest when omitted.
        #[arg(long)]
        agent_count: Option<usize>,
    },
    /// Apply the winning seat's diff for a round that has already been extracted.
    PatchApply {
        #[arg(long = "run-dir")]
        run_dir: PathBuf,
        #[arg(long)]
        round: u32,
        #[arg(long = "action-id")]
        action_id: Option<String>,
    },
    /// Run the verify pipeline against a RunDir's working tree.
    Verify {
        #[arg(long = "run-dir")]
        run_dir: PathBuf,
        #[arg(long)]
        strict: bool,
        #[arg(long = "repo-root")]
        repo_root: Option<PathBuf>,
    },
    /// Scan the staged git index for secrets and risk markers.
    ScanRisk {
        #[arg(long)]
        staged: bool,
        #[arg(long = "repo-root")]
        repo_root: Option<PathBuf>,
    },
    /// Evidence ledger operations.
    Ledger {
        #[command(subcommand)]
        action: LedgerCommand,
    },
    /// Append a HITL approval row.
    Approve {
        #[arg(long = "run-dir")]
        run_dir: PathBuf,
        #[arg(long = "action-id")]
        action_id: String,
        #[arg(long, default_value = "patch_apply")]
        kind: String,
        #[arg(long, default_value = "human")]
        actor: String,
        #[arg(long, default_value = "")]
        note: String,
    },
}

#[derive(Subcommand)]
enum LedgerCommand {
    /// Verify chain integrity of an evidence ledger file.
    Verify {
        #[arg(long)]
        path: PathBuf,
    },
}

/// Compact JSON summary printed on exit (spec §7 "never raw stack traces
/// in normal flow").
fn print_summary(ok: bool, kind: &str, artifacts: serde_json::Value) {
    println!("{}", json!({"ok": ok, "error_kind": kind, "artifacts": artifacts}));
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run { task, rounds, parallel, strict, online, run_dir } => run_mission(task, rounds, parallel, strict, online, run_dir).await,
        Command::ExtractDecisions { run_dir, round, require, agent_count } => extract_decisions_cmd(run_dir, round, require, agent_count),
        Command::PatchApply { run_dir, round, action_id } => patch_apply_cmd(run_dir, round, action_id),
        Command::Verify { run_dir, strict, repo_root } => verify_cmd(run_dir, strict, repo_root).await,
        Command::ScanRisk { staged, repo_root } => scan_risk_cmd(staged, repo_root),
        Command::Ledger { action: LedgerCommand::Verify { path } } => ledger_verify_cmd(path),
        Command::Approve { run_dir, action_id, kind, actor, note } => approve_cmd(run_dir, action_id, kind, actor, note),
    };
    std::process::exit(code);
}

async fn run_mission(task: String, rounds: u32, parallel: usize, strict: bool, online: bool, run_dir_override: Option<PathBuf>) -> i32 {
    let mission = match Mission::new(task, rounds, parallel, online, strict) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "invalid mission");
            print_summary(false, "invalid_mission", json!({}));
            return 1;
        }
    };

    let run_root = run_dir_override.unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("runs").join(&mission.id));
    let run_dir = match init_run(&mission, &run_root) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "failed to initialize run dir");
            print_summary(false, "runtime_io", json!({}));
            return 1;
        }
    };

    info!(mission_id = %mission.id, team = ?mission.team, rounds = mission.max_rounds, "mission intake complete");

    let mut cfg = OrchestratorConfig { max_parallel: parallel, max_local: parallel, ..OrchestratorConfig::default() };
    let rungs = provider_ladder();
    let providers: Vec<_> = rungs.iter().map(|r| r.spec.clone()).collect();
    let call = Arc::new(SeatRunner::new(&rungs));
    let breaker = Arc::new(CircuitBreaker::new(run_dir.providers_path(), cfg.breaker_window_s));
    let budget = Arc::new(EnvBudgetGate::from_env());
    let approval = Arc::new(FileApprovals { path: run_dir.approvals_path() });
    let keyring = Keyring::from_config(&cfg);
    let mut cpu_probe = CpuProbe::new();

    let mut mission_failed = false;
    let mut stopped = false;

    for round_no in 1..=mission.max_rounds {
        let round = Round {
            run_dir: run_dir.clone(),
            repo_root: cfg.repo_root.clone(),
            cfg: cfg.clone(),
            mission: mission.clone(),
            round: round_no,
            providers: providers.clone(),
            call: call.clone(),
            breaker: Some(breaker.clone()),
            budget: budget.clone(),
            approval: approval.clone(),
            enrichers: Vec::new(),
            checks: default_checks(),
            require_decisions: false,
            action_id: None,
            supervisor_scores: HashMap::new(),
        };

        let outcome = match round.run().await {
            Ok(o) => o,
            Err(e) => {
                error!(round = round_no, error = %e, "round driver failed");
                print_summary(false, e.kind(), json!({"round": round_no}));
                return e.exit_code();
            }
        };

        let entry_payload = json!({
            "round": outcome.round,
            "final_state": outcome.final_state,
            "winner": outcome.winner,
            "mission_failed": outcome.mission_failed,
        });
        match append_signed_entry(&run_dir.root.join("state").join("evidence.jsonl"), &keyring, entry_payload) {
            Ok(entry) => sink_entry(&entry, cfg.evidence_sink_path.as_deref(), cfg.evidence_sink_url.as_deref()).await,
            Err(e) => warn!(error = %e, "evidence ledger append failed"),
        }

        info!(round = round_no, final_state = %outcome.final_state, winner = ?outcome.winner, "round complete");

        // Adaptive feedback loop (spec §4.3): read this round's metrics,
        // recommend (never raise) the next round's concurrency levels, and
        // persist the plan so it's inspectable from the RunDir (spec §6).
        let plan = recommend_concurrency(
            &run_dir.root,
            ConcurrencyLevels { max_parallel: cfg.max_parallel, max_local: cfg.max_local },
            cpu_probe.sample(),
        );
        if !plan.reasons.is_empty() {
            info!(round = round_no, reasons = ?plan.reasons, "concurrency governor throttling next round");
        }
        if let Err(e) = write_concurrency_plan(&run_dir.root, &plan) {
            warn!(error = %e, "failed to write concurrency plan");
        }
        cfg.max_parallel = plan.recommended.max_parallel;
        cfg.max_local = plan.recommended.max_local;

        if outcome.final_state == coordination::orchestrator::RoundState::Stopped {
            stopped = true;
            break;
        }
        if outcome.mission_failed {
            mission_failed = true;
            break;
        }
    }

    let artifacts = json!({"run_dir": run_dir.root});
    if stopped {
        print_summary(false, "stop_requested", artifacts);
        2
    } else if mission_failed {
        print_summary(false, "mission_failed", artifacts);
        1
    } else {
        print_summary(true, "", artifacts);
        0
    }
}

fn extract_decisions_cmd(run_dir: PathBuf, round: u32, require: bool, agent_count: Option<usize>) -> i32 {
    let run_dir = RunDir::new(run_dir);
    let agent_count = agent_count.or_else(|| read_team_len(&run_dir)).unwrap_or(0);
    match extract_round(&run_dir, round, agent_count, require) {
        Ok(report) => {
            let ok = report.ok;
            print_summary(ok, if ok { "" } else { "contract_violation" }, json!({"report": report}));
            if ok { 0 } else { 2 }
        }
        Err(e) => {
            print_summary(false, e.kind(), json!({}));
            e.exit_code()
        }
    }
}

fn read_team_len(run_dir: &RunDir) -> Option<usize> {
    let manifest = std::fs::read_to_string(run_dir.manifest_path()).ok()?;
    let mission: Mission = serde_json::from_str(&manifest).ok()?;
    Some(mission.team.len())
}

fn patch_apply_cmd(run_dir: PathBuf, round: u32, action_id: Option<String>) -> i32 {
    let run_dir = RunDir::new(run_dir);
    let repo_root = std::env::var("REPO_ROOT").map(PathBuf::from).unwrap_or_else(|_| run_dir.root.clone());
    let team_len = read_team_len(&run_dir).unwrap_or(0);

    let mut decisions: Vec<Decision> = Vec::new();
    for seat in 1..=team_len {
        if let Ok(text) = std::fs::read_to_string(run_dir.decision_path(round, seat)) {
            if let Ok(decision) = serde_json::from_str::<Decision>(&text) {
                decisions.push(decision);
            }
        }
    }

    let Some(winner) = rank_seats(&decisions, &HashMap::new()) else {
        print_summary(false, "contract_violation", json!({}));
        return 4;
    };
    let decision = decisions.iter().find(|d| d.agent == winner);
    let raw_text = decision.map(|d| std::fs::read_to_string(&d.source_path).unwrap_or_default()).unwrap_or_default();
    let approval = FileApprovals { path: run_dir.approvals_path() };

    match patch_apply_round(&run_dir, &repo_root, round, winner, &raw_text, &default_edit_surface(), &approval, action_id.as_deref()) {
        Ok(report) => {
            let ok = report.blocks.iter().all(|b| b.ok);
            let disallowed = report.blocks.iter().any(|b| b.reason.as_deref() == Some("disallowed_path"));
            print_summary(ok, if ok { "" } else if disallowed { "disallowed_path" } else { "patch_block_error" }, json!({"report": report}));
            if ok { 0 } else if disallowed { 5 } else { 4 }
        }
        Err(e) => {
            print_summary(false, e.kind(), json!({}));
            e.exit_code()
        }
    }
}

async fn verify_cmd(run_dir: PathBuf, strict: bool, repo_root: Option<PathBuf>) -> i32 {
    let run_dir = RunDir::new(run_dir);
    let repo_root = repo_root.unwrap_or_else(|| std::env::var("REPO_ROOT").map(PathBuf::from).unwrap_or_else(|_| run_dir.root.clone()));
    let allow_risky = std::env::var("ALLOW_RISKY_CODE").map(|v| v != "0" && !v.is_empty()).unwrap_or(false);

    match run_pipeline(&run_dir, &repo_root, &default_checks(), Duration::from_secs(900), allow_risky).await {
        Ok(report) => {
            let ok = report.ok;
            let kind = if !ok && report.scan.exit_code != 0 {
                if report.scan.exit_code == 2 { "secrets_found" } else { "risk_found" }
            } else if !ok {
                "verify_failed"
            } else {
                ""
            };
            print_summary(ok, kind, json!({"report": report}));
            if !ok && strict { 1 } else { 0 }
        }
        Err(e) => {
            print_summary(false, e.kind(), json!({}));
            e.exit_code()
        }
    }
}

fn scan_risk_cmd(_staged: bool, repo_root: Option<PathBuf>) -> i32 {
    let repo_root = repo_root.unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    let allow_risky = std::env::var("ALLOW_RISKY_CODE").map(|v| v != "0" && !v.is_empty()).unwrap_or(false);
    let report = scan_staged(&repo_root, allow_risky);
    let ok = report.exit_code == 0;
    print_summary(ok, if ok { "" } else if report.exit_code == 2 { "secrets_found" } else { "risk_found" }, json!({"report": report}));
    report.exit_code
}

fn ledger_verify_cmd(path: PathBuf) -> i32 {
    let cfg = OrchestratorConfig::default();
    let keyring = Keyring::from_config(&cfg);
    let outcome = verify_log(&path, &keyring);
    print_summary(outcome.ok, if outcome.ok { "" } else { "chain_broken" }, json!({"outcome": outcome}));
    if outcome.ok { 0 } else { 2 }
}

fn approve_cmd(run_dir: PathBuf, action_id: String, kind: String, actor: String, note: String) -> i32 {
    let run_dir = RunDir::new(run_dir);
    let approval = Approval::new(action_id, kind, actor, note);
    match append_approval(&run_dir.approvals_path(), &approval) {
        Ok(()) => {
            print_summary(true, "", json!({}));
            0
        }
        Err(e) => {
            print_summary(false, e.kind(), json!({}));
            e.exit_code()
        }
    }
}
