//! Council orchestrator core.
//!
//! Implements the seven subsystems behind a local multi-agent council run:
//! mission intake, round orchestration, the concurrency governor, the
//! provider router, the decision extractor + repair, patch apply + verify,
//! and the signed evidence ledger (spec §2).

#![allow(dead_code)]

pub mod orchestrator;
pub mod patch;

pub use orchestrator::decision::{Decision, RoundReport};
pub use orchestrator::mission::{compile_team, init_run, Mission, RunDir};
pub use orchestrator::patch_gate::PatchApplyReport;
pub use orchestrator::round::{rank_seats, Round, RoundOutcome, RoundState};
pub use orchestrator::router::{AttemptResult, ProviderCall, ProviderRouter, ProviderSpec};
pub use orchestrator::verify::VerifyReport;
pub use orchestrator::{OrchestratorConfig, OrchestratorError, OrchestratorResult};
