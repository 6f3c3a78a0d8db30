//! Closed error taxonomy for the council orchestrator.
//!
//! One variant per kind in the spec's error taxonomy. Seat-local failures
//! (timeout, local_overload, budget_exhausted, circuit_open, provider_error,
//! contract_violation) degrade a single seat and never construct this type
//! directly from the round driver — they're recorded in per-seat metrics.
//! `runtime_io` and `chain_broken` are mission-fatal; `verify_failed` is
//! fatal only in strict mode; `stop_requested` always terminates the run.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("mission prompt is missing or empty")]
    InvalidMission,

    #[error("filesystem or IO failure: {0}")]
    RuntimeIo(String),

    #[error("deadline exceeded for seat {seat} after {elapsed_s:.1}s")]
    Timeout { seat: usize, elapsed_s: f64 },

    #[error("local slot acquisition timed out after {waited_s:.1}s")]
    LocalOverload { waited_s: f64 },

    #[error("provider {provider} skipped: budget exhausted")]
    BudgetExhausted { provider: String },

    #[error("provider {provider} skipped: circuit open")]
    CircuitOpen { provider: String },

    #[error("all providers exhausted: {0}")]
    ProviderError(String),

    #[error("seat {seat} produced no valid DECISION_JSON after repair")]
    ContractViolation { seat: usize },

    #[error("patch touched disallowed path: {path}")]
    DisallowedPath { path: PathBuf },

    #[error("verify pipeline failed: {0}")]
    VerifyFailed(String),

    #[error("evidence ledger chain broken at line {line}: {reason}")]
    ChainBroken { line: usize, reason: String },

    #[error("cooperative stop requested")]
    StopRequested,
}

impl OrchestratorError {
    /// The taxonomy key used in CLI summaries and metrics rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidMission => "invalid_mission",
            Self::RuntimeIo(_) => "runtime_io",
            Self::Timeout { .. } => "timeout",
            Self::LocalOverload { .. } => "local_overload",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ProviderError(_) => "provider_error",
            Self::ContractViolation { .. } => "contract_violation",
            Self::DisallowedPath { .. } => "disallowed_path",
            Self::VerifyFailed(_) => "verify_failed",
            Self::ChainBroken { .. } => "chain_broken",
            Self::StopRequested => "stop_requested",
        }
    }

    /// CLI process exit code for this error, per spec §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StopRequested => 2,
            Self::DisallowedPath { .. } => 5,
            Self::ChainBroken { .. } => 2,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        Self::RuntimeIo(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::RuntimeIo(e.to_string())
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
