//! Council orchestrator — the seven core subsystems plus mission intake.
//!
//! Dependency order, leaves first (spec §2): [`ledger`] → [`idempotency`] →
//! [`governor`] → [`router`] → [`decision`] → [`patch_gate`] → [`verify`] →
//! [`round`] → [`mission`].

pub mod approvals;
pub mod config;
pub mod decision;
pub mod enrichers;
pub mod error;
pub mod fsio;
pub mod governor;
pub mod idempotency;
pub mod ledger;
pub mod mission;
pub mod patch_gate;
pub mod risk_scan;
pub mod round;
pub mod router;
pub mod stop;
pub mod verify;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, OrchestratorResult};
pub use mission::{compile_team, init_run, Mission, RunDir};
pub use round::{rank_seats, Round, RoundOutcome, RoundState};

/// Unix seconds as `f64`, per spec §6 ("timestamps are Unix seconds (float)").
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// 95th percentile of a slice of samples, nearest-rank, matching
/// `adaptive_concurrency.py::p95`'s `sorted[round(0.95*(len-1))]`.
pub fn p95(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut xs: Vec<f64> = samples.to_vec();
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((0.95 * (xs.len() - 1) as f64).round() as usize).min(xs.len() - 1);
    xs[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p95_matches_nearest_rank() {
        let xs: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        // round(0.95 * 19) = round(18.05) = 18 -> xs[18] = 19
        assert_eq!(p95(&xs), 19.0);
    }

    #[test]
    fn p95_empty_is_zero() {
        assert_eq!(p95(&[]), 0.0);
    }
}
