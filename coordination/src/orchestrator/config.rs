//! Centralized configuration record.
//!
//! Per spec §9's design note ("Centralize in a single configuration record
//! populated once at intake; downstream components receive the record, not
//! the environment"), every tunable is read from the environment exactly
//! once here, mirroring `SwarmConfig::default()`'s
//! `std::env::var(...).ok().and_then(|s| s.parse().ok()).unwrap_or(default)`
//! idiom from `crates/council-cli/src/config.rs`.

use std::path::PathBuf;

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => !matches!(v.as_str(), "0" | "false" | "False" | ""),
        Err(_) => default,
    }
}

/// All environment-derived tunables for one orchestrator run, resolved
/// once at mission intake (spec §6 "Environment variables").
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// `REPO_ROOT` — root used to resolve edit-surface prefixes and stop flags.
    pub repo_root: PathBuf,
    /// `MIN_FREE_MEM_MB` — governor memory floor (default 1200).
    pub min_free_mem_mb: u64,
    /// `ALLOW_RISKY_CODE` — allow risk-pattern hits without blocking.
    pub allow_risky_code: bool,
    /// `EVIDENCE_HMAC_KEY_ID` — active signing key id (default "local-v1").
    pub evidence_key_id: String,
    /// `EVIDENCE_HMAC_KEY` — active signing key secret, if any.
    pub evidence_key: Option<String>,
    /// `EVIDENCE_HMAC_KEYS_JSON` — full keyring `{key_id: key}` for verification.
    pub evidence_keys_json: Option<String>,
    /// `EVIDENCE_SIGNING_REQUIRED` — fail closed if no active key (default true).
    pub evidence_signing_required: bool,
    /// `EVIDENCE_SINK_PATH` — mirror ledger lines to a second local file.
    pub evidence_sink_path: Option<PathBuf>,
    /// `EVIDENCE_SINK_URL` — mirror ledger lines via HTTP POST.
    pub evidence_sink_url: Option<String>,
    /// `STOP_ALL` — treat as presence of the global stop flag.
    pub stop_all: bool,

    /// Per-seat hard deadline, seconds (spec §4.2 default 900).
    pub seat_deadline_s: u64,
    /// Repair attempt cap (spec §4.5 default 2).
    pub repair_attempts_max: u32,
    /// Repair prior-output tail length, chars (spec §4.5 default 6000).
    pub repair_tail_chars: usize,
    /// Local slot wait budget before `local_overload`, seconds (spec §4.3 default 60).
    pub slot_wait_s: u64,
    /// Number of local concurrency slots, K (spec §4.3).
    pub max_local: usize,
    /// Seat fan-out cap per round (spec §3 Mission.max_parallel).
    pub max_parallel: usize,
    /// Stale slot-lock eviction grace period, seconds.
    pub slot_stale_grace_s: u64,
    /// Provider breaker open window, seconds (spec §4.4 default 120).
    pub breaker_window_s: u64,
    /// Idempotency TTL, days (spec §9 open question 3, resolved to 14).
    pub idempotency_ttl_days: i64,
    /// Stop-grace period before escalating SIGTERM to SIGKILL, seconds (spec §8 invariant 6).
    pub stop_grace_s: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            repo_root: std::env::var("REPO_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::current_dir().unwrap_or_default()),
            min_free_mem_mb: env_parsed("MIN_FREE_MEM_MB", 1200),
            allow_risky_code: env_bool("ALLOW_RISKY_CODE", false),
            evidence_key_id: std::env::var("EVIDENCE_HMAC_KEY_ID")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "local-v1".to_string()),
            evidence_key: std::env::var("EVIDENCE_HMAC_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            evidence_keys_json: std::env::var("EVIDENCE_HMAC_KEYS_JSON")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            evidence_signing_required: env_bool("EVIDENCE_SIGNING_REQUIRED", true),
            evidence_sink_path: std::env::var("EVIDENCE_SINK_PATH").ok().map(PathBuf::from),
            evidence_sink_url: std::env::var("EVIDENCE_SINK_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            stop_all: env_bool("STOP_ALL", false),
            seat_deadline_s: env_parsed("COUNCIL_SEAT_DEADLINE_S", 900),
            repair_attempts_max: env_parsed("COUNCIL_REPAIR_ATTEMPTS_MAX", 2),
            repair_tail_chars: env_parsed("COUNCIL_REPAIR_TAIL_CHARS", 6000),
            slot_wait_s: env_parsed("COUNCIL_SLOT_WAIT_S", 60),
            max_local: env_parsed("COUNCIL_MAX_LOCAL", 2),
            max_parallel: env_parsed("COUNCIL_MAX_PARALLEL", 3),
            slot_stale_grace_s: env_parsed("COUNCIL_SLOT_STALE_GRACE_S", 120),
            breaker_window_s: env_parsed("COUNCIL_BREAKER_WINDOW_S", 120),
            idempotency_ttl_days: env_parsed("COUNCIL_IDEMPOTENCY_TTL_DAYS", 14),
            stop_grace_s: env_parsed("COUNCIL_STOP_GRACE_S", 10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_env() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.min_free_mem_mb, 1200);
        assert_eq!(cfg.seat_deadline_s, 900);
        assert_eq!(cfg.idempotency_ttl_days, 14);
    }
}
