//! Provider router (spec §4.4) — ordered fallback with per-provider
//! retries, a JSON-persisted circuit breaker, and a budget gate hook.
//!
//! Grounded directly on `provider_router.py`: `BreakerState{open_until,
//! last_ok, last_err}` read-modify-written to `state/providers.json`,
//! `is_open(name) = now < open_until`, no half-open probe — the next
//! natural attempt after the window probes the provider. This supersedes
//! the teacher's `router::circuit_breaker::CircuitBreaker`, whose
//! `CircuitState::HalfOpen` variant the spec's simpler binary model drops;
//! the teacher's struct+impl+colocated-tests *shape* is kept, its *state
//! shape* is replaced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::fsio::atomic_write_json;
use super::unix_now;

/// Per-provider breaker state, persisted as JSON keyed by provider name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerState {
    pub open_until: f64,
    pub last_ok: Option<f64>,
    #[serde(default)]
    pub last_err: String,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self { open_until: 0.0, last_ok: None, last_err: String::new() }
    }
}

/// Read-modify-write breaker persisted under `<run>/state/providers.json`.
pub struct CircuitBreaker {
    state_path: PathBuf,
    open_for_s: f64,
}

impl CircuitBreaker {
    pub fn new(state_path: impl Into<PathBuf>, open_for_s: u64) -> Self {
        Self { state_path: state_path.into(), open_for_s: open_for_s as f64 }
    }

    fn load(&self) -> HashMap<String, BreakerState> {
        std::fs::read_to_string(&self.state_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn save(&self, state: &HashMap<String, BreakerState>) {
        let _ = atomic_write_json(&self.state_path, state);
    }

    pub fn is_open(&self, provider: &str) -> bool {
        let state = self.load();
        state
            .get(provider)
            .map(|row| row.open_until > unix_now())
            .unwrap_or(false)
    }

    /// Clears `open_until` back to 0 and records the success timestamp.
    /// Monotonic field (`last_ok`) is best-effort under concurrent writers
    /// (spec §5 "concurrent updates may lose the non-monotonic last_err").
    pub fn record_success(&self, provider: &str) {
        let mut state = self.load();
        state.insert(
            provider.to_string(),
            BreakerState { open_until: 0.0, last_ok: Some(unix_now()), last_err: String::new() },
        );
        self.save(&state);
    }

    pub fn record_failure(&self, provider: &str, err: &str) {
        let mut state = self.load();
        let last_ok = state.get(provider).and_then(|r| r.last_ok);
        let mut truncated = err.to_string();
        truncated.truncate(400);
        state.insert(
            provider.to_string(),
            BreakerState { open_until: unix_now() + self.open_for_s, last_ok, last_err: truncated },
        );
        self.save(&state);
    }
}

/// Result of one seat's attempted LM call (spec §3 `AttemptResult`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResult {
    pub ok: bool,
    pub provider: String,
    pub model: String,
    pub duration_s: f64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub text: String,
}

/// One entry in the ordered fallback ladder.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub name: String,
    pub model: String,
    pub retries: u32,
}

/// The network boundary — the router only composes attempts and consumes
/// their text/errors; the actual LM call is external (spec §1 scope note).
/// A CLI-facing implementation spawns the configured seat-runner process;
/// tests supply a canned in-process implementation.
#[async_trait]
pub trait ProviderCall: Send + Sync {
    async fn call(&self, spec: &ProviderSpec, prompt: &str) -> Result<String, String>;
}

/// Optional budget accounting callback; the router only consults it.
pub trait BudgetGate: Send + Sync {
    fn allow(&self, provider: &str) -> bool;
}

pub struct AllowAllBudget;
impl BudgetGate for AllowAllBudget {
    fn allow(&self, _provider: &str) -> bool {
        true
    }
}

pub struct ProviderRouter<'a> {
    pub breaker: Option<&'a CircuitBreaker>,
    pub budget: &'a dyn BudgetGate,
}

impl<'a> ProviderRouter<'a> {
    pub fn new(breaker: Option<&'a CircuitBreaker>, budget: &'a dyn BudgetGate) -> Self {
        Self { breaker, budget }
    }

    /// Attempt `providers` in order against `call`, returning the first
    /// success or the last failure (spec §4.4 contract, verbatim against
    /// `provider_router.py::ProviderRouter.route`).
    pub async fn route(
        &self,
        providers: &[ProviderSpec],
        prompt: &str,
        call: &dyn ProviderCall,
    ) -> AttemptResult {
        let mut last: Option<AttemptResult> = None;

        for spec in providers {
            if !self.budget.allow(&spec.name) {
                last = Some(AttemptResult {
                    ok: false,
                    provider: spec.name.clone(),
                    model: spec.model.clone(),
                    duration_s: 0.0,
                    error: "budget_exhausted".to_string(),
                    text: String::new(),
                });
                continue;
            }
            if let Some(breaker) = self.breaker {
                if breaker.is_open(&spec.name) {
                    last = Some(AttemptResult {
                        ok: false,
                        provider: spec.name.clone(),
                        model: spec.model.clone(),
                        duration_s: 0.0,
                        error: "circuit_open".to_string(),
                        text: String::new(),
                    });
                    continue;
                }
            }

            let tries = spec.retries + 1;
            for attempt in 0..tries {
                let t0 = Instant::now();
                match call.call(spec, prompt).await {
                    Ok(text) => {
                        let result = AttemptResult {
                            ok: true,
                            provider: spec.name.clone(),
                            model: spec.model.clone(),
                            duration_s: t0.elapsed().as_secs_f64(),
                            error: String::new(),
                            text,
                        };
                        if let Some(breaker) = self.breaker {
                            breaker.record_success(&spec.name);
                        }
                        return result;
                    }
                    Err(e) => {
                        let result = AttemptResult {
                            ok: false,
                            provider: spec.name.clone(),
                            model: spec.model.clone(),
                            duration_s: t0.elapsed().as_secs_f64(),
                            error: e,
                            text: String::new(),
                        };
                        if attempt + 1 >= tries {
                            if let Some(breaker) = self.breaker {
                                breaker.record_failure(&spec.name, &result.error);
                            }
                        }
                        last = Some(result);
                    }
                }
            }
        }

        last.unwrap_or(AttemptResult {
            ok: false,
            provider: String::new(),
            model: String::new(),
            duration_s: 0.0,
            error: "no_providers".to_string(),
            text: String::new(),
        })
    }
}

/// Convenience constructor for the `state/providers.json` path.
pub fn providers_state_path(run_dir: &Path) -> PathBuf {
    run_dir.join("state").join("providers.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FailsOnlyPrimary;

    #[async_trait]
    impl ProviderCall for FailsOnlyPrimary {
        async fn call(&self, spec: &ProviderSpec, _prompt: &str) -> Result<String, String> {
            if spec.name == "cloud_primary" {
                return Err("boom".to_string());
            }
            Ok(format!("ok from {}", spec.name))
        }
    }

    #[tokio::test]
    async fn scenario_c_provider_fallback_opens_breaker() {
        let dir = tempdir().unwrap();
        let breaker = CircuitBreaker::new(providers_state_path(dir.path()), 120);
        let budget = AllowAllBudget;
        let router = ProviderRouter::new(Some(&breaker), &budget);
        let call = FailsOnlyPrimary;

        let providers = vec![
            ProviderSpec { name: "cloud_primary".into(), model: "m1".into(), retries: 1 },
            ProviderSpec { name: "cloud_fallback".into(), model: "m2".into(), retries: 0 },
            ProviderSpec { name: "local".into(), model: "m3".into(), retries: 0 },
        ];

        let result = router.route(&providers, "task", &call).await;
        assert!(result.ok);
        assert_eq!(result.provider, "cloud_fallback");
        assert!(breaker.is_open("cloud_primary"));

        // Next seat in the same round skips cloud_primary immediately.
        let result2 = router.route(&providers, "task", &call).await;
        assert_eq!(result2.provider, "cloud_fallback");
    }

    #[tokio::test]
    async fn empty_provider_list_returns_no_providers() {
        let dir = tempdir().unwrap();
        let breaker = CircuitBreaker::new(providers_state_path(dir.path()), 120);
        let budget = AllowAllBudget;
        let router = ProviderRouter::new(Some(&breaker), &budget);
        let call = FailsOnlyPrimary;
        let result = router.route(&[], "task", &call).await;
        assert!(!result.ok);
        assert_eq!(result.error, "no_providers");
    }
}
