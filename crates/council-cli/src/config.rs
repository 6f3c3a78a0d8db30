//! Seat-runner and provider-ladder configuration, resolved once from the
//! environment at CLI startup, mirroring the teacher's `SwarmConfig::default()`
//! `std::env::var(...).ok().and_then(...).unwrap_or(default)` idiom.

use coordination::ProviderSpec;

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// One rung of the provider fallback ladder, plus the subprocess command
/// used to invoke it (spec §1 "the router only composes attempts and
/// consumes their text/errors"; the actual LM call is external).
#[derive(Debug, Clone)]
pub struct ProviderRung {
    pub spec: ProviderSpec,
    /// Shell command template invoked as `sh -c <command>`, with `{model}`
    /// substituted. The seat prompt is piped to the child's stdin.
    pub command: String,
}

/// Assembled provider ladder, read from `COUNCIL_PROVIDER_ORDER` (a
/// comma-separated list of names) plus one `COUNCIL_PROVIDER_<NAME>_CMD`
/// / `_MODEL` / `_RETRIES` triple per named provider. Falls back to a
/// single `local` provider running `COUNCIL_SEAT_RUNNER_CMD` (default
/// `cat`, an echo runner useful for smoke-testing the orchestrator without
/// a real LM attached).
pub fn provider_ladder() -> Vec<ProviderRung> {
    let order = std::env::var("COUNCIL_PROVIDER_ORDER").unwrap_or_default();
    let names: Vec<String> = order
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if names.is_empty() {
        let command = std::env::var("COUNCIL_SEAT_RUNNER_CMD").unwrap_or_else(|_| "cat".to_string());
        return vec![ProviderRung {
            spec: ProviderSpec { name: "local".to_string(), model: "default".to_string(), retries: 0 },
            command,
        }];
    }

    names
        .into_iter()
        .map(|name| {
            let upper = name.to_uppercase().replace(['-', ' '], "_");
            let command = std::env::var(format!("COUNCIL_PROVIDER_{upper}_CMD")).unwrap_or_else(|_| "cat".to_string());
            let model = std::env::var(format!("COUNCIL_PROVIDER_{upper}_MODEL")).unwrap_or_else(|_| "default".to_string());
            let retries = env_parsed(&format!("COUNCIL_PROVIDER_{upper}_RETRIES"), 0u32);
            ProviderRung { spec: ProviderSpec { name, model, retries }, command }
        })
        .collect()
}

/// Providers named in `COUNCIL_BUDGET_DENY` (comma-separated) are always
/// skipped with `budget_exhausted` — a stand-in for real accounting, which
/// lives outside this crate (spec §4.4 "the router does not implement
/// accounting itself; it consults the gate").
pub struct EnvBudgetGate {
    denied: std::collections::HashSet<String>,
}

impl EnvBudgetGate {
    pub fn from_env() -> Self {
        let denied = std::env::var("COUNCIL_BUDGET_DENY")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { denied }
    }
}

impl coordination::orchestrator::router::BudgetGate for EnvBudgetGate {
    fn allow(&self, provider: &str) -> bool {
        !self.denied.contains(provider)
    }
}
