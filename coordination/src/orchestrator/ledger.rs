//! Evidence ledger (spec §4.9) — append-only, chained, HMAC-signed JSONL.
//!
//! Grounded verbatim on `evidence_chain.py`: `canonical_base` is the sorted,
//! compact-separator JSON of `{ts, prev_hash, key_id, algo, payload}`;
//! `signature = hex(HMAC-SHA256(key, canonical_base))`;
//! `entry_hash = hex(SHA256(canonical_base ++ "|" ++ signature))`. Legacy
//! (unsigned) entries verify against a simpler hash chain with no
//! `key_id`/`algo`/`signature` fields.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::error::{OrchestratorError, OrchestratorResult};
use super::fsio::append_line_locked;
use super::unix_now;

type HmacSha256 = Hmac<Sha256>;

/// One chained, signed row of the evidence ledger (spec §3 `LedgerEntry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub ts: f64,
    pub prev_hash: String,
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub algo: String,
    pub payload: Value,
    #[serde(default)]
    pub signature: String,
    pub entry_hash: String,
}

/// Active signing key plus full verification keyring, sourced from
/// `EVIDENCE_HMAC_KEY_ID` / `EVIDENCE_HMAC_KEY` / `EVIDENCE_HMAC_KEYS_JSON`.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    pub active_key_id: String,
    pub keys: HashMap<String, String>,
    pub signing_required: bool,
}

impl Keyring {
    pub fn from_config(cfg: &super::config::OrchestratorConfig) -> Self {
        let mut keys = HashMap::new();
        if let Some(key) = &cfg.evidence_key {
            keys.insert(cfg.evidence_key_id.clone(), key.clone());
        }
        if let Some(raw) = &cfg.evidence_keys_json {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
                for (k, v) in map {
                    if let Some(s) = v.as_str() {
                        if !s.trim().is_empty() {
                            keys.insert(k, s.to_string());
                        }
                    }
                }
            }
        }
        Self { active_key_id: cfg.evidence_key_id.clone(), keys, signing_required: cfg.evidence_signing_required }
    }

    fn active_key(&self) -> Option<&str> {
        self.keys.get(&self.active_key_id).map(String::as_str)
    }
}

fn canonical_base(ts: f64, prev_hash: &str, key_id: &str, algo: &str, payload: &Value) -> String {
    // serde_json's Map is BTreeMap-backed without the `preserve_order`
    // feature, giving sorted-key output matching Python's sort_keys=True.
    serde_json::to_string(&json!({
        "ts": ts,
        "prev_hash": prev_hash,
        "key_id": key_id,
        "algo": algo,
        "payload": payload,
    }))
    .unwrap_or_default()
}

fn hmac_sign(key: &str, canonical: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// The `entry_hash` of the last line in `log_path`, or empty if the log
/// doesn't exist or has no parseable lines yet.
fn previous_hash(log_path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(log_path) else {
        return String::new();
    };
    content
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| serde_json::from_str::<Value>(l).ok())
        .and_then(|v| v.get("entry_hash").and_then(|h| h.as_str()).map(str::to_string))
        .unwrap_or_default()
}

/// Append a new signed, chained entry to `log_path` (spec §4.9). Fails
/// closed with `runtime_io` if signing is required but no active key is
/// configured.
pub fn append_signed_entry(log_path: &Path, ring: &Keyring, payload: Value) -> OrchestratorResult<LedgerEntry> {
    let prev_hash = previous_hash(log_path);
    let key = ring.active_key();
    if ring.signing_required && key.is_none() {
        return Err(OrchestratorError::RuntimeIo(
            "EVIDENCE_HMAC_KEY missing while signing is required".to_string(),
        ));
    }

    let ts = unix_now();
    let algo = "HMAC-SHA256";
    let canonical = canonical_base(ts, &prev_hash, &ring.active_key_id, algo, &payload);
    let signature = key.map(|k| hmac_sign(k, &canonical)).unwrap_or_default();
    let entry_hash = sha256_hex(&format!("{canonical}|{signature}"));

    let entry = LedgerEntry {
        ts,
        prev_hash,
        key_id: ring.active_key_id.clone(),
        algo: algo.to_string(),
        payload,
        signature,
        entry_hash,
    };
    append_line_locked(log_path, &serde_json::to_string(&entry)?)?;
    Ok(entry)
}

/// Mirror the freshly-appended line to configured sinks. Sink failures
/// are logged and never fail the local append (spec §4.9).
pub async fn sink_entry(entry: &LedgerEntry, sink_path: Option<&Path>, sink_url: Option<&str>) {
    let line = serde_json::to_string(entry).unwrap_or_default();

    if let Some(path) = sink_path {
        if let Err(e) = append_line_locked(path, &line) {
            tracing::warn!(error = %e, "evidence ledger sink write failed");
        }
    }

    if let Some(url) = sink_url {
        let client = reqwest::Client::new();
        let result = client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", "council-evidence/1.0")
            .body(line)
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, url, "evidence ledger HTTP sink post failed");
        }
    }
}

/// Outcome of [`verify_log`] (spec §3 invariant 4, §8 Scenario F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub ok: bool,
    pub entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_entries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_entries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn fail_at(entries: usize, line: usize, reason: &str) -> VerifyOutcome {
    VerifyOutcome {
        ok: false,
        entries,
        legacy_entries: None,
        signed_entries: None,
        head_hash: None,
        line: Some(line),
        reason: Some(reason.to_string()),
    }
}

/// Walk `log_path` in order, validating chain linkage and signatures.
/// Missing log file returns `{ok: true, entries: 0}` (spec §8 boundary
/// behavior).
pub fn verify_log(log_path: &Path, ring: &Keyring) -> VerifyOutcome {
    let Ok(content) = std::fs::read_to_string(log_path) else {
        return VerifyOutcome { ok: true, entries: 0, legacy_entries: None, signed_entries: None, head_hash: None, line: None, reason: None };
    };

    let mut prev_hash = String::new();
    let mut entries = 0usize;
    let mut legacy = 0usize;
    let mut signed = 0usize;

    for (idx, raw) in content.lines().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let lineno = idx + 1;
        entries += 1;

        let Ok(obj) = serde_json::from_str::<Value>(raw) else {
            return fail_at(entries, lineno, "invalid json");
        };

        let got_prev = obj.get("prev_hash").and_then(|v| v.as_str()).unwrap_or("");
        if got_prev != prev_hash {
            return fail_at(entries, lineno, "prev_hash mismatch");
        }

        let key_id = obj.get("key_id").and_then(|v| v.as_str()).unwrap_or("");
        let signature = obj.get("signature").and_then(|v| v.as_str()).unwrap_or("");
        let algo = obj.get("algo").and_then(|v| v.as_str()).unwrap_or("");
        let ts = obj.get("ts").cloned().unwrap_or(Value::Null);
        let payload = obj.get("payload").cloned().unwrap_or(Value::Null);

        let is_legacy = key_id.is_empty() && signature.is_empty() && algo.is_empty();
        if is_legacy {
            legacy += 1;
            let legacy_base = serde_json::to_string(&json!({"ts": ts, "prev_hash": got_prev, "payload": payload})).unwrap_or_default();
            let expected = sha256_hex(&legacy_base);
            let got_hash = obj.get("entry_hash").and_then(|v| v.as_str()).unwrap_or("");
            if got_hash != expected {
                return fail_at(entries, lineno, "legacy entry_hash mismatch");
            }
            prev_hash = expected;
            continue;
        }

        signed += 1;
        let ts_f = ts.as_f64().unwrap_or(0.0);
        let canonical = canonical_base(ts_f, got_prev, key_id, algo, &payload);
        let key = ring.keys.get(key_id).map(String::as_str);

        if ring.signing_required && key.is_none() {
            return fail_at(entries, lineno, &format!("missing key for key_id={key_id}"));
        }
        if let Some(key) = key {
            let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
            mac.update(canonical.as_bytes());
            let sig_ok = hex::decode(signature)
                .map(|bytes| mac.verify_slice(&bytes).is_ok())
                .unwrap_or(false);
            if !sig_ok {
                return fail_at(entries, lineno, "signature mismatch");
            }
        } else if !signature.is_empty() {
            return fail_at(entries, lineno, "unsigned key with non-empty signature");
        }

        let expected_hash = sha256_hex(&format!("{canonical}|{signature}"));
        let got_hash = obj.get("entry_hash").and_then(|v| v.as_str()).unwrap_or("");
        if got_hash != expected_hash {
            return fail_at(entries, lineno, "entry_hash mismatch");
        }
        prev_hash = expected_hash;
    }

    VerifyOutcome {
        ok: true,
        entries,
        legacy_entries: Some(legacy),
        signed_entries: Some(signed),
        head_hash: Some(prev_hash),
        line: None,
        reason: None,
    }
}

pub fn ledger_path(run_dir: &Path) -> PathBuf {
    run_dir.join("state").join("evidence.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ring(key: &str) -> Keyring {
        let mut keys = HashMap::new();
        keys.insert("local-v1".to_string(), key.to_string());
        Keyring { active_key_id: "local-v1".to_string(), keys, signing_required: true }
    }

    #[test]
    fn chain_integrity_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evidence.jsonl");
        let ring = ring("secret-key");

        let e1 = append_signed_entry(&path, &ring, json!({"round": 1})).unwrap();
        let e2 = append_signed_entry(&path, &ring, json!({"round": 2})).unwrap();
        assert_eq!(e2.prev_hash, e1.entry_hash);

        let outcome = verify_log(&path, &ring);
        assert!(outcome.ok);
        assert_eq!(outcome.entries, 2);
        assert_eq!(outcome.head_hash.as_deref(), Some(e2.entry_hash.as_str()));
    }

    #[test]
    fn missing_log_verifies_ok_zero_entries() {
        let dir = tempdir().unwrap();
        let outcome = verify_log(&dir.path().join("nope.jsonl"), &ring("k"));
        assert!(outcome.ok);
        assert_eq!(outcome.entries, 0);
    }

    #[test]
    fn signing_required_without_key_fails_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evidence.jsonl");
        let ring = Keyring { active_key_id: "local-v1".to_string(), keys: HashMap::new(), signing_required: true };
        let err = append_signed_entry(&path, &ring, json!({"x": 1})).unwrap_err();
        assert!(matches!(err, OrchestratorError::RuntimeIo(_)));
    }

    #[test]
    fn scenario_f_tampered_payload_fails_at_exact_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evidence.jsonl");
        let ring = ring("secret-key");
        append_signed_entry(&path, &ring, json!({"round": 1})).unwrap();
        append_signed_entry(&path, &ring, json!({"round": 2})).unwrap();
        append_signed_entry(&path, &ring, json!({"round": 3})).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        let mut tampered: Value = serde_json::from_str(&lines[1]).unwrap();
        tampered["payload"]["round"] = json!(999);
        lines[1] = serde_json::to_string(&tampered).unwrap();
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        let outcome = verify_log(&path, &ring);
        assert!(!outcome.ok);
        assert_eq!(outcome.line, Some(2));
        assert_eq!(outcome.reason.as_deref(), Some("entry_hash mismatch"));
    }

    #[test]
    fn legacy_unsigned_entries_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evidence.jsonl");
        let base = json!({"ts": 1.0, "prev_hash": "", "payload": {"a": 1}});
        let canonical = serde_json::to_string(&base).unwrap();
        let hash = sha256_hex(&canonical);
        let row = json!({"ts": 1.0, "prev_hash": "", "payload": {"a": 1}, "entry_hash": hash});
        std::fs::write(&path, serde_json::to_string(&row).unwrap() + "\n").unwrap();

        let outcome = verify_log(&path, &ring("secret-key"));
        assert!(outcome.ok);
        assert_eq!(outcome.legacy_entries, Some(1));
    }
}
