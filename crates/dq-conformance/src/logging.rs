use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use dq_core::ExecutionMode;
use serde::Serialize;
use serde_json::Value;

pub const STRUCTURED_LOG_SCHEMA_VERSION: &str = "dq-conformance-log-v1";

/// Fields every case log must carry with a non-empty value.
pub const REQUIRED_LOG_FIELDS: [&str; 11] = [
    "schema_version",
    "suite_id",
    "fixture_id",
    "scenario_id",
    "test_id",
    "mode",
    "seed",
    "env_fingerprint",
    "replay_command",
    "outcome",
    "reason_code",
];

/// One machine-readable record per executed conformance case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub ts_unix_ms: u128,
    pub suite_id: &'static str,
    pub fixture_id: &'static str,
    pub scenario_id: String,
    pub test_id: String,
    pub mode: &'static str,
    pub seed: u64,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: &'static str,
    pub reason_code: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &'static str,
        fixture_id: &'static str,
        case_name: &str,
        mode: ExecutionMode,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &'static str,
        reason_code: &str,
    ) -> Self {
        let mode = mode_label(mode);
        Self {
            schema_version: STRUCTURED_LOG_SCHEMA_VERSION,
            ts_unix_ms: now_unix_ms(),
            suite_id,
            fixture_id,
            scenario_id: format!("{suite_id}/{mode}:{case_name}"),
            test_id: case_name.to_string(),
            mode,
            seed: det_seed(&[suite_id, fixture_id, case_name, mode]),
            env_fingerprint: env_fingerprint(),
            artifact_refs,
            replay_command,
            outcome,
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(extra_fields);
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }

    /// Required fields that are absent or empty once serialized.
    #[must_use]
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let Ok(Value::Object(map)) = serde_json::to_value(self) else {
            return REQUIRED_LOG_FIELDS.to_vec();
        };
        REQUIRED_LOG_FIELDS
            .into_iter()
            .filter(|field| match map.get(*field) {
                Some(Value::String(value)) => value.is_empty(),
                Some(Value::Null) | None => true,
                Some(_) => false,
            })
            .collect()
    }

    pub fn to_json_line(&self) -> Result<String, String> {
        serde_json::to_string(self)
            .map_err(|error| format!("failed to serialize case log {}: {error}", self.scenario_id))
    }
}

#[must_use]
pub fn mode_label(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Strict => "strict",
        ExecutionMode::Hardened => "hardened",
    }
}

/// FNV-1a over the parts, separated so `["ab", "c"]` and `["a", "bc"]` differ.
#[must_use]
pub fn det_seed(parts: &[&str]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for part in parts {
        for byte in part.bytes().chain(std::iter::once(0xff)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

fn env_fingerprint() -> String {
    let digest = det_seed(&[
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    ]);
    format!("det64:{digest:016x}")
}

pub(crate) fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
