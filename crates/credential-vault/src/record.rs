//! The credential row and its circuit vocabulary
//!
//! One `CredentialRecord` exists per registered API key. All timestamps are
//! unix epoch milliseconds. `version` is owned by the store: callers read it,
//! pass it back as the expected version on `compare_and_swap`, and never
//! bump it themselves.

use serde::{Deserialize, Serialize};

use crate::cipher::EncryptedSecret;

/// Circuit breaker state of a single credential.
///
/// Transitions (driven by `credential-pool`):
/// - Closed → Open (consecutive failures reach the threshold, or auth rejected)
/// - Open → HalfOpen (cool-down elapsed, selected as a trial)
/// - HalfOpen → Closed (trial succeeded)
/// - HalfOpen → Open (trial failed, cool-down doubles)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Status label for health/logging/metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Why an external call made with a credential failed.
///
/// Only `AuthRejected` changes policy: it opens the circuit at once and
/// latches it until an operator resets the key. The other reasons are
/// counted identically and kept for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RateLimited,
    AuthRejected,
    Timeout,
    Unknown,
}

impl FailureReason {
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::RateLimited => "rate_limited",
            FailureReason::AuthRejected => "auth_rejected",
            FailureReason::Timeout => "timeout",
            FailureReason::Unknown => "unknown",
        }
    }
}

/// One API key registered for an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub service_name: String,
    /// Encrypted at rest; decrypted only into a `Secret` for a single call.
    pub secret: EncryptedSecret,
    pub usage_count: u64,
    /// Quota ceiling; `None` means unlimited.
    #[serde(default)]
    pub usage_limit: Option<u64>,
    /// Lower value is preferred.
    #[serde(default)]
    pub priority: i32,
    pub circuit_state: CircuitState,
    /// Consecutive failures since the last success.
    #[serde(default)]
    pub failure_count: u32,
    /// Consecutive entries into `Open` since the last success.
    #[serde(default)]
    pub open_count: u32,
    #[serde(default)]
    pub open_reason: Option<FailureReason>,
    #[serde(default)]
    pub last_failure_at: Option<u64>,
    #[serde(default)]
    pub last_success_at: Option<u64>,
    /// When the most recent trial was handed out.
    #[serde(default)]
    pub last_tested_at: Option<u64>,
    pub is_active: bool,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub version: u64,
}

impl CredentialRecord {
    /// A freshly registered key: `Closed`, counters at zero, active.
    pub fn new(
        id: String,
        service_name: String,
        secret: EncryptedSecret,
        priority: i32,
        usage_limit: Option<u64>,
        now_millis: u64,
    ) -> Self {
        Self {
            id,
            service_name,
            secret,
            usage_count: 0,
            usage_limit,
            priority,
            circuit_state: CircuitState::Closed,
            failure_count: 0,
            open_count: 0,
            open_reason: None,
            last_failure_at: None,
            last_success_at: None,
            last_tested_at: None,
            is_active: true,
            created_at: now_millis,
            version: 0,
        }
    }

    /// Whether another acquisition fits under the usage limit.
    pub fn has_quota(&self) -> bool {
        match self.usage_limit {
            Some(limit) => self.usage_count < limit,
            None => true,
        }
    }

    /// An auth-rejected key stays open until an operator resets it.
    pub fn is_latched(&self) -> bool {
        self.circuit_state == CircuitState::Open
            && self.open_reason == Some(FailureReason::AuthRejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(limit: Option<u64>) -> CredentialRecord {
        CredentialRecord::new(
            "k1".into(),
            "gemini".into(),
            EncryptedSecret {
                nonce: "bm9uY2U=".into(),
                ciphertext: "Y3Q=".into(),
            },
            0,
            limit,
            1_700_000_000_000,
        )
    }

    #[test]
    fn new_record_is_closed_and_active() {
        let r = record(None);
        assert_eq!(r.circuit_state, CircuitState::Closed);
        assert_eq!(r.failure_count, 0);
        assert_eq!(r.usage_count, 0);
        assert!(r.is_active);
        assert_eq!(r.version, 0);
    }

    #[test]
    fn quota_boundary() {
        let mut r = record(Some(2));
        assert!(r.has_quota());
        r.usage_count = 1;
        assert!(r.has_quota());
        r.usage_count = 2;
        assert!(!r.has_quota());
        assert!(record(None).has_quota());
    }

    #[test]
    fn latch_requires_open_and_auth_reason() {
        let mut r = record(None);
        r.open_reason = Some(FailureReason::AuthRejected);
        assert!(!r.is_latched(), "closed keys are never latched");
        r.circuit_state = CircuitState::Open;
        assert!(r.is_latched());
        r.open_reason = Some(FailureReason::Timeout);
        assert!(!r.is_latched());
    }

    #[test]
    fn states_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"half_open\""
        );
        assert_eq!(
            serde_json::to_string(&FailureReason::AuthRejected).unwrap(),
            "\"auth_rejected\""
        );
    }

    #[test]
    fn missing_optional_fields_deserialize_with_defaults() {
        let json = r#"{
            "id": "k9",
            "service_name": "gemini",
            "secret": {"nonce": "bm9uY2U=", "ciphertext": "Y3Q="},
            "usage_count": 4,
            "circuit_state": "closed",
            "is_active": true
        }"#;
        let r: CredentialRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.usage_limit, None);
        assert_eq!(r.priority, 0);
        assert_eq!(r.failure_count, 0);
        assert_eq!(r.version, 0);
    }
}
