//! Pool metrics
//!
//! Emitted through the `metrics` facade; the binary installs a Prometheus
//! recorder. Without a recorder every call is a no-op.
//!
//! - `credential_pool_acquire_total` (counter): labels `service`, `outcome`
//! - `credential_pool_reports_total` (counter): labels `service`, `result`, `reason`
//! - `credential_pool_circuit_transitions_total` (counter): labels `service`, `from`, `to`

use credential_vault::{CircuitState, FailureReason};

/// Outcome label values for `credential_pool_acquire_total`.
pub const OUTCOME_SELECTED: &str = "selected";
pub const OUTCOME_TRIAL: &str = "trial";
pub const OUTCOME_EXHAUSTED: &str = "exhausted";
pub const OUTCOME_UNKNOWN_SERVICE: &str = "unknown_service";
pub const OUTCOME_CONTENTION: &str = "contention";

pub fn record_acquire(service: &str, outcome: &'static str) {
    metrics::counter!(
        "credential_pool_acquire_total",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_success(service: &str) {
    metrics::counter!(
        "credential_pool_reports_total",
        "service" => service.to_string(),
        "result" => "success",
        "reason" => "none"
    )
    .increment(1);
}

pub fn record_failure(service: &str, reason: FailureReason) {
    metrics::counter!(
        "credential_pool_reports_total",
        "service" => service.to_string(),
        "result" => "failure",
        "reason" => reason.label()
    )
    .increment(1);
}

pub fn record_transition(service: &str, from: CircuitState, to: CircuitState) {
    metrics::counter!(
        "credential_pool_circuit_transitions_total",
        "service" => service.to_string(),
        "from" => from.label(),
        "to" => to.label()
    )
    .increment(1);
}
