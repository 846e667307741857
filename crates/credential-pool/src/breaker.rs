//! Per-credential circuit breaker transitions
//!
//! Pure functions from (record, event, now) to the next record. The pool
//! wraps each of these in a compare-and-swap, so whatever is computed here
//! only takes effect if nobody else touched the row in between.
//!
//! ```text
//!            failures >= threshold          cool-down elapsed + acquire
//!   Closed ─────────────────────────▶ Open ─────────────────────────▶ HalfOpen
//!     ▲        (or auth rejected)      ▲                                 │
//!     │                                └──────── trial failed ───────────┤
//!     └──────────────────────────── trial succeeded ─────────────────────┘
//! ```

use std::time::Duration;

use credential_vault::{CircuitState, CredentialRecord, FailureReason};

use crate::config::PoolConfig;

/// Result of applying an event to a record.
#[derive(Debug, Clone)]
pub struct Transition {
    pub next: CredentialRecord,
    pub from: CircuitState,
    pub to: CircuitState,
}

impl Transition {
    fn new(prev: &CredentialRecord, next: CredentialRecord) -> Self {
        Self {
            from: prev.circuit_state,
            to: next.circuit_state,
            next,
        }
    }

    pub fn changed_state(&self) -> bool {
        self.from != self.to
    }
}

/// Cool-down for a key that has entered `Open` `open_count` times in a row.
///
/// `base * 2^(open_count - 1)`, capped at `max_cooldown_secs`.
pub fn cooldown(open_count: u32, config: &PoolConfig) -> Duration {
    let exponent = open_count.saturating_sub(1).min(32);
    let secs = config
        .base_cooldown_secs
        .saturating_mul(1u64 << exponent)
        .min(config.max_cooldown_secs);
    Duration::from_secs(secs)
}

/// Time left before an `Open` key may be offered as a trial.
///
/// `None` for keys that are not cooling down (closed, half-open, latched).
pub fn cooldown_remaining(
    record: &CredentialRecord,
    now_millis: u64,
    config: &PoolConfig,
) -> Option<Duration> {
    if record.circuit_state != CircuitState::Open || record.is_latched() {
        return None;
    }
    let opened_at = record.last_failure_at.unwrap_or(0);
    let ready_at = opened_at.saturating_add(cooldown(record.open_count, config).as_millis() as u64);
    Some(Duration::from_millis(ready_at.saturating_sub(now_millis)))
}

/// Whether `acquire` may hand this key out right now.
pub fn is_eligible(record: &CredentialRecord, now_millis: u64, config: &PoolConfig) -> bool {
    if !record.is_active || !record.has_quota() {
        return false;
    }
    match record.circuit_state {
        CircuitState::Closed => true,
        CircuitState::Open => {
            !record.is_latched()
                && cooldown_remaining(record, now_millis, config)
                    .is_some_and(|left| left.is_zero())
        }
        CircuitState::HalfOpen => {
            let tested_at = record.last_tested_at.unwrap_or(0);
            now_millis >= tested_at.saturating_add(config.trial_timeout().as_millis() as u64)
        }
    }
}

/// Selection side effects: count the attempt and, for a cooled-down key,
/// move it to `HalfOpen` as a trial stamped with `now`.
///
/// Returns the transition and whether the caller now holds the trial.
pub fn on_acquire(record: &CredentialRecord, now_millis: u64) -> (Transition, bool) {
    let mut next = record.clone();
    next.usage_count = next.usage_count.saturating_add(1);

    let trial = record.circuit_state != CircuitState::Closed;
    if trial {
        next.circuit_state = CircuitState::HalfOpen;
        next.last_tested_at = Some(now_millis);
    }
    (Transition::new(record, next), trial)
}

/// Whether a handle stamped with `trial_started_at` is the current trial.
pub fn holds_trial(record: &CredentialRecord, trial_started_at: Option<u64>) -> bool {
    record.circuit_state == CircuitState::HalfOpen
        && trial_started_at.is_some()
        && record.last_tested_at == trial_started_at
}

/// Apply a success report. `None` means the report is stale and changes
/// nothing (the key is `Open`, or `HalfOpen` under someone else's trial).
pub fn on_success(
    record: &CredentialRecord,
    trial_started_at: Option<u64>,
    now_millis: u64,
) -> Option<Transition> {
    let mut next = record.clone();
    match record.circuit_state {
        CircuitState::Closed => {}
        CircuitState::HalfOpen if holds_trial(record, trial_started_at) => {
            next.circuit_state = CircuitState::Closed;
        }
        CircuitState::HalfOpen | CircuitState::Open => return None,
    }
    next.failure_count = 0;
    next.open_count = 0;
    next.open_reason = None;
    next.last_success_at = Some(now_millis);
    Some(Transition::new(record, next))
}

/// Apply a failure report. `None` means the report is stale.
///
/// `AuthRejected` always opens and latches the circuit, whatever the state
/// or failure count.
pub fn on_failure(
    record: &CredentialRecord,
    trial_started_at: Option<u64>,
    reason: FailureReason,
    now_millis: u64,
    config: &PoolConfig,
) -> Option<Transition> {
    let mut next = record.clone();

    if reason == FailureReason::AuthRejected {
        next.failure_count = next.failure_count.saturating_add(1);
        next.last_failure_at = Some(now_millis);
        if record.circuit_state != CircuitState::Open {
            next.open_count = next.open_count.saturating_add(1);
        }
        next.circuit_state = CircuitState::Open;
        next.open_reason = Some(reason);
        return Some(Transition::new(record, next));
    }

    match record.circuit_state {
        CircuitState::Closed => {
            next.failure_count = next.failure_count.saturating_add(1);
            next.last_failure_at = Some(now_millis);
            if next.failure_count >= config.failure_threshold {
                next.circuit_state = CircuitState::Open;
                next.open_count = next.open_count.saturating_add(1);
                next.open_reason = Some(reason);
            }
        }
        CircuitState::HalfOpen if holds_trial(record, trial_started_at) => {
            next.failure_count = next.failure_count.saturating_add(1);
            next.last_failure_at = Some(now_millis);
            next.circuit_state = CircuitState::Open;
            next.open_count = next.open_count.saturating_add(1);
            next.open_reason = Some(reason);
        }
        CircuitState::HalfOpen | CircuitState::Open => return None,
    }
    Some(Transition::new(record, next))
}

/// Operator recovery: back to `Closed` with failure history cleared.
/// Usage counters are left alone.
pub fn reset(record: &CredentialRecord) -> Transition {
    let mut next = record.clone();
    next.circuit_state = CircuitState::Closed;
    next.failure_count = 0;
    next.open_count = 0;
    next.open_reason = None;
    Transition::new(record, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use credential_vault::EncryptedSecret;

    const T0: u64 = 1_700_000_000_000;

    fn record() -> CredentialRecord {
        CredentialRecord::new(
            "k".into(),
            "gemini".into(),
            EncryptedSecret {
                nonce: String::new(),
                ciphertext: String::new(),
            },
            0,
            None,
            T0,
        )
    }

    fn fail(r: &CredentialRecord, trial: Option<u64>, now: u64) -> CredentialRecord {
        on_failure(r, trial, FailureReason::Unknown, now, &PoolConfig::default())
            .expect("failure applies")
            .next
    }

    #[test]
    fn cooldown_doubles_and_caps() {
        let config = PoolConfig::default();
        assert_eq!(cooldown(1, &config), Duration::from_secs(60));
        assert_eq!(cooldown(2, &config), Duration::from_secs(120));
        assert_eq!(cooldown(3, &config), Duration::from_secs(240));
        assert_eq!(cooldown(7, &config), Duration::from_secs(3600));
        assert_eq!(cooldown(200, &config), Duration::from_secs(3600));
    }

    #[test]
    fn closed_opens_at_threshold() {
        let mut r = record();
        r = fail(&r, None, T0);
        r = fail(&r, None, T0);
        assert_eq!(r.circuit_state, CircuitState::Closed);
        assert_eq!(r.failure_count, 2);
        r = fail(&r, None, T0);
        assert_eq!(r.circuit_state, CircuitState::Open);
        assert_eq!(r.open_count, 1);
        assert_eq!(r.open_reason, Some(FailureReason::Unknown));
    }

    #[test]
    fn open_key_becomes_eligible_after_cooldown() {
        let config = PoolConfig::default();
        let mut r = record();
        for _ in 0..3 {
            r = fail(&r, None, T0);
        }
        assert!(!is_eligible(&r, T0, &config));
        assert!(!is_eligible(&r, T0 + 59_999, &config));
        assert!(is_eligible(&r, T0 + 60_000, &config));
        assert_eq!(
            cooldown_remaining(&r, T0 + 20_000, &config),
            Some(Duration::from_secs(40))
        );
    }

    #[test]
    fn acquire_on_open_key_starts_trial() {
        let mut r = record();
        r.circuit_state = CircuitState::Open;
        let (t, trial) = on_acquire(&r, T0);
        assert!(trial);
        assert_eq!(t.to, CircuitState::HalfOpen);
        assert_eq!(t.next.last_tested_at, Some(T0));
        assert_eq!(t.next.usage_count, 1);
        assert!(t.changed_state());
    }

    #[test]
    fn acquire_on_closed_key_only_counts_usage() {
        let (t, trial) = on_acquire(&record(), T0);
        assert!(!trial);
        assert!(!t.changed_state());
        assert_eq!(t.next.usage_count, 1);
        assert_eq!(t.next.last_tested_at, None);
    }

    #[test]
    fn trial_success_closes_and_clears_counters() {
        let mut r = record();
        r.circuit_state = CircuitState::Open;
        r.failure_count = 3;
        r.open_count = 2;
        let (t, _) = on_acquire(&r, T0);
        let closed = on_success(&t.next, Some(T0), T0 + 5).unwrap();
        assert_eq!(closed.to, CircuitState::Closed);
        assert_eq!(closed.next.failure_count, 0);
        assert_eq!(closed.next.open_count, 0);
        assert_eq!(closed.next.last_success_at, Some(T0 + 5));
    }

    #[test]
    fn trial_failure_reopens_with_doubled_cooldown() {
        let config = PoolConfig::default();
        let mut r = record();
        for _ in 0..3 {
            r = fail(&r, None, T0);
        }
        let (t, _) = on_acquire(&r, T0 + 60_000);
        let reopened = fail(&t.next, Some(T0 + 60_000), T0 + 61_000);
        assert_eq!(reopened.circuit_state, CircuitState::Open);
        assert_eq!(reopened.open_count, 2);
        assert!(!is_eligible(&reopened, T0 + 61_000 + 119_999, &config));
        assert!(is_eligible(&reopened, T0 + 61_000 + 120_000, &config));
    }

    #[test]
    fn non_trial_reports_on_half_open_are_stale() {
        let mut r = record();
        r.circuit_state = CircuitState::Open;
        let (t, _) = on_acquire(&r, T0);
        let config = PoolConfig::default();
        assert!(on_success(&t.next, None, T0).is_none());
        assert!(on_failure(&t.next, None, FailureReason::Timeout, T0, &config).is_none());
        assert!(on_success(&t.next, Some(T0 - 1), T0).is_none());
    }

    #[test]
    fn reports_on_open_key_are_stale() {
        let mut r = record();
        r.circuit_state = CircuitState::Open;
        let config = PoolConfig::default();
        assert!(on_success(&r, None, T0).is_none());
        assert!(on_failure(&r, None, FailureReason::RateLimited, T0, &config).is_none());
    }

    #[test]
    fn auth_rejection_opens_immediately_and_latches() {
        let config = PoolConfig::default();
        let r = record();
        let t = on_failure(&r, None, FailureReason::AuthRejected, T0, &config).unwrap();
        assert_eq!(t.to, CircuitState::Open);
        assert!(t.next.is_latched());
        assert!(!is_eligible(&t.next, T0 + 365 * 24 * 3_600_000, &config));
        assert_eq!(cooldown_remaining(&t.next, T0, &config), None);
    }

    #[test]
    fn auth_rejection_applies_even_to_stale_handle() {
        let config = PoolConfig::default();
        let mut r = record();
        r.circuit_state = CircuitState::HalfOpen;
        r.last_tested_at = Some(T0);
        let t = on_failure(&r, None, FailureReason::AuthRejected, T0, &config).unwrap();
        assert!(t.next.is_latched());
    }

    #[test]
    fn abandoned_trial_becomes_eligible_after_timeout() {
        let config = PoolConfig::default();
        let mut r = record();
        r.circuit_state = CircuitState::HalfOpen;
        r.last_tested_at = Some(T0);
        assert!(!is_eligible(&r, T0 + 299_999, &config));
        assert!(is_eligible(&r, T0 + 300_000, &config));
    }

    #[test]
    fn inactive_and_exhausted_keys_are_never_eligible() {
        let config = PoolConfig::default();
        let mut inactive = record();
        inactive.is_active = false;
        assert!(!is_eligible(&inactive, T0, &config));

        let mut exhausted = record();
        exhausted.usage_limit = Some(2);
        exhausted.usage_count = 2;
        assert!(!is_eligible(&exhausted, T0, &config));
    }

    #[test]
    fn reset_clears_latch_but_keeps_usage() {
        let config = PoolConfig::default();
        let mut r = record();
        r.usage_count = 42;
        let latched = on_failure(&r, None, FailureReason::AuthRejected, T0, &config)
            .unwrap()
            .next;
        let t = reset(&latched);
        assert_eq!(t.to, CircuitState::Closed);
        assert_eq!(t.next.usage_count, 42);
        assert!(is_eligible(&t.next, T0, &config));
    }
}
