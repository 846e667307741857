//! Credential selection, usage accounting and outcome reporting
//!
//! The pool holds no credential state of its own. Every decision reads the
//! rows for a service from the injected `CredentialStore`, computes the next
//! row with `breaker`, and commits it with a single compare-and-swap on the
//! row version. Losing a swap means another caller (possibly in another
//! process) changed the row first; the pool re-reads and decides again.
//!
//! Selection order among eligible keys: `priority` ascending, then the
//! configured tiebreak (least used by default).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use common::Secret;
use credential_vault::{
    CircuitState, CredentialRecord, CredentialStore, FailureReason, SecretCipher, fingerprint,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::{self, Transition};
use crate::clock::{Clock, SystemClock};
use crate::config::{PoolConfig, SelectionTiebreak};
use crate::error::{Error, Result};
use crate::handle::CredentialHandle;
use crate::metrics;

/// Read-modify-write attempts for a report: the first try plus one retry
/// with fresh state.
const REPORT_ATTEMPTS: u32 = 2;

/// A key to register with the pool.
#[derive(Debug)]
pub struct NewCredential {
    pub service_name: String,
    pub secret: Secret<String>,
    pub priority: i32,
    pub usage_limit: Option<u64>,
}

impl NewCredential {
    pub fn new(service_name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            secret: Secret::new(secret.into()),
            priority: 0,
            usage_limit: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn usage_limit(mut self, limit: u64) -> Self {
        self.usage_limit = Some(limit);
        self
    }
}

/// Per-bucket counts for a service, used by health and exhaustion errors.
///
/// Every record lands in exactly one bucket, checked in field order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counts {
    total: usize,
    inactive: usize,
    over_quota: usize,
    available: usize,
    cooling_down: usize,
    trial_in_flight: usize,
    auth_rejected: usize,
}

/// Multi-key credential pool with per-key circuit breaking.
///
/// Construct once per process and share via `Arc`. Cheap to call
/// concurrently; correctness across processes comes from the store's
/// conditional writes, not from anything held here.
pub struct Pool {
    id: Uuid,
    store: Arc<dyn CredentialStore>,
    cipher: Arc<SecretCipher>,
    clock: Arc<dyn Clock>,
    config: PoolConfig,
    next_index: AtomicUsize,
}

impl Pool {
    /// Create a pool over the given store using wall-clock time.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<SecretCipher>,
        config: PoolConfig,
    ) -> Self {
        Self::with_clock(store, cipher, config, Arc::new(SystemClock))
    }

    /// Create a pool with an explicit time source.
    pub fn with_clock(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<SecretCipher>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            base_cooldown_secs = config.base_cooldown_secs,
            max_cooldown_secs = config.max_cooldown_secs,
            tiebreak = ?config.selection_tiebreak,
            "credential pool initialized"
        );
        Self {
            id: Uuid::new_v4(),
            store,
            cipher,
            clock,
            config,
            next_index: AtomicUsize::new(0),
        }
    }

    /// Encrypt and store a new key. Returns the generated credential id.
    pub async fn register(&self, credential: NewCredential) -> Result<String> {
        if credential.service_name.trim().is_empty() {
            return Err(Error::EmptyServiceName);
        }
        let secret = self.cipher.encrypt(credential.secret.expose_str())?;
        let id = Uuid::new_v4().to_string();
        let record = CredentialRecord::new(
            id.clone(),
            credential.service_name,
            secret,
            credential.priority,
            credential.usage_limit,
            self.clock.now_millis(),
        );
        let service = record.service_name.clone();
        self.store.insert(record).await?;
        info!(
            credential_id = %id,
            service = %service,
            priority = credential.priority,
            usage_limit = ?credential.usage_limit,
            "credential registered"
        );
        Ok(id)
    }

    /// Check out the best eligible key for a service.
    ///
    /// Never waits for a key to recover: if nothing qualifies right now the
    /// call fails with `PoolExhausted`. Usage is counted here, at
    /// acquisition, whether or not the caller's request later succeeds. A
    /// key whose cool-down has elapsed is returned as a trial (`HalfOpen`).
    pub async fn acquire(&self, service_name: &str) -> Result<CredentialHandle> {
        if service_name.trim().is_empty() {
            return Err(Error::EmptyServiceName);
        }

        let mut excluded: HashSet<String> = HashSet::new();
        for attempt in 1..=self.config.max_selection_attempts {
            let records = self.store.list(service_name).await?;
            if records.is_empty() {
                metrics::record_acquire(service_name, metrics::OUTCOME_UNKNOWN_SERVICE);
                return Err(Error::UnknownService(service_name.to_string()));
            }

            let now = self.clock.now_millis();
            let Some(candidate) = self.pick(&records, &excluded, now) else {
                let counts = self.count(&records, now);
                warn!(
                    service = service_name,
                    total = counts.total,
                    cooling_down = counts.cooling_down,
                    over_quota = counts.over_quota,
                    "no eligible credential"
                );
                metrics::record_acquire(service_name, metrics::OUTCOME_EXHAUSTED);
                return Err(Error::PoolExhausted(exhausted_message(service_name, counts)));
            };

            let secret = match self.cipher.decrypt(&candidate.secret) {
                Ok(secret) => secret,
                Err(e) => {
                    warn!(
                        credential_id = %candidate.id,
                        service = service_name,
                        error = %e,
                        "stored secret failed to decrypt, taking key out of rotation"
                    );
                    excluded.insert(candidate.id.clone());
                    self.deactivate_unreadable(candidate).await;
                    continue;
                }
            };

            let (transition, trial) = breaker::on_acquire(candidate, now);
            if !self
                .store
                .compare_and_swap(candidate.version, transition.next.clone())
                .await?
            {
                if trial {
                    debug!(
                        credential_id = %candidate.id,
                        attempt,
                        "another caller took the trial slot, excluding key"
                    );
                    excluded.insert(candidate.id.clone());
                } else {
                    debug!(credential_id = %candidate.id, attempt, "lost usage update race, reselecting");
                }
                continue;
            }

            if transition.changed_state() {
                self.log_transition(&transition, None);
            }

            let trial_started_at = if trial {
                transition.next.last_tested_at
            } else {
                None
            };
            metrics::record_acquire(
                service_name,
                if trial {
                    metrics::OUTCOME_TRIAL
                } else {
                    metrics::OUTCOME_SELECTED
                },
            );
            debug!(
                credential_id = %candidate.id,
                service = service_name,
                usage_count = transition.next.usage_count,
                trial,
                "credential acquired"
            );

            return Ok(CredentialHandle {
                id: Uuid::new_v4(),
                pool_id: self.id,
                credential_id: candidate.id.clone(),
                service_name: service_name.to_string(),
                secret,
                trial_started_at,
                reported: AtomicBool::new(false),
            });
        }

        warn!(
            service = service_name,
            attempts = self.config.max_selection_attempts,
            "credential selection gave up under contention"
        );
        metrics::record_acquire(service_name, metrics::OUTCOME_CONTENTION);
        Err(Error::Contention {
            service: service_name.to_string(),
            attempts: self.config.max_selection_attempts,
        })
    }

    /// Report that the call made with `handle` succeeded.
    ///
    /// Clears the failure streak; a successful trial closes the circuit.
    /// Reporting twice on the same handle is a no-op.
    pub async fn report_success(&self, handle: &CredentialHandle) -> Result<()> {
        self.check_handle(handle)?;
        if !handle.claim_report() {
            debug!(handle_id = %handle.id, "redundant success report ignored");
            return Ok(());
        }
        metrics::record_success(&handle.service_name);

        self.apply_report(handle, "success", |record, now| {
            breaker::on_success(record, handle.trial_started_at, now)
        })
        .await
    }

    /// Report that the call made with `handle` failed.
    ///
    /// `threshold` consecutive failures open the circuit; a failed trial
    /// re-opens it with a doubled cool-down; `AuthRejected` opens it at once
    /// and keeps it open until `reset_circuit`.
    pub async fn report_failure(
        &self,
        handle: &CredentialHandle,
        reason: FailureReason,
    ) -> Result<()> {
        self.check_handle(handle)?;
        if !handle.claim_report() {
            debug!(handle_id = %handle.id, reason = reason.label(), "redundant failure report ignored");
            return Ok(());
        }
        metrics::record_failure(&handle.service_name, reason);
        debug!(
            credential_id = %handle.credential_id,
            reason = reason.label(),
            "failure reported"
        );

        self.apply_report(handle, reason.label(), |record, now| {
            breaker::on_failure(record, handle.trial_started_at, reason, now, &self.config)
        })
        .await
    }

    /// Administrative on/off switch. Inactive keys are never selected.
    pub async fn set_active(&self, credential_id: &str, active: bool) -> Result<()> {
        self.update(credential_id, |record| {
            let mut next = record.clone();
            next.is_active = active;
            next
        })
        .await?;
        info!(credential_id, active, "credential activation changed");
        Ok(())
    }

    /// Operator recovery for an open (including auth-rejected) key.
    ///
    /// Returns it to `Closed` with failure history cleared. Usage counters
    /// are not touched.
    pub async fn reset_circuit(&self, credential_id: &str) -> Result<()> {
        let previous = self
            .update(credential_id, |record| breaker::reset(record).next)
            .await?;
        info!(
            credential_id,
            from = previous.circuit_state.label(),
            "circuit reset by operator"
        );
        Ok(())
    }

    /// Health summary for one service.
    ///
    /// Status mapping: every key available → healthy, some available →
    /// degraded, none available (or none registered) → unhealthy.
    pub async fn health(&self, service_name: &str) -> Result<serde_json::Value> {
        let records = self.store.list(service_name).await?;
        let now = self.clock.now_millis();
        let counts = self.count(&records, now);

        let credentials: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                let mut entry = serde_json::json!({
                    "id": r.id,
                    "state": r.circuit_state.label(),
                    "active": r.is_active,
                    "eligible": breaker::is_eligible(r, now, &self.config),
                    "priority": r.priority,
                    "usage_count": r.usage_count,
                    "usage_limit": r.usage_limit,
                    "failure_count": r.failure_count,
                });
                if let Some(remaining) = breaker::cooldown_remaining(r, now, &self.config) {
                    entry["cooldown_remaining_secs"] = remaining.as_secs().into();
                }
                if let Some(reason) = r.open_reason {
                    entry["open_reason"] = reason.label().into();
                }
                entry
            })
            .collect();

        let status = if counts.total > 0 && counts.available == counts.total {
            "healthy"
        } else if counts.available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let mut summary = counts_json(counts);
        summary["service"] = service_name.into();
        summary["status"] = status.into();
        summary["credentials"] = credentials.into();
        Ok(summary)
    }

    /// Health for every service in the store, plus an overall status that
    /// is the worst of the per-service statuses.
    pub async fn health_all(&self) -> Result<serde_json::Value> {
        let names = self.store.services().await?;
        let mut services = serde_json::Map::new();
        let mut overall = if names.is_empty() {
            "unhealthy"
        } else {
            "healthy"
        };

        for name in names {
            let health = self.health(&name).await?;
            match health["status"].as_str() {
                Some("unhealthy") => overall = "unhealthy",
                Some("degraded") if overall == "healthy" => overall = "degraded",
                _ => {}
            }
            services.insert(name, health);
        }

        Ok(serde_json::json!({
            "status": overall,
            "services": services,
        }))
    }

    /// Decrypt every key of a service and report which ones are readable.
    ///
    /// Output carries a fingerprint per key, never the key. Does not touch
    /// usage or circuit state.
    pub async fn verify_secrets(&self, service_name: &str) -> Result<serde_json::Value> {
        let records = self.store.list(service_name).await?;
        if records.is_empty() {
            return Err(Error::UnknownService(service_name.to_string()));
        }

        let mut readable = 0usize;
        let results: Vec<serde_json::Value> = records
            .iter()
            .map(|r| match self.cipher.decrypt(&r.secret) {
                Ok(secret) => {
                    readable += 1;
                    serde_json::json!({
                        "id": r.id,
                        "ok": true,
                        "fingerprint": fingerprint(secret.expose_str()),
                        "active": r.is_active,
                    })
                }
                Err(e) => {
                    warn!(credential_id = %r.id, error = %e, "credential failed verification");
                    serde_json::json!({
                        "id": r.id,
                        "ok": false,
                        "error": e.to_string(),
                        "active": r.is_active,
                    })
                }
            })
            .collect();

        Ok(serde_json::json!({
            "service": service_name,
            "total": records.len(),
            "readable": readable,
            "credentials": results,
        }))
    }

    /// Choose the winner among eligible, non-excluded records.
    fn pick<'a>(
        &self,
        records: &'a [CredentialRecord],
        excluded: &HashSet<String>,
        now: u64,
    ) -> Option<&'a CredentialRecord> {
        let mut candidates: Vec<&CredentialRecord> = records
            .iter()
            .filter(|r| !excluded.contains(&r.id) && breaker::is_eligible(r, now, &self.config))
            .collect();

        match self.config.selection_tiebreak {
            SelectionTiebreak::LeastUsed => candidates.into_iter().min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.usage_count.cmp(&b.usage_count))
                    .then_with(|| a.id.cmp(&b.id))
            }),
            SelectionTiebreak::RoundRobin => {
                candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
                let top = candidates.first()?.priority;
                let tied = candidates.iter().take_while(|r| r.priority == top).count();
                let idx = self.next_index.fetch_add(1, Ordering::Relaxed) % tied;
                Some(candidates[idx])
            }
        }
    }

    fn count(&self, records: &[CredentialRecord], now: u64) -> Counts {
        let mut counts = Counts {
            total: records.len(),
            ..Counts::default()
        };
        for r in records {
            if !r.is_active {
                counts.inactive += 1;
            } else if !r.has_quota() {
                counts.over_quota += 1;
            } else if breaker::is_eligible(r, now, &self.config) {
                counts.available += 1;
            } else if r.is_latched() {
                counts.auth_rejected += 1;
            } else if r.circuit_state == CircuitState::HalfOpen {
                counts.trial_in_flight += 1;
            } else {
                counts.cooling_down += 1;
            }
        }
        counts
    }

    /// Switch off a key whose secret cannot be read, so later selections
    /// skip it without counting usage. An operator re-enables it with
    /// `set_active` once the row is fixed.
    async fn deactivate_unreadable(&self, record: &CredentialRecord) {
        let mut next = record.clone();
        next.is_active = false;
        match self.store.compare_and_swap(record.version, next).await {
            Ok(true) => warn!(
                credential_id = %record.id,
                service = %record.service_name,
                "unreadable credential deactivated"
            ),
            Ok(false) => debug!(
                credential_id = %record.id,
                "unreadable credential changed concurrently, leaving as is"
            ),
            Err(e) => warn!(
                credential_id = %record.id,
                error = %e,
                "failed to deactivate unreadable credential"
            ),
        }
    }

    fn check_handle(&self, handle: &CredentialHandle) -> Result<()> {
        if handle.pool_id != self.id {
            warn!(
                handle_id = %handle.id,
                credential_id = %handle.credential_id,
                "report with a handle issued by a different pool, ignoring"
            );
            return Err(Error::InvalidHandle(format!(
                "handle {} was not issued by this pool",
                handle.id
            )));
        }
        Ok(())
    }

    /// Read the row, apply `event`, and commit with one retry on a lost race.
    ///
    /// Bookkeeping failures after the retry are logged and swallowed: a
    /// missed report only delays circuit changes by one cycle.
    async fn apply_report<F>(&self, handle: &CredentialHandle, event: &str, apply: F) -> Result<()>
    where
        F: Fn(&CredentialRecord, u64) -> Option<Transition>,
    {
        for attempt in 1..=REPORT_ATTEMPTS {
            let record = match self.store.get(&handle.credential_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(
                        credential_id = %handle.credential_id,
                        event,
                        "report references a credential that no longer exists"
                    );
                    return Err(Error::InvalidHandle(format!(
                        "credential {} not found",
                        handle.credential_id
                    )));
                }
                Err(e) => {
                    warn!(credential_id = %handle.credential_id, attempt, error = %e, "failed to read credential for report");
                    continue;
                }
            };

            let now = self.clock.now_millis();
            let Some(transition) = apply(&record, now) else {
                debug!(
                    credential_id = %handle.credential_id,
                    event,
                    state = record.circuit_state.label(),
                    "stale report, circuit unchanged"
                );
                return Ok(());
            };

            match self
                .store
                .compare_and_swap(record.version, transition.next.clone())
                .await
            {
                Ok(true) => {
                    if transition.changed_state() {
                        self.log_transition(&transition, Some(event));
                    }
                    return Ok(());
                }
                Ok(false) => {
                    debug!(credential_id = %handle.credential_id, attempt, event, "report lost update race");
                }
                Err(e) => {
                    warn!(credential_id = %handle.credential_id, attempt, error = %e, "failed to write report");
                }
            }
        }

        warn!(
            credential_id = %handle.credential_id,
            event,
            "report dropped after retry, circuit update delayed"
        );
        Ok(())
    }

    /// Conditional update loop for administrative changes. Returns the row
    /// as it was before the winning write.
    async fn update<F>(&self, credential_id: &str, change: F) -> Result<CredentialRecord>
    where
        F: Fn(&CredentialRecord) -> CredentialRecord,
    {
        let mut service = String::new();
        for _ in 0..self.config.max_selection_attempts {
            let record = self
                .store
                .get(credential_id)
                .await?
                .ok_or_else(|| credential_vault::Error::NotFound(credential_id.to_string()))?;
            let next = change(&record);
            if self.store.compare_and_swap(record.version, next.clone()).await? {
                if record.circuit_state != next.circuit_state {
                    metrics::record_transition(
                        &record.service_name,
                        record.circuit_state,
                        next.circuit_state,
                    );
                }
                return Ok(record);
            }
            service = record.service_name;
        }
        Err(Error::Contention {
            service,
            attempts: self.config.max_selection_attempts,
        })
    }

    fn log_transition(&self, transition: &Transition, event: Option<&str>) {
        let next = &transition.next;
        metrics::record_transition(&next.service_name, transition.from, transition.to);
        match (transition.from, transition.to) {
            (_, CircuitState::Open) => warn!(
                credential_id = %next.id,
                service = %next.service_name,
                from = transition.from.label(),
                event,
                failure_count = next.failure_count,
                latched = next.is_latched(),
                cooldown_secs = breaker::cooldown(next.open_count, &self.config).as_secs(),
                "circuit opened"
            ),
            (_, CircuitState::HalfOpen) => info!(
                credential_id = %next.id,
                service = %next.service_name,
                "cool-down elapsed, issuing trial"
            ),
            (_, CircuitState::Closed) => info!(
                credential_id = %next.id,
                service = %next.service_name,
                "trial succeeded, circuit closed"
            ),
        }
    }
}

fn counts_json(counts: Counts) -> serde_json::Value {
    serde_json::json!({
        "credentials_total": counts.total,
        "credentials_available": counts.available,
        "credentials_cooling_down": counts.cooling_down,
        "credentials_trial_in_flight": counts.trial_in_flight,
        "credentials_auth_rejected": counts.auth_rejected,
        "credentials_over_quota": counts.over_quota,
        "credentials_inactive": counts.inactive,
    })
}

/// Build the exhausted error message JSON.
fn exhausted_message(service_name: &str, counts: Counts) -> String {
    serde_json::json!({
        "error": {
            "type": "pool_exhausted",
            "message": "No eligible credential",
            "service": service_name,
            "pool": counts_json(counts),
        }
    })
    .to_string()
}
