//! Handle for one acquisition

use std::sync::atomic::{AtomicBool, Ordering};

use common::Secret;
use uuid::Uuid;

/// A credential checked out by `Pool::acquire`.
///
/// Holds the decrypted key for the duration of the caller's request; the
/// secret is zeroized when the handle drops. Report the outcome exactly
/// once via `Pool::report_success` / `Pool::report_failure`; further reports
/// on the same handle are ignored.
#[derive(Debug)]
pub struct CredentialHandle {
    pub(crate) id: Uuid,
    pub(crate) pool_id: Uuid,
    pub(crate) credential_id: String,
    pub(crate) service_name: String,
    pub(crate) secret: Secret<String>,
    /// `last_tested_at` stamped on the row if this acquisition is a trial.
    pub(crate) trial_started_at: Option<u64>,
    pub(crate) reported: AtomicBool,
}

impl CredentialHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn credential_id(&self) -> &str {
        &self.credential_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The decrypted API key.
    pub fn secret(&self) -> &Secret<String> {
        &self.secret
    }

    /// Whether this acquisition is the single recovery trial for a key that
    /// was `Open`.
    pub fn is_trial(&self) -> bool {
        self.trial_started_at.is_some()
    }

    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }

    /// Claim the one report this handle is allowed. Returns `false` if a
    /// report already went through.
    pub(crate) fn claim_report(&self) -> bool {
        self.reported
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
