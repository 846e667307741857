//! Failure classification for provider HTTP responses
//!
//! Callers that talk HTTP to the provider can turn a failed response into the
//! `FailureReason` the pool expects. Gemini, like most providers, signals a
//! bad key with 400 + `API_KEY_INVALID` rather than 401, and signals quota
//! with either 429 or a `RESOURCE_EXHAUSTED` status in the body.

use credential_vault::FailureReason;

/// Body fragments that mean the key itself is bad.
const AUTH_PATTERNS: &[&str] = &["api_key_invalid", "api key not valid", "invalid api key"];

/// Body fragments that mean the key hit a rate limit or quota.
const QUOTA_PATTERNS: &[&str] = &["resource_exhausted", "quota", "rate limit"];

fn body_matches(body: &str, patterns: &[&str]) -> bool {
    let lower = body.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

/// Classify a failed provider response by HTTP status and body.
///
/// - 401/403, or 400 naming an invalid key → `AuthRejected`
/// - 429, or any status whose body reports exhausted quota → `RateLimited`
/// - 408/504 → `Timeout`
/// - everything else → `Unknown`
pub fn classify_status(status: u16, body: &str) -> FailureReason {
    match status {
        401 | 403 => FailureReason::AuthRejected,
        400 if body_matches(body, AUTH_PATTERNS) => FailureReason::AuthRejected,
        429 => FailureReason::RateLimited,
        408 | 504 => FailureReason::Timeout,
        _ if body_matches(body, QUOTA_PATTERNS) => FailureReason::RateLimited,
        _ => FailureReason::Unknown,
    }
}
