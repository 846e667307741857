//! Multi-key credential pool with failover and circuit breaking
//!
//! Application code asks the pool for "a working key for service X", makes
//! its external call, and reports back how it went. The pool picks the best
//! eligible key, counts usage, and keeps a per-key circuit breaker so that
//! failing, rate-limited or exhausted keys drop out of rotation without the
//! caller noticing.
//!
//! Call flow:
//! 1. `Pool::acquire(service)` → highest-priority, least-used eligible key
//! 2. Caller performs the external request with `handle.secret()`
//! 3. `Pool::report_success(&handle)` or `Pool::report_failure(&handle, reason)`
//! 4. `threshold` consecutive failures → `Open` for the cool-down window
//! 5. Cool-down elapsed → next `acquire` hands the key out as a single trial
//! 6. Trial success → `Closed`; trial failure → `Open` with doubled cool-down
//!
//! There is no background task: cool-downs are evaluated lazily at
//! `acquire` time against the injected `Clock`.

pub mod breaker;
pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod pool;

pub use classify::classify_status;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PoolConfig, SelectionTiebreak};
pub use credential_vault::{CircuitState, FailureReason};
pub use error::{Error, Result};
pub use handle::CredentialHandle;
pub use pool::{NewCredential, Pool};
