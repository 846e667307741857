//! Credential records, persistence and at-rest encryption
//!
//! Holds everything the pool manager needs below the selection policy:
//! the `CredentialRecord` row shape, the `CredentialStore` trait with its
//! compare-and-swap write, two store implementations, and the cipher that
//! protects the `secret` column. This crate has no opinion on which key
//! to pick; that lives in `credential-pool`.
//!
//! Record lifecycle:
//! 1. Operator registers a key → secret encrypted, record inserted `Closed`
//! 2. Pool reads candidate rows with `list()` at selection time
//! 3. Every state change is a `compare_and_swap()` on the row version
//! 4. Deactivation flips `is_active`; rows are never deleted here

pub mod cipher;
pub mod error;
pub mod file_store;
pub mod record;
pub mod store;

pub use cipher::{EncryptedSecret, SecretCipher, fingerprint};
pub use error::{Error, Result};
pub use file_store::FileStore;
pub use record::{CircuitState, CredentialRecord, FailureReason};
pub use store::{CredentialStore, MemoryStore, StoreFuture};
