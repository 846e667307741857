//! Persistence interface for credential rows
//!
//! The pool never holds a lock across a read and a write. Every mutation is
//! a conditional write keyed on the row `version` the caller last read, so
//! two pool instances sharing one table get at-most-one-winner semantics per
//! row without a lock manager.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::record::CredentialRecord;

/// Boxed future returned by store methods.
///
/// Uses `Pin<Box<dyn Future>>` so the trait stays dyn-compatible
/// (`Arc<dyn CredentialStore>`).
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Shared storage for credential rows.
pub trait CredentialStore: Send + Sync {
    /// Insert a new row. Fails with `AlreadyExists` if the id is taken.
    fn insert(&self, record: CredentialRecord) -> StoreFuture<'_, ()>;

    /// Fetch a single row by id.
    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<CredentialRecord>>;

    /// All rows (active or not) registered for a service.
    fn list<'a>(&'a self, service_name: &'a str) -> StoreFuture<'a, Vec<CredentialRecord>>;

    /// Distinct service names with at least one row, sorted.
    fn services(&self) -> StoreFuture<'_, Vec<String>>;

    /// Replace a row iff its stored version equals `expected_version`.
    ///
    /// Returns `Ok(true)` when the write landed (the stored row now carries
    /// `expected_version + 1`), `Ok(false)` when another writer got there
    /// first. A missing row is `NotFound`.
    fn compare_and_swap(
        &self,
        expected_version: u64,
        record: CredentialRecord,
    ) -> StoreFuture<'_, bool>;
}

/// Apply a conditional write to an in-memory map.
///
/// Shared by `MemoryStore` and `FileStore` so both enforce the same rules.
pub(crate) fn cas_in_map(
    rows: &mut HashMap<String, CredentialRecord>,
    expected_version: u64,
    mut record: CredentialRecord,
) -> Result<bool> {
    let current = rows
        .get(&record.id)
        .ok_or_else(|| Error::NotFound(record.id.clone()))?;

    if current.version != expected_version {
        debug!(
            credential_id = %record.id,
            expected_version,
            actual_version = current.version,
            "conditional write lost the race"
        );
        return Ok(false);
    }

    record.version = expected_version + 1;
    rows.insert(record.id.clone(), record);
    Ok(true)
}

pub(crate) fn list_in_map(
    rows: &HashMap<String, CredentialRecord>,
    service_name: &str,
) -> Vec<CredentialRecord> {
    let mut records: Vec<CredentialRecord> = rows
        .values()
        .filter(|r| r.service_name == service_name)
        .cloned()
        .collect();
    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}

pub(crate) fn services_in_map(rows: &HashMap<String, CredentialRecord>) -> Vec<String> {
    let mut names: Vec<String> = rows.values().map(|r| r.service_name.clone()).collect();
    names.sort();
    names.dedup();
    names
}

/// In-process store. Suitable for tests and single-instance deployments.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<String, CredentialRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialStore for MemoryStore {
    fn insert(&self, record: CredentialRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            if rows.contains_key(&record.id) {
                return Err(Error::AlreadyExists(record.id));
            }
            debug!(credential_id = %record.id, service = %record.service_name, "inserted credential");
            rows.insert(record.id.clone(), record);
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<CredentialRecord>> {
        Box::pin(async move { Ok(self.rows.read().await.get(id).cloned()) })
    }

    fn list<'a>(&'a self, service_name: &'a str) -> StoreFuture<'a, Vec<CredentialRecord>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            trace!(service = service_name, "MemoryStore::list: got read lock");
            Ok(list_in_map(&rows, service_name))
        })
    }

    fn services(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(services_in_map(&*self.rows.read().await)) })
    }

    fn compare_and_swap(
        &self,
        expected_version: u64,
        record: CredentialRecord,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            cas_in_map(&mut rows, expected_version, record)
        })
    }
}
