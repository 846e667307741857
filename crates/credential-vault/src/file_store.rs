//! JSON file-backed credential store
//!
//! Keeps a JSON map of credential id → record on disk. All writes use atomic
//! temp-file + rename to prevent corruption on crash, and the in-memory copy
//! only changes after the file write succeeded. A tokio Mutex serializes
//! writers inside this process; the file is not meant to be shared between
//! processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::record::CredentialRecord;
use crate::store::{CredentialStore, StoreFuture, cas_in_map, list_in_map, services_in_map};

/// Credential store persisted as a single JSON file.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<HashMap<String, CredentialRecord>>,
}

impl FileStore {
    /// Load credentials from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with zero
    /// credentials). Every service reports `unhealthy` until keys are
    /// registered.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let records: HashMap<String, CredentialRecord> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), credentials = records.len(), "loaded credentials");
            records
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let records = HashMap::new();
            write_atomic(&path, &records).await?;
            records
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored credentials.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialStore for FileStore {
    fn insert(&self, record: CredentialRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.contains_key(&record.id) {
                return Err(Error::AlreadyExists(record.id));
            }
            let mut next = state.clone();
            let id = record.id.clone();
            next.insert(id.clone(), record);
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(credential_id = %id, "added credential");
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<CredentialRecord>> {
        Box::pin(async move { Ok(self.state.lock().await.get(id).cloned()) })
    }

    fn list<'a>(&'a self, service_name: &'a str) -> StoreFuture<'a, Vec<CredentialRecord>> {
        Box::pin(async move { Ok(list_in_map(&*self.state.lock().await, service_name)) })
    }

    fn services(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(services_in_map(&*self.state.lock().await)) })
    }

    fn compare_and_swap(
        &self,
        expected_version: u64,
        record: CredentialRecord,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            if !cas_in_map(&mut next, expected_version, record)? {
                return Ok(false);
            }
            write_atomic(&self.path, &next).await?;
            *state = next;
            Ok(true)
        })
    }
}

/// Write credentials to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only); the
/// secrets are encrypted but the file still names every key and its state.
async fn write_atomic(path: &Path, data: &HashMap<String, CredentialRecord>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
