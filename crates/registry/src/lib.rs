//! Relay registration store.
//!
//! [`FileRegistrationStore`] keeps every registration in memory, indexed by
//! `(event_kind, repository)`, and persists the full set as one JSON document:
//!
//! ```json
//! { "updated_at": "2026-01-01T00:00:00Z", "registrations": [ { "event_kind": "push", ... } ] }
//! ```
//!
//! Reads never touch the disk. Each write rewrites the document atomically
//! (temporary file in the same directory, then rename) and only updates the
//! in-memory index once the document is on disk.
//!
//! Buckets are shared behind an [`Arc`]: a lookup snapshots its bucket without
//! copying it, and a write copies only the bucket it changes.


use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use chrono::Utc;
use dispatch::{
    EventKind, Registration, RegistrationIdentity, RegistrationStore, RegistrationStream,
    RegistrationWriter, RepositoryName, StoreError,
};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, info};

type IndexKey = (EventKind, RepositoryName);
type Index = HashMap<IndexKey, Arc<Vec<Registration>>>;

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    registrations: Vec<Registration>,
}

/// JSON-file-backed [`RegistrationStore`] and [`RegistrationWriter`].
#[derive(Debug)]
pub struct FileRegistrationStore {
    path: PathBuf,
    index: RwLock<Index>,
    // Serializes writers so concurrent upserts cannot lose each other's records.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileRegistrationStore {
    /// Loads the document at `path`. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let registrations = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let document: RegistryDocument = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
                document.registrations
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "{}: {e}",
                    path.display()
                )))
            }
        };

        let mut index = Index::new();
        for registration in registrations {
            insert(&mut index, registration);
        }
        info!(
            path = %path.display(),
            registrations = index.values().map(|bucket| bucket.len()).sum::<usize>(),
            "registration store loaded"
        );

        Ok(Self {
            path,
            index: RwLock::new(index),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored registrations.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.values().map(|bucket| bucket.len()).sum())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Index>, StoreError> {
        self.index
            .read()
            .map_err(|_| StoreError::Unavailable("registration index lock poisoned".to_string()))
    }

    /// Applies `change` to a copy of the index, persists it, then publishes it.
    async fn modify<T>(&self, change: impl FnOnce(&mut Index) -> T) -> Result<T, StoreError> {
        let _writer = self.write_lock.lock().await;

        let mut next = self.read()?.clone();
        let result = change(&mut next);
        write_document(&self.path, &next).await?;

        let mut index = self
            .index
            .write()
            .map_err(|_| StoreError::Unavailable("registration index lock poisoned".to_string()))?;
        *index = next;
        Ok(result)
    }
}

/// Inserts `registration`, replacing any record with the same identity.
fn insert(index: &mut Index, registration: Registration) {
    let bucket = Arc::make_mut(
        index
            .entry((registration.event_kind, registration.repository.clone()))
            .or_default(),
    );
    let identity = registration.identity();
    match bucket.iter_mut().find(|r| r.identity() == identity) {
        Some(existing) => *existing = registration,
        None => bucket.push(registration),
    }
}

fn sort_key(registration: &Registration) -> (EventKind, &str, &str, &str) {
    (
        registration.event_kind,
        registration.repository.as_str(),
        registration.job_name.as_str(),
        registration.ci_endpoint.as_str(),
    )
}

async fn write_document(path: &Path, index: &Index) -> Result<(), StoreError> {
    let mut registrations: Vec<&Registration> =
        index.values().flat_map(|bucket| bucket.iter()).collect();
    registrations.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    let document = serde_json::json!({
        "updated_at": Utc::now(),
        "registrations": registrations,
    });
    let bytes = serde_json::to_vec_pretty(&document)
        .map_err(|e| StoreError::Unavailable(format!("failed to encode registrations: {e}")))?;

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok::<_, std::io::Error>(())
    })
    .await
    .map_err(|e| StoreError::Unavailable(format!("registry writer task failed: {e}")))?
    .map_err(|e| StoreError::Unavailable(e.to_string()))
}

impl RegistrationStore for FileRegistrationStore {
    fn find<'a>(
        &'a self,
        kind: EventKind,
        repository: &'a RepositoryName,
    ) -> RegistrationStream<'a> {
        // Snapshot: later writes publish new buckets and leave this one alone.
        let bucket = match self.read() {
            Ok(index) => index
                .get(&(kind, repository.clone()))
                .cloned()
                .unwrap_or_default(),
            Err(e) => return stream::iter([Err(e)]).boxed(),
        };
        debug!(%kind, %repository, candidates = bucket.len(), "registration lookup");
        stream::iter((0..bucket.len()).map(move |i| Ok(bucket[i].clone()))).boxed()
    }
}

#[async_trait]
impl RegistrationWriter for FileRegistrationStore {
    async fn upsert(&self, registration: Registration) -> Result<(), StoreError> {
        let identity = registration.identity();
        self.modify(|index| insert(index, registration)).await?;
        info!(
            kind = %identity.event_kind,
            repository = %identity.repository,
            job = %identity.job_name,
            "registration stored"
        );
        Ok(())
    }

    async fn remove(&self, identity: &RegistrationIdentity) -> Result<bool, StoreError> {
        let removed = self
            .modify(|index| {
                let key = (identity.event_kind, identity.repository.clone());
                let Some(bucket) = index.get_mut(&key) else {
                    return false;
                };
                let before = bucket.len();
                Arc::make_mut(bucket).retain(|r| &r.identity() != identity);
                let removed = bucket.len() != before;
                if bucket.is_empty() {
                    index.remove(&key);
                }
                removed
            })
            .await?;
        if removed {
            info!(job = %identity.job_name, repository = %identity.repository, "registration removed");
        }
        Ok(removed)
    }
}
