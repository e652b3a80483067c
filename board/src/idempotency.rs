//! Idempotency keys for in-flight updates.
//!
//! Each `(row, action)` pair has at most one pending request id. Asking again
//! while the id is younger than the TTL returns the same id, so a resubmitted
//! update is recognised by the backend as a duplicate. Storage problems never
//! block an update: the store degrades to minting a fresh id.

use crate::types::{PackingAction, RequestId, RowIndexRef};
use chrono::{DateTime, Utc};
use packboard_core::environment::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Default lifetime of a pending request id.
pub const DEFAULT_TTL: chrono::Duration = chrono::Duration::seconds(300);

/// Errors from a key-value backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    /// The backend could not be read
    #[error("Key store read failed: {0}")]
    Read(String),
    /// The backend could not be written
    #[error("Key store write failed: {0}")]
    Write(String),
}

/// Process-wide string key-value storage.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Read`] if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, KeyStoreError>;

    /// Write a value.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Write`] if the backend cannot be written.
    fn set(&self, key: &str, value: String) -> Result<(), KeyStoreError>;

    /// Delete a value. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Write`] if the backend cannot be written.
    fn delete(&self, key: &str) -> Result<(), KeyStoreError>;
}

/// In-memory [`KeyValueStore`] shared by clones.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKeyValueStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryKeyValueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, KeyStoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), KeyStoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KeyStoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// [`KeyValueStore`] persisted as one JSON object in a file, so pending ids
/// survive a restart of the process.
#[derive(Debug)]
pub struct JsonFileKeyValueStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileKeyValueStore {
    /// Use the file at `path`; it is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, String>, KeyStoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(HashMap::new()),
            Ok(text) => serde_json::from_str(&text).map_err(|e| KeyStoreError::Read(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(KeyStoreError::Read(e.to_string())),
        }
    }

    fn save(&self, entries: &HashMap<String, String>) -> Result<(), KeyStoreError> {
        let text = serde_json::to_string(entries).map_err(|e| KeyStoreError::Write(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|e| KeyStoreError::Write(e.to_string()))
    }
}

impl KeyValueStore for JsonFileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, KeyStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: String) -> Result<(), KeyStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value);
        self.save(&entries)
    }

    fn delete(&self, key: &str) -> Result<(), KeyStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }
}

/// A pending request id and when it was minted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingOperation {
    /// Row the update targets
    pub row: RowIndexRef,
    /// Action the update performs
    pub action: PackingAction,
    /// Request id sent to the backend
    pub request_id: RequestId,
    /// When the id was minted
    pub created_at: DateTime<Utc>,
}

/// Stored form: `{"id": "...", "ts": <epoch millis>}`.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    id: String,
    ts: i64,
}

/// Storage key for a `(row, action)` pair.
#[must_use]
pub fn storage_key(row: RowIndexRef, action: PackingAction) -> String {
    format!("pending:{row}:{}", action.as_str())
}

/// Request-id minting and reuse over a [`KeyValueStore`].
#[derive(Clone)]
pub struct IdempotencyKeyStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl IdempotencyKeyStore {
    /// Create a key store with the default 300 second TTL.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(store, clock, DEFAULT_TTL)
    }

    /// Create a key store with a custom TTL.
    #[must_use]
    pub fn with_ttl(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, ttl: chrono::Duration) -> Self {
        Self { store, clock, ttl }
    }

    /// TTL of pending ids.
    #[must_use]
    pub const fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// The unexpired pending operation for a pair, if any.
    ///
    /// Missing, malformed and expired entries all read as `None`.
    #[must_use]
    pub fn pending(&self, row: RowIndexRef, action: PackingAction) -> Option<PendingOperation> {
        let key = storage_key(row, action);
        let raw = match self.store.get(&key) {
            Ok(raw) => raw?,
            Err(error) => {
                tracing::warn!(%row, %action, error = %error, "Idempotency key read failed");
                return None;
            },
        };

        let entry: StoredEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(error) => {
                tracing::debug!(%row, %action, error = %error, "Ignoring malformed idempotency entry");
                return None;
            },
        };

        let created_at = DateTime::<Utc>::from_timestamp_millis(entry.ts)?;
        if self.clock.now() - created_at > self.ttl {
            return None;
        }

        Some(PendingOperation {
            row,
            action,
            request_id: RequestId::from(entry.id),
            created_at,
        })
    }

    /// Reuse the pending id for a pair, or mint and persist a fresh one.
    ///
    /// A freshly minted id never equals the expired id it replaces.
    #[must_use]
    pub fn get_or_create_key(&self, row: RowIndexRef, action: PackingAction) -> RequestId {
        if let Some(pending) = self.pending(row, action) {
            tracing::debug!(%row, %action, request_id = %pending.request_id, "Reusing pending request id");
            return pending.request_id;
        }

        let previous = self.raw_id(row, action);
        let mut request_id = RequestId::generate();
        while previous.as_deref() == Some(request_id.as_str()) {
            request_id = RequestId::generate();
        }

        let entry = StoredEntry {
            id: request_id.to_string(),
            ts: self.clock.now().timestamp_millis(),
        };
        match serde_json::to_string(&entry) {
            Ok(value) => {
                if let Err(error) = self.store.set(&storage_key(row, action), value) {
                    tracing::warn!(%row, %action, error = %error, "Idempotency key write failed");
                }
            },
            Err(error) => {
                tracing::warn!(%row, %action, error = %error, "Idempotency entry encoding failed");
            },
        }

        tracing::debug!(%row, %action, request_id = %request_id, "Minted request id");
        request_id
    }

    /// Forget the pending id for a pair. Storage errors are logged and ignored.
    pub fn clear_key(&self, row: RowIndexRef, action: PackingAction) {
        if let Err(error) = self.store.delete(&storage_key(row, action)) {
            tracing::warn!(%row, %action, error = %error, "Idempotency key delete failed");
        }
    }

    fn raw_id(&self, row: RowIndexRef, action: PackingAction) -> Option<String> {
        let raw = self.store.get(&storage_key(row, action)).ok()??;
        serde_json::from_str::<StoredEntry>(&raw).ok().map(|entry| entry.id)
    }
}

impl std::fmt::Debug for IdempotencyKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyKeyStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
