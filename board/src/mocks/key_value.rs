//! Mock key-value stores.

use crate::idempotency::{KeyStoreError, KeyValueStore};

/// Key-value store whose every operation fails, like storage that is full or
/// disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingKeyValueStore;

impl KeyValueStore for FailingKeyValueStore {
    fn get(&self, _key: &str) -> Result<Option<String>, KeyStoreError> {
        Err(KeyStoreError::Read("storage unavailable".to_string()))
    }

    fn set(&self, _key: &str, _value: String) -> Result<(), KeyStoreError> {
        Err(KeyStoreError::Write("storage unavailable".to_string()))
    }

    fn delete(&self, _key: &str) -> Result<(), KeyStoreError> {
        Err(KeyStoreError::Write("storage unavailable".to_string()))
    }
}
