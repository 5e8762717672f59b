//! # Key-Value Persistence
//!
//! The core never talks to a concrete storage mechanism. Phase records,
//! allow-lists and commitments go through [`KeyValueStore`], scoped by
//! collection and phase:
//!
//! | key                              | value                               |
//! |----------------------------------|-------------------------------------|
//! | `phases/{collection}`            | phase map keyed by phase name       |
//! | `allowlist/{collection}/{phase}` | plain address array                 |
//! | `commitment/{collection}/{phase}`| `{root, proofs: {address: [hash]}}` |

use crate::error::StoreError;
use crate::phases::PhaseKey;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

pub mod records;
pub mod sqlite;

pub use records::{ActionRecord, NoopRecordSink, RecordSink, RecordSinkConfig, SqliteRecordSink};
pub use sqlite::SqliteStore;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

pub fn phases_key(collection: &str) -> String {
    format!("phases/{}", collection)
}

pub fn allow_list_key(collection: &str, phase: PhaseKey) -> String {
    format!("allowlist/{}/{}", collection, phase.as_str())
}

pub fn commitment_key(collection: &str, phase: PhaseKey) -> String {
    format!("commitment/{}/{}", collection, phase.as_str())
}

pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })?;
    store.set(key, bytes).await
}

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
