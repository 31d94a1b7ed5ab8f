//! Key-value stores behind the `storage` action
//!
//! Two scopes: an ephemeral store owned by each session, and a durable store
//! that outlives sessions. The durable store is shared by the process but each
//! session only sees the keys of its owner. Values are kept as JSON text.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Stored value is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Cannot prepare storage location: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;
    async fn set(&self, key: &str, value: &Value) -> StorageResult<()>;
    async fn remove(&self, key: &str) -> StorageResult<()>;
    async fn clear(&self) -> StorageResult<()>;
    /// Remove every key starting with `prefix`.
    async fn clear_prefix(&self, prefix: &str) -> StorageResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageScope {
    /// Lives as long as the session
    Session,
    /// Survives sessions and restarts
    #[default]
    #[serde(alias = "durable")]
    Local,
}

/// The stores a session can reach
#[derive(Clone)]
pub struct StorageScopes {
    pub session: Arc<dyn KeyValueStore>,
    pub durable: Arc<dyn KeyValueStore>,
}

impl StorageScopes {
    pub fn new(session: Arc<dyn KeyValueStore>, durable: Arc<dyn KeyValueStore>) -> Self {
        Self { session, durable }
    }

    /// Fresh session scope, with the durable store narrowed to `owner`.
    pub fn for_session(durable: Arc<dyn KeyValueStore>, owner: &str) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NamespacedStore::new(durable, owner)),
        )
    }

    pub fn scope(&self, scope: StorageScope) -> &Arc<dyn KeyValueStore> {
        match scope {
            StorageScope::Session => &self.session,
            StorageScope::Local => &self.durable,
        }
    }
}

/// A view of a shared store restricted to one owner's keys
pub struct NamespacedStore {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl NamespacedStore {
    /// The owner's length leads the prefix so no owner's prefix can start
    /// another owner's.
    pub fn new(inner: Arc<dyn KeyValueStore>, owner: &str) -> Self {
        Self {
            inner,
            prefix: format!("{}:{owner}/", owner.len()),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl KeyValueStore for NamespacedStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        self.inner.get(&self.key(key)).await
    }

    async fn set(&self, key: &str, value: &Value) -> StorageResult<()> {
        self.inner.set(&self.key(key), value).await
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.inner.remove(&self.key(key)).await
    }

    async fn clear(&self) -> StorageResult<()> {
        self.inner.clear_prefix(&self.prefix).await
    }

    async fn clear_prefix(&self, prefix: &str) -> StorageResult<()> {
        self.inner.clear_prefix(&self.key(prefix)).await
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .map(|text| serde_json::from_str(text))
            .transpose()
            .map_err(StorageError::from)
    }

    async fn set(&self, key: &str, value: &Value) -> StorageResult<()> {
        let text = serde_json::to_string(value)?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), text);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> StorageResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_operations() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", &json!({"amount": 3000})).await.unwrap();
        store.set("other", &json!("x")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"amount": 3000})));

        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.len(), 1);

        store.clear().await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_scope_names() {
        let local: StorageScope = serde_json::from_value(json!("local")).unwrap();
        let durable: StorageScope = serde_json::from_value(json!("durable")).unwrap();
        let session: StorageScope = serde_json::from_value(json!("session")).unwrap();
        assert_eq!(local, StorageScope::Local);
        assert_eq!(durable, StorageScope::Local);
        assert_eq!(session, StorageScope::Session);
        assert_eq!(StorageScope::default(), StorageScope::Local);
    }

    #[tokio::test]
    async fn test_session_scopes_are_isolated() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let alice = StorageScopes::for_session(durable.clone(), "alice");
        let mallory = StorageScopes::for_session(durable.clone(), "mallory");

        alice.scope(StorageScope::Session).set("draft", &json!(1)).await.unwrap();
        alice.scope(StorageScope::Local).set("donor", &json!({"name": "alice"})).await.unwrap();

        assert_eq!(mallory.scope(StorageScope::Session).get("draft").await.unwrap(), None);
        assert_eq!(mallory.scope(StorageScope::Local).get("donor").await.unwrap(), None);

        mallory.scope(StorageScope::Local).set("donor", &json!({"name": "mallory"})).await.unwrap();
        mallory.scope(StorageScope::Local).clear().await.unwrap();
        assert_eq!(mallory.scope(StorageScope::Local).get("donor").await.unwrap(), None);
        assert_eq!(
            alice.scope(StorageScope::Local).get("donor").await.unwrap(),
            Some(json!({"name": "alice"}))
        );
    }

    #[tokio::test]
    async fn test_same_owner_shares_durable_keys() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let first = StorageScopes::for_session(durable.clone(), "client-1");
        first.scope(StorageScope::Local).set("donor", &json!("d1")).await.unwrap();

        let later = StorageScopes::for_session(durable, "client-1");
        assert_eq!(
            later.scope(StorageScope::Local).get("donor").await.unwrap(),
            Some(json!("d1"))
        );
    }

    #[tokio::test]
    async fn test_owner_prefixes_do_not_overlap() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let short = NamespacedStore::new(durable.clone(), "a");
        let long = NamespacedStore::new(durable.clone(), "a/b");
        long.set("k", &json!(1)).await.unwrap();
        short.set("b/k", &json!(2)).await.unwrap();

        short.clear().await.unwrap();
        assert_eq!(long.get("k").await.unwrap(), Some(json!(1)));
        assert_eq!(short.get("b/k").await.unwrap(), None);
    }
}
