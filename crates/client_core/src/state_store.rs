use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::StateScope;
use storage::Storage;

use crate::StateStore;

/// Browser-storage analog backed by the shared SQLite layer, so session
/// flags and the theme survive a process restart.
pub struct DurableStateStore {
    store: Storage,
}

impl DurableStateStore {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url).await.with_context(|| {
            format!("failed to initialize client state storage at '{database_url}'")
        })?;
        Ok(Arc::new(Self { store }))
    }

    /// Tab-close analog: drops every session-scoped value at once.
    /// Persistent values such as the theme are untouched.
    pub async fn end_session(&self) -> Result<u64> {
        self.store.kv_clear_scope(StateScope::Session).await
    }
}

#[async_trait]
impl StateStore for DurableStateStore {
    async fn get(&self, scope: StateScope, key: &str) -> Result<Option<String>> {
        self.store.kv_get(scope, key).await
    }

    async fn set(&self, scope: StateScope, key: &str, value: &str) -> Result<()> {
        self.store.kv_set(scope, key, value).await
    }

    async fn remove(&self, scope: StateScope, key: &str) -> Result<()> {
        self.store.kv_remove(scope, key).await?;
        Ok(())
    }

    async fn take(&self, scope: StateScope, key: &str) -> Result<Option<String>> {
        self.store.kv_take(scope, key).await
    }
}
