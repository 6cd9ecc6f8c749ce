//! Persistence backends for the dealdesk back office.
//!
//! Two adapters implement the store traits from `dealdesk-core`: an
//! in-memory store for tests and development, and a Postgres store for
//! production. Both enforce the same compare-and-set semantics so the
//! engine behaves identically on either.

#![deny(unsafe_code)]

pub mod memory;
pub mod postgres;

use dealdesk_core::store::{BackOfficeStore, StoreError, StoreResult};
use std::sync::Arc;

pub use dealdesk_core::store::{QueryWindow, RequirementsUpsert};
pub use memory::InMemoryBackOfficeStore;
pub use postgres::PostgresBackOfficeStore;

/// Backend selection resolved from CLI flags and environment.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Memory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageConfig::Memory => "memory",
            StorageConfig::Postgres { .. } => "postgres",
        }
    }

    /// Connect the configured backend. The Postgres adapter creates its
    /// schema on first connect.
    pub async fn connect(&self) -> StoreResult<Arc<dyn BackOfficeStore>> {
        match self {
            StorageConfig::Memory => Ok(Arc::new(InMemoryBackOfficeStore::new())),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store =
                    PostgresBackOfficeStore::connect(database_url, *max_connections).await?;
                Ok(Arc::new(store))
            }
        }
    }
}

pub(crate) fn apply_window<T>(mut items: Vec<T>, window: QueryWindow) -> Vec<T> {
    if window.offset >= items.len() {
        return Vec::new();
    }
    let items = items.split_off(window.offset);
    items.into_iter().take(window.limit).collect()
}

pub(crate) fn poisoned() -> StoreError {
    StoreError::Backend("store lock poisoned".to_string())
}
