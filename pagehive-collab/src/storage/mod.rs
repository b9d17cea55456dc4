//! Durable store seams used by the realtime core.
//!
//! ```text
//! ┌──────────────┐  lookup_identity   ┌──────────────┐
//! │Authenticator │ ─────────────────► │              │
//! └──────────────┘                    │ IdentityStore│
//! ┌──────────────┐  persist_content   │ + PageStore  │
//! │ ContentSync  │ ─────────────────► │              │
//! └──────────────┘   (detached task)  └──────┬───────┘
//!                                            │
//!                             ┌──────────────┴─────────────┐
//!                             ▼                            ▼
//!                      RocksStore (disk)           MemoryStore (tests)
//! ```
//!
//! The core assumes atomic per-row writes and nothing more: concurrent
//! content writes for one page are last-writer-wins.

pub mod memory;
pub mod rocks;
pub mod seed;

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::{Identity, IdentityId, RoomId};

pub use memory::MemoryStore;
pub use rocks::{PageMeta, RocksConfig, RocksStore, UserRecord};
pub use seed::{Seed, SeedError, SeedPage, SeedReport};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("page not found: {0}")]
    PageNotFound(RoomId),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Resolves identity ids carried by credentials.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// `Ok(None)` when the identity no longer exists.
    async fn lookup_identity(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError>;
}

/// Receives the latest content of a page.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Overwrite the stored content of `page`. Fails with
    /// [`StoreError::PageNotFound`] if the page was deleted.
    async fn persist_content(&self, page: &RoomId, content: &Value) -> Result<(), StoreError>;
}
