//! In-process store for tests and storage-less runs.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{IdentityStore, PageStore, StoreError};
use crate::protocol::{Identity, IdentityId, RoomId};

#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<IdentityId, Identity>>,
    pages: RwLock<HashMap<RoomId, Value>>,
    fail_writes: AtomicBool,
    fail_lookups: AtomicBool,
    write_delay_ms: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, identity: Identity) {
        self.users.write().await.insert(identity.id.clone(), identity);
    }

    pub async fn remove_user(&self, id: &IdentityId) -> Option<Identity> {
        self.users.write().await.remove(id)
    }

    /// Create a page with `null` content.
    pub async fn create_page(&self, page: RoomId) {
        self.create_page_with(page, Value::Null).await;
    }

    /// Create a page unless it exists. Returns `true` if it was created.
    pub async fn create_page_with(&self, page: RoomId, content: Value) -> bool {
        match self.pages.write().await.entry(page) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(content);
                true
            }
        }
    }

    pub async fn delete_page(&self, page: &RoomId) -> bool {
        self.pages.write().await.remove(page).is_some()
    }

    pub async fn load_content(&self, page: &RoomId) -> Option<Value> {
        self.pages.read().await.get(page).cloned()
    }

    /// Make every subsequent `persist_content` fail with `Unavailable`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent identity lookup fail with `Unavailable`.
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Delay each content write by `delay` before it touches the map.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successful content writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn lookup_identity(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("lookup failure injected".into()));
        }
        Ok(self.users.read().await.get(id).cloned())
    }
}

#[async_trait]
impl PageStore for MemoryStore {
    async fn persist_content(&self, page: &RoomId, content: &Value) -> Result<(), StoreError> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("write failure injected".into()));
        }
        let mut pages = self.pages.write().await;
        match pages.get_mut(page) {
            Some(slot) => {
                *slot = content.clone();
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(StoreError::PageNotFound(page.clone())),
        }
    }
}
