//! Startup provisioning from a JSON file.
//!
//! ```json
//! {
//!   "users": [{ "id": "u1", "email": "ada@example.com", "name": "Ada" }],
//!   "pages": [{ "id": "page-1", "content": { "blocks": [] } }]
//! }
//! ```
//!
//! Users are upserted. Pages are only created when missing, so reapplying the
//! same file on restart never rolls back edited content.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use super::{MemoryStore, RocksStore, StoreError, UserRecord};
use crate::protocol::{Identity, RoomId};

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("cannot read seed file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid seed file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub pages: Vec<SeedPage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedPage {
    pub id: RoomId,
    /// Initial content; `null` when omitted
    #[serde(default)]
    pub content: Value,
}

/// What applying a seed changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub users: usize,
    pub pages_created: usize,
    pub pages_existing: usize,
}

impl Seed {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SeedError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SeedError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SeedError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_to_rocks(&self, store: &RocksStore) -> Result<SeedReport, SeedError> {
        let mut report = SeedReport::default();
        for user in &self.users {
            store.put_user(user)?;
            report.users += 1;
        }
        for page in &self.pages {
            match store.create_page_if_missing(&page.id, &page.content)? {
                Some(_) => report.pages_created += 1,
                None => report.pages_existing += 1,
            }
        }
        log::info!("Seeded {report:?} into {}", store.path().display());
        Ok(report)
    }

    pub async fn apply_to_memory(&self, store: &MemoryStore) -> SeedReport {
        let mut report = SeedReport::default();
        for user in &self.users {
            store.insert_user(Identity::from(user.clone())).await;
            report.users += 1;
        }
        for page in &self.pages {
            if store.create_page_with(page.id.clone(), page.content.clone()).await {
                report.pages_created += 1;
            } else {
                report.pages_existing += 1;
            }
        }
        log::info!("Seeded {report:?} into the in-memory store");
        report
    }
}
