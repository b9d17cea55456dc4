//! # pagehive-collab: Realtime collaboration core for Pagehive pages
//!
//! Authenticated WebSocket connections join page rooms, see who else is
//! there, and exchange cursor positions and page content. Content edits are
//! rebroadcast immediately and persisted in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)   ┌──────────────┐
//! │ Editor tab  │ ◄──────────────────► │ CollabServer │ one task per connection
//! └─────────────┘                      └──────┬───────┘
//!                                             │ Session ─► HubCommand
//!                                             ▼
//!                                      ┌──────────────┐
//!                                      │     Hub      │ single owner
//!                                      │ Presence +   │
//!                                      │ Fanout       │
//!                                      └──────┬───────┘
//!                                             │ detached
//!                                             ▼
//!                                      ┌──────────────┐
//!                                      │  PageStore   │ RocksDB / memory
//!                                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON event envelope and identifier types
//! - [`auth`]: token verification and identity resolution
//! - [`presence`]: room membership registry
//! - [`broadcast`]: room fan-out with bounded per-connection queues
//! - [`sync`]: content rebroadcast + detached persistence
//! - [`hub`]: serialized owner of presence and fan-out state
//! - [`session`]: per-connection lifecycle
//! - [`server`]: WebSocket accept loop and connection tasks
//! - [`config`]: environment-driven configuration
//! - [`notify`]: user notifications pushed over live connections
//! - [`storage`]: identity/page store traits, RocksDB and in-memory adapters, seeding

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod hub;
pub mod notify;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, Claims, JwtVerifier};
pub use broadcast::{BroadcastStats, Delivery, JoinOutcome, RoomBroadcaster};
pub use config::{ConfigError, ServerConfig};
pub use hub::{HubClosed, HubHandle, HubStats};
pub use notify::Notification;
pub use presence::{Membership, PresenceRegistry};
pub use protocol::{
    ClientEvent, ConnectionId, Frame, Identity, IdentityId, ProtocolError, RoomId, ServerEvent,
};
pub use server::{CollabServer, ServerError, ServerStats};
pub use session::{Session, SessionState};
pub use storage::{
    IdentityStore, MemoryStore, PageMeta, PageStore, RocksConfig, RocksStore, Seed, SeedError,
    StoreError, UserRecord,
};
pub use sync::{ContentSync, PersistStats};
