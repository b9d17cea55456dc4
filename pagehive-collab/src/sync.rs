//! Content sync: rebroadcast page content, then persist it in the background.
//!
//! ```text
//! content-update ──► fan-out to room (synchronous, inside the hub)
//!                └─► tokio::spawn(persist_content)  (detached, best effort)
//!                          │
//!                          └─ failure ─► log::error! + PersistStats
//! ```
//!
//! The durable write never gates the broadcast and is never awaited by it.
//! A failed write is not reported to the sender and does not retract what
//! collaborators already saw. Concurrent writes for one page are
//! last-writer-wins at the store; nothing here orders or coalesces them.
//! In-flight writes outlive the connection that triggered them. Their number
//! is tracked, and crossing [`IN_FLIGHT_WARN_THRESHOLD`] logs a warning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::broadcast::RoomBroadcaster;
use crate::protocol::{ConnectionId, IdentityId, RoomId};
use crate::storage::PageStore;

/// Default number of unfinished writes above which a stalled store is reported.
pub const IN_FLIGHT_WARN_THRESHOLD: u64 = 256;

/// Persistence counters, shared with detached write tasks.
#[derive(Debug, Default)]
pub struct PersistStats {
    attempts: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicU64,
}

impl PersistStats {
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Writes spawned but not yet finished.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Decrements the in-flight gauge when the write task ends, aborted or not.
struct InFlight(Arc<PersistStats>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct ContentSync {
    pages: Arc<dyn PageStore>,
    stats: Arc<PersistStats>,
    warn_threshold: u64,
}

impl ContentSync {
    pub fn new(pages: Arc<dyn PageStore>) -> Self {
        Self {
            pages,
            stats: Arc::new(PersistStats::default()),
            warn_threshold: IN_FLIGHT_WARN_THRESHOLD,
        }
    }

    pub fn with_warn_threshold(mut self, threshold: u64) -> Self {
        self.warn_threshold = threshold;
        self
    }

    pub fn stats(&self) -> &Arc<PersistStats> {
        &self.stats
    }

    /// Handle one `content-update` from `connection`.
    ///
    /// Returns the handle of the spawned write, or `None` if the connection is
    /// unknown to the broadcaster (nothing is broadcast or persisted then).
    pub fn content_update(
        &self,
        broadcaster: &mut RoomBroadcaster,
        connection: ConnectionId,
        room: RoomId,
        content: Value,
    ) -> Option<JoinHandle<()>> {
        let identity = broadcaster.identity_of(connection)?.id.clone();
        let delivered = broadcaster.content_update(connection, &room, content.clone());
        log::debug!(
            "Content update from {identity} in room {room} delivered to {delivered} peer(s)"
        );
        Some(self.persist_detached(identity, room, content))
    }

    /// Spawn one write attempt. Must be called from within a Tokio runtime.
    pub fn persist_detached(
        &self,
        identity: IdentityId,
        room: RoomId,
        content: Value,
    ) -> JoinHandle<()> {
        let pages = self.pages.clone();
        let stats = self.stats.clone();
        stats.attempts.fetch_add(1, Ordering::Relaxed);
        let pending = stats.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        if pending == self.warn_threshold {
            log::warn!("{pending} page writes in flight; the page store is not keeping up");
        }
        let guard = InFlight(stats.clone());
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = pages.persist_content(&room, &content).await {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to persist content for page {room} (edit by {identity}): {e}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, Identity, ServerEvent};
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn attach(b: &mut RoomBroadcaster, user: &str) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::channel(16);
        b.attach(conn, Identity::new(user, user), tx);
        b.join_room(conn, &RoomId::new("page-1"));
        (conn, rx)
    }

    async fn setup() -> (Arc<MemoryStore>, ContentSync, RoomBroadcaster) {
        let store = Arc::new(MemoryStore::new());
        store.create_page(RoomId::new("page-1")).await;
        let sync = ContentSync::new(store.clone());
        (store, sync, RoomBroadcaster::new(0))
    }

    #[tokio::test]
    async fn test_broadcast_and_persist() {
        let (store, sync, mut b) = setup().await;
        let (c1, mut rx1) = attach(&mut b, "u1");
        let (_c2, mut rx2) = attach(&mut b, "u2");
        let _ = rx1.try_recv();

        let handle = sync
            .content_update(&mut b, c1, RoomId::new("page-1"), json!({"x": 1}))
            .unwrap();
        let frame = rx2.try_recv().unwrap();
        assert_eq!(
            ServerEvent::decode(frame.as_str()).unwrap(),
            ServerEvent::ContentUpdate { user_id: IdentityId::new("u1"), content: json!({"x": 1}) }
        );
        assert!(rx1.try_recv().is_err());

        handle.await.unwrap();
        assert_eq!(store.load_content(&RoomId::new("page-1")).await, Some(json!({"x": 1})));
        assert_eq!(sync.stats().attempts(), 1);
        assert_eq!(sync.stats().failures(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_broadcast() {
        let (store, sync, mut b) = setup().await;
        let (c1, _rx1) = attach(&mut b, "u1");
        let (_c2, mut rx2) = attach(&mut b, "u2");
        store.fail_writes(true);

        let handle = sync
            .content_update(&mut b, c1, RoomId::new("page-1"), json!("draft"))
            .unwrap();
        assert!(rx2.try_recv().is_ok());
        handle.await.unwrap();
        assert_eq!(sync.stats().failures(), 1);
        assert_eq!(store.load_content(&RoomId::new("page-1")).await, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_slow_write_does_not_delay_broadcast() {
        let (store, sync, mut b) = setup().await;
        let (c1, _rx1) = attach(&mut b, "u1");
        let (_c2, mut rx2) = attach(&mut b, "u2");
        store.set_write_delay(Duration::from_secs(30));

        let handle = sync
            .content_update(&mut b, c1, RoomId::new("page-1"), json!(1))
            .unwrap();
        assert!(rx2.try_recv().is_ok());
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn test_in_flight_gauge_tracks_stalled_writes() {
        let (store, sync, mut b) = setup().await;
        let sync = sync.with_warn_threshold(3);
        let (c1, _rx1) = attach(&mut b, "u1");
        store.set_write_delay(Duration::from_secs(30));

        let handles: Vec<_> = (0..5)
            .filter_map(|i| sync.content_update(&mut b, c1, RoomId::new("page-1"), json!(i)))
            .collect();
        assert_eq!(sync.stats().in_flight(), 5);

        for h in handles {
            h.abort();
            let _ = h.await;
        }
        assert_eq!(sync.stats().in_flight(), 0);
        assert_eq!(sync.stats().attempts(), 5);
    }

    #[tokio::test]
    async fn test_deleted_page_is_a_counted_failure() {
        let (store, sync, mut b) = setup().await;
        let (c1, _rx1) = attach(&mut b, "u1");
        store.delete_page(&RoomId::new("page-1")).await;
        sync.content_update(&mut b, c1, RoomId::new("page-1"), json!(1))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(sync.stats().failures(), 1);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_ignored() {
        let (store, sync, mut b) = setup().await;
        assert!(sync
            .content_update(&mut b, ConnectionId::new(), RoomId::new("page-1"), json!(1))
            .is_none());
        assert_eq!(sync.stats().attempts(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_every_update_is_one_attempt() {
        let (store, sync, mut b) = setup().await;
        let (c1, _rx1) = attach(&mut b, "u1");
        let mut handles = Vec::new();
        for i in 0..20 {
            handles.extend(sync.content_update(&mut b, c1, RoomId::new("page-1"), json!(i)));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(sync.stats().attempts(), 20);
        assert_eq!(store.write_count(), 20);
    }
}
