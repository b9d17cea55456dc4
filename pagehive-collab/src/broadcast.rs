//! Room fan-out: deliver an event to every member of a room except the sender.
//!
//! Each live connection owns a bounded outbound queue. Delivery is always
//! non-blocking (`try_send`) so one slow reader can never stall the hub:
//! a full queue drops the frame for that recipient only.
//!
//! ```text
//!                        ┌──► conn B outbound ──► socket B
//! event from A ── room ──┼──► conn C outbound ──► socket C
//!                        └──x conn A (sender, skipped)
//! ```

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::presence::PresenceRegistry;
use crate::protocol::{ConnectionId, Frame, Identity, IdentityId, RoomId, ServerEvent};

/// How a frame should be treated when a recipient's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Presence and content events; a drop is logged as a warning.
    Reliable,
    /// Cursor traffic; drops are expected under backpressure.
    Lossy,
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_routed: u64,
    pub messages_dropped: u64,
}

struct Peer {
    identity: Identity,
    outbound: mpsc::Sender<Frame>,
}

/// Outbound table: connection → (identity, queue).
#[derive(Default)]
pub struct Fanout {
    peers: HashMap<ConnectionId, Peer>,
    stats: BroadcastStats,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection's outbound queue. Replaces any previous one.
    pub fn register(
        &mut self,
        connection: ConnectionId,
        identity: Identity,
        outbound: mpsc::Sender<Frame>,
    ) {
        self.peers.insert(connection, Peer { identity, outbound });
    }

    /// Detach a connection. Dropping the sender closes its outbound queue.
    pub fn unregister(&mut self, connection: ConnectionId) -> Option<Identity> {
        self.peers.remove(&connection).map(|p| p.identity)
    }

    pub fn identity_of(&self, connection: ConnectionId) -> Option<&Identity> {
        self.peers.get(&connection).map(|p| &p.identity)
    }

    /// All live connections authenticated as `identity`.
    pub fn connections_of(&self, identity: &IdentityId) -> Vec<ConnectionId> {
        self.peers
            .iter()
            .filter(|(_, p)| &p.identity.id == identity)
            .map(|(c, _)| *c)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// Queue `frame` for one connection. Returns `true` if it was queued.
    pub fn send_to(&mut self, connection: ConnectionId, frame: &Frame, delivery: Delivery) -> bool {
        let Some(peer) = self.peers.get(&connection) else {
            return false;
        };
        match peer.outbound.try_send(frame.clone()) {
            Ok(()) => {
                self.stats.messages_routed += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped += 1;
                match delivery {
                    Delivery::Lossy => {
                        log::trace!("Dropped cursor frame for {connection}: queue full")
                    }
                    Delivery::Reliable => {
                        log::warn!("Dropped frame for {connection}: outbound queue full")
                    }
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Connection task already gone; its Disconnect is on the way.
                log::debug!("Outbound queue for {connection} closed");
                false
            }
        }
    }

    /// Queue `frame` for every connection in `recipients`. Returns how many
    /// recipients accepted it.
    pub fn fan_out(
        &mut self,
        recipients: &[ConnectionId],
        frame: &Frame,
        delivery: Delivery,
    ) -> usize {
        recipients
            .iter()
            .filter(|c| self.send_to(**c, frame, delivery))
            .count()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }
}

/// Result of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// New membership; `notified` other members were told.
    Joined { notified: usize },
    /// Pair already registered; nothing happened.
    AlreadyMember,
    /// Room is at `max_members_per_room`.
    RoomFull,
    /// Connection is not registered with the hub.
    UnknownConnection,
}

/// Turns room events into registry updates plus fan-out.
pub struct RoomBroadcaster {
    registry: PresenceRegistry,
    fanout: Fanout,
    /// 0 = unlimited
    max_members_per_room: usize,
}

impl RoomBroadcaster {
    pub fn new(max_members_per_room: usize) -> Self {
        Self {
            registry: PresenceRegistry::new(),
            fanout: Fanout::new(),
            max_members_per_room,
        }
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub fn attach(
        &mut self,
        connection: ConnectionId,
        identity: Identity,
        outbound: mpsc::Sender<Frame>,
    ) {
        self.fanout.register(connection, identity, outbound);
    }

    pub fn identity_of(&self, connection: ConnectionId) -> Option<&Identity> {
        self.fanout.identity_of(connection)
    }

    /// Register membership, then tell every other member who joined.
    pub fn join_room(&mut self, connection: ConnectionId, room: &RoomId) -> JoinOutcome {
        let Some(identity) = self.fanout.identity_of(connection).map(|i| i.id.clone()) else {
            return JoinOutcome::UnknownConnection;
        };
        if self.registry.is_member(room, connection) {
            return JoinOutcome::AlreadyMember;
        }
        if self.max_members_per_room > 0
            && self.registry.member_count(room) >= self.max_members_per_room
        {
            log::warn!("Room {room} is full, {identity} ({connection}) not admitted");
            return JoinOutcome::RoomFull;
        }
        if !self.registry.add_member(room, &identity, connection) {
            return JoinOutcome::AlreadyMember;
        }
        log::info!("{identity} ({connection}) joined room {room}");

        let notified = self.emit(
            room,
            connection,
            &ServerEvent::UserJoined { user_id: identity },
            Delivery::Reliable,
        );
        JoinOutcome::Joined { notified }
    }

    /// Remove membership, then tell the remaining members. Returns `false`
    /// if the connection was not in the room.
    pub fn leave_room(&mut self, connection: ConnectionId, room: &RoomId) -> bool {
        let Some(identity) = self.registry.remove_member(room, connection) else {
            return false;
        };
        log::info!("{identity} ({connection}) left room {room}");
        let event = ServerEvent::UserLeft { user_id: identity };
        self.emit(room, connection, &event, Delivery::Reliable);
        true
    }

    /// Fan out a cursor position. Not persisted; may be dropped per recipient.
    pub fn cursor_update(
        &mut self,
        connection: ConnectionId,
        room: &RoomId,
        position: Value,
    ) -> usize {
        let Some(identity) = self.fanout.identity_of(connection).map(|i| i.id.clone()) else {
            return 0;
        };
        log::trace!("Cursor update from {identity} in room {room}");
        self.emit(
            room,
            connection,
            &ServerEvent::CursorUpdate { user_id: identity, position },
            Delivery::Lossy,
        )
    }

    /// Fan out new page content to the other members of `room`.
    pub fn content_update(
        &mut self,
        connection: ConnectionId,
        room: &RoomId,
        content: Value,
    ) -> usize {
        let Some(identity) = self.fanout.identity_of(connection).map(|i| i.id.clone()) else {
            return 0;
        };
        self.emit(
            room,
            connection,
            &ServerEvent::ContentUpdate { user_id: identity, content },
            Delivery::Reliable,
        )
    }

    /// Remove a connection from every room and detach its queue.
    ///
    /// Emits one `user-left` per affected room to that room's remaining
    /// members. Returns the rooms the connection was removed from; calling it
    /// again for the same connection is a no-op.
    pub fn depart(&mut self, connection: ConnectionId) -> Vec<RoomId> {
        let removed = self.registry.remove_connection_everywhere(connection);
        let mut rooms = Vec::with_capacity(removed.len());
        for (room, identity) in removed {
            log::info!("{identity} ({connection}) left room {room} on disconnect");
            let event = ServerEvent::UserLeft { user_id: identity };
            self.emit(&room, connection, &event, Delivery::Reliable);
            rooms.push(room);
        }
        self.fanout.unregister(connection);
        rooms
    }

    /// Deliver an event to every live connection of one user.
    pub fn send_to_identity(&mut self, identity: &IdentityId, event: &ServerEvent) -> usize {
        let recipients = self.fanout.connections_of(identity);
        if recipients.is_empty() {
            return 0;
        }
        match event.to_frame() {
            Ok(frame) => self.fanout.fan_out(&recipients, &frame, Delivery::Reliable),
            Err(e) => {
                log::error!("Failed to encode event for {identity}: {e}");
                0
            }
        }
    }

    /// Encode once and queue for every member of `room` except `sender`.
    fn emit(
        &mut self,
        room: &RoomId,
        sender: ConnectionId,
        event: &ServerEvent,
        delivery: Delivery,
    ) -> usize {
        let recipients = self.registry.others(room, sender);
        if recipients.is_empty() {
            return 0;
        }
        match event.to_frame() {
            Ok(frame) => self.fanout.fan_out(&recipients, &frame, delivery),
            Err(e) => {
                log::error!("Failed to encode event for room {room}: {e}");
                0
            }
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        self.fanout.stats()
    }
}
