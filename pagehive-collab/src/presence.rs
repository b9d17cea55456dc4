//! Presence registry: which connections are in which page room.
//!
//! ```text
//! room ──► [ (identity, connection), (identity, connection), … ]
//! ```
//!
//! Pure in-memory bookkeeping owned by the hub task. Rooms exist implicitly:
//! an entry is created by the first join and deleted (not emptied) when the
//! last member leaves. Nothing here is persisted; presence is rebuilt from
//! scratch after a restart.
//!
//! Membership is keyed by connection, not identity. The same user may appear
//! several times in a room under different connections.

use std::collections::HashMap;

use crate::protocol::{ConnectionId, IdentityId, RoomId};

/// One (identity, connection) pair registered in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub identity: IdentityId,
    pub connection: ConnectionId,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    rooms: HashMap<RoomId, Vec<Membership>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` in `room`. Returns `false` if the exact pair was
    /// already present (retry-safe no-op).
    pub fn add_member(
        &mut self,
        room: &RoomId,
        identity: &IdentityId,
        connection: ConnectionId,
    ) -> bool {
        let members = self.rooms.entry(room.clone()).or_default();
        if members
            .iter()
            .any(|m| m.connection == connection && &m.identity == identity)
        {
            return false;
        }
        members.push(Membership {
            identity: identity.clone(),
            connection,
        });
        true
    }

    /// Remove `connection` from `room`, deleting the room entry once empty.
    ///
    /// Returns the identity the removed record was attributed to, or `None`
    /// if the connection was not a member.
    pub fn remove_member(&mut self, room: &RoomId, connection: ConnectionId) -> Option<IdentityId> {
        let members = self.rooms.get_mut(room)?;
        let idx = members.iter().position(|m| m.connection == connection)?;
        let removed = members.remove(idx);
        members.retain(|m| m.connection != connection);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        Some(removed.identity)
    }

    /// Remove `connection` from every room it joined.
    ///
    /// Returns one `(room, identity)` pair per affected room, sorted by room.
    pub fn remove_connection_everywhere(
        &mut self,
        connection: ConnectionId,
    ) -> Vec<(RoomId, IdentityId)> {
        let mut joined = self.rooms_of(connection);
        joined.sort();
        joined
            .into_iter()
            .filter_map(|room| {
                self.remove_member(&room, connection)
                    .map(|identity| (room, identity))
            })
            .collect()
    }

    /// Members of `room` in join order (empty if the room does not exist).
    pub fn members(&self, room: &RoomId) -> &[Membership] {
        self.rooms.get(room).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Connections in `room` other than `exclude`.
    pub fn others(&self, room: &RoomId, exclude: ConnectionId) -> Vec<ConnectionId> {
        self.members(room)
            .iter()
            .map(|m| m.connection)
            .filter(|c| *c != exclude)
            .collect()
    }

    pub fn is_member(&self, room: &RoomId, connection: ConnectionId) -> bool {
        self.members(room).iter().any(|m| m.connection == connection)
    }

    /// Rooms `connection` currently belongs to.
    pub fn rooms_of(&self, connection: ConnectionId) -> Vec<RoomId> {
        self.rooms
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m.connection == connection))
            .map(|(room, _)| room.clone())
            .collect()
    }

    pub fn contains_room(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self, room: &RoomId) -> usize {
        self.members(room).len()
    }

    /// Copy of the whole registry, ordered by room.
    pub fn snapshot(&self) -> Vec<(RoomId, Vec<Membership>)> {
        let mut rooms: Vec<_> = self
            .rooms
            .iter()
            .map(|(room, members)| (room.clone(), members.clone()))
            .collect();
        rooms.sort_by(|a, b| a.0.cmp(&b.0));
        rooms
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
