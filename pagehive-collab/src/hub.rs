//! The hub: single owner of presence and fan-out state.
//!
//! ```text
//! conn task A ──┐                         ┌──► outbound A
//! conn task B ──┼── HubCommand (mpsc) ──► Hub ──► outbound B
//! conn task C ──┘     (unbounded)         │└──► outbound C
//!                                         └──► tokio::spawn(persist)
//! ```
//!
//! Every registry mutation and every fan-out happens inside [`Hub::handle`],
//! one command at a time, so no two connections' handlers ever interleave.
//! The hub never awaits I/O: delivery is `try_send` into bounded queues and
//! persistence is detached.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::broadcast::{JoinOutcome, RoomBroadcaster};
use crate::notify::Notification;
use crate::presence::Membership;
use crate::protocol::{ClientEvent, ConnectionId, Frame, Identity, IdentityId, RoomId, ServerEvent};
use crate::storage::PageStore;
use crate::sync::ContentSync;

/// Returned when the hub task is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("hub task has stopped")]
pub struct HubClosed;

/// Hub counters, read through [`HubHandle::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub active_connections: usize,
    pub active_rooms: usize,
    pub messages_routed: u64,
    pub messages_dropped: u64,
    pub persist_attempts: u64,
    pub persist_failures: u64,
    /// Detached writes not yet finished
    pub persist_in_flight: u64,
}

pub enum HubCommand {
    /// Attach an authenticated connection and its outbound queue.
    Register {
        connection: ConnectionId,
        identity: Identity,
        outbound: mpsc::Sender<Frame>,
    },
    Event {
        connection: ConnectionId,
        event: ClientEvent,
    },
    Disconnect {
        connection: ConnectionId,
    },
    Notify {
        identity: IdentityId,
        notification: Notification,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<(RoomId, Vec<Membership>)>>,
    },
}

struct Hub {
    broadcaster: RoomBroadcaster,
    sync: ContentSync,
}

impl Hub {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<HubCommand>) {
        log::debug!("Hub started");
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
        log::debug!("Hub stopped: all handles dropped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { connection, identity, outbound } => {
                log::debug!("Registered {connection} as {}", identity.id);
                self.broadcaster.attach(connection, identity, outbound);
            }
            HubCommand::Event { connection, event } => self.dispatch(connection, event),
            HubCommand::Disconnect { connection } => {
                let rooms = self.broadcaster.depart(connection);
                if !rooms.is_empty() {
                    log::debug!("{connection} removed from {} room(s)", rooms.len());
                }
            }
            HubCommand::Notify { identity, notification } => {
                let delivered = self
                    .broadcaster
                    .send_to_identity(&identity, &ServerEvent::NotificationNew(notification));
                log::debug!("Notification for {identity} delivered to {delivered} connection(s)");
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(self.broadcaster.registry().snapshot());
            }
        }
    }

    fn dispatch(&mut self, connection: ConnectionId, event: ClientEvent) {
        if self.broadcaster.identity_of(connection).is_none() {
            log::warn!("Ignoring {} from unregistered connection {connection}", event.name());
            return;
        }
        match event {
            ClientEvent::JoinRoom { room } => match self.broadcaster.join_room(connection, &room) {
                JoinOutcome::AlreadyMember => {
                    log::debug!("{connection} is already in room {room}");
                }
                JoinOutcome::Joined { .. }
                | JoinOutcome::RoomFull
                | JoinOutcome::UnknownConnection => {}
            },
            ClientEvent::LeaveRoom { room } => {
                if !self.broadcaster.leave_room(connection, &room) {
                    log::debug!("{connection} left room {room} without being a member");
                }
            }
            ClientEvent::CursorUpdate { room, position } => {
                self.broadcaster.cursor_update(connection, &room, position);
            }
            ClientEvent::ContentUpdate { room, content } => {
                self.sync.content_update(&mut self.broadcaster, connection, room, content);
            }
        }
    }

    fn stats(&self) -> HubStats {
        let fanout = self.broadcaster.stats();
        let persist = self.sync.stats();
        HubStats {
            active_connections: self.broadcaster.fanout().connection_count(),
            active_rooms: self.broadcaster.registry().room_count(),
            messages_routed: fanout.messages_routed,
            messages_dropped: fanout.messages_dropped,
            persist_attempts: persist.attempts(),
            persist_failures: persist.failures(),
            persist_in_flight: persist.in_flight(),
        }
    }
}

/// Cloneable handle to the hub task. The task exits once every handle is
/// dropped.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Spawn the hub on the current Tokio runtime.
    pub fn spawn(pages: Arc<dyn PageStore>, max_members_per_room: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Hub {
            broadcaster: RoomBroadcaster::new(max_members_per_room),
            sync: ContentSync::new(pages),
        };
        tokio::spawn(hub.run(rx));
        Self { commands: tx }
    }

    fn send(&self, command: HubCommand) -> Result<(), HubClosed> {
        self.commands.send(command).map_err(|_| HubClosed)
    }

    pub fn register(
        &self,
        connection: ConnectionId,
        identity: Identity,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<(), HubClosed> {
        self.send(HubCommand::Register { connection, identity, outbound })
    }

    pub fn dispatch(&self, connection: ConnectionId, event: ClientEvent) -> Result<(), HubClosed> {
        self.send(HubCommand::Event { connection, event })
    }

    /// Never blocks; safe to call from `Drop`.
    pub fn disconnect(&self, connection: ConnectionId) -> Result<(), HubClosed> {
        self.send(HubCommand::Disconnect { connection })
    }

    /// Push `notification:new` to every live connection of `identity`.
    pub fn notify_user(
        &self,
        identity: IdentityId,
        notification: Notification,
    ) -> Result<(), HubClosed> {
        self.send(HubCommand::Notify { identity, notification })
    }

    /// Resolves after every command sent before it has been handled.
    pub async fn stats(&self) -> Result<HubStats, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply })?;
        rx.await.map_err(|_| HubClosed)
    }

    /// Current room memberships, sorted by room.
    pub async fn snapshot(&self) -> Result<Vec<(RoomId, Vec<Membership>)>, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Snapshot { reply })?;
        rx.await.map_err(|_| HubClosed)
    }
}
