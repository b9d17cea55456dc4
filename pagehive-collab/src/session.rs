//! Per-connection lifecycle.
//!
//! ```text
//! Authenticating ──activate──► Active ──terminate──► Terminated
//!        │                                               ▲
//!        └──────────────── reject ───────────────────────┘
//! ```
//!
//! Only an `Active` session forwards events to the hub. Termination sends one
//! `Disconnect` to the hub, however many times it is requested, and also runs
//! from `Drop` so a task that panics or is aborted still cleans up.

use tokio::sync::mpsc;

use crate::hub::HubHandle;
use crate::protocol::{ClientEvent, ConnectionId, Frame, Identity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Authenticating,
    Active { identity: Identity },
    Terminated,
}

pub struct Session {
    connection: ConnectionId,
    state: SessionState,
    hub: HubHandle,
}

impl Session {
    pub fn new(hub: HubHandle) -> Self {
        Self {
            connection: ConnectionId::new(),
            state: SessionState::Authenticating,
            hub,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            SessionState::Active { identity } => Some(identity),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active { .. })
    }

    /// Bind `identity` to this connection and register it with the hub.
    ///
    /// Only valid from `Authenticating`. Returns `false` (and terminates the
    /// session) if the hub has stopped.
    pub fn activate(&mut self, identity: Identity, outbound: mpsc::Sender<Frame>) -> bool {
        if self.state != SessionState::Authenticating {
            log::warn!("{} cannot activate from {:?}", self.connection, self.state);
            return false;
        }
        if self.hub.register(self.connection, identity.clone(), outbound).is_err() {
            log::error!("Hub unavailable, dropping {}", self.connection);
            self.state = SessionState::Terminated;
            return false;
        }
        self.state = SessionState::Active { identity };
        true
    }

    /// Authentication failed; no hub state was ever created.
    pub fn reject(&mut self) {
        if self.state == SessionState::Authenticating {
            self.state = SessionState::Terminated;
        }
    }

    /// Forward one event to the hub. Returns `false` if it was not forwarded.
    pub fn handle_event(&mut self, event: ClientEvent) -> bool {
        if !self.is_active() {
            log::warn!(
                "Ignoring {} on {}: session is {:?}",
                event.name(),
                self.connection,
                self.state
            );
            return false;
        }
        log::trace!("{} -> {} {}", self.connection, event.name(), event.room());
        self.hub.dispatch(self.connection, event).is_ok()
    }

    /// Tear the session down. Returns `true` only on the call that actually
    /// transitioned it.
    pub fn terminate(&mut self) -> bool {
        match std::mem::replace(&mut self.state, SessionState::Terminated) {
            SessionState::Active { identity } => {
                log::debug!("Terminating {} ({})", self.connection, identity.id);
                if self.hub.disconnect(self.connection).is_err() {
                    log::debug!("Hub already stopped while terminating {}", self.connection);
                }
                true
            }
            SessionState::Authenticating => true,
            SessionState::Terminated => false,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.terminate() {
            log::debug!("{} terminated on drop", self.connection);
        }
    }
}
