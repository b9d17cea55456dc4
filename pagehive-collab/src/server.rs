//! WebSocket front end for the realtime core.
//!
//! Architecture:
//! ```text
//! TCP accept ──► upgrade (?token= / Bearer) ──► Authenticator ──┐
//!                                                               │
//!           ┌──── rejected: connect-error + Close(44xx) ◄───────┤
//!           │                                                   ▼
//!           │                               Session::activate ──► Hub
//!           ▼                                      │
//!        dropped                     select! { socket in ─► Session::handle_event
//!                                              outbound   ─► socket out
//!                                              shutdown   ─► Close(1001) }
//!                                                  │
//!                                          Session::terminate ─► Hub (leave-all)
//! ```
//!
//! Each connection runs in its own task and owns only its socket, its
//! outbound queue receiver, and its [`Session`]. All shared state lives in the
//! hub.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use crate::auth::{credential_from_request, AuthError, Authenticator, JwtVerifier};
use crate::config::{ConfigError, ServerConfig};
use crate::hub::{HubClosed, HubHandle, HubStats};
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};
use crate::session::Session;
use crate::storage::{IdentityStore, PageStore, SeedError, StoreError};

/// Grace period for the client to acknowledge a rejection Close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Seed(#[from] SeedError),
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error(transparent)]
    Hub(#[from] HubClosed),
}

/// Server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Accepted TCP connections, rejected ones included
    pub total_connections: u64,
    /// Connections refused during the handshake
    pub rejected_connections: u64,
    pub hub: HubStats,
}

struct Shared {
    config: ServerConfig,
    authenticator: Authenticator,
    hub: HubHandle,
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
}

/// The realtime collaboration server. Cheap to clone; clones share one hub.
#[derive(Clone)]
pub struct CollabServer {
    shared: Arc<Shared>,
}

impl CollabServer {
    /// Create a server and spawn its hub. Must be called within a Tokio
    /// runtime.
    pub fn new(
        config: ServerConfig,
        identities: Arc<dyn IdentityStore>,
        pages: Arc<dyn PageStore>,
    ) -> Self {
        let verifier = JwtVerifier::new(config.jwt_secret.as_bytes());
        let hub = HubHandle::spawn(pages, config.max_members_per_room);
        Self {
            shared: Arc::new(Shared {
                authenticator: Authenticator::new(verifier, identities),
                hub,
                config,
                total_connections: AtomicU64::new(0),
                rejected_connections: AtomicU64::new(0),
            }),
        }
    }

    /// Create a server backed by one store for identities and pages.
    pub fn with_store<S>(config: ServerConfig, store: Arc<S>) -> Self
    where
        S: IdentityStore + PageStore + 'static,
    {
        Self::new(config, store.clone(), store)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn hub(&self) -> &HubHandle {
        &self.shared.hub
    }

    pub fn verifier(&self) -> &JwtVerifier {
        self.shared.authenticator.verifier()
    }

    pub async fn stats(&self) -> Result<ServerStats, ServerError> {
        Ok(ServerStats {
            total_connections: self.shared.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.shared.rejected_connections.load(Ordering::Relaxed),
            hub: self.shared.hub.stats().await?,
        })
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.run_until(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then ask every live connection to
    /// close. Returns without waiting for connection tasks to finish.
    pub async fn run_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, closing connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let server = self.clone();
                    let stop = stop_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr, stop).await {
                            log::warn!("Connection from {addr} ended with error: {e}");
                        }
                    });
                }
            }
        }

        let _ = stop_tx.send(true);
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        self.shared.total_connections.fetch_add(1, Ordering::Relaxed);
        let mut session = Session::new(self.shared.hub.clone());
        let timeout = self.shared.config.auth_timeout;

        let handshake = async {
            let mut credential = None;
            let ws = tokio_tungstenite::accept_hdr_async(
                stream,
                |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    credential = credential_from_request(request);
                    Ok(response)
                },
            )
            .await?;
            let verdict = self.shared.authenticator.authenticate(credential.as_deref()).await;
            Ok::<_, ServerError>((ws, verdict))
        };

        let (mut ws, verdict) = match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                session.reject();
                self.shared.rejected_connections.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
            Err(_) => {
                session.reject();
                self.shared.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::warn!("Handshake from {addr} timed out after {timeout:?}");
                return Err(ServerError::HandshakeTimeout(timeout));
            }
        };

        let identity = match verdict {
            Ok(identity) => identity,
            Err(e) => {
                session.reject();
                self.shared.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::info!("Rejected connection from {addr}: {e}");
                return reject(&mut ws, &e).await;
            }
        };

        let capacity = self.shared.config.outbound_capacity.max(1);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(capacity);
        if !session.activate(identity.clone(), outbound_tx) {
            return Err(ServerError::Hub(HubClosed));
        }
        let connection = session.connection();
        log::info!("{} ({connection}) connected from {addr}", identity.id);

        let (mut sink, mut incoming) = ws.split();
        let result: Result<(), ServerError> = loop {
            tokio::select! {
                msg = incoming.next() => match msg {
                    Some(Ok(Message::Text(text))) => match ClientEvent::decode(text.as_str()) {
                        Ok(event) => {
                            session.handle_event(event);
                        }
                        Err(e) => log::warn!("Ignoring malformed frame from {connection}: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Ignoring {}-byte binary frame from {connection}", data.len());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {connection} closed by peer");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                },

                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            break Err(e.into());
                        }
                    }
                    None => break Ok(()),
                },

                _ = stop.changed() => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Away,
                            reason: Utf8Bytes::from_static("server shutting down"),
                        })))
                        .await;
                    break Ok(());
                }
            }
        };

        session.terminate();
        log::info!("{} ({connection}) disconnected", identity.id);
        result
    }
}

/// Send the rejection reason, then close with the matching code.
async fn reject(ws: &mut WebSocketStream<TcpStream>, error: &AuthError) -> Result<(), ServerError> {
    let frame = ServerEvent::ConnectError {
        reason: error.reason().to_string(),
        message: error.to_string(),
    }
    .to_frame()?;
    ws.send(Message::Text(frame)).await?;
    ws.close(Some(CloseFrame {
        code: CloseCode::from(error.close_code()),
        reason: Utf8Bytes::from_static(error.reason()),
    }))
    .await?;
    // Let the client's Close reply arrive so the socket shuts down cleanly.
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    Ok(())
}
