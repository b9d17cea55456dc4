//! Shared harness for the end-to-end tests: a real server on an ephemeral
//! port and real WebSocket clients.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pagehive_collab::{
    ClientEvent, CollabServer, Identity, IdentityId, MemoryStore, RoomId, ServerConfig, ServerEvent,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SECRET: &str = "integration-secret-integration-secret";

pub struct TestServer {
    pub server: CollabServer,
    pub store: Arc<MemoryStore>,
    pub url: String,
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        jwt_secret: SECRET.into(),
        outbound_capacity: 64,
        max_members_per_room: 10,
        auth_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

/// Users `u1`..`u3` and pages `page-1`, `page-2`.
pub async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (id, name) in [("u1", "Ada"), ("u2", "Bob"), ("u3", "Cy")] {
        store.insert_user(Identity::new(id, name)).await;
    }
    store.create_page(RoomId::new("page-1")).await;
    store.create_page(RoomId::new("page-2")).await;
    store
}

pub async fn start_test_server() -> TestServer {
    start_with_config(test_config()).await
}

pub async fn start_with_config(config: ServerConfig) -> TestServer {
    let store = seeded_store().await;
    let server = CollabServer::with_store(config, store.clone());
    let url = serve(&server).await;
    TestServer { server, store, url }
}

/// Serve `server` on an ephemeral port; returns the base `ws://` URL.
pub async fn serve(server: &CollabServer) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = server.clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    url
}

impl TestServer {
    pub fn token(&self, user: &str) -> String {
        self.server
            .verifier()
            .issue(&IdentityId::new(user), Duration::from_secs(300))
            .unwrap()
    }

    pub async fn connect(&self, user: &str) -> Client {
        let url = format!("{}/?token={}", self.url, self.token(user));
        let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    /// Wait until `room` has exactly `count` members.
    pub async fn wait_for_members(&self, room: &str, count: usize) {
        let room = RoomId::new(room);
        for _ in 0..200 {
            let snapshot = self.server.hub().snapshot().await.unwrap();
            let members = snapshot
                .iter()
                .find(|(r, _)| *r == room)
                .map_or(0, |(_, m)| m.len());
            if members == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {room} never reached {count} member(s)");
    }

    pub async fn wait_for_content(&self, room: &str, expected: &serde_json::Value) {
        let room = RoomId::new(room);
        for _ in 0..200 {
            if self.store.load_content(&room).await.as_ref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("content of {room} never became {expected}");
    }
}

pub async fn send(client: &mut Client, event: &ClientEvent) {
    send_raw(client, &event.encode().unwrap()).await;
}

pub async fn send_raw(client: &mut Client, text: &str) {
    client.send(Message::text(text.to_string())).await.unwrap();
}

pub async fn join(client: &mut Client, room: &str) {
    send(client, &ClientEvent::JoinRoom { room: RoomId::new(room) }).await;
}

/// Next server event, skipping control frames.
pub async fn recv(client: &mut Client) -> ServerEvent {
    loop {
        let msg = timeout(Duration::from_secs(3), client.next())
            .await
            .expect("timed out waiting for an event")
            .expect("connection ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return ServerEvent::decode(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert no event arrives within a short window.
pub async fn assert_silent(client: &mut Client) {
    match timeout(Duration::from_millis(200), client.next()).await {
        Err(_) => {}
        Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected event: {text}"),
        Ok(other) => panic!("unexpected frame: {other:?}"),
    }
}

pub fn uid(id: &str) -> IdentityId {
    IdentityId::new(id)
}
