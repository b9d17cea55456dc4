//! End-to-end room behavior over real WebSocket connections.

mod common;

use std::time::Duration;

use common::*;
use futures_util::{SinkExt, StreamExt};
use pagehive_collab::{ClientEvent, Notification, RoomId, ServerEvent};
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

fn content(room: &str, value: serde_json::Value) -> ClientEvent {
    ClientEvent::ContentUpdate { room: RoomId::new(room), content: value }
}

fn cursor(room: &str, position: i64) -> ClientEvent {
    ClientEvent::CursorUpdate { room: RoomId::new(room), position: json!(position) }
}

// ─── Scenarios ───────────────────────────────────────────────────

#[tokio::test]
async fn test_content_update_fans_out_and_persists() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u1, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut u2, "page-1").await;
    assert_eq!(recv(&mut u1).await, ServerEvent::UserJoined { user_id: uid("u2") });

    send(&mut u1, &content("page-1", json!({"x": 1}))).await;
    assert_eq!(
        recv(&mut u2).await,
        ServerEvent::ContentUpdate { user_id: uid("u1"), content: json!({"x": 1}) }
    );
    ts.wait_for_content("page-1", &json!({"x": 1})).await;
    assert_silent(&mut u1).await;
}

#[tokio::test]
async fn test_joiner_is_not_told_about_itself() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u1, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut u2, "page-1").await;

    assert_eq!(recv(&mut u1).await, ServerEvent::UserJoined { user_id: uid("u2") });
    assert_silent(&mut u2).await;
}

#[tokio::test]
async fn test_disconnect_leaves_every_room_once() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    let mut u3 = ts.connect("u3").await;
    join(&mut u3, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut u1, "page-1").await;
    join(&mut u1, "page-2").await;
    ts.wait_for_members("page-2", 1).await;
    assert_eq!(recv(&mut u3).await, ServerEvent::UserJoined { user_id: uid("u1") });

    // Abrupt drop, no Close handshake.
    drop(u1);

    assert_eq!(recv(&mut u3).await, ServerEvent::UserLeft { user_id: uid("u1") });
    assert_silent(&mut u3).await;
    ts.wait_for_members("page-1", 1).await;
    ts.wait_for_members("page-2", 0).await;

    let snapshot = ts.server.hub().snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].1[0].identity, uid("u3"));
}

#[tokio::test]
async fn test_explicit_leave_matches_disconnect() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u2, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut u1, "page-1").await;
    let _ = recv(&mut u2).await;

    send(&mut u1, &ClientEvent::LeaveRoom { room: RoomId::new("page-1") }).await;
    assert_eq!(recv(&mut u2).await, ServerEvent::UserLeft { user_id: uid("u1") });

    // Leaving again is a no-op, and a later disconnect owes nobody a user-left.
    send(&mut u1, &ClientEvent::LeaveRoom { room: RoomId::new("page-1") }).await;
    u1.close(None).await.unwrap();
    assert_silent(&mut u2).await;
    ts.wait_for_members("page-1", 1).await;
}

// ─── Properties ──────────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_join_is_silent() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u1, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut u2, "page-1").await;
    join(&mut u2, "page-1").await;

    assert_eq!(recv(&mut u1).await, ServerEvent::UserJoined { user_id: uid("u2") });
    assert_silent(&mut u1).await;
    ts.wait_for_members("page-1", 2).await;
}

#[tokio::test]
async fn test_sender_never_receives_own_events() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u1, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut u2, "page-1").await;
    let _ = recv(&mut u1).await;

    send(&mut u1, &cursor("page-1", 7)).await;
    send(&mut u1, &content("page-1", json!("hello"))).await;

    assert_eq!(
        recv(&mut u2).await,
        ServerEvent::CursorUpdate { user_id: uid("u1"), position: json!(7) }
    );
    assert!(matches!(recv(&mut u2).await, ServerEvent::ContentUpdate { .. }));
    assert_silent(&mut u1).await;
}

#[tokio::test]
async fn test_broadcast_survives_failed_persistence() {
    let ts = start_test_server().await;
    ts.store.fail_writes(true);
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u1, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut u2, "page-1").await;
    let _ = recv(&mut u1).await;

    send(&mut u1, &content("page-1", json!({"draft": true}))).await;
    assert_eq!(
        recv(&mut u2).await,
        ServerEvent::ContentUpdate { user_id: uid("u1"), content: json!({"draft": true}) }
    );
    // The editor hears nothing about the failed write.
    assert_silent(&mut u1).await;

    let stats = ts.server.stats().await.unwrap();
    assert_eq!(stats.hub.persist_attempts, 1);
    assert_eq!(stats.hub.persist_failures, 1);
}

#[tokio::test]
async fn test_broadcast_not_delayed_by_slow_persistence() {
    let ts = start_test_server().await;
    ts.store.set_write_delay(Duration::from_secs(30));
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u1, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut u2, "page-1").await;
    let _ = recv(&mut u1).await;

    send(&mut u1, &content("page-1", json!(1))).await;
    send(&mut u1, &content("page-1", json!(2))).await;
    for expected in [json!(1), json!(2)] {
        assert!(matches!(
            recv(&mut u2).await,
            ServerEvent::ContentUpdate { content, .. } if content == expected
        ));
    }
    assert_eq!(ts.store.write_count(), 0);
    assert_eq!(ts.server.stats().await.unwrap().hub.persist_in_flight, 2);
}

#[tokio::test]
async fn test_events_from_one_connection_stay_ordered() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u2, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut u1, "page-1").await;
    let _ = recv(&mut u2).await;

    for i in 0..20 {
        send(&mut u1, &cursor("page-1", i)).await;
    }
    for i in 0..20 {
        assert_eq!(
            recv(&mut u2).await,
            ServerEvent::CursorUpdate { user_id: uid("u1"), position: json!(i) }
        );
    }
}

// ─── Policies ────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_tabs_are_independent_members() {
    let ts = start_test_server().await;
    let mut tab1 = ts.connect("u1").await;
    let mut tab2 = ts.connect("u1").await;
    join(&mut tab1, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut tab2, "page-1").await;
    assert_eq!(recv(&mut tab1).await, ServerEvent::UserJoined { user_id: uid("u1") });
    ts.wait_for_members("page-1", 2).await;

    send(&mut tab2, &cursor("page-1", 3)).await;
    assert_eq!(
        recv(&mut tab1).await,
        ServerEvent::CursorUpdate { user_id: uid("u1"), position: json!(3) }
    );

    drop(tab2);
    assert_eq!(recv(&mut tab1).await, ServerEvent::UserLeft { user_id: uid("u1") });
    ts.wait_for_members("page-1", 1).await;
}

#[tokio::test]
async fn test_non_member_updates_reach_room() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u2, "page-1").await;
    ts.wait_for_members("page-1", 1).await;

    send(&mut u1, &cursor("page-1", 9)).await;
    assert_eq!(
        recv(&mut u2).await,
        ServerEvent::CursorUpdate { user_id: uid("u1"), position: json!(9) }
    );
    ts.wait_for_members("page-1", 1).await;
}

#[tokio::test]
async fn test_room_cap() {
    let config = pagehive_collab::ServerConfig {
        max_members_per_room: 1,
        ..test_config()
    };
    let ts = start_with_config(config).await;
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u1, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut u2, "page-1").await;

    assert_silent(&mut u1).await;
    ts.wait_for_members("page-1", 1).await;
}

// ─── Wire handling ───────────────────────────────────────────────

#[tokio::test]
async fn test_malformed_frames_do_not_close_connection() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u2, "page-1").await;
    ts.wait_for_members("page-1", 1).await;

    send_raw(&mut u1, "not json").await;
    send_raw(&mut u1, r#"{"event":"delete-everything","data":{}}"#).await;
    send_raw(&mut u1, r#"{"event":"cursor-update","data":{"room":"page-1"}}"#).await;
    u1.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();

    join(&mut u1, "page-1").await;
    assert_eq!(recv(&mut u2).await, ServerEvent::UserJoined { user_id: uid("u1") });
}

#[tokio::test]
async fn test_legacy_event_names() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    send_raw(&mut u2, r#"{"event":"join-page","data":"page-1"}"#).await;
    ts.wait_for_members("page-1", 1).await;
    send_raw(&mut u1, r#"{"event":"join-page","data":"page-1"}"#).await;
    assert_eq!(recv(&mut u2).await, ServerEvent::UserJoined { user_id: uid("u1") });

    send_raw(
        &mut u1,
        r#"{"event":"content-update","data":{"pageId":"page-1","content":{"blocks":[]}}}"#,
    )
    .await;
    assert_eq!(
        recv(&mut u2).await,
        ServerEvent::ContentUpdate { user_id: uid("u1"), content: json!({"blocks": []}) }
    );
    ts.wait_for_content("page-1", &json!({"blocks": []})).await;

    send_raw(&mut u1, r#"{"event":"leave-page","data":"page-1"}"#).await;
    assert_eq!(recv(&mut u2).await, ServerEvent::UserLeft { user_id: uid("u1") });
}

#[tokio::test]
async fn test_wire_shape_uses_user_id() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    let mut u2 = ts.connect("u2").await;
    join(&mut u1, "page-1").await;
    ts.wait_for_members("page-1", 1).await;
    join(&mut u2, "page-1").await;

    let msg = timeout(Duration::from_secs(3), u1.next()).await.unwrap().unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(value, json!({"event": "user-joined", "data": {"userId": "u2"}}));
}

#[tokio::test]
async fn test_ping_gets_pong() {
    let ts = start_test_server().await;
    let mut u1 = ts.connect("u1").await;
    u1.send(Message::Ping(vec![7u8].into())).await.unwrap();

    let pong = timeout(Duration::from_secs(3), async {
        loop {
            match u1.next().await {
                Some(Ok(Message::Pong(data))) => return data,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(&pong[..], &[7u8]);
}

// ─── Notifications & shutdown ────────────────────────────────────

#[tokio::test]
async fn test_notification_reaches_every_tab() {
    let ts = start_test_server().await;
    let mut tab1 = ts.connect("u1").await;
    let mut tab2 = ts.connect("u1").await;
    let mut other = ts.connect("u2").await;

    // Both tabs must be registered before the push.
    for _ in 0..200 {
        if ts.server.stats().await.unwrap().hub.active_connections == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let n = Notification::workspace_invitation(uid("u1"), "ws-1", "Design");
    ts.server.hub().notify_user(uid("u1"), n.clone()).unwrap();

    assert_eq!(recv(&mut tab1).await, ServerEvent::NotificationNew(n.clone()));
    assert_eq!(recv(&mut tab2).await, ServerEvent::NotificationNew(n));
    assert_silent(&mut other).await;
}

#[tokio::test]
async fn test_shutdown_closes_live_connections() {
    let store = seeded_store().await;
    let server = pagehive_collab::CollabServer::with_store(test_config(), store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let runner = server.clone();
    let handle = tokio::spawn(async move {
        runner
            .run_until(listener, async {
                let _ = stop_rx.await;
            })
            .await
    });

    let token = server
        .verifier()
        .issue(&uid("u1"), Duration::from_secs(60))
        .unwrap();
    let (mut client, _) = tokio_tungstenite::connect_async(format!("{url}/?token={token}"))
        .await
        .unwrap();
    for _ in 0..200 {
        if server.stats().await.unwrap().hub.active_connections == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let msg = timeout(Duration::from_secs(3), client.next()).await.unwrap();
    match msg {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected close frame, got {other:?}"),
    }
}
