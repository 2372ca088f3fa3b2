mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite;

use relay_api::auth::access::{AccessPolicy, MemoryAccessPolicy};
use relay_api::config::Config;
use relay_api::error::ApiError;
use relay_api::gateway::rooms::RoomId;
use relay_api::store::{MemoryStore, SharedStore};

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

async fn expect_rejected(url: &str) -> Value {
    match tokio_tungstenite::connect_async(url).await {
        Err(tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status(), 401);
            let body = resp.body().as_deref().expect("rejection body");
            serde_json::from_slice(body).expect("json body")
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("handshake should have been rejected"),
    }
}

#[tokio::test]
async fn handshake_without_token_is_rejected() {
    let state = common::test_state();
    let addr = common::start_ws_server(state.clone()).await;

    let body = expect_rejected(&format!("ws://{addr}/gateway")).await;
    assert_eq!(body["error"]["code"], "AUTHENTICATION_FAILED");
    assert_eq!(body["error"]["message"], "Authentication failed");

    assert!(state.gateway.registry.is_empty());
    assert_eq!(state.gateway.rooms.room_count(), 0);
}

#[tokio::test]
async fn handshake_with_bad_token_leaves_no_trace() {
    let state = common::test_state();
    let addr = common::start_ws_server(state.clone()).await;

    let forged = relay_api::auth::tokens::mint_access_token(
        "some-other-secret",
        "u1",
        "Mallory",
        relay_api::auth::tokens::Role::User,
        300,
    )
    .unwrap();

    for token in ["garbage", forged.as_str()] {
        let body = expect_rejected(&format!("ws://{addr}/gateway?token={token}")).await;
        assert_eq!(body["error"]["message"], "Authentication failed");
    }

    assert!(state.gateway.registry.is_empty());
    let presence = state.gateway.presence("u1").await.unwrap();
    assert!(!presence.online);
    assert!(presence.last_seen.is_none());
    assert_eq!(state.gateway.limiter.current("u1").await.unwrap(), 0);
}

#[tokio::test]
async fn connected_event_identifies_the_connection() {
    let state = common::test_state();
    let addr = common::start_ws_server(state.clone()).await;

    let (_ws, connected) = common::connect_with_header(addr, &common::user_token("u1", "Ada")).await;
    assert_eq!(connected["userId"], "u1");
    assert!(connected["connectionId"].as_str().unwrap().starts_with("conn_"));

    assert_eq!(state.gateway.registry.count_for("u1"), 1);
    assert!(state.gateway.is_online("u1").await);
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_joiner_is_announced_to_the_first() {
    let state = common::test_state();
    let addr = common::start_ws_server(state).await;

    let (mut ada, _) = common::connect(addr, &common::user_token("u1", "Ada")).await;
    let (mut bob, _) = common::connect(addr, &common::user_token("u2", "Bob")).await;

    common::send_event(&mut ada, "join:document", json!({"documentId": "doc-1"})).await;
    common::next_event(&mut ada, "room:joined").await;

    common::send_event(&mut bob, "join:document", json!({"documentId": "doc-1"})).await;
    common::next_event(&mut bob, "room:joined").await;

    let joined = common::next_event(&mut ada, "user:joined").await;
    assert_eq!(joined["userId"], "u2");
    assert_eq!(joined["name"], "Bob");
    assert_eq!(joined["documentId"], "doc-1");
}

#[tokio::test]
async fn edits_reach_every_other_member() {
    let state = common::test_state();
    let addr = common::start_ws_server(state).await;

    let mut clients = Vec::new();
    for (id, name) in [("u1", "Ada"), ("u2", "Bob"), ("u3", "Cy")] {
        let (mut ws, _) = common::connect(addr, &common::user_token(id, name)).await;
        common::send_event(&mut ws, "join:document", json!({"documentId": "doc-1"})).await;
        common::next_event(&mut ws, "room:joined").await;
        clients.push(ws);
    }

    let changes = json!([{"op": "insert", "pos": 4, "text": "world"}]);
    common::send_event(
        &mut clients[0],
        "document:update",
        json!({"documentId": "doc-1", "changes": changes, "version": 1}),
    )
    .await;

    for ws in clients.iter_mut().skip(1) {
        let update = common::next_event(ws, "document:updated").await;
        assert_eq!(update["documentId"], "doc-1");
        assert_eq!(update["changes"], changes);
        assert_eq!(update["userId"], "u1");
        assert_eq!(update["version"], 1);
    }
}

#[tokio::test]
async fn room_events_do_not_leak_to_other_rooms() {
    let state = common::test_state();
    let addr = common::start_ws_server(state.clone()).await;

    let (mut in_a, _) = common::connect(addr, &common::user_token("u1", "Ada")).await;
    let (mut in_b, _) = common::connect(addr, &common::user_token("u2", "Bob")).await;
    common::send_event(&mut in_a, "join:document", json!({"documentId": "a"})).await;
    common::next_event(&mut in_a, "room:joined").await;
    common::send_event(&mut in_b, "join:document", json!({"documentId": "b"})).await;
    common::next_event(&mut in_b, "room:joined").await;

    let room_a = RoomId::Document("a".into());
    state.gateway.emit_to_room(&room_a, "marker", json!({"room": "a"})).await;
    state.gateway.emit_to_user("u2", "sentinel", Value::Null).await;

    assert_eq!(common::next_event(&mut in_a, "marker").await["room"], "a");
    // The sentinel is sent after the marker; b must see it without the marker.
    let frame = common::next_frame(&mut in_b).await;
    assert_eq!(frame["t"], "sentinel");
}

#[tokio::test]
async fn denied_join_keeps_the_connection_open() {
    let (state, access) =
        common::test_state_with(Config::local(common::TEST_SECRET), MemoryAccessPolicy::new());
    let addr = common::start_ws_server(state).await;
    let (mut ws, _) = common::connect(addr, &common::user_token("u1", "Ada")).await;

    common::send_event(&mut ws, "join:document", json!({"documentId": "locked"})).await;
    let err = common::next_event(&mut ws, "error").await;
    assert_eq!(err["code"], "FORBIDDEN");

    access.grant("u1", RoomId::Document("locked".into()));
    common::send_event(&mut ws, "join:document", json!({"documentId": "locked"})).await;
    let joined = common::next_event(&mut ws, "room:joined").await;
    assert_eq!(joined["room"], "document:locked");
}

/// Allows everything, but holds `document:gated` checks until released.
#[derive(Default)]
struct GatedPolicy {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl AccessPolicy for GatedPolicy {
    async fn has_access(&self, _user_id: &str, room: &RoomId) -> Result<bool, ApiError> {
        if matches!(room, RoomId::Document(id) if id == "gated") {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(true)
    }
}

#[tokio::test]
async fn slow_access_check_does_not_stall_delivery() {
    let config = Config {
        outbound_buffer: 8,
        slow_consumer_limit: 4,
        ..Config::local(common::TEST_SECRET)
    };
    let policy = Arc::new(GatedPolicy::default());
    let state = common::state_with(config, Arc::new(MemoryStore::new()), policy.clone(), false);
    let addr = common::start_ws_server(state.clone()).await;
    let (mut ws, _) = common::connect(addr, &common::user_token("u1", "Ada")).await;

    common::send_event(&mut ws, "join:document", json!({"documentId": "gated"})).await;
    policy.entered.notified().await;

    // Far more than the queue plus the strike allowance, while the join waits.
    for seq in 0..100 {
        state.gateway.emit_to_user("u1", "tick", json!({ "seq": seq })).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    policy.release.notify_one();

    let mut ticks = 0;
    loop {
        let frame = common::next_frame(&mut ws).await;
        match frame["t"].as_str() {
            Some("tick") => ticks += 1,
            Some("room:joined") => break,
            _ => {}
        }
    }
    assert_eq!(ticks, 100);
    assert_eq!(state.gateway.registry.count_for("u1"), 1);
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn event_past_the_ceiling_is_rejected_in_band() {
    let state = common::test_state();
    let addr = common::start_ws_server(state.clone()).await;
    let (mut ws, _) = common::connect(addr, &common::user_token("u1", "Ada")).await;

    for _ in 0..101 {
        common::send_event(&mut ws, "ping", Value::Null).await;
    }
    let err = common::next_event(&mut ws, "error").await;
    assert_eq!(err["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(err["event"], "ping");

    // Still open: server-side pushes keep arriving.
    state.gateway.emit_to_user("u1", "still-here", Value::Null).await;
    common::next_event(&mut ws, "still-here").await;
    assert_eq!(state.gateway.registry.count_for("u1"), 1);
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn presence_survives_until_the_last_connection_closes() {
    let state = common::test_state();
    let addr = common::start_ws_server(state.clone()).await;
    let token = common::user_token("u1", "Ada");

    let (mut tab1, _) = common::connect(addr, &token).await;
    let (mut tab2, _) = common::connect(addr, &token).await;
    assert!(state.gateway.presence("u1").await.unwrap().online);

    tab1.close(None).await.unwrap();
    let gw = state.gateway.clone();
    common::eventually(|| {
        let gw = gw.clone();
        async move { gw.registry.count_for("u1") == 1 }
    })
    .await;
    assert!(state.gateway.presence("u1").await.unwrap().online);

    let before = chrono::Utc::now() - chrono::Duration::seconds(1);
    tab2.close(None).await.unwrap();
    common::eventually(|| {
        let gw = gw.clone();
        async move { !gw.presence("u1").await.unwrap().online }
    })
    .await;

    let presence = state.gateway.presence("u1").await.unwrap();
    assert!(presence.last_seen.unwrap() >= before);
    assert_eq!(state.gateway.registry.count_for("u1"), 0);
    assert_eq!(state.gateway.rooms.room_count(), 0);
}

#[tokio::test]
async fn watchers_see_a_user_go_offline() {
    let state = common::test_state();
    let addr = common::start_ws_server(state).await;

    let (mut ada, _) = common::connect(addr, &common::user_token("u1", "Ada")).await;
    let (mut bob, _) = common::connect(addr, &common::user_token("u2", "Bob")).await;
    for ws in [&mut ada, &mut bob] {
        common::send_event(ws, "join:document", json!({"documentId": "doc-1"})).await;
        common::next_event(ws, "room:joined").await;
    }

    bob.close(None).await.unwrap();

    let left = common::next_event(&mut ada, "user:left").await;
    assert_eq!(left["userId"], "u2");
    assert_eq!(left["documentId"], "doc-1");
    loop {
        let update = common::next_event(&mut ada, "presence:update").await;
        if update["userId"] == "u2" {
            assert_eq!(update["online"], false);
            assert!(update["lastSeen"].is_string());
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Forced close
// ---------------------------------------------------------------------------

#[tokio::test]
async fn admin_disconnect_closes_with_revoked_code() {
    let state = common::test_state();
    let addr = common::start_ws_server(state.clone()).await;
    let (mut ws, _) = common::connect(addr, &common::user_token("u1", "Ada")).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/admin/users/u1/disconnect"))
        .bearer_auth(common::admin_token("root"))
        .send()
        .await
        .expect("disconnect request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["disconnected"], 1);

    assert_eq!(common::next_close_code(&mut ws).await, 4008);

    let gw = state.gateway.clone();
    common::eventually(|| {
        let gw = gw.clone();
        async move { !gw.is_online("u1").await }
    })
    .await;
}

// ---------------------------------------------------------------------------
// Cross-process relay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn events_cross_processes_through_the_relay() {
    let shared: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let access: Arc<dyn AccessPolicy> = Arc::new(MemoryAccessPolicy::allow_all());
    let node_a = common::state_with(Config::local(common::TEST_SECRET), shared.clone(), access.clone(), true);
    let node_b = common::state_with(Config::local(common::TEST_SECRET), shared, access, true);
    node_a.gateway.spawn_relay();
    node_b.gateway.spawn_relay();

    let addr_b = common::start_ws_server(node_b.clone()).await;
    let (mut ws, _) = common::connect(addr_b, &common::user_token("u1", "Ada")).await;

    // Presence is shared through the store.
    assert!(node_a.gateway.is_online("u1").await);

    // The subscriber tasks start asynchronously; keep emitting until one lands.
    let producer = node_a.gateway.clone();
    let emitter = tokio::spawn(async move {
        loop {
            producer
                .emit_to_user("u1", "notification", json!({"id": "n1"}))
                .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    let note = common::next_event(&mut ws, "notification").await;
    assert_eq!(note["id"], "n1");
    emitter.abort();
}
