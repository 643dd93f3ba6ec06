//! End-to-end tests against a real server with WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use turbo_server::config::ServerSettings;
use turbo_server::{start, ServerHandle};
use turbo_store::{MemoryStore, SqliteStore, Storage};
use turbo_telemetry::ServerMetrics;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn boot_server_with(store: Arc<dyn Storage>, outbox_capacity: usize) -> ServerHandle {
    let settings = ServerSettings {
        host: "127.0.0.1".into(),
        port: 0,
        outbox_capacity,
        ..Default::default()
    };
    start(&settings, store, Arc::new(ServerMetrics::new())).await.unwrap()
}

async fn boot_server() -> ServerHandle {
    boot_server_with(Arc::new(MemoryStore::new()), 256).await
}

async fn connect(handle: &ServerHandle) -> WsStream {
    let url = format!("ws://{}/ws", handle.addr());
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next JSON text frame, skipping control frames.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read failed");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn read_ack(ws: &mut WsStream, ack: i64) -> Value {
    loop {
        let frame = read_json(ws).await;
        if frame["type"] == "ack" && frame["ack"] == ack {
            return frame;
        }
    }
}

async fn request(ws: &mut WsStream, frame: Value) -> Value {
    let ack = frame["ack"].as_i64().unwrap();
    send(ws, frame).await;
    read_ack(ws, ack).await
}

#[tokio::test]
async fn subscriber_sees_set_from_other_client() {
    let handle = boot_server().await;
    let mut watcher = connect(&handle).await;
    let mut writer = connect(&handle).await;

    let ack = request(&mut watcher, json!({"cmd": "on", "path": "/rooms/1", "eventType": 0, "ack": 1})).await;
    assert!(ack.get("err").is_none());

    let ack = request(&mut writer, json!({"cmd": "set", "path": "/rooms/1", "value": {"title": "hi"}, "ack": 1})).await;
    assert!(ack.get("err").is_none());

    let event = read_json(&mut watcher).await;
    assert_eq!(event, json!({"type": "on", "path": "/rooms/1", "eventType": 0, "value": {"title": "hi"}}));

    handle.shutdown().await;
}

#[tokio::test]
async fn parent_sees_child_changed() {
    let handle = boot_server().await;
    let mut ws = connect(&handle).await;

    request(&mut ws, json!({"cmd": "on", "path": "/rooms", "eventType": "child_changed", "ack": 1})).await;
    request(&mut ws, json!({"cmd": "set", "path": "/rooms/7", "value": 42, "ack": 2})).await;

    let event = read_json(&mut ws).await;
    assert_eq!(event["path"], "/rooms");
    assert_eq!(event["eventType"], 2);
    assert_eq!(event["child"], "/rooms/7");
    assert_eq!(event["value"], 42);

    handle.shutdown().await;
}

#[tokio::test]
async fn off_stops_events() {
    let handle = boot_server().await;
    let mut ws = connect(&handle).await;

    request(&mut ws, json!({"cmd": "on", "path": "/x", "eventType": 0, "ack": 1})).await;
    request(&mut ws, json!({"cmd": "off", "path": "/x", "eventType": 0, "ack": 2})).await;
    request(&mut ws, json!({"cmd": "set", "path": "/x", "value": 1, "ack": 3})).await;
    send(&mut ws, json!({"cmd": "transGet", "path": "/x", "ack": 4})).await;
    let next = read_json(&mut ws).await;
    assert_eq!(next["type"], "ack");
    assert_eq!(next["ack"], 4);
    assert_eq!(next["res"], 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn transactions_round_trip() {
    let handle = boot_server().await;
    let mut ws = connect(&handle).await;

    let got = request(&mut ws, json!({"cmd": "transGet", "path": "/counter", "ack": 1})).await;
    assert_eq!(got["res"], Value::Null);
    assert_eq!(got["revision"], 0);

    let ok = request(&mut ws, json!({"cmd": "transSet", "path": "/counter", "value": 1, "revision": 0, "ack": 2})).await;
    assert!(ok.get("err").is_none());

    let conflict = request(&mut ws, json!({"cmd": "transSet", "path": "/counter", "value": 5, "revision": 0, "ack": 3})).await;
    assert!(conflict["err"].as_str().unwrap().contains("conflict"));
    assert_eq!(conflict["res"], 1);
    assert_eq!(conflict["revision"], 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn remove_unknown_path_and_bad_frames_keep_session() {
    let handle = boot_server().await;
    let mut ws = connect(&handle).await;

    let ack = request(&mut ws, json!({"cmd": "remove", "path": "/nothing", "ack": 1})).await;
    assert_eq!(ack["err"], "path does not exist: /nothing");

    ws.send(Message::Text("{\"ack\": 2, not json".into())).await.unwrap();
    let ack = request(&mut ws, json!({"cmd": "bogus", "ack": 3})).await;
    assert_eq!(ack["err"], "unsupported command 'bogus'");

    let ack = request(&mut ws, json!({"cmd": "auth", "ack": 4})).await;
    assert!(ack.get("err").is_none());

    handle.shutdown().await;
}

#[tokio::test]
async fn update_fans_out_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(turbo_store::Database::open(&dir.path().join("t.db")).unwrap());
    let handle = boot_server_with(Arc::new(store), 256).await;
    let mut ws = connect(&handle).await;

    request(&mut ws, json!({"cmd": "on", "path": "/doc/title", "eventType": 0, "ack": 1})).await;
    request(&mut ws, json!({"cmd": "on", "path": "/doc", "eventType": 2, "ack": 2})).await;
    send(
        &mut ws,
        json!({"cmd": "update", "path": "/doc", "value": {"title": "t", "body/text": "b"}, "ack": 3}),
    )
    .await;
    let mut events = Vec::new();
    let ack = loop {
        let frame = read_json(&mut ws).await;
        if frame["type"] == "ack" {
            break frame;
        }
        events.push(frame);
    };
    assert!(ack.get("err").is_none());
    events.sort_by_key(|e| e["eventType"].as_u64());
    assert_eq!(
        events,
        vec![
            json!({"type": "on", "path": "/doc/title", "eventType": 0, "value": "t"}),
            json!({"type": "on", "path": "/doc", "eventType": 2, "value": "t", "child": "/doc/title"}),
        ]
    );

    let url = format!("http://{}/data/doc/body/text", handle.addr());
    let body: Value = reqwest::get(url).await.unwrap().json().await.unwrap();
    assert_eq!(body["value"], "b");
    assert_eq!(body["revision"], 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn disconnect_cleans_up_session() {
    let handle = boot_server().await;
    let mut ws = connect(&handle).await;
    request(&mut ws, json!({"cmd": "on", "path": "/a", "eventType": 0, "ack": 1})).await;
    assert_eq!(handle.hub().session_count(), 1);
    assert_eq!(handle.hub().bus().subscription_count(), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let hub = Arc::clone(handle.hub());
    timeout(TIMEOUT, async move {
        while hub.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(handle.hub().bus().subscription_count(), 0);

    let metrics: Value = reqwest::get(format!("http://{}/metrics", handle.addr()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["sessions_closed"], 1);
    assert_eq!(metrics["commands"]["on"], 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_live_clients() {
    let handle = boot_server().await;
    let mut ws = connect(&handle).await;
    request(&mut ws, json!({"cmd": "on", "path": "/a", "eventType": 0, "ack": 1})).await;

    handle.shutdown().await;

    let end = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(end.is_ok());
}

#[tokio::test]
async fn frames_after_server_teardown_are_not_routed() {
    let handle = boot_server().await;
    let mut ws = connect(&handle).await;
    request(&mut ws, json!({"cmd": "set", "path": "/k", "value": 1, "ack": 1})).await;

    assert_eq!(handle.hub().disconnect_all(), 1);
    let _ = ws.send(Message::Text(json!({"cmd": "set", "path": "/k", "value": 2, "ack": 2}).to_string().into())).await;
    let _ = ws.send(Message::Text(json!({"cmd": "on", "path": "/k", "eventType": 0, "ack": 3}).to_string().into())).await;

    let end = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => panic!("frame after teardown: {text}"),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(end.is_ok());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.hub().store().get("/k").await.unwrap().value, 1);
    assert_eq!(handle.hub().bus().subscription_count(), 0);
    assert_eq!(handle.hub().session_count(), 0);

    handle.shutdown().await;
}
