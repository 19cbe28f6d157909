//! End-to-end tests using a real WebSocket client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use huddle_core::{BoardId, UserId};
use huddle_hub::{Hub, HubConfig};
use huddle_server::{HuddleServer, ServerConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Boot a test server on an ephemeral port.
async fn boot_server() -> (SocketAddr, HuddleServer, JoinHandle<()>) {
    let hub = Arc::new(Hub::builder(HubConfig::default()).start());
    let metrics = PrometheusBuilder::new().build_recorder().handle();
    let server = HuddleServer::new(ServerConfig::default(), hub, metrics);
    let (addr, handle) = server.listen().await.unwrap();
    (addr, server, handle)
}

async fn try_connect(
    addr: SocketAddr,
    path: &str,
    headers: &[(&'static str, &str)],
) -> Result<WsStream, tungstenite::Error> {
    let mut request = format!("ws://{addr}{path}").into_client_request().unwrap();
    for (name, value) in headers {
        let _ = request.headers_mut().insert(*name, value.parse().unwrap());
    }
    connect_async(request).await.map(|(ws, _)| ws)
}

async fn connect(addr: SocketAddr, path: &str, user: u64) -> WsStream {
    try_connect(addr, path, &[("x-user-id", &user.to_string())])
        .await
        .unwrap()
}

/// Wait until the hub has registered `expected` sessions.
async fn wait_for_connections(server: &HuddleServer, expected: usize) {
    timeout(TIMEOUT, async {
        while server.hub().connection_count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions never registered");
}

/// Next text frame matching `pred`, skipping everything else.
async fn next_matching(
    ws: &mut WsStream,
    wait: Duration,
    pred: impl Fn(&Value) -> bool,
) -> Option<Value> {
    timeout(wait, async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if pred(&value) {
                    return Some(value);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

fn has_type(event_type: &'static str) -> impl Fn(&Value) -> bool {
    move |v| v["type"] == event_type
}

fn ddp(kind: &'static str) -> impl Fn(&Value) -> bool {
    move |v| v["msg"] == kind
}

// ── Handshake ──

#[tokio::test]
async fn upgrade_without_identity_is_rejected() {
    let (addr, _server, _handle) = boot_server().await;
    let err = try_connect(addr, "/ws/private", &[]).await.unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn upgrade_with_bad_board_id_is_rejected() {
    let (addr, _server, _handle) = boot_server().await;
    let err = try_connect(addr, "/ws/boards/not-a-board", &[("x-user-id", "1")])
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 400),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

// ── Board scope ──

#[tokio::test]
async fn board_broadcast_reaches_only_that_board() {
    let (addr, server, _handle) = boot_server().await;
    let mut first = connect(addr, "/ws/boards/7", 1).await;
    let mut second = connect(addr, "/ws/boards/7", 2).await;
    let mut other_board = connect(addr, "/ws/boards/8", 3).await;
    wait_for_connections(&server, 3).await;

    server
        .hub()
        .broadcast_to_board(BoardId::new(7), "card_moved", json!({"card": 1}));

    for ws in [&mut first, &mut second] {
        let frame = next_matching(ws, TIMEOUT, has_type("card_moved"))
            .await
            .expect("board 7 client missed broadcast");
        assert_eq!(frame["board_id"], 7);
        assert_eq!(frame["data"]["card"], 1);
    }
    assert!(
        next_matching(&mut other_board, QUIET, has_type("card_moved"))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn board_frames_are_echoed_with_server_identity() {
    let (addr, server, _handle) = boot_server().await;
    let mut sender = connect(addr, "/ws/boards/7", 1).await;
    let mut peer = connect(addr, "/ws/boards/7", 2).await;
    wait_for_connections(&server, 2).await;

    send_json(
        &mut sender,
        json!({"type": "comment", "user_id": 999, "data": {"text": "hi"}}),
    )
    .await;

    let frame = next_matching(&mut peer, TIMEOUT, has_type("comment"))
        .await
        .expect("peer missed echoed frame");
    assert_eq!(frame["user_id"], 1);
    assert_eq!(frame["board_id"], 7);
    assert_eq!(frame["data"]["text"], "hi");
}

// ── Private scope ──

#[tokio::test]
async fn private_message_reaches_every_connection_of_the_user() {
    let (addr, server, _handle) = boot_server().await;
    let mut phone = connect(addr, "/ws/private", 5).await;
    let mut laptop = connect(addr, "/ws/private", 5).await;
    let mut stranger = connect(addr, "/ws/private", 6).await;
    wait_for_connections(&server, 3).await;

    server
        .hub()
        .broadcast_to_user(UserId::new(5), "notification", json!({"text": "ping"}));

    for ws in [&mut phone, &mut laptop] {
        let frame = next_matching(ws, TIMEOUT, has_type("notification"))
            .await
            .expect("connection missed private message");
        assert_eq!(frame["recipient_id"], 5);
        assert_eq!(frame["data"]["text"], "ping");
    }
    assert!(
        next_matching(&mut stranger, QUIET, has_type("notification"))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn presence_changes_are_published() {
    let (addr, server, _handle) = boot_server().await;
    let mut watcher = connect(addr, "/ws/private", 1).await;
    wait_for_connections(&server, 1).await;

    let joiner = connect(addr, "/ws/boards/3", 2).await;
    let online = next_matching(&mut watcher, TIMEOUT, |v| {
        v["type"] == "user_status" && v["data"]["user_id"] == 2
    })
    .await
    .expect("watcher missed online status");
    assert_eq!(online["data"]["status"], "online");
    assert!(server.hub().is_online_anywhere(UserId::new(2)).await);

    drop(joiner);
    let offline = next_matching(&mut watcher, TIMEOUT, |v| {
        v["type"] == "user_status" && v["data"]["user_id"] == 2
    })
    .await
    .expect("watcher missed offline status");
    assert_eq!(offline["data"]["status"], "offline");
}

// ── DDP chat ──

async fn connect_chat(addr: SocketAddr, user: u64, name: &str) -> WsStream {
    let mut ws = try_connect(
        addr,
        "/ws/chat",
        &[("x-user-id", &user.to_string()), ("x-user-name", name)],
    )
    .await
    .unwrap();
    send_json(&mut ws, json!({"msg": "connect", "version": "1", "support": ["1"]})).await;
    let _ = next_matching(&mut ws, TIMEOUT, ddp("connected"))
        .await
        .expect("no connected reply");
    ws
}

async fn send_message(ws: &mut WsStream, id: &str, room: &str, text: &str) {
    send_json(
        ws,
        json!({"msg": "method", "id": id, "method": "sendMessage", "params": [{"rid": room, "msg": text}]}),
    )
    .await;
}

#[tokio::test]
async fn ddp_subscription_receives_room_messages() {
    let (addr, server, _handle) = boot_server().await;
    let mut ann = connect_chat(addr, 10, "ann").await;
    let mut bob = connect_chat(addr, 11, "bob").await;
    wait_for_connections(&server, 2).await;

    send_json(
        &mut bob,
        json!({"msg": "sub", "id": "s1", "name": "stream-room-messages", "params": ["42"]}),
    )
    .await;
    let ready = next_matching(&mut bob, TIMEOUT, ddp("ready"))
        .await
        .expect("no ready");
    assert_eq!(ready["subs"], json!(["s1"]));

    send_message(&mut ann, "m1", "42", "hello").await;
    let result = next_matching(&mut ann, TIMEOUT, ddp("result"))
        .await
        .expect("no method result");
    assert_eq!(result["id"], "m1");
    assert!(result["result"]["_id"].is_string());

    let changed = next_matching(&mut bob, TIMEOUT, |v| {
        v["msg"] == "changed" && v["collection"] == "stream-room-messages"
    })
    .await
    .expect("subscriber missed room message");
    assert_eq!(changed["fields"]["rid"], "42");
    assert_eq!(changed["fields"]["msg"], "hello");
    assert_eq!(changed["fields"]["u"]["username"], "ann");
    assert_eq!(changed["fields"]["_id"], result["result"]["_id"]);
}

#[tokio::test]
async fn ddp_unsubscribe_stops_room_messages() {
    let (addr, server, _handle) = boot_server().await;
    let mut ann = connect_chat(addr, 10, "ann").await;
    wait_for_connections(&server, 1).await;

    send_json(
        &mut ann,
        json!({"msg": "sub", "id": "s1", "name": "stream-room-messages", "params": ["42"]}),
    )
    .await;
    let _ = next_matching(&mut ann, TIMEOUT, ddp("ready")).await.expect("no ready");

    send_json(&mut ann, json!({"msg": "unsub", "id": "s1"})).await;
    let nosub = next_matching(&mut ann, TIMEOUT, ddp("nosub"))
        .await
        .expect("no nosub");
    assert_eq!(nosub["id"], "s1");

    send_message(&mut ann, "m2", "42", "anyone?").await;
    let result = next_matching(&mut ann, TIMEOUT, ddp("result"))
        .await
        .expect("no method result");
    assert!(result.get("error").is_none());
    assert!(
        next_matching(&mut ann, QUIET, |v| v["collection"] == "stream-room-messages")
            .await
            .is_none()
    );
}

#[tokio::test]
async fn ddp_ping_and_unknown_method() {
    let (addr, _server, _handle) = boot_server().await;
    let mut ann = connect_chat(addr, 10, "ann").await;

    send_json(&mut ann, json!({"msg": "ping", "id": "p1"})).await;
    let pong = next_matching(&mut ann, TIMEOUT, ddp("pong")).await.expect("no pong");
    assert_eq!(pong["id"], "p1");

    send_json(
        &mut ann,
        json!({"msg": "method", "id": "m9", "method": "launchRockets", "params": []}),
    )
    .await;
    let result = next_matching(&mut ann, TIMEOUT, ddp("result"))
        .await
        .expect("no method result");
    assert_eq!(result["id"], "m9");
    assert_eq!(result["error"]["error"], 404);
}

// ── Shutdown ──

#[tokio::test]
async fn graceful_shutdown_closes_clients() {
    let (addr, server, handle) = boot_server().await;
    let mut client = connect(addr, "/ws/private", 1).await;
    wait_for_connections(&server, 1).await;

    server
        .shutdown()
        .graceful_shutdown(server.hub(), vec![handle], Some(TIMEOUT))
        .await;

    let closed = timeout(TIMEOUT, async {
        while let Some(msg) = client.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);
    assert_eq!(server.hub().connection_count().await, 0);
    assert!(try_connect(addr, "/ws/private", &[("x-user-id", "1")]).await.is_err());
}
