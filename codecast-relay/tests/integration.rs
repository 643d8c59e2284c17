//! Integration tests for end-to-end WebSocket relaying.
//!
//! These tests start a real server and connect real sockets,
//! verifying the join/change/sync/leave protocol across the wire.

use codecast_relay::client::{ClientState, RelayClient, ShellEvent};
use codecast_relay::codec::Codec;
use codecast_relay::protocol::{ClientEvent, ConnectionId, Participant, ServerEvent};
use codecast_relay::server::{RelayServer, ServerConfig};
use codecast_relay::service::RelayHandle;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return its URL and relay handle.
async fn start_test_server() -> (String, RelayHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = RelayServer::new(config);
    let relay = server.relay().clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), relay)
}

async fn open(url: &str) -> Socket {
    let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, event: ClientEvent) {
    socket.send(Codec::Json.encode(&event).unwrap()).await.unwrap();
}

/// Next protocol event, skipping control frames.
async fn recv(socket: &mut Socket) -> ServerEvent {
    loop {
        let msg = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .unwrap();
        if let Ok((_, event)) = Codec::decode::<ServerEvent>(&msg) {
            return event;
        }
    }
}

/// Assert no protocol event arrives for a short while.
async fn assert_silent(socket: &mut Socket) {
    let result = timeout(Duration::from_millis(150), socket.next()).await;
    assert!(result.is_err(), "Expected no event, got {result:?}");
}

fn roster_of(event: &ServerEvent) -> Vec<ConnectionId> {
    match event {
        ServerEvent::Joined { members, .. } => members.iter().map(|p| p.connection_id).collect(),
        other => panic!("Expected joined, got {other:?}"),
    }
}

/// Join a session and return the connection id from the joiner's JOINED.
async fn join(socket: &mut Socket, session: &str, name: &str) -> (ConnectionId, ServerEvent) {
    send(socket, ClientEvent::join(session, name)).await;
    let event = recv(socket).await;
    match &event {
        ServerEvent::Joined {
            connection_id,
            display_name,
            ..
        } => {
            assert_eq!(display_name, name);
            (*connection_id, event)
        }
        other => panic!("Expected joined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _relay) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_join_roster_and_change_fan_out() {
    let (url, _relay) = start_test_server().await;
    let mut alice = open(&url).await;
    let mut bob = open(&url).await;

    let (a, joined) = join(&mut alice, "room1", "Alice").await;
    assert_eq!(roster_of(&joined), vec![a]);

    let (b, joined_for_bob) = join(&mut bob, "room1", "Bob").await;
    assert_eq!(roster_of(&joined_for_bob), vec![a, b]);

    let joined_for_alice = recv(&mut alice).await;
    assert_eq!(joined_for_alice, joined_for_bob);

    send(&mut alice, ClientEvent::change("x=1")).await;
    assert_eq!(recv(&mut bob).await, ServerEvent::Change { code: "x=1".into() });
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_disconnect_sends_left_and_roster_recovers() {
    let (url, relay) = start_test_server().await;
    let mut alice = open(&url).await;
    let mut bob = open(&url).await;

    let (a, _) = join(&mut alice, "room1", "Alice").await;
    let (b, _) = join(&mut bob, "room1", "Bob").await;
    let _ = recv(&mut alice).await; // Bob's JOINED

    alice.close(None).await.unwrap();
    assert_eq!(
        recv(&mut bob).await,
        ServerEvent::Left {
            connection_id: a,
            display_name: "Alice".into(),
        }
    );

    let mut carol = open(&url).await;
    let (c, joined) = join(&mut carol, "room1", "Carol").await;
    assert_eq!(roster_of(&joined), vec![b, c]);
    assert_eq!(roster_of(&recv(&mut bob).await), vec![b, c]);

    assert_eq!(
        relay.members("room1").await.unwrap(),
        vec![Participant::new(b, "Bob"), Participant::new(c, "Carol")]
    );
}

#[tokio::test]
async fn test_sync_is_point_to_point() {
    let (url, _relay) = start_test_server().await;
    let mut alice = open(&url).await;
    let mut bob = open(&url).await;
    let mut carol = open(&url).await;

    join(&mut alice, "room1", "Alice").await;
    join(&mut bob, "room1", "Bob").await;
    let _ = recv(&mut alice).await;
    let (c, _) = join(&mut carol, "room1", "Carol").await;
    let _ = recv(&mut alice).await;
    let _ = recv(&mut bob).await;

    send(&mut bob, ClientEvent::sync("current", c)).await;

    assert_eq!(
        recv(&mut carol).await,
        ServerEvent::Sync {
            code: "current".into(),
            target_connection_id: c,
        }
    );
    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_last_leave_removes_session() {
    let (url, relay) = start_test_server().await;
    let mut alice = open(&url).await;
    join(&mut alice, "solo", "Alice").await;
    assert_eq!(relay.members("solo").await.unwrap().len(), 1);

    alice.close(None).await.unwrap();
    // Drain until the server acknowledges the close.
    while let Ok(Some(Ok(_))) = timeout(Duration::from_secs(1), alice.next()).await {}

    let mut members = relay.members("solo").await.unwrap();
    for _ in 0..20 {
        if members.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        members = relay.members("solo").await.unwrap();
    }
    assert!(members.is_empty());
    assert_eq!(relay.stats().await.unwrap().active_sessions, 0);
}

#[tokio::test]
async fn test_change_before_join_is_ignored() {
    let (url, relay) = start_test_server().await;
    let mut alice = open(&url).await;
    let mut bob = open(&url).await;
    join(&mut bob, "room1", "Bob").await;

    send(&mut alice, ClientEvent::change("sneaky")).await;
    assert_silent(&mut bob).await;

    // The connection is still usable afterwards.
    let (a, joined) = join(&mut alice, "room1", "Alice").await;
    assert_eq!(roster_of(&joined).last(), Some(&a));
    assert_eq!(relay.stats().await.unwrap().violations, 1);
}

#[tokio::test]
async fn test_garbage_frames_are_dropped() {
    let (url, _relay) = start_test_server().await;
    let mut alice = open(&url).await;

    alice.send(Message::Text("{not json".into())).await.unwrap();
    alice.send(Message::Binary(vec![0xFF, 0x00, 0xAB].into())).await.unwrap();

    let (a, joined) = join(&mut alice, "room1", "Alice").await;
    assert_eq!(roster_of(&joined), vec![a]);
}

#[tokio::test]
async fn test_binary_peer_gets_binary_replies() {
    let (url, _relay) = start_test_server().await;
    let mut alice = open(&url).await;

    alice
        .send(Codec::Binary.encode(&ClientEvent::join("room1", "Alice")).unwrap())
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(2), alice.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(msg, Message::Binary(_)));
    let (codec, event) = Codec::decode::<ServerEvent>(&msg).unwrap();
    assert_eq!(codec, Codec::Binary);
    assert_eq!(roster_of(&event).len(), 1);
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (url, _relay) = start_test_server().await;
    let mut alice = open(&url).await;
    let mut bob = open(&url).await;
    join(&mut alice, "room1", "Alice").await;
    join(&mut bob, "room2", "Bob").await;

    send(&mut alice, ClientEvent::change("only room1")).await;
    assert_silent(&mut bob).await;
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let (url, relay) = start_test_server().await;
    let mut alice = open(&url).await;
    join(&mut alice, "room1", "Alice").await;

    relay.shutdown();

    let closed = loop {
        match timeout(Duration::from_secs(2), alice.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => break true,
            Ok(Some(Ok(_))) => continue,
            Err(_) => break false,
        }
    };
    assert!(closed, "Connection should close after relay shutdown");
}

// ─── Client library ───────────────────────────────────────────────

async fn next_matching(
    events: &mut mpsc::Receiver<ShellEvent>,
    pred: impl Fn(&ShellEvent) -> bool,
) -> ShellEvent {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for shell event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_client_new_peer_receives_sync() {
    let (url, _relay) = start_test_server().await;

    let mut alice = RelayClient::new(url.as_str());
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    alice.join("room1", "Alice").await.unwrap();
    next_matching(&mut alice_events, |e| matches!(e, ShellEvent::Joined { .. })).await;
    assert!(alice.edit("fn main() {}").await.unwrap());

    let mut bob = RelayClient::new(url.as_str());
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    bob.join("room1", "Bob").await.unwrap();

    let joined = next_matching(&mut bob_events, |e| matches!(e, ShellEvent::Joined { .. })).await;
    match joined {
        ShellEvent::Joined { members, .. } => assert_eq!(members.len(), 2),
        other => panic!("Expected joined, got {other:?}"),
    }

    let peer = next_matching(&mut alice_events, |e| matches!(e, ShellEvent::PeerJoined(_))).await;
    assert!(matches!(peer, ShellEvent::PeerJoined(p) if p.display_name == "Bob"));

    let synced = next_matching(&mut bob_events, |e| matches!(e, ShellEvent::BufferReplaced(_))).await;
    assert_eq!(synced, ShellEvent::BufferReplaced("fn main() {}".into()));
    assert_eq!(bob.buffer_text().await, "fn main() {}");
}

#[tokio::test]
async fn test_client_edits_flow_both_ways_without_echo() {
    let (url, relay) = start_test_server().await;

    let mut alice = RelayClient::new(url.as_str());
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    alice.join("room1", "Alice").await.unwrap();
    next_matching(&mut alice_events, |e| matches!(e, ShellEvent::Joined { .. })).await;

    let mut bob = RelayClient::new(url.as_str()).with_codec(Codec::Binary);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    bob.join("room1", "Bob").await.unwrap();
    next_matching(&mut bob_events, |e| matches!(e, ShellEvent::Joined { .. })).await;
    next_matching(&mut alice_events, |e| matches!(e, ShellEvent::PeerJoined(_))).await;

    bob.edit("x = 1").await.unwrap();
    let got = next_matching(&mut alice_events, |e| matches!(e, ShellEvent::BufferReplaced(_))).await;
    assert_eq!(got, ShellEvent::BufferReplaced("x = 1".into()));

    // The editor re-reporting applied content must not produce a CHANGE.
    assert!(!alice.edit("x = 1").await.unwrap());

    alice.edit("x = 2").await.unwrap();
    let got = next_matching(&mut bob_events, |e| matches!(e, ShellEvent::BufferReplaced(_))).await;
    assert_eq!(got, ShellEvent::BufferReplaced("x = 2".into()));

    let stats = relay.stats().await.unwrap();
    assert_eq!(stats.changes_relayed, 2);
}

#[tokio::test]
async fn test_client_sees_peer_leave() {
    let (url, _relay) = start_test_server().await;

    let mut alice = RelayClient::new(url.as_str());
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    alice.join("room1", "Alice").await.unwrap();
    next_matching(&mut alice_events, |e| matches!(e, ShellEvent::Joined { .. })).await;

    let mut bob = RelayClient::new(url.as_str());
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    bob.join("room1", "Bob").await.unwrap();
    next_matching(&mut bob_events, |e| matches!(e, ShellEvent::Joined { .. })).await;
    let bob_id = bob.connection_id().await.unwrap();

    bob.disconnect();

    let left = next_matching(&mut alice_events, |e| matches!(e, ShellEvent::PeerLeft(_))).await;
    assert_eq!(left, ShellEvent::PeerLeft(Participant::new(bob_id, "Bob")));
    assert_eq!(alice.members().await.len(), 1);

    next_matching(&mut bob_events, |e| matches!(e, ShellEvent::Disconnected)).await;
    assert_eq!(bob.connection_state().await, ClientState::Disconnected);
}
