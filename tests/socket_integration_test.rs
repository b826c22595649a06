// Integration tests for server <-> client messaging
//
// These tests verify that:
// 1. A client greeting gets answered over a real socket path
// 2. send_to_all reaches every open client exactly once
// 3. Messages arrive complete and in order in both directions
// 4. A misbehaving peer fails only its own connection
// 5. Stopping the server closes clients and frees the socket path
//
// Run with: cargo test --test socket_integration_test

use std::path::{Path, PathBuf};
use std::time::Duration;

use localsock::{
    event_channel, CloseReason, Config, ConnectionEvent, ConnectionState, EventSender, IpcError,
    SocketClient, SocketServer,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedReceiver;

const TIMEOUT: Duration = Duration::from_secs(5);

type Events = UnboundedReceiver<ConnectionEvent>;

async fn next_event(events: &mut Events) -> ConnectionEvent {
    tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Event channel closed")
}

async fn next_message(events: &mut Events) -> bytes::Bytes {
    match next_event(events).await {
        ConnectionEvent::Message { payload, .. } => payload,
        other => panic!("Expected Message, got: {other:?}"),
    }
}

fn start_server(tmp: &tempfile::TempDir) -> (SocketServer<EventSender>, Events, PathBuf) {
    let sock_path = tmp.path().join("it.sock");
    let (handler, events) = event_channel();
    let server = SocketServer::start(sock_path.clone(), handler).unwrap();
    (server, events, sock_path)
}

/// Connect a client and wait until both ends report the connection open.
async fn connect_client(
    sock_path: &Path,
    server_events: &mut Events,
) -> (SocketClient<EventSender>, Events, localsock::Connection) {
    let (handler, mut events) = event_channel();
    let client = SocketClient::connect(sock_path, handler).await.unwrap();

    match next_event(&mut events).await {
        ConnectionEvent::Connected(_) => {}
        other => panic!("Expected client Connected, got: {other:?}"),
    }
    let server_side = match next_event(server_events).await {
        ConnectionEvent::Connected(conn) => conn,
        other => panic!("Expected server Connected, got: {other:?}"),
    };
    (client, events, server_side)
}

#[tokio::test]
async fn test_greeting_gets_reply() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (server, mut server_events, sock_path) = start_server(&tmp);

    let (client, mut client_events, _server_side) =
        connect_client(&sock_path, &mut server_events).await;
    client.send("greetings\n").unwrap();

    match next_event(&mut server_events).await {
        ConnectionEvent::Message { connection, payload } => {
            assert_eq!(&payload[..], b"greetings\n");
            connection.send("hello back").unwrap();
        }
        other => panic!("Expected Message, got: {other:?}"),
    }

    assert_eq!(&next_message(&mut client_events).await[..], b"hello back");

    // Exactly one message each way.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client_events.try_recv().is_err());
    assert!(server_events.try_recv().is_err());

    server.stop().await;
}

#[tokio::test]
async fn test_send_to_all_reaches_both_clients_once() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (server, mut server_events, sock_path) = start_server(&tmp);

    let (_c1, mut events1, _) = connect_client(&sock_path, &mut server_events).await;
    let (_c2, mut events2, _) = connect_client(&sock_path, &mut server_events).await;
    assert_eq!(server.connection_count(), 2);

    assert_eq!(server.send_to_all("x").unwrap(), 2);

    assert_eq!(&next_message(&mut events1).await[..], b"x");
    assert_eq!(&next_message(&mut events2).await[..], b"x");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events1.try_recv().is_err());
    assert!(events2.try_recv().is_err());
}

#[tokio::test]
async fn test_messages_arrive_in_order_both_ways() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (_server, mut server_events, sock_path) = start_server(&tmp);
    let (client, mut client_events, server_side) =
        connect_client(&sock_path, &mut server_events).await;

    const COUNT: usize = 500;
    for i in 0..COUNT {
        client.send(format!("up-{i}")).unwrap();
        server_side.send(format!("down-{i}")).unwrap();
    }

    for i in 0..COUNT {
        assert_eq!(next_message(&mut server_events).await, format!("up-{i}").as_bytes());
        assert_eq!(next_message(&mut client_events).await, format!("down-{i}").as_bytes());
    }
}

#[tokio::test]
async fn test_large_message_round_trip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (_server, mut server_events, sock_path) = start_server(&tmp);
    let (client, _client_events, _server_side) =
        connect_client(&sock_path, &mut server_events).await;

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    tokio::time::timeout(TIMEOUT, client.send_flushed(&payload))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(next_message(&mut server_events).await, payload);
}

#[tokio::test]
async fn test_oversized_frame_fails_only_that_connection() {
    let tmp = tempfile::TempDir::new().unwrap();
    let sock_path = tmp.path().join("limit.sock");
    let config = Config {
        max_frame_size: 16,
        ..Config::new(&sock_path)
    };
    let (handler, mut server_events) = event_channel();
    let server = SocketServer::bind(&config, handler).unwrap();

    let (_good, mut good_events, _) = connect_client(&sock_path, &mut server_events).await;

    let mut rogue = tokio::net::UnixStream::connect(&sock_path).await.unwrap();
    let rogue_id = match next_event(&mut server_events).await {
        ConnectionEvent::Connected(conn) => conn.id().clone(),
        other => panic!("Expected Connected, got: {other:?}"),
    };
    rogue.write_all(&1024u32.to_le_bytes()).await.unwrap();

    match next_event(&mut server_events).await {
        ConnectionEvent::Error { connection_id, error } => {
            assert_eq!(connection_id, rogue_id);
            assert!(matches!(error, IpcError::FrameTooLarge { size: 1024, max: 16 }));
        }
        other => panic!("Expected Error, got: {other:?}"),
    }
    match next_event(&mut server_events).await {
        ConnectionEvent::Closed { connection_id, reason } => {
            assert_eq!(connection_id, rogue_id);
            assert_eq!(reason, CloseReason::Failed);
        }
        other => panic!("Expected Closed, got: {other:?}"),
    }

    assert_eq!(server.send_to_all("still here").unwrap(), 1);
    assert_eq!(&next_message(&mut good_events).await[..], b"still here");
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (_server, mut server_events, sock_path) = start_server(&tmp);
    let (client, mut client_events, _server_side) =
        connect_client(&sock_path, &mut server_events).await;

    client.close();
    assert!(matches!(client.send("late"), Err(IpcError::ConnectionClosed)));

    match next_event(&mut client_events).await {
        ConnectionEvent::Closed { reason, .. } => assert_eq!(reason, CloseReason::Local),
        other => panic!("Expected Closed, got: {other:?}"),
    }
    match next_event(&mut server_events).await {
        ConnectionEvent::Closed { reason, .. } => assert_eq!(reason, CloseReason::Peer),
        other => panic!("Expected Closed, got: {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client.send_flushed("later").await.unwrap_err().is_closed());
}

#[tokio::test]
async fn test_stop_closes_clients_and_frees_path() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (server, mut server_events, sock_path) = start_server(&tmp);
    let (client, mut client_events, server_side) =
        connect_client(&sock_path, &mut server_events).await;

    server_side.send("goodbye").unwrap();
    tokio::time::timeout(TIMEOUT, server.stop()).await.expect("stop timed out");
    assert!(!sock_path.exists());

    assert_eq!(&next_message(&mut client_events).await[..], b"goodbye");
    match next_event(&mut client_events).await {
        ConnectionEvent::Closed { reason, .. } => assert_eq!(reason, CloseReason::Peer),
        other => panic!("Expected Closed, got: {other:?}"),
    }
    tokio::time::timeout(TIMEOUT, client.closed()).await.unwrap();

    let (handler, _events) = event_channel();
    assert!(matches!(
        SocketClient::connect(sock_path.clone(), handler).await,
        Err(IpcError::Connect { .. })
    ));

    // The path can be bound again right away.
    let (handler, _events) = event_channel();
    let again = SocketServer::start(sock_path.clone(), handler).unwrap();
    assert_eq!(again.socket_path(), sock_path.as_path());
}

#[tokio::test]
async fn test_dropped_server_releases_path() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (server, mut server_events, sock_path) = start_server(&tmp);
    let (client, mut client_events, _server_side) =
        connect_client(&sock_path, &mut server_events).await;

    drop(server);
    assert!(!sock_path.exists());

    match next_event(&mut client_events).await {
        ConnectionEvent::Closed { reason, .. } => assert_eq!(reason, CloseReason::Peer),
        other => panic!("Expected Closed, got: {other:?}"),
    }
    tokio::time::timeout(TIMEOUT, client.closed()).await.unwrap();
}
