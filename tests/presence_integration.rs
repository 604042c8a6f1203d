//! Presence tests: cursor fan-out with stamped identity, origin exclusion,
//! client-side throttling, and session-record cursor writes.

use std::sync::Arc;
use std::time::Duration as StdDuration;
use tandem_collab::{
    AccessRole, CollabServer, CursorTracker, MemoryStore, ServerConfig, StaticTokenVerifier,
    SyncClient, SyncEvent,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server() -> (String, Arc<MemoryStore>) {
    let port = free_port().await;
    let mut config = ServerConfig::default();
    config.bind_addr = format!("127.0.0.1:{port}");

    let store = Arc::new(MemoryStore::new());
    store.insert_user(1, "open-alice", "Alice");
    store.insert_user(2, "open-bob", "Bob");
    store.insert_user(3, "open-carol", "Carol");
    store.insert_document(42, 1);
    store.grant_access(42, 2, AccessRole::Editor);
    store.grant_access(42, 3, AccessRole::Editor);

    let verifier = StaticTokenVerifier::new()
        .accept("tok-alice", "open-alice")
        .accept("tok-bob", "open-bob")
        .accept("tok-carol", "open-carol");

    let server = Arc::new(CollabServer::new(config, store.clone(), Arc::new(verifier)));
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;
    (format!("ws://127.0.0.1:{port}"), store)
}

async fn connect(
    url: &str,
    user_id: i64,
    token: &str,
) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(user_id, token, 42, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(SyncEvent::Joined { .. })) => break,
            Ok(Some(_)) => {}
            _ => panic!("no room_joined received"),
        }
    }
    (client, events)
}

/// Wait for the next remote cursor event.
async fn next_cursor(rx: &mut mpsc::Receiver<SyncEvent>) -> Option<(String, u32, Option<String>)> {
    loop {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(SyncEvent::RemoteCursor { client_id, cursor })) => {
                return Some((client_id, cursor.position, cursor.color))
            }
            Ok(Some(_)) => {}
            _ => return None,
        }
    }
}

#[tokio::test]
async fn test_cursor_fanout_reaches_peers_with_identity() {
    let (url, _store) = start_server().await;

    let (alice, mut alice_events) = connect(&url, 1, "tok-alice").await;
    let (_bob, mut bob_events) = connect(&url, 2, "tok-bob").await;
    let (_carol, mut carol_events) = connect(&url, 3, "tok-carol").await;

    let alice_id = alice.client_id().await;
    alice.send_cursor(5, Some((5, 9))).await.unwrap();

    for events in [&mut bob_events, &mut carol_events] {
        let (client_id, position, color) = next_cursor(events).await.expect("cursor expected");
        assert_eq!(client_id, alice_id);
        assert_eq!(position, 5);
        assert!(color.is_some(), "server must stamp the assigned color");
    }

    // The origin never receives its own echo
    let echo = timeout(Duration::from_millis(300), async {
        loop {
            match alice_events.recv().await {
                Some(SyncEvent::RemoteCursor { .. }) => return true,
                Some(_) => {}
                None => return false,
            }
        }
    })
    .await;
    assert!(echo.is_err(), "origin received its own cursor back");
}

#[tokio::test]
async fn test_cursor_events_feed_the_tracker() {
    let (url, _store) = start_server().await;

    let (alice, _alice_events) = connect(&url, 1, "tok-alice").await;
    let (_bob, mut bob_events) = connect(&url, 2, "tok-bob").await;

    let alice_id = alice.client_id().await;
    alice.send_cursor(7, None).await.unwrap();

    let mut tracker = CursorTracker::new(StdDuration::from_secs(30));
    loop {
        match timeout(Duration::from_secs(2), bob_events.recv()).await {
            Ok(Some(SyncEvent::RemoteCursor { client_id, cursor })) => {
                tracker.apply(&client_id, &cursor);
                break;
            }
            Ok(Some(_)) => {}
            _ => panic!("no cursor event"),
        }
    }

    let remote = tracker.get(&alice_id).expect("tracked cursor");
    assert_eq!(remote.cursor.position, 7);
    assert_eq!(remote.name.as_deref(), Some("Alice"));
    assert_eq!(remote.user_id, Some(1));
}

#[tokio::test]
async fn test_cursor_emission_is_throttled_client_side() {
    let (url, _store) = start_server().await;

    let (alice, _alice_events) = connect(&url, 1, "tok-alice").await;
    let (_bob, mut bob_events) = connect(&url, 2, "tok-bob").await;

    // Two emissions inside the 100 ms window: the second is suppressed
    alice.send_cursor(1, None).await.unwrap();
    alice.send_cursor(2, None).await.unwrap();
    sleep(Duration::from_millis(150)).await;
    alice.send_cursor(3, None).await.unwrap();

    let first = next_cursor(&mut bob_events).await.unwrap();
    let second = next_cursor(&mut bob_events).await.unwrap();
    assert_eq!(first.1, 1);
    assert_eq!(second.1, 3);
}

#[tokio::test]
async fn test_cursor_write_lands_in_session_record() {
    let (url, store) = start_server().await;

    let (alice, _alice_events) = connect(&url, 1, "tok-alice").await;
    let alice_id = alice.client_id().await;
    alice.send_cursor(12, Some((12, 20))).await.unwrap();

    for _ in 0..100 {
        if let Some(session) = store.session(&alice_id) {
            if session.cursor.position == 12 {
                assert_eq!(session.cursor.selection, Some((12, 20)));
                return;
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("cursor write did not reach the session record");
}
