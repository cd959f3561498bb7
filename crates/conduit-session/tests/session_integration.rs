#![allow(clippy::unwrap_used, clippy::expect_used)]

use conduit_core::{Message, Notification, Request, ServerDescriptor, PROTOCOL_VERSION};
use conduit_session::{ConnectionState, SessionRegistry};
use std::sync::Arc;
use std::time::Duration;

fn init_params() -> serde_json::Map<String, serde_json::Value> {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {"name": "it", "version": "1"}
    })
    .as_object()
    .cloned()
    .unwrap()
}

// ---------------------------------------------------------------------------
// 1. TTL: untouched sessions expire, touched ones survive
// ---------------------------------------------------------------------------

#[test]
fn session_ttl_expiry() {
    let ttl = Duration::from_secs(120);
    let reg = SessionRegistry::new(ttl);
    let session = reg.create();
    let t = session.last_active();

    assert_eq!(reg.sweep_at(t + ttl / 2), 0);
    assert_eq!(reg.sweep_at(t + ttl + Duration::from_millis(5)), 1);
    assert!(reg.get(session.id()).is_none());
}

#[test]
fn touching_before_ttl_prevents_removal() {
    let ttl = Duration::from_secs(120);
    let reg = SessionRegistry::new(ttl);
    let session = reg.create();
    let t = session.last_active();

    reg.touch_at(session.id(), t + Duration::from_secs(100));
    assert_eq!(reg.sweep_at(t + ttl + Duration::from_millis(5)), 0);
    assert!(reg.get(session.id()).is_some());
}

#[tokio::test]
async fn background_sweeper_expires_and_reports() {
    let reg = Arc::new(SessionRegistry::new(Duration::from_millis(10)));
    let session = reg.create();
    let id = session.id().to_string();
    drop(session);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sweeper = reg.spawn_sweeper(Duration::from_millis(15), move |ids| {
        let _ = tx.send(ids.to_vec());
    });

    let expired = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(expired, vec![id]);
    assert!(reg.is_empty());
}

// ---------------------------------------------------------------------------
// 2. Concurrent bookkeeping on one session
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_touches_do_not_corrupt_registry() {
    let reg = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
    let session = reg.create();
    let _other = reg.create();
    let id = session.id().to_string();

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let reg = reg.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                assert!(reg.touch(&id));
                assert!(reg.get(&id).is_some());
                reg.sweep();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(reg.len(), 2);
    assert!(reg.get(&id).is_some());
}

// ---------------------------------------------------------------------------
// 3. Session lifecycle through the registry
// ---------------------------------------------------------------------------

#[test]
fn registered_session_walks_the_handshake() {
    let reg = SessionRegistry::new(Duration::from_secs(60));
    let session = reg.create();
    let server = ServerDescriptor::new("srv", "1");

    let lc = session.lifecycle();
    assert!(lc
        .check_admission(&Message::from(Request::new(1, "initialize", None)))
        .is_ok());
    lc.handle_initialize(Some(&init_params()), &server).unwrap();
    lc.check_admission(&Message::from(Notification::new(
        "notifications/initialized",
        None,
    )))
    .unwrap();
    lc.handle_initialized_ack().unwrap();

    let again = reg.get(session.id()).unwrap();
    assert_eq!(again.state(), ConnectionState::Ready);
    assert_eq!(again.peer().identity.unwrap().name, "it");
}
