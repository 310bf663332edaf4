//! End-to-end tests through the engine: connections, listeners, queries,
//! authentication, disconnect events and journal failure.
//!
//! All of these run over the in-memory journal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_core::{Event, Value};
use arbor_sync::{
    Connection, Database, DurableLog, EngineConfig, EngineError, JournalError, JournalRecord,
    Location, MemoryJournal, MessageType, OutboundMessage, SnapshotStore,
};
use serde_json::json;
use tokio::time::{timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn open() -> Database {
    Database::open(EngineConfig::for_testing()).await.unwrap()
}

/// Every command before this one has been handled once it returns.
async fn barrier(db: &Database) {
    db.get("/").await.unwrap();
}

fn drain(conn: &mut Connection) -> Vec<OutboundMessage> {
    std::iter::from_fn(|| conn.try_recv()).collect()
}

async fn next(conn: &mut Connection) -> OutboundMessage {
    timeout(Duration::from_secs(5), conn.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("connection closed")
}

fn find<'a>(msgs: &'a [OutboundMessage], msg_type: MessageType, path: &str) -> Option<&'a OutboundMessage> {
    msgs.iter().find(|m| m.msg_type == msg_type && m.path == path)
}

// ─── Writes and listeners ────────────────────────────────────────────────────

#[tokio::test]
async fn test_write_then_read() {
    let db = open().await;
    let conn = db.connect().await.unwrap();

    let seq = conn
        .set("/users/1", json!({"name": "Ann", "age": 30}), None)
        .await
        .unwrap();
    db.wait_applied(seq).await.unwrap();

    assert_eq!(
        db.get("/users/1/name").await.unwrap(),
        Some(Value::from("Ann"))
    );
    assert_eq!(db.get("/users/9").await.unwrap(), None);
    assert_eq!(db.stats().committed, 1);
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sequence_numbers_are_dense() {
    let db = open().await;
    let conn = db.connect().await.unwrap();
    let mut last = None;
    for i in 0..20 {
        let seq = conn.set(&format!("/n/{i}"), i, None).await.unwrap();
        if let Some(prev) = last {
            assert_eq!(seq, prev + 1);
        }
        last = Some(seq);
    }
    db.wait_applied(19).await.unwrap();
    let stats = db.stats();
    assert_eq!(stats.committed, 20);
    assert_eq!(stats.journaled, 20);
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scalar_change_reaches_listeners() {
    let db = open().await;
    let mut conn = db.connect().await.unwrap();
    let seq = conn
        .set("/users/1", json!({"name": "Ann", "age": 30}), None)
        .await
        .unwrap();
    db.wait_applied(seq).await.unwrap();

    conn.attach_listener("/users/1", "child_changed").await.unwrap();
    conn.attach_listener("/users/1/age", "value").await.unwrap();
    conn.attach_listener("/users/1", "value").await.unwrap();
    barrier(&db).await;
    let initial = drain(&mut conn);
    assert_eq!(initial.len(), 2);
    assert!(initial.iter().all(|m| m.msg_type == MessageType::Value));

    let seq = conn.set("/users/1/age", 31, None).await.unwrap();
    db.wait_applied(seq).await.unwrap();
    let msgs = drain(&mut conn);

    let changed = find(&msgs, MessageType::ChildChanged, "/users/1").unwrap();
    assert_eq!(changed.name.as_deref(), Some("age"));
    assert_eq!(changed.payload, Value::from(31));

    let age = find(&msgs, MessageType::Value, "/users/1/age").unwrap();
    assert_eq!(age.payload, Value::from(31));

    let user = find(&msgs, MessageType::Value, "/users/1").unwrap();
    assert_eq!(user.payload, Value::from(json!({"name": "Ann", "age": 31})));
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_late_listener_sees_same_state() {
    let db = open().await;
    let mut early = db.connect().await.unwrap();
    early.attach_listener("/items", "child_added").await.unwrap();

    for name in ["a", "b", "c"] {
        early.set(&format!("/items/{name}"), json!({"v": name}), None).await.unwrap();
    }
    let seq = early.remove("/items/b").await.unwrap();
    db.wait_applied(seq).await.unwrap();
    let mut seen: Vec<String> = drain(&mut early).into_iter().filter_map(|m| m.name).collect();
    seen.retain(|n| n != "b");

    let mut late = db.connect().await.unwrap();
    late.attach_listener("/items", "child_added").await.unwrap();
    barrier(&db).await;
    let synced: Vec<String> = drain(&mut late).into_iter().filter_map(|m| m.name).collect();
    assert_eq!(synced, seen);
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remove_and_detach() {
    let db = open().await;
    let mut conn = db.connect().await.unwrap();
    conn.set("/a", json!({"x": 1, "y": 2}), None).await.unwrap();
    conn.attach_listener("/a", "child_removed").await.unwrap();

    let seq = conn.remove("/a/x").await.unwrap();
    db.wait_applied(seq).await.unwrap();
    let removed = next(&mut conn).await;
    assert_eq!(removed.msg_type, MessageType::ChildRemoved);
    assert_eq!(removed.name.as_deref(), Some("x"));
    assert_eq!(removed.payload, Value::from(1));

    conn.detach_listener("/a", "child_removed").await.unwrap();
    let seq = conn.remove("/a/y").await.unwrap();
    db.wait_applied(seq).await.unwrap();
    assert!(drain(&mut conn).is_empty());
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_push_and_priority() {
    let db = open().await;
    let mut conn = db.connect().await.unwrap();
    conn.attach_listener("/list", "child_added").await.unwrap();
    conn.attach_listener("/list", "child_moved").await.unwrap();

    let (first, _) = conn.push("/list", json!({"t": "one"})).await.unwrap();
    let (second, seq) = conn.push("/list", json!({"t": "two"})).await.unwrap();
    db.wait_applied(seq).await.unwrap();
    let added: Vec<String> = drain(&mut conn).into_iter().filter_map(|m| m.name).collect();
    assert_eq!(added, vec![first.clone(), second.clone()]);

    let seq = conn.set_priority(&format!("/list/{second}"), 0).await.unwrap();
    db.wait_applied(seq).await.unwrap();
    let moved = drain(&mut conn);
    let moved = find(&moved, MessageType::ChildMoved, "/list").unwrap();
    assert_eq!(moved.name.as_deref(), Some(second.as_str()));
    assert_eq!(moved.priority, Some(0));
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let db = open().await;
    let conn = db.connect().await.unwrap();
    assert!(matches!(
        conn.update("/a", 5).await,
        Err(EngineError::Data(_))
    ));
    assert!(matches!(
        conn.attach_listener("/a", "child_exploded").await,
        Err(EngineError::Data(_))
    ));
    assert!(matches!(
        conn.set_priority("/a", -1).await,
        Err(EngineError::Data(_))
    ));
    assert_eq!(db.stats().committed, 0);
    db.shutdown().await.unwrap();
}

// ─── Queries ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_query_membership_transitions() {
    let db = open().await;
    let mut conn = db.connect().await.unwrap();
    conn.set("/users/1", json!({"age": 40}), None).await.unwrap();

    conn.attach_query("/users", "age > 25").await.unwrap();
    let initial = next(&mut conn).await;
    assert_eq!(initial.msg_type, MessageType::QueryChildAdded);
    assert_eq!(initial.name.as_deref(), Some("1"));

    let seq = conn.set("/users/2", json!({"age": 20}), None).await.unwrap();
    db.wait_applied(seq).await.unwrap();
    assert!(drain(&mut conn).is_empty());

    let seq = conn.set("/users/2/age", 30, None).await.unwrap();
    db.wait_applied(seq).await.unwrap();
    let msgs = drain(&mut conn);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg_type, MessageType::QueryChildAdded);
    assert_eq!(msgs[0].path, "/users");
    assert_eq!(msgs[0].name.as_deref(), Some("2"));
    assert_eq!(msgs[0].query.as_deref(), Some("age > 25"));

    let seq = conn.set("/users/2/age", 35, None).await.unwrap();
    db.wait_applied(seq).await.unwrap();
    let msgs = drain(&mut conn);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg_type, MessageType::QueryChildChanged);

    let seq = conn.set("/users/2/age", 20, None).await.unwrap();
    db.wait_applied(seq).await.unwrap();
    let msgs = drain(&mut conn);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg_type, MessageType::QueryChildRemoved);
    assert_eq!(msgs[0].name.as_deref(), Some("2"));

    conn.detach_query("/users", "age > 25").await.unwrap();
    let seq = conn.remove("/users/1").await.unwrap();
    db.wait_applied(seq).await.unwrap();
    assert!(drain(&mut conn).is_empty());
    db.shutdown().await.unwrap();
}

// ─── Broadcast events ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_event_broadcast_is_not_journaled() {
    let db = open().await;
    let mut listener = db.connect().await.unwrap();
    let sender = db.connect().await.unwrap();
    listener.attach_listener("/chat", "event").await.unwrap();
    barrier(&db).await;

    sender.send_event("/chat", json!({"text": "hello"})).await.unwrap();
    let msg = next(&mut listener).await;
    assert_eq!(msg.msg_type, MessageType::Event);
    assert_eq!(msg.path, "/chat");
    assert_eq!(msg.payload, Value::from(json!({"text": "hello"})));

    assert_eq!(db.submit(Event::broadcast("/chat", 1)).await.unwrap(), None);
    assert_eq!(db.get("/chat").await.unwrap(), None);
    assert_eq!(db.stats().journaled, 0);
    db.shutdown().await.unwrap();
}

// ─── Authentication and rules ────────────────────────────────────────────────

fn rules_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("rules.json");
    let rules = json!({
        "rules": {
            ".read": "true",
            ".write": "true",
            "users": { ".read": "false" },
            "private": {
                "$uid": {
                    ".read": "auth.username == $uid",
                    ".write": "auth.username == $uid"
                }
            }
        }
    });
    std::fs::write(&path, rules.to_string()).unwrap();
    path
}

#[tokio::test]
async fn test_authenticated_writes_and_reads() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        rules_path: Some(rules_file(&dir)),
        ..EngineConfig::for_testing()
    };
    let db = Database::open(config).await.unwrap();
    let seq = db
        .submit(Event::set("/users/u1", json!({"username": "ann", "password": "pw"})))
        .await
        .unwrap()
        .unwrap();
    db.wait_applied(seq).await.unwrap();

    let mut ann = db.connect().await.unwrap();
    let mut guest = db.connect().await.unwrap();
    assert!(!ann.authenticate("ann", "wrong").await.unwrap());
    assert!(ann.user().is_none());
    assert!(ann.authenticate("ann", "pw").await.unwrap());
    assert_eq!(
        ann.user().and_then(|u| u.get("username")).and_then(Value::as_str),
        Some("ann")
    );

    ann.attach_listener("/private/ann", "child_added").await.unwrap();
    guest.attach_listener("/private/ann", "child_added").await.unwrap();

    // Anonymous writes under /private/ann are dropped without an error.
    let seq = guest.set("/private/ann/note", "from guest", None).await.unwrap();
    db.wait_applied(seq).await.unwrap();
    assert_eq!(db.get("/private/ann/note").await.unwrap(), None);

    let seq = ann.set("/private/ann/note", "mine", None).await.unwrap();
    db.wait_applied(seq).await.unwrap();
    assert_eq!(
        db.get("/private/ann/note").await.unwrap(),
        Some(Value::from("mine"))
    );

    let msgs = drain(&mut ann);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].payload, Value::from("mine"));
    assert!(drain(&mut guest).is_empty());
    db.shutdown().await.unwrap();
}

// ─── Disconnect events ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_disconnect_events_run_on_close() {
    let db = open().await;
    let mut watcher = db.connect().await.unwrap();
    let conn = db.connect().await.unwrap();

    let seq = conn.set("/presence/ann", "online", None).await.unwrap();
    db.wait_applied(seq).await.unwrap();
    conn.remove_on_disconnect("/presence/ann").await.unwrap();
    conn.set_on_disconnect("/last_seen/ann", "gone", None).await.unwrap();
    assert!(conn.update_on_disconnect("/x", 3).await.is_err());

    watcher.attach_listener("/presence", "child_removed").await.unwrap();
    barrier(&db).await;

    assert_eq!(conn.close().await.unwrap(), 2);
    let removed = next(&mut watcher).await;
    assert_eq!(removed.msg_type, MessageType::ChildRemoved);
    assert_eq!(removed.name.as_deref(), Some("ann"));

    db.wait_applied(2).await.unwrap();
    assert_eq!(db.get("/last_seen/ann").await.unwrap(), Some(Value::from("gone")));
    assert_eq!(db.stats().open_connections, 1);
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dropped_connection_runs_disconnect_events() {
    let db = open().await;
    let conn = db.connect().await.unwrap();
    conn.set_on_disconnect("/status", "offline", None).await.unwrap();
    drop(conn);

    let status = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(value) = db.get("/status").await.unwrap() {
                return value;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(status, Value::from("offline"));
    db.shutdown().await.unwrap();
}

// ─── Backpressure ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_slow_reader_loses_oldest() {
    let config = EngineConfig {
        outbound_capacity: 4,
        ..EngineConfig::for_testing()
    };
    let db = Database::open(config).await.unwrap();
    let mut slow = db.connect().await.unwrap();
    slow.attach_listener("/feed", "child_added").await.unwrap();

    let writer = db.connect().await.unwrap();
    let mut last = 0;
    for i in 0..10 {
        last = writer.set(&format!("/feed/{i:02}"), i, None).await.unwrap();
    }
    db.wait_applied(last).await.unwrap();

    let first = next(&mut slow).await;
    assert_eq!(first.name.as_deref(), Some("06"));
    assert_eq!(slow.outbound_stats().messages_dropped, 6);
    assert_eq!(db.stats().dropped_messages, 6);
    db.shutdown().await.unwrap();
}

// ─── Journal failure ─────────────────────────────────────────────────────────

/// Accepts `limit` appends, then fails every I/O call.
struct FailingJournal {
    inner: MemoryJournal,
    appends: AtomicU64,
    limit: u64,
}

impl DurableLog for FailingJournal {
    fn append(&self, record: &JournalRecord) -> Result<Location, JournalError> {
        if self.appends.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Err(JournalError::Io(std::io::Error::other("disk full")));
        }
        self.inner.append(record)
    }

    fn sync(&self) -> Result<(), JournalError> {
        self.inner.sync()
    }

    fn read_from(&self, from: Location) -> Result<Vec<(Location, Vec<u8>)>, JournalError> {
        self.inner.read_from(from)
    }

    fn last_location(&self) -> Result<Option<Location>, JournalError> {
        self.inner.last_location()
    }

    fn truncate_through(&self, through: Location) -> Result<u64, JournalError> {
        self.inner.truncate_through(through)
    }
}

impl SnapshotStore for FailingJournal {
    fn save_snapshot(&self, sequence: u64, bytes: &[u8]) -> Result<(), JournalError> {
        self.inner.save_snapshot(sequence, bytes)
    }

    fn load_snapshot(&self) -> Result<Option<(u64, Vec<u8>)>, JournalError> {
        self.inner.load_snapshot()
    }
}

#[tokio::test]
async fn test_journal_failure_stops_writes() {
    let storage = Arc::new(FailingJournal {
        inner: MemoryJournal::new(),
        appends: AtomicU64::new(0),
        limit: 1,
    });
    let db = Database::open_with_storage(EngineConfig::for_testing(), storage)
        .await
        .unwrap();
    let conn = db.connect().await.unwrap();

    let ok = conn.set("/a", 1, None).await.unwrap();
    db.wait_applied(ok).await.unwrap();

    let lost = conn.set("/b", 2, None).await.unwrap();
    assert!(matches!(db.wait_applied(lost).await, Err(EngineError::Closed)));
    assert!(!db.is_accepting());
    assert!(matches!(conn.set("/c", 3, None).await, Err(EngineError::Closed)));

    assert_eq!(db.get("/a").await.unwrap(), Some(Value::from(1)));
    assert_eq!(db.get("/b").await.unwrap(), None);
    let stats = db.stats();
    assert_eq!(stats.journaled, 1);
    assert!(!stats.accepting);
    db.shutdown().await.unwrap();
}
