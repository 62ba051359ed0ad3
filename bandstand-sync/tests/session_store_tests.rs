//! Tests for the session record stores.

use bandstand_crdt::DocName;
use bandstand_sync::session::{
    ConflictInfo, JsonSessionStore, MemorySessionStore, SessionRecord, SessionStore, ShareKind,
};
use bandstand_sync::{Role, TransportKind};
use bandstand_types::{SessionId, UserId};
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

fn record(id: &str, role: Role) -> SessionRecord {
    let now = Utc::now();
    SessionRecord {
        id: SessionId::new(id).unwrap(),
        host_id: Some(UserId::new()),
        kind: Some(ShareKind::Space { id: "setlist".into() }),
        created_at: now,
        expires_at: now + Duration::hours(4),
        shared: vec![DocName::song("1").unwrap()],
        join_secret: "tango-ember-kilo".into(),
        role,
        transport: TransportKind::Relay,
    }
}

async fn exercise(store: &dyn SessionStore) {
    assert!(store.load_sessions().await.unwrap().is_empty());

    let host = record("harbor-olive-pearl", Role::Host);
    let mut guest = record("amber-delta-kilo", Role::Joiner);
    store.save_session(&host).await.unwrap();
    store.save_session(&guest).await.unwrap();

    guest.shared.push(DocName::song("2").unwrap());
    store.save_session(&guest).await.unwrap();

    let loaded = store.load_sessions().await.unwrap();
    assert_eq!(loaded, vec![guest.clone(), host.clone()]);

    assert!(store.remove_session(&host.id).await.unwrap());
    assert!(!store.remove_session(&host.id).await.unwrap());
    assert_eq!(store.load_sessions().await.unwrap(), vec![guest]);
}

async fn exercise_conflicts(store: &dyn SessionStore) {
    let mut first = ConflictInfo::new("rejected update");
    first.peer_id = Some("bob".into());
    store.record_conflict(first.clone()).await.unwrap();
    for n in 0..300 {
        store
            .record_conflict(ConflictInfo::new(format!("conflict {n}")))
            .await
            .unwrap();
    }

    let conflicts = store.conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 256);
    assert!(!conflicts.contains(&first));
    assert_eq!(conflicts.last().unwrap().reason, "conflict 299");
}

// ── MemorySessionStore ──────────────────────────────────────────

#[tokio::test]
async fn memory_store_saves_and_removes() {
    exercise(&MemorySessionStore::new()).await;
}

#[tokio::test]
async fn memory_store_caps_conflicts() {
    exercise_conflicts(&MemorySessionStore::new()).await;
}

// ── JsonSessionStore ────────────────────────────────────────────

#[tokio::test]
async fn json_store_saves_and_removes() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonSessionStore::new(dir.path().join("state/sessions.json"));
    exercise(&store).await;
    assert!(store.path().exists());
    assert!(!dir.path().join("state/sessions.tmp").exists());
}

#[tokio::test]
async fn json_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.json");
    let saved = record("harbor-olive-pearl", Role::Joiner);
    {
        let store = JsonSessionStore::new(&path);
        store.save_session(&saved).await.unwrap();
        store.record_conflict(ConflictInfo::new("late update")).await.unwrap();
    }

    let reopened = JsonSessionStore::new(&path);
    assert_eq!(reopened.load_sessions().await.unwrap(), vec![saved]);
    assert_eq!(reopened.conflicts().await.unwrap()[0].reason, "late update");

    let json = std::fs::read_to_string(&path).unwrap();
    assert!(json.contains("\"joinSecret\""));
    assert!(json.contains("\"role\": \"joiner\""));
}

#[tokio::test]
async fn json_store_caps_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    exercise_conflicts(&JsonSessionStore::new(dir.path().join("s.json"))).await;
}

#[tokio::test]
async fn corrupt_json_store_reads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.json");
    std::fs::write(&path, b"{not json").unwrap();

    let store = JsonSessionStore::new(&path);
    assert!(store.load_sessions().await.unwrap().is_empty());

    // The next write replaces the corrupt file.
    let saved = record("harbor-olive-pearl", Role::Host);
    store.save_session(&saved).await.unwrap();
    assert_eq!(store.load_sessions().await.unwrap(), vec![saved]);
}

#[test]
fn record_expiry_is_inclusive() {
    let r = record("harbor-olive-pearl", Role::Host);
    assert!(!r.is_expired(r.expires_at - Duration::seconds(1)));
    assert!(r.is_expired(r.expires_at));
    assert!(r.is_host());
    assert_eq!(r.document().to_string(), "session-harbor-olive-pearl");
}
