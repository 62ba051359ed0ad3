//! Tests for the direct peer provider over the in-memory mesh.

mod common;

use bandstand_crdt::{Replica, SongDoc};
use bandstand_sync::{
    DirectProvider, MemoryMesh, MeshRoom, PeerInfo, PeerMesh, ProviderEvent, ProviderEventKind,
    SyncError, SyncProvider,
};
use common::{eventually, song};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};

const ROOM: &str = "0123456789abcdef/song-giant-steps";

fn member(mesh: &MemoryMesh, name: &str, replica: Replica) -> DirectProvider {
    DirectProvider::new(
        replica,
        ROOM,
        PeerInfo::new(name, Some(name.to_string())),
        Arc::new(mesh.clone()),
    )
}

fn title(replica: &Replica) -> Option<String> {
    SongDoc::new(replica.clone()).title()
}

#[tokio::test]
async fn members_converge_both_ways() {
    common::init_tracing();
    let mesh = MemoryMesh::new();
    let a_replica = song("giant-steps");
    let b_replica = song("giant-steps");
    let a = member(&mesh, "alice", a_replica.clone());
    let b = member(&mesh, "bob", b_replica.clone());
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    SongDoc::new(a_replica.clone()).set_title("Giant Steps");
    assert!(eventually(|| title(&b_replica).as_deref() == Some("Giant Steps")).await);

    SongDoc::new(b_replica).tags().push("bebop");
    assert!(eventually(|| SongDoc::new(a_replica.clone()).tags().contains("bebop")).await);
    assert!(a.is_synced() && b.is_synced());
}

#[tokio::test]
async fn late_joiner_catches_up_and_shares_offline_edits() {
    let mesh = MemoryMesh::new();
    let a_replica = song("giant-steps");
    SongDoc::new(a_replica.clone()).set_title("Giant Steps");
    let a = member(&mesh, "alice", a_replica.clone());
    a.connect().await.unwrap();

    let b_replica = song("giant-steps");
    SongDoc::new(b_replica.clone()).tags().push("offline");
    let b = member(&mesh, "bob", b_replica.clone());
    b.connect().await.unwrap();

    assert!(eventually(|| title(&b_replica).as_deref() == Some("Giant Steps")).await);
    assert!(eventually(|| SongDoc::new(a_replica.clone()).tags().contains("offline")).await);
}

#[tokio::test]
async fn peers_track_joins_and_leaves() {
    let mesh = MemoryMesh::new();
    let a = member(&mesh, "alice", song("giant-steps"));
    let b = member(&mesh, "bob", song("giant-steps"));
    let c = member(&mesh, "carol", song("giant-steps"));

    let left = Arc::new(Mutex::new(Vec::new()));
    {
        let left = Arc::clone(&left);
        a.events().subscribe(ProviderEventKind::PeerDisconnected, move |event| {
            if let ProviderEvent::PeerDisconnected(peer) = event {
                left.lock().unwrap().push(peer.peer_id.clone());
            }
            Ok(())
        });
    }

    a.connect().await.unwrap();
    b.connect().await.unwrap();
    c.connect().await.unwrap();
    assert!(eventually(|| a.peers().len() == 2 && c.peers().len() == 2).await);
    let ids: Vec<String> = c.peers().into_iter().map(|p| p.peer_id).collect();
    assert_eq!(ids, vec!["alice".to_string(), "bob".to_string()]);
    assert_eq!(mesh.members(ROOM).await, vec!["alice", "bob", "carol"]);

    b.disconnect().await.unwrap();
    assert!(eventually(|| a.peers().len() == 1).await);
    assert_eq!(*left.lock().unwrap(), vec!["bob".to_string()]);
    assert!(b.peers().is_empty());
    assert!(!b.is_connected());

    a.disconnect().await.unwrap();
    c.disconnect().await.unwrap();
    assert!(mesh.members(ROOM).await.is_empty());
}

#[tokio::test]
async fn duplicate_member_is_rejected() {
    let mesh = MemoryMesh::new();
    let a = member(&mesh, "alice", song("giant-steps"));
    let again = member(&mesh, "alice", song("giant-steps"));
    a.connect().await.unwrap();

    assert!(matches!(again.connect().await, Err(SyncError::ConnectionFailed(_))));
    assert!(!again.is_connected());
}

#[tokio::test]
async fn unknown_tag_is_reported_as_protocol_error() {
    let mesh = MemoryMesh::new();
    let a_replica = song("giant-steps");
    let a = member(&mesh, "alice", a_replica.clone());
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = Arc::clone(&errors);
        a.events().subscribe(ProviderEventKind::Error, move |event| {
            errors.lock().unwrap().push(event.clone());
            Ok(())
        });
    }
    a.connect().await.unwrap();

    let rogue = mesh
        .open(ROOM, &PeerInfo::new("rogue", None))
        .await
        .unwrap();
    rogue.send(&[0x7f, 1, 2]).await.unwrap();
    rogue.send(&[]).await.unwrap();

    assert!(eventually(|| errors.lock().unwrap().len() == 2).await);
    assert_eq!(title(&a_replica), None);
}
