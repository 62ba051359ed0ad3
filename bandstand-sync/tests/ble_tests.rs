//! Tests for the Bluetooth LE provider over the in-memory air.

mod common;

use bandstand_crdt::{Replica, SongDoc};
use bandstand_sync::ble::{BleDevice, BleLink, BleProvider, BleRadio, MemoryAir, framing, room_tag};
use bandstand_sync::{
    BleConfig, PeerInfo, ProviderEvent, ProviderEventKind, Role, SyncError, SyncProvider,
};
use common::{eventually, settle, song};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};

const ROOM: &str = "0123456789abcdef/song-autumn";

fn provider(
    air: &MemoryAir,
    device: &str,
    mtu: usize,
    role: Role,
    replica: Replica,
) -> BleProvider {
    let radio = Arc::new(air.radio(device, mtu));
    BleProvider::new(replica, ROOM, role, radio, BleConfig::default())
}

fn record_events(provider: &BleProvider) -> Arc<Mutex<Vec<ProviderEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        ProviderEventKind::PeerConnected,
        ProviderEventKind::PeerDisconnected,
        ProviderEventKind::Status,
        ProviderEventKind::Synced,
        ProviderEventKind::Error,
    ] {
        let seen = Arc::clone(&seen);
        provider.events().subscribe(kind, move |event| {
            seen.lock().unwrap().push(event.clone());
            Ok(())
        });
    }
    seen
}

fn title(replica: &Replica) -> Option<String> {
    SongDoc::new(replica.clone()).title()
}

fn count_errors(events: &Mutex<Vec<ProviderEvent>>) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, ProviderEvent::Error { .. }))
        .count()
}

/// Links a bare radio named `device` to `host`.
async fn rogue_link(air: &MemoryAir, device: &str, host: &BleProvider) -> Arc<dyn BleLink> {
    let target = BleDevice {
        id: "host".to_string(),
        local_name: host.local_name().to_string(),
    };
    air.radio(device, 64).connect(&target).await.unwrap()
}

// ── Naming ──────────────────────────────────────────────────────

#[tokio::test]
async fn host_advertises_prefixed_room_tag() {
    let air = MemoryAir::new();
    let host = provider(&air, "host", 64, Role::Host, song("autumn"));
    assert_eq!(host.local_name(), format!("BS-{}", room_tag(ROOM)));
    assert_eq!(room_tag(ROOM).len(), 8);

    host.connect().await.unwrap();
    assert_eq!(air.advertised_names(), vec![host.local_name().to_string()]);

    host.disconnect().await.unwrap();
    assert!(air.advertised_names().is_empty());
}

// ── Sync ────────────────────────────────────────────────────────

#[tokio::test]
async fn large_updates_are_fragmented_and_converge() {
    common::init_tracing();
    let air = MemoryAir::new();
    let host_replica = song("autumn");
    let joiner_replica = song("autumn");
    let long_title = "Autumn Leaves (".to_string() + &"la ".repeat(300) + ")";
    SongDoc::new(host_replica.clone()).set_title(long_title.clone());

    let host = provider(&air, "host", 23, Role::Host, host_replica.clone());
    let joiner = provider(&air, "j1", 23, Role::Joiner, joiner_replica.clone());
    let joiner_events = record_events(&joiner);
    host.connect().await.unwrap();
    joiner.connect().await.unwrap();

    assert!(eventually(|| title(&joiner_replica).as_deref() == Some(long_title.as_str())).await);
    assert!(joiner.is_connected());
    assert!(joiner.is_synced());
    assert!(joiner_events.lock().unwrap().contains(&ProviderEvent::Synced));

    SongDoc::new(joiner_replica.clone()).tags().push("standard");
    assert!(eventually(|| SongDoc::new(host_replica.clone()).tags().contains("standard")).await);
}

#[tokio::test]
async fn host_relays_between_joiners() {
    let air = MemoryAir::new();
    let host_replica = song("autumn");
    let a_replica = song("autumn");
    let b_replica = song("autumn");

    let host = provider(&air, "host", 64, Role::Host, host_replica.clone());
    let a = provider(&air, "a", 64, Role::Joiner, a_replica.clone());
    let b = provider(&air, "b", 64, Role::Joiner, b_replica.clone());
    host.connect().await.unwrap();
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    assert!(eventually(|| host.peers().len() == 2).await);

    SongDoc::new(a_replica.clone()).set_title("Solar");
    assert!(eventually(|| title(&b_replica).as_deref() == Some("Solar")).await);
    assert_eq!(title(&host_replica).as_deref(), Some("Solar"));

    // Concurrent edits from both ends settle on the same state.
    SongDoc::new(b_replica.clone()).tags().push("miles");
    SongDoc::new(host_replica.clone()).tags().push("bebop");
    assert!(
        eventually(|| {
            let tags = |r: &Replica| {
                let mut t = SongDoc::new(r.clone()).tags().items();
                t.sort();
                t
            };
            let expected = vec!["bebop".to_string(), "miles".to_string()];
            [&a_replica, &b_replica, &host_replica]
                .iter()
                .all(|r| tags(r) == expected)
        })
        .await
    );
}

// ── Peer loss ───────────────────────────────────────────────────

#[tokio::test]
async fn severed_link_removes_peer_and_buffer() {
    let air = MemoryAir::new();
    let host = provider(&air, "host", 32, Role::Host, song("autumn"));
    let joiner = provider(&air, "j1", 32, Role::Joiner, song("autumn"));
    let host_events = record_events(&host);
    host.connect().await.unwrap();
    joiner.connect().await.unwrap();
    assert!(eventually(|| host.is_connected() && joiner.is_connected()).await);

    assert_eq!(air.sever("host", "j1"), 1);

    assert!(eventually(|| !host.is_connected() && !joiner.is_connected()).await);
    assert!(host.peers().is_empty());
    assert_eq!(host.pending_bytes("j1"), None);
    let events = host_events.lock().unwrap().clone();
    assert!(events.iter().any(|e| matches!(
        e,
        ProviderEvent::PeerDisconnected(p) if p.peer_id == "j1"
    )));
    assert!(events.contains(&ProviderEvent::Status { connected: false }));
}

#[tokio::test]
async fn relinked_peer_starts_a_fresh_message() {
    let air = MemoryAir::new();
    let host_replica = song("autumn");
    let host = provider(&air, "host", 64, Role::Host, host_replica.clone());
    host.connect().await.unwrap();

    let link = rogue_link(&air, "rogue", &host).await;
    link.write(&[0x80, 0x01, 0x02, 0x03]).await.unwrap();
    assert!(eventually(|| host.pending_bytes("rogue") == Some(3)).await);

    // Severed mid-message.
    assert_eq!(air.sever("host", "rogue"), 1);
    assert!(eventually(|| host.peers().is_empty()).await);
    assert_eq!(host.pending_bytes("rogue"), None);

    // Same device id, new message split across fragments.
    let source = song("autumn");
    SongDoc::new(source.clone()).set_title("All the Things You Are");
    let update = source.encode_diff(&[]).unwrap();
    let packets = framing::fragment(&update, 8).unwrap();
    assert!(packets.len() > 1);

    let link = rogue_link(&air, "rogue", &host).await;
    for packet in &packets {
        link.write(packet).await.unwrap();
    }
    assert!(
        eventually(|| title(&host_replica).as_deref() == Some("All the Things You Are")).await
    );
    assert_eq!(host.pending_bytes("rogue"), None);
    assert_eq!(host.peers().len(), 1);
}

#[tokio::test]
async fn link_closed_on_arrival_leaves_no_peer() {
    let air = MemoryAir::new();
    let host = provider(&air, "host", 64, Role::Host, song("autumn"));
    let host_events = record_events(&host);
    host.connect().await.unwrap();

    let link = rogue_link(&air, "rogue", &host).await;
    link.close().await;

    assert!(
        eventually(|| {
            host_events
                .lock()
                .unwrap()
                .contains(&ProviderEvent::Status { connected: false })
        })
        .await
    );
    settle().await;
    assert!(host.peers().is_empty());
    assert!(!host.is_connected());
    assert_eq!(host.pending_bytes("rogue"), None);
    let events = host_events.lock().unwrap().clone();
    let statuses: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ProviderEvent::Status { .. }))
        .collect();
    assert_eq!(
        statuses,
        vec![
            &ProviderEvent::Status { connected: true },
            &ProviderEvent::Status { connected: false }
        ]
    );
}

// ── Identity ────────────────────────────────────────────────────

#[tokio::test]
async fn hello_announces_the_user_not_the_radio() {
    let air = MemoryAir::new();
    let host = provider(&air, "host", 64, Role::Host, song("autumn"));
    let bill = PeerInfo::new("user-bill", Some("Bill".to_string()));
    let joiner =
        provider(&air, "radio-7", 64, Role::Joiner, song("autumn")).with_local(bill.clone());
    let host_events = record_events(&host);
    host.connect().await.unwrap();
    joiner.connect().await.unwrap();

    assert!(eventually(|| host.peers() == vec![bill.clone()]).await);
    let events = host_events.lock().unwrap().clone();
    let announced: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProviderEvent::PeerConnected(p) => Some(p.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(announced, vec![bill.clone()]);

    air.sever("host", "radio-7");
    assert!(
        eventually(|| {
            host_events
                .lock()
                .unwrap()
                .contains(&ProviderEvent::PeerDisconnected(bill.clone()))
        })
        .await
    );
}

#[tokio::test]
async fn peer_without_hello_is_known_by_its_radio() {
    let air = MemoryAir::new();
    let host = provider(&air, "host", 64, Role::Host, song("autumn"));
    let host_events = record_events(&host);
    host.connect().await.unwrap();

    let link = rogue_link(&air, "rogue", &host).await;
    // A bad hello still counts as the peer's first packet.
    link.write(&[framing::CONTROL, framing::HELLO, 0]).await.unwrap();
    let radio_only = ProviderEvent::PeerConnected(PeerInfo::new("rogue", None));
    assert!(eventually(|| host_events.lock().unwrap().contains(&radio_only)).await);
    assert_eq!(count_errors(&host_events), 1);

    // A later hello does not rename it.
    let late = framing::hello(&PeerInfo::new("user-x", None), 64).unwrap().unwrap();
    link.write(&late).await.unwrap();
    settle().await;
    assert_eq!(host.peers(), vec![PeerInfo::new("rogue", None)]);
}

#[tokio::test]
async fn host_keeps_advertising_after_losing_a_peer() {
    let air = MemoryAir::new();
    let host_replica = song("autumn");
    let host = provider(&air, "host", 64, Role::Host, host_replica.clone());
    let first = provider(&air, "j1", 64, Role::Joiner, song("autumn"));
    host.connect().await.unwrap();
    first.connect().await.unwrap();
    assert!(eventually(|| host.is_connected()).await);
    air.sever("host", "j1");
    assert!(eventually(|| !host.is_connected()).await);

    let second_replica = song("autumn");
    let second = provider(&air, "j2", 64, Role::Joiner, second_replica.clone());
    second.connect().await.unwrap();
    SongDoc::new(host_replica).set_title("Nardis");
    assert!(eventually(|| title(&second_replica).as_deref() == Some("Nardis")).await);
}

#[tokio::test]
async fn disconnect_closes_links_and_scans() {
    let air = MemoryAir::new();
    let host = provider(&air, "host", 64, Role::Host, song("autumn"));
    let joiner = provider(&air, "j1", 64, Role::Joiner, song("autumn"));
    host.connect().await.unwrap();
    joiner.connect().await.unwrap();
    assert!(eventually(|| air.open_links() == 1).await);

    joiner.disconnect().await.unwrap();
    assert!(!joiner.is_connected());
    assert!(eventually(|| !host.is_connected()).await);
    assert_eq!(air.active_scans(), 0);
    assert_eq!(air.open_links(), 0);

    // Disconnecting twice is harmless.
    joiner.disconnect().await.unwrap();
}

#[tokio::test]
async fn joiner_scan_waits_for_a_host() {
    let air = MemoryAir::new();
    let joiner_replica = song("autumn");
    let joiner = provider(&air, "j1", 64, Role::Joiner, joiner_replica.clone());
    joiner.connect().await.unwrap();
    settle().await;
    assert_eq!(air.active_scans(), 1);
    assert!(!joiner.is_connected());

    let host_replica = song("autumn");
    SongDoc::new(host_replica.clone()).set_title("Late Host");
    let host = provider(&air, "host", 64, Role::Host, host_replica);
    host.connect().await.unwrap();
    assert!(eventually(|| title(&joiner_replica).as_deref() == Some("Late Host")).await);
    assert_eq!(air.active_scans(), 0);
}

// ── Availability ────────────────────────────────────────────────

#[tokio::test]
async fn unavailable_radio_is_reported_once() {
    let air = MemoryAir::new();
    let radio = air.radio("host", 64);
    radio.set_available(false);
    let host = BleProvider::new(
        song("autumn"),
        ROOM,
        Role::Host,
        Arc::new(radio.clone()),
        BleConfig::default(),
    );
    let events = record_events(&host);

    for _ in 0..3 {
        assert!(matches!(host.connect().await, Err(SyncError::TransportUnavailable(_))));
    }
    assert_eq!(count_errors(&events), 1);
    assert!(!host.is_connected());

    radio.set_available(true);
    host.connect().await.unwrap();
    assert_eq!(air.advertised_names().len(), 1);
}

#[tokio::test]
async fn malformed_packet_leaves_replica_untouched() {
    let air = MemoryAir::new();
    let host_replica = song("autumn");
    SongDoc::new(host_replica.clone()).set_title("Stella");
    let host = provider(&air, "host", 64, Role::Host, host_replica.clone());
    let host_events = record_events(&host);
    host.connect().await.unwrap();

    let link = rogue_link(&air, "rogue", &host).await;
    assert!(eventually(|| host.peers().len() == 1).await);
    let before = host_replica.encode_state_vector();

    // Fragment of garbage, then a final fragment completing it.
    link.write(&[0x80, 0xff, 0xfe]).await.unwrap();
    link.write(&[0xc0, 0x01]).await.unwrap();
    link.write(&[]).await.unwrap();

    assert!(eventually(|| count_errors(&host_events) >= 2).await);
    assert_eq!(host_replica.encode_state_vector(), before);
    assert_eq!(title(&host_replica).as_deref(), Some("Stella"));
    assert_eq!(host.pending_bytes("rogue"), None);
}
