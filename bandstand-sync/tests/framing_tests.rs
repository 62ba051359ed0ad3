//! Tests for ble/framing.rs and ble/reassembly.rs.

use bandstand_sync::ble::Reassembler;
use bandstand_sync::ble::framing::{self, CONTROL, FINAL, FRAGMENT, HELLO, Packet, SYNC_REQUEST};
use bandstand_sync::{PeerInfo, SyncError};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const MTU: usize = 20;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Parses and reassembles `packets` as one peer's stream.
fn reassemble(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut reassembler = Reassembler::new(1 << 20);
    let mut done = None;
    for raw in packets {
        match framing::parse(raw).unwrap() {
            Packet::Whole(body) => done = Some(body.to_vec()),
            Packet::Fragment { last, chunk } => {
                if let Some(message) = reassembler.push("peer", last, chunk).unwrap() {
                    done = Some(message);
                }
            }
            Packet::Control { .. } => panic!("unexpected control packet"),
        }
    }
    assert_eq!(reassembler.in_progress(), 0);
    done.expect("message never completed")
}

// ── fragment ────────────────────────────────────────────────────

#[test]
fn round_trip_at_mtu_boundaries() {
    for len in [0, 1, MTU - 2, MTU - 1, MTU, MTU + 1, 5 * MTU, 5 * MTU + 3] {
        let message = payload(len);
        let packets = framing::fragment(&message, MTU).unwrap();

        let expected = if len <= MTU - 1 { 1 } else { len.div_ceil(MTU - 1) };
        assert_eq!(packets.len(), expected, "packet count for {len} bytes");
        assert!(packets.iter().all(|p| p.len() <= MTU), "oversized packet for {len} bytes");
        assert_eq!(reassemble(&packets), message, "content for {len} bytes");
    }
}

#[test]
fn small_message_is_one_unfragmented_packet() {
    let packets = framing::fragment(b"ii-V-I", MTU).unwrap();
    assert_eq!(packets, vec![b"\x00ii-V-I".to_vec()]);
}

#[test]
fn only_the_last_fragment_is_final() {
    let packets = framing::fragment(&payload(3 * MTU), MTU).unwrap();
    let headers: Vec<u8> = packets.iter().map(|p| p[0]).collect();

    assert_eq!(headers.len(), 4);
    assert!(headers[..3].iter().all(|h| *h == FRAGMENT));
    assert_eq!(headers[3], FRAGMENT | FINAL);
}

#[test]
fn tiny_mtu_is_rejected() {
    assert!(matches!(framing::fragment(b"x", 1), Err(SyncError::Protocol(_))));
    assert!(matches!(framing::sync_request(b"", 0), Err(SyncError::Protocol(_))));
}

// ── sync_request ────────────────────────────────────────────────

#[test]
fn sync_request_carries_state_vector() {
    let packet = framing::sync_request(&[1, 2, 3], MTU).unwrap();
    assert_eq!(packet, vec![CONTROL, SYNC_REQUEST, 1, 2, 3]);
    assert_eq!(
        framing::parse(&packet).unwrap(),
        Packet::Control {
            code: SYNC_REQUEST,
            body: &[1, 2, 3]
        }
    );
}

#[test]
fn oversized_state_vector_asks_for_everything() {
    let packet = framing::sync_request(&payload(MTU), MTU).unwrap();
    assert_eq!(packet, vec![CONTROL, SYNC_REQUEST]);

    let exact = framing::sync_request(&payload(MTU - 2), MTU).unwrap();
    assert_eq!(exact.len(), MTU);
}

// ── hello ───────────────────────────────────────────────────────

fn bill() -> PeerInfo {
    PeerInfo::new("user-bill", Some("Bill Évans".to_string()))
}

fn hello_body(packet: &[u8]) -> &[u8] {
    match framing::parse(packet).unwrap() {
        Packet::Control { code: HELLO, body } => body,
        other => panic!("expected hello, got {other:?}"),
    }
}

#[test]
fn hello_carries_id_and_name() {
    let packet = framing::hello(&bill(), 64).unwrap().unwrap();
    assert_eq!(&packet[..3], &[CONTROL, HELLO, 9]);
    assert_eq!(framing::parse_hello(hello_body(&packet)).unwrap(), bill());

    let anonymous = PeerInfo::new("user-bill", None);
    let packet = framing::hello(&anonymous, 64).unwrap().unwrap();
    assert_eq!(framing::parse_hello(hello_body(&packet)).unwrap(), anonymous);
}

#[test]
fn hello_cuts_the_name_to_fit() {
    // Twelve bytes of header and id leave room for "Bill " and half of "É".
    let packet = framing::hello(&bill(), 18).unwrap().unwrap();
    assert!(packet.len() <= 18);
    let info = framing::parse_hello(hello_body(&packet)).unwrap();
    assert_eq!(info.peer_id, "user-bill");
    assert_eq!(info.display_name.as_deref(), Some("Bill "));

    let bare = framing::hello(&bill(), 12).unwrap().unwrap();
    assert_eq!(framing::parse_hello(hello_body(&bare)).unwrap().display_name, None);
}

#[test]
fn hello_is_skipped_when_the_id_does_not_fit() {
    assert_eq!(framing::hello(&bill(), 11).unwrap(), None);
    let long = PeerInfo::new("u".repeat(300), None);
    assert_eq!(framing::hello(&long, 512).unwrap(), None);
    assert!(framing::hello(&bill(), 1).is_err());
}

#[test]
fn bad_hello_bodies_are_rejected() {
    for body in [&[][..], &[0, b'a'], &[5, b'a', b'b'], &[1, 0xff]] {
        assert!(matches!(framing::parse_hello(body), Err(SyncError::Protocol(_))));
    }
}

// ── parse ───────────────────────────────────────────────────────

#[test]
fn parse_rejects_malformed_headers() {
    assert!(matches!(framing::parse(&[]), Err(SyncError::Protocol(_))));
    assert!(matches!(
        framing::parse(&[CONTROL | FRAGMENT, SYNC_REQUEST]),
        Err(SyncError::Protocol(_))
    ));
    assert!(matches!(framing::parse(&[FINAL, 1]), Err(SyncError::Protocol(_))));
    assert!(matches!(framing::parse(&[CONTROL]), Err(SyncError::Protocol(_))));
}

#[test]
fn parse_reads_fragments() {
    assert_eq!(
        framing::parse(&[FRAGMENT, 9]).unwrap(),
        Packet::Fragment {
            last: false,
            chunk: &[9]
        }
    );
    assert_eq!(
        framing::parse(&[FRAGMENT | FINAL]).unwrap(),
        Packet::Fragment {
            last: true,
            chunk: &[]
        }
    );
}

// ── Reassembler ─────────────────────────────────────────────────

#[test]
fn buffers_are_kept_per_peer() {
    let mut r = Reassembler::new(1024);
    assert_eq!(r.push("a", false, b"Autumn ").unwrap(), None);
    assert_eq!(r.push("b", false, b"Blue ").unwrap(), None);
    assert_eq!(r.in_progress(), 2);
    assert_eq!(r.pending("a"), Some(7));

    assert_eq!(r.push("b", true, b"Bossa").unwrap(), Some(b"Blue Bossa".to_vec()));
    assert_eq!(r.push("a", true, b"Leaves").unwrap(), Some(b"Autumn Leaves".to_vec()));
    assert_eq!(r.in_progress(), 0);
}

#[test]
fn overflow_discards_the_buffer() {
    let mut r = Reassembler::new(8);
    r.push("a", false, b"12345").unwrap();
    assert!(matches!(r.push("a", false, b"6789"), Err(SyncError::Protocol(_))));
    assert_eq!(r.pending("a"), None);

    // The next fragment starts over.
    assert_eq!(r.push("a", true, b"ok").unwrap(), Some(b"ok".to_vec()));
}

#[test]
fn purge_drops_partial_message() {
    let mut r = Reassembler::new(64);
    r.push("a", false, b"half").unwrap();
    assert!(r.purge("a"));
    assert!(!r.purge("a"));
    assert_eq!(r.push("a", true, b"new").unwrap(), Some(b"new".to_vec()));
}

// ── Properties ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn fragmentation_round_trips(
        message in proptest::collection::vec(any::<u8>(), 0..2_000),
        mtu in 2usize..300,
    ) {
        let packets = framing::fragment(&message, mtu).unwrap();
        prop_assert!(packets.iter().all(|p| p.len() <= mtu));
        prop_assert_eq!(reassemble(&packets), message);
    }
}
