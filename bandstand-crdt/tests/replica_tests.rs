//! Tests for replica.rs: apply/encode, origins and convergence.

use bandstand_crdt::{CrdtError, DocName, Origin, Replica, SongDoc, UpdateSubscription};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::{Arc, Mutex};

fn song_name() -> DocName {
    DocName::song("42").unwrap()
}

fn replica(client_id: u64) -> Replica {
    Replica::with_client_id(song_name(), client_id)
}

// ── apply / encode ──────────────────────────────────────────────

#[test]
fn full_state_reproduces_content() {
    let a = replica(1);
    let song = SongDoc::new(a.clone());
    song.set_title("Blue in Green");
    song.tags().push("jazz");

    let b = replica(2);
    b.apply_update(&a.encode_state_as_update(), &Origin::new("test"))
        .unwrap();

    let copy = SongDoc::new(b);
    assert_eq!(copy.title().as_deref(), Some("Blue in Green"));
    assert_eq!(copy.tags().items(), vec!["jazz".to_string()]);
}

#[test]
fn applying_twice_is_idempotent() {
    let a = replica(1);
    SongDoc::new(a.clone()).tags().push("ballad");
    let update = a.encode_state_as_update();

    let b = replica(2);
    let origin = Origin::new("test");
    b.apply_update(&update, &origin).unwrap();
    b.apply_update(&update, &origin).unwrap();

    assert_eq!(SongDoc::new(b).tags().items(), vec!["ballad".to_string()]);
}

#[test]
fn malformed_update_is_rejected_and_leaves_replica_unchanged() {
    let a = replica(1);
    SongDoc::new(a.clone()).set_title("Autumn Leaves");
    let before = a.encode_state_as_update();

    let result = a.apply_update(&[0xff, 0xff, 0xff, 0x01, 0x02], &Origin::new("test"));
    assert!(matches!(
        result,
        Err(CrdtError::Decode(_)) | Err(CrdtError::Apply(_))
    ));

    assert_eq!(a.encode_state_as_update(), before);
    assert_eq!(SongDoc::new(a).title().as_deref(), Some("Autumn Leaves"));
}

#[test]
fn diff_against_state_vector_brings_peer_up_to_date() {
    let a = replica(1);
    let b = replica(2);
    let origin = Origin::new("test");

    SongDoc::new(a.clone()).set_title("So What");
    b.apply_update(&a.encode_state_as_update(), &origin).unwrap();

    SongDoc::new(a.clone()).tags().push("modal");
    let diff = a.encode_diff(&b.encode_state_vector()).unwrap();
    b.apply_update(&diff, &origin).unwrap();

    assert_eq!(a.encode_state_vector(), b.encode_state_vector());
    assert_eq!(SongDoc::new(b).tags().items(), vec!["modal".to_string()]);
}

#[test]
fn diff_with_empty_state_vector_is_full_state() {
    let a = replica(1);
    SongDoc::new(a.clone()).set_title("Naima");

    let b = replica(2);
    b.apply_update(&a.encode_diff(&[]).unwrap(), &Origin::new("test"))
        .unwrap();
    assert_eq!(SongDoc::new(b).title().as_deref(), Some("Naima"));
}

#[test]
fn diff_with_garbage_state_vector_fails() {
    let a = replica(1);
    assert!(matches!(
        a.encode_diff(&[0xff, 0xff, 0xff]),
        Err(CrdtError::Decode(_))
    ));
}

// ── on_update / origins ─────────────────────────────────────────

#[test]
fn observer_sees_local_and_remote_origins() {
    let a = replica(1);
    let b = replica(2);
    let relay = Origin::new("relay");

    let seen: Arc<Mutex<Vec<(bool, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observed = relay.clone();
    let _sub = b
        .on_update(move |update| {
            sink.lock()
                .unwrap()
                .push((update.is_local(), update.is_from(&observed)));
        })
        .unwrap();

    SongDoc::new(a.clone()).set_title("Giant Steps");
    b.apply_update(&a.encode_state_as_update(), &relay).unwrap();
    SongDoc::new(b.clone()).set_title("Countdown");

    assert_eq!(*seen.lock().unwrap(), vec![(false, true), (true, false)]);
}

#[test]
fn dropping_subscription_stops_notifications() {
    let a = replica(1);
    let count = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&count);
    let sub = a
        .on_update(move |_| {
            *sink.lock().unwrap() += 1;
        })
        .unwrap();

    SongDoc::new(a.clone()).set_title("One");
    drop(sub);
    SongDoc::new(a.clone()).set_title("Two");

    assert_eq!(*count.lock().unwrap(), 1);
}

#[test]
fn subscription_can_be_dropped_on_another_thread() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Replica>();
    assert_send_sync::<UpdateSubscription>();

    let a = replica(1);
    let count = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&count);
    let sub = a
        .on_update(move |_| {
            *sink.lock().unwrap() += 1;
        })
        .unwrap();

    let writer = a.clone();
    std::thread::spawn(move || {
        SongDoc::new(writer).set_title("Inner Urge");
        drop(sub);
    })
    .join()
    .unwrap();
    SongDoc::new(a).set_title("Infant Eyes");

    assert_eq!(*count.lock().unwrap(), 1);
}

#[test]
fn origins_compare_by_label() {
    assert_eq!(Origin::new("ble"), Origin::new("ble"));
    assert_ne!(Origin::new("ble"), Origin::new("relay"));
    assert_eq!(Origin::new("relay").to_string(), "relay");
}

// ── Convergence ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Edit {
    Tag(String),
    Meta(String, String),
    Text(String, String),
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        "[a-z]{1,6}".prop_map(Edit::Tag),
        ("[a-c]", "[a-z]{0,6}").prop_map(|(k, v)| Edit::Meta(k, v)),
        ("[a-b]", "[a-z ]{1,8}").prop_map(|(k, v)| Edit::Text(k, v)),
    ]
}

fn apply_edit(replica: &Replica, edit: &Edit) {
    let song = SongDoc::new(replica.clone());
    match edit {
        Edit::Tag(tag) => song.tags().push(tag.clone()),
        Edit::Meta(key, value) => song.metadata().set(key, value.clone()),
        Edit::Text(id, chunk) => song.arrangements().text(id).unwrap().push(chunk),
    }
}

fn snapshot(replica: &Replica) -> (Vec<String>, Vec<(String, String)>, Vec<(String, String)>) {
    let song = SongDoc::new(replica.clone());
    let arrangements = song.arrangements();
    let texts = arrangements
        .ids()
        .into_iter()
        .map(|id| {
            let text = arrangements.text(&id).unwrap().get();
            (id, text)
        })
        .collect();
    (
        song.tags().items(),
        song.metadata().entries().into_iter().collect(),
        texts,
    )
}

proptest! {
    #[test]
    fn replicas_converge_regardless_of_delivery_order(
        edits_a in prop::collection::vec(edit_strategy(), 0..8),
        edits_b in prop::collection::vec(edit_strategy(), 0..8),
        edits_c in prop::collection::vec(edit_strategy(), 0..8),
        duplicate in any::<bool>(),
    ) {
        let writers = [replica(1), replica(2), replica(3)];
        for (writer, edits) in writers.iter().zip([&edits_a, &edits_b, &edits_c]) {
            for edit in edits {
                apply_edit(writer, edit);
            }
        }
        let updates: Vec<Vec<u8>> = writers.iter().map(Replica::encode_state_as_update).collect();
        let origin = Origin::new("test");

        let forward = replica(10);
        for update in &updates {
            forward.apply_update(update, &origin).unwrap();
        }

        let backward = replica(11);
        for update in updates.iter().rev() {
            backward.apply_update(update, &origin).unwrap();
            if duplicate {
                backward.apply_update(update, &origin).unwrap();
            }
        }

        prop_assert_eq!(snapshot(&forward), snapshot(&backward));
    }
}
