//! Tests for events.rs: ordering, isolation, once, dispose.

use bandstand_sync::{BusEvent, EventBus, SubscriptionId};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
enum Cue {
    Count(u32),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CueKind {
    Count,
    Stop,
}

impl BusEvent for Cue {
    type Kind = CueKind;

    fn kind(&self) -> CueKind {
        match self {
            Cue::Count(_) => CueKind::Count,
            Cue::Stop => CueKind::Stop,
        }
    }
}

fn recorder() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

// ── Delivery ────────────────────────────────────────────────────

#[test]
fn handlers_run_in_registration_order() {
    let bus = EventBus::<Cue>::new();
    let seen = recorder();
    for name in ["first", "second", "third"] {
        let seen = Arc::clone(&seen);
        bus.subscribe(CueKind::Count, move |_| {
            seen.lock().unwrap().push(name.to_string());
            Ok(())
        });
    }

    assert_eq!(bus.publish(&Cue::Count(1)), 3);
    assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn events_reach_only_their_kind() {
    let bus = EventBus::<Cue>::new();
    let seen = recorder();
    let s = Arc::clone(&seen);
    bus.subscribe(CueKind::Stop, move |event| {
        s.lock().unwrap().push(format!("{event:?}"));
        Ok(())
    });

    assert_eq!(bus.publish(&Cue::Count(4)), 0);
    assert_eq!(bus.publish(&Cue::Stop), 1);
    assert_eq!(*seen.lock().unwrap(), vec!["Stop"]);
}

#[test]
fn handler_receives_the_event() {
    let bus = EventBus::<Cue>::new();
    let total = Arc::new(Mutex::new(0));
    let t = Arc::clone(&total);
    bus.subscribe(CueKind::Count, move |event| {
        if let Cue::Count(n) = event {
            *t.lock().unwrap() += n;
        }
        Ok(())
    });

    bus.publish(&Cue::Count(2));
    bus.publish(&Cue::Count(3));
    assert_eq!(*total.lock().unwrap(), 5);
}

// ── Isolation ───────────────────────────────────────────────────

#[test]
fn failing_handler_does_not_stop_later_handlers() {
    let bus = EventBus::<Cue>::new();
    let seen = recorder();
    bus.subscribe(CueKind::Count, |_| Err("tuner offline".into()));
    let s = Arc::clone(&seen);
    bus.subscribe(CueKind::Count, move |_| {
        s.lock().unwrap().push("after".to_string());
        Ok(())
    });

    assert_eq!(bus.publish(&Cue::Count(1)), 1);
    assert_eq!(*seen.lock().unwrap(), vec!["after"]);
}

#[test]
fn panicking_handler_is_contained() {
    let bus = EventBus::<Cue>::new();
    let seen = recorder();
    bus.subscribe(CueKind::Count, |_| panic!("string broke"));
    let s = Arc::clone(&seen);
    bus.subscribe(CueKind::Count, move |_| {
        s.lock().unwrap().push("after".to_string());
        Ok(())
    });

    assert_eq!(bus.publish(&Cue::Count(1)), 1);
    assert_eq!(*seen.lock().unwrap(), vec!["after"]);
    // The bus stays usable.
    assert_eq!(bus.publish(&Cue::Count(2)), 1);
}

// ── Registration ────────────────────────────────────────────────

#[test]
fn subscribe_once_fires_a_single_time() {
    let bus = EventBus::<Cue>::new();
    let count = Arc::new(Mutex::new(0));
    let c = Arc::clone(&count);
    bus.subscribe_once(CueKind::Stop, move |_| {
        *c.lock().unwrap() += 1;
        Ok(())
    });

    assert_eq!(bus.handler_count(CueKind::Stop), 1);
    bus.publish(&Cue::Stop);
    bus.publish(&Cue::Stop);
    assert_eq!(*count.lock().unwrap(), 1);
    assert_eq!(bus.handler_count(CueKind::Stop), 0);
}

#[test]
fn unsubscribe_reports_whether_registered() {
    let bus = EventBus::<Cue>::new();
    let id = bus.subscribe(CueKind::Count, |_| Ok(()));

    assert!(!bus.unsubscribe(CueKind::Stop, id));
    assert!(bus.unsubscribe(CueKind::Count, id));
    assert!(!bus.unsubscribe(CueKind::Count, id));
    assert_eq!(bus.publish(&Cue::Count(1)), 0);
}

#[test]
fn handler_may_unsubscribe_itself_during_publish() {
    let bus = Arc::new(EventBus::<Cue>::new());
    let calls = Arc::new(Mutex::new(0));
    let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

    let id = {
        let bus_ref = Arc::downgrade(&bus);
        let calls = Arc::clone(&calls);
        let own_id = Arc::clone(&own_id);
        bus.subscribe(CueKind::Count, move |_| {
            *calls.lock().unwrap() += 1;
            if let (Some(bus), Some(id)) = (bus_ref.upgrade(), *own_id.lock().unwrap()) {
                bus.unsubscribe(CueKind::Count, id);
            }
            Ok(())
        })
    };
    *own_id.lock().unwrap() = Some(id);

    bus.publish(&Cue::Count(1));
    bus.publish(&Cue::Count(2));
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[test]
fn handler_added_during_publish_runs_from_the_next_publish() {
    let bus = Arc::new(EventBus::<Cue>::new());
    let seen = recorder();

    let bus_ref = Arc::downgrade(&bus);
    let s = Arc::clone(&seen);
    bus.subscribe_once(CueKind::Count, move |_| {
        if let Some(bus) = bus_ref.upgrade() {
            let s = Arc::clone(&s);
            bus.subscribe(CueKind::Count, move |_| {
                s.lock().unwrap().push("late".to_string());
                Ok(())
            });
        }
        Ok(())
    });

    assert_eq!(bus.publish(&Cue::Count(1)), 1);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(bus.publish(&Cue::Count(2)), 1);
    assert_eq!(*seen.lock().unwrap(), vec!["late"]);
}

// ── Dispose ─────────────────────────────────────────────────────

#[test]
fn dispose_drops_handlers_and_ignores_later_calls() {
    let bus = EventBus::<Cue>::new();
    bus.subscribe(CueKind::Count, |_| Ok(()));
    bus.dispose();

    assert!(bus.is_disposed());
    assert_eq!(bus.handler_count(CueKind::Count), 0);
    assert_eq!(bus.publish(&Cue::Count(1)), 0);

    bus.subscribe(CueKind::Count, |_| Ok(()));
    assert_eq!(bus.handler_count(CueKind::Count), 0);
}
