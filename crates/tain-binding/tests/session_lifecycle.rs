#![forbid(unsafe_code)]

//! Integration tests: session lifecycle, modes, and diagnostics.

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;

use tain_binding::{
    BindError, Binder, BindingMode, BindingOptions, BindingSession, ContextPair, DiagKind,
    SessionPhase,
};
use tain_core::{HostValue, StoreError, StoreValue};
use tain_harness::{CapturedDiags, RecordingStore, StubCommand, StubList, StubObject, same_value};

fn simple_object() -> std::sync::Arc<StubObject> {
    let obj = StubObject::new();
    obj.insert_rw("x", 1i64);
    obj
}

fn bind_mode(
    root: HostValue,
    store: &RecordingStore,
    mode: BindingMode,
) -> (Binder, BindingSession) {
    let binder = Binder::new(ContextPair::direct());
    let session = binder
        .bind(
            root,
            store.client(),
            BindingOptions {
                mode,
                ..BindingOptions::default()
            },
        )
        .expect("bind");
    (binder, session)
}

fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

// ============================================================================
// Phases and disposal
// ============================================================================

#[test]
fn bind_reports_bound_phase() {
    let obj = simple_object();
    let store = RecordingStore::new();
    let (_binder, session) = bind_mode(obj.as_value(), &store, BindingMode::TwoWay);

    assert_eq!(session.phase(), SessionPhase::Bound);
    assert_eq!(session.mode(), BindingMode::TwoWay);
    let stats = session.stats().expect("stats");
    assert_eq!(stats.phase, SessionPhase::Bound);
    assert_eq!(stats.tracked_nodes, 1);
}

#[test]
fn dispose_releases_store_and_listeners() {
    let obj = simple_object();
    let store = RecordingStore::new();
    let (_binder, session) = bind_mode(obj.as_value(), &store, BindingMode::TwoWay);
    assert_eq!(obj.subscriber_count(), 1);

    session.dispose();

    assert_eq!(session.phase(), SessionPhase::Disposed);
    assert_eq!(store.live_handles(), 0);
    assert_eq!(obj.subscriber_count(), 0);
}

#[test]
fn dispose_is_idempotent() {
    let obj = simple_object();
    let store = RecordingStore::new();
    let (_binder, session) = bind_mode(obj.as_value(), &store, BindingMode::TwoWay);

    session.dispose();
    store.clear_events();
    session.dispose();

    assert_eq!(session.phase(), SessionPhase::Disposed);
    assert!(store.events().is_empty());
}

#[test]
fn dropping_the_session_disposes_it() {
    let obj = simple_object();
    let store = RecordingStore::new();
    {
        let (_binder, _session) = bind_mode(obj.as_value(), &store, BindingMode::TwoWay);
        assert_eq!(obj.subscriber_count(), 1);
    }
    assert_eq!(store.live_handles(), 0);
    assert_eq!(obj.subscriber_count(), 0);
}

#[test]
fn mutations_after_dispose_are_inert() {
    let obj = simple_object();
    let store = RecordingStore::new();
    let (_binder, session) = bind_mode(obj.as_value(), &store, BindingMode::TwoWay);
    let root = session.root_handle();
    session.dispose();

    // Host side: no subscribers left, nothing reaches the store.
    obj.set("x", 9i64);
    assert_eq!(store.live_handles(), 0);

    // Script side: the slot is gone.
    assert!(matches!(
        store.script_set(root, "x", StoreValue::Scalar(2i64.into())),
        Err(StoreError::UnknownHandle(_))
    ));
    assert!(same_value(&obj.get("x").expect("x"), &HostValue::from(9i64)));
}

// ============================================================================
// Root registry
// ============================================================================

#[test]
fn live_root_cannot_be_bound_twice() {
    let obj = simple_object();
    let binder = Binder::new(ContextPair::direct());
    let store_a = RecordingStore::new();
    let session = binder
        .bind(obj.as_value(), store_a.client(), BindingOptions::default())
        .expect("first bind");

    let store_b = RecordingStore::new();
    let err = binder
        .bind(obj.as_value(), store_b.client(), BindingOptions::default())
        .expect_err("duplicate bind");
    assert!(matches!(err, BindError::AlreadyBound));

    session.dispose();
    let store_c = RecordingStore::new();
    let rebound = binder
        .bind(obj.as_value(), store_c.client(), BindingOptions::default())
        .expect("rebind after dispose");
    assert_eq!(rebound.phase(), SessionPhase::Bound);
    assert_eq!(store_c.live_handles(), 1);
}

#[test]
fn distinct_roots_share_one_binder() {
    let first = simple_object();
    let second = StubObject::new();
    second.insert_rw("y", 2i64);
    let binder = Binder::new(ContextPair::direct());
    let store_a = RecordingStore::new();
    let store_b = RecordingStore::new();

    let session_a = binder
        .bind(first.as_value(), store_a.client(), BindingOptions::default())
        .expect("bind first");
    let session_b = binder
        .bind(second.as_value(), store_b.client(), BindingOptions::default())
        .expect("bind second");

    first.set("x", 5i64);
    second.set("y", 6i64);
    assert_eq!(
        store_a.property(session_a.root_handle(), "x"),
        Some(StoreValue::Scalar(5i64.into()))
    );
    assert_eq!(
        store_b.property(session_b.root_handle(), "y"),
        Some(StoreValue::Scalar(6i64.into()))
    );

    session_a.dispose();
    // Disposing one leaves the other live.
    second.set("y", 7i64);
    assert_eq!(
        store_b.property(session_b.root_handle(), "y"),
        Some(StoreValue::Scalar(7i64.into()))
    );
}

// ============================================================================
// Modes
// ============================================================================

#[test]
fn one_time_transfers_once_and_goes_quiet() {
    let obj = simple_object();
    let store = RecordingStore::chatty();
    let (_binder, session) = bind_mode(obj.as_value(), &store, BindingMode::OneTime);
    let root = session.root_handle();
    let diags = CapturedDiags::new();
    session.set_diag_sink(Some(diags.boxed()));

    assert_eq!(store.export(root), json!({ "__readonly": false, "x": 1 }));
    let stats = session.stats().expect("stats");
    assert_eq!(stats.live_listeners, 0);
    assert_eq!(stats.observed_handles, 0);
    assert_eq!(obj.subscriber_count(), 0);
    store.clear_events();

    // Host changes stop at the missing listener.
    obj.set("x", 2i64);
    assert!(store.events().is_empty());

    // Script changes stop at the mode gate.
    store
        .script_set(root, "x", StoreValue::Scalar(3i64.into()))
        .expect("script set");
    assert!(obj.set_log().is_empty());
    assert_eq!(diags.kinds(), vec![DiagKind::ModeSuppressed]);
}

#[test]
fn one_way_streams_host_changes_only() {
    let obj = simple_object();
    let store = RecordingStore::chatty();
    let (_binder, session) = bind_mode(obj.as_value(), &store, BindingMode::OneWay);
    let root = session.root_handle();
    let diags = CapturedDiags::new();
    session.set_diag_sink(Some(diags.boxed()));

    let stats = session.stats().expect("stats");
    assert_eq!(stats.live_listeners, 1);
    assert_eq!(stats.observed_handles, 0);

    obj.set("x", 2i64);
    assert_eq!(store.property(root, "x"), Some(StoreValue::Scalar(2i64.into())));

    store
        .script_set(root, "x", StoreValue::Scalar(9i64.into()))
        .expect("script set");
    assert!(obj.set_log().is_empty());
    assert_eq!(diags.kinds(), vec![DiagKind::ModeSuppressed]);
}

#[test]
fn one_way_to_source_streams_script_changes_only() {
    let obj = simple_object();
    let store = RecordingStore::new();
    let (_binder, session) = bind_mode(obj.as_value(), &store, BindingMode::OneWayToSource);
    let root = session.root_handle();

    let stats = session.stats().expect("stats");
    assert_eq!(stats.live_listeners, 0);
    assert!(stats.observed_handles > 0);
    assert_eq!(obj.subscriber_count(), 0);
    store.clear_events();

    store
        .script_set(root, "x", StoreValue::Scalar(9i64.into()))
        .expect("script set");
    assert!(same_value(&obj.get("x").expect("x"), &HostValue::from(9i64)));

    // Host changes never reach the store in this mode.
    obj.set("x", 11i64);
    assert_eq!(store.property(root, "x"), Some(StoreValue::Scalar(9i64.into())));
}

// ============================================================================
// Diagnostics
// ============================================================================

#[test]
fn diagnostics_ring_keeps_the_newest() {
    let obj = simple_object();
    let store = RecordingStore::new();
    let binder = Binder::new(ContextPair::direct());
    let session = binder
        .bind(
            obj.as_value(),
            store.client(),
            BindingOptions {
                diagnostics_capacity: 2,
                ..BindingOptions::default()
            },
        )
        .expect("bind");
    let root = session.root_handle();
    let diags = CapturedDiags::new();
    session.set_diag_sink(Some(diags.boxed()));

    for name in ["a", "b", "c"] {
        store
            .script_set(root, name, StoreValue::Scalar(1i64.into()))
            .expect("script set");
    }

    // The sink saw all three; the ring kept the last two.
    assert_eq!(diags.len(), 3);
    let ring = session.diagnostics();
    assert_eq!(ring.len(), 2);
    assert!(ring.iter().all(|d| d.kind == DiagKind::UnknownProperty));
    assert!(ring[0].detail.contains("\"b\""));
    assert!(ring[1].detail.contains("\"c\""));
}

#[test]
fn stats_count_listeners_and_observation() {
    let frozen = StubObject::new();
    frozen.insert_ro("n", 1i64);
    let list = StubList::new();
    let go = StubCommand::new();
    let obj = StubObject::new();
    obj.insert_rw("frozen", frozen.as_value());
    obj.insert_rw("items", list.as_value());
    obj.insert_rw("go", go.as_value());
    let store = RecordingStore::new();
    let (_binder, session) = bind_mode(obj.as_value(), &store, BindingMode::TwoWay);

    let stats = session.stats().expect("stats");
    assert_eq!(stats.tracked_nodes, 4);
    assert_eq!(stats.live_listeners, 4);
    // Root (writable) and the array; never the command or the frozen
    // object.
    assert_eq!(stats.observed_handles, 2);
}

// ============================================================================
// Threaded contexts
// ============================================================================

#[test]
fn threaded_contexts_round_trip() {
    let obj = simple_object();
    let store = RecordingStore::new();
    let binder = Binder::new(ContextPair::threaded().expect("contexts"));
    let session = binder
        .bind(obj.as_value(), store.client(), BindingOptions::default())
        .expect("bind");
    let root = session.root_handle();
    // Bind blocks until wired.
    assert_eq!(store.export(root), json!({ "__readonly": false, "x": 1 }));

    obj.set("x", 2i64);
    assert!(
        wait_until(Duration::from_secs(5), || {
            store.property(root, "x") == Some(StoreValue::Scalar(2i64.into()))
        }),
        "host change never reached the store"
    );

    store
        .script_set(root, "x", StoreValue::Scalar(3i64.into()))
        .expect("script set");
    assert!(
        wait_until(Duration::from_secs(5), || !obj.set_log().is_empty()),
        "script change never reached the host"
    );

    session.dispose();
    assert_eq!(store.live_handles(), 0);
    assert!(
        wait_until(Duration::from_secs(5), || obj.subscriber_count() == 0),
        "listener release never ran"
    );
}
