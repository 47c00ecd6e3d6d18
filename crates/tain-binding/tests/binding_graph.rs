#![forbid(unsafe_code)]

//! Integration tests: initial graph materialization.
//!
//! A bind walks the reachable host graph once and mirrors it node for
//! node: every composite gets a store handle, properties and items get
//! values, shared identities share one handle.

use pretty_assertions::assert_eq;
use serde_json::json;

use tain_binding::{
    Binder, BindingOptions, BindingSession, ContextPair, DiagKind, NodeShape, ViewValue,
};
use tain_core::{HostValue, ScriptHandle, ValueKind};
use tain_harness::{RecordingStore, StoreEvent, StubCommand, StubList, StubObject};

fn bind(root: HostValue) -> (Binder, RecordingStore, BindingSession) {
    let binder = Binder::new(ContextPair::direct());
    let store = RecordingStore::new();
    let session = binder
        .bind(root, store.client(), BindingOptions::default())
        .expect("bind");
    (binder, store, session)
}

fn node_handle(session: &BindingSession, name: &str) -> ScriptHandle {
    let snap = session.snapshot().expect("snapshot");
    let NodeShape::Object { properties } = &snap.root().expect("root").shape else {
        panic!("root is not an object");
    };
    let prop = properties
        .iter()
        .find(|p| p.name == name)
        .unwrap_or_else(|| panic!("no property {name:?}"));
    match &prop.value {
        ViewValue::Node(h) => *h,
        other => panic!("{name:?} is not a node edge: {other:?}"),
    }
}

// ============================================================================
// Objects
// ============================================================================

#[test]
fn object_mirrors_properties_and_flags() {
    let obj = StubObject::new();
    obj.insert_rw("name", "ada");
    obj.insert_ro("serial", 42i64);

    let (_binder, store, session) = bind(obj.as_value());
    let root = session.root_handle();

    assert_eq!(
        store.export(root),
        json!({ "__readonly": false, "name": "ada", "serial": 42 })
    );

    let snap = session.snapshot().expect("snapshot");
    let view = snap.root().expect("root tracked");
    assert_eq!(view.kind, ValueKind::Object);
    assert_eq!(view.refs, 1);
    assert!(view.observed);
    assert!(view.has_listener);
    let NodeShape::Object { properties } = &view.shape else {
        panic!("object shape expected");
    };
    let serial = properties.iter().find(|p| p.name == "serial").unwrap();
    assert!(serial.read_only);
}

#[test]
fn object_without_writable_properties_is_flagged_read_only() {
    let obj = StubObject::new();
    obj.insert_ro("fixed", 1i64);

    let (_binder, store, session) = bind(obj.as_value());
    let root = session.root_handle();

    assert_eq!(
        store.export(root),
        json!({ "__readonly": true, "fixed": 1 })
    );
    // Nothing the script could write, so the slot is not observed.
    assert!(!store.observed(root));
    assert_eq!(session.stats().expect("stats").observed_handles, 0);
}

#[test]
fn empty_object_is_read_only() {
    let obj = StubObject::new();
    let (_binder, store, session) = bind(obj.as_value());
    assert_eq!(store.export(session.root_handle()), json!({ "__readonly": true }));
}

// ============================================================================
// Whole graphs
// ============================================================================

#[test]
fn nested_graph_tracks_every_composite() {
    let passenger = StubObject::new();
    passenger.insert_rw("seat", "2a");
    let list = StubList::new();
    list.push(HostValue::from(7i64));
    list.push(passenger.as_value());
    let child = StubObject::new();
    child.insert_rw("x", 1i64);
    let go = StubCommand::new();

    let root_obj = StubObject::new();
    root_obj.insert_rw("child", child.as_value());
    root_obj.insert_rw("items", list.as_value());
    root_obj.insert_rw("go", go.as_value());

    let (_binder, store, session) = bind(root_obj.as_value());

    let stats = session.stats().expect("stats");
    assert_eq!(stats.tracked_nodes, 5);
    assert_eq!(store.live_handles(), 5);

    // Every mirrored edge points at a tracked node.
    let snap = session.snapshot().expect("snapshot");
    for node in &snap.nodes {
        match &node.shape {
            NodeShape::Object { properties } => {
                for p in properties {
                    if let ViewValue::Node(h) = &p.value {
                        assert!(snap.node(*h).is_some(), "dangling edge to {h}");
                    }
                }
            }
            NodeShape::Array { items } => {
                for v in items {
                    if let ViewValue::Node(h) = v {
                        assert!(snap.node(*h).is_some(), "dangling item edge to {h}");
                    }
                }
            }
            NodeShape::Command { .. } => {}
        }
    }

    assert_eq!(
        store.export(session.root_handle()),
        json!({
            "__readonly": false,
            "child": { "__readonly": false, "x": 1 },
            "go": { "enabled": true },
            "items": [7, { "__readonly": false, "seat": "2a" }],
        })
    );
}

#[test]
fn shared_child_gets_one_node_and_two_refs() {
    let shared = StubObject::new();
    shared.insert_rw("x", 0i64);
    let root_obj = StubObject::new();
    root_obj.insert_rw("left", shared.as_value());
    root_obj.insert_rw("right", shared.as_value());

    let (_binder, _store, session) = bind(root_obj.as_value());

    assert_eq!(session.stats().expect("stats").tracked_nodes, 2);
    let left = node_handle(&session, "left");
    let right = node_handle(&session, "right");
    assert_eq!(left, right);

    let snap = session.snapshot().expect("snapshot");
    assert_eq!(snap.node(left).expect("shared node").refs, 2);
    // One listener despite two edges.
    assert_eq!(shared.subscriber_count(), 1);
}

#[test]
fn cycle_binds_and_exports_with_ref_marker() {
    let a = StubObject::new();
    let b = StubObject::new();
    a.insert_rw("peer", b.as_value());
    b.insert_rw("peer", a.as_value());

    let (_binder, store, session) = bind(a.as_value());

    assert_eq!(session.stats().expect("stats").tracked_nodes, 2);
    let root = session.root_handle();
    let v = store.export(root);
    assert_eq!(v["peer"]["peer"]["$ref"], json!(root.raw()));
}

#[test]
fn scalar_root_binds_without_nodes() {
    let (_binder, store, session) = bind(HostValue::from("just text"));

    assert_eq!(session.stats().expect("stats").tracked_nodes, 0);
    assert_eq!(store.live_handles(), 1);
    assert_eq!(store.export(session.root_handle()), json!("just text"));

    session.dispose();
    assert_eq!(store.live_handles(), 0);
}

// ============================================================================
// Degradations
// ============================================================================

#[test]
fn opaque_value_degrades_to_null_with_diagnostic() {
    let obj = StubObject::new();
    obj.insert_rw("blob", HostValue::Opaque("texture".to_string()));
    obj.insert_rw("ok", 1i64);

    let (_binder, store, session) = bind(obj.as_value());

    assert_eq!(
        store.export(session.root_handle()),
        json!({ "__readonly": false, "blob": null, "ok": 1 })
    );
    assert!(
        session
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagKind::UnsupportedValue),
        "expected an unsupported-value diagnostic"
    );
}

// ============================================================================
// Commands
// ============================================================================

#[test]
fn command_mirrors_enablement_and_is_not_observed() {
    let go = StubCommand::new();
    go.set_enabled(false);
    let obj = StubObject::new();
    obj.insert_rw("go", go.as_value());

    let (_binder, store, session) = bind(obj.as_value());
    let go_handle = node_handle(&session, "go");

    assert_eq!(store.export(go_handle), json!({ "enabled": false }));
    assert!(!store.observed(go_handle));
    // Enabled listener is live.
    assert_eq!(go.subscriber_count(), 1);

    let snap = session.snapshot().expect("snapshot");
    let view = snap.node(go_handle).expect("command node");
    assert_eq!(view.kind, ValueKind::Command);
    assert_eq!(view.shape, NodeShape::Command { enabled: false });
}

// ============================================================================
// Store call ordering
// ============================================================================

#[test]
fn nodes_are_created_before_any_payload_is_written() {
    let child = StubObject::new();
    child.insert_rw("x", 1i64);
    let obj = StubObject::new();
    obj.insert_rw("child", child.as_value());
    obj.insert_rw("y", 2i64);

    let (_binder, store, _session) = bind(obj.as_value());

    let events = store.events();
    let last_created = events
        .iter()
        .rposition(|e| matches!(e, StoreEvent::Created { .. }))
        .expect("creations logged");
    let first_set = events
        .iter()
        .position(|e| matches!(e, StoreEvent::Set { .. }))
        .expect("writes logged");
    assert!(
        last_created < first_set,
        "placeholders must exist before payloads are written"
    );
}
