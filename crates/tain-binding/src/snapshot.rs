#![forbid(unsafe_code)]

//! Host-context capture.
//!
//! Everything the engine learns about the host graph, it learns here: a
//! deep, cycle-safe read of a host value into a self-contained [`Capture`]
//! that can cross to the script context. The capture carries strong
//! capability refs so the script side can later subscribe and write back
//! without touching the host graph itself.
//!
//! Capture runs on the host context, synchronously with the mutation that
//! triggered it, and takes no engine locks. The identity of every composite
//! value is registered in the visited set *before* its children are read, so
//! a cycle re-encounter emits a reference edge and stops recursing.
//!
//! # Invariants
//!
//! - `Capture::nodes` contains exactly one node per distinct identity
//!   reachable from the captured value, children pushed before parents.
//! - Every `CapturedValue::Ref` resolves either to a node in the same
//!   capture or to an identity the session already tracks.

use ahash::AHashSet;

use tain_core::host::ListChange;
use tain_core::{CommandRef, HostId, HostValue, ListRef, ObjectRef, ScalarValue};

use crate::glue::SourceRef;

/// A captured edge: plain data or the identity of a captured/tracked node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CapturedValue {
    Scalar(ScalarValue),
    Ref(HostId),
}

/// One captured object property.
#[derive(Debug, Clone)]
pub(crate) struct CapturedProperty {
    pub name: String,
    pub read_only: bool,
    pub value: CapturedValue,
}

/// Shape-specific captured state of one node.
#[derive(Debug, Clone)]
pub(crate) enum CapturedPayload {
    Object { props: Vec<CapturedProperty> },
    Array { items: Vec<CapturedValue> },
    Command { enabled: bool },
}

/// Strong ref to the capability a captured node came from.
#[derive(Clone)]
pub(crate) enum SourceStrong {
    Object(ObjectRef),
    List(ListRef),
    Command(CommandRef),
}

impl SourceStrong {
    pub(crate) fn id(&self) -> HostId {
        match self {
            Self::Object(o) => HostId::of_object(o),
            Self::List(l) => HostId::of_list(l),
            Self::Command(c) => HostId::of_command(c),
        }
    }

    pub(crate) fn downgrade(&self) -> SourceRef {
        match self {
            Self::Object(o) => SourceRef::Object(std::sync::Arc::downgrade(o)),
            Self::List(l) => SourceRef::List(std::sync::Arc::downgrade(l)),
            Self::Command(c) => SourceRef::Command(std::sync::Arc::downgrade(c)),
        }
    }
}

impl std::fmt::Debug for SourceStrong {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Object(_) => write!(f, "SourceStrong::Object({:?})", self.id()),
            Self::List(_) => write!(f, "SourceStrong::List({:?})", self.id()),
            Self::Command(_) => write!(f, "SourceStrong::Command({:?})", self.id()),
        }
    }
}

/// One distinct identity discovered during capture.
#[derive(Debug)]
pub(crate) struct CapturedNode {
    pub id: HostId,
    pub source: SourceStrong,
    pub payload: CapturedPayload,
}

/// A self-contained deep read of one host value.
#[derive(Debug)]
pub(crate) struct Capture {
    pub root: CapturedValue,
    pub nodes: Vec<CapturedNode>,
    pub notes: Vec<String>,
}

/// A captured collection notification.
#[derive(Debug)]
pub(crate) enum CapturedListChange {
    Insert { index: usize, items: Vec<CapturedValue> },
    Remove { index: usize, count: usize },
    Replace { index: usize, items: Vec<CapturedValue> },
    Move { from: usize, to: usize },
    /// Reset re-reads the whole list at capture time.
    Reset { items: Vec<CapturedValue> },
}

#[derive(Debug)]
pub(crate) struct ListChangeCapture {
    pub change: CapturedListChange,
    pub nodes: Vec<CapturedNode>,
    pub notes: Vec<String>,
}

/// Re-read of one already-tracked node's own state.
#[derive(Debug)]
pub(crate) struct NodeRefresh {
    pub id: HostId,
    pub payload: CapturedPayload,
}

#[derive(Debug)]
pub(crate) struct RefreshCapture {
    pub refreshed: Vec<NodeRefresh>,
    pub nodes: Vec<CapturedNode>,
    pub notes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Capture walker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CaptureBuf {
    nodes: Vec<CapturedNode>,
    seen: AHashSet<HostId>,
    notes: Vec<String>,
}

impl CaptureBuf {
    fn capture(&mut self, value: &HostValue) -> CapturedValue {
        match value {
            HostValue::Scalar(s) => CapturedValue::Scalar(s.clone()),
            HostValue::Opaque(ty) => {
                self.notes
                    .push(format!("opaque host type {ty} mirrored as null"));
                CapturedValue::Scalar(ScalarValue::Null)
            }
            HostValue::Object(o) => {
                let id = HostId::of_object(o);
                if self.seen.insert(id) {
                    let payload = self.capture_object(o);
                    self.nodes.push(CapturedNode {
                        id,
                        source: SourceStrong::Object(ObjectRef::clone(o)),
                        payload,
                    });
                }
                CapturedValue::Ref(id)
            }
            HostValue::List(l) => {
                let id = HostId::of_list(l);
                if self.seen.insert(id) {
                    let payload = self.capture_list(l);
                    self.nodes.push(CapturedNode {
                        id,
                        source: SourceStrong::List(ListRef::clone(l)),
                        payload,
                    });
                }
                CapturedValue::Ref(id)
            }
            HostValue::Command(c) => {
                let id = HostId::of_command(c);
                if self.seen.insert(id) {
                    let payload = CapturedPayload::Command {
                        enabled: c.can_execute(HostValue::null()),
                    };
                    self.nodes.push(CapturedNode {
                        id,
                        source: SourceStrong::Command(CommandRef::clone(c)),
                        payload,
                    });
                }
                CapturedValue::Ref(id)
            }
        }
    }

    fn capture_object(&mut self, o: &ObjectRef) -> CapturedPayload {
        let mut props = Vec::new();
        for spec in o.properties() {
            let value = match o.property(&spec.name) {
                Some(v) => self.capture(&v),
                None => {
                    self.notes.push(format!(
                        "object declares property {:?} but returned no value",
                        spec.name
                    ));
                    CapturedValue::Scalar(ScalarValue::Null)
                }
            };
            props.push(CapturedProperty {
                name: spec.name,
                read_only: spec.read_only,
                value,
            });
        }
        CapturedPayload::Object { props }
    }

    fn capture_list(&mut self, l: &ListRef) -> CapturedPayload {
        let items = l.items().iter().map(|v| self.capture(v)).collect();
        CapturedPayload::Array { items }
    }

    fn capture_payload(&mut self, source: &SourceStrong) -> CapturedPayload {
        match source {
            SourceStrong::Object(o) => self.capture_object(o),
            SourceStrong::List(l) => self.capture_list(l),
            SourceStrong::Command(c) => CapturedPayload::Command {
                enabled: c.can_execute(HostValue::null()),
            },
        }
    }
}

/// Deep-capture one host value.
pub(crate) fn capture_value(value: &HostValue) -> Capture {
    let mut buf = CaptureBuf::default();
    let root = buf.capture(value);
    Capture {
        root,
        nodes: buf.nodes,
        notes: buf.notes,
    }
}

/// Capture a collection notification. `list` is re-read for `Reset`.
pub(crate) fn capture_list_change(list: &ListRef, change: &ListChange) -> ListChangeCapture {
    let mut buf = CaptureBuf::default();
    // The list itself is already tracked; only new children get captured.
    buf.seen.insert(HostId::of_list(list));
    let change = match change {
        ListChange::Insert { index, items } => CapturedListChange::Insert {
            index: *index,
            items: items.iter().map(|v| buf.capture(v)).collect(),
        },
        ListChange::Remove { index, count } => CapturedListChange::Remove {
            index: *index,
            count: *count,
        },
        ListChange::Replace { index, items } => CapturedListChange::Replace {
            index: *index,
            items: items.iter().map(|v| buf.capture(v)).collect(),
        },
        ListChange::Move { from, to } => CapturedListChange::Move {
            from: *from,
            to: *to,
        },
        ListChange::Reset => CapturedListChange::Reset {
            items: list.items().iter().map(|v| buf.capture(v)).collect(),
        },
    };
    ListChangeCapture {
        change,
        nodes: buf.nodes,
        notes: buf.notes,
    }
}

/// Re-read the current state of freshly subscribed nodes. Their own ids are
/// seeded into the visited set, so a self-referencing child emits an edge.
pub(crate) fn capture_refresh(sources: Vec<(HostId, SourceStrong)>) -> RefreshCapture {
    let mut buf = CaptureBuf::default();
    for (id, _) in &sources {
        buf.seen.insert(*id);
    }
    let refreshed = sources
        .iter()
        .map(|(id, source)| NodeRefresh {
            id: *id,
            payload: buf.capture_payload(source),
        })
        .collect();
    RefreshCapture {
        refreshed,
        nodes: buf.nodes,
        notes: buf.notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tain_harness::host::{StubCommand, StubList, StubObject};

    // ── scalar and opaque ────────────────────────────────────────────

    #[test]
    fn scalar_capture_is_flat() {
        let cap = capture_value(&HostValue::from(42i64));
        assert_eq!(cap.root, CapturedValue::Scalar(ScalarValue::Int(42)));
        assert!(cap.nodes.is_empty());
        assert!(cap.notes.is_empty());
    }

    #[test]
    fn opaque_degrades_to_null_with_note() {
        let cap = capture_value(&HostValue::Opaque("FileStream".into()));
        assert_eq!(cap.root, CapturedValue::Scalar(ScalarValue::Null));
        assert_eq!(cap.notes.len(), 1);
        assert!(cap.notes[0].contains("FileStream"));
    }

    // ── objects ──────────────────────────────────────────────────────

    #[test]
    fn object_capture_reads_all_declared_properties() {
        let obj = StubObject::new();
        obj.insert_rw("name", "ada");
        obj.insert_ro("id", 7i64);
        let cap = capture_value(&obj.as_value());

        assert_eq!(cap.nodes.len(), 1);
        let CapturedPayload::Object { props } = &cap.nodes[0].payload else {
            panic!("expected object payload");
        };
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].name, "name");
        assert!(!props[0].read_only);
        assert_eq!(props[1].name, "id");
        assert!(props[1].read_only);
    }

    #[test]
    fn nested_objects_capture_children_before_parents() {
        let child = StubObject::new();
        child.insert_rw("x", 1i64);
        let parent = StubObject::new();
        parent.insert_rw("child", child.as_value());

        let cap = capture_value(&parent.as_value());
        assert_eq!(cap.nodes.len(), 2);
        assert_eq!(cap.nodes[0].id, child.id());
        assert_eq!(cap.nodes[1].id, parent.id());
        assert_eq!(cap.root, CapturedValue::Ref(parent.id()));
    }

    #[test]
    fn shared_child_captured_once() {
        let shared = StubObject::new();
        let parent = StubObject::new();
        parent.insert_rw("a", shared.as_value());
        parent.insert_rw("b", shared.as_value());

        let cap = capture_value(&parent.as_value());
        assert_eq!(cap.nodes.len(), 2);
        let count = cap.nodes.iter().filter(|n| n.id == shared.id()).count();
        assert_eq!(count, 1);
    }

    #[test]
    fn cycle_emits_edge_without_recursion() {
        let a = StubObject::new();
        let b = StubObject::new();
        a.insert_rw("next", b.as_value());
        b.insert_rw("back", a.as_value());

        let cap = capture_value(&a.as_value());
        assert_eq!(cap.nodes.len(), 2);
        let b_node = cap.nodes.iter().find(|n| n.id == b.id()).unwrap();
        let CapturedPayload::Object { props } = &b_node.payload else {
            panic!("expected object payload");
        };
        assert_eq!(props[0].value, CapturedValue::Ref(a.id()));
    }

    // ── lists and commands ───────────────────────────────────────────

    #[test]
    fn list_capture_preserves_order() {
        let list = StubList::new();
        list.push(1i64.into());
        list.push("two".into());
        let cap = capture_value(&list.as_value());

        let node = cap.nodes.iter().find(|n| n.id == list.id()).unwrap();
        let CapturedPayload::Array { items } = &node.payload else {
            panic!("expected array payload");
        };
        assert_eq!(
            items,
            &vec![
                CapturedValue::Scalar(ScalarValue::Int(1)),
                CapturedValue::Scalar(ScalarValue::Str("two".into())),
            ]
        );
    }

    #[test]
    fn command_capture_evaluates_enablement() {
        let cmd = StubCommand::new();
        cmd.set_enabled(false);
        let cap = capture_value(&cmd.as_value());
        let CapturedPayload::Command { enabled } = cap.nodes[0].payload else {
            panic!("expected command payload");
        };
        assert!(!enabled);
    }

    // ── list change capture ──────────────────────────────────────────

    #[test]
    fn reset_change_rereads_items() {
        let list = StubList::new();
        list.push(1i64.into());
        list.push(2i64.into());
        let list_ref: ListRef = list.clone();
        let cap = capture_list_change(&list_ref, &ListChange::Reset);
        let CapturedListChange::Reset { items } = cap.change else {
            panic!("expected reset");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn insert_change_captures_new_nodes() {
        let list = StubList::new();
        let obj = StubObject::new();
        let list_ref: ListRef = list.clone();
        let cap = capture_list_change(
            &list_ref,
            &ListChange::Insert {
                index: 0,
                items: vec![obj.as_value()],
            },
        );
        assert_eq!(cap.nodes.len(), 1);
        assert_eq!(cap.nodes[0].id, obj.id());
    }

    // ── refresh capture ──────────────────────────────────────────────

    #[test]
    fn refresh_does_not_recapture_refreshed_nodes() {
        let a = StubObject::new();
        let b = StubObject::new();
        a.insert_rw("peer", b.as_value());
        b.insert_rw("peer", a.as_value());

        let sources = vec![
            (a.id(), SourceStrong::Object(a.clone() as ObjectRef)),
            (b.id(), SourceStrong::Object(b.clone() as ObjectRef)),
        ];
        let cap = capture_refresh(sources);
        assert_eq!(cap.refreshed.len(), 2);
        assert!(cap.nodes.is_empty());
    }
}
