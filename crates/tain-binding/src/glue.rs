#![forbid(unsafe_code)]

//! Mirror-node model.
//!
//! A [`GlueNode`] is the engine's record of one mirrored host capability: the
//! script handle it lives under, a weak back-reference to its source, and the
//! current shape (object properties, array items, or command enablement).
//! Edges between nodes are [`GlueValue::Ref`] entries carrying the *host*
//! identity of the target, never an owning pointer, so the mirror stays a
//! flat identity-keyed table even when the host graph is cyclic.
//!
//! # Invariants
//!
//! - Every `GlueValue::Ref` in a live node resolves to a tracked entry in the
//!   session's binding map.
//! - The back-reference is weak: a mirror node never keeps its host object
//!   alive.

use std::collections::BTreeMap;
use std::fmt;

use tain_core::host::{WeakCommandRef, WeakListRef, WeakObjectRef};
use tain_core::{HostId, HostValue, ScalarValue, ScriptHandle, ValueKind};

/// Edge value inside the mirror: plain data or a reference to another
/// tracked node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum GlueValue {
    Scalar(ScalarValue),
    Ref(HostId),
}

impl GlueValue {
    pub(crate) fn ref_id(&self) -> Option<HostId> {
        match self {
            Self::Ref(id) => Some(*id),
            Self::Scalar(_) => None,
        }
    }
}

/// One mirrored object property.
#[derive(Debug, Clone)]
pub(crate) struct GlueProperty {
    pub value: GlueValue,
    pub read_only: bool,
}

/// Weak back-reference to the host capability a node mirrors.
#[derive(Clone)]
pub(crate) enum SourceRef {
    Object(WeakObjectRef),
    List(WeakListRef),
    Command(WeakCommandRef),
}

impl SourceRef {
    pub(crate) fn kind(&self) -> ValueKind {
        match self {
            Self::Object(_) => ValueKind::Object,
            Self::List(_) => ValueKind::Array,
            Self::Command(_) => ValueKind::Command,
        }
    }

    /// Upgrade back to a strong host value, if the source is still alive.
    pub(crate) fn upgrade(&self) -> Option<HostValue> {
        match self {
            Self::Object(w) => w.upgrade().map(HostValue::Object),
            Self::List(w) => w.upgrade().map(HostValue::List),
            Self::Command(w) => w.upgrade().map(HostValue::Command),
        }
    }
}

impl fmt::Debug for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceRef({})", self.kind())
    }
}

/// Shape-specific payload of a mirror node.
#[derive(Debug, Clone)]
pub(crate) enum GluePayload {
    Object { props: BTreeMap<String, GlueProperty> },
    Array { items: Vec<GlueValue> },
    Command { enabled: bool },
}

/// One mirrored host capability.
#[derive(Debug, Clone)]
pub(crate) struct GlueNode {
    pub handle: ScriptHandle,
    pub source: SourceRef,
    pub payload: GluePayload,
}

impl GlueNode {
    pub(crate) fn kind(&self) -> ValueKind {
        match &self.payload {
            GluePayload::Object { .. } => ValueKind::Object,
            GluePayload::Array { .. } => ValueKind::Array,
            GluePayload::Command { .. } => ValueKind::Command,
        }
    }

    /// Visit the host identity of every outgoing reference edge, once per
    /// edge (a target reachable twice is visited twice).
    pub(crate) fn for_each_child(&self, mut f: impl FnMut(HostId)) {
        match &self.payload {
            GluePayload::Object { props } => {
                for prop in props.values() {
                    if let Some(id) = prop.value.ref_id() {
                        f(id);
                    }
                }
            }
            GluePayload::Array { items } => {
                for item in items {
                    if let Some(id) = item.ref_id() {
                        f(id);
                    }
                }
            }
            GluePayload::Command { .. } => {}
        }
    }

    /// Number of writable properties; zero marks the node read-only on the
    /// script side.
    pub(crate) fn writable_properties(&self) -> usize {
        match &self.payload {
            GluePayload::Object { props } => props.values().filter(|p| !p.read_only).count(),
            GluePayload::Array { .. } | GluePayload::Command { .. } => 0,
        }
    }
}
