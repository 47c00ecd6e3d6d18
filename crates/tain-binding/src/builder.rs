#![forbid(unsafe_code)]

//! Graph materialization.
//!
//! [`attach`] turns a host-context [`Capture`](crate::snapshot::Capture)
//! into tracked mirror nodes: one store handle per newly seen identity,
//! payloads filled afterwards so cyclic captures resolve against already
//! allocated placeholders. Identities the session already tracks are left
//! alone; edges to them bump the ref count instead of re-creating anything.
//!
//! All store writes issued here are engine-initiated, so each one runs
//! inside a suppression window on its slot.
//!
//! # Invariants
//!
//! - A node is created at most once per identity; repeat encounters add
//!   edges only.
//! - New subtrees are fully attached (entries present, refs counted) before
//!   any displaced subtree is released by the caller.

use ahash::AHashSet;

use tain_core::{
    COMMAND_ENABLED, HostId, READ_ONLY_FLAG, ScalarValue, ScriptHandle, StoreValue,
    is_reserved_property,
};

use crate::diag::DiagKind;
use crate::echo::SlotKey;
use crate::glue::{GlueNode, GluePayload, GlueProperty, GlueValue};
use crate::graph::{Entry, SweepOutcome};
use crate::observer::ListenerHandle;
use crate::session::{EngineState, SharedCore};
use crate::snapshot::{CapturedNode, CapturedPayload, CapturedValue, SourceStrong};

/// Result of attaching one capture batch.
pub(crate) struct AttachOutcome {
    /// Nodes needing host listeners, in capture (children-first) order.
    pub new_subscriptions: Vec<(HostId, SourceStrong)>,
    /// Identities created by this batch.
    pub created: AHashSet<HostId>,
}

/// Materialize a capture batch into the session.
pub(crate) fn attach(
    core: &SharedCore,
    state: &mut EngineState,
    nodes: Vec<CapturedNode>,
    notes: Vec<String>,
) -> AttachOutcome {
    for note in notes {
        core.diag.emit(DiagKind::UnsupportedValue, note);
    }

    // Pass 1: allocate a handle per unseen identity so edges among the new
    // nodes (including cycles) resolve in pass 2.
    let mut created: AHashSet<HostId> = AHashSet::new();
    let mut failed: AHashSet<HostId> = AHashSet::new();
    for node in &nodes {
        if state.map.contains(node.id) {
            continue;
        }
        let allocated = match &node.payload {
            CapturedPayload::Object { .. } => state.store.create_object(),
            CapturedPayload::Array { .. } => state.store.create_array(),
            CapturedPayload::Command { .. } => state.store.create_command(),
        };
        match allocated {
            Ok(handle) => {
                let shell = match &node.payload {
                    CapturedPayload::Object { .. } => GluePayload::Object {
                        props: std::collections::BTreeMap::new(),
                    },
                    CapturedPayload::Array { .. } => GluePayload::Array { items: Vec::new() },
                    CapturedPayload::Command { enabled } => GluePayload::Command {
                        enabled: *enabled,
                    },
                };
                state.map.insert(
                    node.id,
                    Entry {
                        refs: 0,
                        glue: GlueNode {
                            handle,
                            source: node.source.downgrade(),
                            payload: shell,
                        },
                        listener: None,
                        observed: false,
                    },
                );
                created.insert(node.id);
                tracing::trace!(
                    target: "tain::build",
                    id = ?node.id,
                    handle = %handle,
                    "mirror node created"
                );
            }
            Err(e) => {
                core.diag
                    .emit(DiagKind::StoreFailure, format!("create failed: {e}"));
                failed.insert(node.id);
            }
        }
    }

    // Pass 2: fill payloads and write initial store state.
    for node in &nodes {
        if !created.contains(&node.id) {
            continue;
        }
        let Some(handle) = state.map.handle_of(node.id) else {
            continue;
        };
        match &node.payload {
            CapturedPayload::Object { props } => {
                let mut glue_props = std::collections::BTreeMap::new();
                let mut writes = Vec::with_capacity(props.len());
                let mut writable = 0usize;
                for prop in props {
                    if is_reserved_property(&prop.name) {
                        core.diag.emit(
                            DiagKind::UnknownProperty,
                            format!("host object declares reserved property {:?}", prop.name),
                        );
                        continue;
                    }
                    if !prop.read_only {
                        writable += 1;
                    }
                    let (gv, sv) = resolve(core, state, &prop.value, &failed);
                    glue_props.insert(
                        prop.name.clone(),
                        GlueProperty {
                            value: gv,
                            read_only: prop.read_only,
                        },
                    );
                    writes.push((prop.name.clone(), sv));
                }
                if let Some(entry) = state.map.get_mut(node.id) {
                    entry.glue.payload = GluePayload::Object { props: glue_props };
                }
                for (name, sv) in writes {
                    store_set(core, state, handle, &name, sv);
                }
                store_set(
                    core,
                    state,
                    handle,
                    READ_ONLY_FLAG,
                    StoreValue::Scalar(ScalarValue::Bool(writable == 0)),
                );
            }
            CapturedPayload::Array { items } => {
                let mut glue_items = Vec::with_capacity(items.len());
                let mut store_items = Vec::with_capacity(items.len());
                for item in items {
                    let (gv, sv) = resolve(core, state, item, &failed);
                    glue_items.push(gv);
                    store_items.push(sv);
                }
                if let Some(entry) = state.map.get_mut(node.id) {
                    entry.glue.payload = GluePayload::Array { items: glue_items };
                }
                if !store_items.is_empty() {
                    store_splice(core, state, handle, 0, 0, store_items);
                }
            }
            CapturedPayload::Command { enabled } => {
                store_set(
                    core,
                    state,
                    handle,
                    COMMAND_ENABLED,
                    StoreValue::Scalar(ScalarValue::Bool(*enabled)),
                );
            }
        }
    }

    // Pass 3: observation and listener demand, per mode.
    let mut new_subscriptions = Vec::new();
    for node in nodes {
        if !created.contains(&node.id) {
            continue;
        }
        let observe = match &node.payload {
            CapturedPayload::Object { .. } => {
                core.mode.script_to_host()
                    && state
                        .map
                        .get(node.id)
                        .is_some_and(|e| e.glue.writable_properties() > 0)
            }
            CapturedPayload::Array { .. } => core.mode.script_to_host(),
            CapturedPayload::Command { .. } => false,
        };
        if observe {
            let Some(handle) = state.map.handle_of(node.id) else {
                continue;
            };
            match state.store.observe(handle, true) {
                Ok(()) => {
                    if let Some(entry) = state.map.get_mut(node.id) {
                        entry.observed = true;
                    }
                }
                Err(e) => {
                    core.diag
                        .emit(DiagKind::StoreFailure, format!("observe {handle}: {e}"));
                }
            }
        }
        if core.mode.host_to_script() {
            new_subscriptions.push((node.id, node.source));
        }
    }

    AttachOutcome {
        new_subscriptions,
        created,
    }
}

/// Resolve one captured edge: plain data passes through, references bump the
/// target's edge count.
pub(crate) fn resolve(
    core: &SharedCore,
    state: &mut EngineState,
    value: &CapturedValue,
    failed: &AHashSet<HostId>,
) -> (GlueValue, StoreValue) {
    match value {
        CapturedValue::Scalar(s) => (GlueValue::Scalar(s.clone()), StoreValue::Scalar(s.clone())),
        CapturedValue::Ref(id) => {
            if failed.contains(id) {
                return (GlueValue::Scalar(ScalarValue::Null), StoreValue::null());
            }
            match state.map.handle_of(*id) {
                Some(handle) => {
                    state.map.bump_ref(*id);
                    (GlueValue::Ref(*id), StoreValue::Ref(handle))
                }
                None => {
                    core.diag.emit(
                        DiagKind::DanglingHandle,
                        format!("capture edge to untracked identity {id:?}"),
                    );
                    (GlueValue::Scalar(ScalarValue::Null), StoreValue::null())
                }
            }
        }
    }
}

/// True when a mirrored edge already equals a captured one.
pub(crate) fn edge_equal(old: &GlueValue, new: &CapturedValue) -> bool {
    match (old, new) {
        (GlueValue::Scalar(a), CapturedValue::Scalar(b)) => a == b,
        (GlueValue::Ref(a), CapturedValue::Ref(b)) => a == b,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Silenced store writes
// ---------------------------------------------------------------------------

pub(crate) fn store_set(
    core: &SharedCore,
    state: &mut EngineState,
    handle: ScriptHandle,
    name: &str,
    value: StoreValue,
) {
    let key = (handle, SlotKey::property(name));
    core.script_silence.silence(key.clone());
    let result = state.store.set_property(handle, name, value);
    core.script_silence.unsilence(&key);
    if let Err(e) = result {
        core.diag
            .emit(DiagKind::StoreFailure, format!("set {name} on {handle}: {e}"));
    }
}

pub(crate) fn store_splice(
    core: &SharedCore,
    state: &mut EngineState,
    handle: ScriptHandle,
    index: usize,
    remove: usize,
    items: Vec<StoreValue>,
) {
    let key = (handle, SlotKey::Items);
    core.script_silence.silence(key.clone());
    let result = state.store.splice(handle, index, remove, items);
    core.script_silence.unsilence(&key);
    if let Err(e) = result {
        core.diag
            .emit(DiagKind::StoreFailure, format!("splice {handle}: {e}"));
    }
}

pub(crate) fn store_release(core: &SharedCore, state: &mut EngineState, handle: ScriptHandle) {
    if let Err(e) = state.store.release(handle) {
        core.diag
            .emit(DiagKind::StoreFailure, format!("release {handle}: {e}"));
    }
}

// ---------------------------------------------------------------------------
// Sweep plumbing
// ---------------------------------------------------------------------------

/// Release evicted entries' store handles and collect their listeners for
/// the host-context release batch.
pub(crate) fn process_evictions(
    core: &SharedCore,
    state: &mut EngineState,
    outcome: SweepOutcome,
) -> Vec<ListenerHandle> {
    let mut releases = Vec::new();
    for eviction in outcome.evicted {
        tracing::trace!(
            target: "tain::sweep",
            id = ?eviction.id,
            handle = %eviction.handle,
            "mirror node evicted"
        );
        store_release(core, state, eviction.handle);
        if let Some(listener) = eviction.listener {
            releases.push(listener);
        }
    }
    releases
}

/// Sweep batch-created nodes that never got an incoming edge. Used when an
/// apply bails out after its capture was already attached.
pub(crate) fn sweep_unattached(
    core: &SharedCore,
    state: &mut EngineState,
    created: &AHashSet<HostId>,
) -> Vec<ListenerHandle> {
    let roots: Vec<HostId> = created
        .iter()
        .filter(|id| state.map.get(**id).is_some_and(|e| e.refs == 0))
        .copied()
        .collect();
    if roots.is_empty() {
        return Vec::new();
    }
    let outcome = state.map.release_edges(roots);
    process_evictions(core, state, outcome)
}
