#![forbid(unsafe_code)]

//! Change listeners and the host-to-script flow.
//!
//! Each tracked composite node carries at most one [`ListenerHandle`]: an
//! active subscription on its host capability. The sink installed by a
//! subscription runs on the host context, synchronously with the mutation.
//! It does three cheap things only: phase check, echo check, deep capture.
//! The captured description is posted to the script context where the
//! `apply_*` functions hold the engine lock and mutate glue and store.
//!
//! Subscription itself is host-context work. New nodes are materialized
//! first (without listeners), then a host batch subscribes them and
//! re-captures their state; the refresh is applied through the same update
//! path, so a host mutation landing between capture and subscribe is never
//! lost.
//!
//! # Invariants
//!
//! - Sinks never take the engine lock; they post.
//! - Listener release happens on the host context, in posted batches.
//! - A displaced subtree is released only after its replacement is fully
//!   attached.

use std::sync::{Arc, Weak};

use ahash::AHashSet;

use tain_core::host::{
    EnabledObserver, ListChange, ListObserver, PropertyObserver, SubscriptionId, WeakListRef,
    WeakObjectRef,
};
use tain_core::{HostId, StoreValue};

use crate::builder::{
    attach, edge_equal, process_evictions, resolve, store_set, store_splice, sweep_unattached,
};
use crate::diag::DiagKind;
use crate::echo::SlotKey;
use crate::glue::{GluePayload, GlueProperty, GlueValue, SourceRef};
use crate::session::{EngineState, SessionPhase, SharedCore};
use crate::snapshot::{
    Capture, CapturedListChange, CapturedValue, ListChangeCapture, NodeRefresh, SourceStrong,
    capture_list_change, capture_refresh, capture_value,
};

/// An active subscription on one host capability. Released exactly once, on
/// the host context.
#[derive(Debug)]
pub(crate) struct ListenerHandle {
    source: SourceRef,
    sub: SubscriptionId,
}

impl ListenerHandle {
    pub(crate) fn new(source: SourceRef, sub: SubscriptionId) -> Self {
        Self { source, sub }
    }

    /// Unsubscribe from the source, if it is still alive.
    pub(crate) fn release(self) {
        match self.source {
            SourceRef::Object(w) => {
                if let Some(o) = w.upgrade() {
                    o.unsubscribe(self.sub);
                }
            }
            SourceRef::List(w) => {
                if let Some(l) = w.upgrade() {
                    l.unsubscribe(self.sub);
                }
            }
            SourceRef::Command(w) => {
                if let Some(c) = w.upgrade() {
                    c.unsubscribe(self.sub);
                }
            }
        }
    }
}

/// Host-context work produced by a script-context pass.
#[derive(Debug, Default)]
pub(crate) struct HostWork {
    pub releases: Vec<ListenerHandle>,
    pub subscribes: Vec<(HostId, SourceStrong)>,
}

impl HostWork {
    pub(crate) fn is_empty(&self) -> bool {
        self.releases.is_empty() && self.subscribes.is_empty()
    }
}

/// Post `work` to the host context, if there is any.
pub(crate) fn post_host_work(core: &Arc<SharedCore>, work: HostWork) {
    if work.is_empty() {
        return;
    }
    let task_core = Arc::clone(core);
    core.contexts
        .host
        .post(Box::new(move || run_host_work(&task_core, work)));
}

/// Host-context entry point: release old listeners, subscribe new nodes,
/// and hand the refresh back to the script context.
pub(crate) fn run_host_work(core: &Arc<SharedCore>, work: HostWork) {
    for listener in work.releases {
        listener.release();
    }
    if work.subscribes.is_empty() || core.phase() == SessionPhase::Disposed {
        return;
    }
    let (handles, refresh) = subscribe_batch(core, work.subscribes);
    let task_core = Arc::clone(core);
    core.contexts
        .script
        .post(Box::new(move || install_and_refresh(&task_core, handles, refresh)));
}

/// Subscribe each node's host capability and re-capture its current state.
/// Runs on the host context.
pub(crate) fn subscribe_batch(
    core: &Arc<SharedCore>,
    subs: Vec<(HostId, SourceStrong)>,
) -> (Vec<(HostId, ListenerHandle)>, crate::snapshot::RefreshCapture) {
    let weak = Arc::downgrade(core);
    let mut handles = Vec::with_capacity(subs.len());
    for (id, source) in &subs {
        let sub = match source {
            SourceStrong::Object(o) => {
                o.subscribe(make_object_sink(weak.clone(), *id, Arc::downgrade(o)))
            }
            SourceStrong::List(l) => {
                l.subscribe(make_list_sink(weak.clone(), *id, Arc::downgrade(l)))
            }
            SourceStrong::Command(c) => c.subscribe_enabled(make_enabled_sink(weak.clone(), *id)),
        };
        handles.push((*id, ListenerHandle::new(source.downgrade(), sub)));
    }
    let refresh = capture_refresh(subs);
    (handles, refresh)
}

/// Install freshly created listeners into their entries and apply the
/// post-subscribe refresh. Runs on the script context.
pub(crate) fn install_and_refresh(
    core: &Arc<SharedCore>,
    handles: Vec<(HostId, ListenerHandle)>,
    refresh: crate::snapshot::RefreshCapture,
) {
    let mut work = HostWork::default();
    {
        let mut state = core.lock_state();
        if core.phase() == SessionPhase::Disposed {
            work.releases = handles.into_iter().map(|(_, l)| l).collect();
        } else {
            for (id, listener) in handles {
                match state.map.get_mut(id) {
                    Some(entry) => {
                        if let Some(old) = entry.listener.replace(listener) {
                            work.releases.push(old);
                        }
                    }
                    // Evicted between subscribe and install.
                    None => work.releases.push(listener),
                }
            }
            let outcome = attach(core, &mut state, refresh.nodes, refresh.notes);
            for node_refresh in refresh.refreshed {
                work.releases
                    .extend(apply_refresh_payload(core, &mut state, node_refresh));
            }
            work.releases
                .extend(sweep_unattached(core, &mut state, &outcome.created));
            work.subscribes = outcome
                .new_subscriptions
                .into_iter()
                .filter(|(id, _)| state.map.contains(*id))
                .collect();
        }
    }
    post_host_work(core, work);
}

// ---------------------------------------------------------------------------
// Sinks (host context, synchronous with the mutation)
// ---------------------------------------------------------------------------

fn make_object_sink(
    core: Weak<SharedCore>,
    id: HostId,
    source: WeakObjectRef,
) -> PropertyObserver {
    Box::new(move |name: &str| {
        let Some(core) = core.upgrade() else { return };
        match core.phase() {
            SessionPhase::Binding | SessionPhase::Bound => {}
            _ => return,
        }
        if core
            .host_silence
            .is_silenced(&(id, SlotKey::property(name)))
        {
            tracing::trace!(target: "tain::echo", id = ?id, name, "host echo suppressed");
            return;
        }
        let Some(obj) = source.upgrade() else { return };
        let cap = match obj.property(name) {
            Some(value) => capture_value(&value),
            None => Capture {
                root: CapturedValue::Scalar(tain_core::ScalarValue::Null),
                nodes: Vec::new(),
                notes: Vec::new(),
            },
        };
        let name = name.to_string();
        let task_core = Arc::clone(&core);
        core.contexts
            .script
            .post(Box::new(move || apply_host_property(&task_core, id, name, cap)));
    })
}

fn make_list_sink(core: Weak<SharedCore>, id: HostId, source: WeakListRef) -> ListObserver {
    Box::new(move |change: &ListChange| {
        let Some(core) = core.upgrade() else { return };
        match core.phase() {
            SessionPhase::Binding | SessionPhase::Bound => {}
            _ => return,
        }
        if core.host_silence.is_silenced(&(id, SlotKey::Items)) {
            tracing::trace!(target: "tain::echo", id = ?id, "host list echo suppressed");
            return;
        }
        let Some(list) = source.upgrade() else { return };
        let cap = capture_list_change(&list, change);
        let task_core = Arc::clone(&core);
        core.contexts
            .script
            .post(Box::new(move || apply_host_list(&task_core, id, cap)));
    })
}

fn make_enabled_sink(core: Weak<SharedCore>, id: HostId) -> EnabledObserver {
    Box::new(move |enabled: bool| {
        let Some(core) = core.upgrade() else { return };
        match core.phase() {
            SessionPhase::Binding | SessionPhase::Bound => {}
            _ => return,
        }
        let task_core = Arc::clone(&core);
        core.contexts
            .script
            .post(Box::new(move || apply_host_enabled(&task_core, id, enabled)));
    })
}

// ---------------------------------------------------------------------------
// Script-context application
// ---------------------------------------------------------------------------

/// Apply one captured host property change.
pub(crate) fn apply_host_property(core: &Arc<SharedCore>, id: HostId, name: String, cap: Capture) {
    if core.phase() == SessionPhase::Disposed {
        return;
    }
    let mut work = HostWork::default();
    {
        let mut state = core.lock_state();
        if !state.map.contains(id) {
            tracing::trace!(target: "tain::host", id = ?id, "change for evicted node dropped");
            return;
        }
        let outcome = attach(core, &mut state, cap.nodes, cap.notes);
        work.releases
            .extend(apply_property_update(core, &mut state, id, &name, &cap.root));
        work.releases
            .extend(sweep_unattached(core, &mut state, &outcome.created));
        work.subscribes = outcome
            .new_subscriptions
            .into_iter()
            .filter(|(sid, _)| state.map.contains(*sid))
            .collect();
    }
    post_host_work(core, work);
}

/// Apply one captured host collection change.
pub(crate) fn apply_host_list(core: &Arc<SharedCore>, id: HostId, cap: ListChangeCapture) {
    if core.phase() == SessionPhase::Disposed {
        return;
    }
    let mut work = HostWork::default();
    {
        let mut state = core.lock_state();
        if !state.map.contains(id) {
            tracing::trace!(target: "tain::host", id = ?id, "change for evicted list dropped");
            return;
        }
        let outcome = attach(core, &mut state, cap.nodes, cap.notes);
        work.releases
            .extend(apply_list_update(core, &mut state, id, cap.change));
        work.releases
            .extend(sweep_unattached(core, &mut state, &outcome.created));
        work.subscribes = outcome
            .new_subscriptions
            .into_iter()
            .filter(|(sid, _)| state.map.contains(*sid))
            .collect();
    }
    post_host_work(core, work);
}

/// Apply a host enablement change to a mirrored command.
pub(crate) fn apply_host_enabled(core: &Arc<SharedCore>, id: HostId, enabled: bool) {
    if core.phase() == SessionPhase::Disposed {
        return;
    }
    let mut state = core.lock_state();
    apply_enabled_update(core, &mut state, id, enabled);
}

/// Update one mirrored property in place. No-ops when the mirror already
/// holds the value. Returns listeners displaced by the update.
pub(crate) fn apply_property_update(
    core: &SharedCore,
    state: &mut EngineState,
    id: HostId,
    name: &str,
    new_value: &CapturedValue,
) -> Vec<ListenerHandle> {
    let Some(entry) = state.map.get(id) else {
        return Vec::new();
    };
    let handle = entry.glue.handle;
    let (old_value, read_only) = {
        let GluePayload::Object { props } = &entry.glue.payload else {
            core.diag.emit(
                DiagKind::ShapeChanged,
                format!("property change on non-object mirror {handle}"),
            );
            return Vec::new();
        };
        match props.get(name) {
            Some(prop) => (prop.value.clone(), prop.read_only),
            None => {
                core.diag.emit(
                    DiagKind::UnknownProperty,
                    format!("host notified undeclared property {name:?}"),
                );
                return Vec::new();
            }
        }
    };
    if edge_equal(&old_value, new_value) {
        return Vec::new();
    }

    let none = AHashSet::new();
    let (gv, sv) = resolve(core, state, new_value, &none);
    if let Some(entry) = state.map.get_mut(id)
        && let GluePayload::Object { props } = &mut entry.glue.payload
    {
        props.insert(
            name.to_string(),
            GlueProperty {
                value: gv,
                read_only,
            },
        );
    }
    store_set(core, state, handle, name, sv);

    match old_value.ref_id() {
        Some(old_id) => {
            let outcome = state.map.release_edges(vec![old_id]);
            process_evictions(core, state, outcome)
        }
        None => Vec::new(),
    }
}

/// Update the mirrored can-execute flag.
pub(crate) fn apply_enabled_update(
    core: &SharedCore,
    state: &mut EngineState,
    id: HostId,
    enabled: bool,
) {
    let Some(entry) = state.map.get_mut(id) else {
        return;
    };
    let handle = entry.glue.handle;
    let GluePayload::Command { enabled: mirrored } = &mut entry.glue.payload else {
        core.diag.emit(
            DiagKind::ShapeChanged,
            format!("enablement change on non-command mirror {handle}"),
        );
        return;
    };
    if *mirrored == enabled {
        return;
    }
    *mirrored = enabled;
    store_set(
        core,
        state,
        handle,
        tain_core::COMMAND_ENABLED,
        StoreValue::Scalar(tain_core::ScalarValue::Bool(enabled)),
    );
}

/// Apply one captured collection change to a mirrored array.
fn apply_list_update(
    core: &SharedCore,
    state: &mut EngineState,
    id: HostId,
    change: CapturedListChange,
) -> Vec<ListenerHandle> {
    let Some(entry) = state.map.get(id) else {
        return Vec::new();
    };
    let handle = entry.glue.handle;
    let len = match &entry.glue.payload {
        GluePayload::Array { items } => items.len(),
        _ => {
            core.diag.emit(
                DiagKind::ShapeChanged,
                format!("collection change on non-array mirror {handle}"),
            );
            return Vec::new();
        }
    };
    let none = AHashSet::new();

    match change {
        CapturedListChange::Insert { index, items } => {
            let at = if index > len {
                core.diag.emit(
                    DiagKind::ShapeChanged,
                    format!("insert at {index} clamped to {len}"),
                );
                len
            } else {
                index
            };
            let mut glue_items = Vec::with_capacity(items.len());
            let mut store_items = Vec::with_capacity(items.len());
            for item in &items {
                let (gv, sv) = resolve(core, state, item, &none);
                glue_items.push(gv);
                store_items.push(sv);
            }
            if let Some(entry) = state.map.get_mut(id)
                && let GluePayload::Array { items: mirror } = &mut entry.glue.payload
            {
                mirror.splice(at..at, glue_items);
            }
            store_splice(core, state, handle, at, 0, store_items);
            Vec::new()
        }
        CapturedListChange::Remove { index, count } => {
            if index >= len {
                core.diag.emit(
                    DiagKind::ShapeChanged,
                    format!("remove at {index} beyond length {len}"),
                );
                return Vec::new();
            }
            let count = count.min(len - index);
            let removed_refs = drain_refs(state, id, index, count);
            store_splice(core, state, handle, index, count, Vec::new());
            let outcome = state.map.release_edges(removed_refs);
            process_evictions(core, state, outcome)
        }
        CapturedListChange::Replace { index, items } => {
            if index >= len {
                core.diag.emit(
                    DiagKind::ShapeChanged,
                    format!("replace at {index} beyond length {len}"),
                );
                return Vec::new();
            }
            let count = items.len().min(len - index);
            if count < items.len() {
                core.diag.emit(
                    DiagKind::ShapeChanged,
                    format!("replace truncated to {count} items at {index}"),
                );
            }
            let mut glue_items = Vec::with_capacity(count);
            let mut store_items = Vec::with_capacity(count);
            for item in items.iter().take(count) {
                let (gv, sv) = resolve(core, state, item, &none);
                glue_items.push(gv);
                store_items.push(sv);
            }
            let removed_refs = drain_refs(state, id, index, count);
            if let Some(entry) = state.map.get_mut(id)
                && let GluePayload::Array { items: mirror } = &mut entry.glue.payload
            {
                mirror.splice(index..index, glue_items);
            }
            store_splice(core, state, handle, index, count, store_items);
            let outcome = state.map.release_edges(removed_refs);
            process_evictions(core, state, outcome)
        }
        CapturedListChange::Move { from, to } => {
            if from >= len || to >= len {
                core.diag.emit(
                    DiagKind::ShapeChanged,
                    format!("move {from}->{to} out of range for length {len}"),
                );
                return Vec::new();
            }
            if from == to {
                return Vec::new();
            }
            // Identity is preserved: the edge travels, no ref churn.
            let moved = {
                let Some(entry) = state.map.get_mut(id) else {
                    return Vec::new();
                };
                let GluePayload::Array { items: mirror } = &mut entry.glue.payload else {
                    return Vec::new();
                };
                let value = mirror.remove(from);
                mirror.insert(to, value.clone());
                value
            };
            let sv = match &moved {
                GlueValue::Scalar(s) => StoreValue::Scalar(s.clone()),
                GlueValue::Ref(rid) => match state.map.handle_of(*rid) {
                    Some(h) => StoreValue::Ref(h),
                    None => StoreValue::null(),
                },
            };
            store_splice(core, state, handle, from, 1, Vec::new());
            store_splice(core, state, handle, to, 0, vec![sv]);
            Vec::new()
        }
        CapturedListChange::Reset { items } => {
            let mut glue_items = Vec::with_capacity(items.len());
            let mut store_items = Vec::with_capacity(items.len());
            for item in &items {
                let (gv, sv) = resolve(core, state, item, &none);
                glue_items.push(gv);
                store_items.push(sv);
            }
            let removed_refs = drain_refs(state, id, 0, len);
            if let Some(entry) = state.map.get_mut(id)
                && let GluePayload::Array { items: mirror } = &mut entry.glue.payload
            {
                *mirror = glue_items;
            }
            store_splice(core, state, handle, 0, len, store_items);
            let outcome = state.map.release_edges(removed_refs);
            process_evictions(core, state, outcome)
        }
    }
}

/// Remove `count` mirror items at `index`, returning the reference edges
/// they carried.
fn drain_refs(state: &mut EngineState, id: HostId, index: usize, count: usize) -> Vec<HostId> {
    let Some(entry) = state.map.get_mut(id) else {
        return Vec::new();
    };
    let GluePayload::Array { items } = &mut entry.glue.payload else {
        return Vec::new();
    };
    items
        .splice(index..index + count, std::iter::empty())
        .filter_map(|v| v.ref_id())
        .collect()
}

/// Re-apply a node's freshly captured state through the normal update path.
/// Cheap when nothing moved between capture and subscribe.
fn apply_refresh_payload(
    core: &SharedCore,
    state: &mut EngineState,
    refresh: NodeRefresh,
) -> Vec<ListenerHandle> {
    match refresh.payload {
        crate::snapshot::CapturedPayload::Object { props } => {
            let mut releases = Vec::new();
            for prop in props {
                releases.extend(apply_property_update(
                    core,
                    state,
                    refresh.id,
                    &prop.name,
                    &prop.value,
                ));
            }
            releases
        }
        crate::snapshot::CapturedPayload::Array { items } => {
            let unchanged = {
                let Some(entry) = state.map.get(refresh.id) else {
                    return Vec::new();
                };
                match &entry.glue.payload {
                    GluePayload::Array { items: old } => {
                        old.len() == items.len()
                            && old.iter().zip(&items).all(|(o, n)| edge_equal(o, n))
                    }
                    _ => return Vec::new(),
                }
            };
            if unchanged {
                return Vec::new();
            }
            apply_list_update(core, state, refresh.id, CapturedListChange::Reset { items })
        }
        crate::snapshot::CapturedPayload::Command { enabled } => {
            apply_enabled_update(core, state, refresh.id, enabled);
            Vec::new()
        }
    }
}
