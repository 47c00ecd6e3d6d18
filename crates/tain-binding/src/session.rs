#![forbid(unsafe_code)]

//! Session and root coordination.
//!
//! [`Binder`] owns a pair of execution contexts and the per-binder rule that
//! a root object is bound at most once. [`Binder::bind`] drives the phase
//! machine `Unbound -> Binding -> Bound`: capture the host graph on the host
//! context, materialize it on the script context, subscribe listeners on the
//! host context, then heal anything that moved in between. The returned
//! [`BindingSession`] is fully wired.
//!
//! The script-to-host flow also lives here: the store sink filters echoes at
//! fire time and posts everything else; `apply_script_*` validate against
//! the mirror, update glue optimistically, and marshal one host write to the
//! host context, where the write runs inside a suppression window and the
//! host's actual value is read back so rejections and coercions flow forward
//! instead of silently diverging.
//!
//! # Invariants
//!
//! - The engine lock is taken from script-context tasks only.
//! - `dispose` is idempotent, callable from either context, and serializes
//!   behind in-flight applies before any listener is released.
//! - After `Disposed`, every script event degrades to a drop.
//!
//! # Failure Modes
//!
//! [`Binder::bind`] fails only for an already-bound root, a dead context, or
//! a store that cannot allocate the root mirror; everything else degrades to
//! diagnostics per the error taxonomy.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use ahash::AHashSet;

use tain_core::host::ListChange;
use tain_core::{
    COMMAND_ENABLED, CommandRef, HostId, HostValue, ListRef, ObjectRef, READ_ONLY_FLAG,
    ScalarValue, ScriptChange, ScriptHandle, ScriptSink, ScriptStore, StoreError, StoreValue,
    ValueKind, is_reserved_property,
};

use crate::builder::{attach, process_evictions, store_set, store_splice};
use crate::diag::{DiagHub, DiagKind, DiagSink, Diagnostic};
use crate::dispatch::{ContextPair, DispatchError, block_on};
use crate::echo::{Silencer, SlotKey};
use crate::glue::{GluePayload, GlueProperty, GlueValue, SourceRef};
use crate::graph::{BindingMap, RootEdge};
use crate::observer::{
    HostWork, ListenerHandle, apply_host_property, install_and_refresh, post_host_work,
    subscribe_batch,
};
use crate::snapshot::{Capture, CapturedValue, SourceStrong, capture_refresh, capture_value};

// ---------------------------------------------------------------------------
// Phases, modes, options
// ---------------------------------------------------------------------------

/// Lifecycle of one binding session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionPhase {
    Unbound = 0,
    Binding = 1,
    Bound = 2,
    Disposed = 3,
}

impl SessionPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unbound,
            1 => Self::Binding,
            2 => Self::Bound,
            _ => Self::Disposed,
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unbound => "unbound",
            Self::Binding => "binding",
            Self::Bound => "bound",
            Self::Disposed => "disposed",
        };
        f.write_str(label)
    }
}

/// Which directions a session synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BindingMode {
    /// Mirror once at bind time; no listeners, no observation.
    OneTime,
    /// Host changes flow to the script side only.
    OneWay,
    /// Both directions.
    #[default]
    TwoWay,
    /// Script changes flow to the host side only.
    OneWayToSource,
}

impl BindingMode {
    /// Host mutations are forwarded to the script side.
    #[must_use]
    pub fn host_to_script(self) -> bool {
        matches!(self, Self::OneWay | Self::TwoWay)
    }

    /// Script mutations are applied to the host side.
    #[must_use]
    pub fn script_to_host(self) -> bool {
        matches!(self, Self::TwoWay | Self::OneWayToSource)
    }
}

impl fmt::Display for BindingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::OneTime => "one-time",
            Self::OneWay => "one-way",
            Self::TwoWay => "two-way",
            Self::OneWayToSource => "one-way-to-source",
        };
        f.write_str(label)
    }
}

/// Knobs for one binding session.
#[derive(Debug, Clone)]
pub struct BindingOptions {
    pub mode: BindingMode,
    /// Entries kept in the in-memory diagnostics ring.
    pub diagnostics_capacity: usize,
}

impl Default for BindingOptions {
    fn default() -> Self {
        Self {
            mode: BindingMode::TwoWay,
            diagnostics_capacity: 64,
        }
    }
}

/// Why a bind call failed.
#[derive(Debug)]
pub enum BindError {
    /// The root object already has a live session in this binder.
    AlreadyBound,
    /// A context died before the bind completed.
    Dispatch(DispatchError),
    /// The store could not allocate the root mirror.
    Store(StoreError),
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyBound => write!(f, "root object is already bound in this binder"),
            Self::Dispatch(e) => write!(f, "binding dispatch failed: {e}"),
            Self::Store(e) => write!(f, "script store failed: {e}"),
        }
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AlreadyBound => None,
            Self::Dispatch(e) => Some(e),
            Self::Store(e) => Some(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared engine state
// ---------------------------------------------------------------------------

/// Everything behind the engine lock. Touched from script-context tasks
/// only.
pub(crate) struct EngineState {
    pub map: BindingMap,
    pub store: Box<dyn ScriptStore>,
}

/// State shared by the session, its sinks, and its posted tasks.
pub(crate) struct SharedCore {
    pub contexts: ContextPair,
    pub mode: BindingMode,
    pub state: Mutex<EngineState>,
    pub phase: AtomicU8,
    pub host_silence: Silencer<(HostId, SlotKey)>,
    pub script_silence: Silencer<(ScriptHandle, SlotKey)>,
    pub diag: DiagHub,
}

impl SharedCore {
    pub(crate) fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn swap_phase(&self, phase: SessionPhase) -> SessionPhase {
        SessionPhase::from_u8(self.phase.swap(phase as u8, Ordering::SeqCst))
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Binder
// ---------------------------------------------------------------------------

/// Per-script-window coordinator. Owns the context pair and the rule that a
/// root object has at most one live session.
#[derive(Debug)]
pub struct Binder {
    contexts: ContextPair,
    roots: Arc<Mutex<AHashSet<HostId>>>,
}

impl Binder {
    #[must_use]
    pub fn new(contexts: ContextPair) -> Self {
        Self {
            contexts,
            roots: Arc::new(Mutex::new(AHashSet::new())),
        }
    }

    /// Mirror `root` into `store` and return the live session.
    ///
    /// Blocks until the initial mirror is fully wired: every reachable node
    /// materialized and, in host-observing modes, subscribed.
    ///
    /// # Errors
    ///
    /// [`BindError::AlreadyBound`] if `root` has a live session here,
    /// [`BindError::Store`] if the store cannot allocate the root mirror,
    /// [`BindError::Dispatch`] if a context died mid-bind.
    pub fn bind(
        &self,
        root: HostValue,
        store: Box<dyn ScriptStore>,
        options: BindingOptions,
    ) -> Result<BindingSession, BindError> {
        let root_id = root.identity();
        if let Some(id) = root_id {
            let mut roots = lock_roots(&self.roots);
            if !roots.insert(id) {
                return Err(BindError::AlreadyBound);
            }
        }

        let core = Arc::new(SharedCore {
            contexts: self.contexts.clone(),
            mode: options.mode,
            state: Mutex::new(EngineState {
                map: BindingMap::new(),
                store,
            }),
            phase: AtomicU8::new(SessionPhase::Unbound as u8),
            host_silence: Silencer::new(),
            script_silence: Silencer::new(),
            diag: DiagHub::new(options.diagnostics_capacity),
        });
        core.set_phase(SessionPhase::Binding);
        tracing::debug!(target: "tain::session", mode = %options.mode, "binding root");

        match bind_inner(&core, root) {
            Ok(root_handle) => {
                core.set_phase(SessionPhase::Bound);
                tracing::debug!(target: "tain::session", handle = %root_handle, "session bound");
                Ok(BindingSession {
                    core,
                    root_handle,
                    root_id,
                    roots: Arc::downgrade(&self.roots),
                })
            }
            Err(e) => {
                teardown(&core);
                if let Some(id) = root_id {
                    lock_roots(&self.roots).remove(&id);
                }
                Err(e)
            }
        }
    }
}

fn lock_roots(roots: &Mutex<AHashSet<HostId>>) -> MutexGuard<'_, AHashSet<HostId>> {
    roots.lock().unwrap_or_else(|e| e.into_inner())
}

fn bind_inner(core: &Arc<SharedCore>, root: HostValue) -> Result<ScriptHandle, BindError> {
    // Capture the whole reachable graph on the host context.
    let cap = block_on(&*core.contexts.host, move || capture_value(&root))
        .map_err(BindError::Dispatch)?;

    // Materialize on the script context and pin the root edge. The store
    // sink goes in first so script mutations are never unreported.
    let sink = make_store_sink(Arc::downgrade(core));
    let task_core = Arc::clone(core);
    let (root_handle, subs) = block_on(&*core.contexts.script, move || {
        let mut state = task_core.lock_state();
        state.store.subscribe(sink);
        let outcome = attach(&task_core, &mut state, cap.nodes, cap.notes);
        let (handle, edge) = match cap.root {
            CapturedValue::Scalar(s) => {
                let h = state.store.create_scalar(&s).map_err(BindError::Store)?;
                (h, RootEdge::Scalar(h))
            }
            CapturedValue::Ref(id) => match state.map.handle_of(id) {
                Some(h) => {
                    state.map.bump_ref(id);
                    (h, RootEdge::Node(id))
                }
                None => {
                    return Err(BindError::Store(StoreError::Unsupported(
                        "allocate root mirror node".into(),
                    )));
                }
            },
        };
        state.map.set_root(edge);
        Ok((handle, outcome.new_subscriptions))
    })
    .map_err(BindError::Dispatch)??;

    // Subscribe on the host context, then install and heal on the script
    // context. Blocking keeps the session fully wired on return.
    if !subs.is_empty() {
        let sub_core = Arc::clone(core);
        let (handles, refresh) = block_on(&*core.contexts.host, move || {
            subscribe_batch(&sub_core, subs)
        })
        .map_err(BindError::Dispatch)?;
        let install_core = Arc::clone(core);
        block_on(&*core.contexts.script, move || {
            install_and_refresh(&install_core, handles, refresh);
        })
        .map_err(BindError::Dispatch)?;
    }
    Ok(root_handle)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One live root binding. Dispose it (or drop it) to tear every listener
/// and mirror handle down.
pub struct BindingSession {
    core: Arc<SharedCore>,
    root_handle: ScriptHandle,
    root_id: Option<HostId>,
    roots: Weak<Mutex<AHashSet<HostId>>>,
}

impl BindingSession {
    /// Handle of the root mirror in the script store.
    #[must_use]
    pub fn root_handle(&self) -> ScriptHandle {
        self.root_handle
    }

    #[must_use]
    pub fn mode(&self) -> BindingMode {
        self.core.mode
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.core.phase()
    }

    /// Tear the session down: release every mirror handle and listener.
    /// Idempotent, callable from either context.
    pub fn dispose(&self) {
        if self.core.swap_phase(SessionPhase::Disposed) == SessionPhase::Disposed {
            return;
        }
        tracing::debug!(target: "tain::session", handle = %self.root_handle, "disposing");
        if let (Some(id), Some(roots)) = (self.root_id, self.roots.upgrade()) {
            lock_roots(&roots).remove(&id);
        }
        teardown(&self.core);
    }

    /// Read-only view of the current mirror, for inspection and tests.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ContextGone`] if the script context died.
    pub fn snapshot(&self) -> Result<MirrorSnapshot, DispatchError> {
        let core = Arc::clone(&self.core);
        let root_handle = self.root_handle;
        block_on(&*self.core.contexts.script, move || {
            let state = core.lock_state();
            build_snapshot(&state, root_handle)
        })
    }

    /// Counters over the tracked graph.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ContextGone`] if the script context died.
    pub fn stats(&self) -> Result<BindingStats, DispatchError> {
        let core = Arc::clone(&self.core);
        block_on(&*self.core.contexts.script, move || {
            let state = core.lock_state();
            let mut live_listeners = 0;
            let mut observed_handles = 0;
            for (_, entry) in state.map.iter() {
                if entry.listener.is_some() {
                    live_listeners += 1;
                }
                if entry.observed {
                    observed_handles += 1;
                }
            }
            BindingStats {
                phase: core.phase(),
                mode: core.mode,
                tracked_nodes: state.map.len(),
                live_listeners,
                observed_handles,
            }
        })
    }

    /// Recent diagnostics, oldest first.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.core.diag.recent()
    }

    /// Install or remove an external diagnostics sink.
    pub fn set_diag_sink(&self, sink: Option<Box<dyn DiagSink>>) {
        self.core.diag.set_sink(sink);
    }
}

impl Drop for BindingSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for BindingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingSession")
            .field("root", &self.root_handle)
            .field("mode", &self.core.mode)
            .field("phase", &self.core.phase())
            .finish()
    }
}

/// Shared teardown for dispose and failed binds. Serializes behind in-flight
/// script work; listener release is posted to the host context.
fn teardown(core: &Arc<SharedCore>) {
    core.set_phase(SessionPhase::Disposed);
    let task_core = Arc::clone(core);
    let released = block_on(&*core.contexts.script, move || {
        let mut state = task_core.lock_state();
        teardown_state(&mut state)
    });
    let releases = match released {
        Ok(releases) => releases,
        // Script context already gone: its queue is drained, nothing else
        // can hold the lock, so tear down from here.
        Err(DispatchError::ContextGone | DispatchError::Spawn(_)) => {
            let mut state = core.lock_state();
            teardown_state(&mut state)
        }
    };
    if !releases.is_empty() {
        post_host_work(
            core,
            HostWork {
                releases,
                subscribes: Vec::new(),
            },
        );
    }
}

fn teardown_state(state: &mut EngineState) -> Vec<ListenerHandle> {
    state.store.unsubscribe();
    if let Some(RootEdge::Scalar(h)) = state.map.root() {
        // Best effort; the store may be gone too.
        let _ = state.store.release(h);
    }
    let evictions = state.map.take_all();
    let mut releases = Vec::with_capacity(evictions.len());
    for eviction in evictions {
        let _ = state.store.release(eviction.handle);
        if let Some(listener) = eviction.listener {
            releases.push(listener);
        }
    }
    releases
}

// ---------------------------------------------------------------------------
// Mirror views
// ---------------------------------------------------------------------------

/// A glue edge as shown to inspectors.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ViewValue {
    Scalar(ScalarValue),
    Node(ScriptHandle),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PropertyView {
    pub name: String,
    pub value: ViewValue,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeShape {
    Object { properties: Vec<PropertyView> },
    Array { items: Vec<ViewValue> },
    Command { enabled: bool },
}

/// One tracked mirror node.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeView {
    pub handle: ScriptHandle,
    pub kind: ValueKind,
    /// Incoming mirror edges, the root edge included.
    pub refs: usize,
    pub has_listener: bool,
    pub observed: bool,
    pub shape: NodeShape,
}

/// Point-in-time view of the whole mirror.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MirrorSnapshot {
    pub root_handle: ScriptHandle,
    /// Tracked nodes, ordered by handle. Empty for scalar roots and
    /// disposed sessions.
    pub nodes: Vec<NodeView>,
}

impl MirrorSnapshot {
    #[must_use]
    pub fn node(&self, handle: ScriptHandle) -> Option<&NodeView> {
        self.nodes.iter().find(|n| n.handle == handle)
    }

    #[must_use]
    pub fn root(&self) -> Option<&NodeView> {
        self.node(self.root_handle)
    }
}

/// Counters over one session's tracked graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingStats {
    pub phase: SessionPhase,
    pub mode: BindingMode,
    pub tracked_nodes: usize,
    pub live_listeners: usize,
    pub observed_handles: usize,
}

fn build_snapshot(state: &EngineState, root_handle: ScriptHandle) -> MirrorSnapshot {
    let mut nodes: Vec<NodeView> = state
        .map
        .iter()
        .map(|(_, entry)| {
            let shape = match &entry.glue.payload {
                GluePayload::Object { props } => NodeShape::Object {
                    properties: props
                        .iter()
                        .map(|(name, prop)| PropertyView {
                            name: name.clone(),
                            value: view_value(state, &prop.value),
                            read_only: prop.read_only,
                        })
                        .collect(),
                },
                GluePayload::Array { items } => NodeShape::Array {
                    items: items.iter().map(|v| view_value(state, v)).collect(),
                },
                GluePayload::Command { enabled } => NodeShape::Command { enabled: *enabled },
            };
            NodeView {
                handle: entry.glue.handle,
                kind: entry.glue.kind(),
                refs: entry.refs,
                has_listener: entry.listener.is_some(),
                observed: entry.observed,
                shape,
            }
        })
        .collect();
    nodes.sort_by_key(|n| n.handle);
    MirrorSnapshot { root_handle, nodes }
}

fn view_value(state: &EngineState, value: &GlueValue) -> ViewValue {
    match value {
        GlueValue::Scalar(s) => ViewValue::Scalar(s.clone()),
        GlueValue::Ref(id) => match state.map.handle_of(*id) {
            Some(h) => ViewValue::Node(h),
            None => ViewValue::Scalar(ScalarValue::Null),
        },
    }
}

// ---------------------------------------------------------------------------
// Script-to-host flow
// ---------------------------------------------------------------------------

fn make_store_sink(core: Weak<SharedCore>) -> ScriptSink {
    Box::new(move |change: ScriptChange| {
        let Some(core) = core.upgrade() else { return };
        if core.phase() == SessionPhase::Disposed {
            return;
        }
        let slot = match &change {
            ScriptChange::PropertySet { target, name, .. } => {
                Some((*target, SlotKey::property(name)))
            }
            ScriptChange::Splice { target, .. } => Some((*target, SlotKey::Items)),
            ScriptChange::Invoke { .. } => None,
        };
        if let Some(slot) = slot
            && core.script_silence.is_silenced(&slot)
        {
            tracing::trace!(target: "tain::echo", handle = %slot.0, "script echo suppressed");
            return;
        }
        let task_core = Arc::clone(&core);
        core.contexts
            .script
            .post(Box::new(move || apply_script_change(&task_core, change)));
    })
}

fn apply_script_change(core: &Arc<SharedCore>, change: ScriptChange) {
    if core.phase() == SessionPhase::Disposed {
        tracing::trace!(target: "tain::script", "change after dispose dropped");
        return;
    }
    match change {
        ScriptChange::PropertySet {
            target,
            name,
            value,
        } => apply_script_property(core, target, name, value),
        ScriptChange::Splice {
            target,
            index,
            remove,
            items,
        } => apply_script_splice(core, target, index, remove, items),
        ScriptChange::Invoke { target, args } => apply_script_invoke(core, target, args),
    }
}

fn apply_script_property(
    core: &Arc<SharedCore>,
    target: ScriptHandle,
    name: String,
    value: StoreValue,
) {
    if !core.mode.script_to_host() {
        core.diag.emit(
            DiagKind::ModeSuppressed,
            format!("script write to {target}.{name} dropped in {} mode", core.mode),
        );
        return;
    }
    let mut work = HostWork::default();
    let prepared = {
        let mut state = core.lock_state();
        prepare_script_property(core, &mut state, target, &name, &value, &mut work)
    };
    post_host_work(core, work);
    if let Some((obj, id, host_value)) = prepared {
        let task_core = Arc::clone(core);
        core.contexts.host.post(Box::new(move || {
            write_host_property(&task_core, obj, id, name, host_value);
        }));
    }
}

/// Validate a script property write against the mirror and apply it to the
/// glue. Returns the host write to marshal, if any.
fn prepare_script_property(
    core: &SharedCore,
    state: &mut EngineState,
    target: ScriptHandle,
    name: &str,
    value: &StoreValue,
    work: &mut HostWork,
) -> Option<(ObjectRef, HostId, HostValue)> {
    let Some(id) = state.map.id_of(target) else {
        core.diag.emit(
            DiagKind::DanglingHandle,
            format!("script wrote evicted handle {target}"),
        );
        return None;
    };
    if is_reserved_property(name) {
        let flag = state
            .map
            .get(id)
            .map(|e| e.glue.writable_properties() == 0);
        if let Some(flag) = flag {
            store_set(
                core,
                state,
                target,
                READ_ONLY_FLAG,
                StoreValue::Scalar(ScalarValue::Bool(flag)),
            );
        }
        core.diag.emit(
            DiagKind::UnknownProperty,
            format!("script wrote reserved property {name:?}"),
        );
        return None;
    }
    let entry = state.map.get(id)?;
    let source = entry.glue.source.clone();
    let (old_value, read_only) = match &entry.glue.payload {
        GluePayload::Object { props } => match props.get(name) {
            Some(prop) => (prop.value.clone(), prop.read_only),
            None => {
                core.diag.emit(
                    DiagKind::UnknownProperty,
                    format!("script wrote undeclared property {name:?}"),
                );
                return None;
            }
        },
        GluePayload::Command { enabled } => {
            // Enablement is engine managed; snap it back.
            if name == COMMAND_ENABLED {
                let enabled = *enabled;
                store_set(
                    core,
                    state,
                    target,
                    COMMAND_ENABLED,
                    StoreValue::Scalar(ScalarValue::Bool(enabled)),
                );
            }
            core.diag.emit(
                DiagKind::UnknownProperty,
                format!("script wrote command property {name:?}"),
            );
            return None;
        }
        GluePayload::Array { .. } => {
            core.diag.emit(
                DiagKind::ShapeChanged,
                format!("property write on array mirror {target}"),
            );
            return None;
        }
    };
    if read_only {
        core.diag.emit(
            DiagKind::ReadOnlyRejected,
            format!("script wrote read-only property {name:?}"),
        );
        let sv = store_value_of(state, &old_value);
        store_set(core, state, target, name, sv);
        return None;
    }
    // D4: scalars pass through; a handle must resolve to a live tracked
    // node's host object.
    let (host_value, new_glue) = match value {
        StoreValue::Scalar(s) => (HostValue::Scalar(s.clone()), GlueValue::Scalar(s.clone())),
        StoreValue::Ref(h) => {
            let resolved = state
                .map
                .id_of(*h)
                .and_then(|rid| {
                    state
                        .map
                        .get(rid)
                        .and_then(|e| e.glue.source.upgrade())
                        .map(|v| (rid, v))
                });
            match resolved {
                Some((rid, v)) => (v, GlueValue::Ref(rid)),
                None => {
                    core.diag.emit(
                        DiagKind::DanglingHandle,
                        format!("script wrote unresolvable handle {h} to {name:?}"),
                    );
                    let sv = store_value_of(state, &old_value);
                    store_set(core, state, target, name, sv);
                    return None;
                }
            }
        }
    };
    if match (&old_value, &new_glue) {
        (GlueValue::Scalar(a), GlueValue::Scalar(b)) => a == b,
        (GlueValue::Ref(a), GlueValue::Ref(b)) => a == b,
        _ => false,
    } {
        return None;
    }
    // The host echo is suppressed, so the glue is updated now; a rejection
    // or coercion flows back through the reconcile read.
    if let Some(rid) = new_glue.ref_id() {
        state.map.bump_ref(rid);
    }
    let displaced = old_value.ref_id();
    if let Some(entry) = state.map.get_mut(id)
        && let GluePayload::Object { props } = &mut entry.glue.payload
    {
        props.insert(
            name.to_string(),
            GlueProperty {
                value: new_glue,
                read_only,
            },
        );
    }
    if let Some(old_id) = displaced {
        let outcome = state.map.release_edges(vec![old_id]);
        work.releases.extend(process_evictions(core, state, outcome));
    }
    match source {
        SourceRef::Object(w) => match w.upgrade() {
            Some(obj) => Some((obj, id, host_value)),
            None => {
                core.diag.emit(
                    DiagKind::DanglingHandle,
                    format!("host object behind {target} is gone"),
                );
                None
            }
        },
        _ => None,
    }
}

/// Host-context property write with echo suppression and read-back.
fn write_host_property(
    core: &Arc<SharedCore>,
    obj: ObjectRef,
    id: HostId,
    name: String,
    value: HostValue,
) {
    if core.phase() == SessionPhase::Disposed {
        return;
    }
    let key = (id, SlotKey::property(&name));
    core.host_silence.silence(key.clone());
    let accepted = obj.set_property(&name, value.clone());
    core.host_silence.unsilence(&key);
    if !accepted {
        core.diag.emit(
            DiagKind::ReadOnlyRejected,
            format!("host rejected write to {name:?}"),
        );
    }
    // Read back: a rejected or coerced write leaves the host at a value the
    // mirror does not show yet.
    let now = obj.property(&name);
    let diverged = match (&now, accepted) {
        (_, false) => true,
        (Some(current), true) => !host_values_equivalent(current, &value),
        (None, true) => false,
    };
    if diverged {
        let cap = match &now {
            Some(v) => capture_value(v),
            None => Capture {
                root: CapturedValue::Scalar(ScalarValue::Null),
                nodes: Vec::new(),
                notes: Vec::new(),
            },
        };
        let task_core = Arc::clone(core);
        core.contexts
            .script
            .post(Box::new(move || apply_host_property(&task_core, id, name, cap)));
    }
}

fn apply_script_splice(
    core: &Arc<SharedCore>,
    target: ScriptHandle,
    index: usize,
    remove: usize,
    items: Vec<StoreValue>,
) {
    if !core.mode.script_to_host() {
        core.diag.emit(
            DiagKind::ModeSuppressed,
            format!("script splice on {target} dropped in {} mode", core.mode),
        );
        return;
    }
    let mut work = HostWork::default();
    let prepared = {
        let mut state = core.lock_state();
        prepare_script_splice(core, &mut state, target, index, remove, items, &mut work)
    };
    post_host_work(core, work);
    if let Some((list, id, ops)) = prepared {
        let task_core = Arc::clone(core);
        core.contexts.host.post(Box::new(move || {
            write_host_splice(&task_core, list, id, ops);
        }));
    }
}

/// Validate a script splice against the mirror, apply it to the glue, and
/// build the host-side operations.
fn prepare_script_splice(
    core: &SharedCore,
    state: &mut EngineState,
    target: ScriptHandle,
    index: usize,
    remove: usize,
    items: Vec<StoreValue>,
    work: &mut HostWork,
) -> Option<(ListRef, HostId, Vec<ListChange>)> {
    let Some(id) = state.map.id_of(target) else {
        core.diag.emit(
            DiagKind::DanglingHandle,
            format!("script spliced evicted handle {target}"),
        );
        return None;
    };
    let entry = state.map.get(id)?;
    let source = entry.glue.source.clone();
    let mirrored = match &entry.glue.payload {
        GluePayload::Array { items } => items.clone(),
        _ => {
            core.diag.emit(
                DiagKind::ShapeChanged,
                format!("script splice on non-array mirror {target}"),
            );
            return None;
        }
    };
    let len = mirrored.len();
    if index > len || remove > len - index {
        core.diag.emit(
            DiagKind::ShapeChanged,
            format!("script splice {index}+{remove} outside mirrored length {len}"),
        );
        return None;
    }
    let inserted = items.len();
    let mut host_items = Vec::with_capacity(items.len());
    let mut glue_items = Vec::with_capacity(items.len());
    for item in items {
        match item {
            StoreValue::Scalar(s) => {
                host_items.push(HostValue::Scalar(s.clone()));
                glue_items.push(GlueValue::Scalar(s));
            }
            StoreValue::Ref(h) => {
                let resolved = state.map.id_of(h).and_then(|rid| {
                    state
                        .map
                        .get(rid)
                        .and_then(|e| e.glue.source.upgrade())
                        .map(|v| (rid, v))
                });
                match resolved {
                    Some((rid, v)) => {
                        host_items.push(v);
                        glue_items.push(GlueValue::Ref(rid));
                    }
                    None => {
                        core.diag.emit(
                            DiagKind::DanglingHandle,
                            format!("script spliced unresolvable handle {h}"),
                        );
                        // The slot already holds the script's items; put the
                        // mirrored ones back in their place.
                        let restore = mirrored[index..index + remove]
                            .iter()
                            .map(|gv| store_value_of(state, gv))
                            .collect();
                        store_splice(core, state, target, index, inserted, restore);
                        return None;
                    }
                }
            }
        }
    }
    // Attach the new edges before the displaced ones go.
    for gv in &glue_items {
        if let Some(rid) = gv.ref_id() {
            state.map.bump_ref(rid);
        }
    }
    let mut removed_refs = Vec::new();
    if let Some(entry) = state.map.get_mut(id)
        && let GluePayload::Array { items: mirror } = &mut entry.glue.payload
    {
        removed_refs = mirror
            .splice(index..index + remove, glue_items)
            .filter_map(|v| v.ref_id())
            .collect();
    }
    if !removed_refs.is_empty() {
        let outcome = state.map.release_edges(removed_refs);
        work.releases.extend(process_evictions(core, state, outcome));
    }
    let mut ops = Vec::new();
    if remove > 0 {
        ops.push(ListChange::Remove {
            index,
            count: remove,
        });
    }
    if !host_items.is_empty() {
        ops.push(ListChange::Insert {
            index,
            items: host_items,
        });
    }
    match source {
        SourceRef::List(w) => match w.upgrade() {
            Some(list) => Some((list, id, ops)),
            None => {
                core.diag.emit(
                    DiagKind::DanglingHandle,
                    format!("host list behind {target} is gone"),
                );
                None
            }
        },
        _ => None,
    }
}

/// Host-context splice with echo suppression and a reconciling re-read.
fn write_host_splice(core: &Arc<SharedCore>, list: ListRef, id: HostId, ops: Vec<ListChange>) {
    if core.phase() == SessionPhase::Disposed {
        return;
    }
    let key = (id, SlotKey::Items);
    core.host_silence.silence(key.clone());
    let mut accepted = true;
    for op in &ops {
        if !list.apply(op) {
            accepted = false;
            break;
        }
    }
    core.host_silence.unsilence(&key);
    if !accepted {
        core.diag
            .emit(DiagKind::ReadOnlyRejected, "host rejected collection splice");
    }
    // Converge on whatever the host actually holds now. No-ops when the
    // mirror already matches.
    let refresh = capture_refresh(vec![(id, SourceStrong::List(list))]);
    let task_core = Arc::clone(core);
    core.contexts.script.post(Box::new(move || {
        install_and_refresh(&task_core, Vec::new(), refresh);
    }));
}

fn apply_script_invoke(core: &Arc<SharedCore>, target: ScriptHandle, args: Vec<StoreValue>) {
    // A call, not state sync: honored in every live mode.
    let prepared = {
        let state = core.lock_state();
        prepare_script_invoke(core, &state, target, args)
    };
    if let Some((cmd, arg)) = prepared {
        let task_core = Arc::clone(core);
        core.contexts.host.post(Box::new(move || {
            if task_core.phase() != SessionPhase::Disposed {
                cmd.execute(arg);
            }
        }));
    }
}

fn prepare_script_invoke(
    core: &SharedCore,
    state: &EngineState,
    target: ScriptHandle,
    args: Vec<StoreValue>,
) -> Option<(CommandRef, HostValue)> {
    let Some(id) = state.map.id_of(target) else {
        core.diag.emit(
            DiagKind::DanglingHandle,
            format!("script invoked evicted handle {target}"),
        );
        return None;
    };
    let entry = state.map.get(id)?;
    let SourceRef::Command(w) = &entry.glue.source else {
        core.diag.emit(
            DiagKind::ShapeChanged,
            format!("script invoked non-command handle {target}"),
        );
        return None;
    };
    let Some(cmd) = w.upgrade() else {
        core.diag.emit(
            DiagKind::DanglingHandle,
            format!("host command behind {target} is gone"),
        );
        return None;
    };
    let arg = match args.into_iter().next() {
        None => HostValue::null(),
        Some(StoreValue::Scalar(s)) => HostValue::Scalar(s),
        Some(StoreValue::Ref(h)) => {
            match state
                .map
                .id_of(h)
                .and_then(|rid| state.map.get(rid))
                .and_then(|e| e.glue.source.upgrade())
            {
                Some(v) => v,
                None => {
                    core.diag.emit(
                        DiagKind::DanglingHandle,
                        format!("command argument handle {h} unresolvable, passing null"),
                    );
                    HostValue::null()
                }
            }
        }
    };
    tracing::trace!(target: "tain::script", handle = %target, "command invoked");
    Some((cmd, arg))
}

fn store_value_of(state: &EngineState, value: &GlueValue) -> StoreValue {
    match value {
        GlueValue::Scalar(s) => StoreValue::Scalar(s.clone()),
        GlueValue::Ref(id) => state
            .map
            .handle_of(*id)
            .map_or_else(StoreValue::null, StoreValue::Ref),
    }
}

fn host_values_equivalent(a: &HostValue, b: &HostValue) -> bool {
    match (a, b) {
        (HostValue::Scalar(x), HostValue::Scalar(y)) => x == y,
        _ => match (a.identity(), b.identity()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── modes ────────────────────────────────────────────────────────

    #[test]
    fn mode_direction_matrix() {
        assert!(!BindingMode::OneTime.host_to_script());
        assert!(!BindingMode::OneTime.script_to_host());
        assert!(BindingMode::OneWay.host_to_script());
        assert!(!BindingMode::OneWay.script_to_host());
        assert!(BindingMode::TwoWay.host_to_script());
        assert!(BindingMode::TwoWay.script_to_host());
        assert!(!BindingMode::OneWayToSource.host_to_script());
        assert!(BindingMode::OneWayToSource.script_to_host());
    }

    #[test]
    fn default_options_are_two_way() {
        let options = BindingOptions::default();
        assert_eq!(options.mode, BindingMode::TwoWay);
        assert!(options.diagnostics_capacity > 0);
    }

    // ── phases ───────────────────────────────────────────────────────

    #[test]
    fn phase_round_trips_through_repr() {
        for phase in [
            SessionPhase::Unbound,
            SessionPhase::Binding,
            SessionPhase::Bound,
            SessionPhase::Disposed,
        ] {
            assert_eq!(SessionPhase::from_u8(phase as u8), phase);
        }
    }

    #[test]
    fn unknown_phase_reprs_read_as_disposed() {
        assert_eq!(SessionPhase::from_u8(200), SessionPhase::Disposed);
    }

    // ── errors ───────────────────────────────────────────────────────

    #[test]
    fn bind_error_display() {
        assert_eq!(
            BindError::AlreadyBound.to_string(),
            "root object is already bound in this binder"
        );
        let e = BindError::Store(StoreError::Unsupported("allocate root mirror node".into()));
        assert!(e.to_string().contains("allocate root mirror node"));
    }

    #[test]
    fn host_value_equivalence_uses_identity_for_composites() {
        let a = HostValue::from(3i64);
        let b = HostValue::from(3i64);
        assert!(host_values_equivalent(&a, &b));
        assert!(!host_values_equivalent(
            &HostValue::from(3i64),
            &HostValue::from(3.0f64)
        ));
    }
}
