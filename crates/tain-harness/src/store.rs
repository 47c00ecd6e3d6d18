#![forbid(unsafe_code)]

//! Recording script store.
//!
//! [`RecordingStore`] is an in-memory [`ScriptStore`] with an inspection
//! surface. The test owns the `RecordingStore` and hands [`RecordingStore::client`]
//! to the binder; the two share state, so every engine mutation is visible
//! through `export`, `property`, `items` and the ordered event log.
//!
//! Script-initiated mutations are simulated with `script_set`,
//! `script_splice` and `script_invoke`: they mutate the slot like real
//! script code would and report through the installed sink per the store
//! contract (mutations only when the handle is observed, invokes always).
//!
//! # Invariants
//!
//! - The sink is called outside the store lock, so a sink that immediately
//!   drives the engine back into this store cannot deadlock.
//! - The event log records engine-applied calls only; script-simulated
//!   mutations are the test's own doing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Value, json};

use tain_core::{
    ScalarValue, ScriptChange, ScriptHandle, ScriptSink, ScriptStore, StoreError, StoreValue,
    ValueKind,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// One engine-applied store call, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Created {
        handle: ScriptHandle,
        kind: ValueKind,
    },
    Set {
        target: ScriptHandle,
        name: String,
        value: StoreValue,
    },
    Spliced {
        target: ScriptHandle,
        index: usize,
        remove: usize,
        items: Vec<StoreValue>,
    },
    Observed {
        target: ScriptHandle,
        observed: bool,
    },
    Released {
        target: ScriptHandle,
    },
}

enum SlotBody {
    Object { props: BTreeMap<String, StoreValue> },
    Array { items: Vec<StoreValue> },
    Command { props: BTreeMap<String, StoreValue> },
    Scalar(ScalarValue),
}

impl SlotBody {
    fn kind(&self) -> ValueKind {
        match self {
            Self::Object { .. } => ValueKind::Object,
            Self::Array { .. } => ValueKind::Array,
            Self::Command { .. } => ValueKind::Command,
            Self::Scalar(_) => ValueKind::Scalar,
        }
    }
}

struct Slot {
    observed: bool,
    body: SlotBody,
}

struct StoreInner {
    next: u64,
    slots: BTreeMap<ScriptHandle, Slot>,
    sink: Option<ScriptSink>,
    sink_gen: u64,
    events: Vec<StoreEvent>,
    /// Report script mutations even on unobserved handles. Models chatty
    /// embedders that cannot gate their notifications.
    chatty: bool,
}

impl StoreInner {
    fn slot_mut(&mut self, target: ScriptHandle) -> Result<&mut Slot, StoreError> {
        self.slots
            .get_mut(&target)
            .ok_or(StoreError::UnknownHandle(target))
    }

    fn create(&mut self, body: SlotBody) -> ScriptHandle {
        let handle = ScriptHandle::new(self.next);
        self.next += 1;
        self.events.push(StoreEvent::Created {
            handle,
            kind: body.kind(),
        });
        self.slots.insert(
            handle,
            Slot {
                observed: false,
                body,
            },
        );
        handle
    }
}

/// Call the sink with the store lock released. A subscribe or unsubscribe
/// that lands mid-call wins over restoring the taken sink.
fn fire(inner: &Arc<Mutex<StoreInner>>, change: ScriptChange) {
    let (mut sink, generation) = {
        let mut g = lock(inner);
        (g.sink.take(), g.sink_gen)
    };
    if let Some(s) = sink.as_mut() {
        s(change);
    }
    let mut g = lock(inner);
    if g.sink_gen == generation && g.sink.is_none() {
        g.sink = sink;
    }
}

/// In-memory script store with full inspection, for engine tests.
#[derive(Clone)]
pub struct RecordingStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for RecordingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                next: 1,
                slots: BTreeMap::new(),
                sink: None,
                sink_gen: 0,
                events: Vec::new(),
                chatty: false,
            })),
        }
    }

    /// A store that reports script mutations on every handle, observed or
    /// not.
    #[must_use]
    pub fn chatty() -> Self {
        let store = Self::new();
        lock(&store.inner).chatty = true;
        store
    }

    /// The [`ScriptStore`] face handed to the binder. Shares state with
    /// this inspector.
    #[must_use]
    pub fn client(&self) -> Box<dyn ScriptStore> {
        Box::new(StoreClient {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Script-side property write: mutate the slot, report through the
    /// sink when the handle is observed.
    ///
    /// # Errors
    ///
    /// Unknown handle or a non-object slot.
    pub fn script_set(
        &self,
        target: ScriptHandle,
        name: &str,
        value: StoreValue,
    ) -> Result<(), StoreError> {
        let observed = {
            let mut g = lock(&self.inner);
            let slot = g.slot_mut(target)?;
            match &mut slot.body {
                SlotBody::Object { props } | SlotBody::Command { props } => {
                    props.insert(name.to_string(), value.clone());
                }
                other => {
                    return Err(StoreError::KindMismatch {
                        handle: target,
                        expected: ValueKind::Object,
                        actual: other.kind(),
                    });
                }
            }
            slot.observed || g.chatty
        };
        tracing::trace!(target: "tain::harness", handle = %target, name, "scripted write");
        if observed {
            fire(
                &self.inner,
                ScriptChange::PropertySet {
                    target,
                    name: name.to_string(),
                    value,
                },
            );
        }
        Ok(())
    }

    /// Script-side splice: mutate the array slot, report when observed.
    ///
    /// # Errors
    ///
    /// Unknown handle, non-array slot, or out-of-range splice.
    pub fn script_splice(
        &self,
        target: ScriptHandle,
        index: usize,
        remove: usize,
        items: Vec<StoreValue>,
    ) -> Result<(), StoreError> {
        let observed = {
            let mut g = lock(&self.inner);
            let slot = g.slot_mut(target)?;
            let SlotBody::Array { items: stored } = &mut slot.body else {
                return Err(StoreError::KindMismatch {
                    handle: target,
                    expected: ValueKind::Array,
                    actual: slot.body.kind(),
                });
            };
            splice_slot(target, stored, index, remove, &items)?;
            slot.observed || g.chatty
        };
        tracing::trace!(target: "tain::harness", handle = %target, index, remove, "scripted splice");
        if observed {
            fire(
                &self.inner,
                ScriptChange::Splice {
                    target,
                    index,
                    remove,
                    items,
                },
            );
        }
        Ok(())
    }

    /// Script-side invocation. Reports through the sink regardless of
    /// observation state.
    ///
    /// # Errors
    ///
    /// Unknown handle or a non-command slot.
    pub fn script_invoke(
        &self,
        target: ScriptHandle,
        args: Vec<StoreValue>,
    ) -> Result<(), StoreError> {
        {
            let mut g = lock(&self.inner);
            let slot = g.slot_mut(target)?;
            if slot.body.kind() != ValueKind::Command {
                return Err(StoreError::KindMismatch {
                    handle: target,
                    expected: ValueKind::Command,
                    actual: slot.body.kind(),
                });
            }
        }
        tracing::trace!(target: "tain::harness", handle = %target, "scripted invoke");
        fire(&self.inner, ScriptChange::Invoke { target, args });
        Ok(())
    }

    /// Number of live (not released) handles.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        lock(&self.inner).slots.len()
    }

    #[must_use]
    pub fn contains(&self, target: ScriptHandle) -> bool {
        lock(&self.inner).slots.contains_key(&target)
    }

    #[must_use]
    pub fn observed(&self, target: ScriptHandle) -> bool {
        lock(&self.inner)
            .slots
            .get(&target)
            .is_some_and(|s| s.observed)
    }

    /// Current value of `target.name`, `None` for unknown handle, missing
    /// property, or a non-object slot.
    #[must_use]
    pub fn property(&self, target: ScriptHandle, name: &str) -> Option<StoreValue> {
        let g = lock(&self.inner);
        match &g.slots.get(&target)?.body {
            SlotBody::Object { props } | SlotBody::Command { props } => props.get(name).cloned(),
            _ => None,
        }
    }

    /// Current items of an array slot.
    #[must_use]
    pub fn items(&self, target: ScriptHandle) -> Option<Vec<StoreValue>> {
        let g = lock(&self.inner);
        match &g.slots.get(&target)?.body {
            SlotBody::Array { items } => Some(items.clone()),
            _ => None,
        }
    }

    /// Mirror a slot as JSON, resolving references. A reference cycle is
    /// cut with `{"$ref": <handle>}`; an unknown handle exports as null.
    #[must_use]
    pub fn export(&self, target: ScriptHandle) -> Value {
        let g = lock(&self.inner);
        let mut path = Vec::new();
        export_slot(&g, target, &mut path)
    }

    /// Engine-applied store calls, in order.
    #[must_use]
    pub fn events(&self) -> Vec<StoreEvent> {
        lock(&self.inner).events.clone()
    }

    pub fn clear_events(&self) {
        lock(&self.inner).events.clear();
    }
}

fn splice_slot(
    target: ScriptHandle,
    stored: &mut Vec<StoreValue>,
    index: usize,
    remove: usize,
    items: &[StoreValue],
) -> Result<(), StoreError> {
    let len = stored.len();
    if index > len || remove > len - index {
        return Err(StoreError::Unsupported(format!(
            "splice {index}+{remove} of {target} with length {len}"
        )));
    }
    stored.splice(index..index + remove, items.iter().cloned());
    Ok(())
}

fn export_slot(g: &StoreInner, target: ScriptHandle, path: &mut Vec<ScriptHandle>) -> Value {
    let Some(slot) = g.slots.get(&target) else {
        return Value::Null;
    };
    if path.contains(&target) {
        return json!({ "$ref": target.raw() });
    }
    path.push(target);
    let out = match &slot.body {
        SlotBody::Object { props } | SlotBody::Command { props } => {
            let mut map = serde_json::Map::new();
            for (name, value) in props {
                map.insert(name.clone(), export_value(g, value, path));
            }
            Value::Object(map)
        }
        SlotBody::Array { items } => {
            Value::Array(items.iter().map(|v| export_value(g, v, path)).collect())
        }
        SlotBody::Scalar(s) => scalar_json(s),
    };
    path.pop();
    out
}

fn export_value(g: &StoreInner, value: &StoreValue, path: &mut Vec<ScriptHandle>) -> Value {
    match value {
        StoreValue::Scalar(s) => scalar_json(s),
        StoreValue::Ref(h) => export_slot(g, *h, path),
    }
}

fn scalar_json(s: &ScalarValue) -> Value {
    match s {
        ScalarValue::Null => Value::Null,
        ScalarValue::Bool(b) => json!(b),
        ScalarValue::Int(i) => json!(i),
        ScalarValue::Float(x) => serde_json::Number::from_f64(*x).map_or(Value::Null, Value::Number),
        ScalarValue::Str(s) => json!(s),
    }
}

// ---------------------------------------------------------------------------
// Engine-facing client
// ---------------------------------------------------------------------------

struct StoreClient {
    inner: Arc<Mutex<StoreInner>>,
}

impl ScriptStore for StoreClient {
    fn create_object(&mut self) -> Result<ScriptHandle, StoreError> {
        Ok(lock(&self.inner).create(SlotBody::Object {
            props: BTreeMap::new(),
        }))
    }

    fn create_array(&mut self) -> Result<ScriptHandle, StoreError> {
        Ok(lock(&self.inner).create(SlotBody::Array { items: Vec::new() }))
    }

    fn create_command(&mut self) -> Result<ScriptHandle, StoreError> {
        Ok(lock(&self.inner).create(SlotBody::Command {
            props: BTreeMap::new(),
        }))
    }

    fn create_scalar(&mut self, value: &ScalarValue) -> Result<ScriptHandle, StoreError> {
        Ok(lock(&self.inner).create(SlotBody::Scalar(value.clone())))
    }

    fn get_property(&self, target: ScriptHandle, name: &str) -> Result<StoreValue, StoreError> {
        let g = lock(&self.inner);
        let slot = g
            .slots
            .get(&target)
            .ok_or(StoreError::UnknownHandle(target))?;
        match &slot.body {
            SlotBody::Object { props } | SlotBody::Command { props } => {
                Ok(props.get(name).cloned().unwrap_or_else(StoreValue::null))
            }
            other => Err(StoreError::KindMismatch {
                handle: target,
                expected: ValueKind::Object,
                actual: other.kind(),
            }),
        }
    }

    fn set_property(
        &mut self,
        target: ScriptHandle,
        name: &str,
        value: StoreValue,
    ) -> Result<(), StoreError> {
        let mut g = lock(&self.inner);
        let slot = g.slot_mut(target)?;
        match &mut slot.body {
            SlotBody::Object { props } | SlotBody::Command { props } => {
                props.insert(name.to_string(), value.clone());
            }
            other => {
                return Err(StoreError::KindMismatch {
                    handle: target,
                    expected: ValueKind::Object,
                    actual: other.kind(),
                });
            }
        }
        g.events.push(StoreEvent::Set {
            target,
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    fn splice(
        &mut self,
        target: ScriptHandle,
        index: usize,
        remove: usize,
        items: Vec<StoreValue>,
    ) -> Result<(), StoreError> {
        let mut g = lock(&self.inner);
        let slot = g.slot_mut(target)?;
        let SlotBody::Array { items: stored } = &mut slot.body else {
            return Err(StoreError::KindMismatch {
                handle: target,
                expected: ValueKind::Array,
                actual: slot.body.kind(),
            });
        };
        splice_slot(target, stored, index, remove, &items)?;
        g.events.push(StoreEvent::Spliced {
            target,
            index,
            remove,
            items,
        });
        Ok(())
    }

    fn invoke(&mut self, target: ScriptHandle, args: Vec<StoreValue>) -> Result<(), StoreError> {
        {
            let mut g = lock(&self.inner);
            let slot = g.slot_mut(target)?;
            if slot.body.kind() != ValueKind::Command {
                return Err(StoreError::KindMismatch {
                    handle: target,
                    expected: ValueKind::Command,
                    actual: slot.body.kind(),
                });
            }
        }
        fire(&self.inner, ScriptChange::Invoke { target, args });
        Ok(())
    }

    fn observe(&mut self, target: ScriptHandle, observed: bool) -> Result<(), StoreError> {
        let mut g = lock(&self.inner);
        g.slot_mut(target)?.observed = observed;
        g.events.push(StoreEvent::Observed { target, observed });
        Ok(())
    }

    fn release(&mut self, target: ScriptHandle) -> Result<(), StoreError> {
        let mut g = lock(&self.inner);
        if g.slots.remove(&target).is_none() {
            return Err(StoreError::UnknownHandle(target));
        }
        g.events.push(StoreEvent::Released { target });
        Ok(())
    }

    fn subscribe(&mut self, sink: ScriptSink) {
        let mut g = lock(&self.inner);
        g.sink = Some(sink);
        g.sink_gen += 1;
    }

    fn unsubscribe(&mut self) {
        let mut g = lock(&self.inner);
        g.sink = None;
        g.sink_gen += 1;
    }
}
