#![forbid(unsafe_code)]

//! In-memory host capabilities.
//!
//! [`StubObject`], [`StubList`] and [`StubCommand`] are reference
//! implementations of the three host-side contracts, instrumented for
//! assertions: they log engine-applied writes, expose subscriber counts,
//! and accept a write hook so tests can script rejection and coercion.
//!
//! Host-side mutators (`set`, `push`, `remove`, ...) fire observers the way
//! a real host does: synchronously, after the mutation, outside any
//! internal lock. Engine-applied writes (`set_property`, `apply`) do the
//! same, so echo-suppression windows are exercised for real.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tain_core::host::{
    EnabledObserver, ListChange, ListObserver, PropertyObserver, PropertySpec, SubscriptionId,
};
use tain_core::{
    CommandRef, HostCommand, HostId, HostValue, ListRef, ObjectRef, ObservableList,
    ObservableObject,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// True when both values would mirror identically: scalars by value,
/// capabilities by identity.
#[must_use]
pub fn same_value(a: &HostValue, b: &HostValue) -> bool {
    match (a, b) {
        (HostValue::Scalar(x), HostValue::Scalar(y)) => x == y,
        (HostValue::Opaque(x), HostValue::Opaque(y)) => x == y,
        _ => match (a.identity(), b.identity()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

// ---------------------------------------------------------------------------
// Observer registry
// ---------------------------------------------------------------------------

/// Subscription table shared by all three stubs. Observers are snapshotted
/// before firing, so a callback may re-enter the stub without deadlocking.
struct Registry<O: ?Sized> {
    inner: Mutex<RegistryState<O>>,
}

struct RegistryState<O: ?Sized> {
    next: u64,
    entries: Vec<(SubscriptionId, Arc<O>)>,
}

impl<O: ?Sized> Registry<O> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryState {
                next: 1,
                entries: Vec::new(),
            }),
        }
    }

    fn add(&self, observer: Box<O>) -> SubscriptionId {
        let mut g = lock(&self.inner);
        let id = SubscriptionId::new(g.next);
        g.next += 1;
        g.entries.push((id, Arc::from(observer)));
        id
    }

    fn remove(&self, id: SubscriptionId) {
        lock(&self.inner).entries.retain(|(sid, _)| *sid != id);
    }

    fn count(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    fn snapshot(&self) -> Vec<Arc<O>> {
        lock(&self.inner)
            .entries
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// StubObject
// ---------------------------------------------------------------------------

/// Decision returned by a [`StubObject`] write hook.
pub enum SetOutcome {
    /// Store the value as written.
    Accept,
    /// Store a different value instead; observers fire if it differs from
    /// the current one.
    Coerce(HostValue),
    /// Refuse the write, leaving the property untouched.
    Reject,
}

/// Hook consulted on every engine-applied property write.
pub type SetHook = Arc<dyn Fn(&str, &HostValue) -> SetOutcome + Send + Sync>;

struct StubProp {
    name: String,
    read_only: bool,
    value: HostValue,
}

#[derive(Default)]
struct ObjectState {
    props: Vec<StubProp>,
    hook: Option<SetHook>,
    set_log: Vec<(String, HostValue)>,
}

/// Observable object fixture with declared properties and a write log.
pub struct StubObject {
    weak_self: Weak<StubObject>,
    state: Mutex<ObjectState>,
    observers: Registry<dyn Fn(&str) + Send + Sync>,
}

impl StubObject {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            state: Mutex::new(ObjectState::default()),
            observers: Registry::new(),
        })
    }

    /// Declare a writable property.
    pub fn insert_rw(&self, name: impl Into<String>, value: impl Into<HostValue>) {
        self.insert(name.into(), false, value.into());
    }

    /// Declare a read-only property.
    pub fn insert_ro(&self, name: impl Into<String>, value: impl Into<HostValue>) {
        self.insert(name.into(), true, value.into());
    }

    fn insert(&self, name: String, read_only: bool, value: HostValue) {
        let mut state = lock(&self.state);
        assert!(
            state.props.iter().all(|p| p.name != name),
            "duplicate property {name:?}"
        );
        state.props.push(StubProp {
            name,
            read_only,
            value,
        });
    }

    /// Host-side mutation: store and fire, ignoring read-only and hooks.
    /// Panics on an undeclared name.
    pub fn set(&self, name: &str, value: impl Into<HostValue>) {
        let ok = self.write(name, value.into(), false);
        assert!(ok, "set on undeclared property {name:?}");
    }

    /// Store without firing observers. Panics on an undeclared name.
    pub fn set_silent(&self, name: &str, value: impl Into<HostValue>) {
        let value = value.into();
        let mut state = lock(&self.state);
        let prop = state
            .props
            .iter_mut()
            .find(|p| p.name == name)
            .unwrap_or_else(|| panic!("set_silent on undeclared property {name:?}"));
        prop.value = value;
    }

    /// Fire the property observers without any mutation.
    pub fn notify(&self, name: &str) {
        for o in self.observers.snapshot() {
            o(name);
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<HostValue> {
        lock(&self.state)
            .props
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.clone())
    }

    /// Install the write hook consulted by engine-applied writes.
    pub fn on_set(&self, hook: impl Fn(&str, &HostValue) -> SetOutcome + Send + Sync + 'static) {
        lock(&self.state).hook = Some(Arc::new(hook));
    }

    /// Engine-applied writes that were accepted, in order.
    #[must_use]
    pub fn set_log(&self) -> Vec<(String, HostValue)> {
        lock(&self.state).set_log.clone()
    }

    #[must_use]
    pub fn as_object(&self) -> ObjectRef {
        self.weak_self
            .upgrade()
            .expect("stub used after all Arcs dropped")
    }

    #[must_use]
    pub fn as_value(&self) -> HostValue {
        HostValue::Object(self.as_object())
    }

    #[must_use]
    pub fn id(&self) -> HostId {
        HostId::of_object(&self.as_object())
    }

    pub fn subscribe(&self, observer: PropertyObserver) -> SubscriptionId {
        self.observers.add(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.observers.remove(id);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.observers.count()
    }

    /// Shared write path. `scripted` selects the engine-facing rules
    /// (read-only, hook, log); host-side writes bypass them. Returns false
    /// when the write was refused or the name is undeclared.
    fn write(&self, name: &str, value: HostValue, scripted: bool) -> bool {
        let hook = if scripted {
            lock(&self.state).hook.clone()
        } else {
            None
        };
        let final_value = match hook {
            Some(h) => match h(name, &value) {
                SetOutcome::Accept => value,
                SetOutcome::Coerce(v) => v,
                SetOutcome::Reject => return false,
            },
            None => value,
        };
        let changed = {
            let mut state = lock(&self.state);
            let Some(idx) = state.props.iter().position(|p| p.name == name) else {
                return false;
            };
            if scripted && state.props[idx].read_only {
                return false;
            }
            let changed = !same_value(&state.props[idx].value, &final_value);
            state.props[idx].value = final_value.clone();
            if scripted {
                state.set_log.push((name.to_string(), final_value));
            }
            changed
        };
        if changed {
            self.notify(name);
        }
        true
    }
}

impl ObservableObject for StubObject {
    fn properties(&self) -> Vec<PropertySpec> {
        lock(&self.state)
            .props
            .iter()
            .map(|p| PropertySpec::new(p.name.clone(), p.read_only))
            .collect()
    }

    fn property(&self, name: &str) -> Option<HostValue> {
        self.get(name)
    }

    fn set_property(&self, name: &str, value: HostValue) -> bool {
        self.write(name, value, true)
    }

    fn subscribe(&self, observer: PropertyObserver) -> SubscriptionId {
        self.observers.add(observer)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.observers.remove(id);
    }
}

// ---------------------------------------------------------------------------
// StubList
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ListState {
    items: Vec<HostValue>,
    reject: bool,
    applied: Vec<ListChange>,
}

/// Observable list fixture with host-side mutators for every change shape.
pub struct StubList {
    weak_self: Weak<StubList>,
    state: Mutex<ListState>,
    observers: Registry<dyn Fn(&ListChange) + Send + Sync>,
}

impl StubList {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            state: Mutex::new(ListState::default()),
            observers: Registry::new(),
        })
    }

    /// Append and fire `Insert`.
    pub fn push(&self, value: HostValue) {
        let index = {
            let mut state = lock(&self.state);
            state.items.push(value.clone());
            state.items.len() - 1
        };
        self.fire(&ListChange::Insert {
            index,
            items: vec![value],
        });
    }

    /// Insert at `index` and fire `Insert`. Panics out of bounds.
    pub fn insert(&self, index: usize, value: HostValue) {
        {
            let mut state = lock(&self.state);
            assert!(index <= state.items.len(), "insert index {index} out of bounds");
            state.items.insert(index, value.clone());
        }
        self.fire(&ListChange::Insert {
            index,
            items: vec![value],
        });
    }

    /// Remove at `index` and fire `Remove`. Panics out of bounds.
    pub fn remove(&self, index: usize) -> HostValue {
        let removed = {
            let mut state = lock(&self.state);
            assert!(index < state.items.len(), "remove index {index} out of bounds");
            state.items.remove(index)
        };
        self.fire(&ListChange::Remove { index, count: 1 });
        removed
    }

    /// Overwrite `index` in place and fire `Replace`. Panics out of bounds.
    pub fn replace(&self, index: usize, value: HostValue) {
        {
            let mut state = lock(&self.state);
            assert!(index < state.items.len(), "replace index {index} out of bounds");
            state.items[index] = value.clone();
        }
        self.fire(&ListChange::Replace {
            index,
            items: vec![value],
        });
    }

    /// Move one item and fire `Move`. Panics out of bounds.
    pub fn move_item(&self, from: usize, to: usize) {
        {
            let mut state = lock(&self.state);
            let len = state.items.len();
            assert!(from < len && to < len, "move {from}->{to} out of bounds");
            let v = state.items.remove(from);
            state.items.insert(to, v);
        }
        self.fire(&ListChange::Move { from, to });
    }

    /// Replace the whole contents and fire `Reset`.
    pub fn reset(&self, items: Vec<HostValue>) {
        lock(&self.state).items = items;
        self.fire(&ListChange::Reset);
    }

    #[must_use]
    pub fn items(&self) -> Vec<HostValue> {
        lock(&self.state).items.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.state).items.is_empty()
    }

    /// Make every engine-applied change fail, untouched.
    pub fn set_reject(&self, reject: bool) {
        lock(&self.state).reject = reject;
    }

    /// Engine-applied changes that were accepted, in order.
    #[must_use]
    pub fn apply_log(&self) -> Vec<ListChange> {
        lock(&self.state).applied.clone()
    }

    #[must_use]
    pub fn as_list(&self) -> ListRef {
        self.weak_self
            .upgrade()
            .expect("stub used after all Arcs dropped")
    }

    #[must_use]
    pub fn as_value(&self) -> HostValue {
        HostValue::List(self.as_list())
    }

    #[must_use]
    pub fn id(&self) -> HostId {
        HostId::of_list(&self.as_list())
    }

    pub fn subscribe(&self, observer: ListObserver) -> SubscriptionId {
        self.observers.add(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.observers.remove(id);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.observers.count()
    }

    fn fire(&self, change: &ListChange) {
        for o in self.observers.snapshot() {
            o(change);
        }
    }
}

impl ObservableList for StubList {
    fn items(&self) -> Vec<HostValue> {
        lock(&self.state).items.clone()
    }

    fn apply(&self, change: &ListChange) -> bool {
        let applied = {
            let mut state = lock(&self.state);
            if state.reject {
                return false;
            }
            let len = state.items.len();
            match change {
                ListChange::Insert { index, items } => {
                    if *index > len {
                        return false;
                    }
                    for (offset, v) in items.iter().enumerate() {
                        state.items.insert(index + offset, v.clone());
                    }
                }
                ListChange::Remove { index, count } => {
                    if index + count > len {
                        return false;
                    }
                    state.items.drain(*index..*index + *count);
                }
                ListChange::Replace { index, items } => {
                    if index + items.len() > len {
                        return false;
                    }
                    for (offset, v) in items.iter().enumerate() {
                        state.items[index + offset] = v.clone();
                    }
                }
                ListChange::Move { from, to } => {
                    if *from >= len || *to >= len {
                        return false;
                    }
                    let v = state.items.remove(*from);
                    state.items.insert(*to, v);
                }
                ListChange::Reset => state.items.clear(),
            }
            state.applied.push(change.clone());
            true
        };
        if applied {
            self.fire(change);
        }
        applied
    }

    fn subscribe(&self, observer: ListObserver) -> SubscriptionId {
        self.observers.add(observer)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.observers.remove(id);
    }
}

// ---------------------------------------------------------------------------
// StubCommand
// ---------------------------------------------------------------------------

/// Command fixture recording executions, with a switchable enablement flag.
pub struct StubCommand {
    weak_self: Weak<StubCommand>,
    enabled: AtomicBool,
    executions: Mutex<Vec<HostValue>>,
    observers: Registry<dyn Fn(bool) + Send + Sync>,
}

impl StubCommand {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            enabled: AtomicBool::new(true),
            executions: Mutex::new(Vec::new()),
            observers: Registry::new(),
        })
    }

    /// Flip enablement; fires observers only on a change.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            for o in self.observers.snapshot() {
                o(enabled);
            }
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Arguments the command has been executed with, in order.
    #[must_use]
    pub fn executions(&self) -> Vec<HostValue> {
        lock(&self.executions).clone()
    }

    #[must_use]
    pub fn execution_count(&self) -> usize {
        lock(&self.executions).len()
    }

    #[must_use]
    pub fn as_command(&self) -> CommandRef {
        self.weak_self
            .upgrade()
            .expect("stub used after all Arcs dropped")
    }

    #[must_use]
    pub fn as_value(&self) -> HostValue {
        HostValue::Command(self.as_command())
    }

    #[must_use]
    pub fn id(&self) -> HostId {
        HostId::of_command(&self.as_command())
    }

    pub fn subscribe_enabled(&self, observer: EnabledObserver) -> SubscriptionId {
        self.observers.add(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.observers.remove(id);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.observers.count()
    }
}

impl HostCommand for StubCommand {
    fn execute(&self, arg: HostValue) {
        lock(&self.executions).push(arg);
    }

    fn can_execute(&self, _arg: HostValue) -> bool {
        self.is_enabled()
    }

    fn subscribe_enabled(&self, observer: EnabledObserver) -> SubscriptionId {
        self.observers.add(observer)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.observers.remove(id);
    }
}
