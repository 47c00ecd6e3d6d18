#![forbid(unsafe_code)]

//! Host-side collaborator contracts.
//!
//! The binding engine never knows the host application's concrete types. It
//! consumes three capabilities, each a trait object shared behind an `Arc`:
//!
//! - [`ObservableObject`]: named properties plus a property-changed channel.
//! - [`ObservableList`]: an ordered sequence plus a collection-changed
//!   channel.
//! - [`HostCommand`]: an invokable with an enablement flag and an
//!   enablement-changed channel.
//!
//! # Contract
//!
//! - Every method on these traits is called from the host execution context
//!   only. Implementations may assume serialized access.
//! - Observers registered through `subscribe` fire on the host context,
//!   synchronously with the mutation that caused them.
//! - `unsubscribe` with an unknown or already-released id is a no-op.
//! - `set_property` / `apply` return `false` to reject a write (unknown
//!   property, read-only, out-of-range index). Rejection must leave host
//!   state untouched and must not fire observers.
//!
//! # Failure Modes
//!
//! A capability that fires observers from a foreign thread, or re-entrantly
//! from inside `subscribe`, breaks the serialization assumptions upstream.
//! The engine tolerates it (everything funnels through posted tasks) but
//! ordering guarantees degrade to arrival order.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::value::HostValue;

/// Shared handle to an observable host object.
pub type ObjectRef = Arc<dyn ObservableObject>;
/// Shared handle to an observable host list.
pub type ListRef = Arc<dyn ObservableList>;
/// Shared handle to a host command.
pub type CommandRef = Arc<dyn HostCommand>;

/// Non-owning handle to an observable host object.
pub type WeakObjectRef = Weak<dyn ObservableObject>;
/// Non-owning handle to an observable host list.
pub type WeakListRef = Weak<dyn ObservableList>;
/// Non-owning handle to a host command.
pub type WeakCommandRef = Weak<dyn HostCommand>;

/// Property-changed observer: receives the name of the changed property.
pub type PropertyObserver = Box<dyn Fn(&str) + Send + Sync>;
/// Collection-changed observer: receives a description of the change.
pub type ListObserver = Box<dyn Fn(&ListChange) + Send + Sync>;
/// Enablement observer: receives the new can-execute state.
pub type EnabledObserver = Box<dyn Fn(bool) + Send + Sync>;

/// Identifies one subscription on one capability. Allocated by the
/// capability implementation; opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Shape of one named property as declared by its object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertySpec {
    pub name: String,
    pub read_only: bool,
}

impl PropertySpec {
    #[must_use]
    pub fn new(name: impl Into<String>, read_only: bool) -> Self {
        Self {
            name: name.into(),
            read_only,
        }
    }

    /// A writable property.
    #[must_use]
    pub fn read_write(name: impl Into<String>) -> Self {
        Self::new(name, false)
    }

    /// A property the script side may read but never write.
    #[must_use]
    pub fn immutable(name: impl Into<String>) -> Self {
        Self::new(name, true)
    }
}

/// One collection mutation, as reported by an [`ObservableList`] or applied
/// back to it.
///
/// Indices refer to the list state immediately before the change.
#[derive(Clone)]
pub enum ListChange {
    /// `items` inserted so the first lands at `index`.
    Insert { index: usize, items: Vec<HostValue> },
    /// `count` items removed starting at `index`.
    Remove { index: usize, count: usize },
    /// `items.len()` items starting at `index` replaced in place.
    Replace { index: usize, items: Vec<HostValue> },
    /// The item at `from` removed and reinserted at `to`.
    Move { from: usize, to: usize },
    /// The whole list changed; observers must re-read `items()`.
    Reset,
}

impl fmt::Debug for ListChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert { index, items } => f
                .debug_struct("Insert")
                .field("index", index)
                .field("len", &items.len())
                .finish(),
            Self::Remove { index, count } => f
                .debug_struct("Remove")
                .field("index", index)
                .field("count", count)
                .finish(),
            Self::Replace { index, items } => f
                .debug_struct("Replace")
                .field("index", index)
                .field("len", &items.len())
                .finish(),
            Self::Move { from, to } => f
                .debug_struct("Move")
                .field("from", from)
                .field("to", to)
                .finish(),
            Self::Reset => f.write_str("Reset"),
        }
    }
}

/// A host object exposing named properties and property-changed
/// notifications.
pub trait ObservableObject: Send + Sync {
    /// Declared properties, in the host's preferred order.
    fn properties(&self) -> Vec<PropertySpec>;

    /// Current value of `name`, or `None` for an undeclared property.
    fn property(&self, name: &str) -> Option<HostValue>;

    /// Write `value` to `name`. Returns `false` if the write is rejected.
    /// Implementations are free to coerce the value; a coercion that lands
    /// on a different value fires the property observer like any change.
    fn set_property(&self, name: &str, value: HostValue) -> bool;

    /// Register a property-changed observer.
    fn subscribe(&self, observer: PropertyObserver) -> SubscriptionId;

    /// Remove a previously registered observer. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// A host list exposing ordered items and collection-changed notifications.
pub trait ObservableList: Send + Sync {
    /// Current items, in order.
    fn items(&self) -> Vec<HostValue>;

    /// Apply a script-initiated change. Returns `false` if rejected.
    fn apply(&self, change: &ListChange) -> bool;

    /// Register a collection-changed observer.
    fn subscribe(&self, observer: ListObserver) -> SubscriptionId;

    /// Remove a previously registered observer. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// A host command: an invokable with an enablement flag.
pub trait HostCommand: Send + Sync {
    /// Invoke the command with one argument (null when the script passed
    /// none).
    fn execute(&self, arg: HostValue);

    /// Whether the command would currently accept `execute`.
    fn can_execute(&self, arg: HostValue) -> bool;

    /// Register an enablement observer.
    fn subscribe_enabled(&self, observer: EnabledObserver) -> SubscriptionId;

    /// Remove a previously registered observer. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}
