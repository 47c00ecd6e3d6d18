#![forbid(unsafe_code)]

//! Script-side collaborator contract.
//!
//! The engine mirrors the host graph into an addressable object store owned
//! by the script engine. The store is deliberately dumb: it creates handles,
//! reads and writes slots, and reports script-initiated mutations back
//! through a single sink. Everything else (identity, reachability, echo
//! suppression, modes) lives in the binding engine.
//!
//! # Contract
//!
//! - Every method is called from the script execution context only.
//! - [`ScriptStore::observe`] selects which handles report script-initiated
//!   mutations ([`ScriptChange::PropertySet`] and [`ScriptChange::Splice`]).
//!   Unobserved handles stay silent. [`ScriptChange::Invoke`] is reported for
//!   any live command handle regardless of observation. Engine-initiated
//!   writes on observed handles may or may not be reported back (both are
//!   legal, the engine suppresses its own echo either way).
//! - [`ScriptStore::release`] frees a handle. A released handle may still
//!   appear in late sink events; the engine treats those as dangling and
//!   drops them.
//! - The sink must be invoked from the script context. Stores must tolerate
//!   the sink posting work rather than mutating the store re-entrantly.
//!
//! # Reserved names
//!
//! [`READ_ONLY_FLAG`] is written by the engine on every object handle and is
//! `true` when the object has no writable property. [`COMMAND_ENABLED`] is
//! the one property of a command handle. Script writes to reserved or
//! engine-managed slots are reported like any other write; the engine
//! rejects them.

use std::fmt;

use crate::value::{ScalarValue, ValueKind};

/// Reserved object property carrying the read-only marker.
pub const READ_ONLY_FLAG: &str = "__readonly";

/// Property of a command handle mirroring the host's can-execute state.
pub const COMMAND_ENABLED: &str = "enabled";

/// True for property names owned by the engine rather than the host model.
#[must_use]
pub fn is_reserved_property(name: &str) -> bool {
    name == READ_ONLY_FLAG
}

/// Address of one script-store slot. Allocated by the store; opaque to the
/// engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScriptHandle(u64);

impl ScriptHandle {
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A value as stored in a script slot: plain data or a reference to another
/// handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StoreValue {
    Scalar(ScalarValue),
    Ref(ScriptHandle),
}

impl StoreValue {
    #[must_use]
    pub fn null() -> Self {
        Self::Scalar(ScalarValue::Null)
    }

    #[must_use]
    pub fn as_ref_handle(&self) -> Option<ScriptHandle> {
        match self {
            Self::Ref(h) => Some(*h),
            Self::Scalar(_) => None,
        }
    }
}

impl From<ScalarValue> for StoreValue {
    fn from(v: ScalarValue) -> Self {
        Self::Scalar(v)
    }
}

impl From<ScriptHandle> for StoreValue {
    fn from(h: ScriptHandle) -> Self {
        Self::Ref(h)
    }
}

/// A script-initiated mutation, reported through the store sink.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScriptChange {
    /// Script code assigned `value` to `target.name`.
    PropertySet {
        target: ScriptHandle,
        name: String,
        value: StoreValue,
    },
    /// Script code spliced an array: `remove` items at `index` replaced by
    /// `items`.
    Splice {
        target: ScriptHandle,
        index: usize,
        remove: usize,
        items: Vec<StoreValue>,
    },
    /// Script code invoked a command handle.
    Invoke {
        target: ScriptHandle,
        args: Vec<StoreValue>,
    },
}

impl ScriptChange {
    /// The handle the change addresses.
    #[must_use]
    pub fn target(&self) -> ScriptHandle {
        match self {
            Self::PropertySet { target, .. }
            | Self::Splice { target, .. }
            | Self::Invoke { target, .. } => *target,
        }
    }
}

/// Receives script-initiated mutations. Installed once per binding session.
pub type ScriptSink = Box<dyn FnMut(ScriptChange) + Send>;

/// Error reported by a store operation.
///
/// The engine never treats these as fatal: a failed store call degrades to a
/// diagnostic and the mutation is skipped.
#[derive(Debug)]
pub enum StoreError {
    /// The handle does not exist (never created, or released).
    UnknownHandle(ScriptHandle),
    /// The handle exists but has the wrong shape for the operation.
    KindMismatch {
        handle: ScriptHandle,
        expected: ValueKind,
        actual: ValueKind,
    },
    /// The store cannot represent the requested operation.
    Unsupported(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownHandle(h) => write!(f, "unknown script handle {h}"),
            Self::KindMismatch {
                handle,
                expected,
                actual,
            } => write!(f, "handle {handle} is a {actual}, operation needs a {expected}"),
            Self::Unsupported(what) => write!(f, "store cannot {what}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The addressable script object store.
pub trait ScriptStore: Send {
    /// Allocate an empty object handle.
    fn create_object(&mut self) -> Result<ScriptHandle, StoreError>;

    /// Allocate an empty array handle.
    fn create_array(&mut self) -> Result<ScriptHandle, StoreError>;

    /// Allocate a command handle (invokable, carries [`COMMAND_ENABLED`]).
    fn create_command(&mut self) -> Result<ScriptHandle, StoreError>;

    /// Allocate a handle holding a bare scalar (used for scalar roots).
    fn create_scalar(&mut self, value: &ScalarValue) -> Result<ScriptHandle, StoreError>;

    /// Read `target.name`.
    fn get_property(&self, target: ScriptHandle, name: &str) -> Result<StoreValue, StoreError>;

    /// Write `target.name = value`.
    fn set_property(
        &mut self,
        target: ScriptHandle,
        name: &str,
        value: StoreValue,
    ) -> Result<(), StoreError>;

    /// Replace `remove` items at `index` of an array with `items`.
    fn splice(
        &mut self,
        target: ScriptHandle,
        index: usize,
        remove: usize,
        items: Vec<StoreValue>,
    ) -> Result<(), StoreError>;

    /// Invoke a callable handle with `args`. The engine itself never calls
    /// this; it exists for embedders layering framework adapters over the
    /// same store.
    fn invoke(&mut self, target: ScriptHandle, args: Vec<StoreValue>) -> Result<(), StoreError>;

    /// Turn script-initiated mutation reporting on or off for `target`.
    /// Gates [`ScriptChange::PropertySet`] and [`ScriptChange::Splice`] only;
    /// [`ScriptChange::Invoke`] is always reported.
    fn observe(&mut self, target: ScriptHandle, observed: bool) -> Result<(), StoreError>;

    /// Free a handle. Releasing an unknown (or already released) handle
    /// reports [`StoreError::UnknownHandle`].
    fn release(&mut self, target: ScriptHandle) -> Result<(), StoreError>;

    /// Install the mutation sink. Replaces any previous sink.
    fn subscribe(&mut self, sink: ScriptSink);

    /// Remove the mutation sink.
    fn unsubscribe(&mut self);
}
