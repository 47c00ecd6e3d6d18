#![forbid(unsafe_code)]

//! Contracts and value model for the tain binding engine.
//!
//! This crate defines what the engine consumes, never how it works:
//!
//! - [`value`]: scalars, host values, capability identity.
//! - [`host`]: the three host capabilities (observable object, observable
//!   list, command) and their notification channels.
//! - [`store`]: the addressable script object store and its mutation sink.
//!
//! The engine itself lives in `tain-binding`; in-memory reference
//! implementations of both collaborator sides live in `tain-harness`.

pub mod host;
pub mod store;
pub mod value;

pub use host::{
    CommandRef, EnabledObserver, HostCommand, ListChange, ListObserver, ListRef, ObjectRef,
    ObservableList, ObservableObject, PropertyObserver, PropertySpec, SubscriptionId,
    WeakCommandRef, WeakListRef, WeakObjectRef,
};
pub use store::{
    COMMAND_ENABLED, READ_ONLY_FLAG, ScriptChange, ScriptHandle, ScriptSink, ScriptStore,
    StoreError, StoreValue, is_reserved_property,
};
pub use value::{HostId, HostValue, ScalarValue, ValueKind};
