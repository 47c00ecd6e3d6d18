#![forbid(unsafe_code)]

//! Bidirectional object-graph binding between a host model and a script
//! store.
//!
//! A [`Binder`] mirrors a host value graph (observable objects, observable
//! lists, commands) into an addressable script-side store and keeps both
//! sides converged:
//!
//! - [`Binder`]: per-script-window coordinator; enforces one live session
//!   per root object.
//! - [`BindingSession`]: one bound root; dispose (or drop) to release every
//!   listener and mirror handle.
//! - [`BindingMode`]: which directions synchronize (`OneTime`, `OneWay`,
//!   `TwoWay`, `OneWayToSource`).
//! - [`dispatch`]: the two serialized execution contexts the engine
//!   marshals work between.
//! - [`diag`]: the silent-degradation taxonomy; faults become diagnostics,
//!   never panics.
//!
//! # Architecture
//!
//! Host capabilities live on a host context, the store on a script context;
//! each serializes its own work. The engine never calls across directly: it
//! captures state on the owning context and posts the result to the other.
//! Mirror bookkeeping (the glue graph, reference counts, listener handles)
//! sits behind one lock that only script-context tasks take; host-side
//! notification sinks stay lock-free and post.
//!
//! Mutations the engine writes itself are suppressed at the source, so a
//! host notification for an engine write (or a store report of one) dies at
//! the sink instead of echoing forever.
//!
//! # Invariants
//!
//! 1. A node is tracked while reachable from the root, with exactly one
//!    listener per node in host-observing modes, and is released when it
//!    becomes unreachable.
//! 2. Replaying a mirrored mutation back at its own source is suppressed;
//!    a genuine host coercion still flows forward.
//! 3. Read-only properties never produce host writes; the mirror snaps
//!    back and the rejection is diagnosed.
//! 4. After [`BindingSession::dispose`], no listener and no store handle
//!    owned by the session survives, and late notifications are dropped.

pub mod diag;
pub mod dispatch;
pub mod session;

mod builder;
mod echo;
mod glue;
mod graph;
mod observer;
mod snapshot;

pub use diag::{DiagKind, DiagSink, Diagnostic};
pub use dispatch::{
    Context, ContextPair, DirectContext, DispatchError, Task, ThreadContext, block_on,
};
pub use session::{
    BindError, Binder, BindingMode, BindingOptions, BindingSession, BindingStats, MirrorSnapshot,
    NodeShape, NodeView, PropertyView, SessionPhase, ViewValue,
};
