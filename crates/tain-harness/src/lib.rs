#![forbid(unsafe_code)]

//! Test fixtures for the binding engine.
//!
//! Everything here exists so engine tests can stand up a real host graph
//! and a real script store without touching an embedder:
//!
//! - [`host`]: scriptable stand-ins for the host traits. [`StubObject`],
//!   [`StubList`] and [`StubCommand`] keep observer registries, record
//!   applied mutations, and can coerce or reject writes through a hook.
//! - [`store`]: [`RecordingStore`], an in-memory script store with an
//!   ordered event log, JSON export, and script-side mutation helpers.
//! - [`strategies`]: proptest generators for whole value graphs.
//! - [`diag`]: [`CapturedDiags`], a sink that records reported
//!   diagnostics for assertion.
//!
//! # Contract
//!
//! Stubs fire their observers synchronously on the mutating thread, with
//! no stub lock held. A rejected mutation leaves state untouched and
//! fires nothing, matching what the engine is entitled to assume of any
//! host.

pub mod diag;
pub mod host;
pub mod store;
pub mod strategies;

pub use diag::CapturedDiags;
pub use host::{SetHook, SetOutcome, StubCommand, StubList, StubObject, same_value};
pub use store::{RecordingStore, StoreEvent};
pub use strategies::{ValuePlan, object_plan, scalar_value, value_plan};
