#![forbid(unsafe_code)]

//! Non-fatal diagnostics.
//!
//! Nothing in the binding engine is fatal: rejected writes, dangling
//! handles, unsupported values and store failures all degrade to a
//! [`Diagnostic`]. Each one goes three places: the `tain::diag` tracing
//! target, a bounded in-memory ring readable through
//! [`crate::session::BindingSession::diagnostics`], and an optional
//! [`DiagSink`] installable at runtime.
//!
//! The sink is swapped atomically and read lock-free on the emit path, so
//! installing or removing it is safe from any thread while both contexts
//! are live.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use arc_swap::ArcSwapOption;
use web_time::Instant;

/// What went sideways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DiagKind {
    /// A host value could not be mirrored and degraded to null.
    UnsupportedValue,
    /// A script write targeted a read-only property and was dropped.
    ReadOnlyRejected,
    /// A script write targeted a property the mirrored object never
    /// declared, or a reserved name.
    UnknownProperty,
    /// A script event addressed a handle that is no longer tracked.
    DanglingHandle,
    /// A script write arrived in a mode that does not apply script writes.
    ModeSuppressed,
    /// A store call failed; the mutation was skipped.
    StoreFailure,
    /// An operation arrived after the session was disposed.
    Disposed,
    /// A mirrored value changed kind, or indices fell outside the mirrored
    /// shape, forcing a local rebuild or clamp.
    ShapeChanged,
}

impl fmt::Display for DiagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UnsupportedValue => "unsupported-value",
            Self::ReadOnlyRejected => "read-only-rejected",
            Self::UnknownProperty => "unknown-property",
            Self::DanglingHandle => "dangling-handle",
            Self::ModeSuppressed => "mode-suppressed",
            Self::StoreFailure => "store-failure",
            Self::Disposed => "disposed",
            Self::ShapeChanged => "shape-changed",
        };
        f.write_str(label)
    }
}

/// One degraded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Diagnostic {
    pub kind: DiagKind,
    pub detail: String,
    /// Milliseconds since the session's hub was created.
    pub at_ms: u64,
}

/// External diagnostics consumer, installable at runtime.
pub trait DiagSink: Send + Sync {
    fn report(&self, diag: &Diagnostic);
}

/// Per-session diagnostics fan-out: tracing, bounded ring, optional sink.
pub(crate) struct DiagHub {
    ring: Mutex<VecDeque<Diagnostic>>,
    capacity: usize,
    sink: ArcSwapOption<Box<dyn DiagSink>>,
    started: Instant,
}

impl DiagHub {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            sink: ArcSwapOption::empty(),
            started: Instant::now(),
        }
    }

    pub(crate) fn emit(&self, kind: DiagKind, detail: impl Into<String>) {
        let diag = Diagnostic {
            kind,
            detail: detail.into(),
            at_ms: self.started.elapsed().as_millis() as u64,
        };
        tracing::warn!(
            target: "tain::diag",
            kind = %diag.kind,
            detail = %diag.detail,
            "binding degraded"
        );
        if let Some(sink) = &*self.sink.load() {
            sink.report(&diag);
        }
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(diag);
    }

    /// Install or remove the external sink.
    pub(crate) fn set_sink(&self, sink: Option<Box<dyn DiagSink>>) {
        self.sink.store(sink.map(std::sync::Arc::new));
    }

    /// Snapshot the ring, oldest first.
    pub(crate) fn recent(&self) -> Vec<Diagnostic> {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl fmt::Debug for DiagHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagHub")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
