#![forbid(unsafe_code)]

//! Capturing diagnostic sink.
//!
//! [`CapturedDiags`] records every diagnostic the engine reports so tests
//! can assert on the silent failure taxonomy: install it with
//! `session.set_diag_sink(Some(diags.boxed()))` and read back `kinds()`.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use tain_binding::{DiagKind, DiagSink, Diagnostic};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Thread-safe record of reported diagnostics. Clones share the record.
#[derive(Clone, Default)]
pub struct CapturedDiags {
    seen: Arc<Mutex<Vec<Diagnostic>>>,
}

impl CapturedDiags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A boxed sink sharing this record, for `set_diag_sink`.
    #[must_use]
    pub fn boxed(&self) -> Box<dyn DiagSink> {
        Box::new(self.clone())
    }

    /// Kinds reported so far, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<DiagKind> {
        lock(&self.seen).iter().map(|d| d.kind).collect()
    }

    /// Drain everything reported so far.
    #[must_use]
    pub fn take(&self) -> Vec<Diagnostic> {
        mem::take(&mut *lock(&self.seen))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.seen).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.seen).is_empty()
    }
}

impl DiagSink for CapturedDiags {
    fn report(&self, diag: &Diagnostic) {
        lock(&self.seen).push(diag.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_record() {
        let diags = CapturedDiags::new();
        let sink = diags.boxed();
        sink.report(&Diagnostic {
            kind: DiagKind::ReadOnlyRejected,
            detail: "probe".to_string(),
            at_ms: 0,
        });
        assert_eq!(diags.kinds(), vec![DiagKind::ReadOnlyRejected]);
        assert_eq!(diags.take().len(), 1);
        assert!(diags.is_empty());
    }
}
