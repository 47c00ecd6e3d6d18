#![forbid(unsafe_code)]

//! Echo suppression.
//!
//! When the engine writes one side of the mirror, that side's own
//! notification machinery fires as a consequence. [`Silencer`] marks the
//! written slot for the duration of the write; the sink that receives the
//! resulting notification checks the mark synchronously at fire time and
//! drops the echo instead of forwarding it.
//!
//! The mark is a count, not a flag, so nested or repeated writes to the same
//! slot stack correctly. A host setter that coerces the written value fires
//! inside the window like any echo; the writer re-reads the slot after the
//! window closes and forwards the difference itself, so coercions are never
//! lost to suppression.
//!
//! # Invariants
//!
//! - Every `silence` is paired with exactly one `unsilence` on the same key.
//! - The silenced set is consulted only at notification fire time, inside
//!   the mutation call it suppresses.

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use ahash::AHashMap;

/// The slot a mutation addresses within one mirrored node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum SlotKey {
    /// A named property (objects, command enablement).
    Property(String),
    /// The item sequence of an array.
    Items,
}

impl SlotKey {
    pub(crate) fn property(name: &str) -> Self {
        Self::Property(name.to_string())
    }
}

/// Count-multiset of slots currently being written by the engine.
///
/// Keyed by `(identity, slot)`; the identity type differs per direction, so
/// the key is generic.
#[derive(Debug)]
pub(crate) struct Silencer<K: Eq + Hash> {
    slots: Mutex<AHashMap<K, usize>>,
}

impl<K: Eq + Hash> Silencer<K> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(AHashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AHashMap<K, usize>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a suppression window on `key`.
    pub(crate) fn silence(&self, key: K) {
        *self.lock().entry(key).or_insert(0) += 1;
    }

    /// Close one suppression window on `key`. Unknown keys are ignored.
    pub(crate) fn unsilence(&self, key: &K) {
        let mut slots = self.lock();
        if let Some(count) = slots.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                slots.remove(key);
            }
        }
    }

    /// True while at least one window on `key` is open.
    pub(crate) fn is_silenced(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }
}

impl<K: Eq + Hash> Default for Silencer<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_opens_and_closes() {
        let s = Silencer::new();
        let key = (7u64, SlotKey::property("name"));
        assert!(!s.is_silenced(&key));
        s.silence(key.clone());
        assert!(s.is_silenced(&key));
        s.unsilence(&key);
        assert!(!s.is_silenced(&key));
    }

    #[test]
    fn windows_stack() {
        let s = Silencer::new();
        let key = (1u64, SlotKey::Items);
        s.silence(key.clone());
        s.silence(key.clone());
        s.unsilence(&key);
        assert!(s.is_silenced(&key), "outer window still open");
        s.unsilence(&key);
        assert!(!s.is_silenced(&key));
    }

    #[test]
    fn distinct_slots_are_independent() {
        let s = Silencer::new();
        let a = (1u64, SlotKey::property("a"));
        let b = (1u64, SlotKey::property("b"));
        s.silence(a.clone());
        assert!(s.is_silenced(&a));
        assert!(!s.is_silenced(&b));
    }

    #[test]
    fn unsilencing_unknown_key_is_noop() {
        let s: Silencer<(u64, SlotKey)> = Silencer::new();
        s.unsilence(&(9u64, SlotKey::Items));
        assert!(!s.is_silenced(&(9u64, SlotKey::Items)));
    }
}
