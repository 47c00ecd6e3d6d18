#![forbid(unsafe_code)]

//! Tracked-node bookkeeping and reclamation.
//!
//! [`BindingMap`] owns one [`Entry`] per mirrored host identity plus the
//! reverse handle index. Reclamation is two phased: a refcount cascade
//! ([`BindingMap::release_edges`]) frees everything whose edge count hits
//! zero, and a mark pass from the root catches detached cycles the counts
//! alone cannot see. The mark pass only runs when the cascade left a
//! decremented survivor, so plain tree detaches stay cheap.
//!
//! # Invariants
//!
//! - `entry.refs` equals the number of mirror edges pointing at the entry,
//!   counting the session root edge as one.
//! - `by_handle` is the exact inverse of the entry table.
//! - After any sweep, every remaining entry is reachable from the root.

use ahash::{AHashMap, AHashSet};

use tain_core::{HostId, ScriptHandle};

use crate::glue::GlueNode;
use crate::observer::ListenerHandle;

/// What the session root points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RootEdge {
    /// Scalar root: one store cell, no tracked nodes.
    Scalar(ScriptHandle),
    /// Composite root: the tracked node the root edge pins.
    Node(HostId),
}

/// Per-identity record: mirror state plus listener bookkeeping.
#[derive(Debug)]
pub(crate) struct Entry {
    pub refs: usize,
    pub glue: GlueNode,
    pub listener: Option<ListenerHandle>,
    pub observed: bool,
}

/// An entry removed by a sweep, with everything the caller must release.
#[derive(Debug)]
pub(crate) struct Eviction {
    pub id: HostId,
    pub handle: ScriptHandle,
    pub listener: Option<ListenerHandle>,
}

#[derive(Debug, Default)]
pub(crate) struct SweepOutcome {
    pub evicted: Vec<Eviction>,
}

#[derive(Debug, Default)]
pub(crate) struct BindingMap {
    entries: AHashMap<HostId, Entry>,
    by_handle: AHashMap<ScriptHandle, HostId>,
    root: Option<RootEdge>,
}

impl BindingMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_root(&mut self, root: RootEdge) {
        self.root = Some(root);
    }

    pub(crate) fn root(&self) -> Option<RootEdge> {
        self.root
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, id: HostId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn get(&self, id: HostId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: HostId) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn id_of(&self, handle: ScriptHandle) -> Option<HostId> {
        self.by_handle.get(&handle).copied()
    }

    pub(crate) fn handle_of(&self, id: HostId) -> Option<ScriptHandle> {
        self.entries.get(&id).map(|e| e.glue.handle)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&HostId, &Entry)> {
        self.entries.iter()
    }

    /// Insert a freshly materialized entry. The caller accounts edges
    /// separately via [`BindingMap::bump_ref`].
    pub(crate) fn insert(&mut self, id: HostId, entry: Entry) {
        self.by_handle.insert(entry.glue.handle, id);
        self.entries.insert(id, entry);
    }

    /// Add one incoming edge to a tracked node.
    pub(crate) fn bump_ref(&mut self, id: HostId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.refs += 1;
        }
    }

    // -----------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------

    /// Drop one edge per seed (duplicates drop several) and cascade.
    ///
    /// Nodes whose count reaches zero are evicted and their outgoing edges
    /// fed back into the worklist. If any decremented node survives, a mark
    /// pass from the root reclaims cycles detached from it.
    pub(crate) fn release_edges(&mut self, seeds: Vec<HostId>) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut work = seeds;
        let mut survivor = false;

        while let Some(id) = work.pop() {
            let refs_after = match self.entries.get_mut(&id) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs
                }
                None => continue,
            };
            if refs_after > 0 {
                survivor = true;
                continue;
            }
            let Some(entry) = self.entries.remove(&id) else {
                continue;
            };
            self.by_handle.remove(&entry.glue.handle);
            entry.glue.for_each_child(|child| work.push(child));
            outcome.evicted.push(Eviction {
                id,
                handle: entry.glue.handle,
                listener: entry.listener,
            });
        }

        if survivor {
            self.mark_and_evict(&mut outcome);
        }
        outcome
    }

    /// Mark everything reachable from the root, evict the rest, and
    /// recount the survivors' edges.
    fn mark_and_evict(&mut self, outcome: &mut SweepOutcome) {
        let mut live = AHashSet::new();
        if let Some(RootEdge::Node(root_id)) = self.root {
            let mut work = vec![root_id];
            while let Some(id) = work.pop() {
                if !live.insert(id) {
                    continue;
                }
                if let Some(entry) = self.entries.get(&id) {
                    entry.glue.for_each_child(|child| {
                        if !live.contains(&child) {
                            work.push(child);
                        }
                    });
                }
            }
        }
        let dead: Vec<HostId> = self
            .entries
            .keys()
            .filter(|id| !live.contains(*id))
            .copied()
            .collect();
        for id in dead {
            if let Some(entry) = self.entries.remove(&id) {
                self.by_handle.remove(&entry.glue.handle);
                outcome.evicted.push(Eviction {
                    id,
                    handle: entry.glue.handle,
                    listener: entry.listener,
                });
            }
        }

        // Edges out of the evicted set leave stale counts on survivors.
        // Rebuild every surviving count from the remaining edges so the
        // next cascade starts exact.
        let mut counts: AHashMap<HostId, usize> = AHashMap::with_capacity(self.entries.len());
        if let Some(RootEdge::Node(root_id)) = self.root {
            *counts.entry(root_id).or_default() += 1;
        }
        for entry in self.entries.values() {
            entry.glue.for_each_child(|child| {
                *counts.entry(child).or_default() += 1;
            });
        }
        for (id, entry) in self.entries.iter_mut() {
            entry.refs = counts.get(id).copied().unwrap_or(0);
        }
    }

    /// Tear everything down. Used on dispose; the root edge is cleared.
    pub(crate) fn take_all(&mut self) -> Vec<Eviction> {
        self.root = None;
        self.by_handle.clear();
        self.entries
            .drain()
            .map(|(id, entry)| Eviction {
                id,
                handle: entry.glue.handle,
                listener: entry.listener,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tain_core::host::{PropertySpec, PropertyObserver, SubscriptionId};
    use tain_core::{HostValue, ObjectRef};

    use crate::glue::{GluePayload, GlueProperty, GlueValue, SourceRef};

    struct Inert;
    impl tain_core::host::ObservableObject for Inert {
        fn properties(&self) -> Vec<PropertySpec> {
            Vec::new()
        }
        fn property(&self, _name: &str) -> Option<HostValue> {
            None
        }
        fn set_property(&self, _name: &str, _value: HostValue) -> bool {
            false
        }
        fn subscribe(&self, _observer: PropertyObserver) -> SubscriptionId {
            SubscriptionId::new(0)
        }
        fn unsubscribe(&self, _id: SubscriptionId) {}
    }

    struct Fixture {
        map: BindingMap,
        anchors: Vec<ObjectRef>,
        next_handle: u64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                map: BindingMap::new(),
                anchors: Vec::new(),
                next_handle: 1,
            }
        }

        fn node(&mut self, children: &[HostId]) -> HostId {
            let anchor: ObjectRef = Arc::new(Inert);
            let id = HostId::of_object(&anchor);
            self.anchors.push(anchor);
            let props = children
                .iter()
                .enumerate()
                .map(|(i, child)| {
                    (
                        format!("p{i}"),
                        GlueProperty {
                            value: GlueValue::Ref(*child),
                            read_only: false,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>();
            let handle = ScriptHandle::new(self.next_handle);
            self.next_handle += 1;
            self.map.insert(
                id,
                Entry {
                    refs: 0,
                    glue: GlueNode {
                        handle,
                        source: SourceRef::Object(Arc::downgrade(&self.anchors[self.anchors.len() - 1])),
                        payload: GluePayload::Object { props },
                    },
                    listener: None,
                    observed: false,
                },
            );
            for child in children {
                self.map.bump_ref(*child);
            }
            id
        }

        fn root(&mut self, id: HostId) {
            self.map.set_root(RootEdge::Node(id));
            self.map.bump_ref(id);
        }
    }

    // ── cascade ──────────────────────────────────────────────────────

    #[test]
    fn tree_detach_cascades_without_mark() {
        let mut fx = Fixture::new();
        let leaf = fx.node(&[]);
        let mid = fx.node(&[leaf]);
        let root = fx.node(&[mid]);
        fx.root(root);

        let outcome = fx.map.release_edges(vec![mid]);
        let evicted: Vec<HostId> = outcome.evicted.iter().map(|e| e.id).collect();
        assert!(evicted.contains(&mid));
        assert!(evicted.contains(&leaf));
        assert_eq!(fx.map.len(), 1);
        assert!(fx.map.contains(root));
    }

    #[test]
    fn shared_child_survives_single_release() {
        let mut fx = Fixture::new();
        let shared = fx.node(&[]);
        let a = fx.node(&[shared]);
        let b = fx.node(&[shared]);
        let root = fx.node(&[a, b]);
        fx.root(root);

        let outcome = fx.map.release_edges(vec![a]);
        let evicted: Vec<HostId> = outcome.evicted.iter().map(|e| e.id).collect();
        assert!(evicted.contains(&a));
        assert!(!evicted.contains(&shared));
        assert!(fx.map.contains(shared));
    }

    #[test]
    fn duplicate_seeds_drop_multiple_edges() {
        let mut fx = Fixture::new();
        let shared = fx.node(&[]);
        let root = fx.node(&[shared, shared]);
        fx.root(root);
        assert_eq!(fx.map.get(shared).unwrap().refs, 2);

        let outcome = fx.map.release_edges(vec![shared, shared]);
        assert!(outcome.evicted.iter().any(|e| e.id == shared));
        assert!(!fx.map.contains(shared));
    }

    // ── detached cycles ──────────────────────────────────────────────

    #[test]
    fn detached_cycle_reclaimed_by_mark_pass() {
        let mut fx = Fixture::new();
        // root -> x -> a <-> b
        let a_placeholder = fx.node(&[]);
        let b = fx.node(&[a_placeholder]);
        // Re-point a at b to close the cycle.
        let a = a_placeholder;
        if let Some(entry) = fx.map.get_mut(a) {
            let GluePayload::Object { props } = &mut entry.glue.payload else {
                unreachable!()
            };
            props.insert(
                "next".into(),
                GlueProperty {
                    value: GlueValue::Ref(b),
                    read_only: false,
                },
            );
        }
        fx.map.bump_ref(b);
        let x = fx.node(&[a]);
        let root = fx.node(&[x]);
        fx.root(root);

        // a: edges from b and x (refs 2); b: edge from a (refs 1).
        let outcome = fx.map.release_edges(vec![x]);
        let evicted: Vec<HostId> = outcome.evicted.iter().map(|e| e.id).collect();
        assert!(evicted.contains(&x));
        assert!(evicted.contains(&a), "cycle member a leaked");
        assert!(evicted.contains(&b), "cycle member b leaked");
        assert_eq!(fx.map.len(), 1);
    }

    #[test]
    fn reachable_shared_node_survives_mark_pass() {
        let mut fx = Fixture::new();
        let shared = fx.node(&[]);
        let a = fx.node(&[shared]);
        let root = fx.node(&[a, shared]);
        fx.root(root);

        // Releasing a decrements shared to 1 (survivor), triggering mark.
        let outcome = fx.map.release_edges(vec![a]);
        assert!(outcome.evicted.iter().any(|e| e.id == a));
        assert!(fx.map.contains(shared));
    }

    #[test]
    fn mark_pass_rebuilds_survivor_counts() {
        let mut fx = Fixture::new();
        // root -> {x, s}; x -> a; a -> {b, s}; b -> a.
        let s = fx.node(&[]);
        let a = fx.node(&[s]);
        let b = fx.node(&[a]);
        if let Some(entry) = fx.map.get_mut(a) {
            let GluePayload::Object { props } = &mut entry.glue.payload else {
                unreachable!()
            };
            props.insert(
                "next".into(),
                GlueProperty {
                    value: GlueValue::Ref(b),
                    read_only: false,
                },
            );
        }
        fx.map.bump_ref(b);
        let x = fx.node(&[a]);
        let root = fx.node(&[x, s]);
        fx.root(root);
        assert_eq!(fx.map.get(s).unwrap().refs, 2);

        // Detaching x strands the a<->b cycle; the mark pass evicts it
        // and must drop the edge a held into s from s's count.
        let outcome = fx.map.release_edges(vec![x]);
        let evicted: Vec<HostId> = outcome.evicted.iter().map(|e| e.id).collect();
        assert!(evicted.contains(&a));
        assert!(evicted.contains(&b));
        assert!(fx.map.contains(s));
        assert_eq!(fx.map.get(s).unwrap().refs, 1);
    }

    // ── teardown ─────────────────────────────────────────────────────

    #[test]
    fn take_all_drains_every_entry() {
        let mut fx = Fixture::new();
        let leaf = fx.node(&[]);
        let root = fx.node(&[leaf]);
        fx.root(root);

        let evicted = fx.map.take_all();
        assert_eq!(evicted.len(), 2);
        assert_eq!(fx.map.len(), 0);
        assert!(fx.map.root().is_none());
    }

    #[test]
    fn handle_index_tracks_evictions() {
        let mut fx = Fixture::new();
        let leaf = fx.node(&[]);
        let root = fx.node(&[leaf]);
        fx.root(root);
        let handle = fx.map.handle_of(leaf).unwrap();
        assert_eq!(fx.map.id_of(handle), Some(leaf));

        fx.map.release_edges(vec![leaf]);
        assert_eq!(fx.map.id_of(handle), None);
    }
}
