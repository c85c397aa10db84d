use crate::{
    avl::AvlTree,
    error::IndexError,
    gate::Gate,
};
use std::cmp::Ordering;

struct Inner<T> {
    tree: AvlTree<T>,
    cmp: Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>,
}

/// A thread-safe ordered index over caller-defined ordering.
///
/// Constructed with the total order among stored values; lookups may use a
/// different key type with a per-call comparator, so a store of rich records
/// can be queried by a bare identifier (a string id, typically). Every
/// public operation acquires the shared gate for its whole body: readers run
/// concurrently, a mutation excludes everything else.
pub struct OrderedIndex<T> {
    inner: Gate<Inner<T>>,
}

impl<T> OrderedIndex<T> {
    pub fn new(cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            inner: Gate::new(Inner {
                tree: AvlTree::new(),
                cmp: Box::new(cmp),
            }),
        }
    }

    /// Adds `value`, failing with [`IndexError::DuplicateKey`] if an entry
    /// comparing equal is already stored.
    pub fn add(&self, value: T) -> Result<(), IndexError> {
        let mut inner = self.inner.write();
        let Inner { tree, cmp } = &mut *inner;
        tree.insert_with(value, &**cmp)
    }

    /// Removes and returns the entry matching `key`.
    pub fn remove<K>(&self, key: &K, cmp: impl Fn(&T, &K) -> Ordering) -> Result<T, IndexError> {
        self.inner.write().tree.remove_with(key, cmp)
    }

    /// Removes the entry comparing equal to `value` under the stored
    /// ordering.
    pub fn remove_value(&self, value: &T) -> Result<T, IndexError> {
        let mut inner = self.inner.write();
        let Inner { tree, cmp } = &mut *inner;
        tree.remove_with(value, &**cmp)
    }

    /// Clones out the entry matching `key`, failing with
    /// [`IndexError::NotFound`] if absent.
    pub fn get<K>(&self, key: &K, cmp: impl Fn(&T, &K) -> Ordering) -> Result<T, IndexError>
    where
        T: Clone,
    {
        self.inner.read().tree.get_with(key, cmp).map(|value| value.clone())
    }

    /// Like [`OrderedIndex::get`], but absence is a normal case.
    pub fn try_get<K>(&self, key: &K, cmp: impl Fn(&T, &K) -> Ordering) -> Option<T>
    where
        T: Clone,
    {
        self.inner.read().tree.try_get_with(key, cmp).cloned()
    }

    pub fn contains<K>(&self, key: &K, cmp: impl Fn(&T, &K) -> Ordering) -> bool {
        self.inner.read().tree.contains_with(key, cmp)
    }

    pub fn len(&self) -> usize {
        self.inner.read().tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().tree.is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().tree.clear();
    }

    /// In-order (sorted) visitation under a read hold.
    pub fn for_each(&self, visit: impl FnMut(&T)) {
        self.inner.read().tree.for_each(visit);
    }

    /// Sorted visitation that stops when the visitor returns `false`;
    /// returns whether it ran to completion.
    pub fn for_each_while(&self, visit: impl FnMut(&T) -> bool) -> bool {
        self.inner.read().tree.for_each_while(visit)
    }

    pub fn for_each_preorder(&self, visit: impl FnMut(&T)) {
        self.inner.read().tree.for_each_preorder(visit);
    }

    pub fn for_each_postorder(&self, visit: impl FnMut(&T)) {
        self.inner.read().tree.for_each_postorder(visit);
    }

    /// Materialized in-order snapshot.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.inner.read().tree.to_vec()
    }
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
struct Resource {
    id: String,
    handle: u32,
}

#[cfg(test)]
fn by_id(stored: &Resource, key: &&str) -> Ordering {
    stored.id.as_str().cmp(key)
}

#[test]
fn string_keyed_store_contract() {
    // The contract the asset managers rely on: add, get-by-id (raises when
    // absent), contains, remove-by-id.
    let store = OrderedIndex::new(|a: &Resource, b: &Resource| a.id.cmp(&b.id));

    for (id, handle) in [("brick.png", 11u32), ("noise.png", 12), ("ui.png", 13)] {
        store
            .add(Resource { id: id.to_string(), handle })
            .unwrap();
    }

    assert_eq!(store.get(&"noise.png", by_id).unwrap().handle, 12);
    assert!(store.contains(&"ui.png", by_id));
    assert_eq!(store.get(&"absent.png", by_id), Err(IndexError::NotFound));
    assert_eq!(store.try_get(&"absent.png", by_id), None);

    assert_eq!(
        store
            .add(Resource { id: "brick.png".to_string(), handle: 99 })
            .unwrap_err(),
        IndexError::DuplicateKey
    );
    assert_eq!(store.len(), 3);

    let removed = store.remove(&"brick.png", by_id).unwrap();
    assert_eq!(removed.handle, 11);
    assert!(!store.contains(&"brick.png", by_id));
    assert_eq!(store.len(), 2);

    let ids: Vec<String> = store.to_vec().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, ["noise.png", "ui.png"]);
}

#[test]
fn remove_value_uses_stored_ordering() {
    let store = OrderedIndex::new(|a: &Resource, b: &Resource| a.id.cmp(&b.id));
    let lamp = Resource { id: "lamp".to_string(), handle: 4 };
    store.add(lamp.clone()).unwrap();

    // Only the id participates in the ordering, the handle may differ.
    let probe = Resource { id: "lamp".to_string(), handle: 0 };
    assert_eq!(store.remove_value(&probe), Ok(lamp));
    assert!(store.is_empty());
}

#[test]
fn concurrent_readers_with_excluded_writers() {
    use std::sync::atomic::{ AtomicUsize, Ordering as AtomicOrdering };

    let store = OrderedIndex::new(u32::cmp);
    for key in 0..64u32 {
        store.add(key).unwrap();
    }

    let reads = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..50 {
                    // Each walk must observe a consistent sorted snapshot.
                    let mut prev = None;
                    let mut count = 0;
                    store.for_each(|v| {
                        assert!(prev.map_or(true, |p: u32| p < *v));
                        prev = Some(*v);
                        count += 1;
                    });
                    assert!(count >= 64);
                    reads.fetch_add(1, AtomicOrdering::Relaxed);
                }
            });
        }
        scope.spawn(|| {
            for key in 64..128u32 {
                store.add(key).unwrap();
            }
        });
    });

    assert_eq!(reads.load(AtomicOrdering::Relaxed), 200);
    assert_eq!(store.len(), 128);
}
