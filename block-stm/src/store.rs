//! Store views over the logical key-value store.
//!
//! A [`KvStore`] is either the root [`MemStore`] or a [`BranchStore`]: a
//! copy-on-write overlay that buffers writes locally and falls through to its
//! parent for everything it has not touched. A branch never writes to its
//! parent; its buffered writes are handed over as a [`Changeset`] and merged
//! explicitly.

use crate::error::{Result, StmError};
use crate::types::{Key, StoreKey, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Buffered writes of a branch. `None` is a tombstone.
pub type WriteBuffer = BTreeMap<Key, Option<Value>>;

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a store view, used to reject foreign merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(u64);

impl ViewId {
    pub fn next() -> Self {
        ViewId(NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Read side of a store view.
pub trait KvRead {
    /// Returns the value under `key`, or `None` if absent or deleted.
    fn get(&self, key: &Key) -> Option<Value>;

    /// Returns every live entry of `store` whose key starts with `prefix`,
    /// in ascending key order.
    fn scan(&self, store: &StoreKey, prefix: &[u8]) -> Vec<(Vec<u8>, Value)>;

    /// Enumerates the partitions of the store.
    ///
    /// For callers that walk the whole key space. Execution never needs it:
    /// a multi-version view resolves any key of any partition on demand.
    fn stores(&self) -> Vec<StoreKey>;

    /// Identity of this view.
    fn view_id(&self) -> ViewId;
}

/// Read/write store view.
pub trait KvStore: KvRead {
    fn set(&mut self, key: Key, value: Value);

    fn delete(&mut self, key: &Key);

    /// Applies the buffered writes of a branch taken from this view.
    fn merge(&mut self, changes: Changeset) -> Result<()>;
}

/// The writes of a consumed branch, tagged with the view it was branched from.
#[derive(Debug, Clone)]
pub struct Changeset {
    origin: ViewId,
    writes: WriteBuffer,
}

impl Changeset {
    pub fn new(origin: ViewId, writes: WriteBuffer) -> Self {
        Self { origin, writes }
    }

    pub fn into_writes(self) -> WriteBuffer {
        self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    fn check_origin(&self, target: ViewId) -> Result<()> {
        if self.origin != target {
            return Err(StmError::invariant(format!(
                "changeset branched from view {:?} merged into view {:?}",
                self.origin, target
            )));
        }
        Ok(())
    }
}

fn prefix_range<'a, V>(
    map: &'a BTreeMap<Key, V>,
    store: &'a StoreKey,
    prefix: &'a [u8],
) -> impl Iterator<Item = (&'a Key, &'a V)> + 'a {
    let start = Key::new(store, prefix.to_vec());
    map.range(start..)
        .take_while(move |(k, _)| &k.store == store && k.bytes.starts_with(prefix))
}

// ============================================================================
// Root Store
// ============================================================================

/// In-memory root store: the block-global logical store.
#[derive(Debug)]
pub struct MemStore {
    id: ViewId,
    stores: BTreeSet<StoreKey>,
    data: BTreeMap<Key, Value>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            id: ViewId::next(),
            stores: BTreeSet::new(),
            data: BTreeMap::new(),
        }
    }

    /// Creates a store with the given partitions pre-registered.
    pub fn with_stores<I>(stores: I) -> Self
    where
        I: IntoIterator<Item = StoreKey>,
    {
        let mut store = Self::new();
        store.stores.extend(stores);
        store
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates every entry across all partitions.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.data.iter()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemStore {
    /// A clone is a distinct view with its own identity.
    fn clone(&self) -> Self {
        Self {
            id: ViewId::next(),
            stores: self.stores.clone(),
            data: self.data.clone(),
        }
    }
}

impl PartialEq for MemStore {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for MemStore {}

impl KvRead for MemStore {
    fn get(&self, key: &Key) -> Option<Value> {
        self.data.get(key).cloned()
    }

    fn scan(&self, store: &StoreKey, prefix: &[u8]) -> Vec<(Vec<u8>, Value)> {
        prefix_range(&self.data, store, prefix)
            .map(|(k, v)| (k.bytes.clone(), v.clone()))
            .collect()
    }

    fn stores(&self) -> Vec<StoreKey> {
        self.stores.iter().cloned().collect()
    }

    fn view_id(&self) -> ViewId {
        self.id
    }
}

impl KvStore for MemStore {
    fn set(&mut self, key: Key, value: Value) {
        if !self.stores.contains(&key.store) {
            self.stores.insert(key.store.clone());
        }
        self.data.insert(key, value);
    }

    fn delete(&mut self, key: &Key) {
        self.data.remove(key);
    }

    fn merge(&mut self, changes: Changeset) -> Result<()> {
        changes.check_origin(self.id)?;
        for (key, value) in changes.writes {
            match value {
                Some(value) => self.set(key, value),
                None => self.delete(&key),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Branch Store
// ============================================================================

/// A nested, copy-on-write view over a parent store.
pub struct BranchStore<'a, P: KvRead + ?Sized> {
    id: ViewId,
    parent: &'a P,
    buffer: WriteBuffer,
}

impl<'a, P: KvRead + ?Sized> BranchStore<'a, P> {
    /// Branches off `parent`. Writes stay local until merged.
    pub fn new(parent: &'a P) -> Self {
        Self {
            id: ViewId::next(),
            parent,
            buffer: WriteBuffer::new(),
        }
    }

    pub fn buffer(&self) -> &WriteBuffer {
        &self.buffer
    }

    /// Replaces the local buffer wholesale. Used to restore a captured state.
    pub fn restore(&mut self, buffer: WriteBuffer) {
        self.buffer = buffer;
    }

    /// Returns the buffered entry for `key`: `Some(None)` is a tombstone.
    pub fn buffered(&self, key: &Key) -> Option<Option<Value>> {
        self.buffer.get(key).cloned()
    }

    /// Restores a single buffered entry to `prev`.
    pub fn restore_key(&mut self, key: Key, prev: Option<Option<Value>>) {
        match prev {
            Some(entry) => {
                self.buffer.insert(key, entry);
            }
            None => {
                self.buffer.remove(&key);
            }
        }
    }

    /// Consumes the branch and returns its writes for merging into the parent.
    pub fn into_changeset(self) -> Changeset {
        Changeset::new(self.parent.view_id(), self.buffer)
    }
}

impl<P: KvRead + ?Sized> KvRead for BranchStore<'_, P> {
    fn get(&self, key: &Key) -> Option<Value> {
        match self.buffer.get(key) {
            Some(entry) => entry.clone(),
            None => self.parent.get(key),
        }
    }

    fn scan(&self, store: &StoreKey, prefix: &[u8]) -> Vec<(Vec<u8>, Value)> {
        let mut merged: BTreeMap<Vec<u8>, Value> =
            self.parent.scan(store, prefix).into_iter().collect();
        for (key, entry) in prefix_range(&self.buffer, store, prefix) {
            match entry {
                Some(value) => {
                    merged.insert(key.bytes.clone(), value.clone());
                }
                None => {
                    merged.remove(&key.bytes);
                }
            }
        }
        merged.into_iter().collect()
    }

    fn stores(&self) -> Vec<StoreKey> {
        let mut stores: BTreeSet<StoreKey> = self.parent.stores().into_iter().collect();
        stores.extend(self.buffer.keys().map(|k| k.store.clone()));
        stores.into_iter().collect()
    }

    fn view_id(&self) -> ViewId {
        self.id
    }
}

impl<P: KvRead + ?Sized> KvStore for BranchStore<'_, P> {
    fn set(&mut self, key: Key, value: Value) {
        self.buffer.insert(key, Some(value));
    }

    fn delete(&mut self, key: &Key) {
        self.buffer.insert(key.clone(), None);
    }

    fn merge(&mut self, changes: Changeset) -> Result<()> {
        changes.check_origin(self.id)?;
        self.buffer.extend(changes.writes);
        Ok(())
    }
}
