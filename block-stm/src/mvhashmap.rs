//! Multi-version hashmap for storing versioned writes.
//!
//! This is the core data structure that enables parallel execution with
//! optimistic concurrency control. For each key, it stores the latest write
//! of every transaction that touched it, allowing a transaction to read the
//! value written by the highest lower-indexed transaction.

use crate::store::WriteBuffer;
use crate::types::{Incarnation, Key, StoreKey, TxnIndex, Value, Version};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Entry in the version history for a key.
#[derive(Debug, Clone)]
pub struct VersionedEntry {
    pub incarnation: Incarnation,
    /// `None` records a deletion.
    pub value: Option<Value>,
}

/// Multi-version hashmap storing versioned writes.
///
/// Structure: Key -> BTreeMap<TxnIndex -> VersionedEntry>
///
/// The BTreeMap is keyed by TxnIndex for efficient range queries to find
/// the latest version written by a transaction with index < reader index.
pub struct MVHashMap {
    data: DashMap<Key, BTreeMap<TxnIndex, VersionedEntry>>,
    /// Sorted key bytes ever written, per partition. Only grows within a block.
    index: DashMap<StoreKey, BTreeSet<Vec<u8>>>,
}

/// Result of reading from the MVHashMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Written by a lower transaction at this version. `None` is a deletion.
    Versioned(Version, Option<Value>),
    /// No lower transaction wrote the key; read from base storage.
    Storage,
}

impl ReadResult {
    pub fn version(&self) -> Option<Version> {
        match self {
            ReadResult::Versioned(version, _) => Some(*version),
            ReadResult::Storage => None,
        }
    }
}

impl MVHashMap {
    /// Creates a new empty multi-version hashmap.
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            index: DashMap::new(),
        }
    }

    /// Reads the latest version of `key` visible to `reader_txn_idx`.
    pub fn read(&self, key: &Key, reader_txn_idx: TxnIndex) -> ReadResult {
        if let Some(versions) = self.data.get(key) {
            if let Some((&writer, entry)) = versions.range(..reader_txn_idx).next_back() {
                return ReadResult::Versioned(
                    Version::new(writer, entry.incarnation),
                    entry.value.clone(),
                );
            }
        }
        ReadResult::Storage
    }

    /// Writes a new version of `key` for a transaction.
    pub fn write(
        &self,
        key: Key,
        writer_txn_idx: TxnIndex,
        incarnation: Incarnation,
        value: Option<Value>,
    ) {
        // Indexed before the version is published, so a scan that sees the
        // version also finds the key.
        {
            let mut keys = self.index.entry(key.store.clone()).or_default();
            if !keys.contains(&key.bytes) {
                keys.insert(key.bytes.clone());
            }
        }
        self.data
            .entry(key)
            .or_default()
            .insert(writer_txn_idx, VersionedEntry { incarnation, value });
    }

    /// Removes a transaction's write of `key`. Returns true if one existed.
    pub fn remove(&self, key: &Key, txn_idx: TxnIndex) -> bool {
        let removed = match self.data.get_mut(key) {
            Some(mut versions) => versions.remove(&txn_idx).is_some(),
            None => false,
        };
        if removed {
            self.data.remove_if(key, |_, versions| versions.is_empty());
        }
        removed
    }

    /// Installs the write set of one incarnation, dropping keys the previous
    /// incarnation wrote that this one did not.
    ///
    /// Returns true if any entry was written or removed.
    pub fn apply_writes<'k, I>(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        writes: &WriteBuffer,
        prev_keys: I,
    ) -> bool
    where
        I: IntoIterator<Item = &'k Key>,
    {
        let mut changed = false;
        for key in prev_keys {
            if !writes.contains_key(key) {
                changed |= self.remove(key, txn_idx);
            }
        }
        for (key, value) in writes {
            self.write(key.clone(), txn_idx, incarnation, value.clone());
            changed = true;
        }
        changed
    }

    /// Resolves every key of `store` starting with `prefix` for a reader,
    /// including deletions. Sorted by key bytes.
    ///
    /// Walks only the partition's indexed keys in the prefix range.
    pub fn scan(
        &self,
        store: &StoreKey,
        prefix: &[u8],
        reader_txn_idx: TxnIndex,
    ) -> Vec<(Vec<u8>, Version, Option<Value>)> {
        let keys = match self.index.get(store) {
            Some(keys) => keys,
            None => return Vec::new(),
        };
        keys.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|bytes| bytes.starts_with(prefix))
            .filter_map(|bytes| {
                let versions = self.data.get(&Key::new(store, bytes.clone()))?;
                let (&writer, versioned) = versions.range(..reader_txn_idx).next_back()?;
                Some((
                    bytes.clone(),
                    Version::new(writer, versioned.incarnation),
                    versioned.value.clone(),
                ))
            })
            .collect()
    }

    /// Number of keys with at least one recorded version.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MVHashMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> Key {
        Key::new(&StoreKey::new("acc"), k.as_bytes().to_vec())
    }

    #[test]
    fn test_read_write() {
        let mv = MVHashMap::new();

        // Read from empty map
        assert_eq!(mv.read(&key("a"), 1), ReadResult::Storage);

        // Write from transaction 0
        mv.write(key("a"), 0, 0, Some(b"100".to_vec()));

        // Transaction 1 should see transaction 0's write
        assert_eq!(
            mv.read(&key("a"), 1),
            ReadResult::Versioned(Version::new(0, 0), Some(b"100".to_vec()))
        );

        // Transaction 0 never sees its own entry
        assert_eq!(mv.read(&key("a"), 0), ReadResult::Storage);
    }

    #[test]
    fn test_reads_highest_lower_writer() {
        let mv = MVHashMap::new();
        mv.write(key("a"), 1, 0, Some(b"1".to_vec()));
        mv.write(key("a"), 3, 2, Some(b"3".to_vec()));
        mv.write(key("a"), 5, 0, None);

        assert_eq!(mv.read(&key("a"), 3).version(), Some(Version::new(1, 0)));
        assert_eq!(mv.read(&key("a"), 4).version(), Some(Version::new(3, 2)));
        assert_eq!(
            mv.read(&key("a"), 6),
            ReadResult::Versioned(Version::new(5, 0), None)
        );
    }

    #[test]
    fn test_apply_writes_drops_stale_keys() {
        let mv = MVHashMap::new();
        let mut first = WriteBuffer::new();
        first.insert(key("a"), Some(b"1".to_vec()));
        first.insert(key("b"), Some(b"1".to_vec()));
        assert!(mv.apply_writes(2, 0, &first, std::iter::empty()));

        let mut second = WriteBuffer::new();
        second.insert(key("a"), Some(b"2".to_vec()));
        assert!(mv.apply_writes(2, 1, &second, first.keys()));

        assert_eq!(mv.read(&key("b"), 3), ReadResult::Storage);
        assert_eq!(
            mv.read(&key("a"), 3),
            ReadResult::Versioned(Version::new(2, 1), Some(b"2".to_vec()))
        );

        let empty = WriteBuffer::new();
        assert!(!mv.apply_writes(4, 0, &empty, std::iter::empty()));
        assert_eq!(mv.len(), 1);
    }

    #[test]
    fn test_remove_drops_emptied_keys() {
        let mv = MVHashMap::new();
        assert!(mv.is_empty());

        mv.write(key("a"), 1, 0, Some(b"1".to_vec()));
        mv.write(key("a"), 4, 0, Some(b"4".to_vec()));
        assert!(mv.remove(&key("a"), 1));
        assert_eq!(mv.len(), 1);

        assert!(mv.remove(&key("a"), 4));
        assert!(!mv.remove(&key("a"), 4));
        assert!(mv.is_empty());
        assert!(mv.scan(&StoreKey::new("acc"), b"", 9).is_empty());
    }

    #[test]
    fn test_scan_resolves_per_reader() {
        let mv = MVHashMap::new();
        mv.write(key("p2"), 0, 0, Some(b"x".to_vec()));
        mv.write(key("p1"), 2, 0, None);
        mv.write(key("q1"), 0, 0, Some(b"y".to_vec()));

        let seen = mv.scan(&StoreKey::new("acc"), b"p", 1);
        assert_eq!(seen, vec![(b"p2".to_vec(), Version::new(0, 0), Some(b"x".to_vec()))]);

        let seen = mv.scan(&StoreKey::new("acc"), b"p", 3);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, b"p1".to_vec());
        assert_eq!(seen[0].2, None);

        assert!(mv.scan(&StoreKey::new("evm"), b"", 3).is_empty());
    }
}
