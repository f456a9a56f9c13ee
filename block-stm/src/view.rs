//! Read-recording view for one speculative attempt.

use crate::mvhashmap::{MVHashMap, ReadResult};
use crate::store::{KvRead, ViewId};
use crate::types::{Key, StoreKey, TxnIndex, Value, Version};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// One observation made by an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadDescriptor {
    /// A point read. `None` means the value came from base storage.
    Point { key: Key, version: Option<Version> },
    /// A prefix scan and the `(key, version)` list it resolved.
    Scan {
        store: StoreKey,
        prefix: Vec<u8>,
        observed: Vec<(Vec<u8>, Option<Version>)>,
    },
}

/// Everything an attempt read, in the order it read it.
#[derive(Debug, Clone, Default)]
pub struct ReadSet {
    reads: Vec<ReadDescriptor>,
}

impl ReadSet {
    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadDescriptor> {
        self.reads.iter()
    }

    /// Re-resolves every read for `txn_idx` and reports whether all of them
    /// still observe the same version.
    pub fn validate<S: KvRead + ?Sized>(
        &self,
        mv: &MVHashMap,
        base: &S,
        txn_idx: TxnIndex,
    ) -> bool {
        self.reads.iter().all(|read| match read {
            ReadDescriptor::Point { key, version } => mv.read(key, txn_idx).version() == *version,
            ReadDescriptor::Scan {
                store,
                prefix,
                observed,
            } => {
                let current: Vec<_> = resolve_scan(mv, base, store, prefix, txn_idx)
                    .into_iter()
                    .map(|(k, (version, _))| (k, version))
                    .collect();
                current == *observed
            }
        })
    }
}

/// Merges base entries with multi-version entries visible to `txn_idx`.
/// Deletions are kept so their versions take part in validation.
fn resolve_scan<S: KvRead + ?Sized>(
    mv: &MVHashMap,
    base: &S,
    store: &StoreKey,
    prefix: &[u8],
    txn_idx: TxnIndex,
) -> BTreeMap<Vec<u8>, (Option<Version>, Option<Value>)> {
    let mut merged: BTreeMap<Vec<u8>, (Option<Version>, Option<Value>)> = base
        .scan(store, prefix)
        .into_iter()
        .map(|(k, v)| (k, (None, Some(v))))
        .collect();
    for (k, version, value) in mv.scan(store, prefix, txn_idx) {
        merged.insert(k, (Some(version), value));
    }
    merged
}

/// The view an attempt of transaction `txn_idx` reads through: writes of
/// lower transactions from the multi-version map first, base storage second.
pub struct MvView<'a, S: KvRead + ?Sized> {
    id: ViewId,
    base: &'a S,
    mv: &'a MVHashMap,
    txn_idx: TxnIndex,
    reads: RefCell<ReadSet>,
}

impl<'a, S: KvRead + ?Sized> MvView<'a, S> {
    pub fn new(base: &'a S, mv: &'a MVHashMap, txn_idx: TxnIndex) -> Self {
        Self {
            id: ViewId::next(),
            base,
            mv,
            txn_idx,
            reads: RefCell::new(ReadSet::default()),
        }
    }

    pub fn into_read_set(self) -> ReadSet {
        self.reads.into_inner()
    }

    fn record(&self, read: ReadDescriptor) {
        self.reads.borrow_mut().reads.push(read);
    }
}

impl<S: KvRead + ?Sized> KvRead for MvView<'_, S> {
    fn get(&self, key: &Key) -> Option<Value> {
        match self.mv.read(key, self.txn_idx) {
            ReadResult::Versioned(version, value) => {
                self.record(ReadDescriptor::Point {
                    key: key.clone(),
                    version: Some(version),
                });
                value
            }
            ReadResult::Storage => {
                self.record(ReadDescriptor::Point {
                    key: key.clone(),
                    version: None,
                });
                self.base.get(key)
            }
        }
    }

    fn scan(&self, store: &StoreKey, prefix: &[u8]) -> Vec<(Vec<u8>, Value)> {
        let merged = resolve_scan(self.mv, self.base, store, prefix, self.txn_idx);
        self.record(ReadDescriptor::Scan {
            store: store.clone(),
            prefix: prefix.to_vec(),
            observed: merged.iter().map(|(k, (v, _))| (k.clone(), *v)).collect(),
        });
        merged
            .into_iter()
            .filter_map(|(k, (_, value))| value.map(|v| (k, v)))
            .collect()
    }

    fn stores(&self) -> Vec<StoreKey> {
        self.base.stores()
    }

    fn view_id(&self) -> ViewId {
        self.id
    }
}
