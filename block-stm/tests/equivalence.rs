//! Parallel execution must be indistinguishable from sequential execution.

use block_stm::{
    BlockExecutor, BoxError, Changeset, Event, ExecutorConfig, JournaledState, Key, KvRead,
    KvStore, MemStore, ParallelExecutor, SequentialExecutor, StoreKey, TxnIndex, Value, ViewId,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn store() -> StoreKey {
    StoreKey::new("s")
}

fn key(n: u8) -> Key {
    Key::new(&store(), vec![b'k', n])
}

fn named(name: &str) -> Key {
    Key::new(&store(), name.as_bytes().to_vec())
}

fn decode(value: Option<Value>) -> u64 {
    value
        .map(|v| u64::from_be_bytes(v.try_into().expect("8-byte value")))
        .unwrap_or(0)
}

fn encode(n: u64) -> Value {
    n.to_be_bytes().to_vec()
}

/// Spins until `flag` is set, giving up after a few seconds.
fn wait_for(flag: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !flag.load(Ordering::Acquire) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Random read-modify-write programs
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Read(u8),
    /// `dst = src + delta`
    Add { dst: u8, src: u8, delta: u64 },
    Delete(u8),
    Scan,
    /// Nested call: bump `key` by `delta` and revert if the result is a multiple of 3.
    Nested { key: u8, delta: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6).prop_map(Op::Read),
        (0u8..6, 0u8..6, 0u64..10).prop_map(|(dst, src, delta)| Op::Add { dst, src, delta }),
        (0u8..6).prop_map(Op::Delete),
        Just(Op::Scan),
        (0u8..6, 1u64..5).prop_map(|(key, delta)| Op::Nested { key, delta }),
    ]
}

/// Runs one program; the output is everything it observed.
fn run_program(ops: &[Op], view: &mut dyn KvStore) -> Result<Vec<u64>, BoxError> {
    let (changes, observed) = {
        let mut state = JournaledState::new(&*view);
        let mut observed = Vec::new();
        for op in ops {
            match *op {
                Op::Read(k) => observed.push(decode(state.get(&key(k)))),
                Op::Add { dst, src, delta } => {
                    let value = decode(state.get(&key(src))) + delta;
                    state.set(key(dst), encode(value));
                }
                Op::Delete(k) => state.delete(&key(k)),
                Op::Scan => {
                    let entries = state.scan(&store(), b"k");
                    observed.push(entries.len() as u64);
                    observed.push(entries.into_iter().map(|(_, v)| decode(Some(v))).sum());
                }
                Op::Nested { key: k, delta } => {
                    let snap = state.snapshot();
                    let value = decode(state.get(&key(k))) + delta;
                    state.set(key(k), encode(value));
                    state.emit(Event::new("bump").with_attribute("value", value));
                    if value % 3 == 0 {
                        state.revert_to(snap)?;
                    } else {
                        state.discard(snap)?;
                    }
                }
            }
        }
        let (changes, events) = state.finish();
        observed.push(events.len() as u64);
        (changes, observed)
    };
    view.merge(changes)?;
    Ok(observed)
}

fn seeded_store() -> MemStore {
    let mut store = MemStore::with_stores([store()]);
    store.set(key(0), encode(7));
    store.set(key(3), encode(1));
    store
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn parallel_matches_sequential(
        block in prop::collection::vec(prop::collection::vec(op_strategy(), 1..6), 0..40),
        threads in 1usize..8,
    ) {
        let apply = |idx: TxnIndex, view: &mut dyn KvStore| run_program(&block[idx], view);

        let mut sequential_store = seeded_store();
        let sequential = SequentialExecutor::new()
            .execute_block(&mut sequential_store, block.len(), apply)
            .unwrap();

        let mut parallel_store = seeded_store();
        let parallel = ParallelExecutor::new(ExecutorConfig { num_threads: threads })
            .execute_block(&mut parallel_store, block.len(), apply)
            .unwrap();

        prop_assert_eq!(parallel, sequential);
        prop_assert!(parallel_store == sequential_store);
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_conflicting_read_is_reexecuted() {
    let k = named("k");
    let txn1_ran = AtomicBool::new(false);
    let txn1_calls = AtomicUsize::new(0);

    let apply = |idx: TxnIndex, view: &mut dyn KvStore| -> Result<u64, BoxError> {
        match idx {
            0 => {
                // Hold transaction 0 back until transaction 1 has executed once.
                wait_for(&txn1_ran);
                view.set(k.clone(), encode(1));
                Ok(1)
            }
            _ => {
                txn1_calls.fetch_add(1, Ordering::Relaxed);
                let read = decode(view.get(&k));
                if read == 0 {
                    // Only the stale incarnation writes this key.
                    view.set(named("stale"), encode(1));
                }
                view.set(k.clone(), encode(read + 1));
                txn1_ran.store(true, Ordering::Release);
                Ok(read + 1)
            }
        }
    };

    let mut store = MemStore::new();
    let (results, stats) = ParallelExecutor::new(ExecutorConfig { num_threads: 2 })
        .execute_block_with_stats(&mut store, 2, apply)
        .unwrap();

    assert_eq!(results, vec![1, 2]);
    assert_eq!(store.get(&k), Some(encode(2)));
    assert_eq!(store.get(&named("stale")), None);
    assert!(txn1_calls.load(Ordering::Relaxed) >= 2);
    assert!(stats.aborts >= 1);
}

#[test]
fn test_lower_transaction_never_sees_higher_writes() {
    let x = named("x");
    let txn1_ran = AtomicBool::new(false);

    let apply = |idx: TxnIndex, view: &mut dyn KvStore| -> Result<Option<Value>, BoxError> {
        if idx == 0 {
            wait_for(&txn1_ran);
            Ok(view.get(&x))
        } else {
            view.set(x.clone(), encode(42));
            txn1_ran.store(true, Ordering::Release);
            Ok(None)
        }
    };

    let mut store = MemStore::new();
    let results = ParallelExecutor::new(ExecutorConfig { num_threads: 2 })
        .execute_block(&mut store, 2, apply)
        .unwrap();

    assert_eq!(results[0], None);
    assert_eq!(store.get(&x), Some(encode(42)));
}

#[test]
fn test_higher_index_wins_final_merge() {
    let apply = |idx: TxnIndex, view: &mut dyn KvStore| {
        view.set(named("last"), encode(idx as u64));
        if idx % 2 == 0 {
            view.delete(&named("even"));
        } else {
            view.set(named("even"), encode(idx as u64));
        }
        Ok::<_, BoxError>(())
    };

    let mut store = MemStore::new();
    ParallelExecutor::new(ExecutorConfig { num_threads: 4 })
        .execute_block(&mut store, 33, apply)
        .unwrap();

    assert_eq!(store.get(&named("last")), Some(encode(32)));
    assert_eq!(store.get(&named("even")), None);
}

/// Store wrapper counting every access.
struct CountingStore {
    inner: MemStore,
    ops: AtomicUsize,
}

impl CountingStore {
    fn touch(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }
}

impl KvRead for CountingStore {
    fn get(&self, key: &Key) -> Option<Value> {
        self.touch();
        self.inner.get(key)
    }

    fn scan(&self, store: &StoreKey, prefix: &[u8]) -> Vec<(Vec<u8>, Value)> {
        self.touch();
        self.inner.scan(store, prefix)
    }

    fn stores(&self) -> Vec<StoreKey> {
        self.touch();
        self.inner.stores()
    }

    fn view_id(&self) -> ViewId {
        self.inner.view_id()
    }
}

impl KvStore for CountingStore {
    fn set(&mut self, key: Key, value: Value) {
        self.touch();
        self.inner.set(key, value);
    }

    fn delete(&mut self, key: &Key) {
        self.touch();
        self.inner.delete(key);
    }

    fn merge(&mut self, changes: Changeset) -> block_stm::Result<()> {
        self.touch();
        self.inner.merge(changes)
    }
}

#[test]
fn test_empty_block_touches_nothing() {
    let mut store = CountingStore {
        inner: MemStore::new(),
        ops: AtomicUsize::new(0),
    };
    let apply = |_: TxnIndex, _: &mut dyn KvStore| Ok::<_, BoxError>(());

    let results = ParallelExecutor::default()
        .execute_block(&mut store, 0, apply)
        .unwrap();
    assert!(results.is_empty());

    let results = SequentialExecutor::new()
        .execute_block(&mut store, 0, apply)
        .unwrap();
    assert!(results.is_empty());

    assert_eq!(store.ops.load(Ordering::Relaxed), 0);
}

#[test]
fn test_independent_transactions_do_not_abort() {
    let apply = |idx: TxnIndex, view: &mut dyn KvStore| {
        view.set(named(&format!("acct{}", idx)), encode(idx as u64));
        Ok::<_, BoxError>(idx)
    };

    let mut store = MemStore::new();
    let (results, stats) = ParallelExecutor::new(ExecutorConfig { num_threads: 4 })
        .execute_block_with_stats(&mut store, 100, apply)
        .unwrap();

    assert_eq!(results, (0..100).collect::<Vec<_>>());
    assert_eq!(stats.aborts, 0);
    assert_eq!(stats.executions, 100);
    assert_eq!(store.len(), 100);
}
