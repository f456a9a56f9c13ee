//! Block-STM parallel executor over a journaled key-value store.
//!
//! This crate executes a block of state-mutating transactions against a
//! shared logical store. Transactions run speculatively in parallel using
//! optimistic concurrency control; conflicts are detected by validation and
//! resolved by re-execution, so the outcome always equals running the block
//! sequentially in index order.
//!
//! # Core Components
//!
//! - **Store views** ([`store`]): the root [`MemStore`] and copy-on-write
//!   [`BranchStore`] overlays, merged explicitly through [`Changeset`]s
//! - **Journal** ([`journal`]): snapshot/revert of a transaction's working
//!   state and its auxiliary event log
//! - **MVHashMap**: multi-version record of writes by transaction index
//! - **Scheduler**: coordinates execution and validation tasks across workers
//! - **Executors**: [`SequentialExecutor`] (reference semantics) and
//!   [`ParallelExecutor`]
//!
//! # Algorithm Overview
//!
//! 1. Every transaction is queued for execution at incarnation 0
//! 2. An attempt reads lower transactions' writes from the MVHashMap, or the
//!    base store, recording the version of everything it read
//! 3. Its writes are installed in the MVHashMap and its read set validated
//! 4. A failed validation aborts the incarnation and re-executes it; writes
//!    schedule revalidation of every higher transaction
//! 5. Once nothing is pending, write sets are merged into the base store in
//!    ascending index order
//!
//! # Example
//!
//! ```rust
//! use block_stm::{
//!     BlockExecutor, BoxError, ExecutorConfig, Key, KvRead, KvStore, MemStore, ParallelExecutor,
//!     StoreKey,
//! };
//!
//! let bank = StoreKey::new("bank");
//! let mut store = MemStore::with_stores([bank.clone()]);
//!
//! let executor = ParallelExecutor::new(ExecutorConfig { num_threads: 4 });
//! let results = executor
//!     .execute_block(&mut store, 10, |txn_idx, view: &mut dyn KvStore| {
//!         let counter = Key::new(&bank, b"counter".to_vec());
//!         let n = view.get(&counter).map(|v| v[0]).unwrap_or(0);
//!         view.set(counter, vec![n + 1]);
//!         Ok::<_, BoxError>((txn_idx, n))
//!     })
//!     .unwrap();
//!
//! assert_eq!(results[9], (9, 9));
//! ```

pub mod error;
pub mod executor;
pub mod journal;
pub mod mvhashmap;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod view;

pub use error::{BoxError, Result, StmError};
pub use executor::{
    BlockExecutor, Cancellation, ExecutionStats, ExecutorConfig, ParallelExecutor,
    SequentialExecutor,
};
pub use journal::{Event, Journal, JournalEntry, JournalId, JournaledState};
pub use store::{BranchStore, Changeset, KvRead, KvStore, MemStore, ViewId, WriteBuffer};
pub use types::{ExecutionStatus, Incarnation, Key, StoreKey, TxnIndex, Value, Version};
