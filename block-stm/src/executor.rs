//! Block executors: the sequential baseline and the parallel Block-STM executor.

use crate::error::{BoxError, Result, StmError};
use crate::mvhashmap::MVHashMap;
use crate::scheduler::{Scheduler, Task};
use crate::store::{BranchStore, KvRead, KvStore, WriteBuffer};
use crate::types::{ExecutionStatus, Incarnation, TxnIndex};
use crate::view::{MvView, ReadSet};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caller-side cancellation flag for a block execution.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Configuration for parallel execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads. `0` uses the available parallelism.
    pub num_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { num_threads: 0 }
    }
}

impl ExecutorConfig {
    /// Worker count for a block: at least one, at most one per transaction.
    pub fn workers_for(&self, block_size: usize) -> usize {
        let requested = if self.num_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.num_threads
        };
        requested.min(block_size).max(1)
    }
}

/// Statistics of one block execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    /// Total number of execution attempts, including re-executions.
    pub executions: usize,
    pub validations: usize,
    /// Number of incarnations aborted by failed validation.
    pub aborts: usize,
    pub workers: usize,
    /// Keys holding at least one version in the multi-version map at the end.
    pub mv_keys: usize,
    pub duration: Duration,
}

/// Trait for different block execution strategies.
///
/// The apply callback executes one transaction against the view it is given
/// and may be invoked several times for the same index. Errors it returns are
/// fatal to the whole block; transaction-level failures belong in `R`.
pub trait BlockExecutor {
    fn execute_block<S, F, R, E>(&self, store: &mut S, block_size: usize, apply: F) -> Result<Vec<R>>
    where
        S: KvStore + Sync,
        F: Fn(TxnIndex, &mut dyn KvStore) -> std::result::Result<R, E> + Sync,
        R: Send,
        E: Into<BoxError>;

    /// Executes the block, then runs `patch` over the full result list.
    /// The patch sees results only; the store is already committed.
    fn execute_block_patched<S, F, R, E, P>(
        &self,
        store: &mut S,
        block_size: usize,
        apply: F,
        patch: P,
    ) -> Result<Vec<R>>
    where
        S: KvStore + Sync,
        F: Fn(TxnIndex, &mut dyn KvStore) -> std::result::Result<R, E> + Sync,
        R: Send,
        E: Into<BoxError>,
        P: FnOnce(&mut [R]),
    {
        let mut results = self.execute_block(store, block_size, apply)?;
        patch(&mut results);
        Ok(results)
    }

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}

fn apply_failure<E: Into<BoxError>>(txn_idx: TxnIndex, err: E) -> StmError {
    StmError::ApplyFailure {
        txn_idx,
        source: err.into(),
    }
}

// ============================================================================
// Sequential Executor
// ============================================================================

/// Sequential executor that runs transactions one at a time, in index order.
///
/// Every transaction sees the cumulative writes of all earlier ones through a
/// single shared view. That view is a branch of the caller's store, merged
/// only once the whole block succeeded.
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor {
    cancellation: Cancellation,
}

impl SequentialExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }
}

impl BlockExecutor for SequentialExecutor {
    fn execute_block<S, F, R, E>(&self, store: &mut S, block_size: usize, apply: F) -> Result<Vec<R>>
    where
        S: KvStore + Sync,
        F: Fn(TxnIndex, &mut dyn KvStore) -> std::result::Result<R, E> + Sync,
        R: Send,
        E: Into<BoxError>,
    {
        if block_size == 0 {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let mut results = Vec::with_capacity(block_size);
        let changes = {
            let mut view = BranchStore::new(&*store);
            for txn_idx in 0..block_size {
                if self.cancellation.is_cancelled() {
                    return Err(StmError::Cancelled);
                }
                let result = apply(txn_idx, &mut view).map_err(|e| apply_failure(txn_idx, e))?;
                results.push(result);
            }
            view.into_changeset()
        };
        let writes = changes.len();
        store.merge(changes)?;

        tracing::debug!(
            block_size,
            writes,
            elapsed_us = start.elapsed().as_micros() as u64,
            "sequential block executed"
        );
        Ok(results)
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

// ============================================================================
// Parallel Executor
// ============================================================================

/// Output of the latest finished incarnation of a transaction.
struct TxnOutput<R> {
    incarnation: Incarnation,
    result: R,
    writes: WriteBuffer,
    reads: Arc<ReadSet>,
}

/// State shared by all workers for one block.
struct BlockContext<'a, S: ?Sized, F, R> {
    base: &'a S,
    apply: &'a F,
    mv: MVHashMap,
    scheduler: Scheduler,
    outputs: Vec<Mutex<Option<TxnOutput<R>>>>,
    failure: Mutex<Option<StmError>>,
    cancellation: &'a Cancellation,
}

impl<'a, S, F, R> BlockContext<'a, S, F, R>
where
    S: KvRead + Sync + ?Sized,
    R: Send,
{
    /// Records the first fatal error and halts scheduling.
    fn fail(&self, err: StmError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
        self.scheduler.halt();
    }

    fn worker_loop<E>(&self, worker_id: usize)
    where
        F: Fn(TxnIndex, &mut dyn KvStore) -> std::result::Result<R, E>,
        E: Into<BoxError>,
    {
        let backoff = Backoff::new();
        let mut local_executions = 0usize;

        loop {
            if self.cancellation.is_cancelled() {
                self.fail(StmError::Cancelled);
                break;
            }

            match self.scheduler.next_task() {
                Task::Execute(txn_idx, incarnation) => {
                    backoff.reset();
                    local_executions += 1;
                    match self.execute::<E>(txn_idx, incarnation) {
                        Ok(changed) => {
                            self.scheduler.finish_execution(txn_idx, incarnation, changed)
                        }
                        Err(err) => {
                            tracing::warn!(worker_id, txn_idx, incarnation, %err, "halting block");
                            self.fail(err);
                            break;
                        }
                    }
                }
                Task::Validate(txn_idx, incarnation) => {
                    backoff.reset();
                    let valid = self.validate(txn_idx, incarnation);
                    self.scheduler.finish_validation(txn_idx, incarnation, valid);
                }
                Task::Wait => backoff.snooze(),
                Task::Done => break,
            }
        }

        tracing::trace!(
            worker_id,
            local_executions,
            halted = self.scheduler.is_halted(),
            "worker done"
        );
    }

    /// Runs one incarnation against a fresh branch and installs its writes.
    ///
    /// Returns whether the multi-version map changed.
    fn execute<E>(&self, txn_idx: TxnIndex, incarnation: Incarnation) -> Result<bool>
    where
        F: Fn(TxnIndex, &mut dyn KvStore) -> std::result::Result<R, E>,
        E: Into<BoxError>,
    {
        let view = MvView::new(self.base, &self.mv, txn_idx);
        let (result, writes) = {
            let mut branch = BranchStore::new(&view);
            // A panic must not leave the task active, or the other workers wait forever.
            let result = match panic::catch_unwind(AssertUnwindSafe(|| {
                (self.apply)(txn_idx, &mut branch)
            })) {
                Ok(result) => result.map_err(|e| apply_failure(txn_idx, e))?,
                Err(_) => return Err(StmError::WorkerPanicked),
            };
            (result, branch.into_changeset().into_writes())
        };
        let reads = view.into_read_set();

        let mut slot = self.outputs[txn_idx].lock();
        let changed = match slot.as_ref() {
            Some(prev) => self
                .mv
                .apply_writes(txn_idx, incarnation, &writes, prev.writes.keys()),
            None => self
                .mv
                .apply_writes(txn_idx, incarnation, &writes, std::iter::empty()),
        };
        tracing::trace!(
            txn_idx,
            incarnation,
            reads = reads.len(),
            writes = writes.len(),
            "executed incarnation"
        );
        *slot = Some(TxnOutput {
            incarnation,
            result,
            writes,
            reads: Arc::new(reads),
        });
        Ok(changed)
    }

    fn validate(&self, txn_idx: TxnIndex, incarnation: Incarnation) -> bool {
        let reads = match self.outputs[txn_idx].lock().as_ref() {
            Some(output) if output.incarnation == incarnation => Arc::clone(&output.reads),
            // Superseded; the scheduler ignores outcomes for stale incarnations.
            _ => return true,
        };
        reads.validate(&self.mv, self.base, txn_idx)
    }
}

/// Parallel Block-STM executor.
///
/// Transactions execute speculatively on a worker pool against branches of
/// the base store, reading lower transactions' writes from a multi-version
/// map. Every attempt is validated; conflicts abort and re-execute until the
/// outcome equals sequential execution in index order. The base store is
/// mutated only once, after every transaction has a validated result.
#[derive(Debug, Clone, Default)]
pub struct ParallelExecutor {
    config: ExecutorConfig,
    cancellation: Cancellation,
}

impl ParallelExecutor {
    /// Creates a new parallel executor.
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            cancellation: Cancellation::default(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes a block of transactions in parallel, returning statistics too.
    pub fn execute_block_with_stats<S, F, R, E>(
        &self,
        store: &mut S,
        block_size: usize,
        apply: F,
    ) -> Result<(Vec<R>, ExecutionStats)>
    where
        S: KvStore + Sync,
        F: Fn(TxnIndex, &mut dyn KvStore) -> std::result::Result<R, E> + Sync,
        R: Send,
        E: Into<BoxError>,
    {
        if block_size == 0 {
            return Ok((Vec::new(), ExecutionStats::default()));
        }

        let start = Instant::now();
        let num_workers = self.config.workers_for(block_size);

        let outputs = {
            let ctx = BlockContext {
                base: &*store,
                apply: &apply,
                mv: MVHashMap::new(),
                scheduler: Scheduler::new(block_size),
                outputs: (0..block_size).map(|_| Mutex::new(None)).collect(),
                failure: Mutex::new(None),
                cancellation: &self.cancellation,
            };

            let ctx_ref = &ctx;
            crossbeam::thread::scope(|scope| {
                for worker_id in 0..num_workers {
                    scope.spawn(move |_| ctx_ref.worker_loop::<E>(worker_id));
                }
            })
            .map_err(|_| StmError::WorkerPanicked)?;

            if let Some(err) = ctx.failure.lock().take() {
                return Err(err);
            }

            let sched = ctx.scheduler.stats();
            let stats = ExecutionStats {
                executions: sched.executions,
                validations: sched.validations,
                aborts: sched.aborts,
                workers: num_workers,
                mv_keys: ctx.mv.len(),
                duration: Duration::ZERO,
            };

            // Every slot must hold the output of the last validated incarnation.
            let mut outputs = Vec::with_capacity(block_size);
            for (txn_idx, slot) in ctx.outputs.into_iter().enumerate() {
                let status = ctx.scheduler.get_status(txn_idx);
                let output = slot
                    .into_inner()
                    .filter(|output| status == ExecutionStatus::Executed(output.incarnation))
                    .ok_or_else(|| {
                        StmError::invariant(format!(
                            "transaction {} ended at incarnation {} without a matching output",
                            txn_idx,
                            status.incarnation()
                        ))
                    })?;
                outputs.push(output);
            }
            (outputs, stats)
        };
        let (outputs, mut stats) = outputs;

        // Sole point of mutation of the base store: ascending index order.
        let mut results = Vec::with_capacity(block_size);
        for output in outputs {
            for (key, value) in output.writes {
                match value {
                    Some(value) => store.set(key, value),
                    None => store.delete(&key),
                }
            }
            results.push(output.result);
        }

        stats.duration = start.elapsed();
        tracing::debug!(
            block_size,
            workers = stats.workers,
            executions = stats.executions,
            validations = stats.validations,
            aborts = stats.aborts,
            mv_keys = stats.mv_keys,
            elapsed_us = stats.duration.as_micros() as u64,
            "parallel block executed"
        );
        Ok((results, stats))
    }
}

impl BlockExecutor for ParallelExecutor {
    fn execute_block<S, F, R, E>(&self, store: &mut S, block_size: usize, apply: F) -> Result<Vec<R>>
    where
        S: KvStore + Sync,
        F: Fn(TxnIndex, &mut dyn KvStore) -> std::result::Result<R, E> + Sync,
        R: Send,
        E: Into<BoxError>,
    {
        self.execute_block_with_stats(store, block_size, apply)
            .map(|(results, _)| results)
    }

    fn name(&self) -> &'static str {
        "block_stm_parallel"
    }
}
