//! Transaction execution strategies.
//!
//! This module provides the [`Executor`] trait, its sequential and Block-STM
//! implementations, and [`build_executor`] to pick one from configuration.

mod block_stm;
mod sequential;

pub use self::block_stm::BlockStmExecutor;
pub use self::sequential::SequentialExecutor;

use crate::patch::patch_tx_responses;
use crate::transfer::{apply_transfer, TxResponse};
use crate::Workload;
use ::block_stm::{BlockExecutor, ExecutionStats, MemStore};

/// Which execution strategy to run a block with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExecutionMode {
    /// One transaction at a time, in block order.
    Sequential,
    /// Optimistic parallel execution with validation and re-execution.
    #[default]
    Parallel,
}

/// Configuration for building an [`Executor`].
#[derive(Debug, Clone)]
pub struct TxExecutorConfig {
    pub mode: ExecutionMode,
    /// Worker threads for parallel mode. `0` uses the available parallelism.
    pub num_threads: usize,
    /// Whether to check each transaction's signature against its sender.
    pub verify_signatures: bool,
}

impl Default for TxExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            num_threads: 0,
            verify_signatures: true,
        }
    }
}

/// Result of executing a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Number of transactions with a successful response.
    pub successful: usize,
    /// Number of failed transactions (bad signature, bad nonce or reverted).
    pub failed: usize,
}

impl ExecutionResult {
    /// Creates a new execution result.
    pub fn new(successful: usize, failed: usize) -> Self {
        Self { successful, failed }
    }

    /// Tallies a block's responses.
    pub fn from_responses(responses: &[TxResponse]) -> Self {
        let successful = responses.iter().filter(|r| r.is_success()).count();
        Self::new(successful, responses.len() - successful)
    }

    /// Total number of transactions processed.
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}

/// Everything a block execution hands back besides the updated store.
#[derive(Debug, Clone, Default)]
pub struct BlockOutput {
    /// Patched responses, one per transaction in block order.
    pub responses: Vec<TxResponse>,
    pub result: ExecutionResult,
    /// Scheduler statistics; only the parallel executor reports them.
    pub stats: Option<ExecutionStats>,
}

impl BlockOutput {
    fn new(responses: Vec<TxResponse>, stats: Option<ExecutionStats>) -> Self {
        Self {
            result: ExecutionResult::from_responses(&responses),
            responses,
            stats,
        }
    }
}

/// Trait for different transaction execution strategies.
///
/// An executor runs every transaction of the workload against `store`,
/// commits the resulting writes and returns the patched responses. Failed
/// transactions are reported in their responses; an `Err` means the block
/// could not be executed at all and `store` was left untouched.
pub trait Executor {
    fn execute(&self, store: &mut MemStore, workload: &Workload) -> ::block_stm::Result<BlockOutput>;

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Runs the workload's transfers through `executor` and patches the responses.
fn deliver_block<B: BlockExecutor>(
    executor: &B,
    store: &mut MemStore,
    workload: &Workload,
    verify_signatures: bool,
) -> ::block_stm::Result<Vec<TxResponse>> {
    let transactions = &workload.transactions;
    executor.execute_block_patched(
        store,
        transactions.len(),
        |txn_idx, view| apply_transfer(&transactions[txn_idx], view, verify_signatures),
        patch_tx_responses,
    )
}

/// An executor chosen at runtime from a [`TxExecutorConfig`].
#[derive(Debug)]
pub enum TxExecutor {
    Sequential(SequentialExecutor),
    Parallel(BlockStmExecutor),
}

impl TxExecutor {
    pub fn from_config(config: &TxExecutorConfig) -> Self {
        match config.mode {
            ExecutionMode::Sequential => {
                TxExecutor::Sequential(SequentialExecutor::new(config.verify_signatures))
            }
            ExecutionMode::Parallel => TxExecutor::Parallel(BlockStmExecutor::new(
                config.num_threads,
                config.verify_signatures,
            )),
        }
    }
}

impl Executor for TxExecutor {
    fn execute(&self, store: &mut MemStore, workload: &Workload) -> ::block_stm::Result<BlockOutput> {
        match self {
            TxExecutor::Sequential(executor) => executor.execute(store, workload),
            TxExecutor::Parallel(executor) => executor.execute(store, workload),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TxExecutor::Sequential(executor) => executor.name(),
            TxExecutor::Parallel(executor) => executor.name(),
        }
    }
}

/// Builds the executor selected by `config`.
pub fn build_executor(config: &TxExecutorConfig) -> Box<dyn Executor + Send + Sync> {
    Box::new(TxExecutor::from_config(config))
}
