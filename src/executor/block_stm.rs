//! Block-STM parallel executor wrapper.
//!
//! This module adapts the `block-stm` crate's [`ParallelExecutor`] to the
//! [`Executor`] trait, reporting its scheduler statistics with the output.

use super::{BlockOutput, Executor};
use crate::patch::patch_tx_responses;
use crate::transfer::apply_transfer;
use crate::Workload;
use ::block_stm::{ExecutorConfig, MemStore, ParallelExecutor};

/// Block-STM parallel executor.
///
/// Transactions run speculatively on a worker pool; conflicting reads are
/// caught by validation and re-executed, so the responses and final store
/// match sequential execution exactly.
#[derive(Debug)]
pub struct BlockStmExecutor {
    pub num_threads: usize,
    pub verify_signatures: bool,
}

impl BlockStmExecutor {
    /// Creates a new Block-STM executor with the specified number of threads.
    pub fn new(num_threads: usize, verify_signatures: bool) -> Self {
        Self {
            num_threads,
            verify_signatures,
        }
    }
}

impl Executor for BlockStmExecutor {
    fn execute(&self, store: &mut MemStore, workload: &Workload) -> ::block_stm::Result<BlockOutput> {
        let transactions = &workload.transactions;
        let executor = ParallelExecutor::new(ExecutorConfig {
            num_threads: self.num_threads,
        });

        let (mut responses, stats) = executor.execute_block_with_stats(
            store,
            transactions.len(),
            |txn_idx, view| apply_transfer(&transactions[txn_idx], view, self.verify_signatures),
        )?;
        patch_tx_responses(&mut responses);

        tracing::info!(
            transactions = transactions.len(),
            workers = stats.workers,
            aborts = stats.aborts,
            elapsed_ms = stats.duration.as_millis() as u64,
            "block-stm block committed"
        );
        Ok(BlockOutput::new(responses, Some(stats)))
    }

    fn name(&self) -> &'static str {
        "block_stm_parallel"
    }
}
