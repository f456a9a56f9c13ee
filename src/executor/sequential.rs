//! Sequential transaction executor.
//!
//! This module provides the baseline executor that processes transactions one
//! at a time, in block order, with optional signature verification.

use super::{deliver_block, BlockOutput, Executor};
use crate::Workload;
use ::block_stm::{MemStore, SequentialExecutor as InOrderExecutor};

/// Sequential executor that processes transactions one at a time.
///
/// This is the reference executor: every transaction sees the writes of all
/// earlier ones, and the block is committed in one merge at the end.
///
/// # Example
///
/// ```
/// use txn_exec::{Executor, SequentialExecutor, Workload, WorkloadConfig};
///
/// let workload = Workload::generate(WorkloadConfig::default()).unwrap();
/// let mut store = workload.create_store();
///
/// let executor = SequentialExecutor::new(true); // with signature verification
/// let output = executor.execute(&mut store, &workload).unwrap();
///
/// println!("Successful: {}, Failed: {}", output.result.successful, output.result.failed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor {
    /// Whether to verify signatures during execution.
    pub verify_signatures: bool,
    inner: InOrderExecutor,
}

impl SequentialExecutor {
    /// Creates a new sequential executor.
    ///
    /// # Arguments
    /// * `verify_signatures` - If true, recovers and verifies the signer address
    ///   from each transaction's signature before execution.
    pub fn new(verify_signatures: bool) -> Self {
        Self {
            verify_signatures,
            inner: InOrderExecutor::new(),
        }
    }
}

impl Executor for SequentialExecutor {
    fn execute(&self, store: &mut MemStore, workload: &Workload) -> ::block_stm::Result<BlockOutput> {
        let responses = deliver_block(&self.inner, store, workload, self.verify_signatures)?;
        Ok(BlockOutput::new(responses, None))
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}
